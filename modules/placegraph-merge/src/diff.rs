use placegraph_common::{Claim, ClaimValue, EntitySnapshot, FactRecord, RelAssertion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    /// Slot absent from the snapshot: an unconditional addition.
    New,
    /// Stored and incoming values disagree; the policy must arbitrate.
    Differs,
    /// Semantically equal to the stored value; nothing to do.
    Unchanged,
}

/// One per-slot change candidate produced by the diff engine.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Field name, or relation key ("LOCATED_IN", "NEARBY:大昭寺@拉萨市").
    pub slot: String,
    pub challenger: Claim,
    pub incumbent: Option<Claim>,
    pub status: CandidateStatus,
}

/// Conflict-queue slot for a relationship assertion. Exclusive relations get
/// one slot per type (their targets compete); additive relations get one per
/// target.
pub fn relation_slot(assertion: &RelAssertion) -> String {
    if assertion.rel_type.is_exclusive() {
        assertion.rel_type.to_string()
    } else {
        format!("{}:{}", assertion.rel_type, assertion.target)
    }
}

/// Compare a fact record against the current snapshot of its target entity.
/// Pure function of its two inputs; produces one candidate per field and
/// relationship present in the fact. Fields the fact does not mention are
/// never touched, and a relationship missing from the fact is not a
/// retraction.
pub fn diff(fact: &FactRecord, snapshot: Option<&EntitySnapshot>) -> Vec<Candidate> {
    let mut candidates = Vec::with_capacity(fact.fields.len() + fact.relationships.len());
    let empty = EntitySnapshot::default();
    let current = snapshot.unwrap_or(&empty);

    for (name, value) in &fact.fields {
        let challenger = fact.claim(ClaimValue::Field { value: value.clone() });
        let candidate = match current.fields.get(name) {
            None => Candidate {
                slot: name.clone(),
                challenger,
                incumbent: None,
                status: CandidateStatus::New,
            },
            Some(stored) => Candidate {
                slot: name.clone(),
                challenger,
                incumbent: Some(stored.to_claim()),
                status: if stored.value.semantically_eq(value) {
                    CandidateStatus::Unchanged
                } else {
                    CandidateStatus::Differs
                },
            },
        };
        candidates.push(candidate);
    }

    for assertion in &fact.relationships {
        candidates.push(diff_relationship(fact, current, assertion));
    }

    candidates
}

fn diff_relationship(
    fact: &FactRecord,
    current: &EntitySnapshot,
    assertion: &RelAssertion,
) -> Candidate {
    let slot = relation_slot(assertion);
    let challenger = fact.claim(ClaimValue::Edge {
        target: assertion.target.clone(),
        target_type: assertion.target_type,
        asserted: assertion.asserted,
    });

    let same_edge = current
        .relationships
        .iter()
        .find(|r| r.rel_type == assertion.rel_type && r.target == assertion.target);

    if let Some(stored) = same_edge {
        // Edge already present: asserting it again is a no-op, explicitly
        // retracting it is a disagreement for the policy.
        return Candidate {
            slot,
            challenger,
            incumbent: Some(stored.to_claim()),
            status: if assertion.asserted {
                CandidateStatus::Unchanged
            } else {
                CandidateStatus::Differs
            },
        };
    }

    if !assertion.asserted {
        // Retracting an edge that is not stored: nothing to remove.
        return Candidate {
            slot,
            challenger,
            incumbent: None,
            status: CandidateStatus::Unchanged,
        };
    }

    if assertion.rel_type.is_exclusive() {
        if let Some(stored) = current
            .relationships
            .iter()
            .find(|r| r.rel_type == assertion.rel_type)
        {
            // Same exclusive relation, different target: the edges compete.
            return Candidate {
                slot,
                challenger,
                incumbent: Some(stored.to_claim()),
                status: CandidateStatus::Differs,
            };
        }
    }

    Candidate {
        slot,
        challenger,
        incumbent: None,
        status: CandidateStatus::New,
    }
}
