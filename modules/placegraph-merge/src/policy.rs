use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use placegraph_common::{Claim, EntityType, PrecedenceRules};

use crate::diff::{Candidate, CandidateStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Challenger replaces the incumbent.
    Accept,
    /// Incumbent stands; challenger is discarded.
    Reject,
    /// Neither rule nor scoring can order the two; escalate for review.
    Unresolved { reason: String },
}

/// Per-slot arbitration. Deterministic ladder, first matching rule wins:
/// explicit precedence rule, then recency beyond the minimum gap, then
/// source weight, then Unresolved.
pub struct ResolutionPolicy {
    rules: Arc<PrecedenceRules>,
    min_recency_gap: Duration,
    weight_tolerance: f64,
}

impl ResolutionPolicy {
    pub fn new(rules: Arc<PrecedenceRules>, min_recency_gap_secs: i64, weight_tolerance: f64) -> Self {
        Self {
            rules,
            min_recency_gap: Duration::seconds(min_recency_gap_secs),
            weight_tolerance,
        }
    }

    pub fn decide(&self, entity_type: EntityType, candidate: &Candidate) -> Outcome {
        match (candidate.status, &candidate.incumbent) {
            (CandidateStatus::Unchanged, _) => Outcome::Reject,
            (CandidateStatus::New, _) | (CandidateStatus::Differs, None) => Outcome::Accept,
            (CandidateStatus::Differs, Some(incumbent)) => {
                let outcome = self.arbitrate(
                    entity_type,
                    &candidate.slot,
                    incumbent,
                    &candidate.challenger,
                );
                debug!(
                    slot = candidate.slot.as_str(),
                    outcome = ?outcome,
                    "arbitrated candidate"
                );
                outcome
            }
        }
    }

    fn arbitrate(
        &self,
        entity_type: EntityType,
        slot: &str,
        incumbent: &Claim,
        challenger: &Claim,
    ) -> Outcome {
        // (a) Explicit precedence rule: a ruled source beats an unruled one
        // outright, regardless of timestamps or weights.
        let challenger_ruled = self.rules.is_authoritative(
            slot,
            entity_type,
            &challenger.source_id,
            challenger.source_kind,
        );
        let incumbent_ruled = self.rules.is_authoritative(
            slot,
            entity_type,
            &incumbent.source_id,
            incumbent.source_kind,
        );
        match (challenger_ruled, incumbent_ruled) {
            (true, false) => return Outcome::Accept,
            (false, true) => return Outcome::Reject,
            _ => {}
        }

        // (b) Recency: beyond the minimum gap, newer data wins.
        let gap = challenger.published_at - incumbent.published_at;
        if gap > self.min_recency_gap {
            return Outcome::Accept;
        }
        if gap < -self.min_recency_gap {
            return Outcome::Reject;
        }

        // (c) Effectively simultaneous: fall back to source weight.
        let weight_delta = challenger.source_weight - incumbent.source_weight;
        if weight_delta > self.weight_tolerance {
            return Outcome::Accept;
        }
        if weight_delta < -self.weight_tolerance {
            return Outcome::Reject;
        }

        // (d) Nothing orders them.
        Outcome::Unresolved {
            reason: format!(
                "timestamps within {}s and weights within {} for '{slot}'",
                self.min_recency_gap.num_seconds(),
                self.weight_tolerance
            ),
        }
    }
}
