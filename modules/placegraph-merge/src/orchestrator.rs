use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use placegraph_common::time::to_reference_string;
use placegraph_common::{
    Claim, ClaimValue, EntityKey, EntityType, EntityUpdate, FactRecord, GraphStore,
    PlaceGraphError, RelChange, RelType, RetryPolicy, StoreError, StoredField,
    StoredRelationship, UpdateLogEntry,
};

use crate::conflict::{ConflictQueue, ConflictRecord, Disposition, NewConflict};
use crate::diff::{diff, relation_slot, Candidate, CandidateStatus};
use crate::identity::{IdentityBinding, IdentityResolver};
use crate::policy::{Outcome, ResolutionPolicy};

/// Stats from one merge run.
#[derive(Debug, Default)]
pub struct MergeStats {
    pub facts_processed: u32,
    pub facts_merged: u32,
    pub facts_unchanged: u32,
    pub facts_invalid: u32,
    pub facts_skipped: u32,
    pub facts_failed: u32,
    pub entities_created: u32,
    pub fields_applied: u32,
    pub relationships_applied: u32,
    pub changes_rejected: u32,
    pub conflicts_enqueued: u32,
}

impl std::fmt::Display for MergeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Merge Run Complete ===")?;
        writeln!(f, "Facts processed:     {}", self.facts_processed)?;
        writeln!(f, "Facts merged:        {}", self.facts_merged)?;
        writeln!(f, "Facts unchanged:     {}", self.facts_unchanged)?;
        writeln!(f, "Facts invalid:       {}", self.facts_invalid)?;
        writeln!(f, "Facts skipped:       {}", self.facts_skipped)?;
        writeln!(f, "Facts failed:        {}", self.facts_failed)?;
        writeln!(f, "Entities created:    {}", self.entities_created)?;
        writeln!(f, "Fields applied:      {}", self.fields_applied)?;
        writeln!(f, "Relationships:       {}", self.relationships_applied)?;
        writeln!(f, "Changes rejected:    {}", self.changes_rejected)?;
        writeln!(f, "Conflicts enqueued:  {}", self.conflicts_enqueued)?;
        Ok(())
    }
}

enum FactReport {
    Invalid,
    Skipped,
    Failed { conflicts: u32 },
    Merged {
        created: bool,
        fields: u32,
        relationships: u32,
        rejected: u32,
        conflicts: u32,
    },
}

/// Cooperative stop: queued-but-unstarted facts are skipped, in-flight
/// per-entity merges run to completion.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Drives fact records through identity resolution, diff, policy, and
/// apply/enqueue. Facts for different entities merge in parallel; facts for
/// the same entity serialize on a per-key lock.
pub struct Orchestrator {
    store: Arc<dyn GraphStore>,
    queue: Arc<dyn ConflictQueue>,
    policy: ResolutionPolicy,
    identity: IdentityResolver,
    retry: RetryPolicy,
    max_concurrent: usize,
    locks: StdMutex<HashMap<(EntityType, EntityKey), Arc<AsyncMutex<()>>>>,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        queue: Arc<dyn ConflictQueue>,
        policy: ResolutionPolicy,
        identity: IdentityResolver,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
            identity,
            retry,
            max_concurrent: max_concurrent.max(1),
            locks: StdMutex::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { flag: Arc::clone(&self.stop) }
    }

    /// Merge a batch of facts. Bounded fan-out; per-entity serialization.
    pub async fn run(&self, facts: Vec<FactRecord>) -> MergeStats {
        let total = facts.len();
        info!(facts = total, "merge run starting");

        let reports: Vec<FactReport> = stream::iter(facts)
            .map(|fact| self.process_fact(fact))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut stats = MergeStats { facts_processed: total as u32, ..Default::default() };
        for report in reports {
            match report {
                FactReport::Invalid => stats.facts_invalid += 1,
                FactReport::Skipped => stats.facts_skipped += 1,
                FactReport::Failed { conflicts } => {
                    stats.facts_failed += 1;
                    stats.conflicts_enqueued += conflicts;
                }
                FactReport::Merged { created, fields, relationships, rejected, conflicts } => {
                    if fields + relationships > 0 {
                        stats.facts_merged += 1;
                    } else {
                        stats.facts_unchanged += 1;
                    }
                    if created {
                        stats.entities_created += 1;
                    }
                    stats.fields_applied += fields;
                    stats.relationships_applied += relationships;
                    stats.changes_rejected += rejected;
                    stats.conflicts_enqueued += conflicts;
                }
            }
        }

        info!(
            merged = stats.facts_merged,
            conflicts = stats.conflicts_enqueued,
            failed = stats.facts_failed,
            "merge run finished"
        );
        stats
    }

    async fn process_fact(&self, mut fact: FactRecord) -> FactReport {
        if self.stop.load(Ordering::SeqCst) {
            return FactReport::Skipped;
        }

        if let Err(e) = fact.validate() {
            warn!(entity = %fact.entity_key, error = %e, "dropping invalid fact record");
            return FactReport::Invalid;
        }

        self.identity.normalize(&mut fact);

        let known = match self
            .with_retry("known_keys", || self.store.known_keys(fact.entity_type))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(entity = %fact.entity_key, error = %e, "store unavailable for identity resolution");
                return FactReport::Failed { conflicts: 0 };
            }
        };

        match self.identity.bind(&fact, &known).await {
            Ok(IdentityBinding::Existing(key)) => fact.entity_key = key,
            Ok(IdentityBinding::New) => {}
            Err(PlaceGraphError::IdentityAmbiguous { name, candidate, score }) => {
                // Never silently merged: the fact proceeds as a new entity
                // candidate under its own key.
                warn!(name, candidate, score, "identity ambiguous, treating as new entity");
            }
            Err(e) => {
                warn!(entity = %fact.entity_key, error = %e, "identity resolution failed");
                return FactReport::Failed { conflicts: 0 };
            }
        }

        // Per-entity mutual exclusion from here: one worker may mutate a
        // given entity's state at a time.
        let lock = self.lock_for(fact.entity_type, &fact.entity_key);
        let _guard = lock.lock().await;

        let snapshot = match self
            .with_retry("get_entity", || {
                self.store.get_entity(fact.entity_type, &fact.entity_key)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(entity = %fact.entity_key, error = %e, "snapshot read failed");
                return FactReport::Failed { conflicts: 0 };
            }
        };
        let created = snapshot.is_none();

        let candidates = diff(&fact, snapshot.as_ref());
        let mut accepted: Vec<Candidate> = Vec::new();
        let mut unresolved: Vec<NewConflict> = Vec::new();
        let mut rejected = 0u32;

        for candidate in candidates {
            if candidate.status == CandidateStatus::Unchanged {
                continue;
            }
            match self.policy.decide(fact.entity_type, &candidate) {
                Outcome::Accept => accepted.push(candidate),
                Outcome::Reject => rejected += 1,
                Outcome::Unresolved { reason } => unresolved.push(NewConflict {
                    entity_type: fact.entity_type,
                    entity_key: fact.entity_key.clone(),
                    slot: candidate.slot,
                    incumbent: candidate.incumbent,
                    challenger: candidate.challenger,
                    reason,
                }),
            }
        }

        let conflicts = self.enqueue_all(unresolved).await;

        if accepted.is_empty() {
            return FactReport::Merged {
                created: false,
                fields: 0,
                relationships: 0,
                rejected,
                conflicts,
            };
        }

        let update = self.build_update(&fact, &accepted);
        let fields = update.fields.len() as u32;
        let relationships = update.relationships.len() as u32;

        match self.with_retry("apply", || self.store.apply(&update)).await {
            Ok(()) => FactReport::Merged { created, fields, relationships, rejected, conflicts },
            Err(e) => {
                // Nothing was committed. Preserve the accepted decisions as
                // unresolved conflicts so the batch surfaces for review
                // instead of silently vanishing.
                warn!(entity = %fact.entity_key, error = %e, "apply failed after retries, enqueueing batch for review");
                let fallback: Vec<NewConflict> = accepted
                    .into_iter()
                    .map(|candidate| NewConflict {
                        entity_type: fact.entity_type,
                        entity_key: fact.entity_key.clone(),
                        slot: candidate.slot,
                        incumbent: candidate.incumbent,
                        challenger: candidate.challenger,
                        reason: format!("apply failed after retries: {e}"),
                    })
                    .collect();
                let enqueued = self.enqueue_all(fallback).await;
                FactReport::Failed { conflicts: conflicts + enqueued }
            }
        }
    }

    /// Turn accepted candidates into one atomic update batch.
    fn build_update(&self, fact: &FactRecord, accepted: &[Candidate]) -> EntityUpdate {
        let mut fields: BTreeMap<String, StoredField> = BTreeMap::new();
        let mut relationships: Vec<RelChange> = Vec::new();

        for candidate in accepted {
            match &candidate.challenger.value {
                ClaimValue::Field { value } => {
                    fields.insert(
                        candidate.slot.clone(),
                        StoredField::from_claim(value.clone(), &candidate.challenger),
                    );
                }
                ClaimValue::Edge { target, target_type, asserted } => {
                    let assertion = fact
                        .relationships
                        .iter()
                        .find(|a| relation_slot(a) == candidate.slot && a.target == *target);
                    let Some(assertion) = assertion else { continue };

                    if *asserted {
                        // An accepted exclusive edge displaces the stored one.
                        if let Some(Claim {
                            value: ClaimValue::Edge { target: old_target, .. },
                            ..
                        }) = &candidate.incumbent
                        {
                            if old_target != target {
                                relationships.push(RelChange::Delete {
                                    rel_type: assertion.rel_type,
                                    target: old_target.clone(),
                                });
                            }
                        }
                        relationships.push(RelChange::Upsert(StoredRelationship {
                            rel_type: assertion.rel_type,
                            target: target.clone(),
                            target_type: *target_type,
                            source_id: candidate.challenger.source_id.clone(),
                            source_kind: candidate.challenger.source_kind,
                            source_weight: candidate.challenger.source_weight,
                            published_at: candidate.challenger.published_at,
                            confidence: assertion.confidence,
                            reason: assertion.reason.clone(),
                        }));
                    } else {
                        relationships.push(RelChange::Delete {
                            rel_type: assertion.rel_type,
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        EntityUpdate {
            key: fact.entity_key.clone(),
            entity_type: fact.entity_type,
            fields,
            relationships,
            log: UpdateLogEntry {
                log_id: format!(
                    "{}_{}",
                    fact.entity_key,
                    to_reference_string(&fact.pub_timestamp)
                ),
                reason: format!("merge from {} ({})", fact.source_id, fact.source_kind),
                applied_at: chrono::Utc::now(),
            },
        }
    }

    async fn enqueue_all(&self, conflicts: Vec<NewConflict>) -> u32 {
        let mut enqueued = 0;
        for conflict in conflicts {
            match self.queue.enqueue(conflict).await {
                Ok(_) => enqueued += 1,
                Err(e) => warn!(error = %e, "failed to enqueue conflict"),
            }
        }
        enqueued
    }

    /// Commit a review decision: close the queue record, then apply the
    /// chosen value through the store under the entity's lock.
    pub async fn apply_disposition(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<ConflictRecord, PlaceGraphError> {
        let record = self.queue.dispose(id, disposition).await?;
        let Some(value) = record.disposed_value.clone() else {
            return Ok(record);
        };

        if record.challenger.value != value
            && record.incumbent.as_ref().is_some_and(|c| c.value == value)
        {
            // Keeping the incumbent needs no write; the stored state already
            // holds it.
            return Ok(record);
        }
        let claim = record.challenger.clone();

        let mut fields: BTreeMap<String, StoredField> = BTreeMap::new();
        let mut relationships: Vec<RelChange> = Vec::new();

        match &value {
            ClaimValue::Field { value: field_value } => {
                fields.insert(
                    record.slot.clone(),
                    StoredField::from_claim(field_value.clone(), &claim),
                );
            }
            ClaimValue::Edge { target, target_type, asserted } => {
                let rel_type = record
                    .slot
                    .split(':')
                    .next()
                    .and_then(RelType::from_str_loose)
                    .ok_or_else(|| {
                        PlaceGraphError::Queue(format!(
                            "conflict {} has unparseable relation slot '{}'",
                            record.id, record.slot
                        ))
                    })?;

                if *asserted {
                    if let Some(Claim {
                        value: ClaimValue::Edge { target: old_target, .. },
                        ..
                    }) = &record.incumbent
                    {
                        if old_target != target {
                            relationships.push(RelChange::Delete {
                                rel_type,
                                target: old_target.clone(),
                            });
                        }
                    }
                    relationships.push(RelChange::Upsert(StoredRelationship {
                        rel_type,
                        target: target.clone(),
                        target_type: *target_type,
                        source_id: claim.source_id.clone(),
                        source_kind: claim.source_kind,
                        source_weight: claim.source_weight,
                        published_at: claim.published_at,
                        confidence: None,
                        reason: None,
                    }));
                } else {
                    relationships.push(RelChange::Delete { rel_type, target: target.clone() });
                }
            }
        }

        let update = EntityUpdate {
            key: record.entity_key.clone(),
            entity_type: record.entity_type,
            fields,
            relationships,
            log: UpdateLogEntry {
                log_id: format!("disposition_{}", record.id),
                reason: format!("conflict disposition for '{}'", record.slot),
                applied_at: chrono::Utc::now(),
            },
        };

        let lock = self.lock_for(record.entity_type, &record.entity_key);
        let _guard = lock.lock().await;
        self.with_retry("apply", || self.store.apply(&update))
            .await?;
        Ok(record)
    }

    fn lock_for(&self, entity_type: EntityType, key: &EntityKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry((entity_type, key.clone()))
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retryable store error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use placegraph_common::{FieldValue, PrecedenceRules, RelAssertion, SourceKind};
    use std::time::Duration as StdDuration;

    use crate::conflict::JsonlConflictQueue;
    use crate::identity::{IdentityResolver, LexicalMatcher};
    use crate::testing::{attraction_fact, fixture_time, MemoryGraphStore};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryGraphStore>,
        queue: Arc<JsonlConflictQueue>,
        orchestrator: Orchestrator,
    }

    fn harness(rules_toml: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryGraphStore::new());
        let queue =
            Arc::new(JsonlConflictQueue::open(dir.path().join("conflicts.jsonl")).unwrap());
        let rules = PrecedenceRules::from_toml_str(rules_toml).unwrap();
        let policy = ResolutionPolicy::new(Arc::new(rules), 3600, 0.01);
        let identity = IdentityResolver::new(Box::new(LexicalMatcher));
        let retry = RetryPolicy {
            max_attempts: 2,
            base: StdDuration::from_millis(1),
            multiplier: 2,
            max_jitter_ms: 0,
        };
        let orchestrator = Orchestrator::new(
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::clone(&queue) as Arc<dyn ConflictQueue>,
            policy,
            identity,
            retry,
            4,
        );
        Harness { _dir: dir, store, queue, orchestrator }
    }

    fn gov_fact(field: &str, value: &str) -> FactRecord {
        let mut fact = attraction_fact("布达拉宫", field, value);
        fact.source_id = "gov-portal".into();
        fact.source_kind = SourceKind::Government;
        fact.source_weight = 0.9;
        fact
    }

    fn ugc_fact_one_day_later(field: &str, value: &str) -> FactRecord {
        let mut fact = attraction_fact("布达拉宫", field, value);
        fact.source_id = "ugc-site".into();
        fact.source_kind = SourceKind::Social;
        fact.source_weight = 0.95;
        fact.pub_timestamp = fixture_time() + Duration::days(1);
        fact
    }

    fn located_in(city: &str, asserted: bool) -> RelAssertion {
        RelAssertion {
            rel_type: RelType::LocatedIn,
            target: EntityKey::new(city, ""),
            target_type: EntityType::City,
            asserted,
            confidence: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn first_fact_creates_the_entity() {
        let h = harness("");
        let stats = h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;

        assert_eq!(stats.facts_merged, 1);
        assert_eq!(stats.entities_created, 1);
        assert_eq!(stats.fields_applied, 1);

        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("风景区".into())
        );
        assert_eq!(snapshot.fields["category"].source_id, "gov-portal");
    }

    #[tokio::test]
    async fn identical_fact_rerun_is_a_no_op() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        let applies_after_first = h.store.apply_calls();

        let stats = h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        assert_eq!(stats.facts_unchanged, 1);
        assert_eq!(stats.facts_merged, 0);
        assert_eq!(h.store.apply_calls(), applies_after_first);
    }

    #[tokio::test]
    async fn newer_challenger_beyond_gap_replaces_incumbent() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        let stats = h
            .orchestrator
            .run(vec![ugc_fact_one_day_later("category", "自然风光")])
            .await;

        assert_eq!(stats.facts_merged, 1);
        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("自然风光".into())
        );
        assert_eq!(snapshot.fields["category"].source_id, "ugc-site");
    }

    #[tokio::test]
    async fn precedence_rule_keeps_ruled_incumbent() {
        let rules = r#"
            [[rule]]
            source = "government"
            field = "category"
        "#;
        let h = harness(rules);
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        let stats = h
            .orchestrator
            .run(vec![ugc_fact_one_day_later("category", "自然风光")])
            .await;

        assert_eq!(stats.changes_rejected, 1);
        assert_eq!(stats.facts_unchanged, 1);
        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("风景区".into())
        );
    }

    #[tokio::test]
    async fn tie_enqueues_exactly_one_open_conflict() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;

        // Same timestamp, same weight, different value: unresolvable.
        let mut rival = gov_fact("category", "自然风光");
        rival.source_id = "gov-mirror".into();
        let stats = h.orchestrator.run(vec![rival.clone()]).await;
        assert_eq!(stats.conflicts_enqueued, 1);

        // A second tied challenger amends rather than duplicates.
        let mut another = gov_fact("category", "历史建筑");
        another.source_id = "gov-archive".into();
        h.orchestrator.run(vec![another]).await;

        let open = h.queue.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(
            open[0].challenger.value,
            ClaimValue::Field { value: FieldValue::Text("历史建筑".into()) }
        );

        // The stored value is untouched while the conflict is open.
        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("风景区".into())
        );
    }

    #[tokio::test]
    async fn conflicting_located_in_edges_stay_untouched_and_enqueue_once() {
        let h = harness("");

        let mut first = gov_fact("category", "风景区");
        first.relationships.push(located_in("拉萨市", true));
        h.orchestrator.run(vec![first]).await;

        let mut rival = gov_fact("category", "风景区");
        rival.source_id = "gov-mirror".into();
        rival.relationships.push(located_in("当雄县", true));
        let stats = h.orchestrator.run(vec![rival]).await;

        assert_eq!(stats.conflicts_enqueued, 1);
        let open = h.queue.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].slot, "LOCATED_IN");

        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(snapshot.relationships.len(), 1);
        assert_eq!(snapshot.relationships[0].target, EntityKey::new("拉萨市", ""));
    }

    #[tokio::test]
    async fn newer_located_in_assertion_moves_the_edge() {
        let h = harness("");

        let mut first = gov_fact("category", "风景区");
        first.relationships.push(located_in("当雄县", true));
        h.orchestrator.run(vec![first]).await;

        let mut correction = ugc_fact_one_day_later("category", "风景区");
        correction.relationships.push(located_in("拉萨市", true));
        h.orchestrator.run(vec![correction]).await;

        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        let located: Vec<_> = snapshot
            .relationships
            .iter()
            .filter(|r| r.rel_type == RelType::LocatedIn)
            .collect();
        assert_eq!(located.len(), 1);
        assert_eq!(located[0].target, EntityKey::new("拉萨市", ""));
    }

    #[tokio::test]
    async fn persistent_store_failure_enqueues_the_batch() {
        let h = harness("");
        h.store.fail_next_applies(10);

        let stats = h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        assert_eq!(stats.facts_failed, 1);
        assert_eq!(stats.facts_merged, 0);
        assert_eq!(stats.conflicts_enqueued, 1);

        // Nothing partially committed.
        assert!(h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .is_none());

        let open = h.queue.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].reason.contains("apply failed"));
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() {
        let h = harness("");
        h.store.fail_next_applies(1);

        let stats = h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        assert_eq!(stats.facts_merged, 1);
        assert_eq!(stats.facts_failed, 0);
        assert_eq!(h.store.apply_calls(), 2);
    }

    #[tokio::test]
    async fn stop_skips_queued_facts() {
        let h = harness("");
        h.orchestrator.stop_handle().stop();

        let stats = h
            .orchestrator
            .run(vec![gov_fact("category", "风景区"), gov_fact("description", "宫殿")])
            .await;
        assert_eq!(stats.facts_skipped, 2);
        assert_eq!(h.store.apply_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_fact_is_dropped_not_enqueued() {
        let h = harness("");
        let mut bad = gov_fact("category", "风景区");
        bad.source_weight = 7.0;

        let stats = h.orchestrator.run(vec![bad]).await;
        assert_eq!(stats.facts_invalid, 1);
        assert!(h.queue.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_facts_for_one_entity_all_land() {
        let h = harness("");
        let facts: Vec<FactRecord> = (0..8)
            .map(|i| gov_fact(&format!("field_{i}"), "值"))
            .collect();

        let stats = h.orchestrator.run(facts).await;
        assert_eq!(stats.facts_merged + stats.facts_unchanged, 8);

        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(snapshot.fields.len(), 8);
    }

    #[tokio::test]
    async fn disposition_accept_challenger_commits_the_value() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;

        let mut rival = gov_fact("category", "自然风光");
        rival.source_id = "gov-mirror".into();
        h.orchestrator.run(vec![rival]).await;

        let open = h.queue.list_open().await.unwrap();
        let disposed = h
            .orchestrator
            .apply_disposition(open[0].id, Disposition::AcceptChallenger)
            .await
            .unwrap();
        assert_eq!(disposed.status, crate::conflict::ConflictStatus::Resolved);

        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("自然风光".into())
        );
        assert!(h.queue.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disposition_keep_incumbent_leaves_store_unchanged() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        let applies_before = h.store.apply_calls();

        let mut rival = gov_fact("category", "自然风光");
        rival.source_id = "gov-mirror".into();
        h.orchestrator.run(vec![rival]).await;

        let open = h.queue.list_open().await.unwrap();
        h.orchestrator
            .apply_disposition(open[0].id, Disposition::KeepIncumbent)
            .await
            .unwrap();

        assert_eq!(h.store.apply_calls(), applies_before);
        let snapshot = h
            .store
            .snapshot(EntityType::Attraction, &EntityKey::new("布达拉宫", "拉萨市"))
            .await
            .unwrap();
        assert_eq!(
            snapshot.fields["category"].value,
            FieldValue::Text("风景区".into())
        );
    }

    #[tokio::test]
    async fn disposing_twice_reports_already_disposed() {
        let h = harness("");
        h.orchestrator.run(vec![gov_fact("category", "风景区")]).await;
        let mut rival = gov_fact("category", "自然风光");
        rival.source_id = "gov-mirror".into();
        h.orchestrator.run(vec![rival]).await;

        let open = h.queue.list_open().await.unwrap();
        h.orchestrator
            .apply_disposition(open[0].id, Disposition::Dismiss)
            .await
            .unwrap();
        let err = h
            .orchestrator
            .apply_disposition(open[0].id, Disposition::AcceptChallenger)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaceGraphError::ConflictAlreadyDisposed(_)));
    }
}
