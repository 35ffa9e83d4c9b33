//! In-memory store and fact fixtures for exercising the merge pipeline
//! without a running Neo4j.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

use placegraph_common::{
    EntityKey, EntitySnapshot, EntityType, EntityUpdate, FactRecord, FieldValue, GraphStore,
    RelChange, StoreError, UpdateLogEntry,
};

/// HashMap-backed [`GraphStore`] with transient-failure injection.
#[derive(Default)]
pub struct MemoryGraphStore {
    entities: Mutex<HashMap<(EntityType, EntityKey), EntitySnapshot>>,
    logs: Mutex<Vec<UpdateLogEntry>>,
    fail_next_applies: AtomicU32,
    apply_calls: AtomicU32,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` apply calls fail with a retryable connection error.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_next_applies.store(n, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub async fn snapshot(
        &self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> Option<EntitySnapshot> {
        self.entities
            .lock()
            .await
            .get(&(entity_type, key.clone()))
            .cloned()
    }

    pub async fn update_logs(&self) -> Vec<UpdateLogEntry> {
        self.logs.lock().await.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get_entity(
        &self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> Result<Option<EntitySnapshot>, StoreError> {
        Ok(self
            .entities
            .lock()
            .await
            .get(&(entity_type, key.clone()))
            .cloned())
    }

    async fn apply(&self, update: &EntityUpdate) -> Result<(), StoreError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::connection("injected failure"));
        }

        let mut entities = self.entities.lock().await;
        let snapshot = entities
            .entry((update.entity_type, update.key.clone()))
            .or_default();

        for (name, field) in &update.fields {
            snapshot.fields.insert(name.clone(), field.clone());
        }
        for change in &update.relationships {
            match change {
                RelChange::Upsert(rel) => {
                    snapshot
                        .relationships
                        .retain(|r| !(r.rel_type == rel.rel_type && r.target == rel.target));
                    snapshot.relationships.push(rel.clone());
                }
                RelChange::Delete { rel_type, target } => {
                    snapshot
                        .relationships
                        .retain(|r| !(r.rel_type == *rel_type && r.target == *target));
                }
            }
        }

        self.logs.lock().await.push(update.log.clone());
        Ok(())
    }

    async fn known_keys(&self, entity_type: EntityType) -> Result<Vec<EntityKey>, StoreError> {
        let mut keys: Vec<EntityKey> = self
            .entities
            .lock()
            .await
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Default timestamp for fixtures: 2023-05-20 09:15 Beijing time.
pub fn fixture_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 20, 1, 15, 0).unwrap()
}

/// A crawler fact about one attraction with a single text field.
pub fn attraction_fact(name: &str, field: &str, value: &str) -> FactRecord {
    let mut fields = BTreeMap::new();
    fields.insert(field.to_string(), FieldValue::Text(value.into()));
    FactRecord {
        entity_type: EntityType::Attraction,
        entity_key: EntityKey::new(name, "拉萨市"),
        fields,
        relationships: vec![],
        source_id: "crawler-a".into(),
        source_kind: placegraph_common::SourceKind::Crawler,
        source_weight: 0.6,
        pub_timestamp: fixture_time(),
    }
}
