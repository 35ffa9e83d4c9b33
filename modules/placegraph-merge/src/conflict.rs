use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use placegraph_common::{Claim, ClaimValue, EntityKey, EntityType, PlaceGraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Dismissed,
}

/// One unresolved per-slot disagreement, retained for audit after disposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_key: EntityKey,
    /// Field name or relation key.
    pub slot: String,
    /// Stored state at first detection. Kept across amendments.
    pub incumbent: Option<Claim>,
    /// Most recent challenger.
    pub challenger: Claim,
    pub reason: String,
    pub status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The value chosen at disposal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposed_value: Option<ClaimValue>,
}

/// What the diff/policy pipeline hands the queue.
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub entity_type: EntityType,
    pub entity_key: EntityKey,
    pub slot: String,
    pub incumbent: Option<Claim>,
    pub challenger: Claim,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum Disposition {
    /// Commit the challenger.
    AcceptChallenger,
    /// Keep the stored state; nothing to commit.
    KeepIncumbent,
    /// Commit a reviewer-supplied claim.
    Custom(Claim),
    /// Close without choosing either side.
    Dismiss,
}

/// Keyed, transactionally-updated queue abstraction so the backing
/// technology is swappable without touching policy logic.
#[async_trait]
pub trait ConflictQueue: Send + Sync {
    /// Idempotent by (entity_key, slot): an open record is amended with the
    /// new challenger instead of duplicated.
    async fn enqueue(&self, conflict: NewConflict) -> Result<ConflictRecord, PlaceGraphError>;

    /// All open records in a stable order for review.
    async fn list_open(&self) -> Result<Vec<ConflictRecord>, PlaceGraphError>;

    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>, PlaceGraphError>;

    /// Close an open record. Fails with `ConflictNotFound` for unknown ids
    /// and `ConflictAlreadyDisposed` when the record is no longer open.
    async fn dispose(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<ConflictRecord, PlaceGraphError>;
}

#[derive(Default)]
struct QueueState {
    records: HashMap<Uuid, ConflictRecord>,
    /// (entity_key, slot) -> open record id. At most one entry per pair.
    open_index: HashMap<(EntityKey, String), Uuid>,
}

/// Durable queue backed by an append-only line-delimited JSON journal. Each
/// mutation appends the record's full new state; loading replays the journal
/// keeping the latest state per id. The file is plain JSONL so the review
/// front-end can read it without this crate.
pub struct JsonlConflictQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl JsonlConflictQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PlaceGraphError> {
        let path = path.as_ref().to_path_buf();
        let mut state = QueueState::default();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| PlaceGraphError::Queue(format!("cannot read {}: {e}", path.display())))?;
            for (lineno, line) in raw.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<ConflictRecord>(line) {
                    Ok(record) => {
                        state.records.insert(record.id, record);
                    }
                    Err(e) => {
                        warn!(
                            line = lineno + 1,
                            error = %e,
                            "skipping unparseable conflict journal line"
                        );
                    }
                }
            }
            for record in state.records.values() {
                if record.status == ConflictStatus::Open {
                    state
                        .open_index
                        .insert((record.entity_key.clone(), record.slot.clone()), record.id);
                }
            }
            info!(
                path = %path.display(),
                records = state.records.len(),
                open = state.open_index.len(),
                "conflict journal loaded"
            );
        }

        Ok(Self { path, state: Mutex::new(state) })
    }

    fn append(&self, record: &ConflictRecord) -> Result<(), PlaceGraphError> {
        let line = serde_json::to_string(record)
            .map_err(|e| PlaceGraphError::Queue(format!("serialize conflict: {e}")))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PlaceGraphError::Queue(format!("cannot open {}: {e}", self.path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| PlaceGraphError::Queue(format!("cannot append to {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl ConflictQueue for JsonlConflictQueue {
    async fn enqueue(&self, conflict: NewConflict) -> Result<ConflictRecord, PlaceGraphError> {
        let mut state = self.state.lock().await;
        let index_key = (conflict.entity_key.clone(), conflict.slot.clone());
        let now = Utc::now();

        let open_id = state.open_index.get(&index_key).copied();
        let record = match open_id {
            Some(id) => {
                // Amend: latest challenger, original incumbent snapshot and
                // created_at preserved.
                let existing = state
                    .records
                    .get_mut(&id)
                    .unwrap_or_else(|| unreachable!("open index points at a loaded record"));
                existing.challenger = conflict.challenger;
                existing.reason = conflict.reason;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = ConflictRecord {
                    id: Uuid::new_v4(),
                    entity_type: conflict.entity_type,
                    entity_key: conflict.entity_key,
                    slot: conflict.slot,
                    incumbent: conflict.incumbent,
                    challenger: conflict.challenger,
                    reason: conflict.reason,
                    status: ConflictStatus::Open,
                    created_at: now,
                    updated_at: now,
                    disposed_value: None,
                };
                state.open_index.insert(index_key, record.id);
                state.records.insert(record.id, record.clone());
                record
            }
        };

        self.append(&record)?;
        Ok(record)
    }

    async fn list_open(&self) -> Result<Vec<ConflictRecord>, PlaceGraphError> {
        let state = self.state.lock().await;
        let mut open: Vec<ConflictRecord> = state
            .records
            .values()
            .filter(|r| r.status == ConflictStatus::Open)
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
                .then_with(|| a.slot.cmp(&b.slot))
        });
        Ok(open)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>, PlaceGraphError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn dispose(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<ConflictRecord, PlaceGraphError> {
        let mut state = self.state.lock().await;

        let record = state
            .records
            .get_mut(&id)
            .ok_or(PlaceGraphError::ConflictNotFound(id))?;
        if record.status != ConflictStatus::Open {
            return Err(PlaceGraphError::ConflictAlreadyDisposed(id));
        }

        match disposition {
            Disposition::AcceptChallenger => {
                record.status = ConflictStatus::Resolved;
                record.disposed_value = Some(record.challenger.value.clone());
            }
            Disposition::KeepIncumbent => {
                record.status = ConflictStatus::Resolved;
                record.disposed_value = record.incumbent.as_ref().map(|c| c.value.clone());
            }
            Disposition::Custom(claim) => {
                record.status = ConflictStatus::Resolved;
                record.disposed_value = Some(claim.value.clone());
                record.challenger = claim;
            }
            Disposition::Dismiss => {
                record.status = ConflictStatus::Dismissed;
            }
        }
        record.updated_at = Utc::now();

        let updated = record.clone();
        state
            .open_index
            .remove(&(updated.entity_key.clone(), updated.slot.clone()));
        self.append(&updated)?;
        Ok(updated)
    }
}
