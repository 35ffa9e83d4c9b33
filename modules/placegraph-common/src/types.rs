use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PlaceGraphError;

/// Absolute tolerance for numeric field comparison.
pub const FLOAT_TOLERANCE: f64 = 1e-6;

// --- Entities ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Attraction,
    City,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Attraction => write!(f, "Attraction"),
            EntityType::City => write!(f, "City"),
        }
    }
}

/// Stable natural key for an entity across sources: normalized name + region.
/// Two facts with the same key and entity type target the same graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    pub region: String,
}

impl EntityKey {
    /// Build a key from raw name/region, trimming and collapsing whitespace.
    /// Identity-level normalization (aliases, county-to-city mapping) happens
    /// in the identity resolver, not here.
    pub fn new(name: &str, region: &str) -> Self {
        Self {
            name: collapse_whitespace(name),
            region: collapse_whitespace(region),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.region.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.region)
        }
    }
}

// --- Sources ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Government,
    News,
    Manual,
    Crawler,
    Social,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Government => write!(f, "government"),
            SourceKind::News => write!(f, "news"),
            SourceKind::Manual => write!(f, "manual"),
            SourceKind::Crawler => write!(f, "crawler"),
            SourceKind::Social => write!(f, "social"),
        }
    }
}

impl SourceKind {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "government" | "gov" | "official" => Self::Government,
            "news" | "media" => Self::News,
            "manual" | "editor" | "human" => Self::Manual,
            "social" | "ugc" | "crowd" => Self::Social,
            _ => Self::Crawler,
        }
    }
}

// --- Field values ---

/// A single extracted field value. Untagged so the conflict journal and
/// extraction payloads read as plain JSON scalars/arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

impl FieldValue {
    /// Semantic equality: collapsed whitespace + Unicode lowercase for text,
    /// absolute tolerance for numbers, element-wise normalized text for lists.
    pub fn semantically_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => {
                normalize_text(a) == normalize_text(b)
            }
            (FieldValue::Number(a), FieldValue::Number(b)) => (a - b).abs() <= FLOAT_TOLERANCE,
            (FieldValue::List(a), FieldValue::List(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| normalize_text(x) == normalize_text(y))
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{s}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::List(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

/// Collapse runs of whitespace to single spaces and trim the ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalization used for semantic text comparison.
pub fn normalize_text(s: &str) -> String {
    collapse_whitespace(s).to_lowercase()
}

// --- Relationships ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelType {
    LocatedIn,
    CulturallyRelated,
    Nearby,
    SimilarType,
    ComplementaryVisit,
    HistoricalLink,
}

impl std::fmt::Display for RelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelType::LocatedIn => write!(f, "LOCATED_IN"),
            RelType::CulturallyRelated => write!(f, "CULTURALLY_RELATED"),
            RelType::Nearby => write!(f, "NEARBY"),
            RelType::SimilarType => write!(f, "SIMILAR_TYPE"),
            RelType::ComplementaryVisit => write!(f, "COMPLEMENTARY_VISIT"),
            RelType::HistoricalLink => write!(f, "HISTORICAL_LINK"),
        }
    }
}

impl RelType {
    /// An exclusive relationship admits one outgoing edge per entity, so a
    /// different target competes with the stored edge. Additive types only
    /// conflict on explicit retraction.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, RelType::LocatedIn)
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "LOCATED_IN" => Some(Self::LocatedIn),
            "CULTURALLY_RELATED" => Some(Self::CulturallyRelated),
            "NEARBY" => Some(Self::Nearby),
            "SIMILAR_TYPE" => Some(Self::SimilarType),
            "COMPLEMENTARY_VISIT" => Some(Self::ComplementaryVisit),
            "HISTORICAL_LINK" => Some(Self::HistoricalLink),
            _ => None,
        }
    }
}

/// One relationship assertion inside a fact record. `asserted: false` is an
/// explicit retraction; a relationship simply missing from a fact says
/// nothing about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelAssertion {
    pub rel_type: RelType,
    pub target: EntityKey,
    pub target_type: EntityType,
    pub asserted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// --- Fact records ---

/// One structured extraction result for one entity from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub entity_type: EntityType,
    pub entity_key: EntityKey,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub relationships: Vec<RelAssertion>,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_weight: f64,
    pub pub_timestamp: DateTime<Utc>,
}

impl FactRecord {
    /// Reject malformed records before they reach the diff engine.
    pub fn validate(&self) -> Result<(), PlaceGraphError> {
        if self.entity_key.name.is_empty() {
            return Err(PlaceGraphError::Validation(
                "fact record has an empty entity name".into(),
            ));
        }
        if self.source_id.is_empty() {
            return Err(PlaceGraphError::Validation(format!(
                "fact record for '{}' has an empty source_id",
                self.entity_key
            )));
        }
        if !self.source_weight.is_finite() || !(0.0..=1.0).contains(&self.source_weight) {
            return Err(PlaceGraphError::Validation(format!(
                "fact record for '{}' has source_weight {} outside [0, 1]",
                self.entity_key, self.source_weight
            )));
        }
        if self.fields.is_empty() && self.relationships.is_empty() {
            return Err(PlaceGraphError::Validation(format!(
                "fact record for '{}' carries no fields or relationships",
                self.entity_key
            )));
        }
        Ok(())
    }

    /// The provenance shared by every claim this record makes.
    pub fn claim(&self, value: ClaimValue) -> Claim {
        Claim {
            value,
            source_id: self.source_id.clone(),
            source_kind: self.source_kind,
            source_weight: self.source_weight,
            published_at: self.pub_timestamp,
        }
    }
}

// --- Claims (the arbitration unit) ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClaimValue {
    Field { value: FieldValue },
    Edge { target: EntityKey, target_type: EntityType, asserted: bool },
}

impl std::fmt::Display for ClaimValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimValue::Field { value } => write!(f, "{value}"),
            ClaimValue::Edge { target, asserted: true, .. } => write!(f, "-> {target}"),
            ClaimValue::Edge { target, asserted: false, .. } => write!(f, "retract -> {target}"),
        }
    }
}

/// One provenanced value competing for a field or relationship slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub value: ClaimValue,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_weight: f64,
    pub published_at: DateTime<Utc>,
}

// --- Stored state (snapshots) ---

/// A field as persisted, carrying the provenance needed for later arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredField {
    pub value: FieldValue,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_weight: f64,
    pub published_at: DateTime<Utc>,
}

impl StoredField {
    pub fn to_claim(&self) -> Claim {
        Claim {
            value: ClaimValue::Field { value: self.value.clone() },
            source_id: self.source_id.clone(),
            source_kind: self.source_kind,
            source_weight: self.source_weight,
            published_at: self.published_at,
        }
    }

    pub fn from_claim(field_value: FieldValue, claim: &Claim) -> Self {
        Self {
            value: field_value,
            source_id: claim.source_id.clone(),
            source_kind: claim.source_kind,
            source_weight: claim.source_weight,
            published_at: claim.published_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRelationship {
    pub rel_type: RelType,
    pub target: EntityKey,
    pub target_type: EntityType,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_weight: f64,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StoredRelationship {
    pub fn to_claim(&self) -> Claim {
        Claim {
            value: ClaimValue::Edge {
                target: self.target.clone(),
                target_type: self.target_type,
                asserted: true,
            },
            source_id: self.source_id.clone(),
            source_kind: self.source_kind,
            source_weight: self.source_weight,
            published_at: self.published_at,
        }
    }
}

/// Current stored state of one entity, as returned by the snapshot reader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub fields: BTreeMap<String, StoredField>,
    pub relationships: Vec<StoredRelationship>,
}

// --- Updates (what the merge applier commits) ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelChange {
    Upsert(StoredRelationship),
    Delete { rel_type: RelType, target: EntityKey },
}

/// Audit record written alongside every committed merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub log_id: String,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

/// The resolved batch for one entity. Applied atomically; safe to re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub key: EntityKey,
    pub entity_type: EntityType,
    pub fields: BTreeMap<String, StoredField>,
    pub relationships: Vec<RelChange>,
    pub log: UpdateLogEntry,
}

impl EntityUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.relationships.is_empty()
    }
}
