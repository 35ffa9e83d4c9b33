use serde::Deserialize;

use crate::error::PlaceGraphError;
use crate::types::{EntityType, SourceKind};

/// One precedence rule: the named source (an id or a source class) is
/// authoritative for the scoped slot and/or entity type.
#[derive(Debug, Clone, Deserialize)]
pub struct PrecedenceRule {
    /// Source id (e.g. "gov-portal") or source class (e.g. "government").
    pub source: String,
    /// Field name or relation key (e.g. "category", "LOCATED_IN").
    /// Absent means every slot in scope.
    #[serde(default)]
    pub field: Option<String>,
    /// Absent means both entity types.
    #[serde(default)]
    pub entity_type: Option<EntityType>,
}

impl PrecedenceRule {
    fn in_scope(&self, slot: &str, entity_type: EntityType) -> bool {
        if let Some(f) = &self.field {
            if f != slot {
                return false;
            }
        }
        if let Some(t) = self.entity_type {
            if t != entity_type {
                return false;
            }
        }
        true
    }

    fn names(&self, source_id: &str, kind: SourceKind) -> bool {
        self.source == source_id || self.source == kind.to_string()
    }
}

/// Immutable rule snapshot, loaded once and passed explicitly to the
/// resolution policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrecedenceRules {
    #[serde(default, rename = "rule")]
    rules: Vec<PrecedenceRule>,
}

impl PrecedenceRules {
    pub fn from_toml_str(raw: &str) -> Result<Self, PlaceGraphError> {
        toml::from_str(raw)
            .map_err(|e| PlaceGraphError::Config(format!("invalid rules file: {e}")))
    }

    pub fn load(path: &str) -> Result<Self, PlaceGraphError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlaceGraphError::Config(format!("cannot read rules file {path}: {e}")))?;
        Self::from_toml_str(&raw)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether any rule in scope for (slot, entity_type) names this source.
    pub fn is_authoritative(
        &self,
        slot: &str,
        entity_type: EntityType,
        source_id: &str,
        kind: SourceKind,
    ) -> bool {
        self.rules
            .iter()
            .any(|r| r.in_scope(slot, entity_type) && r.names(source_id, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
        [[rule]]
        source = "government"
        field = "category"

        [[rule]]
        source = "lhasa-tourism-bureau"
        entity_type = "attraction"

        [[rule]]
        source = "manual"
        field = "LOCATED_IN"
        entity_type = "attraction"
    "#;

    #[test]
    fn class_rule_matches_source_kind() {
        let rules = PrecedenceRules::from_toml_str(RULES).unwrap();
        assert!(rules.is_authoritative(
            "category",
            EntityType::Attraction,
            "any-crawler",
            SourceKind::Government,
        ));
        assert!(!rules.is_authoritative(
            "category",
            EntityType::Attraction,
            "any-crawler",
            SourceKind::Crawler,
        ));
    }

    #[test]
    fn id_rule_matches_exact_source_and_scoped_entity_type() {
        let rules = PrecedenceRules::from_toml_str(RULES).unwrap();
        assert!(rules.is_authoritative(
            "description",
            EntityType::Attraction,
            "lhasa-tourism-bureau",
            SourceKind::Crawler,
        ));
        assert!(!rules.is_authoritative(
            "description",
            EntityType::City,
            "lhasa-tourism-bureau",
            SourceKind::Crawler,
        ));
    }

    #[test]
    fn relation_slots_use_the_same_rules() {
        let rules = PrecedenceRules::from_toml_str(RULES).unwrap();
        assert!(rules.is_authoritative(
            "LOCATED_IN",
            EntityType::Attraction,
            "reviewer-7",
            SourceKind::Manual,
        ));
        assert!(!rules.is_authoritative(
            "NEARBY",
            EntityType::Attraction,
            "reviewer-7",
            SourceKind::Social,
        ));
    }

    #[test]
    fn field_scope_must_match() {
        let rules = PrecedenceRules::from_toml_str(RULES).unwrap();
        assert!(!rules.is_authoritative(
            "description",
            EntityType::Attraction,
            "x",
            SourceKind::Government,
        ));
    }

    #[test]
    fn empty_rules_parse() {
        let rules = PrecedenceRules::from_toml_str("").unwrap();
        assert!(rules.is_empty());
    }
}
