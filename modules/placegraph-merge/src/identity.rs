use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::debug;

use placegraph_common::{normalize_text, EntityKey, FactRecord, PlaceGraphError};

/// Similarity collaborator for near-duplicate entity names. Scores in
/// [0.0, 1.0]; 1.0 means the same name.
#[async_trait]
pub trait NameMatcher: Send + Sync {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64, PlaceGraphError>;
}

/// Character-bigram Dice coefficient over normalized text. Works for CJK
/// names as well as Latin ones, and needs no model service.
pub struct LexicalMatcher;

#[async_trait]
impl NameMatcher for LexicalMatcher {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64, PlaceGraphError> {
        Ok(dice_coefficient(&normalize_text(a), &normalize_text(b)))
    }
}

fn char_bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().filter(|c| !c.is_whitespace()).collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

fn dice_coefficient(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let (ba, bb) = (char_bigrams(a), char_bigrams(b));
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let shared = ba.intersection(&bb).count() as f64;
    2.0 * shared / (ba.len() + bb.len()) as f64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityBinding {
    /// The fact targets an entity the graph already knows.
    Existing(EntityKey),
    /// No sufficiently similar key exists; a new entity will be created.
    New,
}

/// Binds incoming facts to entity keys before any diffing happens.
/// Normalization applies the alias table and the county-to-city map; binding
/// compares the normalized name against known keys through the matcher.
pub struct IdentityResolver {
    matcher: Box<dyn NameMatcher>,
    /// Similarity at or above this binds to the existing key.
    bind_threshold: f64,
    /// Similarity at or above this (but below bind) is ambiguous.
    ambiguity_floor: f64,
    aliases: HashMap<String, String>,
    city_map: HashMap<String, String>,
}

impl IdentityResolver {
    pub fn new(matcher: Box<dyn NameMatcher>) -> Self {
        Self {
            matcher,
            bind_threshold: 0.90,
            ambiguity_floor: 0.75,
            aliases: default_aliases(),
            city_map: default_city_map(),
        }
    }

    pub fn with_thresholds(mut self, bind_threshold: f64, ambiguity_floor: f64) -> Self {
        self.bind_threshold = bind_threshold;
        self.ambiguity_floor = ambiguity_floor;
        self
    }

    /// Canonicalize the fact's key in place: spelling aliases for the name,
    /// county-to-city mapping for the region.
    pub fn normalize(&self, fact: &mut FactRecord) {
        if let Some(canonical) = self.aliases.get(&fact.entity_key.name) {
            debug!(
                from = fact.entity_key.name.as_str(),
                to = canonical.as_str(),
                "applied name alias"
            );
            fact.entity_key.name = canonical.clone();
        }
        if let Some(city) = self.city_map.get(&fact.entity_key.region) {
            fact.entity_key.region = city.clone();
        }
    }

    /// Decide which stored key (if any) this fact refers to. A best match in
    /// the ambiguous band is an error: such a fact must never be silently
    /// merged into the near-miss entity.
    pub async fn bind(
        &self,
        fact: &FactRecord,
        known: &[EntityKey],
    ) -> Result<IdentityBinding, PlaceGraphError> {
        let mut best: Option<(f64, &EntityKey)> = None;

        for candidate in known {
            if candidate.region != fact.entity_key.region {
                continue;
            }
            if candidate == &fact.entity_key {
                return Ok(IdentityBinding::Existing(candidate.clone()));
            }
            let score = self
                .matcher
                .similarity(&fact.entity_key.name, &candidate.name)
                .await?;
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }

        match best {
            Some((score, candidate)) if score >= self.bind_threshold => {
                debug!(
                    name = fact.entity_key.name.as_str(),
                    bound_to = %candidate,
                    score,
                    "bound fact to existing entity"
                );
                Ok(IdentityBinding::Existing(candidate.clone()))
            }
            Some((score, candidate)) if score >= self.ambiguity_floor => {
                Err(PlaceGraphError::IdentityAmbiguous {
                    name: fact.entity_key.name.clone(),
                    candidate: candidate.name.clone(),
                    score,
                })
            }
            _ => Ok(IdentityBinding::New),
        }
    }
}

/// Known alternate spellings (e.g. 纳木错 for 纳木措).
fn default_aliases() -> HashMap<String, String> {
    [("纳木错", "纳木措")]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

/// Counties and loose region names normalize to their administrative city.
fn default_city_map() -> HashMap<String, String> {
    [
        ("西藏拉萨", "拉萨市"),
        ("拉萨", "拉萨市"),
        ("林芝", "林芝市"),
        ("日喀则", "日喀则市"),
        ("昌都", "昌都市"),
        ("那曲", "那曲市"),
        ("阿里", "阿里地区"),
        ("山南", "山南市"),
        ("当雄县", "拉萨市"),
        ("墨竹工卡县", "拉萨市"),
        ("林周县", "拉萨市"),
        ("尼木县", "拉萨市"),
        ("曲水县", "拉萨市"),
    ]
    .into_iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}
