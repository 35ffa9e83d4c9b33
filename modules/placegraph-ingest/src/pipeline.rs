use futures::stream::{self, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use placegraph_common::{FactRecord, FieldValue, RelAssertion, RelType};
use placegraph_merge::{MergeStats, Orchestrator};

use crate::extractor::{Extractor, TextChunk};

/// Chunks extracted concurrently per run.
const EXTRACTION_CONCURRENCY: usize = 4;

/// Upper bound on LLM relationship-inference calls per chunk.
const MAX_RELATION_PAIRS_PER_CHUNK: usize = 10;

/// Input file format: a batch of crawled text chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlInput {
    #[serde(default)]
    pub chunks: Vec<TextChunk>,
}

/// Stats from one ingest run.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub chunks_processed: u32,
    pub chunks_failed: u32,
    pub facts_extracted: u32,
    pub facts_deduplicated: u32,
    pub relations_inferred: u32,
    pub merge: MergeStats,
}

impl std::fmt::Display for IngestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Ingest Run Complete ===")?;
        writeln!(f, "Chunks processed:    {}", self.chunks_processed)?;
        writeln!(f, "Chunks failed:       {}", self.chunks_failed)?;
        writeln!(f, "Facts extracted:     {}", self.facts_extracted)?;
        writeln!(f, "Facts deduplicated:  {}", self.facts_deduplicated)?;
        writeln!(f, "Relations inferred:  {}", self.relations_inferred)?;
        write!(f, "{}", self.merge)
    }
}

/// What the LLM returns when asked how two attractions relate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InferredRelation {
    /// One of: NEARBY, SIMILAR_TYPE, COMPLEMENTARY_VISIT, HISTORICAL_LINK,
    /// CULTURALLY_RELATED
    pub rel_type: String,
    pub reason: String,
    /// 0.0 - 1.0
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelationResponse {
    #[serde(default)]
    pub relations: Vec<InferredRelation>,
}

const RELATION_SYSTEM_PROMPT: &str = r#"You are an expert in relationships between tourist attractions.

Given two attractions, infer the relationships between them. Allowed types:

- NEARBY: same location and overlapping visitor share (difference under 20 points)
- SIMILAR_TYPE: the same kind of place (both temples, both lakes, both museums)
- COMPLEMENTARY_VISIT: naturally visited together (a temple and its pilgrim street)
- HISTORICAL_LINK: shared historical or cultural lineage
- CULTURALLY_RELATED: connected through the same cultural tradition

Only report relationships the given facts actually support, with a one-sentence
reason and a confidence between 0 and 1. Report nothing when no relationship
holds."#;

/// End-to-end ingest: extract facts from crawled text, infer in-chunk
/// relationships, dedup, and hand everything to the merge orchestrator.
pub struct Pipeline {
    extractor: Extractor,
    orchestrator: Orchestrator,
}

impl Pipeline {
    pub fn new(extractor: Extractor, orchestrator: Orchestrator) -> Self {
        Self { extractor, orchestrator }
    }

    pub async fn run(&self, chunks: Vec<TextChunk>) -> IngestStats {
        let mut stats = IngestStats::default();

        // Extraction fans out; one failing chunk never blocks the rest.
        let extracted: Vec<(TextChunk, Result<Vec<FactRecord>, _>)> = stream::iter(chunks)
            .map(|chunk| async move {
                let facts = self.extractor.extract(&chunk).await;
                (chunk, facts)
            })
            .buffer_unordered(EXTRACTION_CONCURRENCY)
            .collect()
            .await;

        let mut chunk_groups: Vec<Vec<FactRecord>> = Vec::new();
        for (chunk, result) in extracted {
            stats.chunks_processed += 1;
            match result {
                Ok(facts) => chunk_groups.push(facts),
                Err(e) => {
                    stats.chunks_failed += 1;
                    warn!(
                        source = chunk.source_id.as_str(),
                        error = %e,
                        "chunk extraction failed permanently, dropping"
                    );
                }
            }
        }

        // In-batch dedup by target identity: the first record wins, later
        // duplicates are dropped before they can race each other.
        let mut seen = std::collections::HashSet::new();
        for group in &mut chunk_groups {
            group.retain(|fact| {
                let key = (fact.entity_type, fact.entity_key.clone());
                let fresh = seen.insert(key);
                if !fresh {
                    stats.facts_deduplicated += 1;
                }
                fresh
            });
        }

        // Pairwise relationship inference within each chunk.
        for group in &mut chunk_groups {
            let inferred = self.infer_chunk_relations(group).await;
            stats.relations_inferred += inferred;
        }

        let facts: Vec<FactRecord> = chunk_groups.into_iter().flatten().collect();
        stats.facts_extracted = facts.len() as u32;

        info!(
            facts = facts.len(),
            deduplicated = stats.facts_deduplicated,
            "handing extracted facts to merge orchestrator"
        );
        stats.merge = self.orchestrator.run(facts).await;
        stats
    }

    /// Ask the LLM how attraction pairs in one chunk relate, and attach the
    /// resulting assertions to the pair's first fact. Only attractions with
    /// a reported visitor share qualify.
    async fn infer_chunk_relations(&self, group: &mut [FactRecord]) -> u32 {
        let qualifying: Vec<usize> = group
            .iter()
            .enumerate()
            .filter(|(_, f)| visitor_percentage(f) > 0.0)
            .map(|(i, _)| i)
            .collect();

        let mut pairs = Vec::new();
        for (a_pos, &a) in qualifying.iter().enumerate() {
            for &b in &qualifying[a_pos + 1..] {
                pairs.push((a, b));
            }
        }
        if pairs.len() > MAX_RELATION_PAIRS_PER_CHUNK {
            warn!(
                pairs = pairs.len(),
                cap = MAX_RELATION_PAIRS_PER_CHUNK,
                "too many attraction pairs in chunk, inferring only the first ones"
            );
            pairs.truncate(MAX_RELATION_PAIRS_PER_CHUNK);
        }

        let mut inferred = 0;
        for (a, b) in pairs {
            let prompt = relation_prompt(&group[a], &group[b]);
            let response: RelationResponse = match self
                .extractor
                .extract_with_retry(RELATION_SYSTEM_PROMPT, &prompt)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "relationship inference failed, skipping pair");
                    continue;
                }
            };

            let target = group[b].entity_key.clone();
            let target_type = group[b].entity_type;
            for relation in response.relations {
                let Some(rel_type) = RelType::from_str_loose(&relation.rel_type) else {
                    warn!(rel_type = relation.rel_type.as_str(), "unknown inferred relation type");
                    continue;
                };
                if rel_type.is_exclusive() {
                    // LOCATED_IN points at cities; an inferred attraction
                    // pair can never assert it.
                    continue;
                }
                group[a].relationships.push(RelAssertion {
                    rel_type,
                    target: target.clone(),
                    target_type,
                    asserted: true,
                    confidence: Some(relation.confidence.clamp(0.0, 1.0)),
                    reason: Some(relation.reason),
                });
                inferred += 1;
            }
        }
        inferred
    }
}

fn visitor_percentage(fact: &FactRecord) -> f64 {
    match fact.fields.get("visitor_percentage") {
        Some(FieldValue::Number(n)) => *n,
        _ => 0.0,
    }
}

fn field_text<'a>(fact: &'a FactRecord, name: &str) -> &'a str {
    match fact.fields.get(name) {
        Some(FieldValue::Text(s)) => s,
        _ => "",
    }
}

fn relation_prompt(a: &FactRecord, b: &FactRecord) -> String {
    format!(
        "Attraction 1:\nName: {}\nLocation: {}\nDescription: {}\nVisitor share: {}\n\n\
         Attraction 2:\nName: {}\nLocation: {}\nDescription: {}\nVisitor share: {}",
        a.entity_key.name,
        field_text(a, "location"),
        field_text(a, "description"),
        visitor_percentage(a),
        b.entity_key.name,
        field_text(b, "location"),
        field_text(b, "description"),
        visitor_percentage(b),
    )
}
