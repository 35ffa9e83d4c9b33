use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use llm_client::{LlmClient, LlmError};
use placegraph_common::time::parse_pub_timestamp;
use placegraph_common::{
    EntityKey, EntityType, FactRecord, FieldValue, PlaceGraphError, RelAssertion, RelType,
    RetryPolicy, SourceKind,
};

use crate::weight::compute_dynamic_weight;

/// One crawled text block with its source metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub source_id: String,
    pub source_type: String,
    /// ISO-8601 instant the underlying page was published/crawled.
    pub pub_timestamp: Option<String>,
    pub text: String,
    /// Source quality metrics (e.g. reader ratings on a 0-5 scale).
    #[serde(default)]
    pub ratings: Option<f64>,
}

/// What the LLM returns for each extracted attraction.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedAttraction {
    pub name: String,
    /// City or county the attraction is in (e.g. "拉萨市", "当雄县")
    pub location: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    /// Short category label (e.g. "风景区", "文化古迹")
    pub category: Option<String>,
    /// A representative visitor comment, if the text quotes one
    pub best_comment: Option<String>,
    /// Popularity ranking within its city, 1 = most visited
    pub ranking: Option<f64>,
    /// Share of surveyed visitors who go there, 0-100
    pub visitor_percentage: Option<f64>,
    /// Notable sights within the attraction
    pub highlights: Option<Vec<String>>,
    /// ISO datetime the statement was published, when the text says so
    pub pub_timestamp: Option<String>,
}

/// The full extraction response from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResponse {
    #[serde(default)]
    pub attractions: Vec<ExtractedAttraction>,
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a tourism fact extractor for Tibetan destinations.

Your job: extract structured attraction facts from crawled travel text. For each distinct tourist attraction mentioned, produce one record with:

- **name**: the attraction's proper name, exactly as written (e.g. 布达拉宫, 纳木措)
- **location**: the city or county it belongs to (e.g. 拉萨市, 当雄县). Leave empty only if the text gives no hint.
- **category**: a short type label such as 风景区, 文化古迹, 自然风光, 寺庙
- **description**: one or two sentences summarizing what the text says about it. Use only what the text states; do not invent.
- **best_comment**: a visitor comment if the text quotes one
- **ranking** and **visitor_percentage**: only when the text states them as numbers
- **highlights**: named sights inside the attraction (e.g. 红宫, 白宫)
- **pub_timestamp**: ISO 8601 publication time, only when the text itself carries one

Rules:
- One record per attraction. Do not merge different attractions into one record.
- Never fabricate numbers, comments, or timestamps.
- Skip generic mentions that carry no facts (a bare name in a list of links).
- Keep names in their original script; do not translate.

Return every attraction with at least one usable fact."#;

/// Titles the model produces when a page failed to load or had no content.
const JUNK_MARKERS: &[&str] = &["unable to extract", "page not found", "error loading"];

/// LLM-backed extraction service. Transient failures are retried under the
/// injected policy; a permanently failing chunk is dropped by the caller and
/// never blocks other chunks.
pub struct Extractor {
    client: LlmClient,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(client: LlmClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Extract fact records from one chunk of crawled text.
    pub async fn extract(&self, chunk: &TextChunk) -> Result<Vec<FactRecord>, PlaceGraphError> {
        let text = truncate_on_char_boundary(&chunk.text, 30_000);
        let user_prompt = format!(
            "Extract all attraction facts from this text.\n\nSource: {}\n\n---\n\n{}",
            chunk.source_id, text
        );

        let response: ExtractionResponse = self
            .extract_with_retry(EXTRACTION_SYSTEM_PROMPT, &user_prompt)
            .await?;

        let source_kind = SourceKind::from_str_loose(&chunk.source_type);
        let mut facts = Vec::new();

        for extracted in response.attractions {
            let name_lower = extracted.name.to_lowercase();
            if JUNK_MARKERS.iter().any(|junk| name_lower.contains(junk)) {
                warn!(
                    source = chunk.source_id.as_str(),
                    name = extracted.name.as_str(),
                    "filtered junk extraction"
                );
                continue;
            }

            match to_fact_record(&extracted, chunk, source_kind) {
                Ok(fact) => facts.push(fact),
                Err(e) => {
                    // Validation failures are logged and dropped, never
                    // enqueued as conflicts.
                    warn!(
                        source = chunk.source_id.as_str(),
                        name = extracted.name.as_str(),
                        error = %e,
                        "dropping extraction that failed validation"
                    );
                }
            }
        }

        info!(
            source = chunk.source_id.as_str(),
            count = facts.len(),
            "extracted attraction facts"
        );
        Ok(facts)
    }

    pub(crate) async fn extract_with_retry<T>(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<T, PlaceGraphError>
    where
        T: JsonSchema + serde::de::DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            match self.client.extract::<T>(system_prompt, user_prompt).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient extraction failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(map_llm_err(e)),
            }
        }
    }
}

fn map_llm_err(e: LlmError) -> PlaceGraphError {
    PlaceGraphError::Extraction(e.to_string())
}

/// Build a validated fact record from one extraction. The pub timestamp
/// comes from the extraction itself, falling back to the chunk's crawl
/// timestamp; with neither present the record is rejected.
fn to_fact_record(
    extracted: &ExtractedAttraction,
    chunk: &TextChunk,
    source_kind: SourceKind,
) -> Result<FactRecord, PlaceGraphError> {
    let raw_timestamp = extracted
        .pub_timestamp
        .as_deref()
        .or(chunk.pub_timestamp.as_deref())
        .unwrap_or("");
    let pub_timestamp: DateTime<Utc> = parse_pub_timestamp(raw_timestamp)?;

    let region = extracted
        .location
        .clone()
        .unwrap_or_else(|| "拉萨市".to_string());

    let mut fields = BTreeMap::new();
    let mut put_text = |name: &str, value: &Option<String>| {
        if let Some(v) = value {
            if !v.trim().is_empty() {
                fields.insert(name.to_string(), FieldValue::Text(v.clone()));
            }
        }
    };
    put_text("location", &Some(region.clone()));
    put_text("address", &extracted.address);
    put_text("description", &extracted.description);
    put_text("category", &extracted.category);
    put_text("best_comment", &extracted.best_comment);
    if let Some(ranking) = extracted.ranking {
        fields.insert("ranking".to_string(), FieldValue::Number(ranking));
    }
    if let Some(pct) = extracted.visitor_percentage {
        fields.insert("visitor_percentage".to_string(), FieldValue::Number(pct));
    }
    if let Some(highlights) = &extracted.highlights {
        if !highlights.is_empty() {
            fields.insert(
                "highlights".to_string(),
                FieldValue::List(highlights.clone()),
            );
        }
    }

    let relationships = vec![RelAssertion {
        rel_type: RelType::LocatedIn,
        target: EntityKey::new(&region, ""),
        target_type: EntityType::City,
        asserted: true,
        confidence: None,
        reason: None,
    }];

    let fact = FactRecord {
        entity_type: EntityType::Attraction,
        entity_key: EntityKey::new(&extracted.name, &region),
        fields,
        relationships,
        source_id: chunk.source_id.clone(),
        source_kind,
        source_weight: compute_dynamic_weight(chunk.ratings, source_kind, pub_timestamp, Utc::now()),
        pub_timestamp,
    };
    fact.validate()?;
    Ok(fact)
}

fn truncate_on_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> TextChunk {
        TextChunk {
            source_id: "crawler-lhasa".into(),
            source_type: "crawler".into(),
            pub_timestamp: Some("2023-05-20T09:15:00+08:00".into()),
            text: "布达拉宫，位于拉萨市…".into(),
            ratings: Some(4.5),
        }
    }

    fn extracted() -> ExtractedAttraction {
        ExtractedAttraction {
            name: "布达拉宫".into(),
            location: Some("拉萨市".into()),
            address: Some("北京中路35号".into()),
            description: Some("西藏标志性宫殿建筑群".into()),
            category: Some("文化古迹".into()),
            best_comment: None,
            ranking: Some(1.0),
            visitor_percentage: Some(93.0),
            highlights: Some(vec!["红宫".into(), "白宫".into()]),
            pub_timestamp: None,
        }
    }

    #[test]
    fn conversion_builds_a_valid_fact_with_located_in() {
        let fact = to_fact_record(&extracted(), &chunk(), SourceKind::Crawler).unwrap();
        assert_eq!(fact.entity_key, EntityKey::new("布达拉宫", "拉萨市"));
        assert_eq!(fact.fields["category"], FieldValue::Text("文化古迹".into()));
        assert_eq!(fact.fields["ranking"], FieldValue::Number(1.0));
        assert_eq!(fact.relationships.len(), 1);
        assert_eq!(fact.relationships[0].rel_type, RelType::LocatedIn);
        assert_eq!(fact.relationships[0].target, EntityKey::new("拉萨市", ""));
        assert!(fact.validate().is_ok());
    }

    #[test]
    fn extraction_timestamp_overrides_chunk_timestamp() {
        let mut e = extracted();
        e.pub_timestamp = Some("2024-01-01T00:00:00+08:00".into());
        let fact = to_fact_record(&e, &chunk(), SourceKind::Crawler).unwrap();
        assert_eq!(
            fact.pub_timestamp,
            parse_pub_timestamp("2024-01-01T00:00:00+08:00").unwrap()
        );
    }

    #[test]
    fn missing_timestamp_everywhere_is_rejected() {
        let mut c = chunk();
        c.pub_timestamp = None;
        let err = to_fact_record(&extracted(), &c, SourceKind::Crawler).unwrap_err();
        assert!(matches!(err, PlaceGraphError::Validation(_)));
    }

    #[test]
    fn missing_location_defaults_to_lhasa() {
        let mut e = extracted();
        e.location = None;
        let fact = to_fact_record(&e, &chunk(), SourceKind::Crawler).unwrap();
        assert_eq!(fact.entity_key.region, "拉萨市");
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let mut e = extracted();
        e.address = Some("   ".into());
        e.best_comment = None;
        e.highlights = Some(vec![]);
        let fact = to_fact_record(&e, &chunk(), SourceKind::Crawler).unwrap();
        assert!(!fact.fields.contains_key("address"));
        assert!(!fact.fields.contains_key("best_comment"));
        assert!(!fact.fields.contains_key("highlights"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "布达拉宫".repeat(10_000);
        let truncated = truncate_on_char_boundary(&text, 30_000);
        assert!(truncated.len() <= 30_000);
        assert!(truncated.chars().last().is_some());
    }
}
