use async_trait::async_trait;
use neo4rs::{query, BoltFloat, BoltMap, BoltString, BoltType};
use tracing::debug;

use placegraph_common::time::{parse_pub_timestamp, to_reference_string};
use placegraph_common::{
    EntityKey, EntitySnapshot, EntityType, EntityUpdate, FieldValue, GraphStore, RelChange,
    RelType, SourceKind, StoreError, StoredField, StoredRelationship,
};

use crate::GraphClient;

/// Suffixes of the per-field provenance companion properties.
const SOURCE_ID_SUFFIX: &str = "__source_id";
const SOURCE_KIND_SUFFIX: &str = "__source_kind";
const WEIGHT_SUFFIX: &str = "__weight";
const PUBLISHED_AT_SUFFIX: &str = "__published_at";

/// Neo4j-backed graph store. One bolt transaction per applied batch, so a
/// fact's resolved fields and edges commit together or not at all.
pub struct Neo4jStore {
    client: GraphClient,
}

impl Neo4jStore {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    fn field_props(fields: &std::collections::BTreeMap<String, StoredField>) -> BoltType {
        let mut entries: Vec<(BoltString, BoltType)> = Vec::new();
        for (name, field) in fields {
            entries.push((BoltString::from(name.as_str()), bolt_value(&field.value)));
            entries.push((
                BoltString::from(format!("{name}{SOURCE_ID_SUFFIX}").as_str()),
                bolt_str(&field.source_id),
            ));
            entries.push((
                BoltString::from(format!("{name}{SOURCE_KIND_SUFFIX}").as_str()),
                bolt_str(&field.source_kind.to_string()),
            ));
            entries.push((
                BoltString::from(format!("{name}{WEIGHT_SUFFIX}").as_str()),
                BoltType::Float(BoltFloat::new(field.source_weight)),
            ));
            entries.push((
                BoltString::from(format!("{name}{PUBLISHED_AT_SUFFIX}").as_str()),
                bolt_str(&to_reference_string(&field.published_at)),
            ));
        }
        BoltType::Map(BoltMap::from_iter(entries))
    }

    fn rel_props(rel: &StoredRelationship) -> BoltType {
        let mut entries: Vec<(BoltString, BoltType)> = vec![
            (BoltString::from("source_id"), bolt_str(&rel.source_id)),
            (
                BoltString::from("source_kind"),
                bolt_str(&rel.source_kind.to_string()),
            ),
            (
                BoltString::from("source_weight"),
                BoltType::Float(BoltFloat::new(rel.source_weight)),
            ),
            (
                BoltString::from("published_at"),
                bolt_str(&to_reference_string(&rel.published_at)),
            ),
        ];
        if let Some(confidence) = rel.confidence {
            entries.push((
                BoltString::from("confidence"),
                BoltType::Float(BoltFloat::new(confidence)),
            ));
        }
        if let Some(reason) = &rel.reason {
            entries.push((BoltString::from("reason"), bolt_str(reason)));
        }
        BoltType::Map(BoltMap::from_iter(entries))
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn get_entity(
        &self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> Result<Option<EntitySnapshot>, StoreError> {
        let label = entity_type.to_string();

        let node_q = query(&format!(
            "MATCH (n:{label} {{name: $name, region: $region}}) RETURN n"
        ))
        .param("name", key.name.as_str())
        .param("region", key.region.as_str());

        let mut stream = self
            .client
            .graph
            .execute(node_q)
            .await
            .map_err(map_store_err)?;

        let row = match stream.next().await.map_err(map_store_err)? {
            Some(row) => row,
            None => return Ok(None),
        };

        let node: neo4rs::Node = row
            .get("n")
            .map_err(|e| StoreError::query(format!("snapshot row missing node: {e}")))?;
        let fields = node_fields(&node);

        let rel_q = query(&format!(
            "MATCH (n:{label} {{name: $name, region: $region}})-[r]->(m)
             RETURN type(r) AS rel_type, head(labels(m)) AS target_label,
                    m.name AS target_name, m.region AS target_region,
                    r.source_id AS source_id, r.source_kind AS source_kind,
                    r.source_weight AS source_weight, r.published_at AS published_at,
                    r.confidence AS confidence, r.reason AS reason"
        ))
        .param("name", key.name.as_str())
        .param("region", key.region.as_str());

        let mut relationships = Vec::new();
        let mut stream = self
            .client
            .graph
            .execute(rel_q)
            .await
            .map_err(map_store_err)?;
        while let Some(row) = stream.next().await.map_err(map_store_err)? {
            if let Some(rel) = row_to_relationship(&row) {
                relationships.push(rel);
            }
        }

        Ok(Some(EntitySnapshot { fields, relationships }))
    }

    async fn apply(&self, update: &EntityUpdate) -> Result<(), StoreError> {
        let label = update.entity_type.to_string();
        let mut queries = Vec::new();

        // Node upsert with per-field provenance. SET += touches only the
        // supplied fields, so unrelated fields keep their stored state.
        queries.push(
            query(&format!(
                "MERGE (n:{label} {{name: $name, region: $region}}) SET n += $props"
            ))
            .param("name", update.key.name.as_str())
            .param("region", update.key.region.as_str())
            .param("props", Self::field_props(&update.fields)),
        );

        for change in &update.relationships {
            match change {
                RelChange::Upsert(rel) => {
                    let tlabel = rel.target_type.to_string();
                    let rtype = rel.rel_type.to_string();
                    queries.push(
                        query(&format!(
                            "MERGE (m:{tlabel} {{name: $target_name, region: $target_region}})
                             WITH m
                             MATCH (n:{label} {{name: $name, region: $region}})
                             MERGE (n)-[e:{rtype}]->(m)
                             SET e += $props"
                        ))
                        .param("name", update.key.name.as_str())
                        .param("region", update.key.region.as_str())
                        .param("target_name", rel.target.name.as_str())
                        .param("target_region", rel.target.region.as_str())
                        .param("props", Self::rel_props(rel)),
                    );
                }
                RelChange::Delete { rel_type, target } => {
                    let rtype = rel_type.to_string();
                    queries.push(
                        query(&format!(
                            "MATCH (n:{label} {{name: $name, region: $region}})-[e:{rtype}]->\
                             (m {{name: $target_name, region: $target_region}})
                             DELETE e"
                        ))
                        .param("name", update.key.name.as_str())
                        .param("region", update.key.region.as_str())
                        .param("target_name", target.name.as_str())
                        .param("target_region", target.region.as_str()),
                    );
                }
            }
        }

        // Audit trail. MERGE on log_id keeps re-runs from duplicating it.
        queries.push(
            query("MERGE (l:UpdateLog {log_id: $log_id}) SET l += $props")
                .param("log_id", update.log.log_id.as_str())
                .param(
                    "props",
                    BoltType::Map(BoltMap::from_iter(vec![
                        (
                            BoltString::from("entity_name"),
                            bolt_str(&update.key.name),
                        ),
                        (
                            BoltString::from("entity_type"),
                            bolt_str(&update.entity_type.to_string()),
                        ),
                        (BoltString::from("reason"), bolt_str(&update.log.reason)),
                        (
                            BoltString::from("applied_at"),
                            bolt_str(&to_reference_string(&update.log.applied_at)),
                        ),
                    ])),
                ),
        );

        let count = queries.len();
        let mut txn = self.client.graph.start_txn().await.map_err(map_store_err)?;
        txn.run_queries(queries).await.map_err(map_store_err)?;
        txn.commit().await.map_err(map_store_err)?;

        debug!(
            entity = %update.key,
            queries = count,
            "applied entity update"
        );
        Ok(())
    }

    async fn known_keys(&self, entity_type: EntityType) -> Result<Vec<EntityKey>, StoreError> {
        let label = entity_type.to_string();
        let q = query(&format!(
            "MATCH (n:{label}) RETURN n.name AS name, n.region AS region"
        ));

        let mut keys = Vec::new();
        let mut stream = self
            .client
            .graph
            .execute(q)
            .await
            .map_err(map_store_err)?;
        while let Some(row) = stream.next().await.map_err(map_store_err)? {
            let name: String = row.get("name").unwrap_or_default();
            let region: String = row.get("region").unwrap_or_default();
            if !name.is_empty() {
                keys.push(EntityKey { name, region });
            }
        }
        Ok(keys)
    }
}

fn bolt_str(s: &str) -> BoltType {
    BoltType::String(BoltString::from(s))
}

fn bolt_value(value: &FieldValue) -> BoltType {
    match value {
        FieldValue::Text(s) => bolt_str(s),
        FieldValue::Number(n) => BoltType::Float(BoltFloat::new(*n)),
        FieldValue::List(items) => items.clone().into(),
    }
}

/// Rebuild the per-field map from node properties, pairing each base
/// property with its provenance companions.
fn node_fields(node: &neo4rs::Node) -> std::collections::BTreeMap<String, StoredField> {
    let mut fields = std::collections::BTreeMap::new();

    for key in node.keys() {
        if key == "name"
            || key == "region"
            || key.ends_with(SOURCE_ID_SUFFIX)
            || key.ends_with(SOURCE_KIND_SUFFIX)
            || key.ends_with(WEIGHT_SUFFIX)
            || key.ends_with(PUBLISHED_AT_SUFFIX)
        {
            continue;
        }

        let value = if let Ok(s) = node.get::<String>(key) {
            FieldValue::Text(s)
        } else if let Ok(n) = node.get::<f64>(key) {
            FieldValue::Number(n)
        } else if let Ok(items) = node.get::<Vec<String>>(key) {
            FieldValue::List(items)
        } else {
            continue;
        };

        let source_id: String = node
            .get(format!("{key}{SOURCE_ID_SUFFIX}").as_str())
            .unwrap_or_default();
        let source_kind: String = node
            .get(format!("{key}{SOURCE_KIND_SUFFIX}").as_str())
            .unwrap_or_default();
        let source_weight: f64 = node
            .get(format!("{key}{WEIGHT_SUFFIX}").as_str())
            .unwrap_or(0.0);
        let published_at_raw: String = node
            .get(format!("{key}{PUBLISHED_AT_SUFFIX}").as_str())
            .unwrap_or_default();
        let published_at = match parse_pub_timestamp(&published_at_raw) {
            Ok(dt) => dt,
            // A field without readable provenance cannot be arbitrated.
            Err(_) => continue,
        };

        fields.insert(
            key.to_string(),
            StoredField {
                value,
                source_id,
                source_kind: SourceKind::from_str_loose(&source_kind),
                source_weight,
                published_at,
            },
        );
    }

    fields
}

fn row_to_relationship(row: &neo4rs::Row) -> Option<StoredRelationship> {
    let rel_type_raw: String = row.get("rel_type").ok()?;
    let rel_type = RelType::from_str_loose(&rel_type_raw)?;

    let target_label: String = row.get("target_label").ok()?;
    let target_type = match target_label.as_str() {
        "Attraction" => EntityType::Attraction,
        "City" => EntityType::City,
        _ => return None,
    };

    let target_name: String = row.get("target_name").ok()?;
    let target_region: String = row.get("target_region").unwrap_or_default();

    let published_at_raw: String = row.get("published_at").unwrap_or_default();
    let published_at = parse_pub_timestamp(&published_at_raw).ok()?;

    Some(StoredRelationship {
        rel_type,
        target: EntityKey { name: target_name, region: target_region },
        target_type,
        source_id: row.get("source_id").unwrap_or_default(),
        source_kind: SourceKind::from_str_loose(
            &row.get::<String>("source_kind").unwrap_or_default(),
        ),
        source_weight: row.get("source_weight").unwrap_or(0.0),
        published_at,
        confidence: row.get::<f64>("confidence").ok(),
        reason: row.get::<String>("reason").ok(),
    })
}

fn map_store_err(e: neo4rs::Error) -> StoreError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        StoreError::timeout(message)
    } else if lower.contains("connection") || lower.contains("io error") {
        StoreError::connection(message)
    } else if lower.contains("constraint") {
        StoreError::constraint(message)
    } else {
        StoreError::query(message)
    }
}
