//! Integration tests for the Neo4j-backed store.
//!
//! Requirements: Docker (for Neo4j via testcontainers)
//!
//! Run with: cargo test -p placegraph-graph --features test-utils --test store_test

#![cfg(feature = "test-utils")]

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use placegraph_common::{
    EntityKey, EntityType, EntityUpdate, FieldValue, GraphStore, RelChange, RelType, SourceKind,
    StoredField, StoredRelationship, UpdateLogEntry,
};
use placegraph_graph::{migrate::migrate, query, GraphClient, Neo4jStore};

async fn setup() -> (impl std::any::Any, GraphClient, Neo4jStore) {
    let (container, client) = placegraph_graph::testutil::neo4j_container().await;
    migrate(&client).await.expect("migration failed");
    let store = Neo4jStore::new(client.clone());
    (container, client, store)
}

fn stored_field(value: FieldValue) -> StoredField {
    StoredField {
        value,
        source_id: "gov-portal".into(),
        source_kind: SourceKind::Government,
        source_weight: 0.9,
        published_at: Utc.with_ymd_and_hms(2023, 5, 20, 9, 15, 0).unwrap(),
    }
}

fn potala_update() -> EntityUpdate {
    let mut fields = BTreeMap::new();
    fields.insert(
        "category".to_string(),
        stored_field(FieldValue::Text("文化古迹".into())),
    );
    fields.insert(
        "ticket_price".to_string(),
        stored_field(FieldValue::Number(200.0)),
    );
    fields.insert(
        "highlights".to_string(),
        stored_field(FieldValue::List(vec!["红宫".into(), "白宫".into()])),
    );

    EntityUpdate {
        key: EntityKey::new("布达拉宫", "拉萨市"),
        entity_type: EntityType::Attraction,
        fields,
        relationships: vec![RelChange::Upsert(StoredRelationship {
            rel_type: RelType::LocatedIn,
            target: EntityKey::new("拉萨市", ""),
            target_type: EntityType::City,
            source_id: "gov-portal".into(),
            source_kind: SourceKind::Government,
            source_weight: 0.9,
            published_at: Utc.with_ymd_and_hms(2023, 5, 20, 9, 15, 0).unwrap(),
            confidence: Some(0.95),
            reason: Some("official register".into()),
        })],
        log: UpdateLogEntry {
            log_id: "布达拉宫_2023-05-20".into(),
            reason: "initial import".into(),
            applied_at: Utc::now(),
        },
    }
}

async fn located_in_edge_count(client: &GraphClient) -> i64 {
    let mut stream = client
        .inner()
        .execute(query(
            "MATCH (:Attraction {name: '布达拉宫'})-[e:LOCATED_IN]->(:City) \
             RETURN count(e) AS edges",
        ))
        .await
        .expect("edge count query");
    let row = stream.next().await.expect("stream").expect("row");
    row.get("edges").unwrap_or(0)
}

#[tokio::test]
async fn apply_then_snapshot_round_trips() {
    let (_container, _client, store) = setup().await;
    let update = potala_update();

    store.apply(&update).await.expect("apply failed");

    let snapshot = store
        .get_entity(EntityType::Attraction, &update.key)
        .await
        .expect("get_entity failed")
        .expect("entity missing after apply");

    let category = &snapshot.fields["category"];
    assert_eq!(category.value, FieldValue::Text("文化古迹".into()));
    assert_eq!(category.source_id, "gov-portal");
    assert_eq!(category.source_kind, SourceKind::Government);
    assert!((category.source_weight - 0.9).abs() < 1e-9);
    assert_eq!(
        category.published_at,
        Utc.with_ymd_and_hms(2023, 5, 20, 9, 15, 0).unwrap()
    );

    assert_eq!(
        snapshot.fields["ticket_price"].value,
        FieldValue::Number(200.0)
    );
    assert_eq!(
        snapshot.fields["highlights"].value,
        FieldValue::List(vec!["红宫".into(), "白宫".into()])
    );

    assert_eq!(snapshot.relationships.len(), 1);
    let rel = &snapshot.relationships[0];
    assert_eq!(rel.rel_type, RelType::LocatedIn);
    assert_eq!(rel.target, EntityKey::new("拉萨市", ""));
    assert_eq!(rel.target_type, EntityType::City);
    assert_eq!(rel.confidence, Some(0.95));
}

#[tokio::test]
async fn reapplying_an_identical_update_creates_no_duplicates() {
    let (_container, client, store) = setup().await;
    let update = potala_update();

    store.apply(&update).await.expect("first apply");
    store.apply(&update).await.expect("second apply");

    assert_eq!(located_in_edge_count(&client).await, 1);

    let mut stream = client
        .inner()
        .execute(query(
            "MATCH (a:Attraction {name: '布达拉宫'}) RETURN count(a) AS nodes",
        ))
        .await
        .expect("node count query");
    let row = stream.next().await.expect("stream").expect("row");
    let nodes: i64 = row.get("nodes").unwrap_or(0);
    assert_eq!(nodes, 1);

    let mut stream = client
        .inner()
        .execute(query(
            "MATCH (l:UpdateLog {log_id: '布达拉宫_2023-05-20'}) RETURN count(l) AS logs",
        ))
        .await
        .expect("log count query");
    let row = stream.next().await.expect("stream").expect("row");
    let logs: i64 = row.get("logs").unwrap_or(0);
    assert_eq!(logs, 1);
}

#[tokio::test]
async fn relationship_delete_removes_the_edge() {
    let (_container, client, store) = setup().await;
    let update = potala_update();
    store.apply(&update).await.expect("apply");
    assert_eq!(located_in_edge_count(&client).await, 1);

    let retraction = EntityUpdate {
        fields: BTreeMap::new(),
        relationships: vec![RelChange::Delete {
            rel_type: RelType::LocatedIn,
            target: EntityKey::new("拉萨市", ""),
        }],
        log: UpdateLogEntry {
            log_id: "布达拉宫_retract".into(),
            reason: "edge retracted by review".into(),
            applied_at: Utc::now(),
        },
        ..update
    };

    store.apply(&retraction).await.expect("retraction apply");
    assert_eq!(located_in_edge_count(&client).await, 0);
}

#[tokio::test]
async fn known_keys_lists_stored_entities() {
    let (_container, _client, store) = setup().await;
    store.apply(&potala_update()).await.expect("apply");

    let attractions = store
        .known_keys(EntityType::Attraction)
        .await
        .expect("known_keys");
    assert_eq!(attractions, vec![EntityKey::new("布达拉宫", "拉萨市")]);

    let cities = store.known_keys(EntityType::City).await.expect("known_keys");
    assert_eq!(cities, vec![EntityKey::new("拉萨市", "")]);
}

#[tokio::test]
async fn unknown_entity_returns_none() {
    let (_container, _client, store) = setup().await;
    let missing = store
        .get_entity(EntityType::Attraction, &EntityKey::new("大昭寺", "拉萨市"))
        .await
        .expect("get_entity");
    assert!(missing.is_none());
}
