pub mod client;
pub mod migrate;
pub mod store;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use client::GraphClient;
pub use store::Neo4jStore;

pub use neo4rs::query;
