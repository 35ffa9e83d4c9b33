use neo4rs::query;
use tracing::info;

use crate::GraphClient;

/// Create the lookup indexes the merge path depends on. Every statement is
/// idempotent, so this runs unconditionally at startup.
pub async fn migrate(client: &GraphClient) -> Result<(), neo4rs::Error> {
    let statements = [
        "CREATE INDEX attraction_key IF NOT EXISTS FOR (a:Attraction) ON (a.name, a.region)",
        "CREATE INDEX city_key IF NOT EXISTS FOR (c:City) ON (c.name, c.region)",
        "CREATE INDEX update_log_id IF NOT EXISTS FOR (l:UpdateLog) ON (l.log_id)",
    ];

    for statement in statements {
        client.graph.run(query(statement)).await?;
    }

    info!("graph indexes ensured");
    Ok(())
}
