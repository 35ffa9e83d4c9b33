use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use llm_client::LlmClient;
use placegraph_common::{Config, GraphStore, PrecedenceRules, RetryPolicy};
use placegraph_graph::{migrate::migrate, GraphClient, Neo4jStore};
use placegraph_ingest::pipeline::CrawlInput;
use placegraph_ingest::{Extractor, Pipeline};
use placegraph_merge::{
    ConflictQueue, Disposition, IdentityResolver, JsonlConflictQueue, LexicalMatcher,
    Orchestrator, ResolutionPolicy,
};

#[derive(Parser)]
#[command(name = "placegraph", about = "Tourism knowledge graph ingest and merge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a crawl batch file and merge it into the graph.
    Run {
        /// JSON file with crawled text chunks.
        input: PathBuf,
    },
    /// List open conflicts awaiting review.
    Conflicts,
    /// Dispose one open conflict.
    Dispose {
        id: Uuid,
        #[arg(long, value_enum)]
        choice: Choice,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Choice {
    Challenger,
    Incumbent,
    Dismiss,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("placegraph=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let client =
        GraphClient::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
            .await
            .context("failed to connect to Neo4j")?;
    migrate(&client).await.context("migration failed")?;

    let store: Arc<dyn GraphStore> = Arc::new(Neo4jStore::new(client));
    let queue: Arc<dyn ConflictQueue> = Arc::new(
        JsonlConflictQueue::open(&config.conflict_queue_path)
            .context("failed to open conflict queue")?,
    );

    let rules = if std::path::Path::new(&config.rules_path).exists() {
        let rules = PrecedenceRules::load(&config.rules_path)?;
        info!(path = config.rules_path.as_str(), rules = rules.len(), "precedence rules loaded");
        rules
    } else {
        info!(path = config.rules_path.as_str(), "no rules file, arbitration uses recency and weight only");
        PrecedenceRules::default()
    };

    let policy = ResolutionPolicy::new(
        Arc::new(rules),
        config.min_recency_gap_secs,
        config.weight_tolerance,
    );
    let identity = IdentityResolver::new(Box::new(LexicalMatcher));
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        policy,
        identity,
        RetryPolicy::with_max_attempts(config.store_retry_attempts),
        config.max_concurrent_merges,
    );

    match cli.command {
        Command::Run { input } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("cannot read {}", input.display()))?;
            let batch: CrawlInput = serde_json::from_str(&raw)
                .with_context(|| format!("cannot parse {}", input.display()))?;
            info!(chunks = batch.chunks.len(), "ingest starting");

            let llm = LlmClient::new(
                &config.llm_api_key,
                &config.llm_model,
                &config.llm_api_base,
                Duration::from_secs(config.llm_timeout_secs),
            );
            let extractor = Extractor::new(
                llm,
                RetryPolicy::with_max_attempts(config.llm_retry_attempts),
            );

            let pipeline = Pipeline::new(extractor, orchestrator);
            let stats = pipeline.run(batch.chunks).await;
            info!("ingest run complete. {stats}");
        }
        Command::Conflicts => {
            let open = queue.list_open().await?;
            if open.is_empty() {
                println!("no open conflicts");
            }
            for record in open {
                println!(
                    "{}  {}  {}  incumbent: {}  challenger: {}  ({})",
                    record.id,
                    record.entity_key,
                    record.slot,
                    record
                        .incumbent
                        .as_ref()
                        .map(|c| c.value.to_string())
                        .unwrap_or_else(|| "<none>".into()),
                    record.challenger.value,
                    record.reason,
                );
            }
        }
        Command::Dispose { id, choice } => {
            let disposition = match choice {
                Choice::Challenger => Disposition::AcceptChallenger,
                Choice::Incumbent => Disposition::KeepIncumbent,
                Choice::Dismiss => Disposition::Dismiss,
            };
            let record = orchestrator.apply_disposition(id, disposition).await?;
            println!("conflict {} is now {:?}", record.id, record.status);
        }
    }

    Ok(())
}
