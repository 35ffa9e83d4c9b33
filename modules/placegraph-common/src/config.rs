use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    // Extraction service (OpenAI-compatible chat completions endpoint)
    pub llm_api_key: String,
    pub llm_api_base: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,

    // Files owned by the pipeline
    pub rules_path: String,
    pub conflict_queue_path: String,

    // Resolution tunables
    pub min_recency_gap_secs: i64,
    pub weight_tolerance: f64,

    // Orchestration
    pub max_concurrent_merges: usize,
    pub store_retry_attempts: u32,
    pub llm_retry_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            neo4j_uri: env::var("NEO4J_URI")
                .unwrap_or_else(|_| "bolt://localhost:7687".to_string()),
            neo4j_user: env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
            neo4j_password: required_env("NEO4J_PASSWORD"),
            llm_api_key: required_env("LLM_API_KEY"),
            llm_api_base: env::var("LLM_API_BASE")
                .unwrap_or_else(|_| "https://api.siliconflow.cn/v1/chat/completions".to_string()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "Qwen/Qwen3-8B".to_string()),
            llm_timeout_secs: parsed_env("LLM_TIMEOUT_SECS", 30),
            rules_path: env::var("RULES_PATH").unwrap_or_else(|_| "rules.toml".to_string()),
            conflict_queue_path: env::var("CONFLICT_QUEUE_PATH")
                .unwrap_or_else(|_| "conflict_queue.jsonl".to_string()),
            min_recency_gap_secs: parsed_env("MIN_RECENCY_GAP_SECS", 3600),
            weight_tolerance: parsed_env("WEIGHT_TOLERANCE", 0.01),
            max_concurrent_merges: parsed_env("MAX_CONCURRENT_MERGES", 8),
            store_retry_attempts: parsed_env("STORE_RETRY_ATTEMPTS", 3),
            llm_retry_attempts: parsed_env("LLM_RETRY_ATTEMPTS", 3),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number, got '{raw}'")),
        Err(_) => default,
    }
}
