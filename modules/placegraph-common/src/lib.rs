pub mod config;
pub mod error;
pub mod retry;
pub mod rules;
pub mod store;
pub mod time;
pub mod types;

pub use config::Config;
pub use error::{PlaceGraphError, StoreError, StoreErrorKind};
pub use retry::RetryPolicy;
pub use rules::{PrecedenceRule, PrecedenceRules};
pub use store::GraphStore;
pub use types::*;
