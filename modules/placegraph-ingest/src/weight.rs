use chrono::{DateTime, Utc};

use placegraph_common::SourceKind;

/// Days after which published data contributes no freshness at all.
const FRESHNESS_WINDOW_DAYS: f64 = 365.0;

/// Trust multiplier per source class. Hand-curated crowd data is wobblier
/// than official registers.
fn kind_multiplier(kind: SourceKind) -> f64 {
    match kind {
        SourceKind::Government => 1.0,
        SourceKind::Manual => 1.0,
        SourceKind::News => 0.9,
        SourceKind::Crawler => 0.8,
        SourceKind::Social => 0.7,
    }
}

/// Derive a source weight in [0, 1] from reader ratings, source class, and
/// data age. Ratings are on a 0-5 scale; missing ratings fall back to the
/// midpoint so an unrated source is not zeroed out.
pub fn compute_dynamic_weight(
    ratings: Option<f64>,
    kind: SourceKind,
    published_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let base = ratings.unwrap_or(2.5).clamp(0.0, 5.0) / 5.0;
    let weighted = base * kind_multiplier(kind);

    let age_days = (now - published_at).num_days().max(0) as f64;
    let freshness = (1.0 - age_days / FRESHNESS_WINDOW_DAYS).max(0.0);

    (weighted * freshness).clamp(0.0, 1.0)
}
