use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One item pulled from a news feed, before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsEvent {
    pub id: String,
    pub source: String,
    pub title: String,
    pub content: String,
    pub url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Scored news item as consumed by the decision engine.
///
/// `signal_score` is the composite the engine thresholds against (0-100);
/// `sentiment` is the raw lexicon compound in [-1, 1] and is kept for
/// logging and the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSignal {
    pub event: NewsEvent,
    pub ticker: Option<String>,
    pub sentiment: f64,
    pub positive_pct: f64,
    pub signal_score: f64,
}

impl ScoredSignal {
    pub fn id(&self) -> &str {
        &self.event.id
    }
}
