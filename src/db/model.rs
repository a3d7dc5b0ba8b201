//! View models returned by repository queries.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::NewsState;

/// One row of a feed's news listing.
#[derive(Debug, Clone, Serialize)]
pub struct NewsSummary {
    pub id: i64,
    pub title: String,
    pub link: Option<String>,
    pub state: NewsState,
    pub flagged: bool,
    pub published_at: Option<DateTime<Utc>>,
}
