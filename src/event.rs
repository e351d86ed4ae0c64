use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Action recorded when an installation is assigned a variant for the first time.
pub const ACTION_CHOSEN: &str = "chosen";
/// Action recorded when a goal is reached.
pub const ACTION_GOAL: &str = "goal";
/// Action recorded when a test fails on the SDK side (e.g., malformed remote data).
pub const ACTION_FAILURE: &str = "failure";

/// A single entry of the local event log. Entries are immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Row id, increasing in insertion order. Local only, never uploaded.
    #[serde(skip)]
    pub id: i64,
    /// When the entry was written (microsecond precision).
    pub timestamp: DateTime<Utc>,
    /// What happened, e.g. [`ACTION_CHOSEN`].
    pub action: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Per-test record of the persisted decision and the test's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedChoice {
    /// Unique test name.
    pub test_name: String,
    /// Chosen variant, `None` if only metadata has been recorded so far.
    pub choice: Option<usize>,
    /// Number of variants the test was last evaluated with.
    pub num_choices: usize,
    /// Whether this is a data-only test.
    pub has_data: bool,
}

/// Outcome of an atomic assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// The installation already had a valid choice for this test.
    Cached(usize),
    /// A new choice was made, persisted and logged.
    New(usize),
}

impl Assignment {
    /// The chosen variant index.
    pub fn choice(self) -> usize {
        match self {
            Assignment::Cached(choice) | Assignment::New(choice) => choice,
        }
    }

    /// Returns `true` if the choice was made by this evaluation.
    pub fn is_new(self) -> bool {
        matches!(self, Assignment::New(_))
    }
}
