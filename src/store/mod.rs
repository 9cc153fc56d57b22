//! Persistent score store.
//!
//! The search only talks to the store through [`ScoreStore`]. It needs
//! configuration and edge deduplication, aggregate score queries over the
//! history of a run, and mutations that survive transient failures.
//!
//! # Overview
//!
//! - **Retry** (`retry`): bounded attempts with linear backoff
//! - **SQLite** (`sqlite`): run-scoped tables backed by `rusqlite`
//!
//! Every mutation and every aggregate read runs inside its own transaction,
//! retried as a unit. Exhausting the retry budget surfaces as
//! [`StoreError::RetriesExhausted`], which callers treat as fatal.

mod retry;
mod sqlite;

pub use retry::{RetryFailure, RetryPolicy, Transient};
pub use sqlite::SqliteStore;

use crate::schema::{ConfigId, Configuration, EdgeId, Parameter, StageChoice};

/// Aggregate score of one edge group under a history prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupScore {
    pub group: String,
    pub score: f64,
}

/// Visited values and their weighted score mass for a parameter id range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreSum {
    /// Distinct historical values inside the range.
    pub visited: u64,
    /// Sum of temperature-weighted aggregate scores of those values.
    pub score: f64,
}

/// Score range reported before any configuration has succeeded.
pub const DEFAULT_SCORE_RANGE: f64 = 1.0;

/// Operations the search needs from persistent state.
///
/// A store handle is bound to one run; every operation is scoped to that
/// run's history.
pub trait ScoreStore {
    /// Run name scoping this store.
    fn run_name(&self) -> &str;

    /// Create the run's tables for a workflow with `stage_count` stages.
    fn prepare_run(&mut self, stage_count: usize) -> Result<(), StoreError>;

    /// Register an edge group's parameter columns. Idempotent.
    fn create_edge_group(&mut self, group: &str, param_names: &[&str]) -> Result<(), StoreError>;

    /// Id of the edge with these values, creating it if needed.
    ///
    /// Returns 0 without storing anything for parameterless groups.
    fn add_edge(
        &mut self,
        group: &str,
        values: &[String],
        params: &[Parameter],
    ) -> Result<EdgeId, StoreError>;

    /// Persist a full configuration with status unknown.
    fn add_configuration(&mut self, choices: &[StageChoice]) -> Result<ConfigId, StoreError>;

    /// Best-scoring configuration whose leading choices equal `prefix`.
    fn contains_subset(
        &mut self,
        prefix: &[StageChoice],
        include_failed: bool,
    ) -> Result<Option<ConfigId>, StoreError>;

    /// Mark a configuration as failed at the 1-based `stage`.
    fn fail_configuration(&mut self, id: ConfigId, stage: usize) -> Result<(), StoreError>;

    /// Store the final score and mark the configuration as succeeded.
    fn update_configuration(&mut self, id: ConfigId, score: f64) -> Result<(), StoreError>;

    /// Score of a succeeded configuration, `None` otherwise.
    fn score_for_config(&mut self, id: ConfigId) -> Result<Option<f64>, StoreError>;

    /// Log one sampling observation of `id`.
    fn record_sample(&mut self, id: ConfigId, score: Option<f64>) -> Result<(), StoreError>;

    /// Positive aggregate scores per group at `stage`, ascending.
    ///
    /// Only succeeded configurations whose first `history.len()` choices
    /// equal `history` are considered.
    fn edge_group_scores(
        &mut self,
        stage: usize,
        history: &[StageChoice],
    ) -> Result<Vec<GroupScore>, StoreError>;

    /// Visited values of `param` with ids in `[0, max_id]` and their
    /// temperature-weighted score sum, under the same history filter.
    fn score_sum_for_param_range(
        &mut self,
        stage: usize,
        history: &[StageChoice],
        group: &str,
        param: &Parameter,
        max_id: u64,
        temperature: f64,
    ) -> Result<ScoreSum, StoreError>;

    /// `max - min` over succeeded configurations.
    fn score_range(&mut self) -> Result<f64, StoreError>;

    /// Stored configuration by id.
    fn configuration(&mut self, id: ConfigId) -> Result<Option<Configuration>, StoreError>;

    /// Ids of all configurations not marked as failed.
    fn configurations(&mut self) -> Result<Vec<ConfigId>, StoreError>;

    /// Number of configurations not marked as failed.
    fn configuration_count(&mut self) -> Result<usize, StoreError> {
        Ok(self.configurations()?.len())
    }

    /// Highest-scoring succeeded configuration.
    fn best_configuration(&mut self) -> Result<Option<Configuration>, StoreError>;
}

/// Score store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("'{0}' cannot be used as a table or column name")]
    InvalidIdentifier(String),
    #[error("Run '{run}' was created with {existing} stages, workflow has {requested}")]
    StageCountMismatch {
        run: String,
        existing: usize,
        requested: usize,
    },
    #[error("Expected {expected} {what}, got {actual}")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Run tables are not prepared, call prepare_run first")]
    NotPrepared,
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: rusqlite::Error,
    },
}

impl StoreError {
    pub(crate) fn from_retry(operation: &str, failure: RetryFailure<rusqlite::Error>) -> Self {
        match failure {
            RetryFailure::Permanent(err) => StoreError::Sqlite(err),
            RetryFailure::Exhausted { attempts, last } => StoreError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                source: last,
            },
        }
    }
}
