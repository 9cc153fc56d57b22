//! Heuristic configuration search over workflow stages.
//!
//! Each trial walks the workflow stage by stage and picks one edge per
//! stage, weighting groups and parameter values by the scores of earlier
//! configurations that share the same history. A temperature rising from
//! near 0 to 1 over the run shifts the weighting from exploration toward
//! the best-scoring tail.
//!
//! # Overview
//!
//! - **Temperature** (`temperature`): score weighting by rank
//! - **Selection** (`selection`): group draw and value binary search
//! - **Sampler** (`sampler`): trial loop, deduplication and prefix cache
//! - **Rastrigin** (`rastrigin`): self-test executor
//!
//! # Example
//!
//! ```rust,no_run
//! use workflow_walker::schema::SamplerConfig;
//! use workflow_walker::search::{RastriginExecutor, Sampler};
//!
//! let config = SamplerConfig::default();
//! let mut sampler = Sampler::from_config(&config, RastriginExecutor::new())?;
//! let report = sampler.run_with_callback(config.sampling.samples, |trial| {
//!     println!("Trial {}: {:?}", trial.trial, trial.outcome);
//! })?;
//!
//! println!("Best score: {:?}", report.best_score());
//! # Ok::<(), workflow_walker::search::SamplerError>(())
//! ```

mod rastrigin;
mod sampler;
mod selection;
mod temperature;

pub use rastrigin::{RastriginExecutor, rastrigin_term};
pub use sampler::{
    ExecutionError, ExecutionRequest, PipelineExecutor, Sampler, SamplerError, SamplingReport,
    TrialOutcome, TrialReport,
};
pub use selection::{choose_group, choose_value_id, select_edge};
pub use temperature::{SCORE_MODIFIER, border, relative_score_for_element, relative_score_sum};
