//! Workflow Walker - Heuristic parameter search for multi-stage workflows.
//!
//! A workflow is a fixed sequence of stages. Each stage offers alternative
//! edge groups, and each group has its own tunable parameters. The walker
//! samples full configurations, executes them through a pluggable executor,
//! and uses every stored score to bias later samples toward good regions.
//!
//! # Architecture
//!
//! The crate is split into three main modules:
//!
//! - `schema`: Parameters, workflows and run configuration
//! - `store`: Persistent score store with transactional retries
//! - `search`: Temperature weighting, edge selection and the sampler
//!
//! # Example
//!
//! ```rust,no_run
//! use workflow_walker::{
//!     schema::{EdgeGroup, Parameter, SamplingConfig, Workflow},
//!     search::{RastriginExecutor, Sampler},
//!     store::{RetryPolicy, SqliteStore},
//! };
//!
//! let x = Parameter::double("x", -5.0, 5.0, 0.1)?;
//! let workflow = Workflow::new(vec![vec![EdgeGroup::new("grid", vec![x], "$#x#$")]])?;
//! let store = SqliteStore::open("walker.db", "demo", RetryPolicy::default())?;
//!
//! let mut sampler = Sampler::new(workflow, store, RastriginExecutor::new(), &SamplingConfig::default())?;
//! let report = sampler.sample(50)?;
//! println!("Best score after 50 trials: {:?}", report.best_score());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod schema;
pub mod search;
pub mod store;

// Re-export commonly used types
pub use schema::{SamplerConfig, Workflow};
pub use search::{RastriginExecutor, Sampler};
pub use store::{ScoreStore, SqliteStore};
