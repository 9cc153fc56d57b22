//! Sampling driver and the pipeline executor contract.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::schema::{
    ConfigId, Configuration, Edge, SamplerConfig, SamplingConfig, StageChoice, Workflow,
    WorkflowError,
};
use crate::store::{RetryPolicy, ScoreStore, SqliteStore, StoreError};

use super::selection::select_edge;

/// Everything an executor needs to run one configuration.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Configuration being executed.
    pub config_id: ConfigId,
    /// One edge per stage, in stage order.
    pub edges: Vec<Edge>,
    /// Succeeded configuration sharing the longest stage prefix, if any.
    pub cached: Option<ConfigId>,
    /// Number of leading stages whose outputs can be taken from `cached`.
    /// Execution resumes at this stage index.
    pub last_common_stage: usize,
}

/// Runs a configuration's stages.
///
/// On success the executor must write the final score through
/// [`ScoreStore::update_configuration`]. A stage failure is reported as
/// [`ExecutionError::StageFailed`] and recorded by the sampler; a store
/// error aborts sampling.
pub trait PipelineExecutor {
    fn execute(
        &mut self,
        request: &ExecutionRequest,
        store: &mut dyn ScoreStore,
    ) -> Result<(), ExecutionError>;
}

/// Executor failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// `stage` is 1-based.
    #[error("Stage {stage} failed: {reason}")]
    StageFailed { stage: usize, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened in a single trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrialOutcome {
    /// The sampled configuration already existed and was not executed.
    Duplicate {
        config_id: ConfigId,
        score: Option<f64>,
    },
    /// A new configuration ran to completion.
    Completed {
        config_id: ConfigId,
        score: Option<f64>,
    },
    /// A new configuration failed at the 1-based `stage`.
    Failed {
        config_id: ConfigId,
        stage: usize,
        reason: String,
    },
}

impl TrialOutcome {
    pub fn config_id(&self) -> ConfigId {
        match self {
            TrialOutcome::Duplicate { config_id, .. }
            | TrialOutcome::Completed { config_id, .. }
            | TrialOutcome::Failed { config_id, .. } => *config_id,
        }
    }
}

/// Per-trial progress passed to [`Sampler::run_with_callback`].
#[derive(Debug, Clone, Serialize)]
pub struct TrialReport {
    /// 1-based trial number.
    pub trial: usize,
    pub samples: usize,
    pub temperature: f64,
    pub choices: Vec<StageChoice>,
    pub outcome: TrialOutcome,
    /// Length of the reused stage prefix, 0 without a cache hit.
    pub cached_stages: usize,
    pub duration: Duration,
}

/// Summary of a sampling run.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingReport {
    pub run_name: String,
    pub trials: usize,
    pub new_configurations: usize,
    pub duplicates: usize,
    pub completed: usize,
    pub failed: usize,
    /// Highest-scoring succeeded configuration in the whole run history.
    pub best: Option<Configuration>,
    pub score_range: f64,
    pub total_duration: Duration,
    pub average_duration: Duration,
}

impl SamplingReport {
    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|c| c.score)
    }
}

/// Sampler errors. All of them end the sampling run.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("Invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Drives trials over a workflow, one at a time.
pub struct Sampler<S, E> {
    workflow: Workflow,
    store: S,
    executor: E,
    use_cache: bool,
    rng: StdRng,
}

impl<E: PipelineExecutor> Sampler<SqliteStore, E> {
    /// Open the configured database and build the configured workflow.
    pub fn from_config(config: &SamplerConfig, executor: E) -> Result<Self, SamplerError> {
        let workflow = config.build_workflow()?;
        let store = SqliteStore::open(
            &config.database,
            &config.run_name,
            RetryPolicy::from(&config.retry),
        )?;
        Self::new(workflow, store, executor, &config.sampling)
    }
}

impl<S: ScoreStore, E: PipelineExecutor> Sampler<S, E> {
    /// Create a sampler and register the workflow with the store.
    pub fn new(
        workflow: Workflow,
        mut store: S,
        executor: E,
        sampling: &SamplingConfig,
    ) -> Result<Self, SamplerError> {
        store.prepare_run(workflow.len())?;
        for stage in workflow.stages() {
            for group in stage.groups() {
                store.create_edge_group(&group.name, &group.parameter_names())?;
            }
        }

        let seed = sampling.random_seed.unwrap_or_else(rand::random);
        debug!("Sampler seed: {}", seed);
        info!(
            "Created sampler for run '{}': {} stages, {} possible configurations",
            store.run_name(),
            workflow.len(),
            workflow.possibilities()
        );

        Ok(Self {
            workflow,
            store,
            executor,
            use_cache: sampling.use_cache,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Run one trial at `temperature`.
    pub fn trial(&mut self, trial: usize, samples: usize) -> Result<TrialReport, SamplerError> {
        let start = Instant::now();
        let temperature = trial as f64 / samples.max(1) as f64;
        info!("Started sample run {} (temperature {:.3})", trial, temperature);

        let mut edges = Vec::with_capacity(self.workflow.len());
        let mut choices: Vec<StageChoice> = Vec::with_capacity(self.workflow.len());
        for stage in self.workflow.stages() {
            let edge = select_edge(&mut self.store, stage, &choices, temperature, &mut self.rng)?;
            choices.push(edge.choice());
            edges.push(edge);
        }

        let mut cached_stages = 0;
        let outcome = if let Some(existing) = self.store.contains_subset(&choices, true)? {
            let score = self.store.score_for_config(existing)?;
            self.store.record_sample(existing, score)?;
            info!("Configuration already sampled as {}", existing);
            TrialOutcome::Duplicate {
                config_id: existing,
                score,
            }
        } else {
            let config_id = self.store.add_configuration(&choices)?;
            let cached = if self.use_cache {
                self.longest_cached_prefix(&choices)?
            } else {
                None
            };
            if let Some((_, len)) = cached {
                cached_stages = len;
            }

            let request = ExecutionRequest {
                config_id,
                edges,
                cached: cached.map(|(id, _)| id),
                last_common_stage: cached_stages,
            };
            self.execute(request)?
        };

        let duration = start.elapsed();
        info!(
            "Executing configuration {} took {:.3}s",
            outcome.config_id(),
            duration.as_secs_f64()
        );

        Ok(TrialReport {
            trial,
            samples,
            temperature,
            choices,
            outcome,
            cached_stages,
            duration,
        })
    }

    fn execute(&mut self, request: ExecutionRequest) -> Result<TrialOutcome, SamplerError> {
        let config_id = request.config_id;
        match self.executor.execute(&request, &mut self.store) {
            Ok(()) => {
                let score = self.store.score_for_config(config_id)?;
                if score.is_none() {
                    warn!("Configuration {} completed without a score", config_id);
                }
                self.store.record_sample(config_id, score)?;
                Ok(TrialOutcome::Completed { config_id, score })
            }
            Err(ExecutionError::StageFailed { stage, reason }) => {
                // Stages are 1-based; a stage 0 report is stored as stage 1.
                let stage = stage.max(1);
                warn!(
                    "Walking configuration {} failed at stage {}: {}",
                    config_id, stage, reason
                );
                self.store.fail_configuration(config_id, stage)?;
                Ok(TrialOutcome::Failed {
                    config_id,
                    stage,
                    reason,
                })
            }
            Err(ExecutionError::Store(err)) => Err(err.into()),
        }
    }

    /// Longest stage prefix shared with a succeeded configuration.
    ///
    /// Scanning stops at the first prefix length without a match, since
    /// every longer prefix is more specific.
    fn longest_cached_prefix(
        &mut self,
        choices: &[StageChoice],
    ) -> Result<Option<(ConfigId, usize)>, StoreError> {
        let mut best = None;
        for len in 1..=choices.len() {
            match self.store.contains_subset(&choices[..len], false)? {
                Some(id) => {
                    debug!("Cached configuration {} shares {} stages", id, len);
                    best = Some((id, len));
                }
                None => {
                    debug!("Stopped cache scan at prefix length {}", len);
                    break;
                }
            }
        }
        Ok(best)
    }

    /// Run `samples` trials with progress callback.
    pub fn run_with_callback<F>(
        &mut self,
        samples: usize,
        mut callback: F,
    ) -> Result<SamplingReport, SamplerError>
    where
        F: FnMut(&TrialReport),
    {
        let start = Instant::now();
        let (mut duplicates, mut completed, mut failed) = (0, 0, 0);

        for trial in 1..=samples {
            let report = self.trial(trial, samples)?;
            match report.outcome {
                TrialOutcome::Duplicate { .. } => duplicates += 1,
                TrialOutcome::Completed { .. } => completed += 1,
                TrialOutcome::Failed { .. } => failed += 1,
            }
            callback(&report);
        }

        let total_duration = start.elapsed();
        let average_duration = if samples > 0 {
            total_duration / samples as u32
        } else {
            Duration::ZERO
        };
        info!(
            "Finished sampling after {} rounds, average time {:.3}s",
            samples,
            average_duration.as_secs_f64()
        );

        Ok(SamplingReport {
            run_name: self.store.run_name().to_string(),
            trials: samples,
            new_configurations: completed + failed,
            duplicates,
            completed,
            failed,
            best: self.store.best_configuration()?,
            score_range: self.store.score_range()?,
            total_duration,
            average_duration,
        })
    }

    /// Run `samples` trials.
    pub fn sample(&mut self, samples: usize) -> Result<SamplingReport, SamplerError> {
        self.run_with_callback(samples, |_| {})
    }
}
