//! Built-in Rastrigin benchmark executor.
//!
//! Every stage command is a `;`-separated list of numbers. Each number `x`
//! contributes `30 - (x² - 10·cos(2πx))`, so the optimum sits at the origin
//! and higher scores are better.

use std::f64::consts::PI;

use log::trace;

use crate::store::ScoreStore;

use super::sampler::{ExecutionError, ExecutionRequest, PipelineExecutor};

/// Score contributed by a single coordinate.
pub fn rastrigin_term(x: f64) -> f64 {
    30.0 - (x * x - 10.0 * (2.0 * PI * x).cos())
}

/// Executor that evaluates the Rastrigin function from stage commands.
///
/// Produces no intermediate files, so the prefix cache is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RastriginExecutor;

impl RastriginExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Score of one stage command.
    pub fn stage_score(command: &str) -> Result<f64, String> {
        command
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<f64>()
                    .map(rastrigin_term)
                    .map_err(|e| format!("'{part}' is not a number: {e}"))
            })
            .sum()
    }
}

impl PipelineExecutor for RastriginExecutor {
    fn execute(
        &mut self,
        request: &ExecutionRequest,
        store: &mut dyn ScoreStore,
    ) -> Result<(), ExecutionError> {
        let mut score = 0.0;
        for (i, edge) in request.edges.iter().enumerate() {
            score += Self::stage_score(&edge.command)
                .map_err(|reason| ExecutionError::StageFailed { stage: i + 1, reason })?;
        }
        trace!("Configuration {} scored {}", request.config_id, score);
        store.update_configuration(request.config_id, score)?;
        Ok(())
    }
}
