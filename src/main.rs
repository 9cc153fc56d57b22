//! Workflow Walker CLI - Run the sampler from JSON configuration.
//!
//! Stage commands are evaluated by the built-in Rastrigin executor.

use std::path::PathBuf;
use std::process;

use workflow_walker::{
    schema::{ConfigError, SamplerConfig},
    search::{RastriginExecutor, Sampler, SamplerError, TrialOutcome},
};

/// Process exit codes.
const EXIT_UNKNOWN: i32 = 1;
const EXIT_INPUT: i32 = 4;
const EXIT_WORKFLOW: i32 = 7;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--example" {
        print_example_config();
        return;
    }

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [samples] [--no-cache]", args[0]);
        eprintln!();
        eprintln!("Sample workflow configurations from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to sampler configuration file");
        eprintln!("  samples      Number of trials (default: from config)");
        eprintln!("  --no-cache   Disable stage prefix reuse");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        process::exit(EXIT_INPUT);
    }

    let config_path = PathBuf::from(&args[1]);
    let mut config = SamplerConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        process::exit(match e {
            ConfigError::Workflow(_) => EXIT_WORKFLOW,
            _ => EXIT_INPUT,
        });
    });

    for arg in &args[2..] {
        if arg == "--no-cache" {
            config.sampling.use_cache = false;
        } else if let Ok(samples) = arg.parse::<usize>() {
            config.sampling.samples = samples.max(1);
        } else {
            eprintln!("Unknown argument: {}", arg);
            process::exit(EXIT_INPUT);
        }
    }

    println!("Workflow Walker");
    println!("===============");
    println!("Run: {}", config.run_name);
    println!("Database: {}", config.database.display());
    println!("Stages: {}", config.workflow.stages.len());
    println!("Samples: {}", config.sampling.samples);
    println!("Cache: {}", if config.sampling.use_cache { "on" } else { "off" });
    println!();

    let mut sampler =
        Sampler::from_config(&config, RastriginExecutor::new()).unwrap_or_else(|e| fail(e));

    let samples = config.sampling.samples;
    let report = sampler
        .run_with_callback(samples, |trial| {
            let status = match &trial.outcome {
                TrialOutcome::Completed { score, .. } => match score {
                    Some(score) => format!("score={:.4}", score),
                    None => "no score".to_string(),
                },
                TrialOutcome::Duplicate { .. } => "duplicate".to_string(),
                TrialOutcome::Failed { stage, .. } => format!("failed at stage {}", stage),
            };
            if trial.trial % (samples / 10).max(1) == 0 {
                println!(
                    "  Trial {}/{}: config {} {} (t={:.2}, {:.1}ms)",
                    trial.trial,
                    trial.samples,
                    trial.outcome.config_id(),
                    status,
                    trial.temperature,
                    trial.duration.as_secs_f64() * 1000.0
                );
            }
        })
        .unwrap_or_else(|e| fail(e));

    println!();
    println!("Summary:");
    println!(
        "  Trials: {} ({} new, {} duplicates)",
        report.trials, report.new_configurations, report.duplicates
    );
    println!("  Completed: {}, failed: {}", report.completed, report.failed);
    println!("  Score range: {:.4}", report.score_range);
    if let Some(best) = &report.best {
        println!("  Best configuration: {} (score {:.4})", best.id, best.score);
        for (stage, choice) in best.choices.iter().enumerate() {
            println!("    Stage {}: {} #{}", stage, choice.group, choice.edge_id);
        }
    }
    println!(
        "Time: {:.2}s ({:.1}ms per trial)",
        report.total_duration.as_secs_f64(),
        report.average_duration.as_secs_f64() * 1000.0
    );
}

fn fail(err: SamplerError) -> ! {
    eprintln!("Error: {}", err);
    process::exit(match err {
        SamplerError::Workflow(_) => EXIT_WORKFLOW,
        SamplerError::Store(_) => EXIT_UNKNOWN,
    });
}

fn print_example_config() {
    let config = SamplerConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            process::exit(EXIT_UNKNOWN);
        }
    }
}
