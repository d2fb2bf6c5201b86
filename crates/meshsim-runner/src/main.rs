//! # meshsim
//!
//! CLI entry point for the MeshSim mesh network simulator.
//!
//! Exit codes: 0 on success (including `--help`, `--version` and a clean
//! `--validate-only`), 1 on argument or runtime errors, 2 on scenario
//! validation failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use meshsim_runner::Simulation;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// CLI Configuration
// ============================================================================

/// Progress display modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UiMode {
    /// No periodic output between start and summary.
    None,
    /// One status line roughly every five seconds.
    Terminal,
}

fn parse_log_level(value: &str) -> Result<String, String> {
    match value.to_uppercase().as_str() {
        "DEBUG" => Ok("debug".to_string()),
        "INFO" => Ok("info".to_string()),
        "WARN" => Ok("warn".to_string()),
        "ERROR" => Ok("error".to_string()),
        other => Err(format!(
            "invalid log level '{}', expected DEBUG, INFO, WARN or ERROR",
            other
        )),
    }
}

/// MeshSim - deterministic mesh network simulator
#[derive(Parser, Debug)]
#[command(name = "meshsim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the YAML scenario file
    #[arg(long)]
    config: PathBuf,

    /// Override the simulation duration in seconds
    #[arg(long)]
    duration: Option<u32>,

    /// Logging level (DEBUG, INFO, WARN, ERROR)
    #[arg(long, default_value = "INFO", value_parser = parse_log_level)]
    log_level: String,

    /// Output directory for metric exports
    #[arg(long, default_value = "results/")]
    output: PathBuf,

    /// Progress display mode
    #[arg(long, value_enum, default_value = "none")]
    ui: UiMode,

    /// Validate the scenario and exit
    #[arg(long)]
    validate_only: bool,

    /// Override the time scale multiplier (> 0)
    #[arg(long)]
    time_scale: Option<f32>,
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            use clap::error::ErrorKind;
            let code = match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = error.print();
            std::process::exit(code);
        }
    };

    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if let Some(time_scale) = cli.time_scale {
        if time_scale <= 0.0 {
            eprintln!("Error: --time-scale must be positive");
            return 1;
        }
    }

    let mut scenario = match meshsim_scenario::load_from_file(&cli.config) {
        Ok(scenario) => scenario,
        Err(error) => {
            eprintln!("Error: {}", error);
            return 1;
        }
    };

    if let Some(duration) = cli.duration {
        eprintln!("Overriding duration: {} seconds", duration);
        scenario.simulation.duration_s = duration;
    }
    if let Some(time_scale) = cli.time_scale {
        eprintln!("Overriding time scale: {}x", time_scale);
        scenario.simulation.time_scale = time_scale;
    }

    let errors = scenario.validation_errors();
    if !errors.is_empty() {
        eprintln!(
            "Configuration validation failed with {} error(s):",
            errors.len()
        );
        for error in &errors {
            eprintln!("  - {}: {}", error.field, error.message);
            if !error.suggestion.is_empty() {
                eprintln!("    suggestion: {}", error.suggestion);
            }
        }
        return 2;
    }

    if cli.validate_only {
        println!(
            "Configuration OK: {} ({} nodes, {} events)",
            scenario.simulation.name,
            scenario.nodes.len(),
            scenario.events.len()
        );
        return 0;
    }

    let name = scenario.simulation.name.clone();
    let duration_s = scenario.simulation.duration_s;
    let time_scale = scenario.simulation.time_scale;

    let mut simulation = match Simulation::build(scenario) {
        Ok(simulation) => simulation,
        Err(error) => {
            eprintln!("Error: {}", error);
            return 1;
        }
    };

    eprintln!("=== MeshSim ===");
    eprintln!("Scenario: {}", name);
    eprintln!(
        "Duration: {}",
        if duration_s > 0 {
            format!("{} seconds", duration_s)
        } else {
            "infinite (Ctrl+C to stop)".to_string()
        }
    );
    eprintln!("Time scale: {}x", time_scale);
    eprintln!("Seed: {}", simulation.seed());

    let stop_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = stop_flag.clone();
    if let Err(error) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    }) {
        eprintln!("Error: could not install signal handler: {}", error);
        return 1;
    }

    let ui = cli.ui;
    let result = simulation.run(stop_flag, |sim, now| {
        if ui == UiMode::Terminal {
            eprintln!(
                "[{:7.1}s] {} nodes | {} in flight | {} events pending",
                now.as_secs_f64(),
                sim.manager().node_count(),
                sim.net().pending_count(),
                sim.pending_events(),
            );
        }
    });

    match result {
        Ok(stats) => {
            let report = simulation.report(stats.clone());
            if let Err(error) = simulation.write_exports(&report, &cli.output) {
                eprintln!("Error: {}", error);
                return 1;
            }
            match serde_json::to_string_pretty(&stats) {
                Ok(json) => println!("{}", json),
                Err(error) => {
                    eprintln!("Error: {}", error);
                    return 1;
                }
            }
            0
        }
        Err(error) => {
            eprintln!("Error: {}", error);
            1
        }
    }
}
