//! CLI entrypoint for the kestrel scenario harness.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kestrel_harness::scenarios::{self, Scenario, ScenarioConfig};
use kestrel_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, validate_log_file,
};

/// Runs runtime scenarios and records the results as JSONL.
#[derive(Debug, Parser)]
#[command(name = "kestrel-harness")]
#[command(about = "Scenario harness for the kestrel runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// JSONL log path (stdout-only summary if omitted).
    #[arg(long)]
    log: Option<PathBuf>,
    /// Artifact index path; requires --log.
    #[arg(long, requires = "log")]
    artifact_index: Option<PathBuf>,
    /// Run identifier used in trace ids.
    #[arg(long, default_value = "local")]
    run_id: String,
    /// Threads per scenario.
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Iterations per thread where a scenario loops.
    #[arg(long, default_value_t = 200)]
    rounds: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Contended increments under one mutex.
    MutexStress(RunArgs),
    /// Queued waiters must be granted in arrival order.
    MutexFifo(RunArgs),
    /// Broadcast wakes every blocked waiter.
    Condvar(RunArgs),
    /// Join before and after exit, and the reaped-thread error.
    Join(RunArgs),
    /// Lost replies roll back, delivered ones stand.
    Rollback(RunArgs),
    /// Broadcast delivery across several clients.
    Sysmsg(RunArgs),
    /// Every scenario in turn.
    All(RunArgs),
    /// Check a JSONL log against the record schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (selected, args): (Vec<Scenario>, RunArgs) = match cli.command {
        Command::MutexStress(args) => (vec![Scenario::MutexStress], args),
        Command::MutexFifo(args) => (vec![Scenario::MutexFifo], args),
        Command::Condvar(args) => (vec![Scenario::Condvar], args),
        Command::Join(args) => (vec![Scenario::Join], args),
        Command::Rollback(args) => (vec![Scenario::Rollback], args),
        Command::Sysmsg(args) => (vec![Scenario::Sysmsg], args),
        Command::All(args) => (Scenario::ALL.to_vec(), args),
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            eprintln!("{lines} lines, {} errors", errors.len());
            if !errors.is_empty() {
                std::process::exit(1);
            }
            return Ok(());
        }
    };

    let mut emitter = match &args.log {
        Some(path) => LogEmitter::to_file(path, &args.run_id)?,
        None => LogEmitter::to_buffer(&args.run_id),
    };
    let config = ScenarioConfig {
        threads: args.threads.max(1),
        rounds: args.rounds.max(1),
    };

    let mut failures = 0usize;
    for scenario in selected {
        emitter.emit(LogEntry::new("", LogLevel::Info, "scenario_start").with_scenario(scenario.name()))?;
        let entry = match scenarios::run(scenario, config) {
            Ok(report) => {
                eprintln!("[{}] pass in {} ms", report.scenario, report.duration_ms);
                LogEntry::new("", LogLevel::Info, "scenario_end")
                    .with_outcome(Outcome::Pass)
                    .with_duration_ms(report.duration_ms)
                    .with_counters(report.counters)
                    .with_details(report.details)
            }
            Err(e) => {
                failures += 1;
                eprintln!("[{}] FAIL: {e}", scenario.name());
                LogEntry::new("", LogLevel::Error, "scenario_end")
                    .with_outcome(Outcome::Fail)
                    .with_details(serde_json::json!({ "error": e.to_string() }))
            }
        };
        emitter.emit(entry.with_scenario(scenario.name()))?;
    }
    emitter.flush()?;

    if let (Some(log), Some(index_path)) = (&args.log, &args.artifact_index) {
        let mut index = ArtifactIndex::new(&args.run_id);
        index.add_file(log, "log")?;
        std::fs::write(index_path, index.to_json()?)?;
        eprintln!("Wrote artifact index to {}", index_path.display());
    }

    if failures > 0 {
        eprintln!("{failures} scenario(s) failed");
        std::process::exit(1);
    }
    Ok(())
}
