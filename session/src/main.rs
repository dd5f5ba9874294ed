//! Query surface for run sessions: inspect state, tail logs, check the lock,
//! request a stop, or delete a run. Read-mostly; only `stop` and `delete`
//! mutate anything, and neither touches a live run's document.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use session::exit_codes;
use session::io::liveness::SignalProbe;
use session::io::lock::{LockGuard, LockStatus};
use session::io::paths::SessionPaths;
use session::io::session_store::{delete_session, read_session};
use session::io::iteration_log::list_iterations;
use session::run::request_stop;

#[derive(Parser)]
#[command(
    name = "session",
    version,
    about = "Inspect and control iterative agent run sessions"
)]
struct Cli {
    /// Project base directory containing `.ralph/runs/`.
    #[arg(long, default_value = ".")]
    base: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current session document as JSON.
    Status { run_id: String },
    /// Print all iteration log entries as JSON.
    Logs { run_id: String },
    /// Report the lock as free, held, or stale.
    Lock { run_id: String },
    /// Ask the run to stop at its next iteration boundary.
    Stop { run_id: String },
    /// Remove the run's state, lock, and iteration logs.
    Delete { run_id: String },
}

fn main() -> ExitCode {
    session::logging::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(exit_codes::INVALID as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let paths = |run_id: &str| SessionPaths::new(&cli.base, run_id);
    match &cli.command {
        Command::Status { run_id } => {
            let paths = paths(run_id);
            match read_session(&paths.state_path)? {
                Some(state) => {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                    Ok(exit_codes::OK)
                }
                None => {
                    eprintln!("no session for run {run_id}");
                    Ok(exit_codes::ABSENT)
                }
            }
        }
        Command::Logs { run_id } => {
            let logs = list_iterations(&paths(run_id))?;
            println!("{}", serde_json::to_string_pretty(&logs)?);
            Ok(exit_codes::OK)
        }
        Command::Lock { run_id } => {
            let paths = paths(run_id);
            let lock = LockGuard::new(&paths.lock_path, run_id, SignalProbe);
            match lock.check()? {
                LockStatus::Free => {
                    println!("free");
                    Ok(exit_codes::OK)
                }
                LockStatus::Held(record) => {
                    println!("held by pid {}", record.pid);
                    Ok(exit_codes::ALREADY_RUNNING)
                }
                LockStatus::Stale(record) => {
                    println!("stale (last owner pid {})", record.pid);
                    Ok(exit_codes::OK)
                }
            }
        }
        Command::Stop { run_id } => {
            request_stop(&paths(run_id))?;
            println!("stop requested for run {run_id}");
            Ok(exit_codes::OK)
        }
        Command::Delete { run_id } => {
            delete_session(&paths(run_id))?;
            println!("deleted run {run_id}");
            Ok(exit_codes::OK)
        }
    }
}
