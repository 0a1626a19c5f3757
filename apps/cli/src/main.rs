//! kiln-train - train a plugin-composed model from a hypes file.
//!
//! ```text
//! kiln-train --hypes hypes/regression.json
//! kiln-train --continue RUNS/regression_2026_10_18_09.30
//! ```

mod commands;
mod config;

use clap::Parser;
use kiln_training::LogSink;
use kiln_training::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "kiln-train", author, version, about = "Train a plugin-composed model")]
struct Args {
    /// Path to the hypes JSON file
    #[arg(long)]
    hypes: Option<PathBuf>,

    /// Continue the run stored in this output directory
    #[arg(long = "continue", value_name = "DIR", conflicts_with = "hypes")]
    continue_dir: Option<PathBuf>,

    /// Resume from the latest checkpoint of the output directory, if there is one
    #[arg(long)]
    resume: bool,

    /// Prefix for the generated run name
    #[arg(long)]
    name: Option<String>,

    /// Group the run under RUNS/<project>
    #[arg(long)]
    project: Option<String>,

    /// Use a timestamped run name instead of `debug`
    #[arg(long)]
    save: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let sink = LogSink::new();
    if let Err(e) = logging::init(&args.log_level, logging::dev_mode_from_env(), sink.clone()) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let target = match (args.hypes, args.continue_dir) {
        (_, Some(dir)) => commands::train::Target::Continue(dir),
        (Some(path), None) => commands::train::Target::Hypes(path),
        (None, None) => {
            error!("No hypes are given.");
            error!("Usage: kiln-train --hypes hypes.json");
            return ExitCode::FAILURE;
        }
    };

    let command = commands::train::TrainCommand {
        target,
        resume: args.resume,
        name: args.name,
        project: args.project,
        save: args.save,
    };

    match commands::train::execute(command, &sink).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
