use std::process::ExitCode;

use clap::Parser;
use slog::{error, info, Logger};

use ruffle::{config, error::RuffleError, experiment, logging, post_processor};

/// Compress a simulated ruffle between floor and plate and record its
/// force-displacement curve
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Input json describing structure, material, solver and loading
    input_json: String,

    /// Output csv for the force-displacement curve
    #[arg(long, default_value = "curve.csv")]
    curve: String,

    /// Output csv for the final vertex positions
    #[arg(long, default_value = "nodes.csv")]
    nodes: String,

    /// Output csv for the final segment connectivity
    #[arg(long, default_value = "segments.csv")]
    segments: String,

    /// Log solver diagnostics
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args, logger: &Logger) -> Result<(), RuffleError> {
    let config = config::load(&args.input_json)?;
    let outcome = experiment::run(&config, logger)?;

    post_processor::curve_csv(&outcome.curve, &args.curve)?;
    post_processor::geometry_csv(&outcome.controller, &args.nodes, &args.segments)?;
    info!(logger, "wrote output";
        "curve" => &args.curve, "nodes" => &args.nodes, "segments" => &args.segments);

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let logger = logging::terminal(args.verbose);

    match run(&args, &logger) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(logger, "{}", err);
            ExitCode::FAILURE
        }
    }
}
