//! Command line entry point: parses arguments, ingests the input trees, runs
//! the build and writes the assembled YAML stream.

use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use helmbuild::build::{BuildOutcome, Orchestrator};
use helmbuild::chart::builder::ChartBuilder;
use helmbuild::cli::Cli;
use helmbuild::event::cancellation::CancellationBroadcast;
use helmbuild::ingest::ingest_paths;
use helmbuild::registry::provider::CliTokenExchanger;
use helmbuild::render::engine::HelmTemplateEngine;

const EXIT_BUILD_FAILURE: u8 = 1;
const EXIT_CONFIG_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = cli.logging_config().try_init() {
        eprintln!("could not initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG_FAILURE);
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(err)) => {
            error!("{err}");
            ExitCode::from(EXIT_CONFIG_FAILURE)
        }
        Err(RunError::Build(err)) => {
            error!("{err}");
            ExitCode::from(EXIT_BUILD_FAILURE)
        }
    }
}

enum RunError {
    Config(String),
    Build(String),
}

/// Separated from [main] so errors propagate with `?` and are logged once,
/// in string form, before the exit code is chosen.
fn run(cli: Cli) -> Result<(), RunError> {
    let store = ingest_paths(&cli.inputs)
        .map_err(|err| RunError::Config(format!("ingesting inputs: {err}")))?;
    info!(documents = store.len(), "inputs ingested");

    let config = cli.build_config();
    let store = Arc::new(store);
    let builder = ChartBuilder::new(
        store.clone(),
        Arc::new(CliTokenExchanger::default()),
        config.cache_dir.clone(),
    )
    .map_err(|err| RunError::Config(format!("preparing chart workspace: {err}")))?;

    let orchestrator = Orchestrator::new(
        store,
        Arc::new(HelmTemplateEngine::default()),
        Arc::new(builder),
        config,
    );
    create_shutdown_signal_handler(orchestrator.canceller())
        .map_err(|err| RunError::Config(format!("could not set signal handler: {err}")))?;

    let BuildOutcome { yaml, error } = orchestrator
        .run()
        .map_err(|err| RunError::Build(err.to_string()))?;

    write_output(&cli, &yaml)?;
    match error {
        Some(err) => Err(RunError::Build(err.to_string())),
        None => Ok(()),
    }
}

fn write_output(cli: &Cli, yaml: &str) -> Result<(), RunError> {
    match &cli.output {
        Some(path) => std::fs::write(path, yaml).map_err(|err| {
            RunError::Config(format!("writing output to `{}`: {err}", path.display()))
        }),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(yaml.as_bytes())
                .map_err(|err| RunError::Config(format!("writing output: {err}")))
        }
    }
}

/// Enables the typical keypress (Ctrl-C) to stop an in-flight build; workers
/// observe the cancellation between pipeline steps.
fn create_shutdown_signal_handler(
    canceller: CancellationBroadcast,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received SIGINT, canceling the build");
        canceller.cancel();
    })
}
