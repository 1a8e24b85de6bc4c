mod config;
mod device_locator;
mod error;
mod flash_orchestrator;
mod harness;
mod log_analyzer;
mod preflight;
mod report;
mod serial_monitor;
mod types;
mod verdict;

use anyhow::{Context, Result};
use clap::Parser;
use device_locator::SystemPorts;
use error::HarnessError;
use harness::RunOptions;
use log::{error, info, warn, LevelFilter};
use serial_monitor::SerialOpener;
use simple_logger::SimpleLogger;
use std::process::ExitCode;
use std::sync::Arc;

async fn run(cli: &config::Cli, config: &config::Config) -> Result<bool> {
    if cli.preflight {
        info!("Running T-Deck hardware preflight check");
        return Ok(preflight::check(config, &SystemPorts).await.ready());
    }

    if cli.flash_only {
        let result = harness::flash_only(config, &SystemPorts)
            .await
            .context("Flash-only run failed")?;
        return Ok(result.all_succeeded());
    }

    let options = RunOptions {
        verbose: cli.verbose,
        skip_flash: cli.skip_flash,
    };
    let report = harness::run(config, options, &SystemPorts, Arc::new(SerialOpener))
        .await
        .context("Test run failed")?;

    Ok(report.overall)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = config::Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .with_module_level("kyber_hil", level)
        .env()
        .init()
    {
        eprintln!("Failed to initialise logging: {}", e);
    }

    let config = match config::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = run(&cli, &config) => match result {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("{}", HarnessError::UserInterrupt);
            ExitCode::FAILURE
        }
    }
}
