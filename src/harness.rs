use crate::config::Config;
use crate::device_locator::{self, PortEnumerator};
use crate::error::HarnessError;
use crate::flash_orchestrator::{self, FlashResult};
use crate::log_analyzer::{AnalysisResult, Category, LogAnalyzer};
use crate::report::{self, TestReport};
use crate::serial_monitor::{self, EndpointOpener, MonitorSettings};
use crate::types::Device;
use crate::verdict::{self, Verdict};
use log::{info, warn};
use std::sync::Arc;
use tokio::fs;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub verbose: bool,
    pub skip_flash: bool,
}

fn discover(config: &Config, enumerator: &dyn PortEnumerator) -> Result<Vec<Device>, HarnessError> {
    device_locator::discover(
        enumerator,
        &config.discovery.keywords,
        &config.discovery.device_prefix,
    )
}

/// Discovers both devices and flashes them, nothing else.
pub async fn flash_only(
    config: &Config,
    enumerator: &dyn PortEnumerator,
) -> Result<FlashResult, HarnessError> {
    let devices = discover(config, enumerator)?;
    let result = flash_orchestrator::flash_all(&devices, &config.flash).await;
    for device in &devices {
        let status = match result.succeeded(&device.name) {
            Some(true) => "flashed",
            Some(false) => "flash failed",
            None => "not attempted",
        };
        info!("{} ({}): {}", device.name, device.port, status);
    }
    Ok(result)
}

fn log_analysis(analysis: &AnalysisResult, verdict: &Verdict) {
    info!("=== MESH COMMUNICATION TEST RESULTS ===");
    for (device, metrics) in analysis.devices() {
        info!("{}:", device);
        for category in Category::ALL {
            info!("  {}: {}", category.label(), metrics.metric(category));
        }
    }

    info!("=== SUCCESS CRITERIA ===");
    for criterion in verdict.criteria.keys() {
        info!(
            "  {}: {}",
            criterion.name(),
            if verdict.passed(*criterion) { "PASS" } else { "FAIL" }
        );
    }
}

/// One complete run: discover, flash, monitor, analyze, decide, report.
///
/// Only a discovery failure or an unwritable report aborts the run; every
/// per-device failure ends up inside the returned report.
pub async fn run<O: EndpointOpener>(
    config: &Config,
    options: RunOptions,
    enumerator: &dyn PortEnumerator,
    opener: Arc<O>,
) -> Result<TestReport, HarnessError> {
    info!("Starting Kyber T-Deck Test Suite...");

    let devices = discover(config, enumerator)?;
    let analyzer = LogAnalyzer::new()?;

    let flash = if options.skip_flash {
        info!("Skipping firmware flashing");
        FlashResult::default()
    } else {
        info!("=== FIRMWARE FLASHING ===");
        let result = flash_orchestrator::flash_all(&devices, &config.flash).await;
        if !result.all_succeeded() {
            warn!("Continuing with mesh test even though some flashing failed");
        }
        result
    };

    info!("=== MESH COMMUNICATION TEST ===");
    let settings = MonitorSettings::from_config(&config.monitor, options.verbose);
    let collection = serial_monitor::collect(&devices, opener, &settings).await;

    let analysis = analyzer.analyze(&collection.logs);
    let verdict = verdict::decide(&analysis, config.verdict.error_threshold);
    log_analysis(&analysis, &verdict);

    let report = TestReport::new(
        devices,
        flash,
        &analysis,
        collection.endpoint_failures,
        verdict,
    );
    let text = report::render(&report);

    fs::write(&config.report.path, &text).await?;
    info!("{}", text);
    info!("Test report saved to: {}", config.report.path.display());

    if let Some(ref json_path) = config.report.json_path {
        let json = report.to_json()?;
        fs::write(json_path, json).await?;
        info!("JSON report saved to: {}", json_path.display());
    }

    Ok(report)
}
