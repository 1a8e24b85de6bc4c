use crate::config::Config;
use crate::device_locator::{candidates, Endpoint, PortEnumerator, REQUIRED_DEVICES};
use log::{error, info, warn};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct PreflightReport {
    /// First line of `<tool> --version`, if the tool answered
    pub tool_version: Option<String>,
    pub endpoints: Vec<Endpoint>,
}

impl PreflightReport {
    pub fn ready(&self) -> bool {
        self.tool_version.is_some() && self.endpoints.len() >= REQUIRED_DEVICES
    }
}

async fn tool_version(program: &str) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match timeout(VERSION_CHECK_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => Some(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
        ),
        Ok(Ok(output)) => {
            warn!("{} --version exited with {}", program, output.status);
            None
        }
        Ok(Err(e)) => {
            warn!("{} not found: {}", program, e);
            None
        }
        Err(_) => {
            warn!("{} --version did not answer within {:?}", program, VERSION_CHECK_TIMEOUT);
            None
        }
    }
}

/// Checks the flashing tool and the attached devices without touching either.
pub async fn check(config: &Config, enumerator: &dyn PortEnumerator) -> PreflightReport {
    let tool_version = tool_version(&config.flash.program).await;
    match tool_version {
        Some(ref version) => info!("Flashing tool: {}", version),
        None => error!("Flashing tool {} is not usable", config.flash.program),
    }

    let mut keywords = config.discovery.keywords.clone();
    if !keywords.iter().any(|k| k.eq_ignore_ascii_case("uart")) {
        keywords.push("uart".to_string());
    }

    let endpoints = match enumerator.endpoints() {
        Ok(endpoints) => candidates(endpoints, &keywords),
        Err(e) => {
            error!("Cannot enumerate serial ports: {}", e);
            Vec::new()
        }
    };

    if endpoints.is_empty() {
        warn!("No USB serial devices found");
    }
    for endpoint in &endpoints {
        info!("  {} - {}", endpoint.address, endpoint.description);
    }
    if endpoints.len() < REQUIRED_DEVICES {
        warn!("Need {} T-Deck devices for full testing, found {}", REQUIRED_DEVICES, endpoints.len());
    }

    let report = PreflightReport {
        tool_version,
        endpoints,
    };
    if report.ready() {
        info!("Ready for dual T-Deck testing");
    }
    report
}
