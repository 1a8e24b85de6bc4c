use crate::config::FlashConfig;
use crate::error::HarnessError;
use crate::types::Device;
use log::{error, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

const STDERR_TAIL_LINES: usize = 20;

/// What happened when the flashing tool ran for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashOutcome {
    /// `None` when the tool never exited (timeout) or could not be spawned
    pub exit_status: Option<i32>,
    pub timed_out: bool,
    pub stderr_tail: String,
}

impl FlashOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_status == Some(0)
    }

    /// The failure this outcome represents, if any.
    pub fn failure(&self, device: &Device, config: &FlashConfig) -> Option<HarnessError> {
        if self.timed_out {
            Some(HarnessError::FlashTimeout {
                device: device.name.clone(),
                timeout: config.timeout(),
            })
        } else if self.exit_status != Some(0) {
            Some(HarnessError::FlashFailure {
                device: device.name.clone(),
                status: self.exit_status,
                stderr_tail: self.stderr_tail.clone(),
            })
        } else {
            None
        }
    }
}

/// Flash outcome per device name. One entry per device.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FlashResult {
    outcomes: BTreeMap<String, FlashOutcome>,
}

impl FlashResult {
    pub fn record(&mut self, device: &Device, outcome: FlashOutcome) {
        self.outcomes.insert(device.name.clone(), outcome);
    }

    pub fn succeeded(&self, device_name: &str) -> Option<bool> {
        self.outcomes.get(device_name).map(FlashOutcome::succeeded)
    }

    /// Vacuously true when flashing was skipped.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(FlashOutcome::succeeded)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlashOutcome)> {
        self.outcomes.iter().map(|(name, outcome)| (name.as_str(), outcome))
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Runs the flashing tool against one device's port.
///
/// Never fails: spawn errors, non-zero exits and timeouts are all folded into
/// the returned outcome. A timed-out tool is killed when its future is dropped.
pub async fn flash(device: &Device, config: &FlashConfig) -> FlashOutcome {
    let args = config.args_for(&device.port);
    info!("Flashing {} on {}...", device.name, device.port);
    info!("Running: {} {}", config.program, args.join(" "));

    let child = Command::new(&config.program)
        .args(&args)
        .current_dir(&config.project_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return FlashOutcome {
                exit_status: None,
                timed_out: false,
                stderr_tail: format!("failed to start {}: {}", config.program, e),
            }
        }
    };

    match timeout(config.timeout(), child.wait_with_output()).await {
        Ok(Ok(output)) => FlashOutcome {
            exit_status: output.status.code(),
            timed_out: false,
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
        },
        Ok(Err(e)) => FlashOutcome {
            exit_status: None,
            timed_out: false,
            stderr_tail: format!("failed to wait for {}: {}", config.program, e),
        },
        Err(_) => FlashOutcome {
            exit_status: None,
            timed_out: true,
            stderr_tail: String::new(),
        },
    }
}

/// Flashes every device one after another, settling after each success.
pub async fn flash_all(devices: &[Device], config: &FlashConfig) -> FlashResult {
    let mut result = FlashResult::default();

    for device in devices {
        let outcome = flash(device, config).await;

        match outcome.failure(device, config) {
            None => {
                info!("{} flashed successfully", device.name);
                info!("Waiting {} seconds for {} to boot...", config.settle_secs, device.name);
                sleep(config.settle()).await;
            }
            Some(e) => error!("{}", e),
        }

        result.record(device, outcome);
    }

    if !result.all_succeeded() {
        error!("Firmware flashing failed for some devices");
    }

    result
}
