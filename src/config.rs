use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "kyber-hil",
    version,
    about = "Test Kyber mesh networking on 2 T-Deck devices"
)]
pub struct Cli {
    /// Echo every serial line as it arrives
    #[clap(short, long)]
    pub verbose: bool,

    /// Skip firmware flashing
    #[clap(long)]
    pub skip_flash: bool,

    /// Monitoring duration in seconds
    #[clap(long)]
    pub test_duration: Option<u64>,

    /// Path to an optional configuration file
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Override the report file path
    #[clap(long)]
    pub report: Option<PathBuf>,

    /// Also write the report as JSON to this path
    #[clap(long)]
    pub json_report: Option<PathBuf>,

    /// Check the flashing tool and attached devices, then exit
    #[clap(long, conflicts_with = "flash_only")]
    pub preflight: bool,

    /// Flash both devices, then exit
    #[clap(long, conflicts_with = "skip_flash")]
    pub flash_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub flash: FlashConfig,
    pub monitor: MonitorConfig,
    pub verdict: VerdictConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Case-insensitive substrings matched against port descriptions
    pub keywords: Vec<String>,
    pub device_prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            keywords: ["cp210", "esp32", "serial", "usb"]
                .into_iter()
                .map(String::from)
                .collect(),
            device_prefix: "T-Deck".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub program: String,
    /// `{port}` and `{env}` are substituted per device
    pub args: Vec<String>,
    pub project_dir: PathBuf,
    pub environment: String,
    pub timeout_secs: u64,
    pub settle_secs: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            program: "platformio".to_string(),
            args: ["run", "--target", "upload", "--upload-port", "{port}", "-e", "{env}"]
                .into_iter()
                .map(String::from)
                .collect(),
            project_dir: PathBuf::from("meshtastic"),
            environment: "t-deck-tft".to_string(),
            timeout_secs: 300,
            settle_secs: 10,
        }
    }
}

impl FlashConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn args_for(&self, port: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", port).replace("{env}", &self.environment))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub baud_rate: u32,
    pub duration_secs: u64,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub grace_secs: u64,
    pub join_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            duration_secs: 90,
            read_timeout_ms: 1000,
            poll_interval_ms: 1000,
            grace_secs: 5,
            join_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerdictConfig {
    /// A device passes the error criterion with strictly fewer errors than this
    pub error_threshold: u32,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self { error_threshold: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub path: PathBuf,
    pub json_path: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kyber_t_deck_test_report.txt"),
            json_path: None,
        }
    }
}

/// One week; longer monitoring windows are treated as typos.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match cli.config {
        Some(ref path) => {
            let config_content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&config_content).context("Failed to parse config file")?
        }
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(duration) = cli.test_duration {
        config.monitor.duration_secs = duration;
    }

    if let Some(ref report) = cli.report {
        config.report.path = report.clone();
    }

    if let Some(ref json_report) = cli.json_report {
        config.report.json_path = Some(json_report.clone());
    }

    if config.discovery.keywords.is_empty() {
        anyhow::bail!("discovery.keywords must not be empty");
    }

    if config.monitor.duration_secs > MAX_DURATION_SECS {
        anyhow::bail!(
            "monitor duration of {}s exceeds the {}s limit",
            config.monitor.duration_secs,
            MAX_DURATION_SECS
        );
    }

    Ok(config)
}
