//! Pattern extraction over collected serial logs.
//!
//! Each line is lowercased and matched against a fixed set of patterns that
//! denote Kyber protocol milestones. Milestones are flags that can only be
//! set; everything else is a per-line counter.

use crate::error::HarnessError;
use crate::types::{DeviceLog, DeviceLogs};
use bitflags::bitflags;
use regex::RegexSet;
use serde::Serialize;
use std::collections::BTreeMap;

bitflags! {
    /// Protocol milestones observed on a device.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Milestones: u8 {
        const KYBER_INIT = 1 << 0;
        const KEYGEN = 1 << 1;
        const QUANTUM_SECURITY = 1 << 2;
    }
}

/// Recognized line patterns, in `RegexSet` index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern {
    KyberInit,
    KeyGeneration,
    KeyExchangeStart,
    KeyChunk,
    SessionEstablished,
    QuantumSecurity,
    MeshPacket,
    Error,
}

const PATTERNS: [(Pattern, &str); 8] = [
    (Pattern::KyberInit, r"kyber.*initialized|kybercryptoengine.*created"),
    (Pattern::KeyGeneration, r"kyber keypair generated|generatekeypair.*success"),
    (
        Pattern::KeyExchangeStart,
        r"initiating kyber key exchange|kyber_msg_key_exchange_request",
    ),
    (Pattern::KeyChunk, r"kyber.*chunk|kyber_msg_key_chunk"),
    (
        Pattern::SessionEstablished,
        r"kyber session established|quantum security.*active",
    ),
    (Pattern::QuantumSecurity, r"quantum.{0,20}security.{0,20}(active|enabled)"),
    (Pattern::MeshPacket, r"packet.*received|packet.*sent|mesh.*message"),
    (Pattern::Error, r"error|fail"),
];

/// Analyzer output categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    InitDetected,
    KeygenDetected,
    ExchangeAttemptCount,
    KeyChunkCount,
    SessionsEstablishedCount,
    QuantumSecurityActive,
    MeshPacketCount,
    ErrorCount,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::InitDetected,
        Category::KeygenDetected,
        Category::ExchangeAttemptCount,
        Category::KeyChunkCount,
        Category::SessionsEstablishedCount,
        Category::QuantumSecurityActive,
        Category::MeshPacketCount,
        Category::ErrorCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::InitDetected => "init-detected",
            Category::KeygenDetected => "keygen-detected",
            Category::ExchangeAttemptCount => "exchange-attempt-count",
            Category::KeyChunkCount => "key-chunk-count",
            Category::SessionsEstablishedCount => "sessions-established-count",
            Category::QuantumSecurityActive => "quantum-security-active",
            Category::MeshPacketCount => "mesh-packet-count",
            Category::ErrorCount => "error-count",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::InitDetected => "Kyber Initialized",
            Category::KeygenDetected => "Key Generation",
            Category::ExchangeAttemptCount => "Key Exchange Attempts",
            Category::KeyChunkCount => "Key Chunks",
            Category::SessionsEstablishedCount => "Sessions Established",
            Category::QuantumSecurityActive => "Quantum Security",
            Category::MeshPacketCount => "Mesh Packets",
            Category::ErrorCount => "Errors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Metric {
    Flag(bool),
    Count(u32),
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Flag(flag) => write!(f, "{}", flag),
            Metric::Count(count) => write!(f, "{}", count),
        }
    }
}

/// Everything the analyzer learned about one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMetrics {
    pub milestones: Milestones,
    pub exchange_attempts: u32,
    pub key_chunks: u32,
    pub sessions_established: u32,
    pub mesh_packets: u32,
    pub errors: u32,
}

impl DeviceMetrics {
    /// Folds `other` in. Milestones are OR-ed, so a flag never clears.
    pub fn merge(&mut self, other: &DeviceMetrics) {
        self.milestones |= other.milestones;
        self.exchange_attempts += other.exchange_attempts;
        self.key_chunks += other.key_chunks;
        self.sessions_established += other.sessions_established;
        self.mesh_packets += other.mesh_packets;
        self.errors += other.errors;
    }

    pub fn metric(&self, category: Category) -> Metric {
        match category {
            Category::InitDetected => Metric::Flag(self.milestones.contains(Milestones::KYBER_INIT)),
            Category::KeygenDetected => Metric::Flag(self.milestones.contains(Milestones::KEYGEN)),
            Category::QuantumSecurityActive => {
                Metric::Flag(self.milestones.contains(Milestones::QUANTUM_SECURITY))
            }
            Category::ExchangeAttemptCount => Metric::Count(self.exchange_attempts),
            Category::KeyChunkCount => Metric::Count(self.key_chunks),
            Category::SessionsEstablishedCount => Metric::Count(self.sessions_established),
            Category::MeshPacketCount => Metric::Count(self.mesh_packets),
            Category::ErrorCount => Metric::Count(self.errors),
        }
    }
}

/// Per-device metrics for every analyzed device.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    devices: BTreeMap<String, DeviceMetrics>,
}

impl AnalysisResult {
    #[cfg(test)]
    pub fn device(&self, name: &str) -> Option<&DeviceMetrics> {
        self.devices.get(name)
    }

    pub fn devices(&self) -> impl Iterator<Item = (&str, &DeviceMetrics)> {
        self.devices.iter().map(|(name, metrics)| (name.as_str(), metrics))
    }

    #[cfg(test)]
    pub fn metric(&self, category: Category, device: &str) -> Option<Metric> {
        self.device(device).map(|m| m.metric(category))
    }

    /// Device name to metric for one category.
    pub fn category(&self, category: Category) -> BTreeMap<&str, Metric> {
        self.devices()
            .map(|(name, metrics)| (name, metrics.metric(category)))
            .collect()
    }

    /// Category name to device name to metric.
    pub fn by_category(&self) -> BTreeMap<&'static str, BTreeMap<&str, Metric>> {
        Category::ALL
            .iter()
            .map(|&category| (category.name(), self.category(category)))
            .collect()
    }
}

pub struct LogAnalyzer {
    patterns: RegexSet,
}

impl LogAnalyzer {
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self {
            patterns: RegexSet::new(PATTERNS.iter().map(|(_, regex)| *regex))?,
        })
    }

    /// Metrics contributed by a single line.
    pub fn scan_line(&self, line: &str) -> DeviceMetrics {
        let mut metrics = DeviceMetrics::default();

        for index in self.patterns.matches(&line.to_lowercase()).iter() {
            match PATTERNS[index].0 {
                Pattern::KyberInit => metrics.milestones |= Milestones::KYBER_INIT,
                Pattern::KeyGeneration => metrics.milestones |= Milestones::KEYGEN,
                Pattern::QuantumSecurity => metrics.milestones |= Milestones::QUANTUM_SECURITY,
                Pattern::KeyExchangeStart => metrics.exchange_attempts += 1,
                Pattern::KeyChunk => metrics.key_chunks += 1,
                Pattern::SessionEstablished => metrics.sessions_established += 1,
                Pattern::MeshPacket => metrics.mesh_packets += 1,
                Pattern::Error => metrics.errors += 1,
            }
        }

        metrics
    }

    pub fn scan_log(&self, log: &DeviceLog) -> DeviceMetrics {
        log.events()
            .iter()
            .fold(DeviceMetrics::default(), |mut acc, event| {
                acc.merge(&self.scan_line(&event.raw_line));
                acc
            })
    }

    /// Every device in `logs` gets an entry, empty logs included.
    pub fn analyze(&self, logs: &DeviceLogs) -> AnalysisResult {
        AnalysisResult {
            devices: logs
                .iter()
                .map(|(name, log)| (name.clone(), self.scan_log(log)))
                .collect(),
        }
    }
}
