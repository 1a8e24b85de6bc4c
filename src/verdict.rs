use crate::log_analyzer::{AnalysisResult, Milestones};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    BothInit,
    BothKeygen,
    KeyExchanges,
    LowErrors,
}

impl Criterion {
    pub fn name(self) -> &'static str {
        match self {
            Criterion::BothInit => "both_init",
            Criterion::BothKeygen => "both_keygen",
            Criterion::KeyExchanges => "key_exchanges",
            Criterion::LowErrors => "low_errors",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub criteria: BTreeMap<Criterion, bool>,
    pub overall: bool,
}

impl Verdict {
    pub fn passed(&self, criterion: Criterion) -> bool {
        self.criteria.get(&criterion).copied().unwrap_or(false)
    }
}

/// Every criterion must hold; none compensates for another.
pub fn decide(analysis: &AnalysisResult, error_threshold: u32) -> Verdict {
    let all_have = |flag: Milestones| analysis.devices().all(|(_, m)| m.milestones.contains(flag));

    let total_exchanges: u32 = analysis.devices().map(|(_, m)| m.exchange_attempts).sum();

    let criteria = BTreeMap::from([
        (Criterion::BothInit, all_have(Milestones::KYBER_INIT)),
        (Criterion::BothKeygen, all_have(Milestones::KEYGEN)),
        (Criterion::KeyExchanges, total_exchanges > 0),
        (
            Criterion::LowErrors,
            analysis.devices().all(|(_, m)| m.errors < error_threshold),
        ),
    ]);
    let overall = criteria.values().all(|&passed| passed);

    Verdict { criteria, overall }
}
