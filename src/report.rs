use crate::flash_orchestrator::FlashResult;
use crate::log_analyzer::{AnalysisResult, Category, Metric};
use crate::types::Device;
use crate::verdict::Verdict;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Everything a finished run produced. Assembled once, then rendered.
#[derive(Debug, Serialize)]
pub struct TestReport {
    pub generated_at: DateTime<Local>,
    pub devices: Vec<Device>,
    /// Empty when flashing was skipped
    pub flash: FlashResult,
    pub analysis: BTreeMap<&'static str, BTreeMap<String, Metric>>,
    pub endpoint_failures: BTreeMap<String, String>,
    pub verdict: Verdict,
    pub overall: bool,
}

impl TestReport {
    pub fn new(
        devices: Vec<Device>,
        flash: FlashResult,
        analysis: &AnalysisResult,
        endpoint_failures: BTreeMap<String, String>,
        verdict: Verdict,
    ) -> Self {
        Self::at(Local::now(), devices, flash, analysis, endpoint_failures, verdict)
    }

    pub fn at(
        generated_at: DateTime<Local>,
        devices: Vec<Device>,
        flash: FlashResult,
        analysis: &AnalysisResult,
        endpoint_failures: BTreeMap<String, String>,
        verdict: Verdict,
    ) -> Self {
        let overall = flash.all_succeeded() && verdict.overall;
        let analysis = analysis
            .by_category()
            .into_iter()
            .map(|(category, values)| {
                let values = values
                    .into_iter()
                    .map(|(device, metric)| (device.to_string(), metric))
                    .collect();
                (category, values)
            })
            .collect();

        Self {
            generated_at,
            devices,
            flash,
            analysis,
            endpoint_failures,
            verdict,
            overall,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn status(passed: bool, pass: &str, fail: &str) -> String {
    if passed {
        format!("✅ {}", pass)
    } else {
        format!("❌ {}", fail)
    }
}

/// Human-readable rendering of a report.
pub fn render(report: &TestReport) -> String {
    let mut out = String::new();

    // Writing into a String cannot fail
    let _ = render_into(&mut out, report);
    out
}

fn render_into(out: &mut String, report: &TestReport) -> std::fmt::Result {
    writeln!(out, "KYBER T-DECK MESH NETWORKING TEST REPORT")?;
    writeln!(out, "{}", "=".repeat(50))?;
    writeln!(out, "Test Date: {}", report.generated_at.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "Devices Tested: {}", report.devices.len())?;
    for device in &report.devices {
        writeln!(out, "  {} on {}", device.name, device.port)?;
    }
    writeln!(out)?;

    writeln!(out, "FIRMWARE FLASHING RESULTS:")?;
    writeln!(out, "{}", "-".repeat(30))?;
    if report.flash.is_empty() {
        writeln!(out, "  (flashing skipped)")?;
    }
    for (device, outcome) in report.flash.iter() {
        let detail = if outcome.timed_out {
            " (timed out)".to_string()
        } else {
            match outcome.exit_status {
                Some(0) => String::new(),
                Some(code) => format!(" (exit status {})", code),
                None => format!(" ({})", outcome.stderr_tail),
            }
        };
        writeln!(
            out,
            "  {}: {}{}",
            device,
            status(outcome.succeeded(), "SUCCESS", "FAILED"),
            detail
        )?;
    }
    writeln!(out)?;

    writeln!(out, "MESH COMMUNICATION TEST:")?;
    writeln!(out, "{}", "-".repeat(30))?;
    for (device, reason) in &report.endpoint_failures {
        writeln!(out, "  {}: serial monitor failed: {}", device, reason)?;
    }
    for device in &report.devices {
        writeln!(out, "  {}:", device.name)?;
        for category in Category::ALL {
            if let Some(metric) = report
                .analysis
                .get(category.name())
                .and_then(|values| values.get(&device.name))
            {
                writeln!(out, "    {}: {}", category.label(), metric)?;
            }
        }
    }
    writeln!(out, "  Success Criteria:")?;
    for (criterion, passed) in &report.verdict.criteria {
        writeln!(out, "    {}: {}", criterion.name(), status(*passed, "PASS", "FAIL"))?;
    }
    writeln!(
        out,
        "  Overall Result: {}",
        status(report.verdict.overall, "SUCCESS", "FAILED")
    )?;
    writeln!(out)?;

    writeln!(out, "OVERALL TEST RESULT:")?;
    writeln!(out, "{}", "-".repeat(20))?;
    if report.overall {
        writeln!(out, "🎉 ALL TESTS PASSED!")?;
        write!(out, "Kyber quantum-resistant mesh networking is working correctly.")?;
    } else {
        writeln!(out, "❌ SOME TESTS FAILED!")?;
        write!(out, "Check individual test results above for details.")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash_orchestrator::FlashOutcome;
    use crate::log_analyzer::tests::logs;
    use crate::log_analyzer::LogAnalyzer;
    use crate::verdict::decide;
    use chrono::TimeZone;

    const HANDSHAKE: &[&str] = &[
        "KyberCryptoEngine created",
        "Kyber keypair generated",
        "KYBER_MSG_KEY_EXCHANGE_REQUEST sent",
    ];

    fn devices() -> Vec<Device> {
        vec![
            Device::new("T-Deck", "/dev/ttyA".to_string(), 0),
            Device::new("T-Deck", "/dev/ttyB".to_string(), 1),
        ]
    }

    fn outcome(exit_status: Option<i32>, timed_out: bool) -> FlashOutcome {
        FlashOutcome {
            exit_status,
            timed_out,
            stderr_tail: String::new(),
        }
    }

    fn report(flash: FlashResult, a: Vec<&str>, b: Vec<&str>) -> TestReport {
        let analysis = LogAnalyzer::new()
            .unwrap()
            .analyze(&logs(vec![("T-Deck-1", a), ("T-Deck-2", b)]));
        let verdict = decide(&analysis, 5);
        let when = Local.with_ymd_and_hms(2026, 10, 19, 14, 30, 0).unwrap();
        TestReport::at(when, devices(), flash, &analysis, BTreeMap::new(), verdict)
    }

    fn flashed(a: FlashOutcome, b: FlashOutcome) -> FlashResult {
        let devices = devices();
        let mut flash = FlashResult::default();
        flash.record(&devices[0], a);
        flash.record(&devices[1], b);
        flash
    }

    #[test]
    fn passing_run_renders_success() {
        let report = report(
            flashed(outcome(Some(0), false), outcome(Some(0), false)),
            HANDSHAKE.to_vec(),
            HANDSHAKE.to_vec(),
        );
        assert!(report.overall);

        let text = render(&report);
        assert!(text.starts_with("KYBER T-DECK MESH NETWORKING TEST REPORT\n"));
        assert!(text.contains("Test Date: 2026-10-19 14:30:00"));
        assert!(text.contains("Devices Tested: 2"));
        assert!(text.contains("  T-Deck-1: ✅ SUCCESS\n"));
        assert!(text.contains("    Key Exchange Attempts: 1"));
        assert!(text.contains("    both_init: ✅ PASS"));
        assert!(text.contains("  Overall Result: ✅ SUCCESS"));
        assert!(text.ends_with("Kyber quantum-resistant mesh networking is working correctly."));
    }

    #[test]
    fn flash_timeout_fails_run_despite_mesh_success() {
        let report = report(
            flashed(outcome(None, true), outcome(Some(0), false)),
            HANDSHAKE.to_vec(),
            HANDSHAKE.to_vec(),
        );
        assert!(report.verdict.overall);
        assert!(!report.overall);

        let text = render(&report);
        assert!(text.contains("  T-Deck-1: ❌ FAILED (timed out)"));
        assert!(text.contains("  T-Deck-2: ✅ SUCCESS"));
        assert!(text.contains("  Overall Result: ✅ SUCCESS"));
        assert!(text.contains("❌ SOME TESTS FAILED!"));
    }

    #[test]
    fn skipped_flash_does_not_fail_run() {
        let report = report(FlashResult::default(), HANDSHAKE.to_vec(), HANDSHAKE.to_vec());
        assert!(report.overall);
        assert!(render(&report).contains("(flashing skipped)"));
    }

    #[test]
    fn mesh_failure_lists_failing_criterion() {
        let report = report(
            flashed(outcome(Some(0), false), outcome(Some(1), false)),
            vec![],
            HANDSHAKE.to_vec(),
        );
        let text = render(&report);
        assert!(text.contains("  T-Deck-2: ❌ FAILED (exit status 1)"));
        assert!(text.contains("    both_init: ❌ FAIL"));
        assert!(text.contains("    Kyber Initialized: false"));
        assert!(text.contains("  Overall Result: ❌ FAILED"));
    }

    #[test]
    fn json_rendering_keeps_categories_and_verdict() {
        let report = report(
            flashed(outcome(Some(0), false), outcome(Some(0), false)),
            HANDSHAKE.to_vec(),
            vec!["ERROR boom"],
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(value["analysis"]["init-detected"]["T-Deck-1"], true);
        assert_eq!(value["analysis"]["error-count"]["T-Deck-2"], 1);
        assert_eq!(value["verdict"]["criteria"]["both_init"], false);
        assert_eq!(value["flash"]["T-Deck-1"]["exit_status"], 0);
        assert_eq!(value["overall"], false);
    }
}
