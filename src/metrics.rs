//! Run counters
//!
//! Local atomic counters for the run summary, mirrored into the `metrics`
//! facade so an installed recorder (Prometheus or otherwise) sees them too.

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crate::{envelope::EnvelopeStatus, state::MergeOutcome};

#[derive(Debug)]
pub struct RunMetrics {
    started: Instant,
    envelopes_ok: AtomicU64,
    envelopes_partial: AtomicU64,
    envelopes_failed: AtomicU64,
    merges_stored: AtomicU64,
    merges_unchanged: AtomicU64,
    merges_stale: AtomicU64,
    failures_recorded: AtomicU64,
    identities_unified: AtomicU64,
    omissions_synthesized: AtomicU64,
    pairs_skipped: AtomicU64,
    probe_panics: AtomicU64,
    rule_errors: AtomicU64,
    findings_evaluated: AtomicU64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            envelopes_ok: AtomicU64::new(0),
            envelopes_partial: AtomicU64::new(0),
            envelopes_failed: AtomicU64::new(0),
            merges_stored: AtomicU64::new(0),
            merges_unchanged: AtomicU64::new(0),
            merges_stale: AtomicU64::new(0),
            failures_recorded: AtomicU64::new(0),
            identities_unified: AtomicU64::new(0),
            omissions_synthesized: AtomicU64::new(0),
            pairs_skipped: AtomicU64::new(0),
            probe_panics: AtomicU64::new(0),
            rule_errors: AtomicU64::new(0),
            findings_evaluated: AtomicU64::new(0),
        }
    }

    pub fn record_envelope(&self, probe: &str, status: EnvelopeStatus) {
        let counter = match status {
            EnvelopeStatus::Ok => &self.envelopes_ok,
            EnvelopeStatus::Partial => &self.envelopes_partial,
            EnvelopeStatus::Failed => &self.envelopes_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        counter!("recon_envelopes_total", 1, "probe" => probe.to_string(), "status" => status.as_str());
    }

    pub fn record_merge(&self, outcome: MergeOutcome) {
        let counter = match outcome {
            MergeOutcome::Stored => &self.merges_stored,
            MergeOutcome::Unchanged => &self.merges_unchanged,
            MergeOutcome::Stale => &self.merges_stale,
            MergeOutcome::FailureRecorded => &self.failures_recorded,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        counter!("recon_merges_total", 1, "outcome" => outcome.as_str());
    }

    pub fn record_unification(&self) {
        self.identities_unified.fetch_add(1, Ordering::Relaxed);
        counter!("recon_identities_unified_total", 1);
    }

    pub fn record_omission(&self, probe: &str) {
        self.omissions_synthesized.fetch_add(1, Ordering::Relaxed);
        counter!("recon_omitted_envelopes_total", 1, "probe" => probe.to_string());
    }

    pub fn record_skipped(&self, count: usize) {
        self.pairs_skipped.fetch_add(count as u64, Ordering::Relaxed);
        counter!("recon_pairs_skipped_total", count as u64);
    }

    pub fn record_probe_panic(&self, probe: &str) {
        self.probe_panics.fetch_add(1, Ordering::Relaxed);
        counter!("recon_probe_panics_total", 1, "probe" => probe.to_string());
    }

    pub fn record_rule_error(&self, rule: &str) {
        self.rule_errors.fetch_add(1, Ordering::Relaxed);
        counter!("recon_rule_errors_total", 1, "rule" => rule.to_string());
    }

    pub fn record_probe_duration(&self, probe: &str, duration: Duration) {
        histogram!("recon_probe_duration_seconds", duration.as_secs_f64(), "probe" => probe.to_string());
    }

    pub fn record_findings(&self, count: usize) {
        self.findings_evaluated.fetch_add(count as u64, Ordering::Relaxed);
        counter!("recon_findings_total", count as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_ok: self.envelopes_ok.load(Ordering::Relaxed),
            envelopes_partial: self.envelopes_partial.load(Ordering::Relaxed),
            envelopes_failed: self.envelopes_failed.load(Ordering::Relaxed),
            merges_stored: self.merges_stored.load(Ordering::Relaxed),
            merges_unchanged: self.merges_unchanged.load(Ordering::Relaxed),
            merges_stale: self.merges_stale.load(Ordering::Relaxed),
            failures_recorded: self.failures_recorded.load(Ordering::Relaxed),
            identities_unified: self.identities_unified.load(Ordering::Relaxed),
            omissions_synthesized: self.omissions_synthesized.load(Ordering::Relaxed),
            pairs_skipped: self.pairs_skipped.load(Ordering::Relaxed),
            probe_panics: self.probe_panics.load(Ordering::Relaxed),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            findings_evaluated: self.findings_evaluated.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub envelopes_ok: u64,
    pub envelopes_partial: u64,
    pub envelopes_failed: u64,
    pub merges_stored: u64,
    pub merges_unchanged: u64,
    pub merges_stale: u64,
    pub failures_recorded: u64,
    pub identities_unified: u64,
    pub omissions_synthesized: u64,
    pub pairs_skipped: u64,
    pub probe_panics: u64,
    pub rule_errors: u64,
    pub findings_evaluated: u64,
    pub uptime: Duration,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run Statistics:")?;
        writeln!(
            f,
            "  Envelopes: {} ok, {} partial, {} failed",
            self.envelopes_ok, self.envelopes_partial, self.envelopes_failed
        )?;
        writeln!(
            f,
            "  Merges: {} stored, {} unchanged, {} stale, {} failures recorded",
            self.merges_stored, self.merges_unchanged, self.merges_stale, self.failures_recorded
        )?;
        writeln!(f, "  Identities unified: {}", self.identities_unified)?;
        writeln!(
            f,
            "  Omitted envelopes: {}, skipped pairs: {}, probe panics: {}",
            self.omissions_synthesized, self.pairs_skipped, self.probe_panics
        )?;
        writeln!(f, "  Rule errors: {}", self.rule_errors)?;
        write!(f, "  Uptime: {:.2}s", self.uptime.as_secs_f64())
    }
}
