//! Run coordinator
//!
//! Drives registered probes one at a time in a fixed declared order. Each
//! probe receives its target set in batches; every (probe, target) pair
//! moves through `pending -> running -> {ok, partial, failed}` or ends
//! `skipped` when the run deadline or the profile's target cap keeps it
//! from being dispatched.
//!
//! The coordinator is the only caller of [`ReconState::merge`]. Envelopes
//! of a batch are merged under one write lock once the batch returns, so
//! merges for an identity never interleave.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    envelope::{EnvelopeStatus, ResultEnvelope},
    error::{ReconError, Result},
    events::{EventBus, RunEvent},
    identity::TargetIdentity,
    log_identity_unified, log_pair_failure, log_probe_complete, log_probe_start,
    logging::TimingLogger,
    metrics::{MetricsSnapshot, RunMetrics},
    probe::{Probe, RunProfile},
    state::ReconState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Pending,
    Running,
    Ok,
    Partial,
    Failed,
    Skipped,
}

impl PairStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Partial | Self::Failed | Self::Skipped)
    }

    fn can_move_to(&self, next: PairStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Ok)
                | (Self::Running, Self::Partial)
                | (Self::Running, Self::Failed)
        )
    }
}

impl From<EnvelopeStatus> for PairStatus {
    fn from(status: EnvelopeStatus) -> Self {
        match status {
            EnvelopeStatus::Ok => Self::Ok,
            EnvelopeStatus::Partial => Self::Partial,
            EnvelopeStatus::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for PairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// State of every pair of one probe execution
#[derive(Debug, Clone)]
pub struct PairTracker {
    probe: String,
    pairs: BTreeMap<String, PairStatus>,
}

impl PairTracker {
    pub fn new(probe: impl Into<String>) -> Self {
        Self {
            probe: probe.into(),
            pairs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, target: &str) {
        self.pairs
            .entry(target.to_string())
            .or_insert(PairStatus::Pending);
    }

    pub fn status(&self, target: &str) -> Option<PairStatus> {
        self.pairs.get(target).copied()
    }

    /// Move a pair forward. Terminal states are final.
    pub fn transition(&mut self, target: &str, next: PairStatus) -> Result<()> {
        let current = self.pairs.get_mut(target).ok_or_else(|| {
            ReconError::internal(
                "pair tracker",
                format!("{} never registered target {}", self.probe, target),
            )
        })?;
        if !current.can_move_to(next) {
            return Err(ReconError::internal(
                "pair tracker",
                format!(
                    "{} on {}: illegal transition {} -> {}",
                    self.probe, target, current, next
                ),
            ));
        }
        *current = next;
        Ok(())
    }

    pub fn count(&self, status: PairStatus) -> usize {
        self.pairs.values().filter(|s| **s == status).count()
    }

    pub fn targets_in(&self, status: PairStatus) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.pairs.values().all(PairStatus::is_terminal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRunSummary {
    pub probe: String,
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Pairs the probe returned no envelope for
    pub omitted: usize,
    pub deadline_reached: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub probes: Vec<ProbeRunSummary>,
    pub deadline_reached: bool,
    pub identities: usize,
    pub metrics: MetricsSnapshot,
}

pub struct RunCoordinator {
    state: Arc<RwLock<ReconState>>,
    probes: Vec<Arc<dyn Probe>>,
    profile: RunProfile,
    batch_size: usize,
    probe_order: Vec<String>,
    deadline: Option<Duration>,
    event_bus: Arc<EventBus>,
    metrics: Arc<RunMetrics>,
}

impl RunCoordinator {
    pub fn new(state: ReconState, config: &AppConfig) -> Self {
        let kind = state.metadata.profile;
        let profile = RunProfile::from_config(kind, config.profile(kind), config);
        Self {
            state: Arc::new(RwLock::new(state)),
            probes: Vec::new(),
            profile,
            batch_size: config.coordinator.dispatch_batch_size.max(1),
            probe_order: config.coordinator.probe_order.clone(),
            deadline: config.run_deadline(),
            event_bus: Arc::new(EventBus::new()),
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_profile(mut self, profile: RunProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Register a probe; probe names must be unique
    pub fn register(&mut self, probe: Arc<dyn Probe>) -> Result<()> {
        if self.probes.iter().any(|p| p.name() == probe.name()) {
            return Err(ReconError::config(format!(
                "Probe '{}' is already registered",
                probe.name()
            )));
        }
        debug!(probe = probe.name(), "Registered probe");
        self.probes.push(probe);
        Ok(())
    }

    pub fn state(&self) -> Arc<RwLock<ReconState>> {
        self.state.clone()
    }

    pub fn profile(&self) -> &RunProfile {
        &self.profile
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    pub async fn subscribe(&self) -> mpsc::Receiver<RunEvent> {
        self.event_bus.subscribe().await
    }

    /// Probes in run order: the configured order first, then the rest in
    /// registration order
    pub fn ordered_probes(&self) -> Vec<Arc<dyn Probe>> {
        let mut ordered: Vec<Arc<dyn Probe>> = Vec::with_capacity(self.probes.len());
        for name in &self.probe_order {
            match self.probes.iter().find(|p| p.name() == name.as_str()) {
                Some(probe) if !ordered.iter().any(|p| p.name() == probe.name()) => {
                    ordered.push(probe.clone())
                }
                Some(_) => {}
                None => warn!(probe = %name, "Configured probe order names an unregistered probe"),
            }
        }
        for probe in &self.probes {
            if !ordered.iter().any(|p| p.name() == probe.name()) {
                ordered.push(probe.clone());
            }
        }
        ordered
    }

    /// Run every registered probe to completion, in order
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline_at = self.deadline.map(|limit| started + limit);

        let (run_id, root_target) = {
            let state = self.state.read().await;
            let root = state.root_identity().ok_or_else(|| {
                ReconError::invalid_seed(format!(
                    "root target '{}' is not present in the state",
                    state.metadata.root_target
                ))
            })?;
            (state.metadata.run_id, root.primary_name.clone())
        };

        let probes = self.ordered_probes();
        info!(
            run_id = %run_id,
            root = %root_target,
            profile = %self.profile.kind,
            probes = probes.len(),
            "Starting recon run"
        );
        self.event_bus
            .publish(RunEvent::RunStarted {
                run_id,
                root_target,
                profile: self.profile.kind,
                probes: probes.iter().map(|p| p.name().to_string()).collect(),
            })
            .await;

        let mut summaries = Vec::with_capacity(probes.len());
        for probe in probes {
            summaries.push(self.execute_probe(probe, deadline_at).await);
        }

        let deadline_reached = summaries.iter().any(|s| s.deadline_reached);
        let identities = self.state.read().await.len();

        self.event_bus
            .publish(RunEvent::RunCompleted {
                run_id,
                identities,
                deadline_reached,
            })
            .await;

        let report = RunReport {
            run_id,
            started_at,
            duration: started.elapsed(),
            probes: summaries,
            deadline_reached,
            identities,
            metrics: self.metrics.snapshot(),
        };
        info!(
            run_id = %run_id,
            identities = identities,
            deadline_reached = deadline_reached,
            duration_ms = report.duration.as_millis() as u64,
            "Recon run completed"
        );
        Ok(report)
    }

    /// Explicitly re-run one probe against the current target set
    pub async fn run_probe(&self, name: &str) -> Result<ProbeRunSummary> {
        let probe = self
            .probes
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| ReconError::config(format!("No probe named '{}'", name)))?;
        let deadline_at = self.deadline.map(|limit| Instant::now() + limit);
        Ok(self.execute_probe(probe, deadline_at).await)
    }

    async fn execute_probe(&self, probe: Arc<dyn Probe>, deadline_at: Option<Instant>) -> ProbeRunSummary {
        let name = probe.name().to_string();
        let timer = TimingLogger::start(format!("probe:{}", name));

        let target_set = {
            let state = self.state.read().await;
            state.target_set(probe.scope(), &self.profile)
        };

        let mut tracker = PairTracker::new(&name);
        for target in &target_set.selected {
            tracker.register(&target.primary_name);
        }
        for capped in &target_set.capped {
            tracker.register(capped);
            self.advance(&mut tracker, capped, PairStatus::Skipped);
        }

        log_probe_start!(name.as_str(), target_set.selected.len());
        self.event_bus
            .publish(RunEvent::ProbeStarted {
                probe: name.clone(),
                targets: target_set.selected.len(),
            })
            .await;

        let mut deadline_reached = false;
        let mut omitted = 0;
        for (index, batch) in target_set.selected.chunks(self.batch_size).enumerate() {
            if deadline_at.map_or(false, |at| Instant::now() >= at) {
                let remaining = &target_set.selected[index * self.batch_size..];
                warn!(
                    probe = %name,
                    skipped = remaining.len(),
                    "Run deadline reached, not dispatching remaining targets"
                );
                for target in remaining {
                    self.advance(&mut tracker, &target.primary_name, PairStatus::Skipped);
                }
                deadline_reached = true;
                break;
            }

            for target in batch {
                self.advance(&mut tracker, &target.primary_name, PairStatus::Running);
            }

            let envelopes = self.dispatch(&probe, batch).await;
            omitted += self.merge_batch(&name, batch, envelopes, &mut tracker).await;
        }

        let skipped = tracker.count(PairStatus::Skipped);
        self.metrics.record_skipped(skipped);
        if !tracker.all_terminal() {
            error!(probe = %name, "Probe finished with pairs in a non-terminal state");
        }

        let summary = ProbeRunSummary {
            probe: name.clone(),
            ok: tracker.count(PairStatus::Ok),
            partial: tracker.count(PairStatus::Partial),
            failed: tracker.count(PairStatus::Failed),
            skipped,
            omitted,
            deadline_reached,
            duration: timer.elapsed(),
        };

        self.metrics.record_probe_duration(&name, summary.duration);
        log_probe_complete!(
            name.as_str(),
            summary.duration,
            summary.ok,
            summary.partial,
            summary.failed
        );
        self.event_bus
            .publish(RunEvent::ProbeCompleted {
                probe: name,
                ok: summary.ok,
                partial: summary.partial,
                failed: summary.failed,
                skipped: summary.skipped,
            })
            .await;

        summary
    }

    /// Run one batch in its own task so a panicking probe only fails the
    /// pairs of that batch
    async fn dispatch(&self, probe: &Arc<dyn Probe>, batch: &[TargetIdentity]) -> Vec<ResultEnvelope> {
        let targets = batch.to_vec();
        let profile = self.profile.clone();
        let task_probe = probe.clone();
        let handle = tokio::spawn(async move { task_probe.run(&targets, &profile).await });

        match handle.await {
            Ok(envelopes) => envelopes,
            Err(join_error) => {
                let error = ReconError::probe_panicked(probe.name(), join_error.to_string());
                self.metrics.record_probe_panic(probe.name());
                crate::log_error_with_context!(error, "probe dispatch");
                batch
                    .iter()
                    .map(|target| ResultEnvelope::failed(probe.name(), &target.primary_name, &error))
                    .collect()
            }
        }
    }

    /// Merge a batch's envelopes and settle every pair of the batch.
    /// Returns how many envelopes had to be synthesized for omitted pairs.
    async fn merge_batch(
        &self,
        probe: &str,
        batch: &[TargetIdentity],
        envelopes: Vec<ResultEnvelope>,
        tracker: &mut PairTracker,
    ) -> usize {
        let mut events = Vec::new();
        let mut omitted = 0;

        {
            let mut state = self.state.write().await;

            for envelope in envelopes {
                let mut envelope = envelope.into_valid();
                if envelope.probe_name != probe {
                    warn!(
                        probe = probe,
                        reported = %envelope.probe_name,
                        "Envelope reported under another probe name; storing under the running probe"
                    );
                    envelope.probe_name = probe.to_string();
                }

                match batch.iter().find(|target| target.knows(&envelope.target)) {
                    Some(target) if tracker.status(&target.primary_name) == Some(PairStatus::Running) => {
                        self.advance(tracker, &target.primary_name, envelope.status.into());
                    }
                    Some(target) => debug!(
                        probe = probe,
                        target = %target.primary_name,
                        "Additional envelope for an already settled pair"
                    ),
                    None => debug!(
                        probe = probe,
                        target = %envelope.target,
                        "Envelope for a target outside the dispatched batch"
                    ),
                }

                self.record_merge(&mut state, envelope, &mut events);
            }

            for target in batch {
                if tracker.status(&target.primary_name) != Some(PairStatus::Running) {
                    continue;
                }
                let error = ReconError::probe(probe, &target.primary_name, "no envelope emitted");
                error!(
                    probe = probe,
                    target = %target.primary_name,
                    event = "envelope_omitted",
                    "Probe returned no envelope for an attempted target"
                );
                self.metrics.record_omission(probe);
                omitted += 1;
                self.advance(tracker, &target.primary_name, PairStatus::Failed);
                let envelope = ResultEnvelope::failed(probe, &target.primary_name, &error);
                self.record_merge(&mut state, envelope, &mut events);
            }
        }

        for event in events {
            self.event_bus.publish(event).await;
        }
        omitted
    }

    fn record_merge(&self, state: &mut ReconState, envelope: ResultEnvelope, events: &mut Vec<RunEvent>) {
        let probe = envelope.probe_name.clone();
        self.metrics.record_envelope(&probe, envelope.status);

        if envelope.status == EnvelopeStatus::Failed {
            let detail = envelope.error_detail.clone().unwrap_or_default();
            log_pair_failure!(probe.as_str(), envelope.target.as_str(), detail);
            events.push(RunEvent::PairFailed {
                probe: probe.clone(),
                target: envelope.target.clone(),
                error: detail,
            });
        }

        let report = state.merge(envelope);
        self.metrics.record_merge(report.outcome);

        for unified in report.unified {
            self.metrics.record_unification();
            log_identity_unified!(unified.survivor.as_str(), unified.retired, probe.as_str());
            events.push(RunEvent::IdentityUnified {
                survivor: unified.survivor,
                retired: unified.retired,
                asserted_by: probe.clone(),
            });
        }
    }

    fn advance(&self, tracker: &mut PairTracker, target: &str, next: PairStatus) {
        if let Err(error) = tracker.transition(target, next) {
            crate::log_error_with_context!(error, "pair state");
        }
    }
}
