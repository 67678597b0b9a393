//! Application orchestration
//!
//! Wires the pieces of a run together: seed or resume the recon state,
//! register probes, drive the coordinator, score every target and hand the
//! findings to the report generator and the state store.

use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    cli::Cli,
    config::AppConfig,
    coordinator::RunCoordinator,
    error::{ReconError, Result},
    events::{EventBus, RunEvent},
    metrics::RunMetrics,
    persistence::{self, StateStore},
    probe::{Probe, ReplayProbe},
    reporting::{FindingsReport, ReportGenerator},
    risk::RiskEngine,
    state::{ReconState, Seed},
};

/// How long to wait for the event listener to drain after a run
const EVENT_DRAIN: Duration = Duration::from_secs(1);

/// Main application orchestrator
pub struct Application {
    config: AppConfig,
    store: Box<dyn StateStore + Send + Sync>,
    report_generator: Box<dyn ReportGenerator + Send + Sync>,
    probes: Vec<Arc<dyn Probe>>,
    event_bus: Arc<EventBus>,
    metrics: Arc<RunMetrics>,
}

/// Progress seen on the event stream during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTally {
    pub probes_completed: usize,
    pub pair_failures: usize,
    pub unifications: usize,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let store = persistence::create_state_store(&config).await?;
        let report_generator = crate::reporting::create_report_generator(&config.output);

        Ok(Self {
            config,
            store,
            report_generator,
            probes: Vec::new(),
            event_bus: Arc::new(EventBus::new()),
            metrics: Arc::new(RunMetrics::new()),
        })
    }

    /// Register a probe in addition to the ones named on the command line
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    /// Run the application with CLI arguments
    pub async fn run(&mut self, cli: Cli) -> Result<Option<FindingsReport>> {
        if cli.list_snapshots {
            self.print_snapshots().await?;
            return Ok(None);
        }

        let state = self.prepare_state(&cli).await?;
        let replayed = self.load_replays(&cli).await?;

        let mut coordinator = RunCoordinator::new(state, &self.config)
            .with_event_bus(self.event_bus.clone())
            .with_metrics(self.metrics.clone());
        for probe in self.probes.iter().cloned().chain(replayed) {
            coordinator.register(probe)?;
        }

        let run_report = if cli.score_only {
            info!("Scoring resumed snapshot without running probes");
            None
        } else {
            if coordinator.ordered_probes().is_empty() {
                warn!("No probes registered; only the seed targets will be scored");
            }
            let receiver = coordinator.subscribe().await;
            let listener = tokio::spawn(handle_events(receiver));

            let report = match coordinator.run().await {
                Ok(report) => report,
                Err(e) => {
                    listener.abort();
                    return Err(e);
                }
            };

            match tokio::time::timeout(EVENT_DRAIN, listener).await {
                Ok(Ok(tally)) => debug!(
                    probes = tally.probes_completed,
                    pair_failures = tally.pair_failures,
                    unifications = tally.unifications,
                    "Event stream drained"
                ),
                Ok(Err(e)) => warn!("Event listener failed: {}", e),
                Err(_) => debug!("Event listener still running after the run, detaching"),
            }
            Some(report)
        };

        let state = coordinator.state();
        let state = state.read().await;

        let engine = RiskEngine::new(self.config.scoring.clone()).with_metrics(self.metrics.clone());
        let findings = engine.evaluate_all(&state);

        let mut report = FindingsReport::new(&state, findings);
        if let Some(run_report) = run_report {
            report = report.with_run(run_report);
        }
        if self.config.output.include_state {
            report = report.with_state(state.clone());
        }

        if self.config.persistence.auto_save {
            let snapshot = self.store.save_snapshot(&state).await?;
            let findings = self.store.save_findings(&report).await?;
            info!(
                snapshot = %snapshot.display(),
                findings = %findings.display(),
                "Run data auto-saved"
            );
        }

        match &cli.output {
            Some(path) => self.report_generator.write_report(&report, path).await?,
            None => println!("{}", self.report_generator.render(&report)?),
        }

        info!(
            run_id = %report.run_id,
            targets = report.findings.len(),
            "Application run completed"
        );
        debug!("{}", self.metrics.snapshot());
        Ok(Some(report))
    }

    async fn prepare_state(&self, cli: &Cli) -> Result<ReconState> {
        if let Some(path) = &cli.resume {
            let mut state = persistence::read_snapshot(path).await?;
            if let Some(profile) = cli.profile {
                state.metadata.profile = profile;
            }
            info!(
                run_id = %state.metadata.run_id,
                identities = state.len(),
                "Resumed state from {}",
                path.display()
            );
            return Ok(state);
        }

        let root = cli
            .root
            .as_deref()
            .ok_or_else(|| ReconError::invalid_seed("no root target given"))?;
        let mut seed = Seed::new(root)
            .with_profile(cli.profile.unwrap_or_else(|| self.config.default_profile()))
            .with_targets(cli.targets.iter().cloned());
        if let Some(org) = &cli.org {
            seed = seed.with_organization(org.clone());
        }
        ReconState::seed(seed)
    }

    async fn load_replays(&self, cli: &Cli) -> Result<Vec<Arc<dyn Probe>>> {
        let mut probes: Vec<Arc<dyn Probe>> = Vec::new();
        for path in &cli.replay {
            let loaded = ReplayProbe::load(path).await?;
            info!(
                probes = loaded.len(),
                "Loaded recorded results from {}",
                path.display()
            );
            probes.extend(loaded.into_iter().map(|probe| Arc::new(probe) as Arc<dyn Probe>));
        }
        Ok(probes)
    }

    async fn print_snapshots(&self) -> Result<()> {
        let snapshots = self.store.list_snapshots().await?;
        if snapshots.is_empty() {
            println!("No saved snapshots");
        }
        for snapshot in snapshots {
            println!(
                "{}  {}  {:<10} {:>5} identities  {}",
                snapshot.started_at.format("%Y-%m-%d %H:%M:%S"),
                snapshot.run_id,
                snapshot.profile.to_string(),
                snapshot.identities,
                snapshot.root_target
            );
        }
        Ok(())
    }
}

async fn handle_events(mut receiver: mpsc::Receiver<RunEvent>) -> EventTally {
    let mut tally = EventTally::default();
    while let Some(event) = receiver.recv().await {
        match event {
            RunEvent::RunStarted { probes, .. } => {
                debug!(probes = ?probes, "Run started event received");
            }
            RunEvent::ProbeCompleted { probe, skipped, .. } => {
                tally.probes_completed += 1;
                if skipped > 0 {
                    debug!(probe = %probe, skipped = skipped, "Probe left pairs undispatched");
                }
            }
            RunEvent::PairFailed { .. } => tally.pair_failures += 1,
            RunEvent::IdentityUnified { .. } => tally.unifications += 1,
            RunEvent::RunCompleted { run_id, .. } => {
                debug!("Run completed event received for run {}", run_id);
                break;
            }
            RunEvent::ProbeStarted { .. } => {}
        }
    }
    tally
}
