//! Probe contract
//!
//! A probe is any unit that gathers one category of signal about targets.
//! The coordinator only knows the [`Probe`] shape: hand it a target set and
//! a [`RunProfile`], get back exactly one [`ResultEnvelope`] per target it
//! attempted.
//!
//! Most probes work one target at a time; they implement [`TargetProbe`]
//! and are wrapped in [`PerTarget`], which supplies the worker pool,
//! timeouts, retries and failure conversion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    config::{AppConfig, ProfileConfig},
    envelope::{ProbePayload, ResultEnvelope},
    error::{ErrorContext, ReconError, Result},
    identity::TargetIdentity,
    timing::RetryPolicy,
};

/// Worker ceiling used when neither the probe nor the profile sets one
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Bounded: caps targets and candidates, trades completeness for time
    Fast,
    /// Verbose: every target, every candidate, paced calls
    Exhaustive,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Exhaustive => write!(f, "exhaustive"),
        }
    }
}

impl FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" | "bounded" => Ok(Self::Fast),
            "exhaustive" | "verbose" => Ok(Self::Exhaustive),
            other => Err(format!("Unknown run profile: {}", other)),
        }
    }
}

/// Run-scoped execution policy threaded through the coordinator and every probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProfile {
    pub kind: ProfileKind,
    pub bounded: bool,
    pub max_targets: Option<usize>,
    pub max_candidates: Option<usize>,
    pub per_call_timeout: Duration,
    pub pacing_delay: Duration,
    pub retry: RetryPolicy,
    /// Worker ceiling for probes that do not declare their own
    pub concurrency: usize,
}

impl RunProfile {
    pub fn from_config(kind: ProfileKind, profile: &ProfileConfig, app: &AppConfig) -> Self {
        Self {
            kind,
            bounded: kind == ProfileKind::Fast,
            max_targets: profile.max_targets,
            max_candidates: profile.max_candidates,
            per_call_timeout: Duration::from_secs(profile.per_call_timeout_secs),
            pacing_delay: Duration::from_millis(profile.pacing_delay_ms),
            retry: app.retry_policy(),
            concurrency: app.coordinator.default_probe_concurrency,
        }
    }

    pub fn fast() -> Self {
        let config = AppConfig::default();
        Self::from_config(ProfileKind::Fast, &config.profiles.fast, &config)
    }

    pub fn exhaustive() -> Self {
        let config = AppConfig::default();
        Self::from_config(ProfileKind::Exhaustive, &config.profiles.exhaustive, &config)
    }

    /// Target cap in effect, if any. Only bounded profiles cap.
    pub fn target_limit(&self) -> Option<usize> {
        if self.bounded {
            self.max_targets
        } else {
            None
        }
    }

    /// Slice of guessed candidates (bucket names, paths, keywords) a
    /// probe should try under this profile
    pub fn cap_candidates<'a, T>(&self, candidates: &'a [T]) -> &'a [T] {
        match self.max_candidates {
            Some(limit) if self.bounded && limit < candidates.len() => &candidates[..limit],
            _ => candidates,
        }
    }
}

/// Which targets a probe is handed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeScope {
    /// Only the seed root target
    RootOnly,
    /// Every known identity, malformed ones included
    AllTargets,
}

/// Uniform shape of every probe
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> ProbeScope {
        ProbeScope::AllTargets
    }

    /// Declared per-probe worker ceiling
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Must return one envelope per target attempted, failures included
    async fn run(&self, targets: &[TargetIdentity], profile: &RunProfile) -> Vec<ResultEnvelope>;
}

/// What a single-target probe call produced
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub payload: ProbePayload,
    /// Set when some expected fields could not be obtained
    pub missing: Option<String>,
    pub aliases: Vec<String>,
    pub discovered: Vec<String>,
}

impl ProbeOutcome {
    pub fn complete(payload: ProbePayload) -> Self {
        Self {
            payload,
            missing: None,
            aliases: Vec::new(),
            discovered: Vec::new(),
        }
    }

    pub fn partial(payload: ProbePayload, missing: impl Into<String>) -> Self {
        Self {
            missing: Some(missing.into()),
            ..Self::complete(payload)
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn with_discovered<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discovered.extend(names.into_iter().map(Into::into));
        self
    }

    fn into_envelope(self, probe: &str, target: &str) -> ResultEnvelope {
        let envelope = match self.missing {
            Some(missing) => ResultEnvelope::partial(probe, target, self.payload, missing),
            None => ResultEnvelope::ok(probe, target, self.payload),
        };
        envelope
            .with_aliases(self.aliases)
            .with_discovered(self.discovered)
    }
}

/// A probe that examines one target per call
#[async_trait]
pub trait TargetProbe: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn scope(&self) -> ProbeScope {
        ProbeScope::AllTargets
    }

    fn concurrency(&self) -> Option<usize> {
        None
    }

    async fn probe(&self, target: &TargetIdentity, profile: &RunProfile) -> Result<ProbeOutcome>;
}

/// Worker-pool adapter turning a [`TargetProbe`] into a [`Probe`]
///
/// One task per target, bounded by a semaphore. Each call carries the
/// profile's per-call timeout and transient errors are retried under the
/// profile's [`RetryPolicy`]. A failing or panicking call becomes a failed
/// envelope for that target only.
pub struct PerTarget<P: TargetProbe> {
    inner: Arc<P>,
}

impl<P: TargetProbe> PerTarget<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<P: TargetProbe> Probe for PerTarget<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn scope(&self) -> ProbeScope {
        self.inner.scope()
    }

    fn concurrency(&self) -> Option<usize> {
        self.inner.concurrency()
    }

    async fn run(&self, targets: &[TargetIdentity], profile: &RunProfile) -> Vec<ResultEnvelope> {
        let ceiling = self
            .inner
            .concurrency()
            .unwrap_or(profile.concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(ceiling));
        let probe_name = self.inner.name().to_string();

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let name = target.primary_name.clone();
            let inner = self.inner.clone();
            let semaphore = semaphore.clone();
            let profile = profile.clone();
            let target = target.clone();
            let probe_name = probe_name.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let error = ReconError::internal("worker pool", "semaphore closed");
                        return ResultEnvelope::failed(&probe_name, &target.primary_name, &error);
                    }
                };

                if !profile.pacing_delay.is_zero() {
                    tokio::time::sleep(profile.pacing_delay).await;
                }

                let result = profile
                    .retry
                    .run(profile.per_call_timeout, || inner.probe(&target, &profile))
                    .await
                    .with_probe_context(&probe_name, &target.primary_name);

                match result {
                    Ok(outcome) => outcome.into_envelope(&probe_name, &target.primary_name),
                    Err(error) => {
                        debug!(
                            probe = %probe_name,
                            target = %target.primary_name,
                            error = %error,
                            "Probe call failed"
                        );
                        ResultEnvelope::failed(&probe_name, &target.primary_name, &error)
                    }
                }
            });
            handles.push((name, handle));
        }

        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        names
            .into_iter()
            .zip(joined)
            .map(|(target, joined)| match joined {
                Ok(envelope) => envelope,
                Err(join_error) => {
                    let error = ReconError::probe_panicked(&probe_name, join_error.to_string());
                    warn!(
                        probe = %probe_name,
                        target = %target,
                        error = %error,
                        "Probe worker did not complete"
                    );
                    ResultEnvelope::failed(&probe_name, &target, &error)
                }
            })
            .collect()
    }
}

/// Replays recorded envelopes for one probe name
///
/// Recordings are JSON lines, one [`ResultEnvelope`] per line. A target is
/// matched by any of its names; when several recordings match, the most
/// recently observed one is replayed.
pub struct ReplayProbe {
    name: String,
    scope: ProbeScope,
    recorded: Vec<ResultEnvelope>,
}

impl ReplayProbe {
    pub fn new(name: impl Into<String>, recorded: Vec<ResultEnvelope>) -> Self {
        Self {
            name: name.into(),
            scope: ProbeScope::AllTargets,
            recorded,
        }
    }

    pub fn with_scope(mut self, scope: ProbeScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn recorded(&self) -> &[ResultEnvelope] {
        &self.recorded
    }

    /// Parse JSON-lines recordings into one replay probe per probe name,
    /// ordered by first appearance in the input
    pub fn parse_jsonl(content: &str) -> Result<Vec<ReplayProbe>> {
        let mut order: Vec<String> = Vec::new();
        let mut grouped: BTreeMap<String, Vec<ResultEnvelope>> = BTreeMap::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let envelope: ResultEnvelope = serde_json::from_str(line).map_err(|e| {
                ReconError::serialization("jsonl", format!("line {}: {}", index + 1, e))
            })?;
            if !grouped.contains_key(&envelope.probe_name) {
                order.push(envelope.probe_name.clone());
            }
            grouped
                .entry(envelope.probe_name.clone())
                .or_default()
                .push(envelope);
        }

        Ok(order
            .into_iter()
            .filter_map(|name| {
                let recorded = grouped.remove(&name)?;
                Some(ReplayProbe::new(name, recorded))
            })
            .collect())
    }

    pub async fn load(path: &Path) -> Result<Vec<ReplayProbe>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ReconError::io(format!("read recording {}", path.display()), e.to_string())
        })?;
        Self::parse_jsonl(&content)
    }

    fn recording_for(&self, target: &TargetIdentity) -> Option<&ResultEnvelope> {
        self.recorded
            .iter()
            .filter(|envelope| target.knows(&envelope.target))
            .max_by_key(|envelope| envelope.observed_at)
    }
}

#[async_trait]
impl Probe for ReplayProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> ProbeScope {
        self.scope
    }

    async fn run(&self, targets: &[TargetIdentity], _profile: &RunProfile) -> Vec<ResultEnvelope> {
        targets
            .iter()
            .map(|target| match self.recording_for(target) {
                Some(recorded) => recorded.clone(),
                None => ResultEnvelope::failed(
                    &self.name,
                    &target.primary_name,
                    &ReconError::probe(&self.name, &target.primary_name, "no recorded result"),
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::{EnvelopeStatus, HttpObservation},
        identity::IdentityResolver,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identities(names: &[&str]) -> Vec<TargetIdentity> {
        let mut resolver = IdentityResolver::new();
        for name in names {
            resolver.resolve(name, "test");
        }
        resolver.identities().cloned().collect()
    }

    fn test_profile() -> RunProfile {
        RunProfile {
            per_call_timeout: Duration::from_millis(200),
            retry: RetryPolicy::new(2, Duration::ZERO),
            ..RunProfile::fast()
        }
    }

    struct StatusProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TargetProbe for StatusProbe {
        fn name(&self) -> &str {
            "http"
        }

        fn concurrency(&self) -> Option<usize> {
            Some(2)
        }

        async fn probe(&self, target: &TargetIdentity, _profile: &RunProfile) -> Result<ProbeOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match target.primary_name.as_str() {
                "down.example.com" => Err(ReconError::network("connection refused")),
                "panic.example.com" => panic!("unexpected payload shape"),
                "slow.example.com" => Ok(ProbeOutcome::partial(
                    ProbePayload::Http(HttpObservation {
                        status_code: Some(200),
                        ..Default::default()
                    }),
                    "body timed out",
                )),
                _ => Ok(ProbeOutcome::complete(ProbePayload::Http(HttpObservation {
                    status_code: Some(200),
                    ..Default::default()
                }))),
            }
        }
    }

    #[tokio::test]
    async fn test_per_target_emits_one_envelope_per_target() {
        let probe = PerTarget::new(StatusProbe {
            calls: AtomicUsize::new(0),
        });
        let targets = identities(&[
            "a.example.com",
            "down.example.com",
            "panic.example.com",
            "slow.example.com",
        ]);

        let envelopes = probe.run(&targets, &test_profile()).await;
        assert_eq!(envelopes.len(), targets.len());

        let status = |name: &str| {
            envelopes
                .iter()
                .find(|e| e.target == name)
                .map(|e| e.status)
                .unwrap()
        };
        assert_eq!(status("a.example.com"), EnvelopeStatus::Ok);
        assert_eq!(status("down.example.com"), EnvelopeStatus::Failed);
        assert_eq!(status("panic.example.com"), EnvelopeStatus::Failed);
        assert_eq!(status("slow.example.com"), EnvelopeStatus::Partial);
        assert!(envelopes.iter().all(|e| e.validate().is_ok()));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let probe = PerTarget::new(StatusProbe {
            calls: AtomicUsize::new(0),
        });
        let targets = identities(&["down.example.com"]);
        probe.run(&targets, &test_profile()).await;
        assert_eq!(probe.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cap_candidates_only_when_bounded() {
        let candidates: Vec<u32> = (0..500).collect();
        assert_eq!(RunProfile::fast().cap_candidates(&candidates).len(), 200);
        assert_eq!(RunProfile::exhaustive().cap_candidates(&candidates).len(), 500);
        assert_eq!(RunProfile::exhaustive().target_limit(), None);
        assert_eq!(RunProfile::fast().target_limit(), Some(150));
    }

    #[test]
    fn test_profile_kind_parsing() {
        assert_eq!("fast".parse::<ProfileKind>().unwrap(), ProfileKind::Fast);
        assert_eq!("Verbose".parse::<ProfileKind>().unwrap(), ProfileKind::Exhaustive);
        assert!("turbo".parse::<ProfileKind>().is_err());
    }

    #[tokio::test]
    async fn test_replay_matches_by_alias() {
        let lines = r#"
{"probe_name":"cert-lookup","target":"www.example.com","status":"ok","payload":{"kind":"certificate","data":{"issuer_org":"Let's Encrypt"}},"observed_at":"2025-01-01T00:00:00Z"}
{"probe_name":"http","target":"example.com","status":"failed","error_detail":"timeout","observed_at":"2025-01-01T00:00:00Z"}
"#;
        let probes = ReplayProbe::parse_jsonl(lines).unwrap();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].name(), "cert-lookup");

        let mut resolver = IdentityResolver::new();
        resolver.merge_alias("example.com", "www.example.com", "dns");
        let targets: Vec<_> = resolver.identities().cloned().collect();

        let envelopes = probes[0].run(&targets, &RunProfile::fast()).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].status, EnvelopeStatus::Ok);
    }

    #[test]
    fn test_replay_rejects_bad_lines() {
        let error = ReplayProbe::parse_jsonl("{not json}").err().unwrap();
        assert!(matches!(error, ReconError::Serialization { .. }));
    }
}
