//! Shared recon state
//!
//! The accumulated knowledge of a run: every target identity, and for each
//! identity one slot per probe holding the most recent non-failed envelope
//! from that probe. [`ReconState::merge`] is the only write path.
//!
//! Slots are monotonic within a run. A slot is only replaced by a newer
//! envelope from the same probe; failed envelopes are kept as diagnostics
//! beside the slot and never displace a stored payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::{
    envelope::{EnvelopeStatus, ProbePayload, ResultEnvelope},
    error::{ReconError, Result},
    identity::{is_blank, normalize, AliasOutcome, IdentityResolver, IdentityTag, TargetIdentity},
    probe::{ProbeScope, ProfileKind, RunProfile},
};

/// Probe name recorded as the source of seed identities
pub const SEED_SOURCE: &str = "seed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub root_target: String,
    pub organization: Option<String>,
    pub profile: ProfileKind,
    pub started_at: DateTime<Utc>,
}

/// Externally supplied starting point of a run
#[derive(Debug, Clone)]
pub struct Seed {
    pub root: String,
    pub organization: Option<String>,
    pub profile: ProfileKind,
    pub targets: Vec<String>,
}

impl Seed {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            organization: None,
            profile: ProfileKind::Fast,
            targets: Vec::new(),
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_profile(mut self, profile: ProfileKind) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(targets.into_iter().map(Into::into));
        self
    }
}

/// Everything one probe has reported about one identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeSlot {
    /// Most recent `ok`/`partial` envelope
    pub latest: Option<ResultEnvelope>,
    /// When `latest` was stored
    pub written_at: Option<DateTime<Utc>>,
    /// Most recent failure, kept as a diagnostic
    pub last_failure: Option<ResultEnvelope>,
    /// Envelopes that lost their place when two identities were unified
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub displaced: Vec<ResultEnvelope>,
}

impl ProbeSlot {
    pub fn payload(&self) -> Option<&ProbePayload> {
        self.latest.as_ref().and_then(|envelope| envelope.payload.as_ref())
    }

    /// Fold another slot for the same probe into this one. The newer
    /// envelope keeps `latest`; the other one is displaced, never dropped.
    fn absorb(&mut self, other: ProbeSlot) {
        match (self.latest.take(), other.latest) {
            (Some(mine), Some(theirs)) => {
                let (keep, displace) = if theirs.observed_at > mine.observed_at {
                    (theirs, mine)
                } else {
                    (mine, theirs)
                };
                self.latest = Some(keep);
                self.displaced.push(displace);
            }
            (mine, theirs) => self.latest = mine.or(theirs),
        }

        self.written_at = self.written_at.max(other.written_at);

        self.last_failure = match (self.last_failure.take(), other.last_failure) {
            (Some(mine), Some(theirs)) if theirs.observed_at > mine.observed_at => Some(theirs),
            (mine, theirs) => mine.or(theirs),
        };

        self.displaced.extend(other.displaced);
        self.displaced
            .sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then_with(|| a.probe_name.cmp(&b.probe_name)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// The envelope became the slot's latest value
    Stored,
    /// The same result was already stored; nothing was written
    Unchanged,
    /// Older than what the slot holds; ignored
    Stale,
    /// Failed envelope recorded as a diagnostic; the payload is untouched
    FailureRecorded,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Unchanged => "unchanged",
            Self::Stale => "stale",
            Self::FailureRecorded => "failure_recorded",
        }
    }
}

/// What a single merge did
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    /// Primary name the envelope was stored under
    pub identity: String,
    /// Alias assertions that unified two identities
    pub unified: Vec<AliasOutcome>,
    /// Identities created from the envelope's discovered names
    pub created: Vec<String>,
}

/// Targets selected for one probe
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    pub selected: Vec<TargetIdentity>,
    /// Primary names left out by the profile's target cap
    pub capped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconState {
    pub metadata: RunMetadata,
    resolver: IdentityResolver,
    slots: BTreeMap<String, BTreeMap<String, ProbeSlot>>,
}

impl ReconState {
    /// Build the initial state. Fails fast when the root target is missing
    /// or unusable.
    pub fn seed(seed: Seed) -> Result<Self> {
        let root = normalize(&seed.root);
        if root.name.is_empty() {
            return Err(ReconError::invalid_seed("root target is empty"));
        }
        if root.is_malformed() {
            return Err(ReconError::invalid_seed(format!(
                "root target '{}' is neither a hostname nor an IP address",
                seed.root.trim()
            )));
        }

        let mut resolver = IdentityResolver::new();
        let root_target = resolver.resolve(&root.name, SEED_SOURCE);
        resolver.tag(&root_target, IdentityTag::Seed);

        for target in seed.targets.iter().filter(|t| !t.trim().is_empty()) {
            let primary = resolver.resolve(target, SEED_SOURCE);
            resolver.tag(&primary, IdentityTag::Seed);
        }

        Ok(Self {
            metadata: RunMetadata {
                run_id: Uuid::new_v4(),
                root_target,
                organization: seed.organization,
                profile: seed.profile,
                started_at: Utc::now(),
            },
            resolver,
            slots: BTreeMap::new(),
        })
    }

    /// Restore a state serialized with `serde_json`
    pub fn from_json(json: &str) -> Result<Self> {
        let mut state: ReconState = serde_json::from_str(json)?;
        state.resolver.reindex();
        Ok(state)
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }

    /// Merge one envelope. The single write path into the state.
    pub fn merge(&mut self, envelope: ResultEnvelope) -> MergeReport {
        let envelope = envelope.into_valid();
        let probe = envelope.probe_name.clone();
        let mut identity = self.resolver.resolve(&envelope.target, &probe);

        if envelope.status == EnvelopeStatus::Failed {
            self.slot_mut(&identity, &probe).last_failure = Some(envelope);
            return MergeReport {
                outcome: MergeOutcome::FailureRecorded,
                identity,
                unified: Vec::new(),
                created: Vec::new(),
            };
        }

        let mut unified = Vec::new();
        for alias in &envelope.aliases {
            if is_blank(alias) {
                debug!(probe = %probe, target = %identity, "Ignoring blank alias");
                continue;
            }
            let outcome = self.resolver.merge_alias(&identity, alias, &probe);
            if outcome.changed {
                self.rekey(&outcome);
                identity = outcome.survivor.clone();
                if !outcome.retired.is_empty() {
                    unified.push(outcome);
                }
            }
        }

        let mut created = Vec::new();
        for name in envelope.discovered.iter().filter(|name| !is_blank(name)) {
            if self.resolver.lookup(name).is_none() {
                created.push(self.resolver.resolve(name, &probe));
            }
        }

        let slot = self.slot_mut(&identity, &probe);
        let outcome = match &slot.latest {
            Some(previous) if previous.same_result(&envelope) => MergeOutcome::Unchanged,
            Some(previous) if envelope.observed_at < previous.observed_at => MergeOutcome::Stale,
            _ => {
                slot.latest = Some(envelope);
                slot.written_at = Some(Utc::now());
                MergeOutcome::Stored
            }
        };

        MergeReport {
            outcome,
            identity,
            unified,
            created,
        }
    }

    fn slot_mut(&mut self, identity: &str, probe: &str) -> &mut ProbeSlot {
        self.slots
            .entry(identity.to_string())
            .or_default()
            .entry(probe.to_string())
            .or_default()
    }

    /// Move the slots of retired identities under the survivor
    fn rekey(&mut self, outcome: &AliasOutcome) {
        for retired in &outcome.retired {
            let Some(moved) = self.slots.remove(retired) else {
                continue;
            };
            let survivor = self.slots.entry(outcome.survivor.clone()).or_default();
            for (probe, slot) in moved {
                match survivor.get_mut(&probe) {
                    Some(existing) => existing.absorb(slot),
                    None => {
                        survivor.insert(probe, slot);
                    }
                }
            }
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// All identities in primary-name order
    pub fn identities(&self) -> impl Iterator<Item = &TargetIdentity> {
        self.resolver.identities()
    }

    /// Identity known under any of its names
    pub fn identity(&self, name: &str) -> Option<&TargetIdentity> {
        self.resolver.lookup(name)
    }

    pub fn root_identity(&self) -> Option<&TargetIdentity> {
        self.resolver.lookup(&self.metadata.root_target)
    }

    pub fn slots(&self, primary: &str) -> Option<&BTreeMap<String, ProbeSlot>> {
        self.slots.get(primary)
    }

    pub fn slot(&self, primary: &str, probe: &str) -> Option<&ProbeSlot> {
        self.slots.get(primary).and_then(|slots| slots.get(probe))
    }

    pub fn payload(&self, primary: &str, probe: &str) -> Option<&ProbePayload> {
        self.slot(primary, probe).and_then(ProbeSlot::payload)
    }

    pub fn len(&self) -> usize {
        self.resolver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolver.is_empty()
    }

    /// Targets a probe with `scope` should receive under `profile`.
    /// Malformed identities sort last so a target cap drops them first.
    pub fn target_set(&self, scope: ProbeScope, profile: &RunProfile) -> TargetSet {
        let mut candidates: Vec<TargetIdentity> = match scope {
            ProbeScope::RootOnly => self.root_identity().cloned().into_iter().collect(),
            ProbeScope::AllTargets => self.identities().cloned().collect(),
        };
        candidates.sort_by(|a, b| {
            a.is_malformed()
                .cmp(&b.is_malformed())
                .then_with(|| a.primary_name.cmp(&b.primary_name))
        });

        let capped = match profile.target_limit() {
            Some(limit) if limit < candidates.len() => candidates
                .split_off(limit)
                .into_iter()
                .map(|identity| identity.primary_name)
                .collect(),
            _ => Vec::new(),
        };

        TargetSet {
            selected: candidates,
            capped,
        }
    }
}
