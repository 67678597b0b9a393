//! # Deep Recon - Recon Aggregation and Risk Correlation
//!
//! Runs independent recon probes against an organization's external attack
//! surface, unifies every name they report into target identities and ranks
//! each target by a correlated risk score.
//!
//! ## Features
//!
//! - **Identity Resolution**: Case, scheme and port normalization with alias unification
//! - **Probe Contract**: Uniform result envelopes with ok / partial / failed outcomes
//! - **Run Coordination**: Ordered probes, batched dispatch, deadlines, failure isolation
//! - **Shared State**: Monotonic per-probe slots, JSON snapshots, resumable runs
//! - **Risk Correlation**: Weighted factor rules, levels, ICS flags and pivot suggestions
//!
//! ## Architecture
//!
//! - `identity` and `state` own the data; [`state::ReconState::merge`] is the only writer
//! - `probe` defines the contract every data source implements
//! - `coordinator` schedules probes and merges their envelopes
//! - `risk` reads the state and never writes to it

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod persistence;

// Recon pipeline
pub mod coordinator;
pub mod envelope;
pub mod events;
pub mod identity;
pub mod probe;
pub mod state;

// Scoring and output
pub mod reporting;
pub mod risk;
pub mod signals;

// Utilities
pub mod timing;

// Re-exports for convenience
pub use crate::{
    config::AppConfig,
    coordinator::{RunCoordinator, RunReport},
    core::Application,
    envelope::{EnvelopeStatus, ProbePayload, ResultEnvelope},
    error::{ReconError, Result},
    identity::{IdentityResolver, TargetIdentity},
    probe::{Probe, ProbeScope, RunProfile},
    risk::{RiskEngine, RiskFinding, RiskLevel},
    state::{ReconState, Seed},
};
