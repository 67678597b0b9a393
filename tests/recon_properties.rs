//! End-to-end behavior of the recon pipeline through the public API

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use deep_recon::{
    config::{AppConfig, ScoringConfig},
    envelope::{CertificateInfo, CodeHit, CodeSearchResult, HttpObservation},
    error::ReconError,
    probe::ReplayProbe,
    EnvelopeStatus, Probe, ProbePayload, ReconState, ResultEnvelope, RiskEngine, RiskLevel,
    RunCoordinator, RunProfile, Seed, TargetIdentity,
};
use std::sync::Arc;

fn seeded(targets: &[&str]) -> ReconState {
    ReconState::seed(
        Seed::new("example.com")
            .with_organization("Example Corp")
            .with_targets(targets.iter().copied()),
    )
    .unwrap()
}

fn cert(issuer: &str) -> ProbePayload {
    ProbePayload::Certificate(CertificateInfo {
        issuer_org: Some(issuer.to_string()),
        ..Default::default()
    })
}

fn http(powered_by: &str) -> ProbePayload {
    ProbePayload::Http(HttpObservation {
        status_code: Some(200),
        powered_by: Some(powered_by.to_string()),
        ..Default::default()
    })
}

fn code_leak(keyword: &str) -> ProbePayload {
    ProbePayload::CodeLeaks(CodeSearchResult {
        hits: vec![CodeHit {
            keyword: keyword.to_string(),
            query: format!("\"example.com\" {}", keyword),
            total_count: 2,
            urls: vec!["https://github.com/acme/site/blob/main/settings.py".to_string()],
            snippet: None,
        }],
    })
}

struct PanickingProbe;

#[async_trait]
impl Probe for PanickingProbe {
    fn name(&self) -> &str {
        "bucket-audit"
    }

    async fn run(&self, _targets: &[TargetIdentity], _profile: &RunProfile) -> Vec<ResultEnvelope> {
        panic!("bucket listing returned an unexpected document")
    }
}

#[test]
fn failed_envelope_never_erases_a_successful_payload() {
    let mut state = seeded(&[]);
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

    state.merge(ResultEnvelope::ok("cert-lookup", "example.com", cert("DigiCert Inc")).observed_at(t0));
    state.merge(ResultEnvelope::failed(
        "cert-lookup",
        "example.com",
        &ReconError::timeout("crt.sh query", 5000),
    ));
    state.merge(ResultEnvelope::ok("http", "example.com", http("PHP/7.4")));

    assert_eq!(state.payload("example.com", "cert-lookup"), Some(&cert("DigiCert Inc")));
    let slot = state.slot("example.com", "cert-lookup").unwrap();
    assert_eq!(slot.last_failure.as_ref().unwrap().status, EnvelopeStatus::Failed);

    // an older success loses to the stored one
    state.merge(
        ResultEnvelope::ok("cert-lookup", "example.com", cert("Let's Encrypt"))
            .observed_at(t0 - Duration::hours(1)),
    );
    assert_eq!(state.payload("example.com", "cert-lookup"), Some(&cert("DigiCert Inc")));
}

#[test]
fn alias_assertions_converge_in_any_order() {
    let www = || {
        ResultEnvelope::ok("subdomains", "www.example.com", ProbePayload::Custom(serde_json::json!({})))
            .with_aliases(["example.com"])
    };
    let ip = || {
        ResultEnvelope::ok("dns", "example.com", ProbePayload::Custom(serde_json::json!({})))
            .with_aliases(["203.0.113.5"])
    };

    let mut forward = seeded(&[]);
    forward.merge(www());
    forward.merge(ip());

    let mut backward = seeded(&[]);
    backward.merge(ip());
    backward.merge(www());

    for state in [&forward, &backward] {
        assert_eq!(state.len(), 1);
        let identity = state.resolver().lookup("203.0.113.5").unwrap();
        assert_eq!(identity.primary_name, "example.com");
        let aliases: Vec<_> = identity.aliases.iter().map(String::as_str).collect();
        assert_eq!(aliases, vec!["203.0.113.5", "example.com", "www.example.com"]);
    }
}

#[test]
fn scoring_is_deterministic_and_ordered_by_rule() {
    let mut state = seeded(&[]);
    // legacy stack observed before the credential leak
    state.merge(ResultEnvelope::ok("http", "example.com", http("PHP/5.6")));
    state.merge(ResultEnvelope::ok("github-leaks", "example.com", code_leak("db_password")));

    let config = ScoringConfig::default();
    let expected = config.weights.credential_leak + config.weights.legacy_stack;
    let engine = RiskEngine::new(config);

    let first = engine.evaluate(&state, "example.com").unwrap();
    let second = engine.evaluate(&state, "example.com").unwrap();

    assert_eq!(first.score, expected);
    assert_eq!(first.reasons, vec!["credential leak", "legacy stack"]);
    assert!(first.same_assessment(&second));
}

#[tokio::test]
async fn panicking_probe_leaves_other_results_intact() {
    let recorded = vec![
        ResultEnvelope::ok("http", "example.com", http("PHP/7.4")),
        ResultEnvelope::ok("http", "api.example.com", http("Express")),
    ];

    let mut coordinator = RunCoordinator::new(seeded(&["api.example.com"]), &AppConfig::default());
    coordinator.register(Arc::new(ReplayProbe::new("http", recorded))).unwrap();
    coordinator.register(Arc::new(PanickingProbe)).unwrap();

    let report = coordinator.run().await.unwrap();
    let audit = report.probes.iter().find(|p| p.probe == "bucket-audit").unwrap();
    assert_eq!(audit.failed, 2);

    let state = coordinator.state();
    let state = state.read().await;
    assert!(state.payload("example.com", "http").is_some());
    assert!(state.payload("api.example.com", "http").is_some());
    assert!(state.payload("example.com", "bucket-audit").is_none());

    let findings = RiskEngine::new(ScoringConfig::default()).evaluate_all(&state);
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].target, "example.com");
    assert_eq!(findings[0].reasons, vec!["legacy stack"]);
}

#[test]
fn target_without_data_is_still_listed() {
    let mut state = seeded(&["dark.example.com", "prod.example.com", "production-db.example.com"]);
    for target in ["dark.example.com", "prod.example.com"] {
        state.merge(ResultEnvelope::failed("http", target, &ReconError::network("connection refused")));
    }
    // names learned only through discovery and alias assertions, never probed
    state.merge(
        ResultEnvelope::ok("subdomains", "example.com", ProbePayload::Custom(serde_json::json!({})))
            .with_discovered(["prod-eu.example.com"]),
    );
    state.merge(
        ResultEnvelope::failed("dns", "production-db.example.com", &ReconError::network("NXDOMAIN"))
            .with_aliases(["db.prod.example.com"]),
    );
    state.merge(
        ResultEnvelope::ok("dns", "staging.example.com", ProbePayload::Custom(serde_json::json!({})))
            .with_aliases(["prod.staging.example.com"]),
    );

    let findings = RiskEngine::new(ScoringConfig::default()).evaluate_all(&state);
    for name in [
        "dark.example.com",
        "prod.example.com",
        "production-db.example.com",
        "prod-eu.example.com",
        "prod.staging.example.com",
    ] {
        let finding = findings
            .iter()
            .find(|f| state.identity(name).map(|i| i.primary_name == f.target).unwrap_or(false))
            .unwrap();
        assert_eq!(finding.score, 0, "{}", name);
        assert_eq!(finding.level, RiskLevel::Informational);
        assert!(finding.reasons.is_empty());
    }
}

#[tokio::test]
async fn rerunning_a_probe_with_identical_results_changes_nothing() {
    let observed = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    let recorded = vec![
        ResultEnvelope::ok("cert-lookup", "example.com", cert("Let's Encrypt"))
            .with_aliases(["www.example.com"])
            .observed_at(observed),
    ];

    let mut coordinator = RunCoordinator::new(seeded(&[]), &AppConfig::default());
    coordinator
        .register(Arc::new(ReplayProbe::new("cert-lookup", recorded)))
        .unwrap();
    coordinator.run().await.unwrap();

    let engine = RiskEngine::new(ScoringConfig::default());
    let (before, finding_before) = {
        let state = coordinator.state();
        let state = state.read().await;
        (state.to_json(false).unwrap(), engine.evaluate(&state, "example.com").unwrap())
    };

    let summary = coordinator.run_probe("cert-lookup").await.unwrap();
    assert_eq!(summary.ok, 1);

    let state = coordinator.state();
    let state = state.read().await;
    assert_eq!(state.to_json(false).unwrap(), before);
    assert_eq!(state.identity("example.com").unwrap().aliases.len(), 2);
    assert!(engine
        .evaluate(&state, "example.com")
        .unwrap()
        .same_assessment(&finding_before));
}
