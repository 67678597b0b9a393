//! Risk correlation engine
//!
//! Converts the merged per-target payloads into a score, a level and an
//! ordered list of reasons. Evaluation is a fixed pipeline of independent
//! [`FactorRule`]s; the score is the clamped sum of the weights of the rules
//! that fired. Given the same state, the same finding comes out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::warn;

use crate::{
    config::{RiskThresholds, ScoringConfig},
    envelope::{
        ArchivedScripts, BucketObservation, CertificateInfo, CodeHit, ErrorPageScan, HostExposure,
        HttpObservation, PathHit, ProbePayload,
    },
    error::{ReconError, Result},
    identity::TargetIdentity,
    metrics::RunMetrics,
    signals,
    state::{ProbeSlot, ReconState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u32, thresholds: &RiskThresholds) -> Self {
        if score >= thresholds.critical {
            Self::Critical
        } else if score >= thresholds.high {
            Self::High
        } else if score >= thresholds.medium {
            Self::Medium
        } else if score > 0 {
            Self::Low
        } else {
            Self::Informational
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "Informational",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One triggered rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factor {
    pub rule: String,
    pub weight: u32,
    /// Short human-readable factor name
    pub reason: String,
    /// What in the payloads made the rule fire
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl Factor {
    pub fn new(rule: &str, weight: u32, reason: &str) -> Self {
        Self {
            rule: rule.to_string(),
            weight,
            reason: reason.to_string(),
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence<I, S>(mut self, evidence: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evidence.extend(evidence.into_iter().map(Into::into));
        self
    }
}

/// A rule that failed on a target and was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDiagnostic {
    pub rule: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFinding {
    pub target: String,
    pub score: u32,
    pub level: RiskLevel,
    /// Reasons in rule evaluation order
    pub reasons: Vec<String>,
    pub factors: Vec<Factor>,
    pub ics_exposed: bool,
    /// The target's name could not be normalized; treat with low confidence
    pub malformed: bool,
    /// Suggested follow-up searches
    pub pivots: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<RuleDiagnostic>,
    pub evaluated_at: DateTime<Utc>,
}

impl RiskFinding {
    /// Equal apart from the evaluation timestamp
    pub fn same_assessment(&self, other: &RiskFinding) -> bool {
        Self {
            evaluated_at: other.evaluated_at,
            ..self.clone()
        } == *other
    }
}

/// Read-only view of one target's merged payloads
pub struct TargetView<'a> {
    pub identity: &'a TargetIdentity,
    slots: Option<&'a BTreeMap<String, ProbeSlot>>,
}

impl<'a> TargetView<'a> {
    pub fn new(state: &'a ReconState, identity: &'a TargetIdentity) -> Self {
        Self {
            identity,
            slots: state.slots(&identity.primary_name),
        }
    }

    /// Stored payloads in probe-name order
    pub fn payloads(&self) -> impl Iterator<Item = &'a ProbePayload> + 'a {
        self.slots
            .into_iter()
            .flat_map(|slots| slots.values())
            .filter_map(ProbeSlot::payload)
    }

    pub fn http(&self) -> impl Iterator<Item = &'a HttpObservation> + 'a {
        self.payloads().filter_map(|payload| match payload {
            ProbePayload::Http(http) => Some(http),
            _ => None,
        })
    }

    pub fn certificates(&self) -> impl Iterator<Item = &'a CertificateInfo> + 'a {
        self.payloads().filter_map(|payload| match payload {
            ProbePayload::Certificate(cert) => Some(cert),
            _ => None,
        })
    }

    pub fn buckets(&self) -> impl Iterator<Item = &'a BucketObservation> + 'a {
        self.payloads().flat_map(|payload| match payload {
            ProbePayload::Buckets(audit) => audit.buckets.as_slice(),
            _ => &[],
        })
    }

    pub fn code_hits(&self) -> impl Iterator<Item = &'a CodeHit> + 'a {
        self.payloads().flat_map(|payload| match payload {
            ProbePayload::CodeLeaks(result) => result.hits.as_slice(),
            _ => &[],
        })
    }

    pub fn hosts(&self) -> impl Iterator<Item = &'a HostExposure> + 'a {
        self.payloads().filter_map(|payload| match payload {
            ProbePayload::ExposedHost(host) => Some(host),
            _ => None,
        })
    }

    pub fn error_pages(&self) -> impl Iterator<Item = &'a ErrorPageScan> + 'a {
        self.payloads().filter_map(|payload| match payload {
            ProbePayload::ErrorPages(page) => Some(page),
            _ => None,
        })
    }

    pub fn path_hits(&self) -> impl Iterator<Item = &'a PathHit> + 'a {
        self.payloads().flat_map(|payload| match payload {
            ProbePayload::PathFuzz(scan) => scan.hits.as_slice(),
            _ => &[],
        })
    }

    pub fn archived_scripts(&self) -> impl Iterator<Item = &'a ArchivedScripts> + 'a {
        self.payloads().filter_map(|payload| match payload {
            ProbePayload::ArchivedScripts(scripts) => Some(scripts),
            _ => None,
        })
    }

    pub fn third_party_domains(&self) -> BTreeSet<&'a str> {
        self.payloads()
            .filter_map(|payload| match payload {
                ProbePayload::ThirdPartyScripts(scripts) => Some(scripts.domains.iter()),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Free text a leak could hide in: response bodies, error pages and
    /// code-search snippets
    pub fn texts(&self) -> Vec<&'a str> {
        let mut texts: Vec<&'a str> = Vec::new();
        for http in self.http() {
            texts.extend(http.body_excerpt.as_deref());
        }
        for page in self.error_pages() {
            texts.extend(page.html.as_deref());
            texts.extend(page.fragments.iter().map(String::as_str));
        }
        for hit in self.code_hits() {
            texts.extend(hit.snippet.as_deref());
        }
        texts
    }

    /// URLs the probes reported: final HTTP URLs, code-search results and
    /// archived scripts
    pub fn urls(&self) -> Vec<&'a str> {
        let mut urls: Vec<&'a str> = Vec::new();
        for http in self.http() {
            urls.extend(http.final_url.as_deref());
        }
        for hit in self.code_hits() {
            urls.extend(hit.urls.iter().map(String::as_str));
        }
        for scripts in self.archived_scripts() {
            urls.extend(scripts.script_urls.iter().map(String::as_str));
        }
        urls
    }

    /// `Server` values only
    pub fn server_names(&self) -> Vec<&'a str> {
        let mut values = Vec::new();
        for http in self.http() {
            values.extend(http.server.as_deref());
            if let Some(headers) = &http.headers {
                values.extend(
                    headers
                        .iter()
                        .filter(|(name, _)| name.eq_ignore_ascii_case("server"))
                        .map(|(_, value)| value.as_str()),
                );
            }
        }
        values
    }

    /// `Server` and `X-Powered-By` values
    pub fn stack_fingerprints(&self) -> Vec<&'a str> {
        let mut values = Vec::new();
        for http in self.http() {
            values.extend(http.server.as_deref());
            values.extend(http.powered_by.as_deref());
            if let Some(headers) = &http.headers {
                for (name, value) in headers {
                    if name.eq_ignore_ascii_case("server") || name.eq_ignore_ascii_case("x-powered-by") {
                        values.push(value.as_str());
                    }
                }
            }
        }
        values
    }
}

/// A single scoring heuristic. Must be total over payload shapes: a rule
/// whose inputs are missing returns `Ok(None)`.
pub trait FactorRule: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>>;
}

/// Names of the built-in rules in evaluation order
pub const BUILTIN_RULES: [&str; 14] = [
    "credential_leak",
    "authorization_token",
    "listable_storage",
    "sensitive_endpoint",
    "ics_exposure",
    "legacy_stack",
    "risky_script",
    "debug_output",
    "error_status",
    "cloud_hosted",
    "free_certificate",
    "identified_stack",
    "production_indicator",
    "third_party_sprawl",
];

struct CredentialLeak {
    weight: u32,
}

impl FactorRule for CredentialLeak {
    fn name(&self) -> &str {
        "credential_leak"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let mut evidence: BTreeSet<String> = view
            .code_hits()
            .filter(|hit| hit.total_count > 0 && signals::is_credential_keyword(&hit.keyword))
            .map(|hit| format!("code search: {}", hit.keyword))
            .collect();
        if view.texts().iter().any(|text| signals::has_credential_assignment(text)) {
            evidence.insert("credential assignment in page content".to_string());
        }

        Ok((!evidence.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "credential leak").with_evidence(evidence)))
    }
}

struct AuthorizationToken {
    weight: u32,
}

impl FactorRule for AuthorizationToken {
    fn name(&self) -> &str {
        "authorization_token"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let found = view.texts().iter().any(|text| signals::has_auth_token(text));
        Ok(found.then(|| Factor::new(self.name(), self.weight, "authorization token pattern")))
    }
}

struct ListableStorage {
    weight: u32,
}

impl FactorRule for ListableStorage {
    fn name(&self) -> &str {
        "listable_storage"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let listable: Vec<String> = view
            .buckets()
            .filter(|bucket| bucket.listable == Some(true))
            .map(|bucket| format!("{} ({})", bucket.name, bucket.provider.as_str()))
            .collect();
        Ok((!listable.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "publicly listable storage").with_evidence(listable)))
    }
}

struct SensitiveEndpoint {
    weight: u32,
}

impl FactorRule for SensitiveEndpoint {
    fn name(&self) -> &str {
        "sensitive_endpoint"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let exposed: BTreeSet<String> = view
            .path_hits()
            .filter(|hit| hit.status == 200 && signals::is_sensitive_path(&hit.path))
            .map(|hit| hit.path.clone())
            .collect();
        Ok((!exposed.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "sensitive endpoint").with_evidence(exposed)))
    }
}

struct IcsExposure {
    weight: u32,
}

impl FactorRule for IcsExposure {
    fn name(&self) -> &str {
        "ics_exposure"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let ports: BTreeSet<u16> = view
            .hosts()
            .filter_map(|host| host.open_ports.as_ref())
            .flatten()
            .copied()
            .filter(|port| signals::is_ics_port(*port))
            .collect();
        Ok((!ports.is_empty()).then(|| {
            Factor::new(self.name(), self.weight, "industrial control exposure")
                .with_evidence(ports.iter().map(|port| format!("port {}", port)))
        }))
    }
}

struct LegacyStack {
    weight: u32,
}

impl FactorRule for LegacyStack {
    fn name(&self) -> &str {
        "legacy_stack"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let markers: BTreeSet<&str> = view
            .stack_fingerprints()
            .into_iter()
            .filter_map(signals::legacy_stack_marker)
            .collect();
        Ok((!markers.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "legacy stack").with_evidence(markers)))
    }
}

struct RiskyScript {
    weight: u32,
}

impl FactorRule for RiskyScript {
    fn name(&self) -> &str {
        "risky_script"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let mut evidence = BTreeSet::new();
        for scripts in view.archived_scripts() {
            for (url, source) in &scripts.sources {
                for signal in signals::script_signals(source) {
                    let rating = if signal.high { "High" } else { "Medium" };
                    evidence.insert(format!("{} in {}: {} [{}]", signal.pattern, url, signal.mapping, rating));
                }
            }
        }
        Ok((!evidence.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "risky archived script").with_evidence(evidence)))
    }
}

struct DebugOutput {
    weight: u32,
}

impl FactorRule for DebugOutput {
    fn name(&self) -> &str {
        "debug_output"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let mut fragments: BTreeSet<String> = BTreeSet::new();
        for page in view.error_pages() {
            fragments.extend(page.fragments.iter().cloned());
            if let Some(html) = &page.html {
                fragments.extend(signals::extract_error_fragments(html));
            }
        }
        let body_trace = view
            .http()
            .filter_map(|http| http.body_excerpt.as_deref())
            .any(signals::has_debug_output);

        if fragments.is_empty() && !body_trace {
            return Ok(None);
        }
        Ok(Some(
            Factor::new(self.name(), self.weight, "debug output").with_evidence(fragments.into_iter().take(5)),
        ))
    }
}

struct ErrorStatus {
    weight: u32,
}

impl FactorRule for ErrorStatus {
    fn name(&self) -> &str {
        "error_status"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let status = view.http().filter_map(|http| http.status_code).filter(|code| *code >= 400).max();
        Ok(status.map(|code| {
            Factor::new(self.name(), self.weight, "error status").with_evidence([format!("HTTP {}", code)])
        }))
    }
}

struct CloudHosted {
    weight: u32,
}

impl FactorRule for CloudHosted {
    fn name(&self) -> &str {
        "cloud_hosted"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let mut fingerprint = String::new();
        for http in view.http() {
            for cname in http.cname.iter().flatten() {
                fingerprint.push_str(cname);
                fingerprint.push(' ');
            }
            if let Some(headers) = &http.headers {
                for (name, value) in headers {
                    fingerprint.push_str(name);
                    fingerprint.push(' ');
                    fingerprint.push_str(value);
                    fingerprint.push(' ');
                }
            }
        }
        for value in view.stack_fingerprints() {
            fingerprint.push_str(value);
            fingerprint.push(' ');
        }
        for cert in view.certificates() {
            if let Some(issuer) = &cert.issuer_org {
                fingerprint.push_str(issuer);
                fingerprint.push(' ');
            }
        }

        let provider = signals::classify_cloud(&fingerprint)
            .or_else(|| view.buckets().find(|bucket| bucket.accessible).map(|bucket| bucket.provider));

        Ok(provider.map(|provider| {
            Factor::new(self.name(), self.weight, "cloud hosted").with_evidence([provider.as_str()])
        }))
    }
}

struct FreeCertificate {
    weight: u32,
}

impl FactorRule for FreeCertificate {
    fn name(&self) -> &str {
        "free_certificate"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let mut evidence = BTreeSet::new();
        for cert in view.certificates() {
            if let Some(issuer) = cert.issuer_org.as_deref() {
                if signals::is_free_certificate_issuer(issuer) {
                    evidence.insert(issuer.to_string());
                }
            }
            if let Some(days) = cert.validity_days().filter(|days| signals::is_short_lived(*days)) {
                evidence.insert(format!("valid for {} days", days));
            }
        }
        Ok((!evidence.is_empty()).then(|| {
            Factor::new(self.name(), self.weight, "short-lived free certificate").with_evidence(evidence)
        }))
    }
}

struct IdentifiedStack {
    weight: u32,
}

impl FactorRule for IdentifiedStack {
    fn name(&self) -> &str {
        "identified_stack"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let servers: BTreeSet<&str> = view
            .server_names()
            .into_iter()
            .filter_map(signals::identified_stack_marker)
            .collect();
        Ok((!servers.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "identified stack").with_evidence(servers)))
    }
}

struct ProductionIndicator {
    weight: u32,
}

impl FactorRule for ProductionIndicator {
    fn name(&self) -> &str {
        "production_indicator"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        // only what probes reported counts; the target's own names do not
        let mut evidence: BTreeSet<String> = view
            .urls()
            .into_iter()
            .filter(|url| signals::has_production_marker(url))
            .map(str::to_string)
            .collect();
        if view.texts().iter().any(|text| signals::has_production_marker(text)) {
            evidence.insert("production marker in page content".to_string());
        }
        Ok((!evidence.is_empty())
            .then(|| Factor::new(self.name(), self.weight, "production indicator").with_evidence(evidence)))
    }
}

struct ThirdPartySprawl {
    weight: u32,
    min_domains: usize,
}

impl FactorRule for ThirdPartySprawl {
    fn name(&self) -> &str {
        "third_party_sprawl"
    }

    fn evaluate(&self, view: &TargetView<'_>) -> Result<Option<Factor>> {
        let domains = view.third_party_domains();
        if self.min_domains == 0 || domains.len() < self.min_domains {
            return Ok(None);
        }
        Ok(Some(
            Factor::new(self.name(), self.weight, "third-party script sprawl")
                .with_evidence([format!("{} script domains", domains.len())]),
        ))
    }
}

fn builtin_rules(config: &ScoringConfig) -> Vec<Box<dyn FactorRule>> {
    let weights = &config.weights;
    vec![
        Box::new(CredentialLeak { weight: weights.credential_leak }),
        Box::new(AuthorizationToken { weight: weights.authorization_token }),
        Box::new(ListableStorage { weight: weights.listable_storage }),
        Box::new(SensitiveEndpoint { weight: weights.sensitive_endpoint }),
        Box::new(IcsExposure { weight: weights.ics_exposure }),
        Box::new(LegacyStack { weight: weights.legacy_stack }),
        Box::new(RiskyScript { weight: weights.risky_script }),
        Box::new(DebugOutput { weight: weights.debug_output }),
        Box::new(ErrorStatus { weight: weights.error_status }),
        Box::new(CloudHosted { weight: weights.cloud_hosted }),
        Box::new(FreeCertificate { weight: weights.free_certificate }),
        Box::new(IdentifiedStack { weight: weights.identified_stack }),
        Box::new(ProductionIndicator { weight: weights.production_indicator }),
        Box::new(ThirdPartySprawl {
            weight: weights.third_party_sprawl,
            min_domains: config.sprawl_domain_count,
        }),
    ]
}

pub struct RiskEngine {
    config: ScoringConfig,
    rules: Vec<Box<dyn FactorRule>>,
    metrics: Option<Arc<RunMetrics>>,
}

impl RiskEngine {
    pub fn new(config: ScoringConfig) -> Self {
        let rules = builtin_rules(&config);
        Self {
            config,
            rules,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append a rule; it runs after every rule already registered
    pub fn register(&mut self, rule: Box<dyn FactorRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Score one target, known by any of its names
    pub fn evaluate(&self, state: &ReconState, target: &str) -> Result<RiskFinding> {
        let identity = state
            .identity(target)
            .ok_or_else(|| ReconError::invalid_target(target, "unknown to this run"))?;
        Ok(self.evaluate_identity(state, identity))
    }

    /// Score every identity; highest score first, ties by target name
    pub fn evaluate_all(&self, state: &ReconState) -> Vec<RiskFinding> {
        let mut findings: Vec<RiskFinding> = state
            .identities()
            .map(|identity| self.evaluate_identity(state, identity))
            .collect();
        findings.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.target.cmp(&b.target)));

        if let Some(metrics) = &self.metrics {
            metrics.record_findings(findings.len());
        }
        findings
    }

    fn evaluate_identity(&self, state: &ReconState, identity: &TargetIdentity) -> RiskFinding {
        let view = TargetView::new(state, identity);
        let mut factors = Vec::new();
        let mut diagnostics = Vec::new();

        for rule in &self.rules {
            match catch_unwind(AssertUnwindSafe(|| rule.evaluate(&view))) {
                Ok(Ok(Some(factor))) => factors.push(factor),
                Ok(Ok(None)) => {}
                Ok(Err(error)) => diagnostics.push(self.rule_failed(rule.name(), identity, error.to_string())),
                Err(panic) => diagnostics.push(self.rule_failed(rule.name(), identity, panic_message(panic.as_ref()))),
            }
        }

        let total: u64 = factors.iter().map(|factor| u64::from(factor.weight)).sum();
        let score = total.min(u64::from(self.config.max_score)) as u32;
        let level = RiskLevel::from_score(score, &self.config.thresholds);

        RiskFinding {
            target: identity.primary_name.clone(),
            score,
            level,
            reasons: factors.iter().map(|factor| factor.reason.clone()).collect(),
            ics_exposed: factors.iter().any(|factor| factor.rule == "ics_exposure"),
            malformed: identity.is_malformed(),
            pivots: suggest_pivots(&view, level),
            factors,
            diagnostics,
            evaluated_at: Utc::now(),
        }
    }

    fn rule_failed(&self, rule: &str, identity: &TargetIdentity, message: String) -> RuleDiagnostic {
        warn!(
            rule = rule,
            target = %identity.primary_name,
            error = %message,
            event = "rule_error",
            "Factor rule skipped"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_rule_error(rule);
        }
        RuleDiagnostic {
            rule: rule.to_string(),
            message,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("rule panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("rule panicked: {}", message)
    } else {
        "rule panicked".to_string()
    }
}

/// Follow-up searches for a target, from its stack fingerprint and level
fn suggest_pivots(view: &TargetView<'_>, level: RiskLevel) -> Vec<String> {
    let domain = &view.identity.primary_name;
    let stack = view.stack_fingerprints().join(" ").to_ascii_lowercase();
    let mut pivots = Vec::new();

    if stack.contains("django") {
        pivots.push(format!("site:github.com \"settings.py\" {}", domain));
    }
    if stack.contains("php") {
        pivots.push(format!("site:github.com \"config.php\" {}", domain));
    }
    if stack.contains("asp.net") {
        pivots.push(format!("site:github.com Web.config {}", domain));
    }
    if level >= RiskLevel::High {
        pivots.push(format!("Check S3 buckets or cloud blobs linked to {}", domain));
        pivots.push(format!("Try fuzzing /admin /debug /internal on {}", domain));
    }
    pivots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::{BucketAudit, CloudProvider, CodeSearchResult, ResultEnvelope},
        state::Seed,
    };

    fn state() -> ReconState {
        ReconState::seed(Seed::new("example.com")).unwrap()
    }

    fn http(powered_by: &str, status: u16) -> ProbePayload {
        ProbePayload::Http(HttpObservation {
            status_code: Some(status),
            powered_by: Some(powered_by.to_string()),
            ..Default::default()
        })
    }

    fn code_leak(keyword: &str) -> ProbePayload {
        ProbePayload::CodeLeaks(CodeSearchResult {
            hits: vec![CodeHit {
                keyword: keyword.to_string(),
                query: format!("\"example.com\" {}", keyword),
                total_count: 3,
                urls: Vec::new(),
                snippet: None,
            }],
        })
    }

    #[test]
    fn test_level_thresholds() {
        let thresholds = RiskThresholds::default();
        assert_eq!(RiskLevel::from_score(0, &thresholds), RiskLevel::Informational);
        assert_eq!(RiskLevel::from_score(5, &thresholds), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(20, &thresholds), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(40, &thresholds), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(70, &thresholds), RiskLevel::Critical);
    }

    #[test]
    fn test_score_is_sum_of_weights_in_rule_order() {
        let mut state = state();
        // legacy stack observed before the leak; reasons still follow rule order
        state.merge(ResultEnvelope::ok("http", "example.com", http("PHP/7.4", 200)));
        state.merge(ResultEnvelope::ok("github-search", "example.com", code_leak("db_password")));

        let engine = RiskEngine::new(ScoringConfig::default());
        let finding = engine.evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 40 + 15);
        assert_eq!(finding.level, RiskLevel::High);
        assert_eq!(finding.reasons, vec!["credential leak", "legacy stack"]);
        assert!(finding.pivots.iter().any(|p| p.contains("config.php")));

        let again = engine.evaluate(&state, "example.com").unwrap();
        assert!(finding.same_assessment(&again));
    }

    #[test]
    fn test_score_clamped_to_max() {
        let mut state = state();
        state.merge(ResultEnvelope::ok("github-search", "example.com", code_leak("password")));
        state.merge(ResultEnvelope::ok(
            "bucket-audit",
            "example.com",
            ProbePayload::Buckets(BucketAudit {
                buckets: vec![BucketObservation {
                    name: "example-backup".to_string(),
                    provider: CloudProvider::Aws,
                    accessible: true,
                    listable: Some(true),
                    sample_keys: Vec::new(),
                }],
            }),
        ));
        state.merge(ResultEnvelope::ok(
            "shodan",
            "example.com",
            ProbePayload::ExposedHost(HostExposure {
                open_ports: Some(vec![443, 502]),
                ..Default::default()
            }),
        ));

        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 100);
        assert_eq!(finding.level, RiskLevel::Critical);
        assert!(finding.ics_exposed);
    }

    #[test]
    fn test_partial_payload_absent_fields_do_not_fire() {
        let mut state = state();
        state.merge(ResultEnvelope::partial(
            "http",
            "example.com",
            ProbePayload::Http(HttpObservation::default()),
            "connection closed before headers",
        ));
        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 0);
        assert!(finding.reasons.is_empty());
    }

    struct Exploding;

    impl FactorRule for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn evaluate(&self, _view: &TargetView<'_>) -> Result<Option<Factor>> {
            panic!("unexpected payload shape")
        }
    }

    struct Refusing;

    impl FactorRule for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn evaluate(&self, _view: &TargetView<'_>) -> Result<Option<Factor>> {
            Err(ReconError::rule("refusing", "cannot read payload"))
        }
    }

    #[test]
    fn test_misbehaving_rules_are_skipped() {
        let mut state = state();
        state.merge(ResultEnvelope::ok("http", "example.com", http("ASP.NET", 500)));

        let metrics = Arc::new(RunMetrics::new());
        let mut engine = RiskEngine::new(ScoringConfig::default()).with_metrics(metrics.clone());
        engine.register(Box::new(Exploding));
        engine.register(Box::new(Refusing));

        let finding = engine.evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 15 + 5);
        assert_eq!(finding.diagnostics.len(), 2);
        assert!(finding.diagnostics[0].message.contains("unexpected payload shape"));
        assert_eq!(metrics.snapshot().rule_errors, 2);
    }

    #[test]
    fn test_evaluate_all_sorted_and_complete() {
        let mut state = state();
        state.merge(
            ResultEnvelope::ok("subdomain-enum", "example.com", ProbePayload::Custom(serde_json::Value::Null))
                .with_discovered(["api.example.com", "prod.example.com", "quiet.example.com"]),
        );
        state.merge(ResultEnvelope::ok("http", "api.example.com", http("PHP", 200)));

        let findings = RiskEngine::new(ScoringConfig::default()).evaluate_all(&state);
        let order: Vec<_> = findings.iter().map(|f| (f.target.as_str(), f.score)).collect();
        assert_eq!(
            order,
            vec![
                ("api.example.com", 15),
                ("example.com", 0),
                ("prod.example.com", 0),
                ("quiet.example.com", 0),
            ]
        );
        assert_eq!(findings[2].level, RiskLevel::Informational);
        assert_eq!(findings[3].level, RiskLevel::Informational);
    }

    #[test]
    fn test_production_name_alone_scores_zero() {
        let mut state = ReconState::seed(Seed::new("prod.example.com").with_targets(["production-api.example.com"]))
            .unwrap();
        state.merge(ResultEnvelope::failed(
            "http",
            "prod.example.com",
            &ReconError::network("connection refused"),
        ));

        let engine = RiskEngine::new(ScoringConfig::default());
        for target in ["prod.example.com", "production-api.example.com"] {
            let finding = engine.evaluate(&state, target).unwrap();
            assert_eq!(finding.score, 0, "{}", target);
            assert_eq!(finding.level, RiskLevel::Informational);
            assert!(finding.reasons.is_empty());
        }
    }

    #[test]
    fn test_production_marker_in_reported_urls() {
        let mut state = state();
        state.merge(ResultEnvelope::ok(
            "http",
            "example.com",
            ProbePayload::Http(HttpObservation {
                status_code: Some(200),
                final_url: Some("https://example.com/prod/login".to_string()),
                ..Default::default()
            }),
        ));
        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.reasons, vec!["production indicator"]);
        assert_eq!(finding.factors[0].evidence, vec!["https://example.com/prod/login"]);
    }

    #[test]
    fn test_archived_script_patterns() {
        let mut state = state();
        let url = "https://example.com/static/app.js".to_string();
        state.merge(ResultEnvelope::ok(
            "wayback-js",
            "example.com",
            ProbePayload::ArchivedScripts(ArchivedScripts {
                script_urls: vec![url.clone(), "https://example.com/static/vendor.js".to_string()],
                sources: [(url, "const apiKey = cfg.key; eval(payload);".to_string())]
                    .into_iter()
                    .collect(),
            }),
        ));

        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 20);
        assert_eq!(finding.reasons, vec!["risky archived script"]);
        let evidence = &finding.factors[0].evidence;
        assert_eq!(evidence.len(), 2);
        assert!(evidence.iter().any(|e| e.starts_with("eval") && e.ends_with("[High]")));
        assert!(evidence.iter().any(|e| e.contains("API key disclosure")));
    }

    #[test]
    fn test_short_lived_certificate_without_free_issuer() {
        let mut state = state();
        let start = Utc::now();
        state.merge(ResultEnvelope::ok(
            "cert-lookup",
            "example.com",
            ProbePayload::Certificate(CertificateInfo {
                issuer_org: Some("Google Trust Services".to_string()),
                not_before: Some(start),
                not_after: Some(start + chrono::Duration::days(90)),
                ..Default::default()
            }),
        ));
        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.reasons, vec!["short-lived free certificate"]);
        assert_eq!(finding.factors[0].evidence, vec!["valid for 90 days"]);
    }

    #[test]
    fn test_identified_stack_reads_server_only() {
        let mut state = state();
        state.merge(ResultEnvelope::ok(
            "http",
            "example.com",
            ProbePayload::Http(HttpObservation {
                status_code: Some(200),
                server: Some("nginx/1.18.0".to_string()),
                powered_by: Some("Express".to_string()),
                ..Default::default()
            }),
        ));
        let finding = RiskEngine::new(ScoringConfig::default()).evaluate(&state, "example.com").unwrap();
        assert_eq!(finding.score, 2);
        assert_eq!(finding.level, RiskLevel::Low);
        assert_eq!(finding.reasons, vec!["identified stack"]);
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let engine = RiskEngine::new(ScoringConfig::default());
        assert!(matches!(
            engine.evaluate(&state(), "other.org"),
            Err(ReconError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_builtin_rule_order() {
        let engine = RiskEngine::new(ScoringConfig::default());
        assert_eq!(engine.rule_names(), BUILTIN_RULES.to_vec());
    }
}
