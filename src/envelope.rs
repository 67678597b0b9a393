//! Result envelopes and typed probe payloads
//!
//! Every probe reports one [`ResultEnvelope`] per target it attempted. The
//! payload is typed per probe category; fields that a `partial` result may
//! lack are `Option`s, where `None` means "not observed" and never "absent
//! on the target".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ReconError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Ok,
    Partial,
    Failed,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn carries_payload(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform wrapper for one (probe, target) attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub probe_name: String,
    /// Target name as the probe saw it; resolved to an identity on merge
    pub target: String,
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ProbePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// Names the probe asserts are the same asset as `target`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Newly discovered names that become identities of their own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered: Vec<String>,
}

impl ResultEnvelope {
    pub fn ok(probe: impl Into<String>, target: impl Into<String>, payload: ProbePayload) -> Self {
        Self {
            probe_name: probe.into(),
            target: target.into(),
            status: EnvelopeStatus::Ok,
            payload: Some(payload),
            error_detail: None,
            observed_at: Utc::now(),
            aliases: Vec::new(),
            discovered: Vec::new(),
        }
    }

    /// Some but not all expected payload fields were obtained; `detail`
    /// says what is missing
    pub fn partial(
        probe: impl Into<String>,
        target: impl Into<String>,
        payload: ProbePayload,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status: EnvelopeStatus::Partial,
            error_detail: Some(detail.into()),
            ..Self::ok(probe, target, payload)
        }
    }

    pub fn failed(probe: impl Into<String>, target: impl Into<String>, error: &ReconError) -> Self {
        Self {
            probe_name: probe.into(),
            target: target.into(),
            status: EnvelopeStatus::Failed,
            payload: None,
            error_detail: Some(error.to_string()),
            observed_at: Utc::now(),
            aliases: Vec::new(),
            discovered: Vec::new(),
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

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// Check the payload/status/error invariant
    pub fn validate(&self) -> Result<()> {
        if self.probe_name.trim().is_empty() {
            return Err(ReconError::probe("<unnamed>", &self.target, "envelope has no probe name"));
        }
        match (self.status, self.payload.is_some(), self.error_detail.is_some()) {
            (EnvelopeStatus::Ok, true, false) => Ok(()),
            (EnvelopeStatus::Partial, true, true) => Ok(()),
            (EnvelopeStatus::Failed, false, true) => Ok(()),
            (status, has_payload, has_detail) => Err(ReconError::probe(
                &self.probe_name,
                &self.target,
                format!(
                    "invalid {} envelope (payload: {}, error detail: {})",
                    status, has_payload, has_detail
                ),
            )),
        }
    }

    /// Turn an envelope that breaks the invariant into a failed one that
    /// records why
    pub fn into_valid(self) -> Self {
        match self.validate() {
            Ok(()) => self,
            Err(error) => Self {
                observed_at: self.observed_at,
                ..Self::failed(self.probe_name, self.target, &error)
            },
        }
    }

    /// Same observable result, ignoring timestamps
    pub fn same_result(&self, other: &ResultEnvelope) -> bool {
        self.status == other.status
            && self.payload == other.payload
            && self.aliases == other.aliases
            && self.discovered == other.discovered
    }
}

/// Typed payload per probe category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ProbePayload {
    Subdomains(SubdomainList),
    Certificate(CertificateInfo),
    Http(HttpObservation),
    Buckets(BucketAudit),
    CodeLeaks(CodeSearchResult),
    ExposedHost(HostExposure),
    ErrorPages(ErrorPageScan),
    PathFuzz(PathScan),
    ThirdPartyScripts(ThirdPartyScripts),
    ArchivedScripts(ArchivedScripts),
    Custom(serde_json::Value),
}

impl ProbePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subdomains(_) => "subdomains",
            Self::Certificate(_) => "certificate",
            Self::Http(_) => "http",
            Self::Buckets(_) => "buckets",
            Self::CodeLeaks(_) => "code_leaks",
            Self::ExposedHost(_) => "exposed_host",
            Self::ErrorPages(_) => "error_pages",
            Self::PathFuzz(_) => "path_fuzz",
            Self::ThirdPartyScripts(_) => "third_party_scripts",
            Self::ArchivedScripts(_) => "archived_scripts",
            Self::Custom(_) => "custom",
        }
    }

    /// Names of the optional fields that carry a value
    pub fn populated_fields(&self) -> Vec<&'static str> {
        fn present(fields: &[(&'static str, bool)]) -> Vec<&'static str> {
            fields.iter().filter(|(_, set)| *set).map(|(name, _)| *name).collect()
        }

        match self {
            Self::Certificate(cert) => present(&[
                ("subject_cn", cert.subject_cn.is_some()),
                ("issuer_org", cert.issuer_org.is_some()),
                ("not_before", cert.not_before.is_some()),
                ("not_after", cert.not_after.is_some()),
                ("subject_alt_names", cert.subject_alt_names.is_some()),
                ("serial_number", cert.serial_number.is_some()),
            ]),
            Self::Http(http) => present(&[
                ("status_code", http.status_code.is_some()),
                ("final_url", http.final_url.is_some()),
                ("server", http.server.is_some()),
                ("powered_by", http.powered_by.is_some()),
                ("title", http.title.is_some()),
                ("headers", http.headers.is_some()),
                ("body_excerpt", http.body_excerpt.is_some()),
                ("cname", http.cname.is_some()),
            ]),
            Self::ExposedHost(host) => present(&[
                ("ip", host.ip.is_some()),
                ("open_ports", host.open_ports.is_some()),
                ("org", host.org.is_some()),
            ]),
            Self::ErrorPages(page) => present(&[
                ("status_code", page.status_code.is_some()),
                ("html", page.html.is_some()),
            ]),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubdomainList {
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    #[serde(default)]
    pub subject_cn: Option<String>,
    #[serde(default)]
    pub issuer_org: Option<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subject_alt_names: Option<Vec<String>>,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl CertificateInfo {
    /// Validity period in days, when both bounds were observed
    pub fn validity_days(&self) -> Option<i64> {
        match (self.not_before, self.not_after) {
            (Some(start), Some(end)) => Some((end - start).num_days()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpObservation {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub powered_by: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub body_excerpt: Option<String>,
    #[serde(default)]
    pub cname: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    Cloudflare,
    Oracle,
    DigitalOcean,
    Alibaba,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
            Self::Cloudflare => "Cloudflare",
            Self::Oracle => "Oracle",
            Self::DigitalOcean => "DigitalOcean",
            Self::Alibaba => "Alibaba",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketAudit {
    pub buckets: Vec<BucketObservation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketObservation {
    pub name: String,
    pub provider: CloudProvider,
    pub accessible: bool,
    /// `None` when the listing call was not attempted or did not answer
    #[serde(default)]
    pub listable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSearchResult {
    pub hits: Vec<CodeHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeHit {
    pub keyword: String,
    pub query: String,
    pub total_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostExposure {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub open_ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPageScan {
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Fragments the probe already extracted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<String>,
    /// Raw page, when the probe kept it
    #[serde(default)]
    pub html: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathScan {
    pub hits: Vec<PathHit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHit {
    pub path: String,
    pub status: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThirdPartyScripts {
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivedScripts {
    pub script_urls: Vec<String>,
    /// Fetched source, keyed by script URL; only the scripts that were pulled
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, String>,
}
