//! Target identity resolution
//!
//! Turns raw names reported by probes (hostnames, IP literals, URLs) into
//! canonical target identities and unifies identities when a probe asserts
//! that two names refer to the same asset.
//!
//! Equivalence is only ever created through [`IdentityResolver::merge_alias`];
//! two names that merely look alike stay separate identities.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    net::IpAddr,
};
use url::Url;

/// Classification of a normalized name. The ordering doubles as the
/// survivor preference: hostnames win over IPs, IPs over malformed names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameKind {
    Hostname,
    Ip,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    pub name: String,
    pub kind: NameKind,
}

impl NormalizedName {
    pub fn is_malformed(&self) -> bool {
        self.kind == NameKind::Malformed
    }

    fn malformed(raw: &str) -> Self {
        Self {
            name: raw.to_string(),
            kind: NameKind::Malformed,
        }
    }
}

/// Normalize a raw name into its canonical form.
///
/// Never fails: input that cannot be understood is kept as written (trimmed)
/// and classified as [`NameKind::Malformed`].
/// True for names that are empty once trimmed
pub fn is_blank(raw: &str) -> bool {
    raw.trim().is_empty()
}

pub fn normalize(raw: &str) -> NormalizedName {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NormalizedName::malformed(trimmed);
    }

    if trimmed.parse::<IpAddr>().is_ok() {
        return NormalizedName {
            name: trimmed.to_string(),
            kind: NameKind::Ip,
        };
    }

    let host = match extract_host(trimmed) {
        Some(host) => host,
        None => return NormalizedName::malformed(trimmed),
    };

    if host.parse::<IpAddr>().is_ok() {
        return NormalizedName {
            name: host,
            kind: NameKind::Ip,
        };
    }

    let host = host.to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    if is_valid_hostname(host) {
        NormalizedName {
            name: host.to_string(),
            kind: NameKind::Hostname,
        }
    } else {
        NormalizedName::malformed(trimmed)
    }
}

/// Pull the host part out of URL-shaped or `host[:port][/path]` input
fn extract_host(input: &str) -> Option<String> {
    if input.contains("://") {
        let url = Url::parse(input).ok()?;
        let host = url.host_str()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        return (!host.is_empty()).then(|| host.to_string());
    }

    let end = input
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(input.len());
    let authority = &input[..end];
    let authority = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };

    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']')?;
        return Some(rest[..close].to_string());
    }

    let host = match authority.split_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host
        }
        _ => authority,
    };

    (!host.is_empty()).then(|| host.to_string())
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

fn survivor_key(name: &str) -> (NameKind, &str) {
    (normalize(name).kind, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityTag {
    /// The primary name could not be normalized; consumers should deprioritize it
    Malformed,
    /// Introduced by the seed input rather than by a probe
    Seed,
}

/// Canonical key for one organizational asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub primary_name: String,
    /// Every known name of the asset, the primary name included
    pub aliases: BTreeSet<String>,
    pub first_seen_by: String,
    /// Which probe first asserted each alias
    pub alias_sources: BTreeMap<String, String>,
    pub tags: BTreeSet<IdentityTag>,
}

impl TargetIdentity {
    fn new(name: NormalizedName, seen_by: &str) -> Self {
        let mut tags = BTreeSet::new();
        if name.is_malformed() {
            tags.insert(IdentityTag::Malformed);
        }
        Self {
            primary_name: name.name.clone(),
            aliases: BTreeSet::from([name.name.clone()]),
            first_seen_by: seen_by.to_string(),
            alias_sources: BTreeMap::from([(name.name, seen_by.to_string())]),
            tags,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.tags.contains(&IdentityTag::Malformed)
    }

    /// True if `raw` normalizes to one of this identity's names
    pub fn knows(&self, raw: &str) -> bool {
        self.aliases.contains(&normalize(raw).name)
    }

    /// Union two identities; the survivor is chosen from the combined alias set
    fn absorb(self, other: TargetIdentity) -> TargetIdentity {
        let mut aliases = self.aliases;
        aliases.extend(other.aliases);

        let primary_name = aliases
            .iter()
            .min_by(|a, b| survivor_key(a).cmp(&survivor_key(b)))
            .cloned()
            .unwrap_or_else(|| self.primary_name.clone());

        let first_seen_by = if primary_name == other.primary_name {
            other.first_seen_by
        } else {
            self.first_seen_by
        };

        let mut alias_sources = self.alias_sources;
        for (alias, probe) in other.alias_sources {
            match alias_sources.get_mut(&alias) {
                Some(existing) if probe < *existing => *existing = probe,
                Some(_) => {}
                None => {
                    alias_sources.insert(alias, probe);
                }
            }
        }

        let mut tags = self.tags;
        tags.extend(other.tags);
        if normalize(&primary_name).is_malformed() {
            tags.insert(IdentityTag::Malformed);
        } else {
            tags.remove(&IdentityTag::Malformed);
        }

        TargetIdentity {
            primary_name,
            aliases,
            first_seen_by,
            alias_sources,
            tags,
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.aliases.len() > 1 {
            write!(f, "{} (+{} aliases)", self.primary_name, self.aliases.len() - 1)
        } else {
            write!(f, "{}", self.primary_name)
        }
    }
}

/// Result of an alias assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasOutcome {
    /// Primary name of the identity that now holds both names
    pub survivor: String,
    /// Former primary names that no longer exist as identities
    pub retired: Vec<String>,
    pub changed: bool,
}

/// Registry of every identity known to a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityResolver {
    identities: BTreeMap<String, TargetIdentity>,
    #[serde(skip)]
    index: HashMap<String, String>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a raw name to the primary name of its identity, creating the
    /// identity on first sight
    pub fn resolve(&mut self, raw: &str, seen_by: &str) -> String {
        let normalized = normalize(raw);
        if let Some(primary) = self.index.get(&normalized.name) {
            return primary.clone();
        }

        let identity = TargetIdentity::new(normalized, seen_by);
        let primary = identity.primary_name.clone();
        self.index.insert(primary.clone(), primary.clone());
        self.identities.insert(primary.clone(), identity);
        primary
    }

    pub fn lookup(&self, raw: &str) -> Option<&TargetIdentity> {
        let normalized = normalize(raw);
        self.index
            .get(&normalized.name)
            .and_then(|primary| self.identities.get(primary))
    }

    pub fn get(&self, primary: &str) -> Option<&TargetIdentity> {
        self.identities.get(primary)
    }

    pub fn tag(&mut self, raw: &str, tag: IdentityTag) {
        let primary = match self.index.get(&normalize(raw).name) {
            Some(primary) => primary.clone(),
            None => return,
        };
        if let Some(identity) = self.identities.get_mut(&primary) {
            identity.tags.insert(tag);
        }
    }

    /// Record that `other` names the same asset as `known`.
    ///
    /// Idempotent; when both names already belong to different identities
    /// the two are unified under the deterministic survivor.
    pub fn merge_alias(&mut self, known: &str, other: &str, asserted_by: &str) -> AliasOutcome {
        // a blank name identifies nothing and never links two assets
        if is_blank(known) || is_blank(other) {
            return AliasOutcome {
                survivor: self.resolve(known, asserted_by),
                retired: Vec::new(),
                changed: false,
            };
        }

        let left = self.resolve(known, asserted_by);
        let right = self.resolve(other, asserted_by);
        if left == right {
            return AliasOutcome {
                survivor: left,
                retired: Vec::new(),
                changed: false,
            };
        }

        let (a, b) = match (self.identities.remove(&left), self.identities.remove(&right)) {
            (Some(a), Some(b)) => (a, b),
            (a, b) => {
                // index and table disagree; put back whatever we took
                for identity in a.into_iter().chain(b) {
                    self.identities.insert(identity.primary_name.clone(), identity);
                }
                return AliasOutcome {
                    survivor: left,
                    retired: Vec::new(),
                    changed: false,
                };
            }
        };

        let merged = a.absorb(b);
        let survivor = merged.primary_name.clone();
        for alias in &merged.aliases {
            self.index.insert(alias.clone(), survivor.clone());
        }
        self.identities.insert(survivor.clone(), merged);

        let retired = [left, right]
            .into_iter()
            .filter(|name| *name != survivor)
            .collect();

        AliasOutcome {
            survivor,
            retired,
            changed: true,
        }
    }

    /// All identities in primary-name order
    pub fn identities(&self) -> impl Iterator<Item = &TargetIdentity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Rebuild the alias index, required after deserialization
    pub fn reindex(&mut self) {
        self.index.clear();
        for identity in self.identities.values() {
            for alias in &identity.aliases {
                self.index
                    .insert(alias.clone(), identity.primary_name.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_hostnames() {
        assert_eq!(normalize("Example.COM.").name, "example.com");
        assert_eq!(normalize("  www.example.com  ").name, "www.example.com");
        assert_eq!(normalize("https://WWW.Example.com:8443/login?x=1").name, "www.example.com");
        assert_eq!(normalize("api.example.com:443").name, "api.example.com");
        assert_eq!(normalize("admin@mail.example.com/inbox").name, "mail.example.com");
        assert_eq!(normalize("dev_box.example.com").kind, NameKind::Hostname);
    }

    #[test]
    fn test_normalize_ip_literals_untouched() {
        let v4 = normalize("203.0.113.5");
        assert_eq!(v4.kind, NameKind::Ip);
        assert_eq!(v4.name, "203.0.113.5");

        let v6 = normalize("2001:DB8::1");
        assert_eq!(v6.kind, NameKind::Ip);
        assert_eq!(v6.name, "2001:DB8::1");

        assert_eq!(normalize("http://[2001:db8::1]:8080/").name, "2001:db8::1");
        assert_eq!(normalize("198.51.100.7:8080").kind, NameKind::Ip);
    }

    #[test]
    fn test_malformed_names_kept_as_is() {
        let wildcard = normalize("*.Example.com");
        assert!(wildcard.is_malformed());
        assert_eq!(wildcard.name, "*.Example.com");

        assert!(normalize("").is_malformed());
        assert!(normalize("not a host").is_malformed());
        assert!(normalize("-bad-.example.com").is_malformed());
    }

    #[test]
    fn test_resolve_creates_once() {
        let mut resolver = IdentityResolver::new();
        let first = resolver.resolve("Example.com.", "seed");
        let second = resolver.resolve("https://example.com/", "http-probe");
        assert_eq!(first, second);
        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.get(&first).unwrap().first_seen_by, "seed");
    }

    #[test]
    fn test_malformed_identity_is_tagged() {
        let mut resolver = IdentityResolver::new();
        let primary = resolver.resolve("*.example.com", "cert-lookup");
        let identity = resolver.get(&primary).unwrap();
        assert!(identity.is_malformed());
        assert_eq!(identity.first_seen_by, "cert-lookup");
    }

    #[test]
    fn test_merge_alias_idempotent() {
        let mut resolver = IdentityResolver::new();
        resolver.resolve("example.com", "seed");
        let first = resolver.merge_alias("example.com", "www.example.com", "cert-lookup");
        assert!(first.changed);
        let again = resolver.merge_alias("example.com", "www.example.com", "cert-lookup");
        assert!(!again.changed);
        assert!(again.retired.is_empty());
        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.get("example.com").unwrap().aliases.len(), 2);
    }

    #[test]
    fn test_blank_alias_is_not_an_equivalence_key() {
        let mut resolver = IdentityResolver::new();
        let a = resolver.merge_alias("a-corp.com", "", "dns");
        let b = resolver.merge_alias("b-corp.org", "   ", "dns");
        assert!(!a.changed && !b.changed);
        assert_eq!(a.survivor, "a-corp.com");
        assert_eq!(resolver.len(), 2);
        assert!(resolver.lookup("").is_none());
    }

    #[test]
    fn test_identity_convergence_any_order() {
        let names = ["www.example.com", "example.com", "203.0.113.5"];

        let mut forward = IdentityResolver::new();
        forward.merge_alias("www.example.com", "example.com", "probe-a");
        forward.merge_alias("example.com", "203.0.113.5", "probe-b");

        let mut backward = IdentityResolver::new();
        backward.merge_alias("example.com", "203.0.113.5", "probe-b");
        backward.merge_alias("www.example.com", "example.com", "probe-a");

        for resolver in [&forward, &backward] {
            assert_eq!(resolver.len(), 1);
            let identity = resolver.lookup("203.0.113.5").unwrap();
            assert_eq!(identity.primary_name, "example.com");
            for name in names {
                assert!(identity.aliases.contains(name));
            }
        }
    }

    #[test]
    fn test_unification_reports_retired_primary() {
        let mut resolver = IdentityResolver::new();
        resolver.resolve("www.example.com", "subdomain-enum");
        resolver.resolve("example.com", "seed");
        let outcome = resolver.merge_alias("www.example.com", "example.com", "cert-lookup");
        assert_eq!(outcome.survivor, "example.com");
        assert_eq!(outcome.retired, vec!["www.example.com".to_string()]);
        assert_eq!(resolver.lookup("www.example.com").unwrap().primary_name, "example.com");
    }

    #[test]
    fn test_reindex_after_deserialize() {
        let mut resolver = IdentityResolver::new();
        resolver.merge_alias("example.com", "www.example.com", "cert-lookup");
        let json = serde_json::to_string(&resolver).unwrap();
        let mut restored: IdentityResolver = serde_json::from_str(&json).unwrap();
        assert!(restored.lookup("www.example.com").is_none());
        restored.reindex();
        assert_eq!(restored.lookup("www.example.com").unwrap().primary_name, "example.com");
    }
}
