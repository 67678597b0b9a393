//! Raw-signal extraction
//!
//! Keyword banks, compiled patterns and small classifiers shared by the
//! factor rules. Everything here is a pure function of its input.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use crate::envelope::CloudProvider;

/// Code-search keywords that indicate a leaked secret rather than a
/// generic config mention
pub const CREDENTIAL_KEYWORDS: &[&str] = &[
    "password",
    "secret",
    "apikey",
    "api_key",
    "credential",
    "token",
    "db_password",
    "jwt",
    "auth_token",
    "encryption_key",
    "private_key",
    "client_secret",
    "access_token",
    "slack_token",
    "azure_key",
    "gcp_key",
    "scada_password",
    "hmi_password",
    "siemens_password",
    "firmware_password",
    "ics_credentials",
];

/// Paths whose exposure is a finding on its own when they answer 200
pub const SENSITIVE_PATHS: &[&str] = &[
    "/.env",
    "/.git",
    "/.aws",
    "/admin",
    "/config",
    "/debug",
    "/backup",
    "/phpinfo.php",
    "/server-status",
    "/.ds_store",
    "/wp-admin",
    "/debug.log",
];

/// Industrial-control protocol ports (S7, Modbus, Niagara Fox, DNP3,
/// EtherNet/IP, BACnet)
pub const ICS_PORTS: &[u16] = &[102, 502, 1911, 1962, 20000, 44818, 47808];

const LEGACY_STACK_MARKERS: &[&str] = &["php", "asp.net"];

/// Web servers that give away the stack when named in `Server`
const IDENTIFIED_STACK_MARKERS: &[&str] = &["apache", "nginx", "iis"];

const FREE_CERT_ISSUERS: &[&str] = &["let's encrypt", "zerossl", "buypass"];

/// Certificates valid for this many days or fewer count as short-lived
pub const SHORT_LIVED_CERT_DAYS: i64 = 90;

const CLOUD_PATTERNS: &[(CloudProvider, &[&str])] = &[
    (
        CloudProvider::Aws,
        &["amazonaws.com", "cloudfront.net", "amazon", "awselb", "x-amz-"],
    ),
    (
        CloudProvider::Azure,
        &["azurewebsites.net", "cloudapp.net", "windows.net", "azure", "microsoft"],
    ),
    (
        CloudProvider::Gcp,
        &["appspot.com", "googleusercontent.com", "storage.googleapis.com", "google"],
    ),
    (CloudProvider::Cloudflare, &["cloudflare", "cf-ray", "cf-cache-status"]),
    (CloudProvider::Oracle, &["oraclecloud.com", "objectstorage", "oracle"]),
    (CloudProvider::DigitalOcean, &["digitalocean"]),
    (CloudProvider::Alibaba, &["aliyun.com", "alibaba"]),
];

static AUTH_TOKEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:authorization|bearer|basic)\s+[a-z0-9\-_.]+").expect("auth token pattern")
});

static CREDENTIAL_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:api[_-]?key|secret|token|passw(?:or)?d)["']?\s*[:=]\s*["']?[a-z0-9\-_./+]{6,}"#)
        .expect("credential assignment pattern")
});

static DEBUG_OUTPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)error.*(?:stack|trace|exception)").expect("debug output pattern")
});

static PRODUCTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bprod(?:uction)?\b").expect("production marker pattern"));

/// A risky construct found in archived JavaScript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSignal {
    pub pattern: &'static str,
    /// ATT&CK technique or exposure class the construct maps to
    pub mapping: &'static str,
    pub high: bool,
}

const SCRIPT_SIGNALS: &[ScriptSignal] = &[
    ScriptSignal {
        pattern: r"eval\(",
        mapping: "T1059.007 - Command and Scripting Interpreter: JavaScript",
        high: true,
    },
    ScriptSignal {
        pattern: r"document\.write\(",
        mapping: "Dynamic code generation (possible XSS sink)",
        high: false,
    },
    ScriptSignal {
        pattern: r"password",
        mapping: "Credential exposure",
        high: true,
    },
    ScriptSignal {
        pattern: r"api[_-]?key",
        mapping: "API key disclosure",
        high: true,
    },
    ScriptSignal {
        pattern: r"secret",
        mapping: "Sensitive information exposure",
        high: false,
    },
];

static SCRIPT_PATTERNS: Lazy<Vec<(Regex, &'static ScriptSignal)>> = Lazy::new(|| {
    SCRIPT_SIGNALS
        .iter()
        .map(|signal| {
            let regex = Regex::new(&format!("(?i){}", signal.pattern)).expect("script signal pattern");
            (regex, signal)
        })
        .collect()
});

/// Error-page indicators. HTML comment bodies are captured through a group
/// since the regex engine has no lookaround.
static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?is)<!--(.*?error.*?)-->",
        r"(?is)<title>.*?error.*?</title>",
        r"(?is)exception.*?<br\s*/?>",
        r"(?i)\berror [0-9]{3}\b",
        r"(?i)stack ?trace",
        r"(?i)sql syntax|mysqli|pg_query|mysql_fetch|sql error|db error",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("error page pattern"))
    .collect()
});

pub fn has_auth_token(text: &str) -> bool {
    AUTH_TOKEN_PATTERN.is_match(text)
}

pub fn has_credential_assignment(text: &str) -> bool {
    CREDENTIAL_ASSIGNMENT.is_match(text)
}

pub fn has_debug_output(text: &str) -> bool {
    DEBUG_OUTPUT.is_match(text)
}

pub fn is_credential_keyword(keyword: &str) -> bool {
    let keyword = keyword.trim().to_ascii_lowercase();
    CREDENTIAL_KEYWORDS.contains(&keyword.as_str())
}

pub fn is_sensitive_path(path: &str) -> bool {
    let path = path.trim().to_ascii_lowercase();
    let path = path.trim_end_matches('/');
    SENSITIVE_PATHS
        .iter()
        .any(|sensitive| path == *sensitive || path.starts_with(&format!("{}/", sensitive)))
}

pub fn is_ics_port(port: u16) -> bool {
    ICS_PORTS.contains(&port)
}

/// Extract distinct error fragments from an HTML page, in a stable order
pub fn extract_error_fragments(html: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    for pattern in ERROR_PATTERNS.iter() {
        for captures in pattern.captures_iter(html) {
            let fragment = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().trim().to_string());
            if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
                found.insert(fragment);
            }
        }
    }
    found.into_iter().collect()
}

/// First legacy stack marker present in a `Server`/`X-Powered-By` value
pub fn legacy_stack_marker(value: &str) -> Option<&'static str> {
    let value = value.to_ascii_lowercase();
    LEGACY_STACK_MARKERS
        .iter()
        .copied()
        .find(|marker| value.contains(marker))
}

pub fn is_free_certificate_issuer(issuer: &str) -> bool {
    let issuer = issuer.to_ascii_lowercase();
    FREE_CERT_ISSUERS.iter().any(|free| issuer.contains(free))
}

/// Classify a combined fingerprint (CNAMEs, headers, certificate issuer).
/// The first provider in declaration order wins.
pub fn classify_cloud(fingerprint: &str) -> Option<CloudProvider> {
    let fingerprint = fingerprint.to_ascii_lowercase();
    CLOUD_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| fingerprint.contains(p)))
        .map(|(provider, _)| *provider)
}

/// First known web server named in a `Server` value
pub fn identified_stack_marker(value: &str) -> Option<&'static str> {
    let value = value.to_ascii_lowercase();
    IDENTIFIED_STACK_MARKERS
        .iter()
        .copied()
        .find(|marker| value.contains(marker))
}

pub fn is_short_lived(validity_days: i64) -> bool {
    (0..=SHORT_LIVED_CERT_DAYS).contains(&validity_days)
}

/// True if `text` holds a standalone `prod` or `production` token, as in a
/// hostname label, a URL path segment or a config value
pub fn has_production_marker(text: &str) -> bool {
    PRODUCTION_MARKER.is_match(text)
}

/// Risky constructs present in a script source, in declaration order
pub fn script_signals(source: &str) -> Vec<&'static ScriptSignal> {
    SCRIPT_PATTERNS
        .iter()
        .filter(|(regex, _)| regex.is_match(source))
        .map(|(_, signal)| *signal)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_token_detection() {
        assert!(has_auth_token("Authorization: Bearer eyJhbGciOi.abc"));
        assert!(has_auth_token("curl -H 'basic dXNlcjpwYXNz'"));
        assert!(!has_auth_token("no credentials here"));
    }

    #[test]
    fn test_credential_assignment() {
        assert!(has_credential_assignment("API_KEY=sk_live_abcdef123"));
        assert!(has_credential_assignment(r#""password": "hunter22""#));
        assert!(!has_credential_assignment("reset your password here"));
    }

    #[test]
    fn test_error_fragments() {
        let html = "<html><!-- db error near line 4 --><title>500 Error</title>\
                    <p>Stack trace follows</p></html>";
        let fragments = extract_error_fragments(html);
        assert!(fragments.contains(&"db error near line 4".to_string()));
        assert!(fragments.contains(&"<title>500 Error</title>".to_string()));
        assert!(fragments.iter().any(|f| f.eq_ignore_ascii_case("stack trace")));
        assert!(extract_error_fragments("<html>all good</html>").is_empty());

        // same input, same order
        assert_eq!(fragments, extract_error_fragments(html));
    }

    #[test]
    fn test_sensitive_paths() {
        assert!(is_sensitive_path("/.env"));
        assert!(is_sensitive_path("/.git/config"));
        assert!(is_sensitive_path("/Admin/"));
        assert!(!is_sensitive_path("/robots.txt"));
        assert!(!is_sensitive_path("/administrator-guide"));
    }

    #[test]
    fn test_cloud_classification() {
        assert_eq!(classify_cloud("d111.cloudfront.net"), Some(CloudProvider::Aws));
        assert_eq!(classify_cloud("cloudflare"), Some(CloudProvider::Cloudflare));
        assert_eq!(classify_cloud("nginx"), None);
    }

    #[test]
    fn test_stack_and_issuer_markers() {
        assert_eq!(legacy_stack_marker("PHP/7.2.34"), Some("php"));
        assert_eq!(legacy_stack_marker("ASP.NET"), Some("asp.net"));
        assert_eq!(legacy_stack_marker("nginx"), None);
        assert!(is_free_certificate_issuer("Let's Encrypt"));
        assert!(!is_free_certificate_issuer("DigiCert Inc"));
    }

    #[test]
    fn test_production_marker() {
        assert!(has_production_marker("https://api.prod.example.com/login"));
        assert!(has_production_marker("production-db.example.com"));
        assert!(has_production_marker("APP_ENV=Production"));
        assert!(!has_production_marker("https://products.example.com/"));
        assert!(!has_production_marker("reproduction steps"));
    }

    #[test]
    fn test_script_signals() {
        let source = "var k = cfg.apiKey; eval(atob(k)); document.write(x);";
        let found: Vec<_> = script_signals(source).iter().map(|s| s.pattern).collect();
        assert_eq!(found, vec![r"eval\(", r"document\.write\(", r"api[_-]?key"]);
        assert!(script_signals("console.log('ready')").is_empty());
    }

    #[test]
    fn test_identified_stack_and_short_lived() {
        assert_eq!(identified_stack_marker("Microsoft-IIS/10.0"), Some("iis"));
        assert_eq!(identified_stack_marker("nginx/1.18.0"), Some("nginx"));
        assert_eq!(identified_stack_marker("cloudflare"), None);
        assert!(is_short_lived(90));
        assert!(!is_short_lived(397));
    }

    #[test]
    fn test_ics_ports() {
        assert!(is_ics_port(502));
        assert!(!is_ics_port(443));
    }
}
