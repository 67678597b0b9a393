//! Configuration management
//!
//! Layered configuration with support for:
//! - Built-in defaults
//! - A TOML configuration file (written with defaults when missing)
//! - Environment variables prefixed with `DEEP_RECON_`, nested keys
//!   separated by `__` (e.g. `DEEP_RECON_SCORING__MAX_SCORE=80`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use crate::{probe::ProfileKind, timing::RetryPolicy};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Probe scheduling
    pub coordinator: CoordinatorConfig,
    /// Fast (bounded) and exhaustive execution profiles
    pub profiles: ProfilesConfig,
    /// Risk weights and level thresholds
    pub scoring: ScoringConfig,
    pub logging: LoggingConfig,
    /// Snapshot storage
    pub persistence: PersistenceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrency ceiling for probes that do not declare their own
    pub default_probe_concurrency: usize,
    /// Number of (probe, target) pairs handed to a probe per dispatch
    pub dispatch_batch_size: usize,
    /// Explicit probe order; probes not listed keep registration order
    /// and run after the listed ones
    pub probe_order: Vec<String>,
    /// Stop dispatching new pairs after this many seconds
    pub run_deadline_secs: Option<u64>,
    /// Attempts per (probe, target) call, the first one included
    pub retry_attempts: u32,
    /// Fixed backoff between attempts in milliseconds
    pub retry_backoff_ms: u64,
    /// Profile used when the command line does not choose one
    pub default_profile: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_probe_concurrency: 10,
            dispatch_batch_size: 50,
            probe_order: Vec::new(),
            run_deadline_secs: None,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            default_profile: "fast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Cap on targets per probe; unset means every target
    pub max_targets: Option<usize>,
    /// Cap on guessed candidates (bucket names, paths) per target
    pub max_candidates: Option<usize>,
    pub per_call_timeout_secs: u64,
    /// Delay between calls to the same external service
    pub pacing_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    pub fast: ProfileConfig,
    pub exhaustive: ProfileConfig,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            fast: ProfileConfig {
                max_targets: Some(150),
                max_candidates: Some(200),
                per_call_timeout_secs: 5,
                pacing_delay_ms: 0,
            },
            exhaustive: ProfileConfig {
                max_targets: None,
                max_candidates: None,
                per_call_timeout_secs: 10,
                pacing_delay_ms: 250,
            },
        }
    }
}

/// Weight contributed by each built-in factor rule when it fires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    pub credential_leak: u32,
    pub authorization_token: u32,
    pub listable_storage: u32,
    pub sensitive_endpoint: u32,
    pub ics_exposure: u32,
    pub legacy_stack: u32,
    pub risky_script: u32,
    pub debug_output: u32,
    pub error_status: u32,
    pub cloud_hosted: u32,
    pub free_certificate: u32,
    pub identified_stack: u32,
    pub production_indicator: u32,
    pub third_party_sprawl: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            credential_leak: 40,
            authorization_token: 20,
            listable_storage: 35,
            sensitive_endpoint: 30,
            ics_exposure: 40,
            legacy_stack: 15,
            risky_script: 20,
            debug_output: 10,
            error_status: 5,
            cloud_hosted: 5,
            free_certificate: 5,
            identified_stack: 2,
            production_indicator: 5,
            third_party_sprawl: 5,
        }
    }
}

/// Lower bounds (inclusive) of each level; anything above zero and below
/// `medium` is Low
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 70,
            high: 40,
            medium: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Scores are clamped to this value
    pub max_score: u32,
    /// Third-party script domains needed before sprawl counts as a factor
    pub sprawl_domain_count: usize,
    pub weights: RiskWeights,
    pub thresholds: RiskThresholds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_score: 100,
            sprawl_domain_count: 5,
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Console format (pretty, json)
    pub format: String,
    /// Directory for rolling log files; console only when unset
    pub file_dir: Option<PathBuf>,
    /// Rotation of the log file (daily, hourly, never)
    pub file_rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_dir: None,
            file_rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Base directory for snapshots and exported findings
    pub data_dir: PathBuf,
    /// Save a state snapshot at the end of every run
    pub auto_save: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            auto_save: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Findings file format (json, summary)
    pub format: String,
    /// Pretty-print JSON output
    pub pretty: bool,
    /// Include raw probe payloads next to the findings
    pub include_state: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            pretty: true,
            include_state: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with environment variable overrides
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        info!("Loading configuration from: {}", config_path.display());

        let mut settings = config::Config::builder();

        settings = settings.add_source(config::Config::try_from(&Self::default())?);

        if config_path.exists() {
            debug!("Found configuration file, loading settings");
            settings = settings.add_source(config::File::from(config_path));
        } else {
            info!("No configuration file found, using defaults");
            Self::create_default_config(config_path).await?;
        }

        settings = settings.add_source(
            config::Environment::with_prefix("DEEP_RECON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Write the default configuration to `path`
    async fn create_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let config_content = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default configuration")?;

        tokio::fs::write(path, config_content)
            .await
            .context("Failed to write default configuration file")?;

        info!("Created default configuration file: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.default_probe_concurrency == 0 {
            return Err(anyhow::anyhow!("default_probe_concurrency must be greater than 0"));
        }
        if self.coordinator.dispatch_batch_size == 0 {
            return Err(anyhow::anyhow!("dispatch_batch_size must be greater than 0"));
        }
        if self.coordinator.retry_attempts == 0 {
            return Err(anyhow::anyhow!("retry_attempts must be at least 1"));
        }
        self.coordinator
            .default_profile
            .parse::<ProfileKind>()
            .map_err(|e| anyhow::anyhow!(e))?;

        for (name, profile) in [("fast", &self.profiles.fast), ("exhaustive", &self.profiles.exhaustive)] {
            if profile.per_call_timeout_secs == 0 {
                return Err(anyhow::anyhow!("profiles.{}.per_call_timeout_secs must be greater than 0", name));
            }
            if profile.max_targets == Some(0) {
                return Err(anyhow::anyhow!("profiles.{}.max_targets must be greater than 0", name));
            }
        }

        let thresholds = &self.scoring.thresholds;
        if !(thresholds.critical > thresholds.high
            && thresholds.high > thresholds.medium
            && thresholds.medium > 0)
        {
            return Err(anyhow::anyhow!(
                "Risk thresholds must be strictly descending: critical {} > high {} > medium {} > 0",
                thresholds.critical,
                thresholds.high,
                thresholds.medium
            ));
        }
        if self.scoring.max_score == 0 {
            return Err(anyhow::anyhow!("max_score must be greater than 0"));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid logging level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "pretty" | "json" => {}
            _ => return Err(anyhow::anyhow!("Invalid logging format: {}", self.logging.format)),
        }

        match self.logging.file_rotation.to_lowercase().as_str() {
            "daily" | "hourly" | "never" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log file rotation: {}",
                    self.logging.file_rotation
                ))
            }
        }

        match self.output.format.to_lowercase().as_str() {
            "json" | "summary" => {}
            _ => return Err(anyhow::anyhow!("Invalid output format: {}", self.output.format)),
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn profile(&self, kind: ProfileKind) -> &ProfileConfig {
        match kind {
            ProfileKind::Fast => &self.profiles.fast,
            ProfileKind::Exhaustive => &self.profiles.exhaustive,
        }
    }

    pub fn default_profile(&self) -> ProfileKind {
        self.coordinator
            .default_profile
            .parse()
            .unwrap_or(ProfileKind::Fast)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.coordinator.retry_attempts,
            Duration::from_millis(self.coordinator.retry_backoff_ms),
        )
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.coordinator.run_deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring.max_score, 100);
        assert_eq!(config.default_profile(), ProfileKind::Fast);
    }

    #[test]
    fn test_thresholds_must_descend() {
        let mut config = AppConfig::default();
        config.scoring.thresholds.high = 80;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scoring.thresholds.medium = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = AppConfig::default();
        config.coordinator.dispatch_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let mut config = AppConfig::default();
        config.coordinator.default_profile = "turbo".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_writes_default_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deep_recon.toml");

        let config = AppConfig::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(config.coordinator.dispatch_batch_size, 50);

        let reloaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.scoring.weights.credential_leak, 40);
    }

    #[tokio::test]
    async fn test_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        tokio::fs::write(
            &path,
            "[scoring]\nmax_score = 60\n\n[coordinator]\nprobe_order = [\"cert-lookup\", \"http\"]\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.scoring.max_score, 60);
        assert_eq!(config.scoring.thresholds.critical, 70);
        assert_eq!(config.coordinator.probe_order, vec!["cert-lookup", "http"]);
    }
}
