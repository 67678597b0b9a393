//! Command-line interface definition
//!
//! Provides CLI argument parsing with support for:
//! - Seeding a run from a root domain, organization and extra targets
//! - Replaying recorded probe results from JSON-lines files
//! - Resuming or re-scoring a saved state snapshot
//! - Output and scheduling overrides on top of the configuration file

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::{config::AppConfig, probe::ProfileKind};

#[derive(Parser, Debug)]
#[command(
    name = "deep_recon",
    about = "OSINT recon aggregation and risk correlation",
    long_about = "Runs recon probes against an organization's attack surface, unifies the names it \
                  discovers into target identities and ranks every target by correlated risk"
)]
pub struct Cli {
    /// Root domain of the organization
    #[arg(
        required_unless_present_any = ["resume", "list_snapshots", "validate_config"],
        help = "Root domain (e.g., example.com)"
    )]
    pub root: Option<String>,

    #[arg(long, help = "Organization name", value_name = "NAME")]
    pub org: Option<String>,

    #[arg(short = 't', long = "target", help = "Additional seed target (repeatable)", value_name = "NAME")]
    pub targets: Vec<String>,

    #[arg(short = 'p', long, help = "Execution profile", value_enum, value_name = "PROFILE")]
    pub profile: Option<ProfileKind>,

    // Probes
    #[arg(short = 'r', long = "replay", help = "Replay recorded envelopes from a JSON-lines file (repeatable)", value_name = "FILE")]
    pub replay: Vec<PathBuf>,

    #[arg(long, help = "Resume from a saved state snapshot", value_name = "SNAPSHOT")]
    pub resume: Option<PathBuf>,

    #[arg(long, help = "Only score the resumed snapshot, run no probes")]
    pub score_only: bool,

    // Scheduling
    #[arg(long, help = "Run deadline in seconds", value_name = "SECS")]
    pub deadline: Option<u64>,

    #[arg(long, help = "Default per-probe concurrency", value_name = "NUM")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Targets handed to a probe per dispatch", value_name = "NUM")]
    pub batch_size: Option<usize>,

    // Output
    #[arg(short = 'o', long, help = "Write findings to this file instead of stdout", value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Output format", value_enum, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    #[arg(long, help = "Embed the full recon state in the findings")]
    pub include_state: bool,

    #[arg(long, help = "Do not save a snapshot or findings to the data directory")]
    pub no_save: bool,

    #[arg(short = 'v', long, help = "Increase verbosity level", action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'q', long, help = "Quiet mode (warnings and errors only)")]
    pub quiet: bool,

    // Configuration
    #[arg(short = 'c', long, help = "Configuration file path", value_name = "FILE", default_value = "config.toml")]
    pub config_path: PathBuf,

    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,

    #[arg(long, help = "List saved snapshots and exit")]
    pub list_snapshots: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON findings report
    Json,
    /// Human-readable ranked summary
    Summary,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Summary => write!(f, "summary"),
        }
    }
}

impl Cli {
    /// Validate CLI arguments and resolve conflicts
    pub fn validate(&self) -> Result<(), String> {
        if self.quiet && self.verbose > 0 {
            return Err("Cannot use both quiet and verbose modes".to_string());
        }

        if self.resume.is_some() && self.root.is_some() {
            return Err("A resumed run keeps its root target; drop the root argument".to_string());
        }

        if self.resume.is_some() && !self.targets.is_empty() {
            return Err("Extra targets cannot be added to a resumed run".to_string());
        }

        if self.score_only && self.resume.is_none() {
            return Err("--score-only needs a snapshot to score (--resume)".to_string());
        }

        if self.deadline == Some(0) {
            return Err("Deadline must be at least one second".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.batch_size == Some(0) {
            return Err("Batch size must be at least 1".to_string());
        }

        if let Some(root) = &self.root {
            if root.trim().is_empty() {
                return Err("Root target cannot be empty".to_string());
            }
        }

        Ok(())
    }

    /// Log level implied by -q / -v, if any
    pub fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("warn");
        }
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Fold command-line overrides into the loaded configuration
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(deadline) = self.deadline {
            config.coordinator.run_deadline_secs = Some(deadline);
        }
        if let Some(concurrency) = self.concurrency {
            config.coordinator.default_probe_concurrency = concurrency;
        }
        if let Some(batch_size) = self.batch_size {
            config.coordinator.dispatch_batch_size = batch_size;
        }
        if let Some(format) = self.format {
            config.output.format = format.to_string();
        }
        if self.include_state {
            config.output.include_state = true;
        }
        if self.no_save {
            config.persistence.auto_save = false;
        }
        if let Some(level) = self.log_level() {
            config.logging.level = level.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_run() {
        let cli = Cli::parse_from([
            "deep_recon",
            "example.com",
            "--org",
            "Example Corp",
            "-t",
            "api.example.com",
            "-t",
            "shop.example.net",
            "--profile",
            "exhaustive",
            "-r",
            "crt.jsonl",
        ]);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.root.as_deref(), Some("example.com"));
        assert_eq!(cli.targets.len(), 2);
        assert_eq!(cli.profile, Some(ProfileKind::Exhaustive));
        assert_eq!(cli.replay, vec![PathBuf::from("crt.jsonl")]);
    }

    #[test]
    fn test_root_required_without_resume() {
        assert!(Cli::try_parse_from(["deep_recon", "--org", "Example Corp"]).is_err());
        assert!(Cli::try_parse_from(["deep_recon", "--resume", "snap.json"]).is_ok());
        assert!(Cli::try_parse_from(["deep_recon", "--list-snapshots"]).is_ok());
    }

    #[test]
    fn test_conflicting_options() {
        let cli = Cli::parse_from(["deep_recon", "example.com", "-q", "-v"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["deep_recon", "example.com", "--score-only"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["deep_recon", "--resume", "snap.json", "-t", "api.example.com"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["deep_recon", "example.com", "--deadline", "0"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let cli = Cli::parse_from([
            "deep_recon",
            "example.com",
            "--deadline",
            "120",
            "--batch-size",
            "5",
            "--format",
            "summary",
            "--no-save",
            "-vv",
        ]);
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.coordinator.run_deadline_secs, Some(120));
        assert_eq!(config.coordinator.dispatch_batch_size, 5);
        assert_eq!(config.output.format, "summary");
        assert!(!config.persistence.auto_save);
        assert_eq!(config.logging.level, "trace");
    }
}
