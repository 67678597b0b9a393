//! Findings reports
//!
//! Renders the ranked risk findings of a run as JSON or as a plain-text
//! summary for terminals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

use crate::{
    config::OutputConfig,
    coordinator::RunReport,
    error::{ReconError, Result},
    probe::ProfileKind,
    risk::{RiskFinding, RiskLevel},
    state::ReconState,
};

/// Everything a consumer needs to act on a run's findings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingsReport {
    pub run_id: Uuid,
    pub root_target: String,
    pub organization: Option<String>,
    pub profile: ProfileKind,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
    /// Highest score first
    pub findings: Vec<RiskFinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ReconState>,
}

impl FindingsReport {
    pub fn new(state: &ReconState, findings: Vec<RiskFinding>) -> Self {
        Self {
            run_id: state.metadata.run_id,
            root_target: state.metadata.root_target.clone(),
            organization: state.metadata.organization.clone(),
            profile: state.metadata.profile,
            generated_at: Utc::now(),
            run: None,
            findings,
            state: None,
        }
    }

    pub fn with_run(mut self, run: RunReport) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_state(mut self, state: ReconState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn counts_by_level(&self) -> BTreeMap<RiskLevel, usize> {
        let mut counts = BTreeMap::new();
        for finding in &self.findings {
            *counts.entry(finding.level).or_insert(0) += 1;
        }
        counts
    }

    pub fn ics_exposed(&self) -> impl Iterator<Item = &RiskFinding> {
        self.findings.iter().filter(|finding| finding.ics_exposed)
    }
}

#[async_trait]
pub trait ReportGenerator {
    fn render(&self, report: &FindingsReport) -> Result<String>;

    async fn write_report(&self, report: &FindingsReport, output_path: &Path) -> Result<()>;
}

pub struct DefaultReportGenerator {
    config: OutputConfig,
}

impl DefaultReportGenerator {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReportGenerator for DefaultReportGenerator {
    fn render(&self, report: &FindingsReport) -> Result<String> {
        match self.config.format.to_lowercase().as_str() {
            "json" => self.render_json(report),
            "summary" => Ok(render_summary(report)),
            other => Err(ReconError::config(format!("Unsupported output format: {}", other))),
        }
    }

    async fn write_report(&self, report: &FindingsReport, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = self.render(report)?;
        fs::write(output_path, content).await?;
        tracing::info!(
            "Findings written: {} ({})",
            output_path.display(),
            self.config.format
        );
        Ok(())
    }
}

impl DefaultReportGenerator {
    fn render_json(&self, report: &FindingsReport) -> Result<String> {
        let rendered = if self.config.pretty {
            serde_json::to_string_pretty(report)
        } else {
            serde_json::to_string(report)
        };
        rendered.map_err(|e| ReconError::serialization("json", e.to_string()))
    }
}

fn render_summary(report: &FindingsReport) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Recon findings for {}\n\n", report.root_target));
    if let Some(org) = &report.organization {
        out.push_str(&format!("Organization: {}\n", org));
    }
    out.push_str(&format!("Run ID: {}\n", report.run_id));
    out.push_str(&format!("Profile: {}\n", report.profile));
    out.push_str(&format!(
        "Generated at: {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(run) = &report.run {
        out.push_str(&format!(
            "Run duration: {:.2}s, identities: {}{}\n",
            run.duration.as_secs_f64(),
            run.identities,
            if run.deadline_reached { " (deadline reached)" } else { "" }
        ));
    }
    out.push('\n');

    let counts = report.counts_by_level();
    out.push_str("## Levels\n\n");
    for (level, count) in counts.iter().rev() {
        out.push_str(&format!("  {:<14} {}\n", level.as_str(), count));
    }
    out.push('\n');

    out.push_str("## Targets\n\n");
    for finding in &report.findings {
        let mut marks = Vec::new();
        if finding.ics_exposed {
            marks.push("ICS");
        }
        if finding.malformed {
            marks.push("malformed");
        }
        let marks = if marks.is_empty() {
            String::new()
        } else {
            format!(" [{}]", marks.join(", "))
        };

        out.push_str(&format!(
            "{:>3}  {:<13} {}{}\n",
            finding.score,
            finding.level.as_str(),
            finding.target,
            marks
        ));
        if !finding.reasons.is_empty() {
            out.push_str(&format!("       reasons: {}\n", finding.reasons.join("; ")));
        }
        for pivot in &finding.pivots {
            out.push_str(&format!("       pivot: {}\n", pivot));
        }
    }

    out
}

pub fn create_report_generator(config: &OutputConfig) -> Box<dyn ReportGenerator + Send + Sync> {
    Box::new(DefaultReportGenerator::new(config.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Seed;
    use tempfile::TempDir;

    fn finding(target: &str, score: u32, level: RiskLevel, ics: bool) -> RiskFinding {
        RiskFinding {
            target: target.to_string(),
            score,
            level,
            reasons: vec!["legacy stack".to_string()],
            factors: Vec::new(),
            ics_exposed: ics,
            malformed: false,
            pivots: vec!["github:\"example.com\" config.php".to_string()],
            diagnostics: Vec::new(),
            evaluated_at: Utc::now(),
        }
    }

    fn report() -> FindingsReport {
        let state = ReconState::seed(Seed::new("example.com").with_organization("Example Corp")).unwrap();
        FindingsReport::new(
            &state,
            vec![
                finding("plc.example.com", 80, RiskLevel::Critical, true),
                finding("example.com", 15, RiskLevel::Low, false),
                finding("quiet.example.com", 0, RiskLevel::Informational, false),
            ],
        )
    }

    #[test]
    fn test_level_counts() {
        let counts = report().counts_by_level();
        assert_eq!(counts.get(&RiskLevel::Critical), Some(&1));
        assert_eq!(counts.get(&RiskLevel::Informational), Some(&1));
        assert_eq!(report().ics_exposed().count(), 1);
    }

    #[test]
    fn test_summary_lists_every_target() {
        let generator = DefaultReportGenerator::new(OutputConfig {
            format: "summary".to_string(),
            ..Default::default()
        });
        let text = generator.render(&report()).unwrap();
        assert!(text.contains("Organization: Example Corp"));
        assert!(text.contains("plc.example.com [ICS]"));
        assert!(text.contains("quiet.example.com"));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let generator = DefaultReportGenerator::new(OutputConfig {
            format: "xml".to_string(),
            ..Default::default()
        });
        assert!(generator.render(&report()).is_err());
    }

    #[tokio::test]
    async fn test_json_report_written() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("findings.json");
        let generator = create_report_generator(&OutputConfig::default());
        generator.write_report(&report(), &path).await.unwrap();

        let written: FindingsReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.findings.len(), 3);
        assert_eq!(written.findings[0].target, "plc.example.com");
        assert!(written.state.is_none());
    }
}
