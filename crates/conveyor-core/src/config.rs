//! Pipeline configuration: stage descriptors, failover policies, and the
//! line-oriented configuration file format.
//!
//! File format, one stage per line, `#` and blank lines ignored:
//!
//! ```text
//! name|library_path|params|enabled|failover_policy|max_retries|timeout_ms
//! ```
//!
//! Fields past `timeout_ms` are reserved and ignored.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// What to do once a stage's retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverKind {
    FailFast,
    RetryWithBackoff,
    SkipAndContinue,
    UseFallbackPlugin,
    IsolateAndContinue,
}

impl FailoverKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FAIL_FAST" => Some(FailoverKind::FailFast),
            "RETRY_WITH_BACKOFF" => Some(FailoverKind::RetryWithBackoff),
            "SKIP_AND_CONTINUE" => Some(FailoverKind::SkipAndContinue),
            "USE_FALLBACK_PLUGIN" => Some(FailoverKind::UseFallbackPlugin),
            "ISOLATE_AND_CONTINUE" => Some(FailoverKind::IsolateAndContinue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverKind::FailFast => "FAIL_FAST",
            FailoverKind::RetryWithBackoff => "RETRY_WITH_BACKOFF",
            FailoverKind::SkipAndContinue => "SKIP_AND_CONTINUE",
            FailoverKind::UseFallbackPlugin => "USE_FALLBACK_PLUGIN",
            FailoverKind::IsolateAndContinue => "ISOLATE_AND_CONTINUE",
        }
    }
}

impl fmt::Display for FailoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage timeout, retry, and failover policy.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub kind: FailoverKind,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub timeout_ms: u64,
    pub fallback_plugin_path: Option<String>,
    pub circuit_breaker_enabled: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        FailoverConfig {
            kind: FailoverKind::SkipAndContinue,
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            timeout_ms: 30_000,
            fallback_plugin_path: None,
            circuit_breaker_enabled: true,
        }
    }
}

/// One stage of the pipeline, as loaded from configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub name: String,
    pub plugin_path: String,
    pub params: String,
    pub enabled: bool,
    pub failover: FailoverConfig,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, plugin_path: impl Into<String>) -> Self {
        StageConfig {
            name: name.into(),
            plugin_path: plugin_path.into(),
            params: String::new(),
            enabled: true,
            failover: FailoverConfig::default(),
        }
    }
}

/// The ordered set of stage descriptors backing one pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    stages: Vec<StageConfig>,
    source_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_stages(stages: Vec<StageConfig>) -> Result<Self> {
        validate_stages(&stages)?;
        Ok(PipelineConfig {
            stages,
            source_path: None,
        })
    }

    /// Load and validate a pipeline configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;

        let mut stages = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let stage = parse_stage_line(line).map_err(|e| {
                Error::ConfigInvalid(format!("{}:{}: {e}", path.display(), lineno + 1))
            })?;
            stages.push(stage);
        }

        validate_stages(&stages)?;
        Ok(PipelineConfig {
            stages,
            source_path: Some(path.to_path_buf()),
        })
    }

    /// Re-read the file this configuration was loaded from.
    pub fn reload(&self) -> Result<Self> {
        match &self.source_path {
            Some(path) => Self::load(path),
            None => Err(Error::ConfigInvalid(
                "configuration was not loaded from a file".to_string(),
            )),
        }
    }

    /// Write the configuration back out in the file format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = String::new();
        out.push_str("# Conveyor pipeline configuration\n");
        out.push_str("# name|library_path|params|enabled|failover_policy|max_retries|timeout_ms\n");
        out.push_str("#\n");
        for stage in &self.stages {
            out.push_str(&format!(
                "{}|{}|{}|{}|{}|{}|{}\n",
                stage.name,
                stage.plugin_path,
                stage.params,
                if stage.enabled { "true" } else { "false" },
                stage.failover.kind,
                stage.failover.max_retries,
                stage.failover.timeout_ms,
            ));
        }
        std::fs::write(path.as_ref(), out)?;
        Ok(())
    }

    /// Write a sample configuration useful as a starting point.
    pub fn write_sample(path: impl AsRef<Path>) -> Result<()> {
        let sample = "\
# Sample Conveyor pipeline
validation|./plugins/libvalidation.so|strict_mode=false|true|RETRY_WITH_BACKOFF|3|10000
enrichment|./plugins/libenrichment.so|factor=1.1|true|SKIP_AND_CONTINUE|2|5000
aggregation|./plugins/libaggregation.so|compute_stats=true|true|ISOLATE_AND_CONTINUE|1|15000
";
        std::fs::write(path.as_ref(), sample)?;
        Ok(())
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }
}

fn parse_stage_line(line: &str) -> std::result::Result<StageConfig, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < 4 {
        return Err(format!("expected at least 4 fields, found {}", fields.len()));
    }

    let mut stage = StageConfig::new(fields[0].trim(), fields[1].trim());
    stage.params = fields[2].trim().to_string();
    stage.enabled = match fields[3].trim() {
        "true" | "1" => true,
        "false" | "0" => false,
        other => return Err(format!("invalid enabled flag {other:?}")),
    };

    if let Some(policy) = fields.get(4).map(|f| f.trim()).filter(|f| !f.is_empty()) {
        stage.failover.kind = FailoverKind::parse(policy)
            .ok_or_else(|| format!("unknown failover policy {policy:?}"))?;
    }
    if let Some(retries) = fields.get(5).map(|f| f.trim()).filter(|f| !f.is_empty()) {
        stage.failover.max_retries = retries
            .parse()
            .map_err(|_| format!("invalid max_retries {retries:?}"))?;
    }
    if let Some(timeout) = fields.get(6).map(|f| f.trim()).filter(|f| !f.is_empty()) {
        stage.failover.timeout_ms = timeout
            .parse()
            .map_err(|_| format!("invalid timeout_ms {timeout:?}"))?;
    }
    // Fields beyond timeout_ms are reserved.

    Ok(stage)
}

/// Validate a stage set: names and paths present and unique, policy numbers
/// inside their domains.
pub fn validate_stages(stages: &[StageConfig]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for stage in stages {
        if stage.name.is_empty() {
            return Err(Error::ConfigInvalid("stage with empty name".to_string()));
        }
        if stage.plugin_path.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "stage '{}' has an empty plugin path",
                stage.name
            )));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(Error::ConfigInvalid(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
        let failover = &stage.failover;
        if failover.timeout_ms == 0 {
            return Err(Error::ConfigInvalid(format!(
                "stage '{}': timeout_ms must be positive",
                stage.name
            )));
        }
        if failover.initial_delay_ms == 0 {
            return Err(Error::ConfigInvalid(format!(
                "stage '{}': initial_delay_ms must be positive",
                stage.name
            )));
        }
        if failover.max_delay_ms < failover.initial_delay_ms {
            return Err(Error::ConfigInvalid(format!(
                "stage '{}': max_delay_ms below initial_delay_ms",
                stage.name
            )));
        }
        if failover.backoff_multiplier < 1.0 {
            return Err(Error::ConfigInvalid(format!(
                "stage '{}': backoff_multiplier must be at least 1.0",
                stage.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_line() {
        let stage =
            parse_stage_line("validate|/lib/libvalidate.so|strict_mode=true|true|FAIL_FAST|2|750")
                .unwrap();
        assert_eq!(stage.name, "validate");
        assert_eq!(stage.plugin_path, "/lib/libvalidate.so");
        assert_eq!(stage.params, "strict_mode=true");
        assert!(stage.enabled);
        assert_eq!(stage.failover.kind, FailoverKind::FailFast);
        assert_eq!(stage.failover.max_retries, 2);
        assert_eq!(stage.failover.timeout_ms, 750);
    }

    #[test]
    fn short_line_keeps_failover_defaults() {
        let stage = parse_stage_line("enrich|/lib/libenrich.so|factor=1.1|1").unwrap();
        assert!(stage.enabled);
        assert_eq!(stage.failover.kind, FailoverKind::SkipAndContinue);
        assert_eq!(stage.failover.max_retries, 3);
    }

    #[test]
    fn reserved_trailing_fields_are_ignored() {
        let stage =
            parse_stage_line("s|/p.so||0|SKIP_AND_CONTINUE|1|100|future|fields").unwrap();
        assert!(!stage.enabled);
        assert_eq!(stage.failover.max_retries, 1);
    }

    #[test]
    fn rejects_bad_policy_and_bad_flag() {
        assert!(parse_stage_line("s|/p.so||yes").is_err());
        assert!(parse_stage_line("s|/p.so||true|EXPLODE").is_err());
        assert!(parse_stage_line("s|/p.so||true|FAIL_FAST|minus-one").is_err());
    }

    #[test]
    fn load_skips_comments_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.txt");
        std::fs::write(
            &path,
            "# comment\n\nvalidate|/lib/a.so|p=1|true|FAIL_FAST|1|500\nenrich|/lib/b.so||true\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.stages().len(), 2);
        assert_eq!(config.stages()[0].name, "validate");
        assert!(config.stage("enrich").is_some());
    }

    #[test]
    fn duplicate_names_fail_validation() {
        let stages = vec![
            StageConfig::new("dup", "/a.so"),
            StageConfig::new("dup", "/b.so"),
        ];
        assert!(matches!(
            PipelineConfig::from_stages(stages),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let mut stage = StageConfig::new("s", "/p.so");
        stage.failover.timeout_ms = 0;
        assert!(validate_stages(&[stage]).is_err());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.txt");

        let mut stage = StageConfig::new("validate", "/lib/a.so");
        stage.failover.kind = FailoverKind::RetryWithBackoff;
        stage.failover.max_retries = 4;
        stage.failover.timeout_ms = 2500;
        let config = PipelineConfig::from_stages(vec![stage]).unwrap();
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.stages().len(), 1);
        let got = &loaded.stages()[0];
        assert_eq!(got.failover.kind, FailoverKind::RetryWithBackoff);
        assert_eq!(got.failover.max_retries, 4);
        assert_eq!(got.failover.timeout_ms, 2500);
    }

    #[test]
    fn sample_config_is_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.txt");
        PipelineConfig::write_sample(&path).unwrap();
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.stages().len(), 3);
    }
}
