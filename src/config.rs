//! Engine configuration loaded from `.refsmith/refsmith.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Relative paths are resolved against the project directory. Environment
//! variables (`REFSMITH_*`) override the file and CLI flags override both.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::MergeStrategy;

pub const DATA_DIR: &str = ".refsmith";
pub const CONFIG_FILE: &str = "refsmith.toml";
pub const DB_FILE: &str = "refsmith.db";

/// Template written by `refsmith init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# refsmith configuration

[refs]
root = "refs"
mainline = "main"

[workspaces]
root = ".refsmith/workspaces"

[stream]
max_buffer_bytes = 1048576
max_line_chars = 10000

[ports]
range_start = 3000
range_end = 9000

[health]
max_attempts = 30
initial_delay_ms = 500
max_delay_ms = 5000
timeout_ms = 3000

[limits]
max_concurrent = 4
max_workspace_bytes = 10737418240
min_free_disk_bytes = 1073741824
max_load_per_cpu = 4.0

[lifecycle]
auto_integrate = true
auto_cleanup = false
merge_strategy = "sync"
orphan_age_hours = 24

[logging]
format = "pretty"
file = false
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefsConfig {
    /// Directory holding one git repository per ref.
    pub root: PathBuf,
    /// Branch that integration targets in every ref.
    pub mainline: String,
}

impl Default for RefsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("refs"),
            mainline: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspacesConfig {
    pub root: PathBuf,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DATA_DIR).join("workspaces"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_buffer_bytes: usize,
    pub max_line_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 1024 * 1024,
            max_line_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 3000,
            range_end: 9000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of starting + running executions.
    pub max_concurrent: u32,
    /// Total bytes allowed under the workspaces root.
    pub max_workspace_bytes: u64,
    /// Free space required on the workspaces volume.
    pub min_free_disk_bytes: u64,
    /// 1-minute load average per CPU above which admission is denied.
    pub max_load_per_cpu: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_workspace_bytes: 10 * 1024 * 1024 * 1024,
            min_free_disk_bytes: 1024 * 1024 * 1024,
            max_load_per_cpu: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Integrate write refs when the agent exits with code 0.
    pub auto_integrate: bool,
    /// Remove worktrees after a clean completion.
    pub auto_cleanup: bool,
    pub merge_strategy: MergeStrategy,
    pub orphan_age_hours: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            auto_integrate: true,
            auto_cleanup: false,
            merge_strategy: MergeStrategy::Sync,
            orphan_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
    pub heartbeat_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Also write a daily-rolling log file under `<data_dir>/logs`.
    pub file: bool,
}

/// Raw TOML structure for `.refsmith/refsmith.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineToml {
    refs: RefsConfig,
    workspaces: WorkspacesConfig,
    stream: StreamConfig,
    ports: PortsConfig,
    health: HealthConfig,
    limits: LimitsConfig,
    lifecycle: LifecycleConfig,
    events: EventsConfig,
    logging: LoggingConfig,
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub project_dir: PathBuf,
    pub data_dir: PathBuf,
    pub refs: RefsConfig,
    pub workspaces: WorkspacesConfig,
    pub stream: StreamConfig,
    pub ports: PortsConfig,
    pub health: HealthConfig,
    pub limits: LimitsConfig,
    pub lifecycle: LifecycleConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Defaults rooted at `project_dir`, without reading any file.
    pub fn for_project(project_dir: &Path) -> Self {
        Self::from_toml(project_dir, EngineToml::default())
    }

    fn from_toml(project_dir: &Path, toml: EngineToml) -> Self {
        let mut config = Self {
            project_dir: project_dir.to_path_buf(),
            data_dir: project_dir.join(DATA_DIR),
            refs: toml.refs,
            workspaces: toml.workspaces,
            stream: toml.stream,
            ports: toml.ports,
            health: toml.health,
            limits: toml.limits,
            lifecycle: toml.lifecycle,
            events: toml.events,
            logging: toml.logging,
        };
        config.resolve_paths();
        config
    }

    /// Load from `<project_dir>/.refsmith/refsmith.toml`, apply `REFSMITH_*`
    /// environment overrides and validate. Returns defaults if the file
    /// doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(DATA_DIR).join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::for_project(project_dir));
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::parse(project_dir, &content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(project_dir: &Path, content: &str) -> Result<Self> {
        let toml: EngineToml = toml::from_str(content)?;
        Ok(Self::from_toml(project_dir, toml))
    }

    fn resolve_paths(&mut self) {
        if self.refs.root.is_relative() {
            self.refs.root = self.project_dir.join(&self.refs.root);
        }
        if self.workspaces.root.is_relative() {
            self.workspaces.root = self.project_dir.join(&self.workspaces.root);
        }
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("REFSMITH_REFS_ROOT") {
            self.refs.root = PathBuf::from(root);
        }
        if let Some(root) = lookup("REFSMITH_WORKSPACES_ROOT") {
            self.workspaces.root = PathBuf::from(root);
        }
        if let Some(mainline) = lookup("REFSMITH_MAINLINE") {
            self.refs.mainline = mainline;
        }
        if let Some(max) = lookup("REFSMITH_MAX_CONCURRENT") {
            self.limits.max_concurrent = max
                .parse()
                .with_context(|| format!("Invalid REFSMITH_MAX_CONCURRENT '{}'", max))?;
        }
        if let Some(range) = lookup("REFSMITH_PORT_RANGE") {
            let (start, end) = parse_port_range(&range)?;
            self.ports.range_start = start;
            self.ports.range_end = end;
        }
        if let Some(format) = lookup("REFSMITH_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(value) = lookup("REFSMITH_AUTO_CLEANUP") {
            self.lifecycle.auto_cleanup = value != "false" && value != "0";
        }
        self.resolve_paths();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.refs.mainline.trim().is_empty()
            || !git2::Reference::is_valid_name(&format!("refs/heads/{}", self.refs.mainline))
        {
            anyhow::bail!("Invalid mainline branch name '{}'", self.refs.mainline);
        }
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            anyhow::bail!(
                "Invalid port range {}-{}",
                self.ports.range_start,
                self.ports.range_end
            );
        }
        if self.stream.max_buffer_bytes == 0 {
            anyhow::bail!("stream.max_buffer_bytes must be greater than 0");
        }
        if self.stream.max_line_chars <= crate::stream::TRUNCATION_MARKER.chars().count() {
            anyhow::bail!(
                "stream.max_line_chars must exceed the truncation marker length ({})",
                crate::stream::TRUNCATION_MARKER.chars().count()
            );
        }
        if self.limits.max_concurrent == 0 {
            anyhow::bail!("limits.max_concurrent must be at least 1");
        }
        if self.health.max_attempts == 0 {
            anyhow::bail!("health.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Canonical checkout of a ref.
    pub fn ref_path(&self, ref_id: &str) -> PathBuf {
        self.refs.root.join(ref_id)
    }

    pub fn execution_workspace(&self, execution_id: &str) -> PathBuf {
        self.workspaces.root.join(execution_id)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.events.heartbeat_secs.max(1))
    }
}

impl HealthConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parse `START-END` into an inclusive port range.
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let (start, end) = s
        .split_once('-')
        .with_context(|| format!("Invalid port range '{}', expected START-END", s))?;
    let start: u16 = start
        .trim()
        .parse()
        .with_context(|| format!("Invalid port range start '{}'", start))?;
    let end: u16 = end
        .trim()
        .parse()
        .with_context(|| format!("Invalid port range end '{}'", end))?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::for_project(Path::new("/proj"));
        assert_eq!(config.refs.mainline, "main");
        assert_eq!(config.refs.root, PathBuf::from("/proj/refs"));
        assert_eq!(
            config.workspaces.root,
            PathBuf::from("/proj/.refsmith/workspaces")
        );
        assert_eq!(config.stream.max_buffer_bytes, 1024 * 1024);
        assert_eq!(config.stream.max_line_chars, 10_000);
        assert_eq!((config.ports.range_start, config.ports.range_end), (3000, 9000));
        assert_eq!(config.lifecycle.merge_strategy, MergeStrategy::Sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_file(dir.path()).unwrap();
        assert_eq!(config.limits.max_concurrent, 4);
        assert_eq!(config.db_path(), dir.path().join(".refsmith/refsmith.db"));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(DATA_DIR)).unwrap();
        fs::write(
            dir.path().join(DATA_DIR).join(CONFIG_FILE),
            r#"
[refs]
mainline = "trunk"

[ports]
range_start = 40000
range_end = 40100

[lifecycle]
merge_strategy = "fast_forward_only"
"#,
        )
        .unwrap();

        let config = EngineConfig::load_file(dir.path()).unwrap();
        assert_eq!(config.refs.mainline, "trunk");
        assert_eq!(config.refs.root, dir.path().join("refs"));
        assert_eq!(config.ports.range_start, 40000);
        assert_eq!(config.ports.range_end, 40100);
        assert_eq!(
            config.lifecycle.merge_strategy,
            MergeStrategy::FastForwardOnly
        );
        // untouched sections keep defaults
        assert_eq!(config.stream.max_line_chars, 10_000);
    }

    #[test]
    fn test_default_template_parses() {
        let config = EngineConfig::parse(Path::new("/proj"), DEFAULT_CONFIG_TOML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.max_attempts, 30);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(EngineConfig::parse(Path::new("/proj"), "[ports\nrange_start = 1").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REFSMITH_MAINLINE", "develop"),
            ("REFSMITH_PORT_RANGE", "41000-41010"),
            ("REFSMITH_MAX_CONCURRENT", "9"),
            ("REFSMITH_LOG_FORMAT", "json"),
            ("REFSMITH_REFS_ROOT", "/srv/refs"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::for_project(Path::new("/proj"));
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.refs.mainline, "develop");
        assert_eq!(config.ports.range_start, 41000);
        assert_eq!(config.ports.range_end, 41010);
        assert_eq!(config.limits.max_concurrent, 9);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.refs.root, PathBuf::from("/srv/refs"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = EngineConfig::for_project(Path::new("/proj"));
        let result = config.apply_env_overrides(|k| {
            (k == "REFSMITH_MAX_CONCURRENT").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::for_project(Path::new("/proj"));
        config.ports.range_start = 9000;
        config.ports.range_end = 3000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::for_project(Path::new("/proj"));
        config.refs.mainline = "bad..name".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::for_project(Path::new("/proj"));
        config.stream.max_line_chars = 5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::for_project(Path::new("/proj"));
        config.limits.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("3000-9000").unwrap(), (3000, 9000));
        assert_eq!(parse_port_range(" 10 - 20 ").unwrap(), (10, 20));
        assert!(parse_port_range("3000").is_err());
        assert!(parse_port_range("a-b").is_err());
    }
}
