//! Configuration for the slice engine, read from `.sliceforge/sliceforge.toml`.
//!
//! Layered: file → environment. Role prefixes and gates are loaded once at
//! start-up; changing them requires a restart.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workspace]
//! dir = ".sliceforge/workspace"
//!
//! [database]
//! path = ".sliceforge/sliceforge.db"
//!
//! [roles]
//! pm = ["docs/", "tasks/"]
//! dev = ["src/", "tests/unit/", "reports/"]
//!
//! [[gates]]
//! name = "lint"
//! command = "make lint"
//! timeout_secs = 1800
//!
//! [scheduler]
//! max_workers = 4
//!
//! [agent]
//! max_attempts = 3
//! base_delay_ms = 500
//! max_delay_ms = 8000
//! request_timeout_secs = 120
//!
//! [llm]
//! provider = "openai-compatible"
//! base_url = "https://api.example.com/v1"
//! model = "gpt-4o-mini"
//!
//! [github]
//! api_url = "https://api.github.com"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::acl::PathAcl;
use crate::engine::models::{LlmSettings, Role};

/// Directory holding config, database and workspace.
pub const STATE_DIR: &str = ".sliceforge";
pub const CONFIG_FILE: &str = "sliceforge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSection {
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(STATE_DIR).join("workspace")
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(STATE_DIR).join("sliceforge.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// One quality check, run through `sh -c` inside the worktree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
}

fn default_gate_timeout() -> u64 {
    1800
}

impl GateSpec {
    pub fn new(name: &str, command: &str, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_gates() -> Vec<GateSpec> {
    ["lint", "type", "contract", "test"]
        .iter()
        .map(|name| GateSpec::new(name, &format!("make {}", name), default_gate_timeout()))
        .collect()
}

fn default_roles() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 5] = [
        ("pm", &["docs/", "tasks/"]),
        ("architect", &["docs/", "contracts/"]),
        ("dev", &["src/", "tests/unit/", "reports/"]),
        ("qa", &["tests/", "docker/", "reports/"]),
        ("ops", &["docs/", "reports/"]),
    ];
    table
        .iter()
        .map(|(role, prefixes)| {
            (
                role.to_string(),
                prefixes.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    4
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

/// Retry policy for generation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Global generation defaults. The API key normally comes from `LLM_API_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_provider() -> String {
    "openai-compatible".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmSection {
    pub fn settings(&self) -> LlmSettings {
        LlmSettings {
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            token: None,
        }
    }
}

/// Contents of `sliceforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceforgeToml {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_gates")]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub github: GithubSection,
}

impl Default for SliceforgeToml {
    fn default() -> Self {
        Self {
            workspace: WorkspaceSection::default(),
            database: DatabaseSection::default(),
            roles: default_roles(),
            gates: default_gates(),
            scheduler: SchedulerSection::default(),
            agent: AgentSection::default(),
            llm: LlmSection::default(),
            github: GithubSection::default(),
        }
    }
}

impl SliceforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse sliceforge.toml")
    }

    /// Load from `<state_dir>/sliceforge.toml`, or defaults if it is missing.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize sliceforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("SLICEFORGE_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.scheduler.max_workers = workers;
        }
        if let Some(key) = lookup("LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github.token = Some(token);
        }
        if let Some(url) = lookup("GITHUB_API_URL") {
            self.github.api_url = url;
        }
    }

    /// Role prefix table as a typed ACL. Unknown role names are skipped
    /// (reported by [`validate`](Self::validate)).
    pub fn path_acl(&self) -> PathAcl {
        let map: HashMap<Role, Vec<String>> = self
            .roles
            .iter()
            .filter_map(|(name, prefixes)| {
                name.parse::<Role>().ok().map(|role| (role, prefixes.clone()))
            })
            .collect();
        PathAcl::new(map)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, prefixes) in &self.roles {
            if name.parse::<Role>().is_err() {
                warnings.push(format!(
                    "Unknown role '{}' in [roles]; valid roles: pm, architect, dev, qa, ops",
                    name
                ));
            } else if prefixes.is_empty() {
                warnings.push(format!(
                    "Role '{}' has no path prefixes; every write will be denied",
                    name
                ));
            }
        }
        for role in Role::ALL {
            if !self.roles.contains_key(role.as_str()) {
                warnings.push(format!(
                    "Role '{}' is not configured; every write will be denied",
                    role
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for gate in &self.gates {
            if !seen.insert(gate.name.as_str()) {
                warnings.push(format!("Duplicate gate name '{}'", gate.name));
            }
            if gate.command.trim().is_empty() {
                warnings.push(format!("Gate '{}' has an empty command", gate.name));
            }
            if gate.timeout_secs == 0 {
                warnings.push(format!("Gate '{}' has a zero timeout", gate.name));
            }
        }

        if self.scheduler.max_workers == 0 {
            warnings.push("scheduler.max_workers must be at least 1".to_string());
        }
        if self.agent.max_attempts == 0 {
            warnings.push("agent.max_attempts must be at least 1".to_string());
        }
        if self.agent.base_delay_ms > self.agent.max_delay_ms {
            warnings.push("agent.base_delay_ms exceeds agent.max_delay_ms".to_string());
        }
        if !self.llm.settings().is_complete() {
            warnings.push(
                "Global LLM configuration is incomplete (base_url, api key, model); \
                 project or user configuration will be required"
                    .to_string(),
            );
        }

        warnings
    }
}

/// Runtime configuration: resolved paths plus the parsed file.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub file: SliceforgeToml,
}

impl Config {
    /// Load `<project_dir>/.sliceforge/sliceforge.toml` and apply the process
    /// environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let state_dir = project_dir.join(STATE_DIR);
        let mut file = SliceforgeToml::load_or_default(&state_dir)?;
        file.apply_env(|key| std::env::var(key).ok());
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            state_dir,
            file,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir.join(CONFIG_FILE).exists()
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.file.database.path)
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.resolve(&self.file.workspace.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_roles_and_gates() {
        let config = SliceforgeToml::default();
        assert_eq!(config.roles["dev"], vec!["src/", "tests/unit/", "reports/"]);
        assert_eq!(config.roles["qa"], vec!["tests/", "docker/", "reports/"]);
        let names: Vec<_> = config.gates.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["lint", "type", "contract", "test"]);
        assert_eq!(config.gates[0].command, "make lint");
        assert_eq!(config.gates[0].timeout_secs, 1800);
        assert_eq!(config.scheduler.max_workers, 4);
    }

    #[test]
    fn parse_partial_file_keeps_defaults() {
        let config = SliceforgeToml::parse(
            r#"
            [scheduler]
            max_workers = 2

            [[gates]]
            name = "lint"
            command = "ruff check ."
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_workers, 2);
        assert_eq!(config.gates.len(), 1);
        assert_eq!(config.gates[0].timeout_secs, 1800);
        assert_eq!(config.roles.len(), 5);
        assert_eq!(config.agent.max_attempts, 3);
    }

    #[test]
    fn parse_rejects_invalid_toml() {
        assert!(SliceforgeToml::parse("[scheduler\nmax_workers = ").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = SliceforgeToml::default();
        let env: HashMap<&str, &str> = [
            ("SLICEFORGE_MAX_WORKERS", "8"),
            ("LLM_API_KEY", "sk-env"),
            ("GITHUB_TOKEN", "ghp_abc"),
            ("GITHUB_API_URL", "http://localhost:9999"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.llm.api_key, "sk-env");
        assert_eq!(config.github.token.as_deref(), Some("ghp_abc"));
        assert_eq!(config.github.api_url, "http://localhost:9999");
    }

    #[test]
    fn path_acl_uses_configured_roles() {
        let acl = SliceforgeToml::default().path_acl();
        assert!(acl.is_allowed(Role::Dev, "src/app.py"));
        assert!(!acl.is_allowed(Role::Dev, "docs/x.md"));
    }

    #[test]
    fn validate_reports_unknown_roles_and_bad_gates() {
        let config = SliceforgeToml::parse(
            r#"
            [roles]
            designer = ["ui/"]
            dev = []

            [[gates]]
            name = "lint"
            command = ""
            timeout_secs = 0

            [[gates]]
            name = "lint"
            command = "make lint"
            "#,
        )
        .unwrap();
        let warnings = config.validate();
        let joined = warnings.join("\n");
        assert!(joined.contains("Unknown role 'designer'"));
        assert!(joined.contains("Role 'dev' has no path prefixes"));
        assert!(joined.contains("Role 'pm' is not configured"));
        assert!(joined.contains("Duplicate gate name 'lint'"));
        assert!(joined.contains("empty command"));
        assert!(joined.contains("zero timeout"));
    }

    #[test]
    fn save_then_load_preserves_gates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = SliceforgeToml::default();
        config.gates = vec![GateSpec::new("test", "cargo test", 60)];
        config.save(&path).unwrap();
        let loaded = SliceforgeToml::load(&path).unwrap();
        assert_eq!(loaded.gates, config.gates);
    }

    #[test]
    fn config_resolves_relative_paths_against_project_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            project_dir: dir.path().to_path_buf(),
            state_dir: dir.path().join(STATE_DIR),
            file: SliceforgeToml::default(),
        };
        assert_eq!(config.db_path(), dir.path().join(".sliceforge/sliceforge.db"));
        assert!(!config.is_initialized());
    }
}
