use anyhow::{Context, Result};
use gatehouse_infra::{AuditLogOptions, RateLimitConfig, RetryPolicy};
use gatehouse_policy::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "gatehouse.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub backend: AuditBackend,
    /// Segment directory for `jsonl`, database file for `sqlite`.
    pub path: PathBuf,
    pub segment_max_entries: usize,
    pub verify_on_open: bool,
    pub retry: RetryPolicy,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Jsonl,
            path: PathBuf::from("./data/audit"),
            segment_max_entries: 10_000,
            verify_on_open: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl AuditSettings {
    pub fn options(&self) -> AuditLogOptions {
        AuditLogOptions {
            retry: self.retry.clone(),
            verify_on_open: self.verify_on_open,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub per_context: RateLimitConfig,
    pub global: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            per_context: RateLimitConfig::new(60, Duration::from_secs(60)),
            global: RateLimitConfig::new(10_000, Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audit: AuditSettings,
    pub entities_db: PathBuf,
    /// Extra YAML permission catalog merged after the built-in one.
    pub catalog_path: Option<PathBuf>,
    /// Collections that get create/read/update/delete permissions.
    pub collections: Vec<String>,
    pub engine: EngineConfig,
    pub rate_limit: RateLimitSettings,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audit: AuditSettings::default(),
            entities_db: PathBuf::from("./data/entities.db"),
            catalog_path: None,
            collections: Vec::new(),
            engine: EngineConfig::default(),
            rate_limit: RateLimitSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Every SQLite file this configuration writes to.
    pub fn sqlite_databases(&self) -> Vec<&Path> {
        let mut databases = vec![self.entities_db.as_path()];
        if self.audit.backend == AuditBackend::Sqlite {
            databases.push(self.audit.path.as_path());
        }
        databases
    }

    /// Loads `path`, or defaults when it does not exist, then applies
    /// `GATEHOUSE_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("GATEHOUSE_AUDIT_PATH") {
            self.audit.path = PathBuf::from(path);
        }
        if let Some(backend) = var("GATEHOUSE_AUDIT_BACKEND") {
            match backend.as_str() {
                "jsonl" => self.audit.backend = AuditBackend::Jsonl,
                "sqlite" => self.audit.backend = AuditBackend::Sqlite,
                _ => {}
            }
        }
        if let Some(path) = var("GATEHOUSE_ENTITIES_DB") {
            self.entities_db = PathBuf::from(path);
        }
        if let Some(level) = var("GATEHOUSE_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.audit.path.as_os_str().is_empty() {
            anyhow::bail!("audit.path must not be empty");
        }
        if self.audit.segment_max_entries == 0 {
            anyhow::bail!("audit.segment_max_entries must be at least 1");
        }
        if self.audit.retry.max_attempts == 0 {
            anyhow::bail!("audit.retry.max_attempts must be at least 1");
        }
        if self.engine.two_factor_freshness.is_zero() {
            anyhow::bail!("engine.two_factor_freshness must be positive");
        }
        for limit in [&self.rate_limit.per_context, &self.rate_limit.global] {
            if limit.max_requests == 0 || limit.window.is_zero() {
                anyhow::bail!("rate limits need a positive max_requests and window_secs");
            }
        }
        if let Some(name) = self
            .collections
            .iter()
            .find(|c| c.is_empty() || c.contains(':'))
        {
            anyhow::bail!("invalid collection name '{}'", name);
        }
        Ok(())
    }
}
