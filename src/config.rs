//! Configuration loading and management.

use crate::error::{Error, Result};
use crate::host::{HostOptions, RestartPolicy};
use crate::permissions::{PermissionPolicy, TrustedNamespaces};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "EXTHOST_CONFIG_PATH";
pub const GLOBAL_DIR_ENV: &str = "EXTHOST_DIR";

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_EXTENSIONS_DIR: &str = "extensions";

/// Main configuration structure. Every field is optional so layers merge
/// field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "extensionsDir")]
    pub extensions_dir: Option<PathBuf>,

    pub permissions: Option<PermissionPolicy>,
    #[serde(alias = "trustedNamespaces")]
    pub trusted_namespaces: Option<Vec<String>>,

    // Timeouts
    #[serde(alias = "commandTimeoutMs")]
    pub command_timeout_ms: Option<u64>,
    #[serde(alias = "activationTimeoutMs")]
    pub activation_timeout_ms: Option<u64>,
    #[serde(alias = "deactivateGraceMs")]
    pub deactivate_grace_ms: Option<u64>,
    #[serde(alias = "execTimeoutMs")]
    pub exec_timeout_ms: Option<u64>,

    #[serde(alias = "historyCapacity")]
    pub history_capacity: Option<usize>,
    pub restart: Option<RestartPolicy>,
    /// QuickJS heap limit per worker.
    #[serde(alias = "memoryLimitMb")]
    pub memory_limit_mb: Option<u64>,
}

impl Config {
    /// Load configuration from the env override or the global and project files.
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let config_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_with_roots(config_path.as_deref(), &Self::global_dir(), &cwd)
    }

    /// Get the global configuration directory.
    pub fn global_dir() -> PathBuf {
        global_dir_from_env(|key| std::env::var(key).ok())
    }

    /// Get the project configuration directory.
    pub fn project_dir() -> PathBuf {
        PathBuf::from(".exthost")
    }

    pub fn load_with_roots(
        config_path: Option<&Path>,
        global_dir: &Path,
        cwd: &Path,
    ) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_path(path);
        }
        let global = Self::load_from_path(&global_dir.join(SETTINGS_FILE))?;
        let project = Self::load_from_path(&cwd.join(Self::project_dir()).join(SETTINGS_FILE))?;
        Ok(Self::merge(global, project))
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse settings file {}: {e}",
                path.display()
            ))
        })?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(config)
    }

    /// Merge two configurations, with `other` taking precedence.
    pub fn merge(base: Self, other: Self) -> Self {
        Self {
            extensions_dir: other.extensions_dir.or(base.extensions_dir),
            permissions: other.permissions.or(base.permissions),
            trusted_namespaces: other.trusted_namespaces.or(base.trusted_namespaces),
            command_timeout_ms: other.command_timeout_ms.or(base.command_timeout_ms),
            activation_timeout_ms: other.activation_timeout_ms.or(base.activation_timeout_ms),
            deactivate_grace_ms: other.deactivate_grace_ms.or(base.deactivate_grace_ms),
            exec_timeout_ms: other.exec_timeout_ms.or(base.exec_timeout_ms),
            history_capacity: other.history_capacity.or(base.history_capacity),
            restart: other.restart.or(base.restart),
            memory_limit_mb: other.memory_limit_mb.or(base.memory_limit_mb),
        }
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.extensions_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTENSIONS_DIR))
    }

    /// Trusted namespaces: the environment wins over the file.
    pub fn trusted_namespaces(&self) -> TrustedNamespaces {
        TrustedNamespaces::from_env().unwrap_or_else(|| {
            TrustedNamespaces::new(self.trusted_namespaces.clone().unwrap_or_default())
        })
    }

    /// Host options with defaults for everything left unset.
    pub fn host_options(&self, extensions_dir: Option<PathBuf>) -> HostOptions {
        let mut options = HostOptions::new(extensions_dir.unwrap_or_else(|| self.extensions_dir()));
        if let Some(ms) = self.command_timeout_ms {
            options.command_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.activation_timeout_ms {
            options.activation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.deactivate_grace_ms {
            options.deactivate_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.exec_timeout_ms {
            options.exec_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = self.history_capacity {
            options.history_capacity = capacity;
        }
        options.restart = self.restart.unwrap_or_default();
        options.trusted = self.trusted_namespaces();
        options.memory_limit_mb = self.memory_limit_mb;
        options
    }
}

fn global_dir_from_env<F>(get_env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    get_env(GLOBAL_DIR_ENV).map_or_else(
        || {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".exthost")
        },
        PathBuf::from,
    )
}
