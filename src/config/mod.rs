use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

const APP_DOMAIN: &str = "io";
const APP_ORG: &str = "Tripdesk";
const APP_NAME: &str = "tripdesk";

pub struct ConfigLoader {
    paths: ConfigPaths,
}

impl ConfigLoader {
    pub fn discover() -> Result<Self> {
        let paths = ConfigPaths::discover()?;
        Ok(Self { paths })
    }

    pub fn with_paths(paths: ConfigPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn load_or_init(&self) -> Result<AppConfig> {
        self.paths.ensure_directories()?;
        if !self.paths.config_file.exists() {
            let mut default_cfg = AppConfig::default();
            default_cfg.post_load(&self.paths);
            self.write_default_config(&default_cfg)?;
            return Ok(default_cfg);
        }

        self.load()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let raw = fs::read_to_string(&self.paths.config_file)
            .with_context(|| format!("reading config {}", self.paths.config_file.display()))?;
        let mut cfg: AppConfig = toml::from_str(&raw).context("parsing config toml")?;
        cfg.post_load(&self.paths);
        Ok(cfg)
    }

    fn write_default_config(&self, cfg: &AppConfig) -> Result<()> {
        let toml = toml::to_string_pretty(cfg).context("serializing default config")?;
        if let Some(parent) = self.paths.config_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = fs::File::create(&self.paths.config_file)
            .with_context(|| format!("creating config {}", self.paths.config_file.display()))?;
        file.write_all(toml.as_bytes())
            .context("writing default config")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
}

impl ConfigPaths {
    /// Resolves the XDG locations, honouring `TRIPDESK_CONFIG` and
    /// `TRIPDESK_DATA`.
    pub fn discover() -> Result<Self> {
        let override_config = env::var("TRIPDESK_CONFIG").ok().map(PathBuf::from);
        let override_data = env::var("TRIPDESK_DATA").ok().map(PathBuf::from);

        let project_dirs = ProjectDirs::from(APP_DOMAIN, APP_ORG, APP_NAME)
            .context("resolving XDG project directories")?;

        let config_dir = override_config
            .clone()
            .map(|p| {
                if p.is_dir() {
                    p
                } else {
                    p.parent().map(Path::to_path_buf).unwrap_or(p)
                }
            })
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());

        let config_file = override_config
            .filter(|p| p.is_file() || p.extension().is_some())
            .unwrap_or_else(|| config_dir.join("config.toml"));

        let data_root = override_data.unwrap_or_else(|| project_dirs.data_dir().to_path_buf());
        let state_dir = project_dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_root.join("state"));

        Ok(Self {
            config_dir,
            config_file,
            database_path: data_root.join("tripdesk.db"),
            data_dir: data_root,
            log_dir: state_dir.join("logs"),
        })
    }

    /// Keeps everything under one root directory.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            config_file: root.join("config.toml"),
            data_dir: root.to_path_buf(),
            database_path: root.join("tripdesk.db"),
            log_dir: root.join("logs"),
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.log_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating application directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub storage: StorageOptions,
    pub ui: UiConfig,
}

impl AppConfig {
    fn post_load(&mut self, paths: &ConfigPaths) {
        self.storage.resolve(paths);
        if self.sync.workers == 0 {
            tracing::warn!("sync.workers must be at least 1, using 1");
            self.sync.workers = 1;
        }
        if self.sync.tick.is_zero() {
            tracing::warn!("sync.tick_ms of 0 would spin, using 100");
            self.sync.tick = Duration::from_millis(100);
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a free-text edit is committed.
    #[serde(rename = "text_quiet_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub text_quiet: Duration,
    /// Quiet period for toggles and dates. Zero commits immediately.
    #[serde(rename = "discrete_quiet_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub discrete_quiet: Duration,
    /// Remote worker threads. Requests for one trip always share a worker.
    pub workers: usize,
    #[serde(rename = "tick_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick: Duration,
    /// How long commands and quitting wait for in-flight writes.
    #[serde(rename = "idle_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            text_quiet: Duration::from_millis(2000),
            discrete_quiet: Duration::ZERO,
            workers: 2,
            tick: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(skip)]
    pub database_path: PathBuf,
    pub wal_autocheckpoint: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_path: PathBuf::new(),
            wal_autocheckpoint: 1000,
        }
    }
}

impl StorageOptions {
    fn resolve(&mut self, paths: &ConfigPaths) {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = paths.database_path.clone();
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    #[serde(rename = "notice_ttl_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub notice_ttl: Duration,
    pub confirm_delete: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            notice_ttl: Duration::from_secs(8),
            confirm_delete: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn first_run_writes_defaults() -> Result<()> {
        let root = TempDir::new()?;
        let loader = ConfigLoader::with_paths(ConfigPaths::rooted_at(root.path()));
        let cfg = loader.load_or_init()?;
        assert!(loader.paths().config_file.exists());
        assert_eq!(cfg.sync.text_quiet, Duration::from_millis(2000));
        assert_eq!(cfg.storage.database_path, root.path().join("tripdesk.db"));

        let raw = fs::read_to_string(&loader.paths().config_file)?;
        assert!(raw.contains("text_quiet_ms = 2000"));
        assert!(raw.contains("notice_ttl_secs = 8"));
        Ok(())
    }

    #[test]
    fn partial_files_keep_other_defaults() -> Result<()> {
        let root = TempDir::new()?;
        let paths = ConfigPaths::rooted_at(root.path());
        fs::write(
            &paths.config_file,
            "[sync]\ntext_quiet_ms = 500\nworkers = 0\n\n[ui]\nconfirm_delete = false\n",
        )?;
        let cfg = ConfigLoader::with_paths(paths).load()?;
        assert_eq!(cfg.sync.text_quiet, Duration::from_millis(500));
        assert_eq!(cfg.sync.discrete_quiet, Duration::ZERO);
        assert_eq!(cfg.sync.workers, 1);
        assert!(!cfg.ui.confirm_delete);
        assert_eq!(cfg.storage.wal_autocheckpoint, 1000);
        Ok(())
    }
}
