use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;
const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub models_dir: Option<PathBuf>,
    pub catalog_url: String,
    pub max_concurrent_downloads: usize,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout; 0 disables it, which multi-gigabyte transfers need.
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub min_free_space_bytes: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            catalog_url: "https://models.example.com/catalog.json".into(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            connect_timeout_secs: 15,
            request_timeout_secs: 0,
            user_agent: concat!("model-engine/", env!("CARGO_PKG_VERSION")).into(),
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads.max(1)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn resolve_models_dir(&self) -> Result<PathBuf> {
        match &self.models_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("models")),
        }
    }

    pub fn http_client(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(self.connect_timeout())
            .user_agent(self.user_agent.clone());
        builder = builder.timeout(self.request_timeout());
        builder.build().context("create http client")
    }
}

pub struct SettingsManager {
    path: PathBuf,
    inner: RwLock<EngineSettings>,
}

impl SettingsManager {
    /// Loads `config.json` from the platform config directory.
    pub fn load() -> Result<Self> {
        let path = resolve_config_path()?;
        Ok(Self::at(path))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = load_settings(&path).unwrap_or_else(|error| {
            warn!("Falling back to default engine settings: {error:?}");
            EngineSettings::default()
        });
        Self {
            path,
            inner: RwLock::new(settings),
        }
    }

    pub fn read(&self) -> EngineSettings {
        self.inner.read().clone()
    }

    pub fn write(&self, settings: EngineSettings) -> Result<()> {
        let mut guard = self.inner.write();
        persist_settings(self.path.as_path(), &settings)?;
        *guard = settings;
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "ModelEngine", "ModelEngine").context("missing project directories")
}

fn resolve_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let dir = project_dirs.config_dir();
    fs::create_dir_all(dir).context("creating config directory failed")?;
    Ok(dir.join(CONFIG_FILE))
}

fn load_settings(path: &Path) -> Result<EngineSettings> {
    if !path.exists() {
        return Ok(EngineSettings::default());
    }
    let bytes = fs::read(path).with_context(|| format!("failed reading {path:?}"))?;
    serde_json::from_slice(&bytes).context("config json could not be parsed")
}

fn persist_settings(path: &Path, settings: &EngineSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {parent:?}"))?;
    }
    let serialized =
        serde_json::to_vec_pretty(settings).context("serialize settings to json failed")?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, serialized).with_context(|| format!("write settings to {staging:?}"))?;
    fs::rename(&staging, path).with_context(|| format!("replace settings at {path:?}"))?;
    Ok(())
}
