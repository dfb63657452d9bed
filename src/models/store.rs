use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::layout::{is_valid_model_id, ArtifactLayout};
use super::package::{InstallState, ModelPackage};
use super::task::TaskId;

const CATALOG_FILE: &str = "catalog.json";

/// Per-model mutex handed out by the store; holding it serializes catalog
/// mutations for one model across use cases and the transfer listener.
pub type ModelLock = Arc<Mutex<()>>;

/// Answers whether a live chat session is currently running on a model.
pub trait SessionMonitor: Send + Sync {
    fn is_model_active(&self, model_id: &str) -> Result<bool>;
}

/// For hosts without a session runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveSessions;

impl SessionMonitor for NoActiveSessions {
    fn is_model_active(&self, _model_id: &str) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelCatalogRefreshStatus {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    pub last_success_source: Option<String>,
    pub last_success_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_fallback_at: Option<OffsetDateTime>,
    pub last_fallback_reason: Option<String>,
    pub last_fallback_cached_count: usize,
    pub last_fallback_message: Option<String>,
}

impl ModelCatalogRefreshStatus {
    /// The most recent refresh failed and the UI is looking at cached data.
    #[must_use]
    pub fn is_serving_cache(&self) -> bool {
        self.last_fallback_at.is_some()
    }
}

/// Durable table of known model packages and their install state.
pub trait CatalogStore: Send + Sync {
    fn get_all(&self) -> Result<Vec<ModelPackage>>;
    fn get_by_id(&self, model_id: &str) -> Result<Option<ModelPackage>>;
    /// Merges `models` over the persisted catalog in one write; nothing changes on failure.
    fn replace_catalog(&self, models: Vec<ModelPackage>) -> Result<()>;
    fn upsert_model(&self, model: ModelPackage) -> Result<()>;
    fn update_install_state(&self, model_id: &str, state: InstallState) -> Result<()>;
    fn update_download_task_id(&self, model_id: &str, task_id: Option<TaskId>) -> Result<()>;
    /// Records a started transfer: install state and task id land in one write or not at all.
    fn record_download(&self, model_id: &str, state: InstallState, task_id: TaskId)
        -> Result<()>;
    fn update_checksum(&self, model_id: &str, checksum: &str) -> Result<()>;
    fn is_model_active_in_session(&self, model_id: &str) -> Result<bool>;
    fn delete_model_files(&self, model_id: &str) -> Result<()>;
    fn record_refresh_success(&self, source: &str, model_count: usize) -> Result<()>;
    fn record_offline_fallback(
        &self,
        reason: &str,
        cached_count: usize,
        message: Option<&str>,
    ) -> Result<()>;
    fn refresh_status(&self) -> ModelCatalogRefreshStatus;
    fn observe_catalog(&self) -> watch::Receiver<Vec<ModelPackage>>;
    fn observe_refresh_status(&self) -> watch::Receiver<ModelCatalogRefreshStatus>;
    fn model_lock(&self, model_id: &str) -> ModelLock;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CatalogFile {
    models: Vec<ModelPackage>,
    refresh_status: ModelCatalogRefreshStatus,
}

impl CatalogFile {
    fn model_mut(&mut self, model_id: &str) -> Result<&mut ModelPackage> {
        self.models
            .iter_mut()
            .find(|model| model.model_id == model_id)
            .ok_or_else(|| anyhow!("model {model_id} is not in the catalog"))
    }
}

/// JSON-backed catalog store. Every mutation is applied to a copy, written to disk with
/// a rename, and only then published, so a failed write leaves the catalog untouched.
pub struct FileCatalogStore {
    layout: ArtifactLayout,
    path: PathBuf,
    state: Mutex<CatalogFile>,
    sessions: Arc<dyn SessionMonitor>,
    catalog_tx: watch::Sender<Vec<ModelPackage>>,
    status_tx: watch::Sender<ModelCatalogRefreshStatus>,
    locks: Mutex<HashMap<String, ModelLock>>,
}

impl FileCatalogStore {
    pub fn open(layout: ArtifactLayout, sessions: Arc<dyn SessionMonitor>) -> Result<Self> {
        layout.ensure_directory()?;
        let path = layout.root().join(CATALOG_FILE);
        let file = load_catalog(&path)?;
        info!(
            models = file.models.len(),
            path = %path.display(),
            "Loaded model catalog"
        );
        let (catalog_tx, _) = watch::channel(file.models.clone());
        let (status_tx, _) = watch::channel(file.refresh_status.clone());
        Ok(Self {
            layout,
            path,
            state: Mutex::new(file),
            sessions,
            catalog_tx,
            status_tx,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogFile) -> Result<()>,
    {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        apply(&mut next)?;
        persist_catalog(&self.path, &next)?;

        let models_changed = next.models != guard.models;
        let status_changed = next.refresh_status != guard.refresh_status;
        *guard = next;
        if models_changed {
            self.catalog_tx.send_replace(guard.models.clone());
        }
        if status_changed {
            self.status_tx.send_replace(guard.refresh_status.clone());
        }
        Ok(())
    }
}

impl CatalogStore for FileCatalogStore {
    fn get_all(&self) -> Result<Vec<ModelPackage>> {
        Ok(self.state.lock().models.clone())
    }

    fn get_by_id(&self, model_id: &str) -> Result<Option<ModelPackage>> {
        Ok(self
            .state
            .lock()
            .models
            .iter()
            .find(|model| model.model_id == model_id)
            .cloned())
    }

    fn replace_catalog(&self, models: Vec<ModelPackage>) -> Result<()> {
        if let Some(invalid) = models
            .iter()
            .find(|model| !is_valid_model_id(&model.model_id))
        {
            return Err(anyhow!("invalid model id {:?}", invalid.model_id));
        }
        self.mutate(|file| {
            let mut merged: Vec<ModelPackage> = Vec::with_capacity(models.len());
            for incoming in models {
                if merged.iter().any(|model| model.model_id == incoming.model_id) {
                    continue;
                }
                let entry = match file
                    .models
                    .iter()
                    .find(|persisted| persisted.model_id == incoming.model_id)
                {
                    Some(persisted) => incoming.merge_over(persisted),
                    None => incoming,
                };
                merged.push(entry);
            }
            let preserved: Vec<ModelPackage> = file
                .models
                .iter()
                .filter(|persisted| {
                    !merged
                        .iter()
                        .any(|model| model.model_id == persisted.model_id)
                })
                .cloned()
                .collect();
            if !preserved.is_empty() {
                debug!(
                    count = preserved.len(),
                    "Keeping local models absent from remote catalog"
                );
            }
            merged.extend(preserved);
            file.models = merged;
            Ok(())
        })
        .context("replace model catalog")
    }

    fn upsert_model(&self, model: ModelPackage) -> Result<()> {
        if !is_valid_model_id(&model.model_id) {
            return Err(anyhow!("invalid model id {:?}", model.model_id));
        }
        self.mutate(|file| {
            if let Some(existing) = file
                .models
                .iter_mut()
                .find(|current| current.model_id == model.model_id)
            {
                *existing = model;
            } else {
                file.models.push(model);
            }
            Ok(())
        })
        .context("upsert model")
    }

    fn update_install_state(&self, model_id: &str, state: InstallState) -> Result<()> {
        self.mutate(|file| {
            let model = file.model_mut(model_id)?;
            if model.install_state != state {
                debug!(model_id, from = %model.install_state, to = %state, "Install state changed");
                model.install_state = state;
                model.updated_at = OffsetDateTime::now_utc();
            }
            Ok(())
        })
        .with_context(|| format!("update install state for {model_id}"))
    }

    fn update_download_task_id(&self, model_id: &str, task_id: Option<TaskId>) -> Result<()> {
        self.mutate(|file| {
            let model = file.model_mut(model_id)?;
            if model.download_task_id != task_id {
                model.download_task_id = task_id;
                model.updated_at = OffsetDateTime::now_utc();
            }
            Ok(())
        })
        .with_context(|| format!("update download task for {model_id}"))
    }

    fn record_download(
        &self,
        model_id: &str,
        state: InstallState,
        task_id: TaskId,
    ) -> Result<()> {
        self.mutate(|file| {
            let model = file.model_mut(model_id)?;
            debug!(model_id, from = %model.install_state, to = %state, %task_id, "Download recorded");
            model.install_state = state;
            model.download_task_id = Some(task_id);
            model.updated_at = OffsetDateTime::now_utc();
            Ok(())
        })
        .with_context(|| format!("record download for {model_id}"))
    }

    fn update_checksum(&self, model_id: &str, checksum: &str) -> Result<()> {
        self.mutate(|file| {
            let model = file.model_mut(model_id)?;
            if model.checksum_sha256.as_deref() != Some(checksum) {
                model.checksum_sha256 = Some(checksum.to_string());
                model.updated_at = OffsetDateTime::now_utc();
            }
            Ok(())
        })
        .with_context(|| format!("update checksum for {model_id}"))
    }

    fn is_model_active_in_session(&self, model_id: &str) -> Result<bool> {
        self.sessions.is_model_active(model_id)
    }

    fn delete_model_files(&self, model_id: &str) -> Result<()> {
        if !is_valid_model_id(model_id) {
            return Err(anyhow!("invalid model id {model_id:?}"));
        }
        self.layout.remove_all(model_id)?;
        info!(model_id, "Removed model files");
        Ok(())
    }

    fn record_refresh_success(&self, source: &str, model_count: usize) -> Result<()> {
        self.mutate(|file| {
            file.refresh_status = ModelCatalogRefreshStatus {
                last_success_at: Some(OffsetDateTime::now_utc()),
                last_success_source: Some(source.to_string()).filter(|s| !s.trim().is_empty()),
                last_success_count: model_count,
                ..ModelCatalogRefreshStatus::default()
            };
            Ok(())
        })
        .context("record catalog refresh")
    }

    fn record_offline_fallback(
        &self,
        reason: &str,
        cached_count: usize,
        message: Option<&str>,
    ) -> Result<()> {
        warn!(reason, cached_count, "Serving cached model catalog");
        self.mutate(|file| {
            let status = &mut file.refresh_status;
            status.last_fallback_at = Some(OffsetDateTime::now_utc());
            status.last_fallback_reason = Some(reason.to_string()).filter(|r| !r.trim().is_empty());
            status.last_fallback_cached_count = cached_count;
            status.last_fallback_message = message
                .map(ToOwned::to_owned)
                .filter(|m| !m.trim().is_empty());
            Ok(())
        })
        .context("record catalog fallback")
    }

    fn refresh_status(&self) -> ModelCatalogRefreshStatus {
        self.state.lock().refresh_status.clone()
    }

    fn observe_catalog(&self) -> watch::Receiver<Vec<ModelPackage>> {
        self.catalog_tx.subscribe()
    }

    fn observe_refresh_status(&self) -> watch::Receiver<ModelCatalogRefreshStatus> {
        self.status_tx.subscribe()
    }

    /// Locks nobody holds a handle to are dropped, so the table only tracks models in use.
    fn model_lock(&self, model_id: &str) -> ModelLock {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(model_id.to_string()).or_default().clone()
    }
}

fn load_catalog(path: &Path) -> Result<CatalogFile> {
    if !path.exists() {
        return Ok(CatalogFile::default());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).context("parse model catalog")
}

fn persist_catalog(path: &Path, file: &CatalogFile) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(file).context("serialize model catalog")?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, serialized)
        .with_context(|| format!("write catalog to {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
