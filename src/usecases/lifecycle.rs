use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{CatalogStore, DownloadCoordinator, DownloadStatus, InstallEvent, TaskId};

use super::{ensure_model_id, CatalogResultExt};

/// Opaque record handed over by the host application (persona, provider config, chat).
pub type ExportRecord = serde_json::Value;

/// Packages user data into a backup bundle. Implemented by the host application.
pub trait ExportService: Send + Sync {
    fn gather_personas(&self) -> Result<Vec<ExportRecord>>;
    fn gather_api_provider_configs(&self) -> Result<Vec<ExportRecord>>;
    fn gather_chat_history(&self) -> Result<Vec<ExportRecord>>;
    /// Writes the bundle and returns its final location.
    fn create_export_bundle(
        &self,
        personas: &[ExportRecord],
        configs: &[ExportRecord],
        chat_history: Option<&[ExportRecord]>,
        destination: &Path,
    ) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportWarning {
    /// The bundle is written in plain text, API keys included.
    Unencrypted,
}

impl fmt::Display for ExportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportWarning::Unencrypted => f.write_str(
                "backup is not encrypted; store it somewhere only you can access",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub bundle_path: PathBuf,
    pub warnings: Vec<ExportWarning>,
}

/// Deletion, retry after failure, and backup export.
pub struct ModelLifecycle {
    store: Arc<dyn CatalogStore>,
    coordinator: Arc<dyn DownloadCoordinator>,
    export: Arc<dyn ExportService>,
}

impl ModelLifecycle {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        coordinator: Arc<dyn DownloadCoordinator>,
        export: Arc<dyn ExportService>,
    ) -> Self {
        Self {
            store,
            coordinator,
            export,
        }
    }

    /// Removes a model's files and returns it to `NotInstalled`. A model powering a live
    /// session is never touched.
    pub fn delete_model(&self, model_id: &str) -> Result<(), EngineError> {
        ensure_model_id(model_id)?;
        let lock = self.store.model_lock(model_id);
        let _model_guard = lock.lock();

        let in_use = self
            .store
            .is_model_active_in_session(model_id)
            .for_model("check sessions", model_id)?;
        if in_use {
            warn!(model_id, "Refusing to delete a model in use");
            return Err(EngineError::ModelInUse {
                model_id: model_id.to_string(),
            });
        }

        let model = self
            .store
            .get_by_id(model_id)
            .for_model("read catalog entry", model_id)?
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;
        let next = model
            .install_state
            .apply(InstallEvent::Deleted)
            .map_err(|err| EngineError::install_transition(model_id, err, "delete"))?;

        self.store
            .delete_model_files(model_id)
            .for_model("delete files", model_id)?;
        self.store
            .update_install_state(model_id, next)
            .for_model("reset install state", model_id)?;
        if model.download_task_id.is_some() {
            self.store
                .update_download_task_id(model_id, None)
                .for_model("clear download task", model_id)?;
        }
        info!(model_id, "Model deleted");
        Ok(())
    }

    /// Restarts a failed transfer from zero bytes under the same task id.
    pub fn retry_failed_download(&self, task_id: TaskId) -> Result<TaskId, EngineError> {
        let task = self
            .coordinator
            .get_task(task_id)
            .ok_or(EngineError::UnknownTask { task_id })?;
        if task.status != DownloadStatus::Failed {
            return Err(EngineError::InvalidTaskState {
                task_id,
                status: task.status,
                action: "retry",
            });
        }
        let model_id = task.model_id;
        let lock = self.store.model_lock(&model_id);
        let _model_guard = lock.lock();

        let model = self
            .store
            .get_by_id(&model_id)
            .for_model("read catalog entry", &model_id)?
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.clone(),
            })?;
        let next = model
            .install_state
            .apply(InstallEvent::RetryStarted)
            .map_err(|err| EngineError::install_transition(&model_id, err, "retry"))?;

        self.coordinator
            .reset_task(task_id)
            .map_err(|err| {
                EngineError::download(err, Some(model_id.as_str()), "reset").for_task(task_id)
            })?;
        let started = self
            .coordinator
            .start_download(&model_id)
            .map_err(|err| {
                EngineError::download(err, Some(model_id.as_str()), "restart").for_task(task_id)
            })?;
        if let Err(error) = self
            .store
            .record_download(&model_id, next, started)
            .for_model("record download task", &model_id)
        {
            warn!("Retry of {started} for {model_id} not recorded; failing it again: {error:?}");
            if let Err(status_error) = self
                .coordinator
                .update_task_status(started, DownloadStatus::Failed)
            {
                warn!("Could not stop download {started}: {status_error:?}");
            }
            if let Err(cleanup_error) = self.coordinator.delete_partial_files(&model_id) {
                warn!("Could not clean up {model_id}: {cleanup_error:?}");
            }
            return Err(error);
        }
        info!(model_id = %model_id, task_id = %started, "Retrying failed download");
        Ok(started)
    }

    /// Hands the backup to the export service. The report always carries the
    /// unencrypted warning.
    pub fn export_backup(
        &self,
        destination: &Path,
        include_chat_history: bool,
    ) -> Result<ExportReport, EngineError> {
        let export_error = |cause: anyhow::Error| EngineError::Export { cause };
        let personas = self.export.gather_personas().map_err(export_error)?;
        let configs = self
            .export
            .gather_api_provider_configs()
            .map_err(export_error)?;
        let chat_history = if include_chat_history {
            Some(self.export.gather_chat_history().map_err(export_error)?)
        } else {
            None
        };
        let bundle_path = self
            .export
            .create_export_bundle(&personas, &configs, chat_history.as_deref(), destination)
            .map_err(export_error)?;
        warn!(
            path = %bundle_path.display(),
            personas = personas.len(),
            configs = configs.len(),
            chat_history = include_chat_history,
            "Backup exported without encryption"
        );
        Ok(ExportReport {
            bundle_path,
            warnings: vec![ExportWarning::Unencrypted],
        })
    }
}
