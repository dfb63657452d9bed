use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::{
    CatalogStore, DownloadCoordinator, DownloadStatus, InstallEvent, InstallState, TaskId,
};

use super::{ensure_model_id, CatalogResultExt};

/// Starts, queues, pauses, resumes and cancels model downloads, keeping the catalog
/// in step with the coordinator's tasks.
pub struct DownloadModel {
    store: Arc<dyn CatalogStore>,
    coordinator: Arc<dyn DownloadCoordinator>,
    /// Serializes the headroom check with the start it guards.
    admission: Mutex<()>,
}

impl DownloadModel {
    pub fn new(store: Arc<dyn CatalogStore>, coordinator: Arc<dyn DownloadCoordinator>) -> Self {
        Self {
            store,
            coordinator,
            admission: Mutex::new(()),
        }
    }

    /// Starts the transfer when a slot is free, otherwise queues it. A queued model keeps
    /// its catalog state until the coordinator promotes the task.
    pub fn download_model(&self, model_id: &str) -> Result<TaskId, EngineError> {
        ensure_model_id(model_id)?;
        let lock = self.store.model_lock(model_id);
        let _model_guard = lock.lock();

        let model = self
            .store
            .get_by_id(model_id)
            .for_model("read catalog entry", model_id)?
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;
        if !model.is_downloadable() {
            return Err(EngineError::InvalidModelState {
                model_id: model_id.to_string(),
                state: model.install_state,
                action: "download",
            });
        }
        let next = model
            .install_state
            .apply(InstallEvent::DownloadStarted)
            .map_err(|err| EngineError::install_transition(model_id, err, "download"))?;

        let _admission = self.admission.lock();
        let active = self
            .coordinator
            .get_active_downloads()
            .iter()
            .filter(|task| task.status == DownloadStatus::Downloading)
            .count();
        let limit = self.coordinator.get_max_concurrent_downloads();

        if active >= limit {
            let task_id = self
                .coordinator
                .queue_download(model_id)
                .map_err(|err| EngineError::download(err, Some(model_id), "queue"))?;
            info!(model_id, %task_id, active, limit, "Download queued");
            return Ok(task_id);
        }

        let task_id = self
            .coordinator
            .start_download(model_id)
            .map_err(|err| EngineError::download(err, Some(model_id), "start"))?;
        if let Err(error) = self
            .store
            .record_download(model_id, next, task_id)
            .for_model("record download task", model_id)
        {
            warn!("Rolling back download {task_id} for {model_id}: {error:?}");
            if let Err(cancel_error) = self.coordinator.cancel_download(task_id) {
                warn!("Could not cancel download {task_id}: {cancel_error:?}");
            }
            if let Err(cleanup_error) = self.coordinator.delete_partial_files(model_id) {
                warn!("Could not clean up {model_id}: {cleanup_error:?}");
            }
            return Err(error);
        }
        info!(model_id, %task_id, active, limit, "Download started");
        Ok(task_id)
    }

    pub fn pause_download(&self, task_id: TaskId) -> Result<(), EngineError> {
        let task = self
            .coordinator
            .get_task(task_id)
            .ok_or(EngineError::UnknownTask { task_id })?;
        self.coordinator
            .pause_download(task_id)
            .map_err(|err| {
                EngineError::download(err, Some(task.model_id.as_str()), "pause").for_task(task_id)
            })?;
        self.coordinator
            .update_task_status(task_id, DownloadStatus::Paused)
            .map_err(|err| {
                EngineError::download(err, Some(task.model_id.as_str()), "pause").for_task(task_id)
            })?;
        info!(model_id = %task.model_id, %task_id, "Download paused");
        Ok(())
    }

    /// Only a paused task can be resumed; anything else is reported, not ignored.
    pub fn resume_download(&self, task_id: TaskId) -> Result<DownloadStatus, EngineError> {
        let task = self
            .coordinator
            .get_task(task_id)
            .ok_or(EngineError::UnknownTask { task_id })?;
        if task.status != DownloadStatus::Paused {
            return Err(EngineError::InvalidTaskState {
                task_id,
                status: task.status,
                action: "resume",
            });
        }
        let status = self
            .coordinator
            .resume_download(task_id)
            .map_err(|err| {
                EngineError::download(err, Some(task.model_id.as_str()), "resume").for_task(task_id)
            })?;
        info!(model_id = %task.model_id, %task_id, %status, "Download resumed");
        Ok(status)
    }

    /// Stops the transfer and removes its files before the catalog forgets the task.
    pub fn cancel_download(&self, task_id: TaskId) -> Result<(), EngineError> {
        let model_id = self
            .coordinator
            .get_model_id_for_task(task_id)
            .map_err(|err| EngineError::download(err, None, "cancel").for_task(task_id))?;
        let lock = self.store.model_lock(&model_id);
        let _model_guard = lock.lock();

        let model = self
            .store
            .get_by_id(&model_id)
            .for_model("read catalog entry", &model_id)?;
        if let Some(model) = &model {
            model
                .install_state
                .apply(InstallEvent::Cancelled)
                .map_err(|err| EngineError::install_transition(&model_id, err, "cancel"))?;
        }

        self.coordinator
            .cancel_download(task_id)
            .map_err(|err| {
                EngineError::download(err, Some(model_id.as_str()), "cancel").for_task(task_id)
            })?;
        self.coordinator
            .delete_partial_files(&model_id)
            .map_err(|err| {
                EngineError::download(err, Some(model_id.as_str()), "clean up").for_task(task_id)
            })?;

        if model.is_some() {
            self.store
                .update_install_state(&model_id, InstallState::NotInstalled)
                .for_model("reset install state", &model_id)?;
            self.store
                .update_download_task_id(&model_id, None)
                .for_model("clear download task", &model_id)?;
        }
        info!(model_id = %model_id, %task_id, "Download cancelled");
        Ok(())
    }
}
