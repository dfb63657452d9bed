//! In-memory collaborators for use-case tests. Both fakes keep a call log so tests can
//! assert on the exact sequence of side effects.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::DownloadError;
use crate::models::{
    CatalogStore, DownloadCoordinator, DownloadStatus, DownloadTask, InstallState,
    ModelCatalogRefreshStatus, ModelLock, ModelPackage, TaskId, TransferEvent,
};

pub(crate) struct FakeStore {
    models: Mutex<Vec<ModelPackage>>,
    calls: Mutex<Vec<String>>,
    in_session: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    status: Mutex<ModelCatalogRefreshStatus>,
    locks: Mutex<HashMap<String, ModelLock>>,
    catalog_tx: watch::Sender<Vec<ModelPackage>>,
    status_tx: watch::Sender<ModelCatalogRefreshStatus>,
}

impl FakeStore {
    pub(crate) fn with(models: Vec<ModelPackage>) -> Self {
        let (catalog_tx, _) = watch::channel(models.clone());
        let (status_tx, _) = watch::channel(ModelCatalogRefreshStatus::default());
        Self {
            models: Mutex::new(models),
            calls: Mutex::new(Vec::new()),
            in_session: Mutex::new(HashSet::new()),
            fail_writes: AtomicBool::new(false),
            status: Mutex::new(ModelCatalogRefreshStatus::default()),
            locks: Mutex::new(HashMap::new()),
            catalog_tx,
            status_tx,
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn model(&self, model_id: &str) -> ModelPackage {
        self.models
            .lock()
            .iter()
            .find(|model| model.model_id == model_id)
            .cloned()
            .expect("model seeded in fake store")
    }

    pub(crate) fn mark_in_session(&self, model_id: &str) {
        self.in_session.lock().insert(model_id.to_string());
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn allow_writes(&self) {
        self.fail_writes.store(false, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn write<F>(&self, model_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ModelPackage),
    {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        let mut models = self.models.lock();
        let model = models
            .iter_mut()
            .find(|model| model.model_id == model_id)
            .ok_or_else(|| anyhow!("model {model_id} is not in the catalog"))?;
        apply(model);
        self.catalog_tx.send_replace(models.clone());
        Ok(())
    }
}

impl CatalogStore for FakeStore {
    fn get_all(&self) -> Result<Vec<ModelPackage>> {
        Ok(self.models.lock().clone())
    }

    fn get_by_id(&self, model_id: &str) -> Result<Option<ModelPackage>> {
        Ok(self
            .models
            .lock()
            .iter()
            .find(|model| model.model_id == model_id)
            .cloned())
    }

    fn replace_catalog(&self, models: Vec<ModelPackage>) -> Result<()> {
        self.record(format!("replace_catalog({})", models.len()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        *self.models.lock() = models.clone();
        self.catalog_tx.send_replace(models);
        Ok(())
    }

    fn upsert_model(&self, model: ModelPackage) -> Result<()> {
        self.record(format!("upsert_model({})", model.model_id));
        let mut models = self.models.lock();
        models.retain(|existing| existing.model_id != model.model_id);
        models.push(model);
        Ok(())
    }

    fn update_install_state(&self, model_id: &str, state: InstallState) -> Result<()> {
        self.record(format!("update_install_state({model_id}, {state})"));
        self.write(model_id, |model| model.install_state = state)
    }

    fn update_download_task_id(&self, model_id: &str, task_id: Option<TaskId>) -> Result<()> {
        let shown = task_id.map_or_else(|| "none".to_string(), |_| "some".to_string());
        self.record(format!("update_download_task_id({model_id}, {shown})"));
        self.write(model_id, |model| model.download_task_id = task_id)
    }

    fn record_download(
        &self,
        model_id: &str,
        state: InstallState,
        task_id: TaskId,
    ) -> Result<()> {
        self.record(format!("record_download({model_id}, {state})"));
        self.write(model_id, |model| {
            model.install_state = state;
            model.download_task_id = Some(task_id);
        })
    }

    fn update_checksum(&self, model_id: &str, checksum: &str) -> Result<()> {
        self.record(format!("update_checksum({model_id}, {checksum})"));
        self.write(model_id, |model| {
            model.checksum_sha256 = Some(checksum.to_string());
        })
    }

    fn is_model_active_in_session(&self, model_id: &str) -> Result<bool> {
        Ok(self.in_session.lock().contains(model_id))
    }

    fn delete_model_files(&self, model_id: &str) -> Result<()> {
        self.record(format!("delete_model_files({model_id})"));
        Ok(())
    }

    fn record_refresh_success(&self, source: &str, model_count: usize) -> Result<()> {
        self.record(format!("record_refresh_success({source}, {model_count})"));
        let mut status = self.status.lock();
        status.last_success_source = Some(source.to_string());
        status.last_success_count = model_count;
        self.status_tx.send_replace(status.clone());
        Ok(())
    }

    fn record_offline_fallback(
        &self,
        reason: &str,
        cached_count: usize,
        message: Option<&str>,
    ) -> Result<()> {
        self.record(format!("record_offline_fallback({reason}, {cached_count})"));
        let mut status = self.status.lock();
        status.last_fallback_reason = Some(reason.to_string());
        status.last_fallback_cached_count = cached_count;
        status.last_fallback_message = message.map(ToOwned::to_owned);
        self.status_tx.send_replace(status.clone());
        Ok(())
    }

    fn refresh_status(&self) -> ModelCatalogRefreshStatus {
        self.status.lock().clone()
    }

    fn observe_catalog(&self) -> watch::Receiver<Vec<ModelPackage>> {
        self.catalog_tx.subscribe()
    }

    fn observe_refresh_status(&self) -> watch::Receiver<ModelCatalogRefreshStatus> {
        self.status_tx.subscribe()
    }

    fn model_lock(&self, model_id: &str) -> ModelLock {
        self.locks
            .lock()
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }
}

pub(crate) struct FakeCoordinator {
    max: usize,
    tasks: Mutex<HashMap<TaskId, DownloadTask>>,
    checksums: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    tasks_tx: watch::Sender<Vec<DownloadTask>>,
    progress_tx: watch::Sender<f32>,
}

impl FakeCoordinator {
    pub(crate) fn with_limit(max: usize) -> Self {
        let (tasks_tx, _) = watch::channel(Vec::new());
        let (progress_tx, _) = watch::channel(0.0);
        Self {
            max,
            tasks: Mutex::new(HashMap::new()),
            checksums: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            tasks_tx,
            progress_tx,
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Seeds a task for `model_id` in the given status.
    pub(crate) fn seed_task(&self, model_id: &str, status: DownloadStatus) -> TaskId {
        let mut task = DownloadTask::queued(model_id);
        task.status = status;
        if status == DownloadStatus::Failed {
            task.progress = 0.4;
            task.bytes_downloaded = 400;
            task.error_message = Some("connection reset".into());
        }
        let task_id = task.task_id;
        self.tasks.lock().insert(task_id, task);
        task_id
    }

    pub(crate) fn set_checksum(&self, model_id: &str, checksum: &str) {
        self.checksums
            .lock()
            .insert(model_id.to_string(), checksum.to_string());
    }

    pub(crate) fn task(&self, task_id: TaskId) -> DownloadTask {
        self.tasks
            .lock()
            .get(&task_id)
            .cloned()
            .expect("task seeded in fake coordinator")
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn with_task<T, F>(&self, task_id: TaskId, apply: F) -> Result<T, DownloadError>
    where
        F: FnOnce(&mut DownloadTask) -> Result<T, DownloadError>,
    {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(DownloadError::UnknownTask(task_id))?;
        apply(task)
    }
}

impl DownloadCoordinator for FakeCoordinator {
    fn get_active_downloads(&self) -> Vec<DownloadTask> {
        self.tasks
            .lock()
            .values()
            .filter(|task| task.status.is_active())
            .cloned()
            .collect()
    }

    fn get_queued_downloads(&self) -> Vec<DownloadTask> {
        self.tasks
            .lock()
            .values()
            .filter(|task| task.status == DownloadStatus::Queued)
            .cloned()
            .collect()
    }

    fn get_task(&self, task_id: TaskId) -> Option<DownloadTask> {
        self.tasks.lock().get(&task_id).cloned()
    }

    fn get_model_id_for_task(&self, task_id: TaskId) -> Result<String, DownloadError> {
        self.get_task(task_id)
            .map(|task| task.model_id)
            .ok_or(DownloadError::UnknownTask(task_id))
    }

    fn get_max_concurrent_downloads(&self) -> usize {
        self.max
    }

    fn start_download(&self, model_id: &str) -> Result<TaskId, DownloadError> {
        self.record(format!("start_download({model_id})"));
        let mut tasks = self.tasks.lock();
        let reusable = tasks
            .values()
            .find(|task| task.model_id == model_id && task.status == DownloadStatus::Queued)
            .map(|task| task.task_id);
        let task_id = match reusable {
            Some(task_id) => task_id,
            None => {
                let task = DownloadTask::queued(model_id);
                let task_id = task.task_id;
                tasks.insert(task_id, task);
                task_id
            }
        };
        if let Some(task) = tasks.get_mut(&task_id) {
            task.transition(DownloadStatus::Downloading)?;
        }
        Ok(task_id)
    }

    fn queue_download(&self, model_id: &str) -> Result<TaskId, DownloadError> {
        self.record(format!("queue_download({model_id})"));
        let task = DownloadTask::queued(model_id);
        let task_id = task.task_id;
        self.tasks.lock().insert(task_id, task);
        Ok(task_id)
    }

    fn pause_download(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.record("pause_download".into());
        self.with_task(task_id, |task| task.transition(DownloadStatus::Paused))
    }

    fn resume_download(&self, task_id: TaskId) -> Result<DownloadStatus, DownloadError> {
        self.record("resume_download".into());
        self.with_task(task_id, |task| {
            task.transition(DownloadStatus::Downloading)?;
            Ok(task.status)
        })
    }

    fn cancel_download(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.record("cancel_download".into());
        self.with_task(task_id, |task| task.transition(DownloadStatus::Cancelled))
    }

    fn update_task_status(
        &self,
        task_id: TaskId,
        status: DownloadStatus,
    ) -> Result<(), DownloadError> {
        self.record(format!("update_task_status({status})"));
        self.with_task(task_id, |task| task.transition(status))
    }

    fn reset_task(&self, task_id: TaskId) -> Result<(), DownloadError> {
        self.record("reset_task".into());
        self.with_task(task_id, |task| task.reset())
    }

    fn delete_partial_files(&self, model_id: &str) -> Result<(), DownloadError> {
        self.record(format!("delete_partial_files({model_id})"));
        Ok(())
    }

    fn get_downloaded_checksum(&self, model_id: &str) -> Result<Option<String>, DownloadError> {
        Ok(self.checksums.lock().get(model_id).cloned())
    }

    fn observe_progress(&self, task_id: TaskId) -> Result<watch::Receiver<f32>, DownloadError> {
        self.get_task(task_id)
            .map(|_| self.progress_tx.subscribe())
            .ok_or(DownloadError::UnknownTask(task_id))
    }

    fn observe_tasks(&self) -> watch::Receiver<Vec<DownloadTask>> {
        self.tasks_tx.subscribe()
    }

    fn subscribe(&self) -> Receiver<TransferEvent> {
        let (_, receiver) = unbounded();
        receiver
    }
}
