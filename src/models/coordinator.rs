use std::{
    collections::{HashMap, VecDeque},
    fs, io,
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::settings::EngineSettings;
use crate::error::DownloadError;

use super::download::{TransferControl, TransferError, Transport};
use super::layout::{is_valid_model_id, ArtifactLayout};
use super::manifest::DownloadResolver;
use super::metadata::compute_sha256;
use super::storage::ensure_free_space;
use super::task::{DownloadStatus, DownloadTask, TaskId};

/// Smallest progress change pushed to observers.
const PROGRESS_STEP: f32 = 0.01;

/// Lifecycle notifications published by the coordinator. Completion is only ever
/// reported here; finished tasks are removed from the task table.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started { task_id: TaskId, model_id: String },
    Promoted { task_id: TaskId, model_id: String },
    Paused { task_id: TaskId, model_id: String },
    Completed { task_id: TaskId, model_id: String },
    Failed {
        task_id: TaskId,
        model_id: String,
        error: String,
    },
    Cancelled { task_id: TaskId, model_id: String },
}

impl TransferEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TransferEvent::Started { task_id, .. }
            | TransferEvent::Promoted { task_id, .. }
            | TransferEvent::Paused { task_id, .. }
            | TransferEvent::Completed { task_id, .. }
            | TransferEvent::Failed { task_id, .. }
            | TransferEvent::Cancelled { task_id, .. } => *task_id,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            TransferEvent::Started { model_id, .. }
            | TransferEvent::Promoted { model_id, .. }
            | TransferEvent::Paused { model_id, .. }
            | TransferEvent::Completed { model_id, .. }
            | TransferEvent::Failed { model_id, .. }
            | TransferEvent::Cancelled { model_id, .. } => model_id,
        }
    }
}

/// Owns every download task and drives the transport underneath them.
pub trait DownloadCoordinator: Send + Sync {
    /// Tasks that are queued or transferring.
    fn get_active_downloads(&self) -> Vec<DownloadTask>;
    fn get_queued_downloads(&self) -> Vec<DownloadTask>;
    fn get_task(&self, task_id: TaskId) -> Option<DownloadTask>;
    fn get_model_id_for_task(&self, task_id: TaskId) -> Result<String, DownloadError>;
    fn get_max_concurrent_downloads(&self) -> usize;
    /// Starts transferring right away. The caller is responsible for headroom.
    fn start_download(&self, model_id: &str) -> Result<TaskId, DownloadError>;
    /// Creates a queued task that is promoted once a slot frees up.
    fn queue_download(&self, model_id: &str) -> Result<TaskId, DownloadError>;
    fn pause_download(&self, task_id: TaskId) -> Result<(), DownloadError>;
    /// Returns where the task ended up: `Downloading`, or `Queued` when no slot is free.
    fn resume_download(&self, task_id: TaskId) -> Result<DownloadStatus, DownloadError>;
    /// Stops the transfer. Partial files are left for [`Self::delete_partial_files`].
    fn cancel_download(&self, task_id: TaskId) -> Result<(), DownloadError>;
    fn update_task_status(&self, task_id: TaskId, status: DownloadStatus)
        -> Result<(), DownloadError>;
    /// Moves a failed task back to `Queued` with zero progress and no bytes on disk.
    fn reset_task(&self, task_id: TaskId) -> Result<(), DownloadError>;
    fn delete_partial_files(&self, model_id: &str) -> Result<(), DownloadError>;
    fn get_downloaded_checksum(&self, model_id: &str) -> Result<Option<String>, DownloadError>;
    fn observe_progress(&self, task_id: TaskId) -> Result<watch::Receiver<f32>, DownloadError>;
    fn observe_tasks(&self) -> watch::Receiver<Vec<DownloadTask>>;
    fn subscribe(&self) -> Receiver<TransferEvent>;
}

struct ManagedTask {
    task: DownloadTask,
    progress: watch::Sender<f32>,
    control: Option<Arc<TransferControl>>,
    expected_size: Option<u64>,
    /// The transport finished while the task was paused or re-queued.
    staged_complete: bool,
}

impl ManagedTask {
    fn new(task: DownloadTask) -> Self {
        let (progress, _) = watch::channel(task.progress);
        Self {
            task,
            progress,
            control: None,
            expected_size: None,
            staged_complete: false,
        }
    }

    fn stop_worker(&self) {
        if let Some(control) = &self.control {
            control.request_stop();
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    tasks: HashMap<TaskId, ManagedTask>,
    queue: VecDeque<TaskId>,
}

impl CoordinatorState {
    fn downloading_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|managed| managed.task.status == DownloadStatus::Downloading)
            .count()
    }

    fn live_task_for(&self, model_id: &str) -> Option<&ManagedTask> {
        self.tasks
            .values()
            .find(|managed| managed.task.model_id == model_id && managed.task.status.is_live())
    }

    fn managed_mut(&mut self, task_id: TaskId) -> Result<&mut ManagedTask, DownloadError> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(DownloadError::UnknownTask(task_id))
    }

    /// Drops finished attempts for a model whose workers have exited.
    fn prune_finished(&mut self, model_id: &str) {
        self.tasks.retain(|_, managed| {
            managed.task.model_id != model_id
                || managed.task.status.is_live()
                || managed.control.is_some()
        });
    }

    fn snapshot<F>(&self, filter: F) -> Vec<DownloadTask>
    where
        F: Fn(&DownloadTask) -> bool,
    {
        let mut tasks: Vec<DownloadTask> = self
            .tasks
            .values()
            .map(|managed| &managed.task)
            .filter(|task| filter(task))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.started_at);
        tasks
    }
}

struct CoordinatorInner {
    layout: ArtifactLayout,
    max_concurrent: usize,
    min_free_space: u64,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn DownloadResolver>,
    state: Mutex<CoordinatorState>,
    tasks_tx: watch::Sender<Vec<DownloadTask>>,
    subscribers: Mutex<Vec<Sender<TransferEvent>>>,
}

/// Thread-per-transfer coordinator with a global ceiling and a FIFO queue.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransferCoordinator {
    pub fn new(
        layout: ArtifactLayout,
        settings: &EngineSettings,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn DownloadResolver>,
    ) -> Self {
        let (tasks_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(CoordinatorInner {
                layout,
                max_concurrent: settings.max_concurrent_downloads(),
                min_free_space: settings.min_free_space_bytes,
                transport,
                resolver,
                state: Mutex::new(CoordinatorState::default()),
                tasks_tx,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Asks every running transfer to stop. Task records stay as they are.
    pub fn shutdown(&self) {
        let state = self.inner.state.lock();
        for managed in state.tasks.values() {
            managed.stop_worker();
        }
        info!(tasks = state.tasks.len(), "Download coordinator stopping");
    }

    fn new_task(
        &self,
        state: &mut CoordinatorState,
        model_id: &str,
    ) -> Result<TaskId, DownloadError> {
        state.prune_finished(model_id);
        self.inner
            .layout
            .remove_partial(model_id)
            .context("clear stale partial download")?;
        let task = DownloadTask::queued(model_id);
        let task_id = task.task_id;
        state.tasks.insert(task_id, ManagedTask::new(task));
        Ok(task_id)
    }
}

fn validate_model_id(model_id: &str) -> Result<(), DownloadError> {
    if is_valid_model_id(model_id) {
        Ok(())
    } else {
        Err(DownloadError::InvalidModelId(model_id.to_string()))
    }
}

impl CoordinatorInner {
    fn emit(&self, events: Vec<TransferEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        for event in events {
            debug!(task_id = %event.task_id(), model_id = event.model_id(), ?event, "Transfer event");
            subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
        }
    }

    fn publish_tasks(&self, state: &CoordinatorState) {
        self.tasks_tx.send_replace(state.snapshot(|_| true));
    }

    fn launch(self: &Arc<Self>, state: &mut CoordinatorState, task_id: TaskId) {
        let Some(managed) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let control = Arc::new(TransferControl::new());
        managed.control = Some(Arc::clone(&control));
        let model_id = managed.task.model_id.clone();
        let inner = Arc::clone(self);
        thread::spawn(move || {
            let outcome = inner.transfer(task_id, &model_id, &control);
            inner.finish(task_id, &control, outcome);
        });
    }

    /// Runs a task that was just moved to `Downloading`. A worker that is still
    /// winding down picks the task back up itself when it exits.
    fn start_or_complete(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        task_id: TaskId,
        events: &mut Vec<TransferEvent>,
    ) {
        let Some(managed) = state.tasks.get(&task_id) else {
            return;
        };
        if managed.control.is_some() {
            return;
        }
        if managed.staged_complete {
            self.complete(state, task_id, events);
        } else {
            self.launch(state, task_id);
        }
    }

    fn promote_next(self: &Arc<Self>, state: &mut CoordinatorState, events: &mut Vec<TransferEvent>) {
        while state.downloading_count() < self.max_concurrent {
            let Some(task_id) = state.queue.pop_front() else {
                break;
            };
            let Some(managed) = state.tasks.get_mut(&task_id) else {
                continue;
            };
            if managed.task.status != DownloadStatus::Queued
                || managed.task.transition(DownloadStatus::Downloading).is_err()
            {
                continue;
            }
            info!(%task_id, model_id = %managed.task.model_id, "Promoted queued download");
            events.push(TransferEvent::Promoted {
                task_id,
                model_id: managed.task.model_id.clone(),
            });
            self.start_or_complete(state, task_id, events);
        }
    }

    fn transfer(
        &self,
        task_id: TaskId,
        model_id: &str,
        control: &TransferControl,
    ) -> Result<u64, TransferError> {
        let request = self.resolver.resolve(model_id)?;
        if control.is_stopped() {
            return Err(TransferError::Interrupted);
        }
        self.layout.ensure_directory()?;
        let staging = self.layout.staging_path(model_id);
        let resume_from = match fs::metadata(&staging) {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let required = request
            .expected_size_bytes
            .unwrap_or(0)
            .saturating_sub(resume_from);
        ensure_free_space(self.layout.root(), required, self.min_free_space)?;

        if let Some(managed) = self.state.lock().tasks.get_mut(&task_id) {
            managed.expected_size = request.expected_size_bytes;
        }
        debug!(%task_id, model_id, url = %request.url, resume_from, "Transfer running");
        self.transport
            .fetch(&request, &staging, resume_from, control, &mut |bytes| {
                self.record_progress(task_id, bytes);
            })
    }

    fn record_progress(&self, task_id: TaskId, bytes: u64) {
        let mut state = self.state.lock();
        let Some(managed) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let fraction = managed.task.record_progress(bytes, managed.expected_size);
        managed.progress.send_if_modified(|current| {
            let reached_end = fraction >= 1.0 && *current < 1.0;
            if fraction - *current >= PROGRESS_STEP || reached_end {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    fn finish(
        self: &Arc<Self>,
        task_id: TaskId,
        control: &Arc<TransferControl>,
        outcome: Result<u64, TransferError>,
    ) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(managed) = state.tasks.get_mut(&task_id) else {
                return;
            };
            let owns_task = managed
                .control
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, control));
            if !owns_task {
                return;
            }
            managed.control = None;
            let model_id = managed.task.model_id.clone();

            match (managed.task.status, outcome) {
                (DownloadStatus::Cancelled, _) => {
                    let superseded = state.live_task_for(&model_id).is_some();
                    if !superseded {
                        if let Err(error) = remove_staging(&self.layout, &model_id) {
                            warn!("Failed to clear cancelled download for {model_id}: {error:?}");
                        }
                    }
                }
                (DownloadStatus::Downloading, Ok(bytes)) => {
                    debug!(%task_id, model_id = %model_id, bytes, "Transfer finished");
                    self.complete(&mut state, task_id, &mut events);
                }
                (DownloadStatus::Downloading, Err(TransferError::Interrupted)) => {
                    debug!(%task_id, model_id = %model_id, "Resumed before the worker stopped; relaunching");
                    self.launch(&mut state, task_id);
                }
                (DownloadStatus::Downloading, Err(TransferError::Failed(error))) => {
                    let message = format!("{error:#}");
                    warn!("Download {task_id} for {model_id} failed: {error:?}");
                    if let Err(error) = managed.task.fail(message.clone()) {
                        warn!("Could not mark download {task_id} failed: {error:?}");
                    }
                    managed.progress.send_replace(managed.task.progress);
                    events.push(TransferEvent::Failed {
                        task_id,
                        model_id,
                        error: message,
                    });
                }
                (DownloadStatus::Paused | DownloadStatus::Queued, Ok(_)) => {
                    managed.staged_complete = true;
                }
                (status, _) => {
                    debug!(%task_id, model_id = %model_id, %status, "Worker stopped");
                }
            }
            self.promote_next(&mut state, &mut events);
            self.publish_tasks(&state);
        }
        self.emit(events);
    }

    /// Moves the staged file into place and retires the task.
    fn complete(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        task_id: TaskId,
        events: &mut Vec<TransferEvent>,
    ) {
        let Some(managed) = state.tasks.get_mut(&task_id) else {
            return;
        };
        let model_id = managed.task.model_id.clone();
        match promote_artifact(&self.layout, &model_id) {
            Ok(()) => {
                managed.progress.send_replace(1.0);
                state.tasks.remove(&task_id);
                info!(%task_id, model_id = %model_id, "Download completed");
                events.push(TransferEvent::Completed { task_id, model_id });
            }
            Err(error) => {
                let message = format!("{error:#}");
                warn!("Could not finalize download {task_id} for {model_id}: {error:?}");
                if let Err(error) = managed.task.fail(message.clone()) {
                    warn!("Could not mark download {task_id} failed: {error:?}");
                }
                events.push(TransferEvent::Failed {
                    task_id,
                    model_id,
                    error: message,
                });
            }
        }
    }
}

fn remove_staging(layout: &ArtifactLayout, model_id: &str) -> Result<()> {
    let staging = layout.staging_path(model_id);
    match fs::remove_file(&staging) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", staging.display())),
    }
}

fn promote_artifact(layout: &ArtifactLayout, model_id: &str) -> Result<()> {
    let staging = layout.staging_path(model_id);
    let artifact = layout.artifact_path(model_id);
    if artifact.exists() {
        fs::remove_file(&artifact)
            .with_context(|| format!("replace previous artifact {}", artifact.display()))?;
    }
    fs::rename(&staging, &artifact)
        .with_context(|| format!("move {} into place", staging.display()))
}

impl DownloadCoordinator for TransferCoordinator {
    fn get_active_downloads(&self) -> Vec<DownloadTask> {
        self.inner
            .state
            .lock()
            .snapshot(|task| task.status.is_active())
    }

    fn get_queued_downloads(&self) -> Vec<DownloadTask> {
        self.inner
            .state
            .lock()
            .snapshot(|task| task.status == DownloadStatus::Queued)
    }

    fn get_task(&self, task_id: TaskId) -> Option<DownloadTask> {
        self.inner
            .state
            .lock()
            .tasks
            .get(&task_id)
            .map(|managed| managed.task.clone())
    }

    fn get_model_id_for_task(&self, task_id: TaskId) -> Result<String, DownloadError> {
        self.get_task(task_id)
            .map(|task| task.model_id)
            .ok_or(DownloadError::UnknownTask(task_id))
    }

    fn get_max_concurrent_downloads(&self) -> usize {
        self.inner.max_concurrent
    }

    fn start_download(&self, model_id: &str) -> Result<TaskId, DownloadError> {
        validate_model_id(model_id)?;
        let mut events = Vec::new();
        let task_id = {
            let mut state = self.inner.state.lock();
            let existing = state
                .live_task_for(model_id)
                .map(|managed| (managed.task.task_id, managed.task.status));
            let task_id = match existing {
                Some((task_id, DownloadStatus::Queued)) => {
                    state.queue.retain(|queued| *queued != task_id);
                    task_id
                }
                Some((task_id, _)) => {
                    return Err(DownloadError::AlreadyActive {
                        model_id: model_id.to_string(),
                        task_id,
                    });
                }
                None => self.new_task(&mut state, model_id)?,
            };
            state
                .managed_mut(task_id)?
                .task
                .transition(DownloadStatus::Downloading)?;
            info!(%task_id, model_id, "Download started");
            events.push(TransferEvent::Started {
                task_id,
                model_id: model_id.to_string(),
            });
            self.inner
                .start_or_complete(&mut state, task_id, &mut events);
            self.inner.publish_tasks(&state);
            task_id
        };
        self.inner.emit(events);
        Ok(task_id)
    }

    fn queue_download(&self, model_id: &str) -> Result<TaskId, DownloadError> {
        validate_model_id(model_id)?;
        let mut events = Vec::new();
        let task_id = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.live_task_for(model_id) {
                let task_id = existing.task.task_id;
                return Err(DownloadError::AlreadyActive {
                    model_id: model_id.to_string(),
                    task_id,
                });
            }
            let task_id = self.new_task(&mut state, model_id)?;
            state.queue.push_back(task_id);
            info!(%task_id, model_id, position = state.queue.len(), "Download queued");
            self.inner.promote_next(&mut state, &mut events);
            self.inner.publish_tasks(&state);
            task_id
        };
        self.inner.emit(events);
        Ok(task_id)
    }

    fn pause_download(&self, task_id: TaskId) -> Result<(), DownloadError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let managed = state.managed_mut(task_id)?;
            if managed.task.status == DownloadStatus::Paused {
                return Ok(());
            }
            managed.task.transition(DownloadStatus::Paused)?;
            managed.stop_worker();
            let model_id = managed.task.model_id.clone();
            state.queue.retain(|queued| *queued != task_id);
            info!(%task_id, model_id = %model_id, "Download paused");
            events.push(TransferEvent::Paused { task_id, model_id });
            self.inner.promote_next(&mut state, &mut events);
            self.inner.publish_tasks(&state);
        }
        self.inner.emit(events);
        Ok(())
    }

    fn resume_download(&self, task_id: TaskId) -> Result<DownloadStatus, DownloadError> {
        let mut events = Vec::new();
        let status = {
            let mut state = self.inner.state.lock();
            let has_slot = state.downloading_count() < self.inner.max_concurrent;
            let managed = state.managed_mut(task_id)?;
            if managed.task.status != DownloadStatus::Paused {
                return Err(DownloadError::IllegalTransition {
                    task_id,
                    from: managed.task.status,
                    to: DownloadStatus::Downloading,
                });
            }
            let model_id = managed.task.model_id.clone();
            let status = if has_slot {
                managed.task.transition(DownloadStatus::Downloading)?;
                info!(%task_id, model_id = %model_id, "Download resumed");
                self.inner
                    .start_or_complete(&mut state, task_id, &mut events);
                DownloadStatus::Downloading
            } else {
                managed.task.transition(DownloadStatus::Queued)?;
                state.queue.push_back(task_id);
                info!(%task_id, model_id = %model_id, "No free download slot; resumed download queued");
                DownloadStatus::Queued
            };
            self.inner.publish_tasks(&state);
            status
        };
        self.inner.emit(events);
        Ok(status)
    }

    fn cancel_download(&self, task_id: TaskId) -> Result<(), DownloadError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let managed = state.managed_mut(task_id)?;
            if managed.task.status == DownloadStatus::Cancelled {
                return Ok(());
            }
            managed.task.transition(DownloadStatus::Cancelled)?;
            managed.stop_worker();
            let model_id = managed.task.model_id.clone();
            state.queue.retain(|queued| *queued != task_id);
            info!(%task_id, model_id = %model_id, "Download cancelled");
            events.push(TransferEvent::Cancelled { task_id, model_id });
            self.inner.promote_next(&mut state, &mut events);
            self.inner.publish_tasks(&state);
        }
        self.inner.emit(events);
        Ok(())
    }

    fn update_task_status(
        &self,
        task_id: TaskId,
        status: DownloadStatus,
    ) -> Result<(), DownloadError> {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let has_slot = state.downloading_count() < self.inner.max_concurrent;
            let managed = state.managed_mut(task_id)?;
            let current = managed.task.status;
            if current == status {
                return Ok(());
            }
            if status == DownloadStatus::Downloading && !has_slot {
                return Err(DownloadError::NoFreeSlot {
                    task_id,
                    status: current,
                });
            }
            managed.task.transition(status)?;
            if status != DownloadStatus::Downloading {
                managed.stop_worker();
            }
            let model_id = managed.task.model_id.clone();
            state.queue.retain(|queued| *queued != task_id);
            match status {
                DownloadStatus::Downloading => {
                    self.inner
                        .start_or_complete(&mut state, task_id, &mut events);
                }
                DownloadStatus::Queued => state.queue.push_back(task_id),
                DownloadStatus::Paused => {
                    events.push(TransferEvent::Paused { task_id, model_id });
                }
                DownloadStatus::Cancelled => {
                    events.push(TransferEvent::Cancelled { task_id, model_id });
                }
                DownloadStatus::Failed => {}
            }
            debug!(%task_id, from = %current, to = %status, "Task status updated");
            self.inner.promote_next(&mut state, &mut events);
            self.inner.publish_tasks(&state);
        }
        self.inner.emit(events);
        Ok(())
    }

    fn reset_task(&self, task_id: TaskId) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock();
        let managed = state.managed_mut(task_id)?;
        managed.task.reset()?;
        managed.expected_size = None;
        managed.staged_complete = false;
        managed.progress.send_replace(0.0);
        let model_id = managed.task.model_id.clone();
        self.inner
            .layout
            .remove_partial(&model_id)
            .context("clear failed download")?;
        debug!(%task_id, model_id = %model_id, "Task reset for retry");
        self.inner.publish_tasks(&state);
        Ok(())
    }

    fn delete_partial_files(&self, model_id: &str) -> Result<(), DownloadError> {
        validate_model_id(model_id)?;
        self.inner.layout.remove_partial(model_id)?;
        debug!(model_id, "Removed partial download files");
        Ok(())
    }

    fn get_downloaded_checksum(&self, model_id: &str) -> Result<Option<String>, DownloadError> {
        validate_model_id(model_id)?;
        let artifact = self.inner.layout.artifact_path(model_id);
        if !artifact.is_file() {
            return Ok(None);
        }
        Ok(Some(compute_sha256(&artifact)?))
    }

    fn observe_progress(&self, task_id: TaskId) -> Result<watch::Receiver<f32>, DownloadError> {
        self.inner
            .state
            .lock()
            .tasks
            .get(&task_id)
            .map(|managed| managed.progress.subscribe())
            .ok_or(DownloadError::UnknownTask(task_id))
    }

    fn observe_tasks(&self) -> watch::Receiver<Vec<DownloadTask>> {
        self.inner.tasks_tx.subscribe()
    }

    fn subscribe(&self) -> Receiver<TransferEvent> {
        let (sender, receiver) = unbounded();
        self.inner.subscribers.lock().push(sender);
        receiver
    }
}


#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::fakes::{ScriptedTransport, StaticResolver};
    use super::*;

    const PAYLOAD: &[u8] = b"model weights for tests";

    fn coordinator(
        dir: &std::path::Path,
        max: usize,
        transport: ScriptedTransport,
    ) -> TransferCoordinator {
        let settings = EngineSettings {
            max_concurrent_downloads: max,
            min_free_space_bytes: 0,
            ..EngineSettings::default()
        };
        TransferCoordinator::new(
            ArtifactLayout::new(dir),
            &settings,
            Arc::new(transport),
            Arc::new(StaticResolver),
        )
    }

    fn wait_for<F>(events: &Receiver<TransferEvent>, matches: F) -> TransferEvent
    where
        F: Fn(&TransferEvent) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = events
                .recv_timeout(remaining)
                .expect("transfer event before deadline");
            if matches(&event) {
                return event;
            }
        }
    }

    fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn completed_transfer_lands_as_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 2, ScriptedTransport::instant(PAYLOAD));
        let events = coordinator.subscribe();

        let task_id = coordinator.start_download("m1").unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id: id, .. } if *id == task_id)
        });

        let layout = ArtifactLayout::new(dir.path());
        assert_eq!(fs::read(layout.artifact_path("m1")).unwrap(), PAYLOAD);
        assert!(!layout.staging_path("m1").exists());
        assert!(coordinator.get_task(task_id).is_none());
        let expected = compute_sha256(&layout.artifact_path("m1")).unwrap();
        assert_eq!(
            coordinator.get_downloaded_checksum("m1").unwrap(),
            Some(expected)
        );
    }

    #[test]
    fn checksum_is_absent_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 2, ScriptedTransport::instant(PAYLOAD));
        assert_eq!(coordinator.get_downloaded_checksum("m1").unwrap(), None);
    }

    #[test]
    fn queued_tasks_are_promoted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 1, transport);
        let events = coordinator.subscribe();

        let first = coordinator.start_download("m1").unwrap();
        let second = coordinator.queue_download("m2").unwrap();
        let third = coordinator.queue_download("m3").unwrap();
        assert_eq!(
            coordinator.get_task(second).unwrap().status,
            DownloadStatus::Queued
        );
        let queued: Vec<TaskId> = coordinator
            .get_queued_downloads()
            .into_iter()
            .map(|task| task.task_id)
            .collect();
        assert_eq!(queued, vec![second, third]);

        release.send(()).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id, .. } if *task_id == first)
        });
        let promoted = wait_for(&events, |event| {
            matches!(event, TransferEvent::Promoted { .. })
        });
        assert_eq!(promoted.task_id(), second);
        assert_eq!(
            coordinator.get_task(third).unwrap().status,
            DownloadStatus::Queued
        );
        release.send(()).unwrap();
        release.send(()).unwrap();
    }

    #[test]
    fn pausing_frees_a_slot_and_full_resume_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 1, transport);
        let events = coordinator.subscribe();

        let first = coordinator.start_download("m1").unwrap();
        let second = coordinator.queue_download("m2").unwrap();
        coordinator.pause_download(first).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Promoted { task_id, .. } if *task_id == second)
        });

        assert_eq!(
            coordinator.resume_download(first).unwrap(),
            DownloadStatus::Queued
        );
        release.send(()).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id, .. } if *task_id == second)
        });
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Promoted { task_id, .. } if *task_id == first)
        });
        release.send(()).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id, .. } if *task_id == first)
        });
        let layout = ArtifactLayout::new(dir.path());
        assert_eq!(fs::read(layout.artifact_path("m1")).unwrap(), PAYLOAD);
    }

    #[test]
    fn resume_requires_a_paused_task() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 2, transport);
        let task_id = coordinator.start_download("m1").unwrap();

        let err = coordinator.resume_download(task_id).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::IllegalTransition {
                from: DownloadStatus::Downloading,
                ..
            }
        ));
        release.send(()).unwrap();
    }

    #[test]
    fn cancelled_worker_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 2, transport);
        let layout = ArtifactLayout::new(dir.path());

        let task_id = coordinator.start_download("m1").unwrap();
        wait_until(|| layout.staging_path("m1").exists());
        coordinator.cancel_download(task_id).unwrap();
        coordinator.cancel_download(task_id).unwrap();

        wait_until(|| !layout.staging_path("m1").exists());
        assert_eq!(
            coordinator.get_task(task_id).unwrap().status,
            DownloadStatus::Cancelled
        );
        assert!(coordinator.get_active_downloads().is_empty());
    }

    #[test]
    fn failed_tasks_reset_and_restart_under_the_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let transport = ScriptedTransport {
            fail_with: Some("connection reset".into()),
            ..ScriptedTransport::instant(PAYLOAD)
        };
        let coordinator = coordinator(dir.path(), 2, transport);
        let events = coordinator.subscribe();

        let task_id = coordinator.start_download("m1").unwrap();
        let failed = wait_for(&events, |event| matches!(event, TransferEvent::Failed { .. }));
        assert!(matches!(failed, TransferEvent::Failed { ref error, .. } if error.contains("connection reset")));
        let task = coordinator.get_task(task_id).unwrap();
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("connection reset"));

        coordinator.reset_task(task_id).unwrap();
        let task = coordinator.get_task(task_id).unwrap();
        assert_eq!(task.status, DownloadStatus::Queued);
        assert_eq!(task.progress, 0.0);
        assert_eq!(*coordinator.observe_progress(task_id).unwrap().borrow(), 0.0);

        assert_eq!(coordinator.start_download("m1").unwrap(), task_id);
    }

    #[test]
    fn second_live_task_for_a_model_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 2, transport);
        let task_id = coordinator.start_download("m1").unwrap();

        let err = coordinator.start_download("m1").unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyActive { task_id: id, .. } if id == task_id));
        assert!(coordinator.queue_download("m1").is_err());
        release.send(()).unwrap();
    }

    #[test]
    fn unknown_tasks_and_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(dir.path(), 2, ScriptedTransport::instant(PAYLOAD));
        let ghost = uuid::Uuid::new_v4();
        assert!(matches!(
            coordinator.pause_download(ghost),
            Err(DownloadError::UnknownTask(id)) if id == ghost
        ));
        assert!(coordinator.get_model_id_for_task(ghost).is_err());
        assert!(matches!(
            coordinator.start_download("../etc"),
            Err(DownloadError::InvalidModelId(_))
        ));
    }

    #[test]
    fn explicit_status_changes_drive_workers_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 1, transport);
        let events = coordinator.subscribe();

        let first = coordinator.start_download("m1").unwrap();
        coordinator.pause_download(first).unwrap();
        coordinator
            .update_task_status(first, DownloadStatus::Downloading)
            .unwrap();
        let second = coordinator.queue_download("m2").unwrap();

        release.send(()).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id, .. } if *task_id == first)
        });
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Promoted { task_id, .. } if *task_id == second)
        });

        coordinator
            .update_task_status(second, DownloadStatus::Paused)
            .unwrap();
        coordinator
            .update_task_status(second, DownloadStatus::Queued)
            .unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Promoted { task_id, .. } if *task_id == second)
        });
        release.send(()).unwrap();
        wait_for(&events, |event| {
            matches!(event, TransferEvent::Completed { task_id, .. } if *task_id == second)
        });
    }

    #[test]
    fn explicit_start_without_a_slot_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 1, transport);

        let first = coordinator.start_download("m1").unwrap();
        let second = coordinator.queue_download("m2").unwrap();
        coordinator
            .update_task_status(second, DownloadStatus::Paused)
            .unwrap();

        let err = coordinator
            .update_task_status(second, DownloadStatus::Downloading)
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::NoFreeSlot {
                status: DownloadStatus::Paused,
                ..
            }
        ));
        assert_eq!(
            coordinator.get_task(second).unwrap().status,
            DownloadStatus::Paused
        );
        assert_eq!(
            coordinator.get_task(first).unwrap().status,
            DownloadStatus::Downloading
        );
        release.send(()).unwrap();
    }

    #[test]
    fn task_list_is_observable() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, release) = ScriptedTransport::gated(PAYLOAD);
        let coordinator = coordinator(dir.path(), 1, transport);
        let tasks = coordinator.observe_tasks();

        coordinator.start_download("m1").unwrap();
        coordinator.queue_download("m2").unwrap();
        let statuses: Vec<DownloadStatus> = tasks.borrow().iter().map(|t| t.status).collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&DownloadStatus::Downloading));
        assert!(statuses.contains(&DownloadStatus::Queued));
        release.send(()).unwrap();
        release.send(()).unwrap();
    }
}
