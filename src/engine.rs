use std::{
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::settings::{EngineSettings, SettingsManager};
use crate::error::EngineError;
use crate::models::{
    ArtifactLayout, CatalogSource, CatalogStore, DownloadCoordinator, DownloadResolver,
    DownloadStatus, DownloadTask, FileCatalogStore, HttpCatalogSource, HttpTransport, InstallEvent,
    InstallState, ManifestResolver, ModelCatalogRefreshStatus, ModelPackage, NoActiveSessions,
    RefreshCatalog, RefreshOutcome, SessionMonitor, TaskId, TransferCoordinator, TransferEvent,
    Transport,
};
use crate::usecases::{
    DownloadModel, ExportReport, ExportService, ModelLifecycle, VerifyDownload,
};

/// Collaborators for a [`ModelEngine`]. Anything left unset falls back to the HTTP
/// implementations configured from [`EngineSettings`].
pub struct ModelEngineBuilder {
    settings: EngineSettings,
    export: Arc<dyn ExportService>,
    sessions: Arc<dyn SessionMonitor>,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn DownloadResolver>>,
    catalog_source: Option<Arc<dyn CatalogSource>>,
}

impl ModelEngineBuilder {
    #[must_use]
    pub fn sessions(mut self, sessions: Arc<dyn SessionMonitor>) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DownloadResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn catalog_source(mut self, source: Arc<dyn CatalogSource>) -> Self {
        self.catalog_source = Some(source);
        self
    }

    /// Opens the catalog, repairs downloads a previous process left behind and starts
    /// listening for transfer events.
    pub fn start(self) -> Result<ModelEngine> {
        let models_dir = self.settings.resolve_models_dir()?;
        let layout = ArtifactLayout::new(models_dir.clone());
        let store: Arc<dyn CatalogStore> = Arc::new(
            FileCatalogStore::open(layout.clone(), self.sessions)
                .with_context(|| format!("open model catalog in {}", models_dir.display()))?,
        );

        let client = self.settings.http_client()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(client.clone())),
        };
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(ManifestResolver::new(store.clone(), client.clone())),
        };
        let catalog_source = match self.catalog_source {
            Some(source) => source,
            None => Arc::new(HttpCatalogSource::new(
                self.settings.catalog_url.clone(),
                client,
            )),
        };

        let transfers = Arc::new(TransferCoordinator::new(
            layout,
            &self.settings,
            transport,
            resolver,
        ));
        let coordinator: Arc<dyn DownloadCoordinator> = transfers.clone();

        reconcile_interrupted(store.as_ref(), coordinator.as_ref())
            .context("reconcile interrupted downloads")?;

        let verify = Arc::new(VerifyDownload::new(store.clone(), coordinator.clone()));
        let (stop_tx, stop_rx) = bounded(1);
        let listener = spawn_listener(
            coordinator.subscribe(),
            stop_rx,
            store.clone(),
            verify.clone(),
        );

        info!(
            models_dir = %models_dir.display(),
            max_concurrent = self.settings.max_concurrent_downloads(),
            "Model engine started"
        );
        Ok(ModelEngine {
            downloads: DownloadModel::new(store.clone(), coordinator.clone()),
            lifecycle: ModelLifecycle::new(store.clone(), coordinator.clone(), self.export),
            refresh: RefreshCatalog::new(catalog_source, store.clone()),
            verify,
            store,
            coordinator,
            transfers,
            listener: Mutex::new(Some(listener)),
            stop: Mutex::new(Some(stop_tx)),
        })
    }
}

/// Entry point for the UI layer: catalog, downloads, verification and lifecycle.
pub struct ModelEngine {
    store: Arc<dyn CatalogStore>,
    coordinator: Arc<dyn DownloadCoordinator>,
    transfers: Arc<TransferCoordinator>,
    downloads: DownloadModel,
    verify: Arc<VerifyDownload>,
    lifecycle: ModelLifecycle,
    refresh: RefreshCatalog,
    listener: Mutex<Option<JoinHandle<()>>>,
    stop: Mutex<Option<Sender<()>>>,
}

impl ModelEngine {
    pub fn builder(settings: EngineSettings, export: Arc<dyn ExportService>) -> ModelEngineBuilder {
        ModelEngineBuilder {
            settings,
            export,
            sessions: Arc::new(NoActiveSessions),
            transport: None,
            resolver: None,
            catalog_source: None,
        }
    }

    /// Builder seeded from `config.json` in the platform config directory.
    pub fn configured(export: Arc<dyn ExportService>) -> Result<ModelEngineBuilder> {
        let settings = SettingsManager::load()?.read();
        Ok(Self::builder(settings, export))
    }

    pub fn refresh_catalog(&self) -> Result<RefreshOutcome, EngineError> {
        self.refresh.refresh()
    }

    pub fn download_model(&self, model_id: &str) -> Result<TaskId, EngineError> {
        self.downloads.download_model(model_id)
    }

    pub fn pause_download(&self, task_id: TaskId) -> Result<(), EngineError> {
        self.downloads.pause_download(task_id)
    }

    pub fn resume_download(&self, task_id: TaskId) -> Result<DownloadStatus, EngineError> {
        self.downloads.resume_download(task_id)
    }

    pub fn cancel_download(&self, task_id: TaskId) -> Result<(), EngineError> {
        self.downloads.cancel_download(task_id)
    }

    pub fn verify(&self, model_id: &str) -> Result<bool, EngineError> {
        self.verify.verify(model_id)
    }

    pub fn delete_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.lifecycle.delete_model(model_id)
    }

    pub fn retry_failed_download(&self, task_id: TaskId) -> Result<TaskId, EngineError> {
        self.lifecycle.retry_failed_download(task_id)
    }

    pub fn export_backup(
        &self,
        destination: &Path,
        include_chat_history: bool,
    ) -> Result<ExportReport, EngineError> {
        self.lifecycle
            .export_backup(destination, include_chat_history)
    }

    pub fn catalog(&self) -> Result<Vec<ModelPackage>, EngineError> {
        self.store
            .get_all()
            .map_err(|cause| EngineError::storage("failed to read model catalog", None, cause))
    }

    pub fn model(&self, model_id: &str) -> Result<Option<ModelPackage>, EngineError> {
        self.store.get_by_id(model_id).map_err(|cause| {
            EngineError::storage(
                format!("failed to read model {model_id}"),
                Some(model_id),
                cause,
            )
        })
    }

    pub fn refresh_status(&self) -> ModelCatalogRefreshStatus {
        self.store.refresh_status()
    }

    pub fn observe_catalog(&self) -> watch::Receiver<Vec<ModelPackage>> {
        self.store.observe_catalog()
    }

    pub fn observe_refresh_status(&self) -> watch::Receiver<ModelCatalogRefreshStatus> {
        self.store.observe_refresh_status()
    }

    pub fn active_downloads(&self) -> Vec<DownloadTask> {
        self.coordinator.get_active_downloads()
    }

    pub fn queued_downloads(&self) -> Vec<DownloadTask> {
        self.coordinator.get_queued_downloads()
    }

    pub fn task(&self, task_id: TaskId) -> Option<DownloadTask> {
        self.coordinator.get_task(task_id)
    }

    pub fn observe_progress(&self, task_id: TaskId) -> Result<watch::Receiver<f32>, EngineError> {
        self.coordinator
            .observe_progress(task_id)
            .map_err(|err| EngineError::download(err, None, "observe"))
    }

    pub fn observe_tasks(&self) -> watch::Receiver<Vec<DownloadTask>> {
        self.coordinator.observe_tasks()
    }

    pub fn subscribe(&self) -> Receiver<TransferEvent> {
        self.coordinator.subscribe()
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        self.store.clone()
    }

    pub fn coordinator(&self) -> Arc<dyn DownloadCoordinator> {
        self.coordinator.clone()
    }

    /// Stops transfers and the event listener. Models still downloading are repaired
    /// on the next start.
    pub fn shutdown(&self) {
        self.transfers.shutdown();
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(listener) = self.listener.lock().take() {
            if listener.join().is_err() {
                warn!("Transfer event listener panicked");
            }
        }
    }
}

impl Drop for ModelEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Transfer tasks live in memory only, so a model left `Downloading` by an earlier
/// process has nothing behind it anymore.
fn reconcile_interrupted(
    store: &dyn CatalogStore,
    coordinator: &dyn DownloadCoordinator,
) -> Result<()> {
    for model in store.get_all()? {
        if model.install_state != InstallState::Downloading {
            continue;
        }
        let model_id = model.model_id.as_str();
        let next = model.install_state.apply(InstallEvent::Interrupted)?;
        coordinator.delete_partial_files(model_id)?;
        store.update_install_state(model_id, next)?;
        store.update_download_task_id(model_id, None)?;
        warn!(model_id, "Download interrupted by shutdown; marked as failed");
    }
    Ok(())
}

fn spawn_listener(
    events: Receiver<TransferEvent>,
    stop: Receiver<()>,
    store: Arc<dyn CatalogStore>,
    verify: Arc<VerifyDownload>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => handle_event(store.as_ref(), &verify, event),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    })
}

fn handle_event(store: &dyn CatalogStore, verify: &VerifyDownload, event: TransferEvent) {
    match event {
        TransferEvent::Promoted { task_id, model_id } => {
            let lock = store.model_lock(&model_id);
            let _model_guard = lock.lock();
            if let Err(error) = mark_promoted(store, &model_id, task_id) {
                warn!("Failed to record promoted download {task_id} for {model_id}: {error:?}");
            }
        }
        TransferEvent::Completed { task_id, model_id } => {
            let lock = store.model_lock(&model_id);
            let _model_guard = lock.lock();
            match verify.verify_locked(&model_id) {
                Ok(true) => info!(%task_id, model_id = %model_id, "Model installed"),
                Ok(false) => warn!(%task_id, model_id = %model_id, "Downloaded model failed verification"),
                Err(error) => warn!("Verification of {model_id} after download {task_id} failed: {error:?}"),
            }
        }
        TransferEvent::Failed {
            task_id,
            model_id,
            error,
        } => {
            warn!("Download {task_id} for {model_id} failed and awaits retry: {error}");
        }
        other => debug!(?other, "Transfer event"),
    }
}

fn mark_promoted(store: &dyn CatalogStore, model_id: &str, task_id: TaskId) -> Result<()> {
    let Some(model) = store.get_by_id(model_id)? else {
        return Ok(());
    };
    let next = match model.install_state {
        InstallState::Downloading if model.download_task_id == Some(task_id) => return Ok(()),
        InstallState::Downloading => InstallState::Downloading,
        state => state.apply(InstallEvent::DownloadStarted)?,
    };
    store.record_download(model_id, next, task_id)?;
    debug!(model_id, %task_id, "Promoted download recorded in catalog");
    Ok(())
}
