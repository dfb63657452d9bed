use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{ChecksumSource, EngineError};
use crate::models::{CatalogStore, DownloadCoordinator, InstallEvent, InstallState};

use super::{ensure_model_id, CatalogResultExt};

/// Decides whether a finished download can be trusted.
pub struct VerifyDownload {
    store: Arc<dyn CatalogStore>,
    coordinator: Arc<dyn DownloadCoordinator>,
}

impl VerifyDownload {
    pub fn new(store: Arc<dyn CatalogStore>, coordinator: Arc<dyn DownloadCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// `Ok(true)` installs the model, `Ok(false)` is a checksum mismatch. Missing digests
    /// are errors. Every outcome other than a match leaves the model in `Error`.
    pub fn verify(&self, model_id: &str) -> Result<bool, EngineError> {
        ensure_model_id(model_id)?;
        let lock = self.store.model_lock(model_id);
        let _model_guard = lock.lock();
        self.verify_locked(model_id)
    }

    /// Same as [`Self::verify`] for callers already holding the model lock.
    pub(crate) fn verify_locked(&self, model_id: &str) -> Result<bool, EngineError> {
        let model = self
            .store
            .get_by_id(model_id)
            .for_model("read catalog entry", model_id)?
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.to_string(),
            })?;

        let Some(expected) = model
            .checksum_sha256
            .as_deref()
            .map(str::trim)
            .filter(|checksum| !checksum.is_empty())
            .map(ToOwned::to_owned)
        else {
            warn!(model_id, "No expected checksum; refusing to trust artifact");
            self.mark(model_id, model.install_state, InstallEvent::VerificationFailed)?;
            return Err(EngineError::ChecksumUnavailable {
                model_id: model_id.to_string(),
                side: ChecksumSource::Catalog,
            });
        };

        let actual = match self.coordinator.get_downloaded_checksum(model_id) {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                warn!(model_id, "Downloaded artifact is missing");
                self.mark(model_id, model.install_state, InstallEvent::VerificationFailed)?;
                return Err(EngineError::ChecksumUnavailable {
                    model_id: model_id.to_string(),
                    side: ChecksumSource::Download,
                });
            }
            Err(err) => {
                self.mark(model_id, model.install_state, InstallEvent::VerificationFailed)?;
                return Err(EngineError::download(err, Some(model_id), "verify"));
            }
        };

        if actual == expected {
            self.mark(model_id, model.install_state, InstallEvent::Verified)?;
            self.store
                .update_checksum(model_id, &actual)
                .for_model("store verified checksum", model_id)?;
            info!(model_id, "Checksum verified; model installed");
            Ok(true)
        } else {
            warn!(model_id, %expected, %actual, "Checksum mismatch");
            self.mark(model_id, model.install_state, InstallEvent::VerificationFailed)?;
            Ok(false)
        }
    }

    /// Applies the verification outcome and releases the finished task.
    fn mark(
        &self,
        model_id: &str,
        current: InstallState,
        event: InstallEvent,
    ) -> Result<(), EngineError> {
        let next = current
            .apply(event)
            .map_err(|err| EngineError::install_transition(model_id, err, "verify"))?;
        self.store
            .update_install_state(model_id, next)
            .for_model("record verification result", model_id)?;
        self.store
            .update_download_task_id(model_id, None)
            .for_model("clear download task", model_id)
    }
}
