mod download;
mod lifecycle;
mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use download::DownloadModel;
pub use lifecycle::{ExportRecord, ExportReport, ExportService, ExportWarning, ModelLifecycle};
pub use verify::VerifyDownload;

use crate::error::EngineError;
use crate::models::is_valid_model_id;

pub(crate) fn ensure_model_id(model_id: &str) -> Result<(), EngineError> {
    if is_valid_model_id(model_id) {
        Ok(())
    } else {
        Err(EngineError::InvalidModelId {
            model_id: model_id.to_string(),
        })
    }
}

/// Tags catalog failures with the model and the step that failed.
pub(crate) trait CatalogResultExt<T> {
    fn for_model(self, action: &str, model_id: &str) -> Result<T, EngineError>;
}

impl<T> CatalogResultExt<T> for anyhow::Result<T> {
    fn for_model(self, action: &str, model_id: &str) -> Result<T, EngineError> {
        self.map_err(|cause| {
            EngineError::storage(
                format!("failed to {action} for model {model_id}"),
                Some(model_id),
                cause,
            )
        })
    }
}
