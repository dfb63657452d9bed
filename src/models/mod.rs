mod coordinator;
mod download;
mod layout;
mod manifest;
mod metadata;
mod package;
mod refresh;
mod storage;
mod store;
mod task;

pub use coordinator::{DownloadCoordinator, TransferCoordinator, TransferEvent};
pub use download::{HttpTransport, TransferControl, TransferError, TransferRequest, Transport};
pub use layout::{is_valid_model_id, ArtifactLayout};
pub use manifest::{apply_manifest, DownloadManifest, DownloadResolver, ManifestResolver};
pub use metadata::{compute_sha256, normalize_checksum};
pub use package::{
    DeliveryType, IllegalInstallTransition, InstallEvent, InstallState, ModelPackage, ProviderType,
};
pub use refresh::{
    parse_catalog, CatalogFetchError, CatalogSource, HttpCatalogSource, RefreshCatalog,
    RefreshOutcome,
};
pub use storage::{available_space, ensure_free_space};
pub use store::{
    CatalogStore, FileCatalogStore, ModelCatalogRefreshStatus, ModelLock, NoActiveSessions,
    SessionMonitor,
};
pub use task::{progress_fraction, DownloadStatus, DownloadTask, TaskId};

#[cfg(test)]
pub(crate) use coordinator::fakes;
#[cfg(test)]
pub(crate) use package::fixtures;
