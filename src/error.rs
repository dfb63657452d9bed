use thiserror::Error;

use crate::models::{DownloadStatus, IllegalInstallTransition, InstallState, TaskId};

/// Failures raised by the download coordinator.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download task {0} does not exist")]
    UnknownTask(TaskId),
    #[error("model {model_id} already has a live download task {task_id}")]
    AlreadyActive { model_id: String, task_id: TaskId },
    #[error("download task {task_id} cannot move from {from} to {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: DownloadStatus,
        to: DownloadStatus,
    },
    #[error("download task {task_id} cannot start from {status}: every download slot is busy")]
    NoFreeSlot {
        task_id: TaskId,
        status: DownloadStatus,
    },
    #[error("invalid model id {0:?}")]
    InvalidModelId(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSource {
    Catalog,
    Download,
}

/// Error returned across every use-case entry point.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model {model_id} not found")]
    ModelNotFound { model_id: String },
    #[error("invalid model id {model_id:?}")]
    InvalidModelId { model_id: String },
    #[error("model {model_id} is active in a conversation")]
    ModelInUse { model_id: String },
    #[error("cannot {action} model {model_id} while it is {state}")]
    InvalidModelState {
        model_id: String,
        state: InstallState,
        action: &'static str,
    },
    #[error("model {model_id} already has a live download task {task_id}")]
    AlreadyDownloading { model_id: String, task_id: TaskId },
    #[error("cannot {action} download task {task_id} while it is {status}")]
    InvalidTaskState {
        task_id: TaskId,
        status: DownloadStatus,
        action: &'static str,
    },
    #[error("{} checksum unavailable for model {model_id}", side_label(.side))]
    ChecksumUnavailable {
        model_id: String,
        side: ChecksumSource,
    },
    #[error("{message}")]
    Storage {
        message: String,
        model_id: Option<String>,
        task_id: Option<TaskId>,
        #[source]
        cause: anyhow::Error,
    },
    #[error("backup export failed: {cause}")]
    Export {
        #[source]
        cause: anyhow::Error,
    },
    #[error("download task {task_id} does not exist")]
    UnknownTask { task_id: TaskId },
}

fn side_label(side: &ChecksumSource) -> &'static str {
    match side {
        ChecksumSource::Catalog => "expected",
        ChecksumSource::Download => "downloaded",
    }
}

impl EngineError {
    /// `false` only for caller contract violations.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::UnknownTask { .. })
    }

    /// Identifiers a caller needs to react to or display the failure.
    #[must_use]
    pub fn context(&self) -> Vec<(&'static str, String)> {
        let mut context = Vec::new();
        match self {
            EngineError::ModelNotFound { model_id }
            | EngineError::InvalidModelId { model_id }
            | EngineError::ModelInUse { model_id }
            | EngineError::InvalidModelState { model_id, .. }
            | EngineError::ChecksumUnavailable { model_id, .. } => {
                context.push(("modelId", model_id.clone()));
            }
            EngineError::AlreadyDownloading { model_id, task_id } => {
                context.push(("modelId", model_id.clone()));
                context.push(("taskId", task_id.to_string()));
            }
            EngineError::InvalidTaskState { task_id, .. } | EngineError::UnknownTask { task_id } => {
                context.push(("taskId", task_id.to_string()));
            }
            EngineError::Storage {
                model_id, task_id, ..
            } => {
                if let Some(model_id) = model_id {
                    context.push(("modelId", model_id.clone()));
                }
                if let Some(task_id) = task_id {
                    context.push(("taskId", task_id.to_string()));
                }
            }
            EngineError::Export { .. } => {}
        }
        context
    }

    pub(crate) fn storage(
        message: impl Into<String>,
        model_id: Option<&str>,
        cause: anyhow::Error,
    ) -> Self {
        EngineError::Storage {
            message: message.into(),
            model_id: model_id.map(ToOwned::to_owned),
            task_id: None,
            cause,
        }
    }

    pub(crate) fn install_transition(
        model_id: &str,
        err: IllegalInstallTransition,
        action: &'static str,
    ) -> Self {
        EngineError::InvalidModelState {
            model_id: model_id.to_string(),
            state: err.from,
            action,
        }
    }

    /// Attaches the task a storage failure happened under.
    #[must_use]
    pub(crate) fn for_task(mut self, id: TaskId) -> Self {
        if let EngineError::Storage { task_id, .. } = &mut self {
            *task_id = Some(id);
        }
        self
    }

    /// Translates a coordinator failure, tagging it with what the caller was doing.
    pub(crate) fn download(
        err: DownloadError,
        model_id: Option<&str>,
        action: &'static str,
    ) -> Self {
        match err {
            DownloadError::UnknownTask(task_id) => EngineError::UnknownTask { task_id },
            DownloadError::AlreadyActive { model_id, task_id } => {
                EngineError::AlreadyDownloading { model_id, task_id }
            }
            DownloadError::IllegalTransition { task_id, from, .. }
            | DownloadError::NoFreeSlot {
                task_id,
                status: from,
            } => EngineError::InvalidTaskState {
                task_id,
                status: from,
                action,
            },
            DownloadError::InvalidModelId(model_id) => EngineError::InvalidModelId { model_id },
            DownloadError::Storage(cause) => EngineError::Storage {
                message: match model_id {
                    Some(model_id) => format!("failed to {action} download for model {model_id}"),
                    None => format!("failed to {action} download"),
                },
                model_id: model_id.map(ToOwned::to_owned),
                task_id: None,
                cause,
            },
        }
    }
}
