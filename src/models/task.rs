use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DownloadError;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// Queued or transferring; what counts toward `get_active_downloads`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }

    /// Still owns its model: a second task for the same model is refused while this holds.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Paused
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Queued, Paused)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Queued)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Failed, Queued)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub task_id: TaskId,
    pub model_id: String,
    pub status: DownloadStatus,
    pub progress: f32,
    pub bytes_downloaded: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DownloadTask {
    #[must_use]
    pub fn queued(model_id: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            model_id: model_id.into(),
            status: DownloadStatus::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            error_message: None,
        }
    }

    /// Moves the task to `next`. Re-entering the current status is a no-op.
    pub fn transition(&mut self, next: DownloadStatus) -> Result<(), DownloadError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DownloadError::IllegalTransition {
                task_id: self.task_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            DownloadStatus::Failed | DownloadStatus::Cancelled => {
                self.finished_at = Some(OffsetDateTime::now_utc());
            }
            _ => {
                self.finished_at = None;
                self.error_message = None;
            }
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), DownloadError> {
        self.transition(DownloadStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Prepares a failed task for a retry that starts again from zero bytes.
    pub fn reset(&mut self) -> Result<(), DownloadError> {
        if self.status != DownloadStatus::Failed {
            return Err(DownloadError::IllegalTransition {
                task_id: self.task_id,
                from: self.status,
                to: DownloadStatus::Queued,
            });
        }
        self.transition(DownloadStatus::Queued)?;
        self.progress = 0.0;
        self.bytes_downloaded = 0;
        self.started_at = OffsetDateTime::now_utc();
        Ok(())
    }

    /// Records transferred bytes; progress never moves backwards within one attempt.
    pub fn record_progress(&mut self, bytes_downloaded: u64, expected: Option<u64>) -> f32 {
        self.bytes_downloaded = self.bytes_downloaded.max(bytes_downloaded);
        let fraction = progress_fraction(self.bytes_downloaded, expected);
        if fraction > self.progress {
            self.progress = fraction;
        }
        self.progress
    }
}

pub fn progress_fraction(downloaded: u64, expected: Option<u64>) -> f32 {
    if let Some(total) = expected {
        if total > 0 {
            return ((downloaded as f64 / total as f64).clamp(0.0, 1.0)) as f32;
        }
    }
    0.0
}
