use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::task::TaskId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderType {
    MediaPipe,
    Tflite,
    MlcLlm,
    OnnxRuntime,
    Leap,
    CloudApi,
}

impl ProviderType {
    /// Runs inference on the device, so it has an artifact to download.
    #[must_use]
    pub fn is_on_device(&self) -> bool {
        !matches!(self, ProviderType::CloudApi)
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_tag(value).as_str() {
            "MEDIA_PIPE" | "MEDIAPIPE" => Ok(ProviderType::MediaPipe),
            "TFLITE" => Ok(ProviderType::Tflite),
            "MLC_LLM" => Ok(ProviderType::MlcLlm),
            "ONNX_RUNTIME" | "ONNX" => Ok(ProviderType::OnnxRuntime),
            "LEAP" => Ok(ProviderType::Leap),
            "CLOUD_API" | "CLOUD" => Ok(ProviderType::CloudApi),
            _ => Err(format!("unknown provider type: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    LocalArchive,
    PlayAsset,
    CloudFallback,
}

impl FromStr for DeliveryType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_tag(value).as_str() {
            "LOCAL_ARCHIVE" | "LOCAL" => Ok(DeliveryType::LocalArchive),
            "PLAY_ASSET" => Ok(DeliveryType::PlayAsset),
            "CLOUD_FALLBACK" => Ok(DeliveryType::CloudFallback),
            _ => Err(format!("unknown delivery type: {value}")),
        }
    }
}

fn normalize_tag(value: &str) -> String {
    value.trim().replace('-', "_").to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallState {
    NotInstalled,
    Downloading,
    Installed,
    Error,
}

/// Everything that may move a model between install states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallEvent {
    DownloadStarted,
    RetryStarted,
    Verified,
    VerificationFailed,
    Cancelled,
    Deleted,
    /// The process stopped while a transfer was in flight.
    Interrupted,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("install state {from} does not accept {event:?}")]
pub struct IllegalInstallTransition {
    pub from: InstallState,
    pub event: InstallEvent,
}

impl InstallState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::NotInstalled => "not installed",
            InstallState::Downloading => "downloading",
            InstallState::Installed => "installed",
            InstallState::Error => "error",
        }
    }

    pub fn apply(self, event: InstallEvent) -> Result<InstallState, IllegalInstallTransition> {
        use InstallEvent::*;
        use InstallState::*;

        let next = match (self, event) {
            (NotInstalled | Error, DownloadStarted) => Some(Downloading),
            (NotInstalled | Downloading | Error, RetryStarted) => Some(Downloading),
            (_, Verified) => Some(Installed),
            (_, VerificationFailed) => Some(Error),
            (Installed, Cancelled) => None,
            (_, Cancelled) => Some(NotInstalled),
            (Downloading, Deleted) => None,
            (_, Deleted) => Some(NotInstalled),
            (Downloading, Interrupted) => Some(Error),
            (Downloading | Installed, DownloadStarted)
            | (Installed, RetryStarted)
            | (NotInstalled | Installed | Error, Interrupted) => None,
        };
        next.ok_or(IllegalInstallTransition { from: self, event })
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelPackage {
    pub model_id: String,
    pub display_name: String,
    pub version: String,
    pub provider_type: ProviderType,
    pub delivery_type: DeliveryType,
    #[serde(default)]
    pub min_app_version: u32,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub install_state: InstallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_task_id: Option<TaskId>,
    pub manifest_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ModelPackage {
    /// Cloud-routed packages have nothing to fetch.
    #[must_use]
    pub fn is_downloadable(&self) -> bool {
        self.provider_type.is_on_device() && self.delivery_type != DeliveryType::CloudFallback
    }

    /// Folds a freshly fetched entry over the locally persisted one. Local lifecycle
    /// state wins; remote metadata wins unless it is blank.
    #[must_use]
    pub fn merge_over(self, persisted: &ModelPackage) -> ModelPackage {
        ModelPackage {
            install_state: persisted.install_state,
            download_task_id: persisted.download_task_id,
            checksum_sha256: non_blank(self.checksum_sha256)
                .or_else(|| persisted.checksum_sha256.clone()),
            signature: non_blank(self.signature).or_else(|| persisted.signature.clone()),
            created_at: persisted.created_at,
            updated_at: self.updated_at.max(persisted.updated_at),
            ..self
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|inner| !inner.trim().is_empty())
}
