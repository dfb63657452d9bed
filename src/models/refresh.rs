use std::collections::BTreeSet;
use std::sync::Arc;

use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::EngineError;

use super::layout::is_valid_model_id;
use super::metadata::normalize_checksum;
use super::package::{DeliveryType, InstallState, ModelPackage, ProviderType};
use super::store::CatalogStore;

const CATALOG_WRITE_FAILED: &str = "catalog-write-failed";

#[derive(Debug, Error)]
pub enum CatalogFetchError {
    #[error("catalog endpoint unreachable: {0}")]
    NetworkUnavailable(String),
    #[error("catalog request timed out")]
    Timeout,
    #[error("catalog endpoint answered HTTP {0}")]
    HttpStatus(u16),
    #[error("malformed catalog: {0}")]
    Malformed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CatalogFetchError {
    /// Short tag stored with the fallback record.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            CatalogFetchError::NetworkUnavailable(_) => "network-unavailable",
            CatalogFetchError::Timeout => "timeout",
            CatalogFetchError::HttpStatus(_) => "http-status",
            CatalogFetchError::Malformed(_) => "malformed-catalog",
            CatalogFetchError::Other(_) => "fetch-failed",
        }
    }
}

/// Where the remote list of model packages comes from.
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_catalog(&self) -> Result<Vec<ModelPackage>, CatalogFetchError>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    models: Vec<CatalogEntry>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(alias = "model_id")]
    id: String,
    display_name: String,
    version: String,
    provider: String,
    delivery: String,
    #[serde(default = "default_version")]
    min_app_version: u32,
    size_bytes: u64,
    #[serde(default)]
    capabilities: Vec<String>,
    manifest_url: String,
    #[serde(default)]
    checksum_sha256: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl CatalogEntry {
    fn into_package(self, now: OffsetDateTime) -> Result<ModelPackage, String> {
        if !is_valid_model_id(&self.id) {
            return Err(format!("invalid model id {:?}", self.id));
        }
        let provider_type: ProviderType = self.provider.parse()?;
        let delivery_type: DeliveryType = self.delivery.parse()?;
        let capabilities: BTreeSet<String> = self
            .capabilities
            .iter()
            .map(|capability| capability.trim())
            .filter(|capability| !capability.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Ok(ModelPackage {
            checksum_sha256: normalize_checksum(self.checksum_sha256.as_deref()),
            signature: self.signature.filter(|value| !value.trim().is_empty()),
            created_at: parse_timestamp(self.created_at.as_deref())?.unwrap_or(now),
            updated_at: parse_timestamp(self.updated_at.as_deref())?.unwrap_or(now),
            model_id: self.id,
            display_name: self.display_name,
            version: self.version,
            provider_type,
            delivery_type,
            min_app_version: self.min_app_version,
            size_bytes: self.size_bytes,
            capabilities,
            install_state: InstallState::NotInstalled,
            download_task_id: None,
            manifest_url: self.manifest_url,
        })
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<OffsetDateTime>, String> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => OffsetDateTime::parse(value, &Rfc3339)
            .map(Some)
            .map_err(|err| format!("invalid timestamp {value:?}: {err}")),
        None => Ok(None),
    }
}

/// Parses a remote catalog document. One bad entry rejects the whole document.
pub fn parse_catalog(bytes: &[u8]) -> Result<Vec<ModelPackage>, CatalogFetchError> {
    let document: CatalogDocument = serde_json::from_slice(bytes)
        .map_err(|err| CatalogFetchError::Malformed(err.to_string()))?;
    debug!(
        version = document.version,
        entries = document.models.len(),
        "Parsing remote catalog"
    );
    let now = OffsetDateTime::now_utc();
    document
        .models
        .into_iter()
        .map(|entry| entry.into_package(now))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CatalogFetchError::Malformed)
}

pub struct HttpCatalogSource {
    url: String,
    client: Client,
}

impl HttpCatalogSource {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

impl CatalogSource for HttpCatalogSource {
    fn name(&self) -> &str {
        &self.url
    }

    fn fetch_catalog(&self) -> Result<Vec<ModelPackage>, CatalogFetchError> {
        let response = self.client.get(&self.url).send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogFetchError::HttpStatus(status.as_u16()));
        }
        let bytes = response.bytes().map_err(classify)?;
        parse_catalog(&bytes)
    }
}

fn classify(err: reqwest::Error) -> CatalogFetchError {
    if err.is_timeout() {
        CatalogFetchError::Timeout
    } else if err.is_connect() {
        CatalogFetchError::NetworkUnavailable(err.to_string())
    } else {
        CatalogFetchError::Other(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed {
        source: String,
        model_count: usize,
    },
    /// The remote catalog could not be applied; the local one stays authoritative.
    ServedFromCache {
        reason: String,
        cached_count: usize,
        message: String,
    },
}

/// Pulls the remote catalog into the store, keeping the cached copy on any failure.
pub struct RefreshCatalog {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn CatalogStore>,
}

impl RefreshCatalog {
    pub fn new(source: Arc<dyn CatalogSource>, store: Arc<dyn CatalogStore>) -> Self {
        Self { source, store }
    }

    pub fn refresh(&self) -> Result<RefreshOutcome, EngineError> {
        let source = self.source.name().to_string();
        let (reason, message) = match self.source.fetch_catalog() {
            Ok(models) => {
                let model_count = models.len();
                match self.store.replace_catalog(models) {
                    Ok(()) => {
                        info!(source = %source, model_count, "Model catalog refreshed");
                        if let Err(error) = self.store.record_refresh_success(&source, model_count)
                        {
                            warn!("Failed to record catalog refresh: {error:?}");
                        }
                        return Ok(RefreshOutcome::Refreshed {
                            source,
                            model_count,
                        });
                    }
                    Err(error) => (CATALOG_WRITE_FAILED, format!("{error:#}")),
                }
            }
            Err(error) => (error.reason(), error.to_string()),
        };

        warn!(source = %source, reason, "Catalog refresh failed: {message}");
        let cached_count = self
            .store
            .get_all()
            .map(|models| models.len())
            .unwrap_or_default();
        self.store
            .record_offline_fallback(reason, cached_count, Some(&message))
            .map_err(|cause| {
                EngineError::storage("failed to record catalog fallback", None, cause)
            })?;
        Ok(RefreshOutcome::ServedFromCache {
            reason: reason.to_string(),
            cached_count,
            message,
        })
    }
}
