use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::download::TransferRequest;
use super::metadata::normalize_checksum;
use super::package::ModelPackage;
use super::store::CatalogStore;

/// Per-model download descriptor published next to the catalog.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DownloadManifest {
    pub model_id: String,
    #[serde(default)]
    pub version: Option<String>,
    pub download_url: String,
    #[serde(default)]
    pub checksum_sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Turns a model id into something a transport can fetch.
pub trait DownloadResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> Result<TransferRequest>;
}

/// Folds manifest metadata into the catalog entry. `None` when nothing changes.
#[must_use]
pub fn apply_manifest(package: &ModelPackage, manifest: &DownloadManifest) -> Option<ModelPackage> {
    let mut updated = package.clone();
    if let Some(checksum) = normalize_checksum(manifest.checksum_sha256.as_deref()) {
        updated.checksum_sha256 = Some(checksum);
    }
    if let Some(size) = manifest.size_bytes.filter(|size| *size > 0) {
        updated.size_bytes = size;
    }
    if let Some(signature) = manifest
        .signature
        .as_deref()
        .map(str::trim)
        .filter(|signature| !signature.is_empty())
    {
        updated.signature = Some(signature.to_string());
    }
    if updated == *package {
        return None;
    }
    updated.updated_at = OffsetDateTime::now_utc();
    Some(updated)
}

fn is_manifest_document(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".json")
}

pub struct ManifestResolver {
    store: Arc<dyn CatalogStore>,
    client: Client,
}

impl ManifestResolver {
    pub fn new(store: Arc<dyn CatalogStore>, client: Client) -> Self {
        Self { store, client }
    }

    fn fetch_manifest(&self, url: &str) -> Result<DownloadManifest> {
        let bytes = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request manifest {url}"))?
            .error_for_status()
            .with_context(|| format!("fetch manifest {url}"))?
            .bytes()
            .context("read manifest body")?;
        serde_json::from_slice(&bytes).context("parse download manifest")
    }
}

impl DownloadResolver for ManifestResolver {
    fn resolve(&self, model_id: &str) -> Result<TransferRequest> {
        let package = self
            .store
            .get_by_id(model_id)?
            .ok_or_else(|| anyhow!("model {model_id} is not in the catalog"))?;
        if !package.is_downloadable() {
            bail!("model {model_id} is served remotely and has no artifact");
        }
        if !is_manifest_document(&package.manifest_url) {
            return Ok(TransferRequest {
                model_id: package.model_id,
                url: package.manifest_url,
                expected_size_bytes: Some(package.size_bytes).filter(|size| *size > 0),
            });
        }

        let manifest = self.fetch_manifest(&package.manifest_url)?;
        if manifest.model_id != model_id {
            bail!(
                "manifest at {} describes {} instead of {model_id}",
                package.manifest_url,
                manifest.model_id
            );
        }
        debug!(model_id, version = ?manifest.version, "Resolved download manifest");

        let lock = self.store.model_lock(model_id);
        let expected_size = {
            let _guard = lock.lock();
            let current = self
                .store
                .get_by_id(model_id)?
                .ok_or_else(|| anyhow!("model {model_id} was removed from the catalog"))?;
            match apply_manifest(&current, &manifest) {
                Some(updated) => {
                    let size = updated.size_bytes;
                    self.store
                        .upsert_model(updated)
                        .context("store manifest metadata")?;
                    info!(model_id, "Catalog updated from download manifest");
                    size
                }
                None => current.size_bytes,
            }
        };

        Ok(TransferRequest {
            model_id: model_id.to_string(),
            url: manifest.download_url,
            expected_size_bytes: Some(expected_size).filter(|size| *size > 0),
        })
    }
}
