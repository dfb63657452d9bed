use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, Context};
use reqwest::{blocking::Client, header::RANGE, StatusCode};
use thiserror::Error;

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub model_id: String,
    pub url: String,
    pub expected_size_bytes: Option<u64>,
}

/// Stop flag shared between a coordinator and the worker driving one transfer.
#[derive(Debug, Default)]
pub struct TransferControl {
    stopped: AtomicBool,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer interrupted")]
    Interrupted,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Moves the bytes of one artifact onto disk.
pub trait Transport: Send + Sync {
    /// Writes the artifact to `destination`, continuing after `resume_from` bytes when the
    /// source supports it. `progress` receives the byte count on disk after every chunk.
    /// Returns the final size of `destination`.
    fn fetch(
        &self,
        request: &TransferRequest,
        destination: &Path,
        resume_from: u64,
        control: &TransferControl,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, TransferError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn fetch(
        &self,
        request: &TransferRequest,
        destination: &Path,
        resume_from: u64,
        control: &TransferControl,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, TransferError> {
        if staged_in_full(request, resume_from) {
            tracing::debug!(
                model_id = %request.model_id,
                bytes = resume_from,
                "Staging file already complete"
            );
            progress(resume_from);
            return Ok(resume_from);
        }
        let mut builder = self.client.get(&request.url);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={resume_from}-"));
        }
        let response = builder
            .send()
            .with_context(|| format!("request {}", request.url))?;
        // Nothing left past the staged bytes.
        if resume_from > 0
            && response.status() == StatusCode::RANGE_NOT_SATISFIABLE
            && request.expected_size_bytes.map_or(true, |expected| expected == resume_from)
        {
            tracing::debug!(
                model_id = %request.model_id,
                bytes = resume_from,
                "Server reports nothing left to fetch"
            );
            progress(resume_from);
            return Ok(resume_from);
        }
        let mut response = response
            .error_for_status()
            .with_context(|| format!("download {}", request.url))?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).context("create staging directory")?;
        }
        let resumed = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let (mut file, mut downloaded) = if resumed {
            let file = OpenOptions::new()
                .append(true)
                .open(destination)
                .context("reopen staging file")?;
            (file, resume_from)
        } else {
            (File::create(destination).context("create staging file")?, 0)
        };
        tracing::debug!(
            model_id = %request.model_id,
            resumed,
            offset = downloaded,
            "Transfer started"
        );

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if control.is_stopped() {
                file.flush().context("flush staging file")?;
                return Err(TransferError::Interrupted);
            }
            let read = response.read(&mut buffer).context("read download chunk")?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .context("write download chunk")?;
            downloaded += read as u64;
            progress(downloaded);
        }
        file.flush().context("flush staging file")?;

        if let Some(expected) = request.expected_size_bytes {
            if expected > 0 && downloaded != expected {
                return Err(TransferError::Failed(anyhow!(
                    "size mismatch: expected {} bytes, got {}",
                    expected,
                    downloaded
                )));
            }
        }
        Ok(downloaded)
    }
}

/// The staging file already holds every expected byte.
fn staged_in_full(request: &TransferRequest, resume_from: u64) -> bool {
    resume_from > 0 && request.expected_size_bytes == Some(resume_from)
}
