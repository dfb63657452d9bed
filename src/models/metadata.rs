use std::{
    fs::File,
    io::{self, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

const HASH_BUFFER: usize = 64 * 1024;

static SHA256_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("valid sha256 pattern"));

/// Lowercase hex SHA-256 of the file at `path`.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Canonical form for digests arriving from remote catalogs and manifests.
/// Anything that is not a 64-digit hex string is discarded.
pub fn normalize_checksum(raw: Option<&str>) -> Option<String> {
    let candidate = raw?.trim().to_ascii_lowercase();
    if SHA256_HEX.is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}
