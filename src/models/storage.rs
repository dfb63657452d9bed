use std::fs;
use std::path::Path;

use anyhow::{bail, Result};
use sysinfo::Disks;

/// Free bytes on the filesystem that hosts `path`, if it can be identified.
pub fn available_space(path: &Path) -> Option<u64> {
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Refuses a transfer that would leave less than `headroom` bytes free.
pub fn ensure_free_space(path: &Path, required: u64, headroom: u64) -> Result<()> {
    let Some(available) = available_space(path) else {
        return Ok(());
    };
    check_capacity(available, required, headroom)
}

fn check_capacity(available: u64, required: u64, headroom: u64) -> Result<()> {
    let needed = required.saturating_add(headroom);
    if available < needed {
        bail!(
            "insufficient storage: {} bytes needed, {} bytes available",
            needed,
            available
        );
    }
    Ok(())
}
