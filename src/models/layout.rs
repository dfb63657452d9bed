use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static MODEL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid model id pattern"));

/// Model ids double as file names, so they must stay inside the models directory.
#[must_use]
pub fn is_valid_model_id(model_id: &str) -> bool {
    MODEL_ID.is_match(model_id) && !model_id.contains("..")
}

/// Where a model's files live on disk. Shared by the catalog store (deletion) and the
/// download coordinator (staging and finished artifacts).
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn ensure_directory(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create model directory {}", self.root.display()))
    }

    #[must_use]
    pub fn artifact_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.bin"))
    }

    #[must_use]
    pub fn staging_path(&self, model_id: &str) -> PathBuf {
        self.root.join(format!("{model_id}.part"))
    }

    /// Removes the staging file and any unverified artifact.
    pub fn remove_partial(&self, model_id: &str) -> Result<()> {
        remove_if_present(&self.staging_path(model_id))?;
        remove_if_present(&self.artifact_path(model_id))
    }

    /// Removes every file the model owns. Absent files are not an error.
    pub fn remove_all(&self, model_id: &str) -> Result<()> {
        self.remove_partial(model_id)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ids_that_escape_the_directory() {
        assert!(is_valid_model_id("gemma-2b_q4.v1"));
        assert!(!is_valid_model_id(""));
        assert!(!is_valid_model_id("../etc"));
        assert!(!is_valid_model_id("a..b"));
        assert!(!is_valid_model_id("nested/model"));
        assert!(!is_valid_model_id(".hidden"));
    }

    #[test]
    fn removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        fs::write(layout.artifact_path("m1"), b"weights").unwrap();
        fs::write(layout.staging_path("m1"), b"partial").unwrap();

        layout.remove_all("m1").unwrap();
        assert!(!layout.artifact_path("m1").exists());
        assert!(!layout.staging_path("m1").exists());

        layout.remove_all("m1").unwrap();
    }

    #[test]
    fn partial_cleanup_leaves_other_models_alone() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        fs::write(layout.staging_path("m1"), b"partial").unwrap();
        fs::write(layout.artifact_path("m10"), b"other").unwrap();

        layout.remove_partial("m1").unwrap();
        assert!(!layout.staging_path("m1").exists());
        assert!(layout.artifact_path("m10").exists());
    }
}
