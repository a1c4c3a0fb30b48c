//! Where stashbench keeps its files.
//!
//! The page database and the vector index live directly under the root.
//! Benchmark runs write their pool, labels, qrels and metrics into a
//! `benchmark/` subdirectory.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "STASHBENCH_DATA_DIR";

/// Root directory shared by every stashbench command.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Pick the root: `--data-dir` wins, then `STASHBENCH_DATA_DIR`, then
    /// `$XDG_DATA_HOME/stashbench`. The directory is created if missing.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var(DATA_DIR_ENV_VAR) {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("stashbench")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The SQLite page database written by the archiving host.
    pub fn doc_db(&self) -> PathBuf {
        self.root.join("doc.db")
    }

    /// Chunk embeddings for the chunked engine.
    pub fn vector_index(&self) -> PathBuf {
        self.root.join("vectors.redb")
    }

    /// Output directory for `benchmark`, created on first use.
    pub fn benchmark_dir(&self) -> Result<PathBuf> {
        let path = self.root.join("benchmark");
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}
