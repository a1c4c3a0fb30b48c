//! Process-wide configuration, resolved once at start-up and passed down by
//! reference.

use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::data_dir::DataDir;
use crate::error::{Error, Result};
use crate::model_manager::{DEFAULT_MODEL_ID, MODEL_ENV_VAR};
use crate::oracle::{DEFAULT_API_KEY_ENV, OracleSettings};
use crate::vector_engine::VectorSettings;

/// Set to `1` to embed with the hashing embedder instead of a model.
pub const FAKE_EMBEDDINGS_ENV_VAR: &str = "STASHBENCH_FAKE_EMBEDDINGS";

#[derive(Debug, Clone)]
pub struct Settings {
    pub doc_db: PathBuf,
    pub vector_index: PathBuf,
    pub model_id: String,
    /// Use the deterministic hashing embedder, never touching a model.
    pub offline_embeddings: bool,
    pub vector: VectorSettings,
    pub oracle: OracleSettings,
}

/// Values given on the command line, overriding environment and defaults.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub doc_db: Option<PathBuf>,
    pub vector_index: Option<PathBuf>,
    pub model_id: Option<String>,
    pub batch_size: Option<usize>,
    pub chunk_tokens: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub oracle_endpoint: Option<String>,
    pub oracle_model: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub with_explanation: bool,
    pub oracle_delay: Option<Duration>,
}

impl Settings {
    pub fn resolve(data_dir: &DataDir, overrides: SettingsOverrides) -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let mut vector = VectorSettings::default();
        if let Some(size) = overrides.batch_size {
            vector.batch_size = size;
        }
        if let Some(tokens) = overrides.chunk_tokens {
            vector.chunking.max_tokens = tokens;
        }
        if let Some(overlap) = overrides.chunk_overlap {
            vector.chunking.overlap = overlap;
        }
        if vector.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if vector.chunking.overlap >= vector.chunking.max_tokens {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be smaller than the chunk size ({})",
                vector.chunking.overlap, vector.chunking.max_tokens
            )));
        }

        let mut oracle = OracleSettings {
            api_key: env(DEFAULT_API_KEY_ENV),
            with_explanation: overrides.with_explanation,
            ..Default::default()
        };
        if let Some(endpoint) = overrides.oracle_endpoint {
            oracle.endpoint = endpoint;
        }
        if let Some(model) = overrides.oracle_model {
            oracle.model = model;
        }
        if let Some(delay) = overrides.oracle_delay {
            oracle.delay = delay;
        }
        if let Some(path) = overrides.prompt_file {
            oracle.system_prompt = std::fs::read_to_string(&path)
                .map_err(|e| {
                    Error::Config(format!(
                        "reading prompt file {}: {e}",
                        path.display()
                    ))
                })?
                .trim()
                .to_string();
        }

        let settings = Self {
            doc_db: overrides.doc_db.unwrap_or_else(|| data_dir.doc_db()),
            vector_index: overrides
                .vector_index
                .unwrap_or_else(|| data_dir.vector_index()),
            model_id: overrides
                .model_id
                .or_else(|| env(MODEL_ENV_VAR))
                .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            offline_embeddings: env(FAKE_EMBEDDINGS_ENV_VAR)
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            vector,
            oracle,
        };
        debug!(
            doc_db = %settings.doc_db.display(),
            vector_index = %settings.vector_index.display(),
            model = %settings.model_id,
            offline = settings.offline_embeddings,
            "resolved settings"
        );
        Ok(settings)
    }
}
