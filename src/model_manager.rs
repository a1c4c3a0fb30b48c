use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use tokenizers::Tokenizer;
use tracing::info;

use crate::embedding::{Embedder, masked_mean_l2};
use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const MODEL_ENV_VAR: &str = "STASHBENCH_MODEL";

/// Longest sequence a BERT position table accepts.
const MAX_SEQUENCE_TOKENS: usize = 512;

/// Texts per forward pass.
const ENCODE_BATCH_SIZE: usize = 32;

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn tokenizer_error(e: impl std::fmt::Display) -> Error {
    Error::Tokenizer(e.to_string())
}

struct LoadedModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl LoadedModel {
    fn load(model_id: &str) -> Result<Self> {
        let (config_path, tokenizer_path, weights_path) =
            resolve_model_files(model_id)?;

        let config: Config =
            serde_json::from_str(&std::fs::read_to_string(config_path)?)?;

        let mut tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(tokenizer_error)?;
        // Chunking needs offsets for the whole text, and batches are padded
        // by hand, so the tokenizer.json defaults are switched off.
        tokenizer.with_truncation(None).map_err(tokenizer_error)?;
        tokenizer.with_padding(None);

        let device = default_device();
        let weights = std::fs::read(weights_path)?;
        let vb = VarBuilder::from_buffered_safetensors(weights, DTYPE, &device)?;
        let model = BertModel::load(vb, &config)?;

        info!(model = model_id, device = ?device, "loaded embedding model");

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(tokenizer_error)?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len().min(MAX_SEQUENCE_TOKENS))
            .max()
            .unwrap_or(0)
            .max(1);

        let mut ids = Vec::with_capacity(texts.len() * max_len);
        let mut mask = Vec::with_capacity(texts.len() * max_len);
        for encoding in &encodings {
            let len = encoding.get_ids().len().min(MAX_SEQUENCE_TOKENS);
            ids.extend_from_slice(&encoding.get_ids()[..len]);
            mask.extend(std::iter::repeat_n(1u32, len));
            ids.extend(std::iter::repeat_n(0u32, max_len - len));
            mask.extend(std::iter::repeat_n(0u32, max_len - len));
        }

        let shape = (texts.len(), max_len);
        let input_ids = Tensor::from_vec(ids, shape, &self.device)?;
        let attention_mask = Tensor::from_vec(mask, shape, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self.model.forward(
            &input_ids,
            &token_type_ids,
            Some(&attention_mask),
        )?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        Ok(pooled.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?)
    }
}

/// Resolve `config.json`, `tokenizer.json` and `model.safetensors`, either
/// from a local model directory or from the HuggingFace Hub cache.
fn resolve_model_files(model_id: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok((
            local.join("config.json"),
            local.join("tokenizer.json"),
            local.join("model.safetensors"),
        ));
    }

    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| Error::Model(e.to_string()))?;
    let repo = api.model(model_id.to_string());
    let fetch = |file: &str| {
        repo.get(file)
            .map_err(|e| Error::Model(format!("{model_id}/{file}: {e}")))
    };

    Ok((
        fetch("config.json")?,
        fetch("tokenizer.json")?,
        fetch("model.safetensors")?,
    ))
}

/// Manages the sentence-embedding model lifecycle, loading it on first use.
pub struct ModelManager {
    model: OnceCell<LoadedModel>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a new `ModelManager`. The model ID is resolved from:
    /// 1. The `STASHBENCH_MODEL` environment variable, if set
    /// 2. Otherwise, the default model (`sentence-transformers/all-MiniLM-L6-v2`)
    pub fn new() -> Self {
        let model_id = std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());
        Self::with_model_id(model_id)
    }

    /// Creates a `ModelManager` with an explicit model ID, bypassing
    /// environment variable resolution.
    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: OnceCell::new(),
            model_id,
        }
    }

    /// Returns `true` if the model has already been loaded into memory.
    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&self) -> Result<&LoadedModel> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }
        let loaded = LoadedModel::load(&self.model_id)?;
        Ok(self.model.get_or_init(|| loaded))
    }
}

impl Embedder for ModelManager {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>> {
        let model = self.ensure_loaded()?;
        let encoding = model
            .tokenizer
            .encode(text, false)
            .map_err(tokenizer_error)?;
        Ok(encoding.get_offsets().to_vec())
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.ensure_loaded()?;
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(ENCODE_BATCH_SIZE) {
            vectors.extend(model.encode(batch)?);
        }
        Ok(vectors)
    }
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("model_id", &self.model_id)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
