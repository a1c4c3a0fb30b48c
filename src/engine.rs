//! The retrieval engine contract and the registry of engine variants.

use std::fmt;
use std::str::FromStr;

use tracing::info;

use crate::bm25::Bm25Engine;
use crate::doc_store::{DocStore, DocumentId};
use crate::embedding::{Embedder, HashingEmbedder};
use crate::error::Result;
use crate::model_manager::ModelManager;
use crate::settings::Settings;
use crate::tfidf::TfIdfEngine;
use crate::vector_engine::ChunkedVectorEngine;

/// One ranked document. Scores are always higher-is-better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub document_id: DocumentId,
    pub score: f32,
}

/// Capability shared by every retrieval engine.
///
/// `load` must be called before `search`; calling it again rebuilds the
/// engine's state from the store.
pub trait SearchEngine {
    /// Stable name used as the provenance key in pools and runs.
    fn name(&self) -> &str;

    /// Build (or incrementally update) the engine's index from `store`.
    ///
    /// Fails with [`Error::EmptyCorpus`](crate::Error::EmptyCorpus) when the
    /// store holds no documents.
    fn load(&mut self, store: &DocStore) -> Result<()>;

    /// Return at most `top_k` hits sorted by descending score.
    ///
    /// Fails with [`Error::NotLoaded`](crate::Error::NotLoaded) before
    /// `load`. A query without matches yields an empty list.
    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>>;
}

/// Sort hits by descending score, breaking ties by ascending document id,
/// and keep the best `top_k`.
pub fn rank_hits(hits: &mut Vec<SearchHit>, top_k: usize) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.document_id.cmp(&b.document_id))
    });
    hits.truncate(top_k);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    /// TF-IDF weighted terms scored by cosine similarity.
    TfIdf,
    /// BM25 over an in-memory full-text index.
    Bm25,
    /// Chunked sentence embeddings in a persistent vector index.
    Chunked,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] =
        [EngineKind::TfIdf, EngineKind::Bm25, EngineKind::Chunked];

    pub fn name(self) -> &'static str {
        match self {
            EngineKind::TfIdf => "tfidf",
            EngineKind::Bm25 => "bm25",
            EngineKind::Chunked => "chunked",
        }
    }

    /// Construct an unloaded engine of this kind.
    pub fn build(self, settings: &Settings) -> Box<dyn SearchEngine> {
        match self {
            EngineKind::TfIdf => Box::new(TfIdfEngine::new()),
            EngineKind::Bm25 => Box::new(Bm25Engine::new()),
            EngineKind::Chunked => Box::new(chunked_engine(settings)),
        }
    }
}

/// The embedder selected by `settings`: the hashing embedder when offline,
/// otherwise the configured sentence-embedding model.
pub fn embedder_for(settings: &Settings) -> Box<dyn Embedder> {
    if settings.offline_embeddings {
        Box::new(HashingEmbedder::default())
    } else {
        Box::new(ModelManager::with_model_id(settings.model_id.clone()))
    }
}

/// An unloaded chunked vector engine configured from `settings`.
pub fn chunked_engine(settings: &Settings) -> ChunkedVectorEngine {
    ChunkedVectorEngine::new(
        embedder_for(settings),
        settings.vector_index.clone(),
        settings.vector.clone(),
    )
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tfidf" | "tf-idf" => Ok(EngineKind::TfIdf),
            "bm25" => Ok(EngineKind::Bm25),
            "chunked" | "vector" => Ok(EngineKind::Chunked),
            other => Err(format!(
                "unknown engine '{other}' (expected one of: tfidf, bm25, chunked)"
            )),
        }
    }
}

/// Build and load every requested engine against `store`.
pub fn load_engines(
    kinds: &[EngineKind],
    settings: &Settings,
    store: &DocStore,
) -> Result<Vec<Box<dyn SearchEngine>>> {
    let mut engines = Vec::with_capacity(kinds.len());
    for kind in kinds {
        info!(engine = kind.name(), "loading engine");
        let mut engine = kind.build(settings);
        engine.load(store)?;
        engines.push(engine);
    }
    Ok(engines)
}
