//! Semantic retrieval over chunked documents.
//!
//! `load` indexes only documents missing from the persistent chunk index,
//! embedding their chunks in fixed-size batches. `search` over-fetches
//! `top_k * overfetch` chunk hits and keeps, for each document, its closest
//! chunk. With a finite over-fetch factor this rollup can miss a document
//! whose best chunk ranks below the fetched window, so results approximate
//! the exhaustive per-document top-k.

use std::collections::HashMap;
use std::path::PathBuf;

use kdam::{BarExt, tqdm};
use tracing::{debug, info, warn};

use crate::chunk_index::{ChunkHit, ChunkIndex, NewChunk};
use crate::chunking::{ChunkingConfig, chunk_by_tokens};
use crate::doc_store::{DocStore, DocumentId};
use crate::embedding::Embedder;
use crate::engine::{SearchEngine, SearchHit};
use crate::error::{Error, Result};

/// Chunks embedded and committed per write transaction.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Chunk hits fetched per requested document.
pub const DEFAULT_OVERFETCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorSettings {
    pub chunking: ChunkingConfig,
    pub batch_size: usize,
    pub overfetch: usize,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            overfetch: DEFAULT_OVERFETCH,
        }
    }
}

/// Turn a cosine distance into a higher-is-better score.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance
}

/// Reduce chunk hits to one entry per document using the closest chunk,
/// then keep the `top_k` closest documents.
///
/// Ties are broken by ascending document id.
pub fn rollup_chunk_hits(hits: &[ChunkHit], top_k: usize) -> Vec<SearchHit> {
    let mut best: HashMap<DocumentId, f32> = HashMap::new();
    for hit in hits {
        best.entry(hit.document_id)
            .and_modify(|d| *d = d.min(hit.distance))
            .or_insert(hit.distance);
    }

    let mut documents: Vec<(DocumentId, f32)> = best.into_iter().collect();
    documents.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    documents.truncate(top_k);

    documents
        .into_iter()
        .map(|(document_id, distance)| SearchHit {
            document_id,
            score: distance_to_score(distance),
        })
        .collect()
}

/// A chunk waiting to be embedded.
struct PendingChunk {
    document_id: DocumentId,
    url: String,
    text: String,
    start_offset: usize,
    end_offset: usize,
    last_of_document: bool,
}

/// Counts from the most recent `load`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingReport {
    pub new_documents: usize,
    pub new_chunks: usize,
    pub batches: usize,
    pub orphans_removed: usize,
}

/// Chunked embedding engine.
///
/// Owns the chunk index handle between `load` and drop.
pub struct ChunkedVectorEngine {
    embedder: Box<dyn Embedder>,
    index_path: PathBuf,
    settings: VectorSettings,
    index: Option<ChunkIndex>,
    last_report: IndexingReport,
}

impl ChunkedVectorEngine {
    pub fn new(
        embedder: Box<dyn Embedder>,
        index_path: PathBuf,
        settings: VectorSettings,
    ) -> Self {
        Self {
            embedder,
            index_path,
            settings,
            index: None,
            last_report: IndexingReport::default(),
        }
    }

    pub fn last_report(&self) -> IndexingReport {
        self.last_report
    }

    fn chunk_documents(
        &self,
        store: &DocStore,
        index: &ChunkIndex,
    ) -> Result<(usize, Vec<PendingChunk>)> {
        let indexed = index.indexed_documents()?;
        let mut new_documents = 0;
        let mut pending = Vec::new();

        for doc in store.documents()? {
            if indexed.contains(&doc.id) {
                continue;
            }
            let offsets = self.embedder.token_offsets(&doc.text)?;
            let spans =
                chunk_by_tokens(&doc.text, &offsets, self.settings.chunking);
            if spans.is_empty() {
                debug!(document = doc.id, "document has no text to index");
                continue;
            }

            new_documents += 1;
            let last = spans.len() - 1;
            for (i, span) in spans.into_iter().enumerate() {
                pending.push(PendingChunk {
                    document_id: doc.id,
                    url: doc.url.clone(),
                    text: span.text,
                    start_offset: span.start_offset,
                    end_offset: span.end_offset,
                    last_of_document: i == last,
                });
            }
        }

        Ok((new_documents, pending))
    }

    fn write_batches(
        &self,
        index: &ChunkIndex,
        pending: &[PendingChunk],
    ) -> Result<usize> {
        let batch_size = self.settings.batch_size.max(1);
        let total = pending.len().div_ceil(batch_size);
        let mut bar = tqdm!(
            total = pending.len(),
            desc = "Embedding chunks",
            leave = false
        );

        for (i, batch) in pending.chunks(batch_size).enumerate() {
            let batch_error = |e: Error| Error::BatchWrite {
                batch: i + 1,
                total,
                reason: e.to_string(),
            };

            let texts: Vec<String> =
                batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = self.embedder.embed(&texts).map_err(batch_error)?;
            if embeddings.len() != batch.len() {
                return Err(Error::BatchWrite {
                    batch: i + 1,
                    total,
                    reason: format!(
                        "embedder returned {} vectors for {} chunks",
                        embeddings.len(),
                        batch.len()
                    ),
                });
            }

            let chunks: Vec<NewChunk<'_>> = batch
                .iter()
                .zip(&embeddings)
                .map(|(chunk, embedding)| NewChunk {
                    document_id: chunk.document_id,
                    url: &chunk.url,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                    last_of_document: chunk.last_of_document,
                    embedding,
                })
                .collect();
            index.insert_batch(&chunks).map_err(batch_error)?;

            bar.update(batch.len())?;
            info!(
                batch = i + 1,
                total,
                chunks = batch.len(),
                "committed vector index batch"
            );
        }
        bar.clear()?;

        Ok(total)
    }
}

impl SearchEngine for ChunkedVectorEngine {
    fn name(&self) -> &str {
        "chunked"
    }

    fn load(&mut self, store: &DocStore) -> Result<()> {
        // Release any previous handle before reopening the file.
        self.index = None;
        self.last_report = IndexingReport::default();

        if store.count()? == 0 {
            return Err(Error::EmptyCorpus {
                store: store.path().display().to_string(),
            });
        }

        let index = ChunkIndex::open(&self.index_path)?;
        let orphans_removed = index.remove_orphans()?;
        if orphans_removed > 0 {
            warn!(
                chunks = orphans_removed,
                "removed chunks left behind by an interrupted indexing run"
            );
        }

        let (new_documents, pending) = self.chunk_documents(store, &index)?;
        let mut report = IndexingReport {
            new_documents,
            new_chunks: pending.len(),
            batches: 0,
            orphans_removed,
        };

        if pending.is_empty() {
            info!(model = self.embedder.model_id(), "vector index is up to date");
        } else {
            info!(
                model = self.embedder.model_id(),
                documents = new_documents,
                chunks = pending.len(),
                "indexing new documents"
            );
            report.batches = self.write_batches(&index, &pending)?;
        }

        self.last_report = report;
        self.index = Some(index);
        Ok(())
    }

    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let index = self.index.as_ref().ok_or_else(|| Error::NotLoaded {
            engine: self.name().to_string(),
        })?;

        if top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embedder
            .embed(&[query.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Model("embedder returned no vector for the query".into())
            })?;

        let fetch = top_k.saturating_mul(self.settings.overfetch.max(1));
        let hits = index.nearest(&query_vector, fetch)?;
        Ok(rollup_chunk_hits(&hits, top_k))
    }
}

impl std::fmt::Debug for ChunkedVectorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedVectorEngine")
            .field("index_path", &self.index_path)
            .field("settings", &self.settings)
            .field("loaded", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::embedding::HashingEmbedder;

    fn hit(chunk_id: u64, document_id: i64, distance: f32) -> ChunkHit {
        ChunkHit {
            chunk_id,
            document_id,
            start_offset: 0,
            end_offset: 0,
            distance,
        }
    }

    /// Counts embedded texts and can be told to fail after some calls.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        embedded: Rc<Cell<usize>>,
        fail_on_call: Option<usize>,
        calls: Cell<usize>,
    }

    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>> {
            self.inner.token_offsets(text)
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.get() + 1;
            self.calls.set(call);
            if self.fail_on_call == Some(call) {
                return Err(Error::Model("backend unavailable".into()));
            }
            self.embedded.set(self.embedded.get() + texts.len());
            self.inner.embed(texts)
        }
    }

    fn counting_engine(
        path: PathBuf,
        settings: VectorSettings,
        fail_on_call: Option<usize>,
    ) -> (ChunkedVectorEngine, Rc<Cell<usize>>) {
        let embedded = Rc::new(Cell::new(0));
        let embedder = CountingEmbedder {
            inner: HashingEmbedder::default(),
            embedded: Rc::clone(&embedded),
            fail_on_call,
            calls: Cell::new(0),
        };
        (
            ChunkedVectorEngine::new(Box::new(embedder), path, settings),
            embedded,
        )
    }

    fn small_chunks() -> VectorSettings {
        VectorSettings {
            chunking: ChunkingConfig {
                max_tokens: 4,
                overlap: 1,
            },
            batch_size: 3,
            overfetch: 100,
        }
    }

    fn fixture() -> (tempfile::TempDir, DocStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = DocStore::create(&tmp.path().join("doc.db")).unwrap();
        store
            .insert(
                "Cats",
                "cats purr and cats sleep all day in the warm sun",
                "https://cats",
            )
            .unwrap();
        store
            .insert("Dogs", "dogs bark at the mail carrier", "https://dogs")
            .unwrap();
        store
            .insert("Rust", "rust borrow checker explained", "https://rust")
            .unwrap();
        (tmp, store)
    }

    #[test]
    fn rollup_keeps_best_chunk_per_document() {
        let hits = [hit(1, 7, 0.1), hit(2, 7, 0.3), hit(3, 8, 0.2)];
        let docs = rollup_chunk_hits(&hits, 10);

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].document_id, 7);
        assert_eq!(docs[0].score, distance_to_score(0.1));
        assert_eq!(docs[1].document_id, 8);
        assert_eq!(docs[1].score, distance_to_score(0.2));
    }

    #[test]
    fn rollup_truncates_and_breaks_ties_by_id() {
        let hits = [hit(1, 9, 0.5), hit(2, 4, 0.5), hit(3, 6, 0.9)];
        let docs = rollup_chunk_hits(&hits, 2);
        let ids: Vec<_> = docs.iter().map(|d| d.document_id).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn search_before_load_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (engine, _) =
            counting_engine(tmp.path().join("v.redb"), small_chunks(), None);
        assert!(matches!(
            engine.search("cats", 3).unwrap_err(),
            Error::NotLoaded { .. }
        ));
    }

    #[test]
    fn empty_store_fails_to_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DocStore::create(&tmp.path().join("doc.db")).unwrap();
        let (mut engine, _) =
            counting_engine(tmp.path().join("v.redb"), small_chunks(), None);
        assert!(matches!(
            engine.load(&store).unwrap_err(),
            Error::EmptyCorpus { .. }
        ));
    }

    #[test]
    fn load_indexes_in_batches_and_search_finds_documents() {
        let (tmp, store) = fixture();
        let (mut engine, embedded) =
            counting_engine(tmp.path().join("v.redb"), small_chunks(), None);
        engine.load(&store).unwrap();

        let report = engine.last_report();
        assert_eq!(report.new_documents, 3);
        assert!(report.new_chunks > 3);
        assert_eq!(report.batches, report.new_chunks.div_ceil(3));
        assert_eq!(embedded.get(), report.new_chunks);

        let hits = engine.search("dogs bark", 2).unwrap();
        assert!(hits.len() <= 2);
        assert_eq!(hits[0].document_id, 2);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn reload_only_embeds_new_documents() {
        let (tmp, store) = fixture();
        let path = tmp.path().join("v.redb");
        {
            let (mut engine, _) = counting_engine(path.clone(), small_chunks(), None);
            engine.load(&store).unwrap();
        }

        let (mut engine, embedded) =
            counting_engine(path.clone(), small_chunks(), None);
        engine.load(&store).unwrap();
        assert_eq!(embedded.get(), 0);
        assert_eq!(engine.last_report().new_documents, 0);

        store
            .insert("Birds", "birds sing at dawn", "https://birds")
            .unwrap();
        engine.load(&store).unwrap();
        assert_eq!(engine.last_report().new_documents, 1);
        assert_eq!(embedded.get(), engine.last_report().new_chunks);
    }

    #[test]
    fn failed_batch_is_fatal_and_retried_on_next_load() {
        let (tmp, store) = fixture();
        let path = tmp.path().join("v.redb");

        let (mut engine, _) = counting_engine(path.clone(), small_chunks(), Some(2));
        let err = engine.load(&store).unwrap_err();
        assert!(matches!(err, Error::BatchWrite { batch: 2, .. }));
        assert!(engine.search("cats", 1).is_err());
        drop(engine);

        let (mut engine, _) = counting_engine(path.clone(), small_chunks(), None);
        engine.load(&store).unwrap();
        let report = engine.last_report();
        assert!(report.new_documents >= 1);

        drop(engine);
        let index = ChunkIndex::open(&path).unwrap();
        assert_eq!(index.indexed_documents().unwrap().len(), 3);
    }
}
