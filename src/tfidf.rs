//! TF-IDF baseline: sparse term vectors compared by cosine similarity.
//!
//! Weights follow the smoothed formulation `idf(t) = ln((1 + n) / (1 + df(t))) + 1`
//! with raw term counts, and every vector is L2-normalized so the dot
//! product equals cosine similarity.

use std::collections::HashMap;

use rayon::prelude::*;
use tantivy::tokenizer::{
    LowerCaser,
    SimpleTokenizer,
    TextAnalyzer,
    TokenStream,
};

use crate::doc_store::{DocStore, DocumentId};
use crate::engine::{SearchEngine, SearchHit, rank_hits};
use crate::error::{Error, Result};

/// Single-character tokens carry no signal and are dropped.
const MIN_TERM_CHARS: usize = 2;

type SparseVector = Vec<(usize, f32)>;

fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .build()
}

fn tokenize(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut stream = analyzer.token_stream(text);
    while stream.advance() {
        let token = &stream.token().text;
        if token.chars().count() >= MIN_TERM_CHARS {
            tokens.push(token.clone());
        }
    }
    tokens
}

fn weigh(counts: HashMap<usize, u32>, idf: &[f32]) -> SparseVector {
    let mut vector: SparseVector = counts
        .into_iter()
        .map(|(term, tf)| (term, tf as f32 * idf[term]))
        .collect();
    // Fixed term order keeps the float sums identical for identical texts.
    vector.sort_by_key(|(term, _)| *term);

    let norm = vector.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
    if norm > 0.0 {
        for (_, w) in &mut vector {
            *w /= norm;
        }
    }
    vector
}

struct TermModel {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f32>,
    doc_ids: Vec<DocumentId>,
    vectors: Vec<SparseVector>,
}

impl TermModel {
    fn build(store: &DocStore) -> Result<Self> {
        let documents = store.documents()?;
        if documents.is_empty() {
            return Err(Error::EmptyCorpus {
                store: store.path().display().to_string(),
            });
        }

        let mut analyzer = analyzer();
        let mut vocabulary: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<u32> = Vec::new();
        let mut term_counts = Vec::with_capacity(documents.len());

        for doc in &documents {
            let mut counts: HashMap<usize, u32> = HashMap::new();
            for token in tokenize(&mut analyzer, &doc.text) {
                let next = vocabulary.len();
                let term = *vocabulary.entry(token).or_insert(next);
                if term == doc_freq.len() {
                    doc_freq.push(0);
                }
                *counts.entry(term).or_insert(0) += 1;
            }
            for &term in counts.keys() {
                doc_freq[term] += 1;
            }
            term_counts.push(counts);
        }

        let n = documents.len() as f32;
        let idf: Vec<f32> = doc_freq
            .iter()
            .map(|&df| ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0)
            .collect();

        let vectors = term_counts
            .into_iter()
            .map(|counts| weigh(counts, &idf))
            .collect();

        Ok(Self {
            vocabulary,
            idf,
            doc_ids: documents.iter().map(|d| d.id).collect(),
            vectors,
        })
    }

    fn query_vector(&self, query: &str) -> HashMap<usize, f32> {
        let mut counts: HashMap<usize, u32> = HashMap::new();
        for token in tokenize(&mut analyzer(), query) {
            if let Some(&term) = self.vocabulary.get(&token) {
                *counts.entry(term).or_insert(0) += 1;
            }
        }
        weigh(counts, &self.idf).into_iter().collect()
    }
}

pub struct TfIdfEngine {
    model: Option<TermModel>,
}

impl Default for TfIdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TfIdfEngine {
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn vocabulary_size(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.vocabulary.len())
    }
}

impl SearchEngine for TfIdfEngine {
    fn name(&self) -> &str {
        "tfidf"
    }

    fn load(&mut self, store: &DocStore) -> Result<()> {
        self.model = None;
        let model = TermModel::build(store)?;
        tracing::debug!(
            documents = model.doc_ids.len(),
            terms = model.vocabulary.len(),
            "built tf-idf model"
        );
        self.model = Some(model);
        Ok(())
    }

    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let model = self.model.as_ref().ok_or_else(|| Error::NotLoaded {
            engine: self.name().to_string(),
        })?;

        let query_vector = model.query_vector(query);
        if query_vector.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = model
            .vectors
            .par_iter()
            .zip(model.doc_ids.par_iter())
            .filter_map(|(vector, &document_id)| {
                let score: f32 = vector
                    .iter()
                    .filter_map(|(term, w)| query_vector.get(term).map(|q| q * w))
                    .sum();
                (score > 0.0).then_some(SearchHit { document_id, score })
            })
            .collect();

        rank_hits(&mut hits, top_k);
        Ok(hits)
    }
}

impl std::fmt::Debug for TfIdfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfIdfEngine")
            .field("loaded", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(texts: &[&str]) -> (tempfile::TempDir, DocStore, Vec<i64>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = DocStore::create(&tmp.path().join("doc.db")).unwrap();
        let ids = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                store
                    .insert(&format!("doc {i}"), text, &format!("https://d/{i}"))
                    .unwrap()
                    .unwrap()
            })
            .collect();
        (tmp, store, ids)
    }

    #[test]
    fn search_before_load_fails() {
        let engine = TfIdfEngine::new();
        let err = engine.search("cats", 5).unwrap_err();
        assert!(matches!(err, Error::NotLoaded { .. }));
    }

    #[test]
    fn empty_store_fails_to_load() {
        let (_tmp, store, _) = fixture(&[]);
        let mut engine = TfIdfEngine::new();
        let err = engine.load(&store).unwrap_err();
        assert!(matches!(err, Error::EmptyCorpus { .. }));
    }

    #[test]
    fn ranks_matching_documents_first() {
        let (_tmp, store, ids) = fixture(&[
            "Cats are wonderful pets, cats purr",
            "Dogs are loyal companions",
            "A short note on cats and dogs",
        ]);
        let mut engine = TfIdfEngine::new();
        engine.load(&store).unwrap();

        let hits = engine.search("CATS", 10).unwrap();
        let found: Vec<_> = hits.iter().map(|h| h.document_id).collect();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0], ids[0]);
        assert!(found.contains(&ids[2]));
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn respects_top_k() {
        let (_tmp, store, _) =
            fixture(&["rust code", "rust book", "rust crate", "rust fmt"]);
        let mut engine = TfIdfEngine::new();
        engine.load(&store).unwrap();

        assert_eq!(engine.search("rust", 2).unwrap().len(), 2);
        assert!(engine.search("rust", 0).unwrap().is_empty());
    }

    #[test]
    fn unknown_terms_return_nothing() {
        let (_tmp, store, _) = fixture(&["alpha beta", "gamma delta"]);
        let mut engine = TfIdfEngine::new();
        engine.load(&store).unwrap();

        assert!(engine.search("zebra", 5).unwrap().is_empty());
        assert!(engine.search("", 5).unwrap().is_empty());
    }

    #[test]
    fn identical_documents_tie_in_id_order() {
        let (_tmp, store, ids) =
            fixture(&["same words here", "other text", "same words here"]);
        let mut engine = TfIdfEngine::new();
        engine.load(&store).unwrap();

        let hits = engine.search("same words", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, ids[0]);
        assert_eq!(hits[1].document_id, ids[2]);
    }

    #[test]
    fn reload_picks_up_new_documents() {
        let (_tmp, store, _) = fixture(&["first page"]);
        let mut engine = TfIdfEngine::new();
        engine.load(&store).unwrap();
        assert!(engine.search("second", 5).unwrap().is_empty());

        store.insert("two", "second page", "https://d/two").unwrap();
        engine.load(&store).unwrap();
        assert_eq!(engine.search("second", 5).unwrap().len(), 1);
    }
}
