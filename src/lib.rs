//! stashbench - offline benchmark for search over a personal web archive.
//!
//! stashbench runs several retrieval engines (TF-IDF, BM25 via
//! [Tantivy](https://github.com/quickwit-oss/tantivy), and chunked sentence
//! embeddings) over the page database of a web archive, pools their top
//! results, collects graded relevance labels from a language-model oracle or
//! a human reviewer, and scores every engine with trec-style metrics.
//!
//! # Quick start
//!
//! ```no_run
//! use stashbench::{DataDir, DocStore, EngineKind, LabelStore, Settings};
//! use stashbench::evaluate::evaluate;
//! use stashbench::metrics::Metric;
//! use stashbench::pool::{DedupKey, build_pool};
//! use stashbench::qrels::export_qrels;
//! use stashbench::settings::SettingsOverrides;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let settings =
//!     Settings::resolve(&data_dir, SettingsOverrides::default()).unwrap();
//! let store = DocStore::open(&settings.doc_db).unwrap();
//!
//! let engines =
//!     stashbench::engine::load_engines(&EngineKind::ALL, &settings, &store)
//!         .unwrap();
//! let queries = vec!["sourdough starter".to_string()];
//! let pool = build_pool(&store, &engines, &queries, 10, DedupKey::Text)
//!     .unwrap();
//!
//! let labels = LabelStore::open(&data_dir.root().join("labels.redb")).unwrap();
//! let qrels = export_qrels(&labels).unwrap();
//! let results = evaluate(&qrels, &pool.entries, &Metric::defaults(10));
//! for (engine, scores) in &results {
//!     println!("{engine}: {scores:?}");
//! }
//! ```

pub mod annotate;
pub mod bm25;
pub mod chunk_index;
pub mod chunking;
pub mod data_dir;
pub mod doc_store;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod label_store;
pub mod metrics;
pub mod model_manager;
pub mod oracle;
pub mod pool;
pub mod qrels;
pub mod queries;
pub mod settings;
pub mod tfidf;
pub mod vector_engine;

pub use data_dir::DataDir;
pub use doc_store::{DocStore, Document, DocumentId};
pub use engine::{EngineKind, SearchEngine, SearchHit};
pub use error::{Error, Result};
pub use label_store::{Grade, Label, LabelStore};
pub use model_manager::ModelManager;
pub use pool::PoolEntry;
pub use qrels::Qrels;
pub use settings::Settings;
