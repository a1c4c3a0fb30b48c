use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("document store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("oracle request failed: {0}")]
    Oracle(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("engine '{engine}' was used before load()")]
    NotLoaded { engine: String },

    #[error("document store {store} contains no documents")]
    EmptyCorpus { store: String },

    #[error("engine '{engine}' failed on query '{query}': {reason}")]
    EngineQuery {
        engine: String,
        query: String,
        reason: String,
    },

    #[error("invalid relevance grade: {0:?}")]
    InvalidGrade(String),

    #[error(
        "label stores cover different items \
         ({only_first} only in the first, {only_second} only in the second)"
    )]
    StoreMismatch {
        only_first: usize,
        only_second: usize,
    },

    #[error("label stores are empty, nothing to compare")]
    EmptyComparison,

    #[error("vector index batch {batch}/{total} failed: {reason}")]
    BatchWrite {
        batch: usize,
        total: usize,
        reason: String,
    },
}
