//! Read access to the archived page database.
//!
//! The archiving host owns the `pages` table; everything in this crate only
//! reads `SELECT id, title, text, url[, timestamp] FROM pages`. The write
//! helpers exist for merging several page databases into one and for
//! building fixtures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde::Serialize;

use crate::error::{Error, Result};

/// Row id of a page in the document store.
pub type DocumentId = i64;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS pages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT,
        text TEXT,
        url TEXT UNIQUE,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
    )";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub text: String,
    pub url: String,
    pub created_at: Option<String>,
}

/// Counts reported by [`DocStore::merge_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct DocStore {
    conn: Connection,
    path: PathBuf,
    has_timestamp: bool,
}

impl DocStore {
    /// Open an existing page database read-only.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "document store",
                name: path.display().to_string(),
            });
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn, path)
    }

    /// Open a page database for writing, creating the `pages` table if it
    /// does not exist yet.
    pub fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Self::from_connection(conn, path)
    }

    fn from_connection(conn: Connection, path: &Path) -> Result<Self> {
        // Older archives were created before pages carried a timestamp.
        let has_timestamp = {
            let stmt = conn.prepare("SELECT * FROM pages LIMIT 0")?;
            stmt.column_names().contains(&"timestamp")
        };

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            has_timestamp,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn select_sql(&self) -> String {
        let timestamp = if self.has_timestamp {
            "CAST(timestamp AS TEXT)"
        } else {
            "NULL"
        };
        format!(
            "SELECT id, COALESCE(title, ''), COALESCE(text, ''), \
             COALESCE(url, ''), {timestamp} FROM pages"
        )
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<Document> {
        Ok(Document {
            id: row.get(0)?,
            title: row.get(1)?,
            text: row.get(2)?,
            url: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    /// All documents, ordered by id.
    pub fn documents(&self) -> Result<Vec<Document>> {
        let sql = format!("{} ORDER BY id", self.select_sql());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::read_row)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }

    /// All documents keyed by id, read in a single pass.
    pub fn document_map(&self) -> Result<HashMap<DocumentId, Document>> {
        Ok(self
            .documents()?
            .into_iter()
            .map(|doc| (doc.id, doc))
            .collect())
    }

    pub fn get(&self, id: DocumentId) -> Result<Option<Document>> {
        let sql = format!("{} WHERE id = ?1", self.select_sql());
        Ok(self
            .conn
            .query_row(&sql, params![id], Self::read_row)
            .optional()?)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Insert a page unless one with the same url already exists.
    ///
    /// Returns the new row id, or `None` when the url was already present.
    pub fn insert(
        &self,
        title: &str,
        text: &str,
        url: &str,
    ) -> Result<Option<DocumentId>> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO pages (title, text, url) VALUES (?1, ?2, ?3)",
            params![title, text, url],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    /// Copy every page of `other` into this store, skipping urls that are
    /// already present. Runs in a single transaction.
    pub fn merge_from(&mut self, other: &DocStore) -> Result<MergeSummary> {
        let documents = other.documents()?;
        let mut summary = MergeSummary::default();

        let txn = self.conn.transaction()?;
        {
            let mut stmt = txn.prepare(
                "INSERT OR IGNORE INTO pages (title, text, url, timestamp) \
                 VALUES (?1, ?2, ?3, COALESCE(?4, CURRENT_TIMESTAMP))",
            )?;
            for doc in &documents {
                let changed = stmt.execute(params![
                    doc.title,
                    doc.text,
                    doc.url,
                    doc.created_at
                ])?;
                if changed == 0 {
                    summary.duplicates += 1;
                } else {
                    summary.inserted += 1;
                }
            }
        }
        txn.commit()?;

        Ok(summary)
    }
}

impl std::fmt::Debug for DocStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
