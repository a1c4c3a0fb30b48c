//! Annotation pool: the merged, de-duplicated top-k results of every engine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::doc_store::{DocStore, DocumentId};
use crate::engine::SearchEngine;
use crate::error::{Error, Result};

/// Rank and score one engine gave a pooled document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceHit {
    /// 1-based position in the engine's result list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    pub score: f32,
}

/// One judgment candidate.
///
/// Pool files written by earlier tooling used `id` and `document` for the
/// id and text fields; both spellings are accepted when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub query: String,
    #[serde(alias = "id")]
    pub document_id: DocumentId,
    #[serde(alias = "document")]
    pub document_text: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub sources: BTreeMap<String, SourceHit>,
}

/// What makes two hits for the same query the same pool entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DedupKey {
    /// Identical page text collapses into one entry, keeping the first id.
    #[default]
    Text,
    /// Every document id gets its own entry.
    Id,
}

impl FromStr for DedupKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(DedupKey::Text),
            "id" => Ok(DedupKey::Id),
            other => Err(format!("unknown dedup key '{other}' (expected text or id)")),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DedupKey::Text => "text",
            DedupKey::Id => "id",
        })
    }
}

#[derive(Hash, PartialEq, Eq)]
enum EntryKey<'a> {
    Text(&'a str, &'a str),
    Id(&'a str, DocumentId),
}

/// A single engine/query pair that produced no results because it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolFailure {
    pub engine: String,
    pub query: String,
    pub reason: String,
}

impl From<PoolFailure> for Error {
    fn from(f: PoolFailure) -> Self {
        Error::EngineQuery {
            engine: f.engine,
            query: f.query,
            reason: f.reason,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoolBuild {
    /// Entries in discovery order.
    pub entries: Vec<PoolEntry>,
    pub failures: Vec<PoolFailure>,
    /// Successful engine/query pairs.
    pub searches: usize,
    /// Hits whose document id is no longer in the store.
    pub unknown_hits: usize,
}

impl fmt::Display for PoolBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pool entries from {} searches ({} failed, {} unknown documents skipped)",
            self.entries.len(),
            self.searches,
            self.failures.len(),
            self.unknown_hits
        )
    }
}

/// Run every query through every engine and merge the hits.
///
/// The document table is read once up front. A failing engine/query pair is
/// logged and recorded in [`PoolBuild::failures`]; it never aborts the
/// build. Each engine records its own rank and score on every entry it
/// retrieved, including entries another engine created first.
pub fn build_pool(
    store: &DocStore,
    engines: &[Box<dyn SearchEngine>],
    queries: &[String],
    top_k: usize,
    dedup: DedupKey,
) -> Result<PoolBuild> {
    let documents = store.document_map()?;

    let mut build = PoolBuild::default();
    let mut positions: HashMap<EntryKey<'_>, usize> = HashMap::new();

    for engine in engines {
        let name = engine.name();
        for query in queries {
            let hits = match engine.search(query, top_k) {
                Ok(hits) => hits,
                Err(e) => {
                    let failure = PoolFailure {
                        engine: name.to_string(),
                        query: query.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", Error::from(failure.clone()));
                    build.failures.push(failure);
                    continue;
                }
            };
            build.searches += 1;

            for (position, hit) in hits.iter().enumerate() {
                let Some(doc) = documents.get(&hit.document_id) else {
                    debug!(
                        engine = name,
                        document = hit.document_id,
                        "skipping hit for unknown document"
                    );
                    build.unknown_hits += 1;
                    continue;
                };

                let key = match dedup {
                    DedupKey::Text => EntryKey::Text(query, &doc.text),
                    DedupKey::Id => EntryKey::Id(query, doc.id),
                };
                let index = *positions.entry(key).or_insert_with(|| {
                    build.entries.push(PoolEntry {
                        query: query.clone(),
                        document_id: doc.id,
                        document_text: doc.text.clone(),
                        title: doc.title.clone(),
                        url: doc.url.clone(),
                        sources: BTreeMap::new(),
                    });
                    build.entries.len() - 1
                });

                // An engine that returns two ids with the same text keeps its
                // better rank for the merged entry.
                build.entries[index]
                    .sources
                    .entry(name.to_string())
                    .or_insert(SourceHit {
                        rank: Some(position + 1),
                        score: hit.score,
                    });
            }
        }
    }

    info!("{build}");
    Ok(build)
}

pub fn save_pool(path: &Path, entries: &[PoolEntry]) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, entries)?;
    Ok(())
}

pub fn load_pool(path: &Path) -> Result<Vec<PoolEntry>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "pool file",
            name: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
