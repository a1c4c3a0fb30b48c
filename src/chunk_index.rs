//! Persistent store of chunk embeddings.
//!
//! A document counts as indexed once it appears in the `documents` table.
//! That row is written in the same transaction as the document's last
//! chunk, so a document whose chunks were split across batches and whose
//! later batch failed is never marked indexed; its leftover chunks are
//! dropped by [`ChunkIndex::remove_orphans`] before the next indexing run.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::doc_store::DocumentId;
use crate::embedding::cosine_distance;
use crate::error::{Error, Result};

const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");
const DOCUMENTS: TableDefinition<i64, &str> = TableDefinition::new("documents");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_CHUNK_ID: &str = "next_chunk_id";

/// Header: 8 bytes document id + 4 bytes start + 4 bytes end + 4 bytes dimension.
const HEADER_SIZE: usize = 20;

/// A chunk ready to be written, with its embedding.
#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub document_id: DocumentId,
    pub url: &'a str,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Whether this is the final chunk of its document.
    pub last_of_document: bool,
    pub embedding: &'a [f32],
}

/// A chunk returned by a nearest-neighbour scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHit {
    pub chunk_id: u64,
    pub document_id: DocumentId,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Cosine distance to the query; lower is closer.
    pub distance: f32,
}

// Max-heap ordering on distance so the worst kept hit is on top.
struct Candidate(ChunkHit);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then(self.0.chunk_id.cmp(&other.0.chunk_id))
    }
}

struct ChunkRecord<'a> {
    document_id: DocumentId,
    start_offset: usize,
    end_offset: usize,
    embedding: &'a [u8],
}

fn encode_chunk(chunk: &NewChunk<'_>) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(chunk.embedding));
    bytes.extend_from_slice(&chunk.document_id.to_le_bytes());
    bytes.extend_from_slice(&(chunk.start_offset as u32).to_le_bytes());
    bytes.extend_from_slice(&(chunk.end_offset as u32).to_le_bytes());
    bytes.extend_from_slice(&(chunk.embedding.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(chunk.embedding));
    bytes
}

fn decode_chunk(bytes: &[u8]) -> Option<ChunkRecord<'_>> {
    let (header, embedding) = bytes.split_at_checked(HEADER_SIZE)?;
    let document_id = i64::from_le_bytes(header[0..8].try_into().ok()?);
    let start = u32::from_le_bytes(header[8..12].try_into().ok()?);
    let end = u32::from_le_bytes(header[12..16].try_into().ok()?);
    let dimension = u32::from_le_bytes(header[16..20].try_into().ok()?);

    if embedding.len() != dimension as usize * 4 {
        return None;
    }

    Some(ChunkRecord {
        document_id,
        start_offset: start as usize,
        end_offset: end as usize,
        embedding,
    })
}

/// Chunk embeddings keyed by a sequential chunk id.
///
/// Binary format per chunk:
/// - 8 bytes: document id (i64 LE)
/// - 4 bytes: start byte offset (u32 LE)
/// - 4 bytes: end byte offset (u32 LE)
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct ChunkIndex {
    db: Database,
}

impl ChunkIndex {
    /// Open or create a chunk index at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use stashbench::chunk_index::ChunkIndex;
    ///
    /// let index = ChunkIndex::open(&tmp.path().join("vectors.redb")).unwrap();
    /// assert_eq!(index.chunk_count().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(CHUNKS)?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(META)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Ids of every fully indexed document.
    pub fn indexed_documents(&self) -> Result<HashSet<DocumentId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut ids = HashSet::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            ids.insert(k.value());
        }
        Ok(ids)
    }

    pub fn document_url(&self, document_id: DocumentId) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.get(document_id)?.map(|v| v.value().to_string()))
    }

    pub fn chunk_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;
        Ok(table.len()?)
    }

    /// Write a batch of chunks in a single transaction.
    ///
    /// Either every chunk of the batch is stored or none is. Documents whose
    /// last chunk is in the batch are marked as indexed.
    pub fn insert_batch(&self, chunks: &[NewChunk<'_>]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META)?;
            let mut next_id =
                meta.get(NEXT_CHUNK_ID)?.map(|v| v.value()).unwrap_or(0);

            let mut table = txn.open_table(CHUNKS)?;
            let mut documents = txn.open_table(DOCUMENTS)?;
            for chunk in chunks {
                table.insert(next_id, encode_chunk(chunk).as_slice())?;
                next_id += 1;
                if chunk.last_of_document {
                    documents.insert(chunk.document_id, chunk.url)?;
                }
            }

            meta.insert(NEXT_CHUNK_ID, next_id)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete chunks whose document was never marked as indexed.
    ///
    /// Returns the number of chunks removed.
    pub fn remove_orphans(&self) -> Result<usize> {
        let indexed = self.indexed_documents()?;

        let orphans: Vec<u64> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(CHUNKS)?;
            let mut orphans = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let keep = decode_chunk(v.value())
                    .is_some_and(|r| indexed.contains(&r.document_id));
                if !keep {
                    orphans.push(k.value());
                }
            }
            orphans
        };

        if orphans.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHUNKS)?;
            for &chunk_id in &orphans {
                table.remove(chunk_id)?;
            }
        }
        txn.commit()?;
        Ok(orphans.len())
    }

    /// The `limit` chunks closest to `query` by cosine distance, closest
    /// first. Exhaustive scan.
    pub fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<ChunkHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(limit + 1);
        for entry in table.iter()? {
            let (k, v) = entry?;
            let bytes = v.value();
            let record = decode_chunk(bytes).ok_or_else(|| {
                Error::Config(format!("corrupt chunk record {}", k.value()))
            })?;
            if record.embedding.len() != query.len() * 4 {
                return Err(Error::Config(format!(
                    "chunk {} has dimension {}, query has {}",
                    k.value(),
                    record.embedding.len() / 4,
                    query.len()
                )));
            }

            // The record slice is not guaranteed to be 4-byte aligned.
            let embedding: Vec<f32> = record
                .embedding
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            heap.push(Candidate(ChunkHit {
                chunk_id: k.value(),
                document_id: record.document_id,
                start_offset: record.start_offset,
                end_offset: record.end_offset,
                distance: cosine_distance(query, &embedding),
            }));
            if heap.len() > limit {
                heap.pop();
            }
        }

        Ok(heap.into_sorted_vec().into_iter().map(|c| c.0).collect())
    }
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkIndex").finish_non_exhaustive()
    }
}
