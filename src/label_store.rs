use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use serde::{Deserialize, Serialize};

use crate::doc_store::DocumentId;
use crate::error::{Error, Result};

const LABELS: TableDefinition<(&str, i64), &[u8]> =
    TableDefinition::new("labels");

/// Relevance grade: 0 not relevant, 1 relevant, 2 highly relevant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct Grade(u8);

impl Grade {
    pub const NOT_RELEVANT: Grade = Grade(0);
    pub const RELEVANT: Grade = Grade(1);
    pub const HIGHLY_RELEVANT: Grade = Grade(2);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 2).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Whether the grade counts as relevant for binary metrics.
    pub fn is_relevant(self) -> bool {
        self.0 > 0
    }
}

impl TryFrom<u8> for Grade {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Grade::new(value).ok_or_else(|| Error::InvalidGrade(value.to_string()))
    }
}

impl TryFrom<i64> for Grade {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        u8::try_from(value)
            .ok()
            .and_then(Grade::new)
            .ok_or_else(|| Error::InvalidGrade(value.to_string()))
    }
}

impl From<Grade> for u8 {
    fn from(grade: Grade) -> u8 {
        grade.0
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub query: String,
    pub document_id: DocumentId,
    pub grade: Grade,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct LabelRecord {
    grade: Grade,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    explanation: Option<String>,
}

/// Append-only relevance labels keyed by `(query, document_id)`.
///
/// Every insert is its own write transaction, so an interrupted annotation
/// session keeps everything committed before the interruption.
pub struct LabelStore {
    db: Database,
}

impl LabelStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(LABELS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store a label unless one already exists for its key.
    ///
    /// Returns `false`, leaving the stored label untouched, when the key
    /// was already labeled.
    pub fn insert(&self, label: &Label) -> Result<bool> {
        let record = serde_json::to_vec(&LabelRecord {
            grade: label.grade,
            explanation: label.explanation.clone(),
        })?;
        let key = (label.query.as_str(), label.document_id);

        let txn = self.db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(LABELS)?;
            if table.get(key)?.is_some() {
                false
            } else {
                table.insert(key, record.as_slice())?;
                true
            }
        };
        txn.commit()?;
        Ok(inserted)
    }

    pub fn contains(&self, query: &str, document_id: DocumentId) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LABELS)?;
        Ok(table.get((query, document_id))?.is_some())
    }

    pub fn get(
        &self,
        query: &str,
        document_id: DocumentId,
    ) -> Result<Option<Label>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LABELS)?;
        let Some(guard) = table.get((query, document_id))? else {
            return Ok(None);
        };
        let record: LabelRecord = serde_json::from_slice(guard.value())?;
        Ok(Some(Label {
            query: query.to_string(),
            document_id,
            grade: record.grade,
            explanation: record.explanation,
        }))
    }

    /// Every label, sorted by query and then document id.
    pub fn labels(&self) -> Result<Vec<Label>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LABELS)?;
        let mut labels = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (query, document_id) = k.value();
            let record: LabelRecord = serde_json::from_slice(v.value())?;
            labels.push(Label {
                query: query.to_string(),
                document_id,
                grade: record.grade,
                explanation: record.explanation,
            });
        }
        Ok(labels)
    }

    pub fn labeled_keys(&self) -> Result<HashSet<(String, DocumentId)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LABELS)?;
        let mut keys = HashSet::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            let (query, document_id) = k.value();
            keys.insert((query.to_string(), document_id));
        }
        Ok(keys)
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LABELS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl fmt::Debug for LabelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelStore").finish_non_exhaustive()
    }
}
