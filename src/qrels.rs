use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::doc_store::DocumentId;
use crate::error::{Error, Result};
use crate::label_store::{Label, LabelStore};

/// Ground-truth judgments: query → document id → grade.
///
/// Serializes as `{"query": {"<id>": grade}}`, with document ids as string
/// keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Qrels(BTreeMap<String, BTreeMap<DocumentId, u8>>);

impl Qrels {
    /// Later labels for the same `(query, document_id)` replace earlier ones.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a Label>) -> Self {
        let mut qrels = BTreeMap::<String, BTreeMap<DocumentId, u8>>::new();
        for label in labels {
            qrels
                .entry(label.query.clone())
                .or_default()
                .insert(label.document_id, label.grade.value());
        }
        Self(qrels)
    }

    pub fn get(&self, query: &str, document_id: DocumentId) -> Option<u8> {
        self.0.get(query)?.get(&document_id).copied()
    }

    pub fn query(&self, query: &str) -> Option<&BTreeMap<DocumentId, u8>> {
        self.0.get(query)
    }

    pub fn queries(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&str, &BTreeMap<DocumentId, u8>)> {
        self.0.iter().map(|(q, docs)| (q.as_str(), docs))
    }

    /// Number of judged queries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of judgments.
    pub fn judgment_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    /// Keep only the given queries.
    pub fn restrict<S: AsRef<str>>(&self, queries: &[S]) -> Qrels {
        Qrels(
            queries
                .iter()
                .filter_map(|q| {
                    let q = q.as_ref();
                    self.0.get(q).map(|docs| (q.to_string(), docs.clone()))
                })
                .collect(),
        )
    }
}

/// Read every label in `store` into qrels.
pub fn export_qrels(store: &LabelStore) -> Result<Qrels> {
    Ok(Qrels::from_labels(&store.labels()?))
}

pub fn save_qrels(path: &Path, qrels: &Qrels) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, qrels)?;
    Ok(())
}

pub fn load_qrels(path: &Path) -> Result<Qrels> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "qrels file",
            name: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_store::Grade;

    fn label(query: &str, document_id: i64, grade: u8) -> Label {
        Label {
            query: query.to_string(),
            document_id,
            grade: Grade::new(grade).unwrap(),
            explanation: None,
        }
    }

    #[test]
    fn cats_store_exports_expected_json() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LabelStore::open(&tmp.path().join("labels.redb")).unwrap();
        store.insert(&label("cats", 1, 2)).unwrap();
        store.insert(&label("cats", 2, 0)).unwrap();

        let qrels = export_qrels(&store).unwrap();
        assert_eq!(
            serde_json::to_value(&qrels).unwrap(),
            serde_json::json!({"cats": {"1": 2, "2": 0}})
        );
    }

    #[test]
    fn every_inserted_label_is_exported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LabelStore::open(&tmp.path().join("labels.redb")).unwrap();
        let labels = [label("a", 3, 1), label("b", 3, 2), label("a", 9, 0)];
        for l in &labels {
            store.insert(l).unwrap();
        }

        let qrels = export_qrels(&store).unwrap();
        for l in &labels {
            assert_eq!(qrels.get(&l.query, l.document_id), Some(l.grade.value()));
        }
        assert_eq!(qrels.judgment_count(), 3);
    }

    #[test]
    fn duplicate_rows_resolve_to_the_last() {
        let labels = [label("q", 1, 0), label("q", 1, 2)];
        let qrels = Qrels::from_labels(&labels);
        assert_eq!(qrels.get("q", 1), Some(2));
        assert_eq!(qrels.judgment_count(), 1);
    }

    #[test]
    fn restrict_keeps_known_queries_only() {
        let labels = [label("a", 1, 1), label("b", 2, 1)];
        let qrels = Qrels::from_labels(&labels).restrict(&["b", "missing"]);
        assert_eq!(qrels.queries().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("qrels.json");
        let qrels = Qrels::from_labels(&[label("q", 5, 2)]);
        save_qrels(&path, &qrels).unwrap();
        assert_eq!(load_qrels(&path).unwrap(), qrels);

        assert!(matches!(
            load_qrels(&tmp.path().join("nope.json")),
            Err(Error::NotFound { .. })
        ));
    }
}
