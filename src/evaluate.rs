//! Per-engine evaluation of pooled runs against qrels, and agreement between
//! two label stores.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::doc_store::{DocStore, DocumentId};
use crate::engine::SearchEngine;
use crate::error::{Error, Result};
use crate::label_store::{Grade, Label, LabelStore};
use crate::metrics::{Metric, QueryRun, evaluate_run};
use crate::pool::{DedupKey, PoolEntry, build_pool};
use crate::qrels::Qrels;

/// query → document id → score, for one engine.
pub type Run = BTreeMap<String, QueryRun>;

/// engine name → metric name → mean score.
pub type Evaluation = BTreeMap<String, BTreeMap<String, f64>>;

/// Rebuild each engine's run from the provenance recorded in the pool.
pub fn extract_runs(pool: &[PoolEntry]) -> BTreeMap<String, Run> {
    let mut runs: BTreeMap<String, Run> = BTreeMap::new();
    for entry in pool {
        for (engine, hit) in &entry.sources {
            runs.entry(engine.clone())
                .or_default()
                .entry(entry.query.clone())
                .or_default()
                .insert(entry.document_id, hit.score);
        }
    }
    runs
}

/// Score every engine that contributed to `pool`.
pub fn evaluate(
    qrels: &Qrels,
    pool: &[PoolEntry],
    metrics: &[Metric],
) -> Evaluation {
    extract_runs(pool)
        .into_iter()
        .map(|(engine, run)| {
            let scores = evaluate_run(qrels, &run, metrics);
            debug!(engine = %engine, ?scores, "evaluated");
            (engine, scores)
        })
        .collect()
}

/// A named group of queries evaluated on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySubset {
    pub name: String,
    pub queries: Vec<String>,
}

/// Evaluate each subset by pooling its queries again and restricting the
/// qrels to them.
///
/// Results are computed independently per subset rather than sliced from a
/// full evaluation.
pub fn evaluate_subsets(
    store: &DocStore,
    engines: &[Box<dyn SearchEngine>],
    qrels: &Qrels,
    subsets: &[QuerySubset],
    top_k: usize,
    dedup: DedupKey,
    metrics: &[Metric],
) -> Result<BTreeMap<String, Evaluation>> {
    let mut results = BTreeMap::new();
    for subset in subsets {
        info!(
            subset = %subset.name,
            queries = subset.queries.len(),
            "evaluating query subset"
        );
        let pool = build_pool(store, engines, &subset.queries, top_k, dedup)?;
        let restricted = qrels.restrict(&subset.queries);
        results.insert(
            subset.name.clone(),
            evaluate(&restricted, &pool.entries, metrics),
        );
    }
    Ok(results)
}

fn label_map(labels: Vec<Label>) -> BTreeMap<(String, DocumentId), Grade> {
    labels
        .into_iter()
        .map(|l| ((l.query, l.document_id), l.grade))
        .collect()
}

/// Cohen's kappa between two stores that labeled exactly the same items.
///
/// Fails with [`Error::StoreMismatch`] when the labeled `(query,
/// document_id)` sets differ and with [`Error::EmptyComparison`] when both
/// are empty.
pub fn agreement(first: &LabelStore, second: &LabelStore) -> Result<f64> {
    agreement_from_labels(first.labels()?, second.labels()?)
}

pub fn agreement_from_labels(
    first: Vec<Label>,
    second: Vec<Label>,
) -> Result<f64> {
    let first = label_map(first);
    let second = label_map(second);

    let only_first = first.keys().filter(|k| !second.contains_key(*k)).count();
    let only_second = second.keys().filter(|k| !first.contains_key(*k)).count();
    if only_first > 0 || only_second > 0 {
        return Err(Error::StoreMismatch {
            only_first,
            only_second,
        });
    }
    if first.is_empty() {
        return Err(Error::EmptyComparison);
    }

    // Both maps iterate in the same key order.
    let pairs: Vec<(u8, u8)> = first
        .values()
        .zip(second.values())
        .map(|(a, b)| (a.value(), b.value()))
        .collect();
    Ok(cohens_kappa(&pairs))
}

/// Chance-corrected agreement over paired grades.
///
/// When chance agreement is already certain (both raters used one and the
/// same grade throughout) the raters agree perfectly and 1.0 is returned.
pub fn cohens_kappa(pairs: &[(u8, u8)]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let n = pairs.len() as f64;

    let observed = pairs.iter().filter(|(a, b)| a == b).count() as f64 / n;

    let categories: BTreeSet<u8> =
        pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
    let expected: f64 = categories
        .iter()
        .map(|&c| {
            let pa = pairs.iter().filter(|(a, _)| *a == c).count() as f64 / n;
            let pb = pairs.iter().filter(|(_, b)| *b == c).count() as f64 / n;
            pa * pb
        })
        .sum();

    if (1.0 - expected).abs() < f64::EPSILON {
        return 1.0;
    }
    (observed - expected) / (1.0 - expected)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disagreement {
    pub query: String,
    pub document_id: DocumentId,
    pub first: Grade,
    pub second: Grade,
}

/// Items labeled by both stores with different grades, sorted by key.
pub fn disagreements(
    first: &LabelStore,
    second: &LabelStore,
) -> Result<Vec<Disagreement>> {
    let second = label_map(second.labels()?);
    Ok(first
        .labels()?
        .into_iter()
        .filter_map(|l| {
            let other = *second.get(&(l.query.clone(), l.document_id))?;
            (other != l.grade).then(|| Disagreement {
                query: l.query,
                document_id: l.document_id,
                first: l.grade,
                second: other,
            })
        })
        .collect())
}
