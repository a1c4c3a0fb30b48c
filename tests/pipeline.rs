//! End-to-end run of pooling, annotation, qrels export and evaluation over
//! a small page database, with every engine and a keyword oracle.

use std::collections::BTreeMap;
use std::time::Duration;

use stashbench::annotate::annotate_with_oracle;
use stashbench::bm25::Bm25Engine;
use stashbench::embedding::HashingEmbedder;
use stashbench::evaluate::{QuerySubset, agreement, evaluate, evaluate_subsets};
use stashbench::metrics::Metric;
use stashbench::oracle::{Judgment, RelevanceOracle};
use stashbench::pool::{DedupKey, PoolEntry, build_pool};
use stashbench::qrels::export_qrels;
use stashbench::tfidf::TfIdfEngine;
use stashbench::vector_engine::{ChunkedVectorEngine, VectorSettings};
use stashbench::{DocStore, Grade, LabelStore, SearchEngine};

const PAGES: &[(&str, &str)] = &[
    ("Cat care", "cats need fresh water and a warm place to sleep"),
    ("Dog training", "dogs learn quickly with treats and patience"),
    ("Bread recipe", "a simple bread recipe with flour water salt and yeast"),
    ("Cats and dogs", "living with cats and dogs in a small flat"),
    ("Sourdough", "sourdough bread needs a lively starter and time"),
    ("Gardening", "tomatoes grow best in full sun with regular water"),
];

/// Grades 2 when the page contains every query word, 1 when it contains
/// some, 0 otherwise.
struct KeywordOracle;

impl RelevanceOracle for KeywordOracle {
    fn judge(
        &self,
        query: &str,
        document: &str,
    ) -> stashbench::Result<Judgment> {
        let words: Vec<&str> = query.split_whitespace().collect();
        let found = words.iter().filter(|w| document.contains(**w)).count();
        let grade = match found {
            0 => Grade::NOT_RELEVANT,
            n if n == words.len() => Grade::HIGHLY_RELEVANT,
            _ => Grade::RELEVANT,
        };
        Ok(Judgment {
            grade,
            explanation: None,
        })
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    store: DocStore,
    engines: Vec<Box<dyn SearchEngine>>,
    labels: LabelStore,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = DocStore::create(&tmp.path().join("doc.db")).unwrap();
    for (i, (title, text)) in PAGES.iter().enumerate() {
        store
            .insert(title, text, &format!("https://example.org/{i}"))
            .unwrap();
    }

    let mut settings = VectorSettings::default();
    settings.chunking.max_tokens = 4;
    settings.chunking.overlap = 1;
    settings.batch_size = 7;

    let mut engines: Vec<Box<dyn SearchEngine>> = vec![
        Box::new(TfIdfEngine::new()),
        Box::new(Bm25Engine::new()),
        Box::new(ChunkedVectorEngine::new(
            Box::new(HashingEmbedder::default()),
            tmp.path().join("vectors.redb"),
            settings,
        )),
    ];
    for engine in &mut engines {
        engine.load(&store).unwrap();
    }

    let labels = LabelStore::open(&tmp.path().join("labels.redb")).unwrap();
    Fixture {
        _tmp: tmp,
        store,
        engines,
        labels,
    }
}

fn queries() -> Vec<String> {
    ["cats", "bread recipe", "dogs"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[test]
fn every_engine_returns_known_documents() {
    let f = fixture();
    let known = f.store.document_map().unwrap();

    for engine in &f.engines {
        for query in queries() {
            let hits = engine.search(&query, 3).unwrap();
            assert!(hits.len() <= 3, "{} returned too many", engine.name());
            assert!(hits.iter().all(|h| known.contains_key(&h.document_id)));
            assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }
}

#[test]
fn pool_annotate_and_evaluate() {
    let f = fixture();
    let qs = queries();
    let top_k = 3;

    let build =
        build_pool(&f.store, &f.engines, &qs, top_k, DedupKey::Text).unwrap();
    assert!(build.failures.is_empty());
    assert!(build.entries.len() <= f.engines.len() * qs.len() * top_k);

    let summary =
        annotate_with_oracle(&build.entries, &f.labels, &KeywordOracle, Duration::ZERO)
            .unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.labeled as u64, f.labels.len().unwrap());

    let qrels = export_qrels(&f.labels).unwrap();
    for label in f.labels.labels().unwrap() {
        assert_eq!(
            qrels.get(&label.query, label.document_id),
            Some(label.grade.value())
        );
    }

    let metrics = Metric::defaults(top_k);
    let results = evaluate(&qrels, &build.entries, &metrics);
    for engine in ["tfidf", "bm25", "chunked"] {
        let scores = &results[engine];
        for metric in &metrics {
            let value = scores[&metric.to_string()];
            assert!((0.0..=1.0).contains(&value), "{engine} {metric} = {value}");
        }
    }
    // "cats" and "dogs" appear verbatim, so the lexical engines find
    // something relevant for every query.
    assert!(results["tfidf"]["AP"] > 0.0);
    assert!(results["bm25"]["AP"] > 0.0);

    let second_run =
        annotate_with_oracle(&build.entries, &f.labels, &KeywordOracle, Duration::ZERO)
            .unwrap();
    assert_eq!(second_run.labeled, 0);
}

#[test]
fn subset_evaluation_matches_slicing_the_full_pool() {
    let f = fixture();
    let qs = queries();
    let top_k = 3;

    let full = build_pool(&f.store, &f.engines, &qs, top_k, DedupKey::Text)
        .unwrap()
        .entries;
    annotate_with_oracle(&full, &f.labels, &KeywordOracle, Duration::ZERO)
        .unwrap();
    let qrels = export_qrels(&f.labels).unwrap();
    let metrics = vec![Metric::NdcgAt(top_k), Metric::AveragePrecision];

    let subsets = vec![
        QuerySubset {
            name: "animals".into(),
            queries: vec!["cats".into(), "dogs".into()],
        },
        QuerySubset {
            name: "food".into(),
            queries: vec!["bread recipe".into()],
        },
    ];
    let repooled = evaluate_subsets(
        &f.store,
        &f.engines,
        &qrels,
        &subsets,
        top_k,
        DedupKey::Text,
        &metrics,
    )
    .unwrap();

    for subset in &subsets {
        let sliced: Vec<PoolEntry> = full
            .iter()
            .filter(|e| subset.queries.contains(&e.query))
            .cloned()
            .collect();
        let expected =
            evaluate(&qrels.restrict(&subset.queries), &sliced, &metrics);
        assert_eq!(repooled[&subset.name], expected, "subset {}", subset.name);
    }
}

#[test]
fn a_store_agrees_with_itself() {
    let f = fixture();
    let pool = build_pool(&f.store, &f.engines, &queries(), 3, DedupKey::Text)
        .unwrap()
        .entries;
    annotate_with_oracle(&pool, &f.labels, &KeywordOracle, Duration::ZERO)
        .unwrap();

    assert_eq!(agreement(&f.labels, &f.labels).unwrap(), 1.0);
}

#[test]
fn pool_json_keeps_provenance() {
    let f = fixture();
    let pool = build_pool(&f.store, &f.engines, &queries(), 2, DedupKey::Id)
        .unwrap()
        .entries;

    let mut per_engine: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
    for entry in &pool {
        for (engine, hit) in &entry.sources {
            per_engine
                .entry((engine.as_str(), entry.query.as_str()))
                .or_default()
                .push(hit.rank.unwrap());
        }
    }
    for ranks in per_engine.values_mut() {
        ranks.sort_unstable();
        let expected: Vec<usize> = (1..=ranks.len()).collect();
        assert_eq!(*ranks, expected);
    }

    let json = serde_json::to_value(&pool).unwrap();
    let first = &json[0];
    assert!(first["sources"].as_object().unwrap().values().all(|s| s["score"].is_number()));
}
