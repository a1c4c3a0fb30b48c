//! Trec-style relevance metrics.
//!
//! Runs are ranked by descending score with ties broken by descending
//! document id, which is how `trec_eval` orders equal scores. Gains are the
//! raw grades. A document counts as relevant when its grade is above zero.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::doc_store::DocumentId;
use crate::qrels::Qrels;

/// One engine's scores for one query.
pub type QueryRun = BTreeMap<DocumentId, f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// nDCG over the first `k` results.
    NdcgAt(usize),
    /// nDCG over the whole ranking.
    Ndcg,
    AveragePrecision,
    PrecisionAt(usize),
    RecallAt(usize),
    ReciprocalRank,
}

impl Metric {
    /// The default metric set for a pool built with `top_k`.
    pub fn defaults(top_k: usize) -> Vec<Metric> {
        vec![Metric::NdcgAt(top_k), Metric::AveragePrecision]
    }

    /// Score one query's ranking against its judgments.
    pub fn score(
        self,
        judgments: &BTreeMap<DocumentId, u8>,
        ranking: &[DocumentId],
    ) -> f64 {
        match self {
            Metric::NdcgAt(k) => ndcg(judgments, ranking, Some(k)),
            Metric::Ndcg => ndcg(judgments, ranking, None),
            Metric::AveragePrecision => average_precision(judgments, ranking),
            Metric::PrecisionAt(k) => precision_at(judgments, ranking, k),
            Metric::RecallAt(k) => recall_at(judgments, ranking, k),
            Metric::ReciprocalRank => reciprocal_rank(judgments, ranking),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::NdcgAt(k) => write!(f, "nDCG@{k}"),
            Metric::Ndcg => f.write_str("nDCG"),
            Metric::AveragePrecision => f.write_str("AP"),
            Metric::PrecisionAt(k) => write!(f, "P@{k}"),
            Metric::RecallAt(k) => write!(f, "R@{k}"),
            Metric::ReciprocalRank => f.write_str("RR"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let cutoff = |rest: &str| {
            rest.parse::<usize>()
                .ok()
                .filter(|&k| k > 0)
                .ok_or_else(|| format!("invalid cutoff in metric '{s}'"))
        };

        match lower.split_once('@') {
            Some(("ndcg", rest)) => Ok(Metric::NdcgAt(cutoff(rest)?)),
            Some(("p", rest)) => Ok(Metric::PrecisionAt(cutoff(rest)?)),
            Some(("r", rest)) => Ok(Metric::RecallAt(cutoff(rest)?)),
            Some(_) => Err(format!("unknown metric '{s}'")),
            None => match lower.as_str() {
                "ndcg" => Ok(Metric::Ndcg),
                "ap" | "map" => Ok(Metric::AveragePrecision),
                "rr" | "mrr" => Ok(Metric::ReciprocalRank),
                _ => Err(format!(
                    "unknown metric '{s}' (expected nDCG, nDCG@k, AP, P@k, R@k or RR)"
                )),
            },
        }
    }
}

/// Document ids of `run` in rank order.
pub fn ranking(run: &QueryRun) -> Vec<DocumentId> {
    let mut scored: Vec<(DocumentId, f32)> =
        run.iter().map(|(&id, &score)| (id, score)).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
    scored.into_iter().map(|(id, _)| id).collect()
}

fn gain(judgments: &BTreeMap<DocumentId, u8>, id: DocumentId) -> f64 {
    judgments.get(&id).copied().unwrap_or(0) as f64
}

fn relevant_count(judgments: &BTreeMap<DocumentId, u8>) -> usize {
    judgments.values().filter(|&&g| g > 0).count()
}

fn dcg(gains: impl Iterator<Item = f64>) -> f64 {
    gains
        .enumerate()
        .map(|(i, g)| g / ((i + 2) as f64).log2())
        .sum()
}

pub fn ndcg(
    judgments: &BTreeMap<DocumentId, u8>,
    ranking: &[DocumentId],
    k: Option<usize>,
) -> f64 {
    let cut = k.unwrap_or(usize::MAX);

    let mut ideal: Vec<f64> = judgments
        .values()
        .filter(|&&g| g > 0)
        .map(|&g| g as f64)
        .collect();
    ideal.sort_by(|a, b| b.total_cmp(a));
    let ideal = dcg(ideal.into_iter().take(cut));
    if ideal == 0.0 {
        return 0.0;
    }

    dcg(ranking.iter().take(cut).map(|&id| gain(judgments, id))) / ideal
}

pub fn average_precision(
    judgments: &BTreeMap<DocumentId, u8>,
    ranking: &[DocumentId],
) -> f64 {
    let total = relevant_count(judgments);
    if total == 0 {
        return 0.0;
    }

    let mut hits = 0usize;
    let mut sum = 0.0;
    for (i, id) in ranking.iter().enumerate() {
        if gain(judgments, *id) > 0.0 {
            hits += 1;
            sum += hits as f64 / (i + 1) as f64;
        }
    }
    sum / total as f64
}

pub fn precision_at(
    judgments: &BTreeMap<DocumentId, u8>,
    ranking: &[DocumentId],
    k: usize,
) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let hits = ranking
        .iter()
        .take(k)
        .filter(|&&id| gain(judgments, id) > 0.0)
        .count();
    hits as f64 / k as f64
}

pub fn recall_at(
    judgments: &BTreeMap<DocumentId, u8>,
    ranking: &[DocumentId],
    k: usize,
) -> f64 {
    let total = relevant_count(judgments);
    if total == 0 {
        return 0.0;
    }
    let hits = ranking
        .iter()
        .take(k)
        .filter(|&&id| gain(judgments, id) > 0.0)
        .count();
    hits as f64 / total as f64
}

pub fn reciprocal_rank(
    judgments: &BTreeMap<DocumentId, u8>,
    ranking: &[DocumentId],
) -> f64 {
    ranking
        .iter()
        .position(|&id| gain(judgments, id) > 0.0)
        .map_or(0.0, |i| 1.0 / (i + 1) as f64)
}

/// Mean of each metric over every query in `qrels`.
///
/// A judged query missing from `run` scores zero on every metric. A metric
/// listed more than once is computed once.
pub fn evaluate_run(
    qrels: &Qrels,
    run: &BTreeMap<String, QueryRun>,
    metrics: &[Metric],
) -> BTreeMap<String, f64> {
    let metrics: BTreeSet<Metric> = metrics.iter().copied().collect();
    let mut totals: BTreeMap<String, f64> =
        metrics.iter().map(|m| (m.to_string(), 0.0)).collect();
    if qrels.is_empty() {
        return totals;
    }

    for (query, judgments) in qrels.iter() {
        let Some(query_run) = run.get(query) else {
            continue;
        };
        let ranked = ranking(query_run);
        for metric in &metrics {
            if let Some(total) = totals.get_mut(&metric.to_string()) {
                *total += metric.score(judgments, &ranked);
            }
        }
    }

    let n = qrels.len() as f64;
    for value in totals.values_mut() {
        *value /= n;
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn judgments(pairs: &[(i64, u8)]) -> BTreeMap<DocumentId, u8> {
        pairs.iter().copied().collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn metric_names_parse_and_display() {
        for name in ["nDCG@10", "nDCG", "AP", "P@5", "R@20", "RR"] {
            assert_eq!(name.parse::<Metric>().unwrap().to_string(), name);
        }
        assert_eq!("map".parse::<Metric>().unwrap(), Metric::AveragePrecision);
        assert!("ndcg@0".parse::<Metric>().is_err());
        assert!("ndcg@x".parse::<Metric>().is_err());
        assert!("bpref".parse::<Metric>().is_err());
    }

    #[test]
    fn ranking_breaks_ties_by_descending_id() {
        let run: QueryRun = [(1, 0.5), (2, 0.5), (3, 0.9)].into_iter().collect();
        assert_eq!(ranking(&run), vec![3, 2, 1]);
    }

    #[test]
    fn perfect_ranking_has_unit_ndcg() {
        let j = judgments(&[(1, 2), (2, 1), (3, 0)]);
        assert!(close(ndcg(&j, &[1, 2, 3], Some(10)), 1.0));
        assert!(close(ndcg(&j, &[1, 2], None), 1.0));
    }

    #[test]
    fn ndcg_with_linear_gain() {
        let j = judgments(&[(1, 2), (2, 1)]);
        // DCG = 1 + 2 / log2(3); IDCG = 2 + 1 / log2(3)
        let expected = (1.0 + 2.0 / 3f64.log2()) / (2.0 + 1.0 / 3f64.log2());
        assert!(close(ndcg(&j, &[2, 1], None), expected));
        assert!(close(ndcg(&judgments(&[(1, 0)]), &[1], None), 0.0));
    }

    #[test]
    fn ndcg_cutoff_limits_both_rankings() {
        let j = judgments(&[(1, 1), (2, 1)]);
        assert!(close(ndcg(&j, &[9, 1], Some(1)), 0.0));
        assert!(close(ndcg(&j, &[1, 9], Some(1)), 1.0));
    }

    #[test]
    fn average_precision_counts_unretrieved_relevant() {
        let j = judgments(&[(1, 1), (2, 2), (3, 1)]);
        // hits at ranks 1 and 3; doc 3 never retrieved
        let ap = average_precision(&j, &[1, 9, 2]);
        assert!(close(ap, (1.0 + 2.0 / 3.0) / 3.0));
        assert!(close(average_precision(&judgments(&[]), &[1]), 0.0));
    }

    #[test]
    fn precision_recall_and_rr() {
        let j = judgments(&[(1, 1), (2, 0), (3, 2)]);
        let ranked = [2, 3, 1];
        assert!(close(precision_at(&j, &ranked, 2), 0.5));
        assert!(close(recall_at(&j, &ranked, 2), 0.5));
        assert!(close(recall_at(&j, &ranked, 3), 1.0));
        assert!(close(reciprocal_rank(&j, &ranked), 0.5));
        assert!(close(reciprocal_rank(&j, &[2]), 0.0));
    }

    #[test]
    fn missing_queries_score_zero() {
        use crate::label_store::{Grade, Label};

        let labels: Vec<Label> = [("a", 1), ("b", 2)]
            .into_iter()
            .map(|(q, id)| Label {
                query: q.into(),
                document_id: id,
                grade: Grade::RELEVANT,
                explanation: None,
            })
            .collect();
        let qrels = Qrels::from_labels(&labels);

        let mut run = BTreeMap::new();
        run.insert("a".to_string(), [(1, 1.0f32)].into_iter().collect());

        let scores = evaluate_run(&qrels, &run, &[Metric::AveragePrecision]);
        assert!(close(scores["AP"], 0.5));
    }

    #[test]
    fn repeated_metrics_are_scored_once() {
        use crate::label_store::{Grade, Label};

        let labels = vec![Label {
            query: "a".into(),
            document_id: 1,
            grade: Grade::HIGHLY_RELEVANT,
            explanation: None,
        }];
        let qrels = Qrels::from_labels(&labels);

        let mut run = BTreeMap::new();
        run.insert("a".to_string(), [(1, 1.0f32)].into_iter().collect());

        let metrics: Vec<Metric> =
            ["AP", "map", "RR"].iter().map(|m| m.parse().unwrap()).collect();
        let scores = evaluate_run(&qrels, &run, &metrics);
        assert_eq!(scores.len(), 2);
        assert!(close(scores["AP"], 1.0));
        assert!(close(scores["RR"], 1.0));
    }
}
