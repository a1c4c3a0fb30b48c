//! Oracle and human annotation of pool entries into a [`LabelStore`].
//!
//! Both annotators walk the same list: pool entries without a label, one per
//! `(query, document_id)`, stably sorted by query. Every label is committed
//! on its own, so stopping at any point loses nothing and a re-run resumes
//! where the last one ended.

use std::collections::HashSet;
use std::fmt;
use std::io::{BufRead, Write};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::doc_store::DocumentId;
use crate::error::Result;
use crate::label_store::{Grade, Label, LabelStore};
use crate::oracle::RelevanceOracle;
use crate::pool::PoolEntry;

/// Entries still waiting for a label, in annotation order.
pub fn pending_entries<'a>(
    pool: &'a [PoolEntry],
    labels: &LabelStore,
) -> Result<Vec<&'a PoolEntry>> {
    let labeled = labels.labeled_keys()?;
    let mut seen: HashSet<(&str, DocumentId)> = HashSet::new();

    let mut pending: Vec<&PoolEntry> = pool
        .iter()
        .filter(|e| {
            !labeled.contains(&(e.query.clone(), e.document_id))
                && seen.insert((e.query.as_str(), e.document_id))
        })
        .collect();
    pending.sort_by(|a, b| a.query.cmp(&b.query));
    Ok(pending)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationSummary {
    pub labeled: usize,
    pub failed: usize,
    /// Pool entries that already had a label when the run started.
    pub skipped: usize,
    /// The reviewer quit before the list was exhausted.
    pub aborted: bool,
}

impl fmt::Display for AnnotationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} labeled, {} failed, {} already labeled",
            self.labeled, self.failed, self.skipped
        )?;
        if self.aborted {
            f.write_str(" (stopped early)")?;
        }
        Ok(())
    }
}

/// Label every pending entry with `oracle`, pausing `delay` between calls.
///
/// A failed or unparsable judgment is logged and counted; the entry stays
/// unlabeled for the next run.
pub fn annotate_with_oracle(
    pool: &[PoolEntry],
    labels: &LabelStore,
    oracle: &dyn RelevanceOracle,
    delay: Duration,
) -> Result<AnnotationSummary> {
    let pending = pending_entries(pool, labels)?;
    let mut summary = AnnotationSummary {
        skipped: pool.len() - pending.len(),
        ..Default::default()
    };
    info!(pending = pending.len(), "starting oracle annotation");

    for (i, entry) in pending.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            thread::sleep(delay);
        }

        let judgment = match oracle.judge(&entry.query, &entry.document_text)
        {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(
                    query = %entry.query,
                    document = entry.document_id,
                    "judgment failed: {e}"
                );
                summary.failed += 1;
                continue;
            }
        };

        labels.insert(&Label {
            query: entry.query.clone(),
            document_id: entry.document_id,
            grade: judgment.grade,
            explanation: judgment.explanation,
        })?;
        summary.labeled += 1;
        debug!(
            query = %entry.query,
            document = entry.document_id,
            grade = %judgment.grade,
            "labeled"
        );
    }

    Ok(summary)
}

/// A reviewer's answer for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Review {
    Grade(Grade),
    Quit,
}

/// Interactive source of grades.
pub trait Reviewer {
    fn review(
        &mut self,
        position: usize,
        total: usize,
        entry: &PoolEntry,
    ) -> Result<Review>;
}

/// Prompts on a writer and reads answers line by line.
///
/// Accepts `0`, `1`, `2` or `q`. Anything else re-prompts; end of input
/// quits.
pub struct TerminalReviewer<R, W> {
    input: R,
    output: W,
    preview_chars: usize,
}

impl<R: BufRead, W: Write> TerminalReviewer<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            preview_chars: 2000,
        }
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

impl<R: BufRead, W: Write> Reviewer for TerminalReviewer<R, W> {
    fn review(
        &mut self,
        position: usize,
        total: usize,
        entry: &PoolEntry,
    ) -> Result<Review> {
        let preview: String =
            entry.document_text.chars().take(self.preview_chars).collect();
        writeln!(self.output, "\n[{position}/{total}] query: {}", entry.query)?;
        writeln!(self.output, "{} <{}>", entry.title, entry.url)?;
        writeln!(self.output, "{preview}")?;

        loop {
            write!(
                self.output,
                "grade (0 = not relevant, 1 = relevant, 2 = highly relevant, q = quit): "
            )?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Ok(Review::Quit);
            }
            let answer = line.trim();
            if answer.eq_ignore_ascii_case("q") {
                return Ok(Review::Quit);
            }
            if let Some(grade) =
                answer.parse::<u8>().ok().and_then(Grade::new)
            {
                return Ok(Review::Grade(grade));
            }
            writeln!(self.output, "please answer 0, 1, 2 or q")?;
        }
    }
}

/// Label pending entries with grades from `reviewer` until it quits.
pub fn annotate_interactively(
    pool: &[PoolEntry],
    labels: &LabelStore,
    reviewer: &mut dyn Reviewer,
) -> Result<AnnotationSummary> {
    let pending = pending_entries(pool, labels)?;
    let total = pending.len();
    let mut summary = AnnotationSummary {
        skipped: pool.len() - total,
        ..Default::default()
    };

    for (i, entry) in pending.into_iter().enumerate() {
        match reviewer.review(i + 1, total, entry)? {
            Review::Grade(grade) => {
                labels.insert(&Label {
                    query: entry.query.clone(),
                    document_id: entry.document_id,
                    grade,
                    explanation: None,
                })?;
                summary.labeled += 1;
            }
            Review::Quit => {
                summary.aborted = true;
                break;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use super::*;
    use crate::error::Error;
    use crate::oracle::Judgment;

    fn entry(query: &str, document_id: i64) -> PoolEntry {
        PoolEntry {
            query: query.to_string(),
            document_id,
            document_text: format!("text of {document_id}"),
            title: format!("title {document_id}"),
            url: format!("https://d/{document_id}"),
            sources: BTreeMap::new(),
        }
    }

    fn store() -> (tempfile::TempDir, LabelStore) {
        let tmp = tempfile::tempdir().unwrap();
        let labels = LabelStore::open(&tmp.path().join("labels.redb")).unwrap();
        (tmp, labels)
    }

    /// Grades from a fixed list, rejecting documents in `bad`.
    struct ScriptedOracle {
        bad: Vec<i64>,
        calls: RefCell<Vec<(String, String)>>,
    }

    impl RelevanceOracle for ScriptedOracle {
        fn judge(&self, query: &str, document: &str) -> Result<Judgment> {
            self.calls
                .borrow_mut()
                .push((query.to_string(), document.to_string()));
            let id: i64 = document.trim_start_matches("text of ").parse().unwrap();
            if self.bad.contains(&id) {
                return Err(Error::InvalidGrade("7".into()));
            }
            Ok(Judgment {
                grade: Grade::new((id % 3) as u8).unwrap(),
                explanation: Some(format!("doc {id}")),
            })
        }
    }

    struct ScriptedReviewer(Vec<Review>);

    impl Reviewer for ScriptedReviewer {
        fn review(
            &mut self,
            _position: usize,
            _total: usize,
            _entry: &PoolEntry,
        ) -> Result<Review> {
            Ok(if self.0.is_empty() {
                Review::Quit
            } else {
                self.0.remove(0)
            })
        }
    }

    #[test]
    fn pending_is_sorted_deduplicated_and_skips_labeled() {
        let (_tmp, labels) = store();
        labels
            .insert(&Label {
                query: "b".into(),
                document_id: 1,
                grade: Grade::RELEVANT,
                explanation: None,
            })
            .unwrap();

        let pool = vec![entry("b", 1), entry("b", 2), entry("a", 3), entry("a", 3)];
        let pending = pending_entries(&pool, &labels).unwrap();
        let keys: Vec<_> = pending
            .iter()
            .map(|e| (e.query.as_str(), e.document_id))
            .collect();
        assert_eq!(keys, vec![("a", 3), ("b", 2)]);
    }

    #[test]
    fn oracle_failures_are_counted_and_left_unlabeled() {
        let (_tmp, labels) = store();
        let pool = vec![entry("q", 1), entry("q", 2), entry("q", 4)];
        let oracle = ScriptedOracle {
            bad: vec![2],
            calls: RefCell::new(Vec::new()),
        };

        let summary =
            annotate_with_oracle(&pool, &labels, &oracle, Duration::ZERO)
                .unwrap();
        assert_eq!(summary.labeled, 2);
        assert_eq!(summary.failed, 1);
        assert!(!labels.contains("q", 2).unwrap());

        let label = labels.get("q", 4).unwrap().unwrap();
        assert_eq!(label.grade, Grade::RELEVANT);
        assert_eq!(label.explanation.as_deref(), Some("doc 4"));
    }

    #[test]
    fn rerun_only_touches_unlabeled_entries() {
        let (_tmp, labels) = store();
        let pool = vec![entry("q", 1), entry("q", 2)];
        let first = ScriptedOracle {
            bad: vec![2],
            calls: RefCell::new(Vec::new()),
        };
        annotate_with_oracle(&pool, &labels, &first, Duration::ZERO).unwrap();
        let before = labels.get("q", 1).unwrap();

        let second = ScriptedOracle {
            bad: vec![],
            calls: RefCell::new(Vec::new()),
        };
        let summary =
            annotate_with_oracle(&pool, &labels, &second, Duration::ZERO)
                .unwrap();

        assert_eq!(summary.labeled, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(second.calls.borrow().len(), 1);
        assert_eq!(labels.get("q", 1).unwrap(), before);
        assert_eq!(labels.len().unwrap(), 2);
    }

    #[test]
    fn quitting_keeps_earlier_labels() {
        let (_tmp, labels) = store();
        let pool = vec![entry("a", 1), entry("b", 2), entry("c", 3)];
        let mut reviewer =
            ScriptedReviewer(vec![Review::Grade(Grade::HIGHLY_RELEVANT), Review::Quit]);

        let summary =
            annotate_interactively(&pool, &labels, &mut reviewer).unwrap();
        assert_eq!(summary.labeled, 1);
        assert!(summary.aborted);
        assert_eq!(
            labels.get("a", 1).unwrap().unwrap().grade,
            Grade::HIGHLY_RELEVANT
        );
        assert!(!labels.contains("b", 2).unwrap());
    }

    #[test]
    fn terminal_reviewer_reprompts_on_bad_input() {
        let input = Cursor::new("maybe\n5\n1\n");
        let mut output = Vec::new();
        let mut reviewer = TerminalReviewer::new(input, &mut output);

        let review = reviewer.review(1, 1, &entry("q", 1)).unwrap();
        assert_eq!(review, Review::Grade(Grade::RELEVANT));

        let shown = String::from_utf8(output).unwrap();
        assert_eq!(shown.matches("please answer").count(), 2);
        assert!(shown.contains("query: q"));
    }

    #[test]
    fn terminal_reviewer_quits_on_eof_or_q() {
        let mut sink = Vec::new();
        let mut eof = TerminalReviewer::new(Cursor::new(""), &mut sink);
        assert_eq!(eof.review(1, 1, &entry("q", 1)).unwrap(), Review::Quit);

        let mut quit = TerminalReviewer::new(Cursor::new("Q\n"), Vec::new());
        assert_eq!(quit.review(1, 1, &entry("q", 1)).unwrap(), Review::Quit);
    }
}
