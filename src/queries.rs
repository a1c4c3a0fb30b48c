//! Query files.
//!
//! A query file is either a plain list with one query per line, or a TSV
//! file whose header names a `QUERY` column and optionally a `TYPE` column.
//! Blank lines and lines starting with `#` are ignored in both forms.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::evaluate::QuerySubset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub kind: Option<String>,
}

pub fn load_queries(path: &Path) -> Result<Vec<Query>> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "query file",
            name: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    parse_queries(&content)
}

pub fn parse_queries(content: &str) -> Result<Vec<Query>> {
    let mut lines = content
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'));

    let Some(first) = lines.next() else {
        return Ok(Vec::new());
    };

    let header: Vec<String> = first
        .split('\t')
        .map(|c| c.trim().to_ascii_uppercase())
        .collect();
    let Some(query_col) = header.iter().position(|c| c == "QUERY") else {
        return Ok(std::iter::once(first)
            .chain(lines)
            .map(|l| Query {
                text: l.trim().to_string(),
                kind: None,
            })
            .collect());
    };
    let type_col = header.iter().position(|c| c == "TYPE");

    let mut queries = Vec::new();
    for (n, line) in lines.enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        let text = fields
            .get(query_col)
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::Config(format!(
                    "query file row {} has no QUERY value",
                    n + 2
                ))
            })?;
        let kind = type_col
            .and_then(|c| fields.get(c))
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        queries.push(Query {
            text: text.to_string(),
            kind,
        });
    }
    Ok(queries)
}

/// Query texts in file order, without duplicates.
pub fn query_texts(queries: &[Query]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    queries
        .iter()
        .filter(|q| seen.insert(q.text.as_str()))
        .map(|q| q.text.clone())
        .collect()
}

/// One subset per distinct query type, in type order.
pub fn subsets_by_type(queries: &[Query]) -> Vec<QuerySubset> {
    let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for q in queries {
        if let Some(kind) = &q.kind {
            let group = groups.entry(kind.as_str()).or_default();
            if !group.contains(&q.text) {
                group.push(q.text.clone());
            }
        }
    }
    groups
        .into_iter()
        .map(|(name, queries)| QuerySubset {
            name: name.to_string(),
            queries,
        })
        .collect()
}
