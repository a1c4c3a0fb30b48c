use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::doc_store::DocStore;
use crate::engine::{SearchEngine, SearchHit, rank_hits};
use crate::error::{Error, Result};

/// Field names used in the schema.
pub mod fields {
    pub const DOC_ID: &str = "doc_id";
    pub const BODY: &str = "body";
}

const WRITER_MEMORY_BUDGET: usize = 15_000_000;

/// An in-memory tantivy index over page texts.
struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    doc_id: Field,
    body: Field,
}

fn build_schema() -> (Schema, Field, Field) {
    let mut builder = Schema::builder();

    let doc_id = builder.add_i64_field(fields::DOC_ID, STORED | FAST);

    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let body = builder.add_text_field(fields::BODY, body_opts);

    (builder.build(), doc_id, body)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

impl LexicalIndex {
    fn build(store: &DocStore) -> Result<Self> {
        let documents = store.documents()?;
        if documents.is_empty() {
            return Err(Error::EmptyCorpus {
                store: store.path().display().to_string(),
            });
        }

        let (schema, doc_id, body) = build_schema();
        let index = Index::create_in_ram(schema);
        register_tokenizers(&index);

        let mut writer: IndexWriter = index.writer(WRITER_MEMORY_BUDGET)?;
        for document in &documents {
            writer.add_document(doc!(
                doc_id => document.id,
                body => document.text.as_str(),
            ))?;
        }
        writer.commit()?;

        let reader = index.reader()?;
        reader.reload()?;

        Ok(Self {
            index,
            reader,
            doc_id,
            body,
        })
    }

    fn search(&self, query_str: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.body]);

        // Lenient parsing: stray quotes or colons in archived page queries
        // must not turn into errors.
        let (query, _errors) = parser.parse_query_lenient(query_str);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            if let Some(document_id) =
                doc.get_first(self.doc_id).and_then(|v| v.as_i64())
            {
                hits.push(SearchHit { document_id, score });
            }
        }

        Ok(hits)
    }
}

/// Okapi BM25 ranking delegated to tantivy's scorer.
pub struct Bm25Engine {
    index: Option<LexicalIndex>,
}

impl Default for Bm25Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Bm25Engine {
    pub fn new() -> Self {
        Self { index: None }
    }
}

impl SearchEngine for Bm25Engine {
    fn name(&self) -> &str {
        "bm25"
    }

    fn load(&mut self, store: &DocStore) -> Result<()> {
        self.index = None;
        self.index = Some(LexicalIndex::build(store)?);
        Ok(())
    }

    fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let index = self.index.as_ref().ok_or_else(|| Error::NotLoaded {
            engine: self.name().to_string(),
        })?;

        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = index.search(query, top_k)?;
        rank_hits(&mut hits, top_k);
        Ok(hits)
    }
}

impl std::fmt::Debug for Bm25Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bm25Engine")
            .field("loaded", &self.index.is_some())
            .finish_non_exhaustive()
    }
}
