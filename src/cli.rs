use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use stashbench::EngineKind;
use stashbench::metrics::Metric;
use stashbench::pool::DedupKey;

#[derive(Debug, Parser)]
#[command(
    name = "stashbench",
    about = "Benchmark search engines over a personal web archive"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Page database to read documents from
    #[arg(long, global = true)]
    pub doc_db: Option<PathBuf>,

    /// Persistent vector index for the chunked engine
    #[arg(long, global = true)]
    pub vector_index: Option<PathBuf>,

    /// Override the embedding model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one engine over the archive and print its ranking
    Search(SearchArgs),
    /// Bring the vector index up to date with the page database
    Index(IndexArgs),
    /// Build the annotation pool from every engine's top results
    Pool(PoolArgs),
    /// Label pool entries
    Annotate {
        #[command(subcommand)]
        action: AnnotateAction,
    },
    /// Export labels as a qrels JSON file
    Qrels(QrelsArgs),
    /// Score every engine in a pool against qrels
    Evaluate(EvaluateArgs),
    /// Measure agreement between two label stores
    Agreement(AgreementArgs),
    /// Run pooling, oracle annotation, qrels export and evaluation
    Benchmark(BenchmarkArgs),
    /// Inspect or merge page databases
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Engine to search with
    #[arg(short, long, default_value = "bm25")]
    pub engine: EngineKind,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Chunks embedded and committed per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Maximum tokens per chunk
    #[arg(long)]
    pub chunk_tokens: Option<usize>,

    /// Tokens shared by consecutive chunks
    #[arg(long)]
    pub chunk_overlap: Option<usize>,
}

// -- Pool --

#[derive(Debug, Args)]
pub struct PoolingArgs {
    /// Query file: one query per line, or TSV with QUERY and TYPE columns
    #[arg(long)]
    pub queries: PathBuf,

    /// Engines to pool (comma separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "tfidf,bm25,chunked"
    )]
    pub engines: Vec<EngineKind>,

    /// Results taken from each engine per query
    #[arg(short = 'k', long, default_value = "10")]
    pub top_k: usize,

    /// What makes two hits the same pool entry: text or id
    #[arg(long, default_value = "text")]
    pub dedup: DedupKey,
}

#[derive(Debug, Parser)]
pub struct PoolArgs {
    #[command(flatten)]
    pub pooling: PoolingArgs,

    /// Where to write the pool (defaults to the benchmark directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

// -- Annotate --

#[derive(Debug, Args)]
pub struct OracleArgs {
    /// Ask the oracle for an explanation alongside each grade
    #[arg(long)]
    pub explain: bool,

    /// File holding the oracle's system prompt
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Chat-completions endpoint
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Model asked for judgments
    #[arg(long)]
    pub oracle_model: Option<String>,

    /// Seconds to wait between oracle calls
    #[arg(long)]
    pub delay: Option<f64>,
}

#[derive(Debug, Args)]
pub struct LabelingArgs {
    /// Pool file to annotate (defaults to the benchmark directory)
    #[arg(long)]
    pub pool: Option<PathBuf>,

    /// Label store to write to (defaults to the benchmark directory)
    #[arg(long)]
    pub labels: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum AnnotateAction {
    /// Label pending entries with a language-model oracle
    Oracle {
        #[command(flatten)]
        target: LabelingArgs,
        #[command(flatten)]
        oracle: OracleArgs,
    },
    /// Label pending entries interactively
    Manual {
        #[command(flatten)]
        target: LabelingArgs,
    },
}

// -- Qrels --

#[derive(Debug, Parser)]
pub struct QrelsArgs {
    /// Label store to export (defaults to the benchmark directory)
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// Where to write the qrels (defaults to the benchmark directory)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

// -- Evaluate --

#[derive(Debug, Parser)]
pub struct EvaluateArgs {
    /// Qrels file (defaults to the benchmark directory)
    #[arg(long)]
    pub qrels: Option<PathBuf>,

    /// Pool file (defaults to the benchmark directory)
    #[arg(long)]
    pub pool: Option<PathBuf>,

    /// Metrics to compute (comma separated, e.g. nDCG@10,AP,P@5)
    #[arg(long, value_delimiter = ',', default_value = "nDCG@10,AP")]
    pub metrics: Vec<Metric>,

    /// Also write the results to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

// -- Agreement --

#[derive(Debug, Parser)]
pub struct AgreementArgs {
    /// First label store
    pub first: PathBuf,

    /// Second label store
    pub second: PathBuf,

    /// List the items the two stores grade differently
    #[arg(long)]
    pub show_disagreements: bool,
}

// -- Benchmark --

#[derive(Debug, Parser)]
pub struct BenchmarkArgs {
    #[command(flatten)]
    pub pooling: PoolingArgs,

    #[command(flatten)]
    pub oracle: OracleArgs,

    /// Directory for pool.json, labels.redb, qrels.json and metrics.json
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Metrics to compute (defaults to nDCG at the pool depth and AP)
    #[arg(long, value_delimiter = ',')]
    pub metrics: Vec<Metric>,

    /// Rebuild the pool even if one already exists
    #[arg(long)]
    pub fresh_pool: bool,

    /// Evaluate existing labels without calling the oracle
    #[arg(long)]
    pub skip_annotation: bool,
}

// -- Docs --

#[derive(Debug, Subcommand)]
pub enum DocsAction {
    /// List documents in the page database
    List {
        /// Show at most this many documents
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one document
    Show {
        /// Document id
        id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Merge page databases into one, skipping duplicate URLs
    Concat {
        /// Database to create or extend
        output: PathBuf,

        /// Databases to merge in
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "stashbench",
            &mut std::io::stdout(),
        );
    }
}
