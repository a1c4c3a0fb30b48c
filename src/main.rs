use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use stashbench::annotate::{
    TerminalReviewer,
    annotate_interactively,
    annotate_with_oracle,
};
use stashbench::engine::{self, SearchEngine};
use stashbench::error::{Error, Result};
use stashbench::evaluate::{self, Evaluation};
use stashbench::metrics::Metric;
use stashbench::oracle::{self, ChatOracle};
use stashbench::pool::{self, PoolEntry};
use stashbench::qrels::{self, Qrels};
use stashbench::queries;
use stashbench::settings::{Settings, SettingsOverrides};
use stashbench::{DataDir, DocStore, LabelStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{AnnotateAction, Cli, Command, DocsAction, OracleArgs};

const LOG_ENV_VAR: &str = "STASHBENCH_LOG";

const POOL_FILE: &str = "pool.json";
const LABELS_FILE: &str = "labels.redb";
const QRELS_FILE: &str = "qrels.json";
const METRICS_FILE: &str = "metrics.json";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let settings = Settings::resolve(&data_dir, overrides(&cli)?)?;

    match cli.command {
        Command::Search(args) => cmd_search(&settings, &args)?,
        Command::Index(_) => cmd_index(&settings)?,
        Command::Pool(args) => {
            let output = match args.output {
                Some(path) => path,
                None => data_dir.benchmark_dir()?.join(POOL_FILE),
            };
            cmd_pool(&settings, &args.pooling, &output)?;
        }
        Command::Annotate { action } => match action {
            AnnotateAction::Oracle { target, .. } => {
                let (pool, labels) =
                    labeling_paths(&data_dir, target.pool, target.labels)?;
                cmd_annotate_oracle(&settings, &pool, &labels)?;
            }
            AnnotateAction::Manual { target } => {
                let (pool, labels) =
                    labeling_paths(&data_dir, target.pool, target.labels)?;
                cmd_annotate_manual(&pool, &labels)?;
            }
        },
        Command::Qrels(args) => {
            let bench = data_dir.benchmark_dir()?;
            let labels = args.labels.unwrap_or_else(|| bench.join(LABELS_FILE));
            let output = args.output.unwrap_or_else(|| bench.join(QRELS_FILE));
            cmd_qrels(&labels, &output)?;
        }
        Command::Evaluate(args) => {
            let bench = data_dir.benchmark_dir()?;
            let qrels = args.qrels.unwrap_or_else(|| bench.join(QRELS_FILE));
            let pool = args.pool.unwrap_or_else(|| bench.join(POOL_FILE));
            cmd_evaluate(&qrels, &pool, &args.metrics, args.output.as_deref())?;
        }
        Command::Agreement(args) => cmd_agreement(&settings, &args)?,
        Command::Benchmark(args) => {
            let dir = match &args.dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)
                        .map_err(|_| Error::DataDir(dir.clone()))?;
                    dir.clone()
                }
                None => data_dir.benchmark_dir()?,
            };
            cmd_benchmark(&settings, &args, &dir)?;
        }
        Command::Docs { action } => match action {
            DocsAction::List { limit, json } => {
                docs_list(&settings, limit, json)?;
            }
            DocsAction::Show { id, json } => docs_show(&settings, id, json)?,
            DocsAction::Concat { output, inputs } => {
                docs_concat(&output, &inputs)?;
            }
        },
        Command::Completions(_) => {}
    }

    Ok(())
}

fn oracle_overrides(
    overrides: &mut SettingsOverrides,
    args: &OracleArgs,
) -> Result<()> {
    overrides.with_explanation = args.explain;
    overrides.prompt_file = args.prompt_file.clone();
    overrides.oracle_endpoint = args.endpoint.clone();
    overrides.oracle_model = args.oracle_model.clone();
    if let Some(secs) = args.delay {
        overrides.oracle_delay =
            Some(Duration::try_from_secs_f64(secs).map_err(|_| {
                Error::Config(format!("invalid oracle delay: {secs}"))
            })?);
    }
    Ok(())
}

fn overrides(cli: &Cli) -> Result<SettingsOverrides> {
    let mut overrides = SettingsOverrides {
        doc_db: cli.doc_db.clone(),
        vector_index: cli.vector_index.clone(),
        model_id: cli.model.clone(),
        ..Default::default()
    };

    match &cli.command {
        Command::Index(args) => {
            overrides.batch_size = args.batch_size;
            overrides.chunk_tokens = args.chunk_tokens;
            overrides.chunk_overlap = args.chunk_overlap;
        }
        Command::Annotate {
            action: AnnotateAction::Oracle { oracle, .. },
        } => oracle_overrides(&mut overrides, oracle)?,
        Command::Benchmark(args) => {
            oracle_overrides(&mut overrides, &args.oracle)?;
        }
        _ => {}
    }
    Ok(overrides)
}

fn labeling_paths(
    data_dir: &DataDir,
    pool: Option<PathBuf>,
    labels: Option<PathBuf>,
) -> Result<(PathBuf, PathBuf)> {
    let bench = data_dir.benchmark_dir()?;
    Ok((
        pool.unwrap_or_else(|| bench.join(POOL_FILE)),
        labels.unwrap_or_else(|| bench.join(LABELS_FILE)),
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Collapse whitespace and cut to `max` characters for one-line listings.
fn flatten(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut cut: String = flat.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

fn cmd_search(settings: &Settings, args: &cli::SearchArgs) -> Result<()> {
    let store = DocStore::open(&settings.doc_db)?;
    let mut engine = args.engine.build(settings);
    engine.load(&store)?;

    let hits = engine.search(&args.query, args.count)?;
    let documents = store.document_map()?;

    if args.json {
        let results: Vec<_> = hits
            .iter()
            .map(|hit| {
                let doc = documents.get(&hit.document_id);
                serde_json::json!({
                    "id": hit.document_id,
                    "score": hit.score,
                    "title": doc.map(|d| d.title.as_str()),
                    "url": doc.map(|d| d.url.as_str()),
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "query": args.query,
            "engine": engine.name(),
            "results": results,
        }))?;
    } else if hits.is_empty() {
        println!("No results.");
    } else {
        for (i, hit) in hits.iter().enumerate() {
            let (title, url) = documents
                .get(&hit.document_id)
                .map_or(("", ""), |d| (d.title.as_str(), d.url.as_str()));
            println!(
                "{:>3}. [{:.4}] #{} {}",
                i + 1,
                hit.score,
                hit.document_id,
                flatten(title, 60)
            );
            println!("     {url}");
        }
    }
    Ok(())
}

fn cmd_index(settings: &Settings) -> Result<()> {
    let store = DocStore::open(&settings.doc_db)?;
    let mut engine = engine::chunked_engine(settings);
    engine.load(&store)?;

    let report = engine.last_report();
    println!(
        "Indexed {} new documents as {} chunks in {} batches ({} orphaned chunks removed)",
        report.new_documents,
        report.new_chunks,
        report.batches,
        report.orphans_removed
    );
    Ok(())
}

fn load_pooling_inputs(
    settings: &Settings,
    args: &cli::PoolingArgs,
) -> Result<(DocStore, Vec<Box<dyn SearchEngine>>, Vec<queries::Query>)> {
    let queries = queries::load_queries(&args.queries)?;
    if queries.is_empty() {
        return Err(Error::Config(format!(
            "query file {} contains no queries",
            args.queries.display()
        )));
    }
    let store = DocStore::open(&settings.doc_db)?;
    let engines = engine::load_engines(&args.engines, settings, &store)?;
    Ok((store, engines, queries))
}

fn report_pool(build: &pool::PoolBuild) {
    for failure in &build.failures {
        eprintln!(
            "  failed: {} on '{}': {}",
            failure.engine, failure.query, failure.reason
        );
    }
    println!("{build}");
}

fn cmd_pool(
    settings: &Settings,
    args: &cli::PoolingArgs,
    output: &Path,
) -> Result<()> {
    let (store, engines, queries) = load_pooling_inputs(settings, args)?;
    let texts = queries::query_texts(&queries);

    let build =
        pool::build_pool(&store, &engines, &texts, args.top_k, args.dedup)?;
    pool::save_pool(output, &build.entries)?;

    report_pool(&build);
    println!("Wrote pool to {}", output.display());
    Ok(())
}

fn open_oracle(settings: &Settings) -> Result<ChatOracle> {
    if settings.oracle.api_key.is_none()
        && settings.oracle.endpoint == oracle::DEFAULT_ENDPOINT
    {
        return Err(Error::Config(format!(
            "{} is not set",
            oracle::DEFAULT_API_KEY_ENV
        )));
    }
    ChatOracle::new(settings.oracle.clone())
}

fn cmd_annotate_oracle(
    settings: &Settings,
    pool_path: &Path,
    labels_path: &Path,
) -> Result<()> {
    let pool = pool::load_pool(pool_path)?;
    let labels = LabelStore::open(labels_path)?;
    let oracle = open_oracle(settings)?;

    let summary =
        annotate_with_oracle(&pool, &labels, &oracle, settings.oracle.delay)?;
    println!("{summary}");
    Ok(())
}

fn cmd_annotate_manual(pool_path: &Path, labels_path: &Path) -> Result<()> {
    let pool = pool::load_pool(pool_path)?;
    let labels = LabelStore::open(labels_path)?;

    let stdin = std::io::stdin();
    let mut reviewer = TerminalReviewer::new(stdin.lock(), std::io::stdout());
    let summary = annotate_interactively(&pool, &labels, &mut reviewer)?;

    println!("\n{summary}");
    Ok(())
}

fn cmd_qrels(labels_path: &Path, output: &Path) -> Result<()> {
    if !labels_path.exists() {
        return Err(Error::NotFound {
            kind: "label store",
            name: labels_path.display().to_string(),
        });
    }
    let labels = LabelStore::open(labels_path)?;
    let qrels = qrels::export_qrels(&labels)?;
    qrels::save_qrels(output, &qrels)?;

    println!(
        "Exported {} judgments for {} queries to {}",
        qrels.judgment_count(),
        qrels.len(),
        output.display()
    );
    Ok(())
}

fn print_evaluation(title: &str, evaluation: &Evaluation) {
    println!("== {title} ==");
    for (engine, scores) in evaluation {
        let line: Vec<String> = scores
            .iter()
            .map(|(metric, value)| format!("{metric}={value:.4}"))
            .collect();
        println!("{engine:<10} {}", line.join("  "));
    }
}

fn cmd_evaluate(
    qrels_path: &Path,
    pool_path: &Path,
    metrics: &[Metric],
    output: Option<&Path>,
) -> Result<()> {
    let qrels = qrels::load_qrels(qrels_path)?;
    let pool: Vec<PoolEntry> = pool::load_pool(pool_path)?;

    let results = evaluate::evaluate(&qrels, &pool, metrics);
    print_json(&results)?;
    if let Some(path) = output {
        write_json(path, &results)?;
    }
    Ok(())
}

fn open_existing_labels(path: &Path) -> Result<LabelStore> {
    if !path.exists() {
        return Err(Error::NotFound {
            kind: "label store",
            name: path.display().to_string(),
        });
    }
    LabelStore::open(path)
}

fn cmd_agreement(settings: &Settings, args: &cli::AgreementArgs) -> Result<()> {
    let first = open_existing_labels(&args.first)?;
    let second = open_existing_labels(&args.second)?;

    let kappa = evaluate::agreement(&first, &second)?;
    println!(
        "Cohen's kappa: {kappa:.4} over {} items",
        first.len()?
    );

    if args.show_disagreements {
        let diffs = evaluate::disagreements(&first, &second)?;
        // Titles are a convenience; a missing page database is not an error.
        let documents = match DocStore::open(&settings.doc_db) {
            Ok(store) => store.document_map()?,
            Err(e) => {
                warn!("not showing titles: {e}");
                Default::default()
            }
        };

        let mut out = std::io::stdout().lock();
        for d in &diffs {
            let (title, url) = documents
                .get(&d.document_id)
                .map_or(("", ""), |doc| (doc.title.as_str(), doc.url.as_str()));
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}",
                d.query,
                d.document_id,
                d.first,
                d.second,
                flatten(title, 60),
                url
            )?;
        }
        writeln!(out, "{} disagreements", diffs.len())?;
    }
    Ok(())
}

fn cmd_benchmark(
    settings: &Settings,
    args: &cli::BenchmarkArgs,
    dir: &Path,
) -> Result<()> {
    let (store, engines, queries) =
        load_pooling_inputs(settings, &args.pooling)?;
    let texts = queries::query_texts(&queries);
    let top_k = args.pooling.top_k;

    let pool_path = dir.join(POOL_FILE);
    let pool = if pool_path.exists() && !args.fresh_pool {
        info!(path = %pool_path.display(), "reusing existing pool");
        pool::load_pool(&pool_path)?
    } else {
        let build = pool::build_pool(
            &store,
            &engines,
            &texts,
            top_k,
            args.pooling.dedup,
        )?;
        pool::save_pool(&pool_path, &build.entries)?;
        report_pool(&build);
        build.entries
    };

    let labels = LabelStore::open(&dir.join(LABELS_FILE))?;
    if args.skip_annotation {
        println!("Skipping oracle annotation");
    } else {
        let oracle = open_oracle(settings)?;
        let summary = annotate_with_oracle(
            &pool,
            &labels,
            &oracle,
            settings.oracle.delay,
        )?;
        println!("Annotation: {summary}");
    }

    let qrels: Qrels = qrels::export_qrels(&labels)?;
    qrels::save_qrels(&dir.join(QRELS_FILE), &qrels)?;
    let qrels = qrels.restrict(&texts);

    let metrics = if args.metrics.is_empty() {
        Metric::defaults(top_k)
    } else {
        args.metrics.clone()
    };

    let mut results: BTreeMap<String, Evaluation> = BTreeMap::new();
    results.insert("all".to_string(), evaluate::evaluate(&qrels, &pool, &metrics));

    let subsets = queries::subsets_by_type(&queries);
    if subsets.iter().any(|s| s.name == "all") {
        warn!("query type 'all' collides with the full evaluation and is skipped");
    }
    let subsets: Vec<_> =
        subsets.into_iter().filter(|s| s.name != "all").collect();
    results.extend(evaluate::evaluate_subsets(
        &store,
        &engines,
        &qrels,
        &subsets,
        top_k,
        args.pooling.dedup,
        &metrics,
    )?);

    write_json(&dir.join(METRICS_FILE), &results)?;
    for (name, evaluation) in &results {
        print_evaluation(name, evaluation);
    }
    println!(
        "Evaluated {} engines on {} judged queries ({} subsets); results in {}",
        engines.len(),
        qrels.len(),
        subsets.len(),
        dir.display()
    );
    Ok(())
}

fn docs_list(settings: &Settings, limit: Option<usize>, json: bool) -> Result<()> {
    let store = DocStore::open(&settings.doc_db)?;
    let documents = store.documents()?;
    let shown = &documents[..limit.unwrap_or(documents.len()).min(documents.len())];

    if json {
        return print_json(&shown);
    }
    if shown.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in shown {
        println!(
            "{}\t{}\t{}\t{}",
            doc.id,
            doc.url,
            flatten(&doc.title, 60),
            flatten(&doc.text, 80)
        );
    }
    println!("\n{} of {} document(s)", shown.len(), documents.len());
    Ok(())
}

fn docs_show(settings: &Settings, id: i64, json: bool) -> Result<()> {
    let store = DocStore::open(&settings.doc_db)?;
    let doc = store.get(id)?.ok_or_else(|| Error::NotFound {
        kind: "document",
        name: format!("#{id}"),
    })?;

    if json {
        return print_json(&doc);
    }
    println!("id: {}", doc.id);
    println!("title: {}", doc.title);
    println!("url: {}", doc.url);
    if let Some(created_at) = &doc.created_at {
        println!("saved: {created_at}");
    }
    println!();
    println!("{}", doc.text);
    Ok(())
}

fn docs_concat(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    let mut target = DocStore::create(output)?;
    let mut inserted = 0;
    let mut duplicates = 0;
    let mut failed = 0;

    for input in inputs {
        let merged = DocStore::open(input).and_then(|source| {
            target.merge_from(&source)
        });
        match merged {
            Ok(summary) => {
                eprintln!(
                    "  {}: {} added, {} duplicate urls",
                    input.display(),
                    summary.inserted,
                    summary.duplicates
                );
                inserted += summary.inserted;
                duplicates += summary.duplicates;
            }
            Err(e) => {
                warn!(input = %input.display(), "merge failed: {e}");
                failed += 1;
            }
        }
    }

    println!(
        "Merged {} databases into {}: {inserted} documents added, {duplicates} duplicates skipped, {failed} inputs failed",
        inputs.len() - failed,
        output.display()
    );
    Ok(())
}
