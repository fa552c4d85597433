//! kgmerge - merge knowledge-graph nodes into edges and index the result
//!
//! Usage:
//!   kgmerge merge-files <DIR> [--output FILE] [--skip-dangling]
//!   kgmerge run --config FILE --data DIR --output FILE [--ids FILE] [--mode MODE]
//!
//! `merge-files` joins `nodes.jsonl[.gz]` and `edges.jsonl[.gz]` directly and
//! writes merged edges as JSON lines.
//!
//! `run` loads `<DIR>/<source>.jsonl[.gz]` for every configured source into
//! an in-memory store, runs the build, then indexes the target collection
//! into a JSON-lines file. The metrics snapshot is printed on stdout.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kgmerge::loader::{read_jsonl, DanglingReferencePolicy, MergedEdges};
use kgmerge::metrics::PipelineMetrics;
use kgmerge::{DocumentStore, IndexMode, Indexer, JsonlSink, MemoryStore, NodeEdgeBuilder, PipelineConfig};

#[derive(Parser)]
#[command(name = "kgmerge")]
#[command(version)]
#[command(about = "Merge knowledge-graph node and edge sources and index the merged documents")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream merged edges from a nodes/edges JSONL directory
    MergeFiles {
        /// Directory holding nodes.jsonl[.gz] and edges.jsonl[.gz]
        dir: PathBuf,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Drop edges that reference unknown nodes instead of failing
        #[arg(long)]
        skip_dangling: bool,
    },
    /// Build the merged collection and index it
    Run {
        /// Build configuration (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,
        /// Directory holding one <source>.jsonl[.gz] per configured source
        #[arg(short, long)]
        data: PathBuf,
        /// JSON-lines file receiving the indexed documents
        #[arg(short, long)]
        output: PathBuf,
        /// Index only these ids (one per line)
        #[arg(long)]
        ids: Option<PathBuf>,
        /// Index mode override: index, purge or resume
        #[arg(long)]
        mode: Option<IndexMode>,
    },
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();
}

fn merge_files(dir: &Path, output: Option<&Path>, skip_dangling: bool) -> Result<()> {
    let policy = if skip_dangling {
        DanglingReferencePolicy::Skip
    } else {
        DanglingReferencePolicy::Fail
    };
    let mut edges = MergedEdges::open(dir, policy)
        .with_context(|| format!("failed to open node/edge files in {}", dir.display()))?;

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut written = 0usize;
    for edge in edges.by_ref() {
        serde_json::to_writer(&mut out, &edge?)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;

    info!(
        "{} merged edges written ({} nodes, {} edges skipped)",
        written,
        edges.node_count(),
        edges.skipped()
    );
    Ok(())
}

fn read_ids(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("failed to open id list {}", path.display()))?;
    let mut ids = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let id = line.trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}

fn load_sources(store: &MemoryStore, config: &PipelineConfig, data: &Path) -> Result<()> {
    for source in &config.sources {
        let path = data.join(format!("{}.jsonl", source));
        let records = read_jsonl(&path).with_context(|| format!("failed to open source '{}'", source))?;
        let collection = store.memory_collection(source)?;
        let docs = records.collect::<kgmerge::Result<Vec<_>>>()?;
        let loaded = collection.insert_many(docs)?;
        info!("loaded {} documents into '{}'", loaded, source);
    }
    Ok(())
}

async fn run(config_path: &Path, data: &Path, output: &Path, ids: Option<&Path>, mode: Option<IndexMode>) -> Result<()> {
    let config = PipelineConfig::load(config_path)
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    let Some(index) = config.index.clone() else {
        bail!("configuration {} has no index section", config_path.display());
    };

    let store = Arc::new(MemoryStore::new(config.build_name.clone()));
    load_sources(&store, &config, data)?;

    let metrics = Arc::new(PipelineMetrics::new());
    let pool = config.job_pool();
    let store_dyn: Arc<dyn DocumentStore> = store.clone();

    let batch_size = config.batch_size;
    let builder = NodeEdgeBuilder::new(config.clone(), Arc::clone(&store_dyn), Arc::clone(&store_dyn), Arc::clone(&pool))?
        .with_metrics(Arc::clone(&metrics));
    let counts = builder.merge_all(batch_size).await?;
    for (source, count) in &counts {
        info!("merged '{}': {} ids", source, count);
    }

    let ids = ids.map(read_ids).transpose()?;
    let sink = Arc::new(JsonlSink::create(index.name.clone(), output)?);
    let indexer = Indexer::new(
        store.as_ref(),
        index.edge_collection(&config),
        &index.node_collection,
        sink.clone(),
        pool,
    )?
    .with_mapping(index.mapping)
    .with_metrics(Arc::clone(&metrics));

    let summary = indexer
        .do_index(index.batch_size, ids, mode.unwrap_or(index.mode))
        .await?;
    sink.flush()?;
    info!("indexed {} documents into {}", summary.count, output.display());

    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::MergeFiles {
            dir,
            output,
            skip_dangling,
        } => merge_files(&dir, output.as_deref(), skip_dangling),
        Commands::Run {
            config,
            data,
            output,
            ids,
            mode,
        } => run(&config, &data, &output, ids.as_deref(), mode).await,
    }
}
