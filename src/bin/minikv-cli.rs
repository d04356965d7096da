//! minikv command line tool
//!
//! Opens the store for a single command, runs it, closes cleanly.
//! Set `RUST_LOG=minikv=debug` to watch flushes, compactions and GC.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use minikv::{Db, Entry, IteratorOptions, Options};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "minikv-cli", version = VERSION)]
#[command(about = "Inspect and modify a minikv store")]
struct Cli {
    /// Store directory
    #[arg(long, default_value = "./minikv-data", env = "MINIKV_DIR")]
    dir: PathBuf,

    /// JSON options file; `--dir` overrides its `dir`
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a key
    Set {
        key: String,
        value: String,
        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print a key's value
    Get { key: String },
    /// Delete a key
    Del { key: String },
    /// List keys under a prefix
    Scan {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long)]
        reverse: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Print store statistics as JSON
    Stats,
    /// Flush memtables and compact every level over budget
    Compact {
        /// Also run one forced value-log GC round
        #[arg(long)]
        gc: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_options(cli: &Cli) -> Result<Options> {
    let mut opts = match &cli.config {
        Some(path) => Options::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Options::default(),
    };
    opts.dir = cli.dir.clone();
    Ok(opts)
}

fn run(cli: Cli) -> Result<()> {
    let opts = load_options(&cli)?;
    let db = Db::open(opts).with_context(|| format!("failed to open {}", cli.dir.display()))?;

    let outcome = execute(&db, cli.command);
    db.close().context("failed to close store")?;
    outcome
}

fn execute(db: &Db, command: Command) -> Result<()> {
    match command {
        Command::Set { key, value, ttl } => {
            let mut entry = Entry::new(key, value);
            if let Some(secs) = ttl {
                if secs == 0 {
                    bail!("--ttl must be positive");
                }
                entry = entry.with_ttl(Duration::from_secs(secs));
            }
            db.set(entry).context("set failed")?;
        }
        Command::Get { key } => match db.get(key.as_bytes()).context("get failed")? {
            Some(entry) => println!("{}", display_value(&entry)),
            None => bail!("key not found: {}", key),
        },
        Command::Del { key } => db.del(key.as_bytes()).context("del failed")?,
        Command::Scan {
            prefix,
            reverse,
            limit,
        } => {
            let mut opts = IteratorOptions::with_prefix(prefix);
            if reverse {
                opts = opts.reversed();
            }
            for item in db.iter(opts).context("scan failed")?.take(limit) {
                let entry = item.context("scan failed")?;
                println!("{}\t{}", String::from_utf8_lossy(&entry.key), display_value(&entry));
            }
        }
        Command::Stats => {
            let stats = db.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Compact { gc } => {
            db.flush().context("flush failed")?;
            let rounds = db.compact().context("compaction failed")?;
            println!("compaction rounds: {}", rounds);
            if gc {
                match db.run_value_gc(0.0).context("value log GC failed")? {
                    Some(run) => println!(
                        "gc: file {} scanned {} rewritten {} reclaimed {} bytes",
                        run.fid, run.records_scanned, run.records_rewritten, run.bytes_reclaimed
                    ),
                    None => println!("gc: nothing to collect"),
                }
            }
        }
    }
    Ok(())
}

fn display_value(entry: &Entry) -> String {
    match entry.value.as_literal() {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "<unresolved pointer>".to_string(),
    }
}
