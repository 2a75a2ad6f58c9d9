//! gridtest CLI - classify scheduler job caches into CI reports.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use gridtest::cache::{CacheStore, FsCacheStore};
use gridtest::classify::InterruptedPolicy;
use gridtest::config::{self, Config};
use gridtest::known_failures::KnownFailures;
use gridtest::report::{ConsoleSink, JUnitSink, MultiSink, ReportBuilder, ReportSink, TextSink};
use gridtest::sharding::ShardConfig;

#[derive(Parser)]
#[command(name = "gridtest")]
#[command(about = "Test-matrix reports for graph schedulers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a job cache and emit JUnit XML plus triage files
    Report {
        /// Directory holding the scheduler's job cache records
        db: PathBuf,

        /// JUnit XML output path (default: {output_dir}/{junit_file})
        #[arg(long)]
        output: Option<PathBuf>,

        /// Known-failures TOML file
        #[arg(long)]
        known_failures: Option<PathBuf>,

        /// Return a nonzero exit code if any job failed or errored
        #[arg(long)]
        fail_if_failed: bool,

        /// Test-suite name in the XML
        #[arg(long)]
        suite_name: Option<String>,
    },

    /// Check JUnit XML files for test cases reported more than once
    Compare {
        /// JUnit XML files to cross-check
        files: Vec<PathBuf>,
    },

    /// Print which of the given test names this worker accepts
    Shard {
        /// Test names (read from stdin when empty)
        names: Vec<String>,

        /// Worker index override (requires --count)
        #[arg(long, requires = "count")]
        index: Option<u32>,

        /// Worker count override (requires --index)
        #[arg(long, requires = "index")]
        count: Option<u32>,
    },

    /// Validate configuration and known-failures files
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Report {
            db,
            output,
            known_failures,
            fail_if_failed,
            suite_name,
        } => {
            run_report(
                &cli.config,
                &db,
                output,
                known_failures,
                fail_if_failed,
                suite_name,
            )
            .await
        }
        Commands::Compare { files } => compare_reports(&files),
        Commands::Shard {
            names,
            index,
            count,
        } => shard_names(&names, index, count),
        Commands::Validate => validate(&cli.config),
    }
}

/// Loads the config named on the command line, or `gridtest.toml` when it
/// exists, or the defaults.
fn resolve_config(cli_config: &Option<PathBuf>) -> Result<Config> {
    match cli_config {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new("gridtest.toml");
            if default.exists() {
                config::load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn load_known_failures(
    flag: Option<PathBuf>,
    config: &Config,
) -> Result<KnownFailures> {
    let path = flag.or_else(|| config.classify.known_failures.clone());
    match path {
        Some(path) => {
            let kf = KnownFailures::load(&path)?;
            info!("Loaded {} known failures from {}", kf.len(), path.display());
            Ok(kf)
        }
        None => Ok(KnownFailures::new()),
    }
}

async fn run_report(
    cli_config: &Option<PathBuf>,
    db: &Path,
    output: Option<PathBuf>,
    known_failures: Option<PathBuf>,
    fail_if_failed: bool,
    suite_name: Option<String>,
) -> Result<()> {
    let config = resolve_config(cli_config)?;
    let known_failures = load_known_failures(known_failures, &config)?;
    let classifier = config.classify.classifier(known_failures.ids());
    let suite_name = suite_name.unwrap_or_else(|| config.report.suite_name.clone());

    let store = FsCacheStore::new(db);
    let jobs = store.all_jobs()?;
    if jobs.is_empty() {
        bail!("no job cache records found in {}", db.display());
    }
    if jobs.len() < 10 {
        warn!(
            "only {} jobs in {}; is this a complete run database?",
            jobs.len(),
            db.display()
        );
    }
    info!("Classifying {} jobs", jobs.len());

    let progress = indicatif::ProgressBar::new(jobs.len() as u64);
    progress.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("#>-"),
    );

    let mut builder = ReportBuilder::new(suite_name, classifier);
    for job_id in &jobs {
        let cache = store.job_cache(job_id)?;
        builder.add(job_id, &cache);
        progress.inc(1);
    }
    progress.finish_and_clear();
    let report = builder.finish();

    let junit_path = output
        .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
    let mut sinks = MultiSink::new()
        .with_sink(ConsoleSink)
        .with_sink(JUnitSink::new(junit_path));
    if config.report.text_files {
        sinks = sinks.with_sink(TextSink::new(config.report.output_dir.clone()));
    }
    sinks.emit(&report).await?;

    std::process::exit(report.exit_code(fail_if_failed));
}

/// Collects `testcase` names from one JUnit XML file.
fn testcase_names(path: &Path) -> Result<BTreeSet<String>> {
    use quick_xml::events::Event;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut reader = quick_xml::Reader::from_str(&content);
    let mut names = BTreeSet::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"testcase" {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"name" {
                            names.insert(attr.unescape_value()?.into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => bail!("cannot parse {}: {e}", path.display()),
        }
    }
    Ok(names)
}

fn compare_reports(files: &[PathBuf]) -> Result<()> {
    if files.is_empty() {
        bail!("no JUnit files given");
    }

    let mut counter: BTreeMap<String, usize> = BTreeMap::new();
    for path in files {
        let names = testcase_names(path)?;
        println!("{}: {} test cases", path.display(), names.len());
        for name in names {
            *counter.entry(name).or_insert(0) += 1;
        }
    }

    let mut duplicates = 0usize;
    for (name, count) in &counter {
        if *count > 1 {
            println!("{count} copies of {name}");
            duplicates += 1;
        }
    }
    println!("found {duplicates} duplicates");

    if duplicates > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn shard_names(names: &[String], index: Option<u32>, count: Option<u32>) -> Result<()> {
    let config = match (index, count) {
        (Some(index), Some(count)) => ShardConfig::new(index, count)?,
        _ => ShardConfig::current()?.clone(),
    };

    let names: Vec<String> = if names.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to read names from stdin")?
    } else {
        names.to_vec()
    };

    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        if config.accepts(name) {
            println!("{name}");
        }
    }
    Ok(())
}

fn validate(cli_config: &Option<PathBuf>) -> Result<()> {
    let config = resolve_config(cli_config)?;
    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Output dir:      {}", config.report.output_dir.display());
    println!("  JUnit file:      {}", config.report.junit_file);
    println!("  Suite name:      {}", config.report.suite_name);
    println!("  Text files:      {}", config.report.text_files);
    println!("  Max message len: {}", config.classify.max_message_len);
    let interrupted = match config.classify.interrupted {
        InterruptedPolicy::Skip => "skip",
        InterruptedPolicy::Error => "error",
    };
    println!("  Interrupted:     {interrupted}");

    match &config.classify.known_failures {
        Some(path) => {
            let kf = KnownFailures::load(path)?;
            println!("  Known failures:  {} entries from {}", kf.len(), path.display());
        }
        None => println!("  Known failures:  none"),
    }

    let shard = ShardConfig::current()?;
    println!("  Worker:          {} of {}", shard.index(), shard.count());
    Ok(())
}
