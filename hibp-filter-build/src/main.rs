use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hibp_filter::{DirBlobStore, FilterChecker, HashKey};
use hibp_filter_build::config::{DEFAULT_CONCURRENCY, DEFAULT_RANGE_URL};
use hibp_filter_build::{
    BuildConfig, Error, HttpRangeSource, MalformedRetry, ShardPipeline, ShardPrefix, TransportRetry,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hibp-filter-build")]
#[command(about = "Build sharded binary fuse filters of Have I Been Pwned password hashes")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the range API and store one filter per shard prefix
    Build(BuildArgs),
    /// Check a password or SHA-1 digest against built filters
    Check(CheckArgs),
}

#[derive(clap::Args, Debug)]
struct BuildArgs {
    /// Directory the filters are written to
    #[arg(short, long, env = "HIBP_FILTER_DIR")]
    output: PathBuf,

    /// First shard prefix to build; resume an interrupted run from here
    #[arg(long, default_value = "000", value_parser = parse_shard)]
    from: ShardPrefix,

    /// Last shard prefix to build, inclusive
    #[arg(long, default_value = "FFF", value_parser = parse_shard)]
    to: ShardPrefix,

    /// Base URL of the range API
    #[arg(long, env = "HIBP_RANGE_URL", default_value = DEFAULT_RANGE_URL)]
    range_url: String,

    /// Concurrent range requests per shard
    #[arg(short = 'j', long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Do not store shards that are missing any range prefix
    #[arg(long)]
    require_complete: bool,

    /// Give up on a shard's outstanding requests after this many seconds
    #[arg(long)]
    shard_timeout: Option<u64>,

    /// Write the JSON build report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Disable progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(clap::Args, Debug)]
struct CheckArgs {
    /// Directory holding the filters
    #[arg(short, long, env = "HIBP_FILTER_DIR")]
    data: PathBuf,

    /// Check a SHA-1 hex digest instead of a password
    #[arg(long, conflicts_with = "password")]
    hash: Option<String>,

    /// Password to check
    #[arg(required_unless_present = "hash")]
    password: Option<String>,
}

fn parse_shard(s: &str) -> Result<ShardPrefix, Error> {
    ShardPrefix::parse(s)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Build(args) => build(args).await,
        Command::Check(args) => check(args).await,
    }
}

async fn build(args: BuildArgs) -> Result<(), Error> {
    if args.to < args.from {
        return Err(Error::InvalidArgument(format!(
            "--to {} is before --from {}",
            args.to, args.from
        )));
    }

    let config = BuildConfig {
        concurrency: args.concurrency,
        malformed_retry: MalformedRetry::default(),
        shard_timeout: args.shard_timeout.map(Duration::from_secs),
        require_complete: args.require_complete,
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping after outstanding requests are abandoned");
            signal_cancel.cancel();
        }
    });

    let source = HttpRangeSource::new(args.range_url, TransportRetry::default())?;
    let store = Arc::new(DirBlobStore::new(&args.output));
    let mut pipeline = ShardPipeline::from_config(source, store, &config, cancel);

    let progress_bar = if !args.no_progress {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} shards ({percent}%) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pipeline = pipeline.with_progress(pb.clone());
        Some(pb)
    } else {
        None
    };

    tracing::info!(
        output = %args.output.display(),
        from = %args.from,
        to = %args.to,
        concurrency = config.concurrency,
        "building filters"
    );

    let report = pipeline.run(args.from, args.to).await?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("done");
    }

    if let Some(path) = &args.report {
        tokio::fs::write(path, report.to_json()?).await?;
        tracing::info!(path = %path.display(), "wrote build report");
    }

    println!(
        "Stored {} of {} shard filters; {} range prefixes failed",
        report.uploaded(),
        report.shards.len(),
        report.failed_prefixes().len()
    );
    if let Some(resume) = report.resume_from() {
        println!("Incomplete: rerun with --from {resume}");
    }
    Ok(())
}

async fn check(args: CheckArgs) -> Result<(), Error> {
    let hash = match (&args.hash, &args.password) {
        (Some(hex), _) => HashKey::parse(hex)?,
        (None, Some(password)) => HashKey::from_password(password),
        (None, None) => {
            return Err(Error::InvalidArgument("a password or --hash is required".into()));
        }
    };

    let checker = Arc::new(FilterChecker::new(DirBlobStore::new(&args.data)));
    let compromised = checker.is_compromised_async(hash).await?;

    if compromised {
        println!("{hash}: likely compromised");
    } else {
        println!("{hash}: not found");
    }
    Ok(())
}
