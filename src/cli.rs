use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::pipeline::config::{ComputeMode, FailurePoint};

#[derive(Parser, Debug)]
#[command(
    name = "vidset",
    version,
    about = "Video dataset pipeline: crawl, embed, merge, index and moderate"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline once under the run lock.
    Run(RunArgs),
    /// Write a source fixture and production pre-state.
    Seed(SeedArgs),
    /// Remove a host and everything depending on it.
    Purge(PurgeArgs),
    Deny(DenyArgs),
    Allow(HostArgs),
    Block(BlockArgs),
    Unblock(ChannelArgs),
    /// Apply the serving moderation filter to a JSON result set.
    Filter(FilterArgs),
    /// Verify standing invariants across the stores and index.
    Check(CheckArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    #[arg(long, default_value = ".cache/vidset")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub similarity_db_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub staging_db_path: Option<PathBuf>,

    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[arg(long)]
    pub index_path: Option<PathBuf>,

    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    #[arg(long)]
    pub lock_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ComputeMode::Batch)]
    pub compute_mode: ComputeMode,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub crawl_workers: usize,

    #[arg(long, default_value_t = 1)]
    pub crawl_retries: u32,

    #[arg(long, default_value_t = 10)]
    pub neighbors: usize,

    #[arg(long, default_value_t = 0.0)]
    pub min_score: f64,

    #[arg(long, default_value_t = 8)]
    pub index_hyperplanes: u32,

    #[arg(long, default_value = "vidset-hash-v1")]
    pub model_id: String,

    #[arg(long, default_value_t = 6 * 60 * 60)]
    pub lock_stale_secs: u64,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub archive_report: bool,

    #[arg(long, value_enum)]
    pub inject_failure: Option<FailurePoint>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum SeedStrategy {
    Synthetic,
    Sampled,
}

#[derive(Args, Debug, Clone)]
pub struct SeedArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = SeedStrategy::Synthetic)]
    pub strategy: SeedStrategy,

    /// Existing source directory to sample from.
    #[arg(long)]
    pub sample_from: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    pub sample_size: usize,

    #[arg(long, default_value = "vidset-hash-v1")]
    pub model_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub host: String,

    /// Run lock to take before purging; defaults to the pipeline's.
    #[arg(long)]
    pub lock_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct HostArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub host: String,
}

#[derive(Args, Debug, Clone)]
pub struct DenyArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub host: String,

    #[arg(long)]
    pub reason: Option<String>,

    /// Purge the host immediately instead of waiting for the next run.
    #[arg(long, default_value_t = false)]
    pub purge: bool,

    #[arg(long)]
    pub lock_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub channel_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct BlockArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub channel_id: String,

    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// JSON array of rows carrying at least `video_id`, `channel_id` and `host`.
    #[arg(long)]
    pub input: PathBuf,

    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long)]
    pub index_path: Option<PathBuf>,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}
