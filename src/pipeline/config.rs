use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::ValueEnum;

use crate::semantic::{EmbeddingModelConfig, resolve_model_config};

pub const INJECT_FAILURE_ENV: &str = "VIDSET_INJECT_FAILURE";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ComputeMode {
    /// Parallel workers and large batches.
    Batch,
    /// Single worker, small batches.
    Constrained,
}

impl ComputeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Constrained => "constrained",
        }
    }

    pub fn effective_batch_size(self, requested: usize) -> usize {
        match self {
            Self::Batch => requested.max(1),
            Self::Constrained => requested.clamp(1, 16),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum FailurePoint {
    BeforeMerge,
    DuringIndexBuild,
    AfterMerge,
}

impl FailurePoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeMerge => "before-merge",
            Self::DuringIndexBuild => "during-index-build",
            Self::AfterMerge => "after-merge",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "before-merge" => Some(Self::BeforeMerge),
            "during-index-build" | "during-index" => Some(Self::DuringIndexBuild),
            "after-merge" | "before-similarity" => Some(Self::AfterMerge),
            _ => None,
        }
    }
}

/// Flag value wins; otherwise the environment selects a failure point.
pub fn resolve_failure_point(flag: Option<FailurePoint>) -> Result<Option<FailurePoint>> {
    if flag.is_some() {
        return Ok(flag);
    }

    match std::env::var(INJECT_FAILURE_ENV) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => match FailurePoint::parse(&raw) {
            Some(point) => Ok(Some(point)),
            None => bail!("{INJECT_FAILURE_ENV}={raw} is not a known failure point"),
        },
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub cache_root: PathBuf,
    pub production_db: PathBuf,
    pub similarity_db: PathBuf,
    pub staging_db: PathBuf,
    pub source_dir: PathBuf,
    pub index_path: PathBuf,
    pub lock_path: PathBuf,
    pub report_dir: PathBuf,
}

impl PipelinePaths {
    pub fn under(cache_root: &Path) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            production_db: cache_root.join("production.sqlite"),
            similarity_db: cache_root.join("similarity.sqlite"),
            staging_db: cache_root.join("staging.sqlite"),
            source_dir: cache_root.join("source"),
            index_path: cache_root.join("index").join("video_index.bin"),
            lock_path: cache_root.join("run.lock"),
            report_dir: cache_root.join("reports"),
        }
    }

    pub fn latest_report_path(&self) -> PathBuf {
        self.report_dir.join("latest_run.json")
    }

    pub fn archived_report_path(&self, run_id: &str) -> PathBuf {
        self.report_dir.join("runs").join(format!("run_{run_id}.json"))
    }

    pub fn index_meta_path(&self) -> PathBuf {
        self.index_path.with_extension("meta.json")
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paths: PipelinePaths,
    pub model: EmbeddingModelConfig,
    pub compute_mode: ComputeMode,
    pub batch_size: usize,
    pub crawl_workers: usize,
    pub crawl_retries: u32,
    pub neighbors: usize,
    pub min_score: f64,
    pub index_hyperplanes: u32,
    pub index_seed: u64,
    pub lock_stale_after: Duration,
    pub archive_report: bool,
    pub inject_failure: Option<FailurePoint>,
}

impl PipelineConfig {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            paths: PipelinePaths::under(cache_root),
            model: resolve_model_config(""),
            compute_mode: ComputeMode::Batch,
            batch_size: 64,
            crawl_workers: 4,
            crawl_retries: 1,
            neighbors: 10,
            min_score: 0.0,
            index_hyperplanes: 8,
            index_seed: 0x5eed_1dea,
            lock_stale_after: Duration::from_secs(6 * 60 * 60),
            archive_report: true,
            inject_failure: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.neighbors == 0 {
            bail!("neighbors must be at least 1");
        }
        if !(-1.0..=1.0).contains(&self.min_score) {
            bail!("min_score must be within [-1, 1], got {}", self.min_score);
        }
        if self.index_hyperplanes == 0 || self.index_hyperplanes > 24 {
            bail!(
                "index_hyperplanes must be within 1..=24, got {}",
                self.index_hyperplanes
            );
        }
        if self.crawl_workers == 0 {
            bail!("crawl_workers must be at least 1");
        }
        Ok(())
    }

    pub fn effective_batch_size(&self) -> usize {
        self.compute_mode.effective_batch_size(self.batch_size)
    }

    pub fn effective_crawl_workers(&self) -> usize {
        match self.compute_mode {
            ComputeMode::Batch => self.crawl_workers.max(1),
            ComputeMode::Constrained => 1,
        }
    }

    pub fn fails_at(&self, point: FailurePoint) -> bool {
        self.inject_failure == Some(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_point_parse_accepts_aliases() {
        assert_eq!(
            FailurePoint::parse("before_merge"),
            Some(FailurePoint::BeforeMerge)
        );
        assert_eq!(
            FailurePoint::parse("During-Index"),
            Some(FailurePoint::DuringIndexBuild)
        );
        assert_eq!(
            FailurePoint::parse("before-similarity"),
            Some(FailurePoint::AfterMerge)
        );
        assert_eq!(FailurePoint::parse("later"), None);
    }

    #[test]
    fn constrained_mode_caps_batches_and_workers() {
        let mut config = PipelineConfig::new(Path::new("/tmp/vidset"));
        config.batch_size = 256;
        config.crawl_workers = 8;
        assert_eq!(config.effective_batch_size(), 256);
        assert_eq!(config.effective_crawl_workers(), 8);

        config.compute_mode = ComputeMode::Constrained;
        assert_eq!(config.effective_batch_size(), 16);
        assert_eq!(config.effective_crawl_workers(), 1);
    }

    #[test]
    fn validate_rejects_out_of_range_settings() {
        let mut config = PipelineConfig::new(Path::new("/tmp/vidset"));
        assert!(config.validate().is_ok());

        config.min_score = 1.5;
        assert!(config.validate().is_err());

        config.min_score = 0.2;
        config.index_hyperplanes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn paths_default_under_cache_root() {
        let paths = PipelinePaths::under(Path::new("/data/vidset"));
        assert_eq!(
            paths.latest_report_path(),
            PathBuf::from("/data/vidset/reports/latest_run.json")
        );
        assert_eq!(
            paths.archived_report_path("run-1"),
            PathBuf::from("/data/vidset/reports/runs/run_run-1.json")
        );
        assert_eq!(
            paths.index_meta_path(),
            PathBuf::from("/data/vidset/index/video_index.meta.json")
        );
    }
}
