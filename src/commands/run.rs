use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::commands::resolve_paths;
use crate::model::RunStatus;
use crate::pipeline;
use crate::pipeline::config::{PipelineConfig, resolve_failure_point};
use crate::pipeline::crawl::DirectorySource;
use crate::pipeline::embed::LocalHashEmbedder;
use crate::semantic::resolve_model_config;

pub fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;

    let interrupt = install_interrupt_handler();

    let fetcher = DirectorySource::new(&config.paths.source_dir);
    let embedder = LocalHashEmbedder::new(config.model.clone());

    let report = pipeline::run(&config, &fetcher, &embedder, &interrupt)?;
    let latest = config.paths.latest_report_path();

    match report.status {
        RunStatus::Pass => {
            info!(
                run_id = %report.run_id,
                report = %latest.display(),
                "run completed"
            );
            Ok(())
        }
        RunStatus::Fail => {
            if interrupt.load(Ordering::SeqCst) {
                warn!("run stopped by interrupt");
            }
            let stage = report
                .error
                .as_ref()
                .map(|error| error.stage.as_str())
                .unwrap_or("unknown");
            bail!(
                "run {} failed at stage {stage}; see {}",
                report.run_id,
                latest.display()
            )
        }
    }
}

/// Flag raised on SIGINT or SIGTERM; the pipeline stops at the next stage
/// boundary and releases the run lock.
pub fn install_interrupt_handler() -> Arc<AtomicBool> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %err, "interrupt handler not installed; signals will not release the run lock");
    }
    interrupt
}

pub fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::new(&args.store.cache_root);
    config.paths = resolve_paths(&args.store);

    if let Some(path) = &args.staging_db_path {
        config.paths.staging_db = path.clone();
    }
    if let Some(path) = &args.source_dir {
        config.paths.source_dir = path.clone();
    }
    if let Some(path) = &args.index_path {
        config.paths.index_path = path.clone();
    }
    if let Some(path) = &args.report_dir {
        config.paths.report_dir = path.clone();
    }
    if let Some(path) = &args.lock_path {
        config.paths.lock_path = path.clone();
    }

    config.model = resolve_model_config(&args.model_id);
    config.compute_mode = args.compute_mode;
    config.batch_size = args.batch_size;
    config.crawl_workers = args.crawl_workers;
    config.crawl_retries = args.crawl_retries;
    config.neighbors = args.neighbors;
    config.min_score = args.min_score;
    config.index_hyperplanes = args.index_hyperplanes;
    config.lock_stale_after = Duration::from_secs(args.lock_stale_secs);
    config.archive_report = args.archive_report;
    config.inject_failure = resolve_failure_point(args.inject_failure)?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::pipeline::config::{ComputeMode, FailurePoint};

    fn parse_run(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).expect("parse");
        match cli.command {
            Commands::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn path_overrides_apply_on_top_of_cache_root() {
        let args = parse_run(&[
            "vidset",
            "run",
            "--cache-root",
            "/tmp/vidset",
            "--db-path",
            "/data/prod.sqlite",
            "--index-path",
            "/data/index.bin",
        ]);
        let config = build_config(&args).expect("config");

        assert_eq!(config.paths.production_db.to_str(), Some("/data/prod.sqlite"));
        assert_eq!(config.paths.index_path.to_str(), Some("/data/index.bin"));
        assert_eq!(
            config.paths.similarity_db.to_str(),
            Some("/tmp/vidset/similarity.sqlite")
        );
    }

    #[test]
    fn flags_reach_the_config() {
        let args = parse_run(&[
            "vidset",
            "run",
            "--compute-mode",
            "constrained",
            "--neighbors",
            "3",
            "--archive-report",
            "false",
            "--inject-failure",
            "during-index-build",
        ]);
        let config = build_config(&args).expect("config");

        assert_eq!(config.compute_mode, ComputeMode::Constrained);
        assert_eq!(config.neighbors, 3);
        assert!(!config.archive_report);
        assert_eq!(config.inject_failure, Some(FailurePoint::DuringIndexBuild));
    }

    #[test]
    fn reinstalling_the_interrupt_handler_warns_instead_of_failing() {
        let first = install_interrupt_handler();
        let second = install_interrupt_handler();
        assert!(!first.load(Ordering::SeqCst));
        assert!(!second.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_settings_are_rejected_before_running() {
        let args = parse_run(&["vidset", "run", "--neighbors", "0"]);
        assert!(build_config(&args).is_err());
    }
}
