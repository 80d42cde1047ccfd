pub mod config;
pub mod crawl;
pub mod embed;
pub mod error;
pub mod index;
pub mod lock;
pub mod merge;
pub mod moderation;
pub mod report;
pub mod seed;
pub mod similarity;


use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::model::{RunReport, RunStatus, StageStatus};
use crate::pipeline::config::{FailurePoint, PipelineConfig};
use crate::pipeline::crawl::{SourceFetcher, run_crawl};
use crate::pipeline::embed::{Embedder, run_embed};
use crate::pipeline::error::PipelineError;
use crate::pipeline::index::{build_index, load_index};
use crate::pipeline::lock::RunLock;
use crate::pipeline::merge::merge_staging;
use crate::pipeline::report::{
    RUN_MANIFEST_VERSION, Stage, crawl_counters, embed_counters, emit_marker, index_counters,
    merge_counters, run_error, similarity_counters, stage_marker, write_run_report,
};
use crate::pipeline::similarity::precompute_similarity;
use crate::store::{StagingStore, Stores, dataset_fingerprint, load_string_set};
use crate::util::{now_utc_string, utc_compact_string};

pub fn new_run_id() -> String {
    let now = Utc::now();
    format!(
        "{}-{:03}",
        utc_compact_string(now),
        now.timestamp_subsec_millis()
    )
}

/// Runs crawl, embed, merge, index build and similarity precompute in order
/// under the run lock.
///
/// Stage failures do not surface as `Err`: they end up in the returned
/// report, which is always written. `Err` means the run never started
/// (`LockHeld`, invalid config) or its report could not be written.
pub fn run(
    config: &PipelineConfig,
    fetcher: &dyn SourceFetcher,
    embedder: &dyn Embedder,
    interrupt: &AtomicBool,
) -> Result<RunReport> {
    config.validate()?;
    let run_id = new_run_id();
    let lock = RunLock::acquire(&config.paths.lock_path, &run_id, config.lock_stale_after)?;

    info!(
        run_id = %run_id,
        compute_mode = config.compute_mode.as_str(),
        inject_failure = config.inject_failure.map(FailurePoint::as_str).unwrap_or("none"),
        "pipeline run started"
    );

    let mut pipeline = Pipeline {
        config,
        fetcher,
        embedder,
        interrupt,
        report: RunReport {
            manifest_version: RUN_MANIFEST_VERSION,
            run_id: run_id.clone(),
            status: RunStatus::Pass,
            started_at: now_utc_string(),
            finished_at: String::new(),
            compute_mode: config.compute_mode.as_str().to_string(),
            injected_failure: config.inject_failure.map(|point| point.as_str().to_string()),
            stages: Vec::new(),
            crawl: None,
            embed: None,
            merge: None,
            index: None,
            similarity: None,
            production_fingerprint_before: None,
            production_fingerprint_after: None,
            db_unchanged: None,
            error: None,
        },
    };

    match Stores::open(&config.paths.production_db, &config.paths.similarity_db) {
        Ok(mut stores) => {
            let before = dataset_fingerprint(&stores.connection);
            pipeline.report.production_fingerprint_before = before.as_ref().ok().cloned();

            let outcome = before.and_then(|_| pipeline.execute(&mut stores));
            if let Err(err) = &outcome {
                if pipeline.report.error.is_none() {
                    pipeline.report.error = Some(run_error("pipeline", err));
                }
            }

            match dataset_fingerprint(&stores.connection) {
                Ok(after) => {
                    pipeline.report.db_unchanged = pipeline
                        .report
                        .production_fingerprint_before
                        .as_ref()
                        .map(|before| before == &after);
                    pipeline.report.production_fingerprint_after = Some(after);
                }
                Err(err) => warn!(error = %err, "failed to fingerprint production after run"),
            }
        }
        Err(err) => pipeline.report.error = Some(run_error("setup", &err)),
    }

    let mut report = pipeline.report;
    skip_remaining_stages(&mut report);
    report.status = if report.error.is_some() {
        RunStatus::Fail
    } else {
        RunStatus::Pass
    };
    report.finished_at = now_utc_string();

    write_run_report(&config.paths, &report, config.archive_report)?;
    lock.release()?;

    match &report.error {
        None => info!(run_id = %report.run_id, "pipeline run passed"),
        Some(error) => warn!(
            run_id = %report.run_id,
            stage = %error.stage,
            kind = %error.kind,
            message = %error.message,
            "pipeline run failed"
        ),
    }

    Ok(report)
}

fn skip_remaining_stages(report: &mut RunReport) {
    let recorded = report.stages.len();
    for stage in Stage::ALL.iter().skip(recorded) {
        let marker = stage_marker(*stage, StageStatus::Skipped, None, BTreeMap::new());
        emit_marker(&marker);
        report.stages.push(marker);
    }
}

struct Pipeline<'a> {
    config: &'a PipelineConfig,
    fetcher: &'a dyn SourceFetcher,
    embedder: &'a dyn Embedder,
    interrupt: &'a AtomicBool,
    report: RunReport,
}

impl Pipeline<'_> {
    fn guard(&self, stage: Stage) -> Result<()> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(PipelineError::Interrupted {
                stage: stage.name().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn inject(&self, point: FailurePoint) -> Result<()> {
        if self.config.fails_at(point) {
            warn!(point = point.as_str(), "injecting failure");
            return Err(PipelineError::InjectedFailure {
                point: point.as_str().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn record<T>(
        &mut self,
        stage: Stage,
        started: Instant,
        outcome: Result<T>,
        counters: impl FnOnce(&T) -> BTreeMap<String, i64>,
    ) -> Result<T> {
        match outcome {
            Ok(value) => {
                let marker = stage_marker(stage, StageStatus::Pass, Some(started), counters(&value));
                emit_marker(&marker);
                self.report.stages.push(marker);
                Ok(value)
            }
            Err(err) => {
                let marker = stage_marker(stage, StageStatus::Fail, Some(started), BTreeMap::new());
                emit_marker(&marker);
                self.report.stages.push(marker);
                self.report.error = Some(run_error(stage.name(), &err));
                Err(err)
            }
        }
    }

    fn execute(&mut self, stores: &mut Stores) -> Result<()> {
        let config = self.config;
        let fetcher = self.fetcher;
        let embedder = self.embedder;

        let started = Instant::now();
        let outcome = self.guard(Stage::Crawl).and_then(|()| {
            let denied = load_string_set(&stores.connection, "SELECT host FROM main.denied_hosts")?;
            let mut staging = StagingStore::recreate(&config.paths.staging_db)?;
            let stats = run_crawl(
                &mut staging.connection,
                fetcher,
                &denied,
                config.effective_crawl_workers(),
                config.crawl_retries,
                &now_utc_string(),
            )?;
            Ok((staging, stats))
        });
        let (mut staging, crawl) =
            self.record(Stage::Crawl, started, outcome, |(_, stats)| crawl_counters(stats))?;
        self.report.crawl = Some(crawl);

        let started = Instant::now();
        let outcome = self.guard(Stage::Embed).and_then(|()| {
            run_embed(
                &mut staging.connection,
                &stores.connection,
                embedder,
                config.compute_mode,
                config.effective_batch_size(),
            )
        });
        self.report.embed = Some(self.record(Stage::Embed, started, outcome, embed_counters)?);

        let started = Instant::now();
        let run_id = self.report.run_id.clone();
        let outcome = self
            .guard(Stage::Merge)
            .and_then(|()| self.inject(FailurePoint::BeforeMerge))
            .and_then(|()| merge_staging(stores, &staging.path, &run_id));
        self.report.merge = Some(self.record(Stage::Merge, started, outcome, merge_counters)?);

        let started = Instant::now();
        let outcome = self.guard(Stage::Index).and_then(|()| {
            build_index(
                &stores.connection,
                &config.paths.index_path,
                &config.paths.index_meta_path(),
                embedder.model(),
                config.index_hyperplanes,
                config.index_seed,
                || self.inject(FailurePoint::DuringIndexBuild),
            )
        });
        self.report.index = Some(self.record(Stage::Index, started, outcome, index_counters)?);

        let started = Instant::now();
        let outcome = self
            .guard(Stage::Similarity)
            .and_then(|()| self.inject(FailurePoint::AfterMerge))
            .and_then(|()| load_index(&config.paths.index_path))
            .and_then(|index| {
                precompute_similarity(
                    stores,
                    &index,
                    config.compute_mode,
                    config.neighbors,
                    config.min_score,
                )
            });
        self.report.similarity =
            Some(self.record(Stage::Similarity, started, outcome, similarity_counters)?);

        if let Err(err) = staging.discard() {
            warn!(error = %err, "failed to discard staging store");
        }
        Ok(())
    }
}
