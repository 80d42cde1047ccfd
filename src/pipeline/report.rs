use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tracing::{error, info};

use crate::model::{
    CrawlStats, EmbedStats, IndexMeta, MergeBatch, RunError, RunReport, SimilarityStats,
    StageMarker, StageStatus,
};
use crate::pipeline::config::PipelinePaths;
use crate::pipeline::error::error_kind;
use crate::util::write_json_pretty;

pub const RUN_MANIFEST_VERSION: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Crawl,
    Embed,
    Merge,
    Index,
    Similarity,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Crawl,
        Stage::Embed,
        Stage::Merge,
        Stage::Index,
        Stage::Similarity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Embed => "embed",
            Self::Merge => "merge",
            Self::Index => "index",
            Self::Similarity => "similarity",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Self::Crawl => "step1",
            Self::Embed => "step2",
            Self::Merge => "step3",
            Self::Index => "step4",
            Self::Similarity => "step5",
        }
    }
}

fn status_label(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Pass => "pass",
        StageStatus::Fail => "fail",
        StageStatus::Skipped => "skipped",
    }
}

/// Logs one machine-parsable marker line.
pub fn emit_marker(marker: &StageMarker) {
    let counters = serde_json::json!(marker.counters);
    match marker.status {
        StageStatus::Fail => error!(
            marker = %marker.marker,
            stage = %marker.stage,
            status = status_label(marker.status),
            duration_ms = marker.duration_ms as u64,
            counters = %counters,
            "stage finished"
        ),
        _ => info!(
            marker = %marker.marker,
            stage = %marker.stage,
            status = status_label(marker.status),
            duration_ms = marker.duration_ms as u64,
            counters = %counters,
            "stage finished"
        ),
    }
}

pub fn stage_marker(
    stage: Stage,
    status: StageStatus,
    started: Option<Instant>,
    counters: BTreeMap<String, i64>,
) -> StageMarker {
    StageMarker {
        marker: stage.marker().to_string(),
        stage: stage.name().to_string(),
        status,
        duration_ms: started.map(|at| at.elapsed().as_millis()).unwrap_or(0),
        counters,
    }
}

fn counters<const N: usize>(pairs: [(&str, usize); N]) -> BTreeMap<String, i64> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value as i64))
        .collect()
}

pub fn crawl_counters(stats: &CrawlStats) -> BTreeMap<String, i64> {
    counters([
        ("hosts_listed", stats.hosts_listed),
        ("hosts_denied", stats.hosts_denied),
        ("hosts_crawled", stats.hosts_crawled),
        ("hosts_failed", stats.hosts_failed),
        ("channels_staged", stats.channels_staged),
        ("videos_staged", stats.videos_staged),
        ("observations_staged", stats.observations_staged),
    ])
}

pub fn embed_counters(stats: &EmbedStats) -> BTreeMap<String, i64> {
    counters([
        ("candidate_videos", stats.candidate_videos),
        ("embedded_videos", stats.embedded_videos),
        ("reused_embeddings", stats.reused_embeddings),
        ("failed_videos", stats.failed_videos),
        ("batches_committed", stats.batches_committed),
    ])
}

pub fn merge_counters(batch: &MergeBatch) -> BTreeMap<String, i64> {
    let mut out = batch.purge_totals.counters();
    for outcome in &batch.tables {
        out.insert(format!("{}_inserted", outcome.table), outcome.inserted as i64);
        out.insert(format!("{}_replaced", outcome.table), outcome.replaced as i64);
        out.insert(
            format!("{}_duplicate_key_groups", outcome.table),
            outcome.duplicate_key_groups as i64,
        );
    }
    out.insert("rejected_channels".to_string(), batch.rejected_channels as i64);
    out.insert("rejected_videos".to_string(), batch.rejected_videos as i64);
    out.insert(
        "stale_hosts".to_string(),
        batch.reconciliation.stale_hosts.len() as i64,
    );
    out.insert(
        "dangling_similarity".to_string(),
        batch.dangling_similarity as i64,
    );
    out
}

pub fn index_counters(meta: &IndexMeta) -> BTreeMap<String, i64> {
    counters([
        ("total", meta.total),
        ("dimensions", meta.dimensions),
        ("bucket_count", meta.bucket_count),
    ])
}

pub fn similarity_counters(stats: &SimilarityStats) -> BTreeMap<String, i64> {
    counters([
        ("videos_considered", stats.videos_considered),
        ("edges_written", stats.edges_written),
        ("edges_replaced", stats.edges_replaced),
        ("edges_dropped_absent_video", stats.edges_dropped_absent_video),
        ("dangling_similarity", stats.dangling_similarity),
    ])
}

pub fn run_error(stage: &str, err: &anyhow::Error) -> RunError {
    RunError {
        stage: stage.to_string(),
        kind: error_kind(err).to_string(),
        message: err.to_string(),
        causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
    }
}

/// Overwrites the latest report and, when asked, archives a per-run copy.
pub fn write_run_report(paths: &PipelinePaths, report: &RunReport, archive: bool) -> Result<PathBuf> {
    let latest = paths.latest_report_path();
    write_json_pretty(&latest, report)?;
    if archive {
        write_json_pretty(&paths.archived_report_path(&report.run_id), report)?;
    }
    info!(path = %latest.display(), status = ?report.status, "run report written");
    Ok(latest)
}
