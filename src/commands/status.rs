use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{open_stores, resolve_paths};
use crate::model::RunReport;
use crate::pipeline::index::read_index_meta;
use crate::pipeline::lock::read_holder;
use crate::store::count_rows;
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let paths = resolve_paths(&args.store);
    info!(cache_root = %paths.cache_root.display(), "status requested");

    let report_path = paths.latest_report_path();
    if report_path.exists() {
        let report: RunReport = read_json(&report_path)?;
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            started_at = %report.started_at,
            finished_at = %report.finished_at,
            compute_mode = %report.compute_mode,
            injected_failure = %report.injected_failure.unwrap_or_default(),
            failed_stage = %report.error.as_ref().map(|error| error.stage.as_str()).unwrap_or_default(),
            failure_kind = %report.error.as_ref().map(|error| error.kind.as_str()).unwrap_or_default(),
            db_unchanged = ?report.db_unchanged,
            "latest run report"
        );
    } else {
        warn!(path = %report_path.display(), "no run report yet");
    }

    if paths.lock_path.exists() {
        let holder = read_holder(&paths.lock_path);
        info!(
            path = %paths.lock_path.display(),
            run_id = %holder.run_id,
            pid = holder.pid,
            acquired_at = %holder.acquired_at,
            "run lock held"
        );
    } else {
        info!(path = %paths.lock_path.display(), "run lock free");
    }

    if paths.production_db.exists() {
        let stores = open_stores(&paths)?;
        let conn = &stores.connection;
        info!(
            path = %paths.production_db.display(),
            hosts = count_rows(conn, "SELECT COUNT(*) FROM main.hosts").unwrap_or(0),
            channels = count_rows(conn, "SELECT COUNT(*) FROM main.channels").unwrap_or(0),
            videos = count_rows(conn, "SELECT COUNT(*) FROM main.videos").unwrap_or(0),
            observations = count_rows(conn, "SELECT COUNT(*) FROM main.video_observations").unwrap_or(0),
            embeddings = count_rows(conn, "SELECT COUNT(*) FROM main.embeddings").unwrap_or(0),
            similarity_edges = count_rows(conn, "SELECT COUNT(*) FROM similarity.similarity_edges").unwrap_or(0),
            denied_hosts = count_rows(conn, "SELECT COUNT(*) FROM main.denied_hosts").unwrap_or(0),
            blocked_channels = count_rows(conn, "SELECT COUNT(*) FROM main.blocked_channels").unwrap_or(0),
            "store status"
        );
    } else {
        warn!(path = %paths.production_db.display(), "production store missing");
    }

    match read_index_meta(&paths.index_meta_path())? {
        Some(meta) => info!(
            path = %paths.index_path.display(),
            total = meta.total,
            dimensions = meta.dimensions,
            model_id = %meta.model_id,
            built_at = %meta.built_at,
            checksum = %meta.checksum,
            "index status"
        ),
        None => warn!(path = %paths.index_path.display(), "index not built yet"),
    }

    Ok(())
}
