use std::path::Path;

use anyhow::{Result, bail};
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::cli::CheckArgs;
use crate::commands::{open_stores, resolve_paths};
use crate::model::InvariantSummary;
use crate::pipeline::index::{load_index, read_index_meta};
use crate::pipeline::merge::{MERGE_TABLES, duplicate_key_groups};
use crate::pipeline::moderation::count_dangling_similarity;
use crate::store::load_string_set;
use crate::util::{now_utc_string, write_json_pretty};

pub fn run(args: CheckArgs) -> Result<()> {
    let mut paths = resolve_paths(&args.store);
    if let Some(index_path) = &args.index_path {
        paths.index_path = index_path.clone();
    }

    let stores = open_stores(&paths)?;
    let summary = collect_invariants(
        &stores.connection,
        &paths.index_path,
        &paths.index_meta_path(),
    )?;

    if let Some(report_path) = &args.report_path {
        write_json_pretty(report_path, &summary)?;
    }

    let violations = summary.violation_count();
    let counters = serde_json::json!({
        "duplicate_key_groups": summary.duplicate_key_groups.values().sum::<usize>(),
        "dangling_similarity_edges": summary.dangling_similarity_edges,
        "orphan_channels": summary.orphan_channels,
        "orphan_videos": summary.orphan_videos,
        "orphan_observations": summary.orphan_observations,
        "orphan_embeddings": summary.orphan_embeddings,
        "denied_hosts_present": summary.denied_hosts_present.len(),
        "violations": violations,
    });

    if violations > 0 {
        error!(marker = "check", stage = "check", status = "fail", counters = %counters, "invariant check failed");
        bail!("{violations} invariant violation(s) found");
    }

    info!(marker = "check", stage = "check", status = "pass", counters = %counters, "invariant check passed");
    Ok(())
}

pub fn collect_invariants(
    connection: &Connection,
    index_path: &Path,
    meta_path: &Path,
) -> Result<InvariantSummary> {
    let mut summary = InvariantSummary {
        checked_at: now_utc_string(),
        ..InvariantSummary::default()
    };

    for table in MERGE_TABLES {
        summary.duplicate_key_groups.insert(
            table.table.to_string(),
            duplicate_key_groups(connection, "main", table)?,
        );
    }

    summary.dangling_similarity_edges = count_dangling_similarity(connection)?;
    summary.orphan_channels = query_violation_count(
        connection,
        "
        SELECT COUNT(*)
        FROM main.channels c
        LEFT JOIN main.hosts h ON h.host = c.host
        WHERE h.host IS NULL
        ",
    )?;
    summary.orphan_videos = query_violation_count(
        connection,
        "
        SELECT COUNT(*)
        FROM main.videos v
        LEFT JOIN main.channels c ON c.channel_id = v.channel_id
        WHERE c.channel_id IS NULL
        ",
    )?;
    summary.orphan_observations = query_violation_count(
        connection,
        "
        SELECT COUNT(*)
        FROM main.video_observations o
        LEFT JOIN main.videos v ON v.video_id = o.video_id
        WHERE v.video_id IS NULL
        ",
    )?;
    summary.orphan_embeddings = query_violation_count(
        connection,
        "
        SELECT COUNT(*)
        FROM main.embeddings e
        LEFT JOIN main.videos v ON v.video_id = e.video_id
        WHERE v.video_id IS NULL
        ",
    )?;
    summary.denied_hosts_present = load_string_set(
        connection,
        "
        SELECT d.host
        FROM main.denied_hosts d
        WHERE d.host IN (SELECT host FROM main.hosts UNION SELECT host FROM main.channels)
        ",
    )?
    .into_iter()
    .collect();

    match read_index_meta(meta_path)? {
        Some(meta) => {
            summary.index_total = Some(meta.total);
            summary.index_expected = Some(query_violation_count(
                connection,
                "SELECT COUNT(*) FROM main.embeddings",
            )?);
            if index_path.exists() {
                summary.index_file_total = Some(load_index(index_path)?.len());
            } else {
                warn!(path = %index_path.display(), "index metadata present but index file missing");
            }
        }
        None => warn!(path = %meta_path.display(), "index metadata missing; skipping index checks"),
    }

    Ok(summary)
}

fn query_violation_count(connection: &Connection, sql: &str) -> Result<usize> {
    let count = connection.query_row(sql, [], |row| row.get::<_, i64>(0))?;
    Ok(count as usize)
}
