use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{ModerationCounters, PurgeCounts};
use crate::pipeline::crawl::normalize_host;
use crate::pipeline::error::PipelineError;
use crate::store::{Stores, load_string_set};
use crate::util::now_utc_string;

const HOST_VIDEOS_SQL: &str = "
    SELECT v.video_id
    FROM main.videos v
    JOIN main.channels c ON c.channel_id = v.channel_id
    WHERE c.host = ?1
";

const DANGLING_EDGE_PREDICATE: &str = "
    NOT EXISTS (SELECT 1 FROM main.videos v WHERE v.video_id = e.video_id)
    OR NOT EXISTS (SELECT 1 FROM main.videos v WHERE v.video_id = e.neighbor_video_id)
";

/// Deletes the production rows that depend on `host`.
///
/// Runs on whatever transaction the caller holds. Similarity edges touching
/// the host's videos are counted here but deleted by
/// [`sweep_dangling_similarity`], which runs once production has committed.
pub fn purge_host_rows(connection: &Connection, host: &str) -> Result<PurgeCounts> {
    let similarity_edges = count_host_similarity_edges(connection, host)?;
    let embeddings = connection
        .execute(
            &format!("DELETE FROM main.embeddings WHERE video_id IN ({HOST_VIDEOS_SQL})"),
            [host],
        )
        .with_context(|| format!("failed to purge embeddings for {host}"))?;
    let video_observations = connection
        .execute(
            &format!("DELETE FROM main.video_observations WHERE video_id IN ({HOST_VIDEOS_SQL})"),
            [host],
        )
        .with_context(|| format!("failed to purge video observations for {host}"))?;
    let videos = connection
        .execute(
            "DELETE FROM main.videos
             WHERE channel_id IN (SELECT channel_id FROM main.channels WHERE host = ?1)",
            [host],
        )
        .with_context(|| format!("failed to purge videos for {host}"))?;
    let channels = connection
        .execute("DELETE FROM main.channels WHERE host = ?1", [host])
        .with_context(|| format!("failed to purge channels for {host}"))?;
    let hosts = connection
        .execute("DELETE FROM main.hosts WHERE host = ?1", [host])
        .with_context(|| format!("failed to purge host row for {host}"))?;

    Ok(PurgeCounts {
        hosts,
        channels,
        videos,
        video_observations,
        embeddings,
        similarity_edges,
    })
}

/// Edges touching `host`'s videos whose endpoints both still exist, so an edge
/// shared by two purged hosts is credited to the first one only.
fn count_host_similarity_edges(connection: &Connection, host: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM similarity.similarity_edges AS e
                 WHERE (e.video_id IN ({HOST_VIDEOS_SQL})
                        OR e.neighbor_video_id IN ({HOST_VIDEOS_SQL}))
                   AND e.video_id IN (SELECT video_id FROM main.videos)
                   AND e.neighbor_video_id IN (SELECT video_id FROM main.videos)"
            ),
            [host],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count similarity edges for {host}"))?;
    Ok(count as usize)
}

/// Removes every similarity edge with an endpoint missing from production.
pub fn sweep_dangling_similarity(connection: &Connection) -> Result<usize> {
    let removed = connection
        .execute(
            &format!("DELETE FROM similarity.similarity_edges AS e WHERE {DANGLING_EDGE_PREDICATE}"),
            [],
        )
        .context("failed to sweep dangling similarity edges")?;
    Ok(removed)
}

pub fn count_dangling_similarity(connection: &Connection) -> Result<usize> {
    let count: i64 = connection
        .query_row(
            &format!(
                "SELECT COUNT(*) FROM similarity.similarity_edges AS e WHERE {DANGLING_EDGE_PREDICATE}"
            ),
            [],
            |row| row.get(0),
        )
        .context("failed to count dangling similarity edges")?;
    Ok(count as usize)
}

/// Fails with `DanglingSimilarity` if any edge points outside production.
pub fn assert_no_dangling_similarity(connection: &Connection, stage: &str) -> Result<usize> {
    let dangling = count_dangling_similarity(connection)?;
    info!(stage, dangling_similarity = dangling, "dangling similarity check");
    if dangling > 0 {
        return Err(PipelineError::DanglingSimilarity {
            stage: stage.to_string(),
            count: dangling,
        }
        .into());
    }
    Ok(dangling)
}

/// Removes `host` and everything depending on it from production and then
/// from the similarity store. A second call for the same host is a no-op.
pub fn purge_host(stores: &mut Stores, host: &str) -> Result<PurgeCounts> {
    let host = normalize_host(host);

    let tx = stores.connection.transaction()?;
    let counts = purge_host_rows(&tx, &host)?;
    tx.commit()
        .with_context(|| format!("failed to commit production purge for {host}"))?;

    let swept = sweep_dangling_similarity(&stores.connection)?;
    if swept > counts.similarity_edges {
        warn!(
            host = %host,
            edges = swept - counts.similarity_edges,
            "unrelated dangling similarity edges removed"
        );
    }
    assert_no_dangling_similarity(&stores.connection, "purge")?;

    info!(
        marker = "purge",
        host = %host,
        counters = %serde_json::json!(counts.counters()),
        "host purged"
    );

    Ok(counts)
}

pub fn deny_host(connection: &Connection, host: &str, reason: Option<&str>) -> Result<bool> {
    let host = normalize_host(host);
    let changed = connection.execute(
        "INSERT INTO main.denied_hosts(host, reason, added_at) VALUES(?1, ?2, ?3)
         ON CONFLICT(host) DO UPDATE SET reason=COALESCE(excluded.reason, reason)",
        params![host, reason, now_utc_string()],
    )?;
    info!(host = %host, "host denylisted");
    Ok(changed > 0)
}

pub fn allow_host(connection: &Connection, host: &str) -> Result<bool> {
    let host = normalize_host(host);
    let removed = connection.execute("DELETE FROM main.denied_hosts WHERE host = ?1", [&host])?;
    if removed == 0 {
        warn!(host = %host, "host was not denylisted");
    }
    Ok(removed > 0)
}

pub fn block_channel(connection: &Connection, channel_id: &str, reason: Option<&str>) -> Result<bool> {
    let channel_id = channel_id.trim();
    let changed = connection.execute(
        "INSERT INTO main.blocked_channels(channel_id, reason, added_at) VALUES(?1, ?2, ?3)
         ON CONFLICT(channel_id) DO UPDATE SET reason=COALESCE(excluded.reason, reason)",
        params![channel_id, reason, now_utc_string()],
    )?;
    info!(channel_id, "channel blocked");
    Ok(changed > 0)
}

pub fn unblock_channel(connection: &Connection, channel_id: &str) -> Result<bool> {
    let channel_id = channel_id.trim();
    let removed = connection.execute(
        "DELETE FROM main.blocked_channels WHERE channel_id = ?1",
        [channel_id],
    )?;
    if removed == 0 {
        warn!(channel_id, "channel was not blocked");
    }
    Ok(removed > 0)
}

/// Denylist and blocklist as of one read.
#[derive(Debug, Clone, Default)]
pub struct ModerationSnapshot {
    pub denylist: HashSet<String>,
    pub blocklist: HashSet<String>,
}

impl ModerationSnapshot {
    pub fn load(connection: &Connection) -> Result<Self> {
        let denylist = load_string_set(connection, "SELECT host FROM main.denied_hosts")?
            .into_iter()
            .map(|host| normalize_host(&host))
            .collect();
        let blocklist = load_string_set(connection, "SELECT channel_id FROM main.blocked_channels")?
            .into_iter()
            .collect();
        Ok(Self {
            denylist,
            blocklist,
        })
    }
}

/// A candidate result row as seen by the serving filter.
pub trait ModeratedRow {
    fn host(&self) -> &str;
    fn channel_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingRow {
    pub video_id: String,
    pub channel_id: String,
    pub host: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ModeratedRow for ServingRow {
    fn host(&self) -> &str {
        &self.host
    }

    fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

/// The one serving-time moderation filter. Never touches storage.
///
/// A row matching both lists is counted once, under the denylist.
pub fn apply_serving_moderation_filters<R: ModeratedRow>(
    rows: Vec<R>,
    denylist: &HashSet<String>,
    blocklist: &HashSet<String>,
) -> (Vec<R>, ModerationCounters) {
    let mut counters = ModerationCounters::default();
    let mut kept = Vec::with_capacity(rows.len());

    for row in rows {
        if denylist.contains(&normalize_host(row.host())) {
            counters.filtered_by_denylist += 1;
            continue;
        }
        if blocklist.contains(row.channel_id().trim()) {
            counters.filtered_by_blocked_channel += 1;
            continue;
        }
        kept.push(row);
    }

    counters.kept = kept.len();
    (kept, counters)
}
