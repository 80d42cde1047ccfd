use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `{ "total": n, "data": [ { "host": "..." } ] }` as published by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFeed {
    pub total: usize,
    pub data: Vec<FeedHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedHost {
    pub host: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub host: String,
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub videos: Vec<VideoRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub likes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Allowed,
    Deny,
    Ignored,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeRule {
    /// Rows are only added; existing keyed rows are never touched.
    InsertOnly,
    /// Existing keyed rows are overwritten.
    InsertOrReplace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub hosts: usize,
    pub channels: usize,
    pub videos: usize,
    pub video_observations: usize,
    pub embeddings: usize,
    pub similarity_edges: usize,
}

impl PurgeCounts {
    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.hosts
            + self.channels
            + self.videos
            + self.video_observations
            + self.embeddings
            + self.similarity_edges
    }

    pub fn absorb(&mut self, other: &PurgeCounts) {
        self.hosts += other.hosts;
        self.channels += other.channels;
        self.videos += other.videos;
        self.video_observations += other.video_observations;
        self.embeddings += other.embeddings;
        self.similarity_edges += other.similarity_edges;
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([
            ("hosts_deleted".to_string(), self.hosts as i64),
            ("channels_deleted".to_string(), self.channels as i64),
            ("videos_deleted".to_string(), self.videos as i64),
            (
                "video_observations_deleted".to_string(),
                self.video_observations as i64,
            ),
            ("embeddings_deleted".to_string(), self.embeddings as i64),
            (
                "similarity_edges_deleted".to_string(),
                self.similarity_edges as i64,
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationCounters {
    pub kept: usize,
    pub filtered_by_denylist: usize,
    pub filtered_by_blocked_channel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFailure {
    pub host: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub hosts_listed: usize,
    pub hosts_denied: usize,
    pub hosts_crawled: usize,
    pub hosts_failed: usize,
    pub channels_staged: usize,
    pub videos_staged: usize,
    pub observations_staged: usize,
    pub failures: Vec<HostFailure>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFailure {
    pub video_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedStats {
    pub model_id: String,
    pub embedding_dim: usize,
    pub compute_mode: String,
    pub batch_size: usize,
    pub candidate_videos: usize,
    pub embedded_videos: usize,
    pub reused_embeddings: usize,
    pub failed_videos: usize,
    pub batches_committed: usize,
    pub failures: Vec<VideoFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMergeOutcome {
    pub table: String,
    pub rule: MergeRule,
    pub key_columns: Vec<String>,
    pub staging_rows: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub skipped_existing: usize,
    pub production_rows_after: usize,
    pub duplicate_key_groups: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostReconciliation {
    pub join_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub current_hosts: Vec<String>,
    pub effective_hosts: Vec<String>,
    pub stale_hosts: Vec<String>,
    pub roles: BTreeMap<String, HostRole>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeBatch {
    pub run_id: String,
    pub tables: Vec<TableMergeOutcome>,
    pub rejected_channels: usize,
    pub rejected_videos: usize,
    pub reconciliation: HostReconciliation,
    pub purged_hosts: BTreeMap<String, PurgeCounts>,
    pub purge_totals: PurgeCounts,
    pub dangling_similarity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub format_version: u32,
    pub total: usize,
    pub dimensions: usize,
    pub hyperplanes: u32,
    pub seed: u64,
    pub bucket_count: usize,
    pub model_id: String,
    pub built_at: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimilarityStats {
    pub compute_mode: String,
    pub videos_considered: usize,
    pub edges_written: usize,
    pub edges_replaced: usize,
    pub edges_dropped_absent_video: usize,
    pub neighbors_per_video: usize,
    pub min_score: f64,
    pub dangling_similarity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMarker {
    pub marker: String,
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: u128,
    pub counters: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub stage: String,
    pub kind: String,
    pub message: String,
    pub causes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: String,
    pub compute_mode: String,
    pub injected_failure: Option<String>,
    pub stages: Vec<StageMarker>,
    pub crawl: Option<CrawlStats>,
    pub embed: Option<EmbedStats>,
    pub merge: Option<MergeBatch>,
    pub index: Option<IndexMeta>,
    pub similarity: Option<SimilarityStats>,
    pub production_fingerprint_before: Option<String>,
    pub production_fingerprint_after: Option<String>,
    pub db_unchanged: Option<bool>,
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub pid: u32,
    pub acquired_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeededHost {
    pub host: String,
    pub role: HostRole,
    pub in_feed: bool,
    pub in_production: bool,
    pub channels: Vec<String>,
    pub videos: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureState {
    pub strategy: String,
    pub generated_at: String,
    pub source_dir: String,
    pub hosts: Vec<SeededHost>,
    pub denied_hosts: Vec<String>,
    pub blocked_channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvariantSummary {
    pub checked_at: String,
    pub duplicate_key_groups: BTreeMap<String, usize>,
    pub dangling_similarity_edges: usize,
    pub orphan_channels: usize,
    pub orphan_videos: usize,
    pub orphan_observations: usize,
    pub orphan_embeddings: usize,
    pub denied_hosts_present: Vec<String>,
    pub index_total: Option<usize>,
    pub index_expected: Option<usize>,
    pub index_file_total: Option<usize>,
}

impl InvariantSummary {
    pub fn violation_count(&self) -> usize {
        let index_mismatch = match (self.index_total, self.index_expected) {
            (Some(total), Some(expected)) if total != expected => 1,
            _ => 0,
        };
        let index_file_mismatch = match (self.index_file_total, self.index_total) {
            (Some(file_total), Some(total)) if file_total != total => 1,
            _ => 0,
        };

        self.duplicate_key_groups.values().sum::<usize>()
            + self.dangling_similarity_edges
            + self.orphan_channels
            + self.orphan_videos
            + self.orphan_observations
            + self.orphan_embeddings
            + self.denied_hosts_present.len()
            + index_mismatch
            + index_file_mismatch
    }
}
