use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use regex::Regex;
use rusqlite::{Connection, Transaction, params};
use tracing::{info, warn};

use crate::model::{CrawlStats, HostFailure, HostSnapshot, SourceFeed};
use crate::util::read_json;

/// Transport for the allow-listed source: the feed plus one snapshot per host.
pub trait SourceFetcher: Sync {
    fn fetch_feed(&self) -> Result<SourceFeed>;
    fn fetch_host(&self, host: &str) -> Result<HostSnapshot>;
}

/// Reads `feed.json` and `hosts/<host>.json` below a source directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn feed_path(root: &Path) -> PathBuf {
        root.join("feed.json")
    }

    pub fn host_path(root: &Path, host: &str) -> PathBuf {
        root.join("hosts").join(format!("{host}.json"))
    }
}

impl SourceFetcher for DirectorySource {
    fn fetch_feed(&self) -> Result<SourceFeed> {
        read_json(&Self::feed_path(&self.root))
    }

    fn fetch_host(&self, host: &str) -> Result<HostSnapshot> {
        let path = Self::host_path(&self.root, host);
        if !path.exists() {
            bail!("no snapshot published for {host} at {}", path.display());
        }
        read_json(&path)
    }
}

pub struct HostValidator {
    pattern: Regex,
}

impl HostValidator {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(
            r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
        )
        .context("failed to compile host regex")?;
        Ok(Self { pattern })
    }

    pub fn is_valid(&self, host: &str) -> bool {
        host.len() <= 253 && self.pattern.is_match(host)
    }
}

pub fn normalize_host(raw: &str) -> String {
    raw.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The crawl universe (`join_hosts`) named by the feed, deduplicated.
pub fn join_universe(feed: &SourceFeed) -> (Vec<String>, Vec<String>) {
    let mut warnings = Vec::new();
    if feed.total != feed.data.len() {
        warnings.push(format!(
            "feed total {} does not match {} listed hosts",
            feed.total,
            feed.data.len()
        ));
    }

    let mut seen = BTreeSet::new();
    for entry in &feed.data {
        let host = normalize_host(&entry.host);
        if host.is_empty() {
            warnings.push("feed entry with empty host skipped".to_string());
            continue;
        }
        if !seen.insert(host.clone()) {
            warnings.push(format!("duplicate feed host collapsed: {host}"));
        }
    }

    (seen.into_iter().collect(), warnings)
}

enum HostOutcome {
    Fetched(HostSnapshot, u32),
    Failed(HostFailure),
}

/// Crawls every feed host into staging. Denied hosts still count toward
/// `join_hosts` but are never fetched, so nothing they publish reaches the merge.
pub fn run_crawl(
    staging: &mut Connection,
    fetcher: &dyn SourceFetcher,
    denied: &BTreeSet<String>,
    workers: usize,
    retries: u32,
    crawled_at: &str,
) -> Result<CrawlStats> {
    let feed = fetcher.fetch_feed().context("failed to fetch source feed")?;
    let (hosts, warnings) = join_universe(&feed);
    for warning in &warnings {
        warn!(warning = %warning, "source feed");
    }

    record_join_hosts(staging, &hosts, crawled_at)?;

    let (skipped, hosts): (Vec<String>, Vec<String>) =
        hosts.into_iter().partition(|host| denied.contains(host));
    for host in &skipped {
        info!(host = %host, "denied host not crawled");
    }

    let validator = HostValidator::new()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .context("failed to build crawl worker pool")?;

    let outcomes = pool.install(|| {
        hosts
            .par_iter()
            .map(|host| crawl_host(fetcher, &validator, host, retries))
            .collect::<Vec<HostOutcome>>()
    });

    let mut stats = CrawlStats {
        hosts_listed: hosts.len() + skipped.len(),
        hosts_denied: skipped.len(),
        warnings,
        ..CrawlStats::default()
    };

    for outcome in outcomes {
        match outcome {
            HostOutcome::Fetched(snapshot, attempts) => {
                let host = snapshot.host.clone();
                match stage_host_snapshot(staging, &snapshot, crawled_at) {
                    Ok(staged) => {
                        stats.hosts_crawled += 1;
                        stats.channels_staged += staged.channels;
                        stats.videos_staged += staged.videos;
                        stats.observations_staged += staged.observations;
                        info!(
                            host = %host,
                            attempts,
                            channels = staged.channels,
                            videos = staged.videos,
                            "host staged"
                        );
                    }
                    Err(err) => {
                        warn!(host = %host, error = %err, "failed to stage host");
                        stats.failures.push(HostFailure {
                            host,
                            attempts,
                            error: format!("{err:#}"),
                        });
                    }
                }
            }
            HostOutcome::Failed(failure) => {
                warn!(
                    host = %failure.host,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "host crawl failed"
                );
                stats.failures.push(failure);
            }
        }
    }

    stats.hosts_failed = stats.failures.len();
    Ok(stats)
}

fn crawl_host(
    fetcher: &dyn SourceFetcher,
    validator: &HostValidator,
    host: &str,
    retries: u32,
) -> HostOutcome {
    if !validator.is_valid(host) {
        return HostOutcome::Failed(HostFailure {
            host: host.to_string(),
            attempts: 0,
            error: "host is not a valid domain name".to_string(),
        });
    }

    let mut last_error = String::new();
    let max_attempts = retries.saturating_add(1);
    for attempt in 1..=max_attempts {
        match fetcher.fetch_host(host) {
            Ok(mut snapshot) => {
                let reported = normalize_host(&snapshot.host);
                if reported != host {
                    return HostOutcome::Failed(HostFailure {
                        host: host.to_string(),
                        attempts: attempt,
                        error: format!("snapshot reports host {reported}"),
                    });
                }
                snapshot.host = reported;
                return HostOutcome::Fetched(snapshot, attempt);
            }
            Err(err) => last_error = format!("{err:#}"),
        }
    }

    HostOutcome::Failed(HostFailure {
        host: host.to_string(),
        attempts: max_attempts,
        error: last_error,
    })
}

fn record_join_hosts(staging: &mut Connection, hosts: &[String], listed_at: &str) -> Result<()> {
    let tx = staging.transaction()?;
    {
        let mut statement = tx.prepare(
            "INSERT INTO join_hosts(host, listed_at) VALUES(?1, ?2)
             ON CONFLICT(host) DO UPDATE SET listed_at=excluded.listed_at",
        )?;
        for host in hosts {
            statement.execute(params![host, listed_at])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[derive(Debug, Default)]
struct StagedCounts {
    channels: usize,
    videos: usize,
    observations: usize,
}

fn stage_host_snapshot(
    staging: &mut Connection,
    snapshot: &HostSnapshot,
    crawled_at: &str,
) -> Result<StagedCounts> {
    let tx = staging.transaction()?;
    let counts = write_snapshot(&tx, snapshot, crawled_at)?;
    tx.commit()?;
    Ok(counts)
}

fn write_snapshot(
    tx: &Transaction<'_>,
    snapshot: &HostSnapshot,
    crawled_at: &str,
) -> Result<StagedCounts> {
    let mut counts = StagedCounts::default();

    tx.execute(
        "INSERT INTO hosts(host, first_seen_at, last_crawled_at) VALUES(?1, ?2, ?2)
         ON CONFLICT(host) DO UPDATE SET last_crawled_at=excluded.last_crawled_at",
        params![snapshot.host, crawled_at],
    )?;

    let mut channel_statement = tx.prepare(
        "INSERT INTO channels(channel_id, host, name, followers_count, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(channel_id) DO UPDATE SET
           host=excluded.host,
           name=excluded.name,
           followers_count=excluded.followers_count,
           updated_at=excluded.updated_at",
    )?;
    let mut video_statement = tx.prepare(
        "INSERT INTO videos(video_id, channel_id, title, description, duration_secs, published_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(video_id) DO UPDATE SET
           channel_id=excluded.channel_id,
           title=excluded.title,
           description=excluded.description,
           duration_secs=excluded.duration_secs,
           published_at=excluded.published_at,
           updated_at=excluded.updated_at",
    )?;
    let mut observation_statement = tx.prepare(
        "INSERT INTO video_observations(video_id, observed_at, views, likes)
         SELECT ?1, ?2, ?3, ?4
         WHERE NOT EXISTS (
           SELECT 1 FROM video_observations WHERE video_id = ?1 AND observed_at = ?2
         )",
    )?;

    for channel in &snapshot.channels {
        if channel.channel_id.trim().is_empty() {
            bail!("channel without id in snapshot for {}", snapshot.host);
        }
        channel_statement.execute(params![
            channel.channel_id,
            snapshot.host,
            channel.name,
            channel.followers_count,
            crawled_at,
        ])?;
        counts.channels += 1;

        for video in &channel.videos {
            if video.video_id.trim().is_empty() {
                bail!("video without id in channel {}", channel.channel_id);
            }
            video_statement.execute(params![
                video.video_id,
                channel.channel_id,
                video.title,
                video.description,
                video.duration_secs,
                video.published_at,
                crawled_at,
            ])?;
            counts.videos += 1;

            counts.observations += observation_statement.execute(params![
                video.video_id,
                crawled_at,
                video.views,
                video.likes,
            ])?;
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use super::*;
    use crate::model::{ChannelRecord, FeedHost, VideoRecord};
    use crate::store::{count_rows, ensure_dataset_schema, load_string_set};

    struct MemorySource {
        feed: SourceFeed,
        hosts: HashMap<String, HostSnapshot>,
        flaky_failures: Mutex<HashMap<String, u32>>,
    }

    impl SourceFetcher for MemorySource {
        fn fetch_feed(&self) -> Result<SourceFeed> {
            Ok(self.feed.clone())
        }

        fn fetch_host(&self, host: &str) -> Result<HostSnapshot> {
            let mut flaky = self.flaky_failures.lock().expect("flaky lock");
            if let Some(remaining) = flaky.get_mut(host) {
                if *remaining > 0 {
                    *remaining -= 1;
                    bail!("transient failure for {host}");
                }
            }
            self.hosts
                .get(host)
                .cloned()
                .with_context(|| format!("unknown host {host}"))
        }
    }

    fn feed_of(hosts: &[&str]) -> SourceFeed {
        SourceFeed {
            total: hosts.len(),
            data: hosts
                .iter()
                .map(|host| FeedHost {
                    host: host.to_string(),
                    extra: BTreeMap::new(),
                })
                .collect(),
        }
    }

    fn snapshot(host: &str, channel: &str, videos: &[&str]) -> HostSnapshot {
        HostSnapshot {
            host: host.to_string(),
            channels: vec![ChannelRecord {
                channel_id: channel.to_string(),
                name: Some(format!("{channel} name")),
                followers_count: Some(10),
                videos: videos
                    .iter()
                    .map(|video_id| VideoRecord {
                        video_id: video_id.to_string(),
                        title: format!("title {video_id}"),
                        description: None,
                        duration_secs: Some(60),
                        published_at: None,
                        views: Some(5),
                        likes: Some(1),
                    })
                    .collect(),
            }],
        }
    }

    fn staging() -> Connection {
        let connection = Connection::open_in_memory().expect("open");
        ensure_dataset_schema(&connection).expect("schema");
        connection
    }

    #[test]
    fn join_universe_normalizes_and_deduplicates() {
        let mut feed = feed_of(&["A.example.", "a.example", "b.example", "  "]);
        feed.total = 7;
        let (hosts, warnings) = join_universe(&feed);
        assert_eq!(hosts, vec!["a.example".to_string(), "b.example".to_string()]);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn host_validator_rejects_paths_and_bare_labels() {
        let validator = HostValidator::new().expect("validator");
        assert!(validator.is_valid("videos.example.org"));
        assert!(!validator.is_valid("../etc/passwd"));
        assert!(!validator.is_valid("localhost"));
        assert!(!validator.is_valid("-bad.example"));
    }

    #[test]
    fn per_host_failure_does_not_block_other_hosts() {
        let source = MemorySource {
            feed: feed_of(&["good.example", "missing.example", "flaky.example"]),
            hosts: HashMap::from([
                (
                    "good.example".to_string(),
                    snapshot("good.example", "c-good", &["v1", "v2"]),
                ),
                (
                    "flaky.example".to_string(),
                    snapshot("flaky.example", "c-flaky", &["v3"]),
                ),
            ]),
            flaky_failures: Mutex::new(HashMap::from([("flaky.example".to_string(), 1)])),
        };

        let mut connection = staging();
        let stats =
            run_crawl(&mut connection, &source, &BTreeSet::new(), 2, 1, "2026-01-01T00:00:00Z").expect("crawl");

        assert_eq!(stats.hosts_listed, 3);
        assert_eq!(stats.hosts_crawled, 2);
        assert_eq!(stats.hosts_failed, 1);
        assert_eq!(stats.failures[0].host, "missing.example");
        assert_eq!(stats.failures[0].attempts, 2);
        assert_eq!(stats.videos_staged, 3);

        let join = load_string_set(&connection, "SELECT host FROM join_hosts").expect("join");
        assert_eq!(join.len(), 3);
        let videos = count_rows(&connection, "SELECT COUNT(*) FROM videos").expect("count");
        assert_eq!(videos, 3);
    }

    #[test]
    fn denied_hosts_stay_in_the_universe_but_are_not_fetched() {
        let source = MemorySource {
            feed: feed_of(&["good.example", "deny.example"]),
            hosts: HashMap::from([
                (
                    "good.example".to_string(),
                    snapshot("good.example", "c-good", &["v1"]),
                ),
                (
                    "deny.example".to_string(),
                    snapshot("deny.example", "c-deny", &["v1", "d1"]),
                ),
            ]),
            flaky_failures: Mutex::new(HashMap::new()),
        };
        let denied = BTreeSet::from(["deny.example".to_string()]);

        let mut connection = staging();
        let stats = run_crawl(&mut connection, &source, &denied, 2, 0, "2026-01-01T00:00:00Z")
            .expect("crawl");

        assert_eq!(stats.hosts_listed, 2);
        assert_eq!(stats.hosts_denied, 1);
        assert_eq!(stats.hosts_crawled, 1);
        assert_eq!(stats.hosts_failed, 0);

        let join = load_string_set(&connection, "SELECT host FROM join_hosts").expect("join");
        assert!(join.contains("deny.example"));
        let staged_hosts = load_string_set(&connection, "SELECT host FROM channels").expect("hosts");
        assert_eq!(staged_hosts.into_iter().collect::<Vec<_>>(), vec!["good.example"]);
        let owner: String = connection
            .query_row("SELECT channel_id FROM videos WHERE video_id = 'v1'", [], |row| row.get(0))
            .expect("owner");
        assert_eq!(owner, "c-good");
    }

    #[test]
    fn snapshot_for_wrong_host_is_a_failure() {
        let source = MemorySource {
            feed: feed_of(&["a.example"]),
            hosts: HashMap::from([(
                "a.example".to_string(),
                snapshot("b.example", "c-1", &["v1"]),
            )]),
            flaky_failures: Mutex::new(HashMap::new()),
        };

        let mut connection = staging();
        let stats =
            run_crawl(&mut connection, &source, &BTreeSet::new(), 1, 0, "2026-01-01T00:00:00Z").expect("crawl");
        assert_eq!(stats.hosts_failed, 1);
        assert!(stats.failures[0].error.contains("b.example"));
    }

    #[test]
    fn repeated_video_in_snapshot_stages_one_observation() {
        let mut snap = snapshot("a.example", "c-1", &["v1"]);
        let duplicate = snap.channels[0].videos[0].clone();
        snap.channels[0].videos.push(duplicate);

        let source = MemorySource {
            feed: feed_of(&["a.example"]),
            hosts: HashMap::from([("a.example".to_string(), snap)]),
            flaky_failures: Mutex::new(HashMap::new()),
        };

        let mut connection = staging();
        let stats =
            run_crawl(&mut connection, &source, &BTreeSet::new(), 1, 0, "2026-01-01T00:00:00Z").expect("crawl");
        assert_eq!(stats.observations_staged, 1);
    }
}
