use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Transaction, params};
use tracing::{info, warn};

use crate::model::{
    ChannelRecord, FeedHost, FixtureState, HostRole, HostSnapshot, SeededHost, SourceFeed,
    VideoRecord,
};
use crate::pipeline::config::PipelinePaths;
use crate::pipeline::crawl::{DirectorySource, SourceFetcher, join_universe};
use crate::pipeline::merge::classify_host;
use crate::pipeline::moderation::{block_channel, deny_host};
use crate::semantic::{
    EmbeddingModelConfig, embed_text_local, embedding_text_hash, encode_embedding_blob,
    video_payload_for_embedding,
};
use crate::store::{Stores, load_string_set};
use crate::util::{now_utc_string, write_json_pretty};

pub const FIXTURE_STATE_FILE: &str = "fixture_state.json";

/// Produces the source directory and production pre-state a run starts from.
pub trait FixtureSeeder {
    fn strategy(&self) -> &'static str;
    fn seed(&self) -> Result<FixtureState>;
}

pub fn fixture_state_path(paths: &PipelinePaths) -> PathBuf {
    paths.cache_root.join(FIXTURE_STATE_FILE)
}

/// Four hosts, one per role: allowed, deny, ignored and stale.
pub struct SyntheticSeeder {
    paths: PipelinePaths,
    model: EmbeddingModelConfig,
}

pub const ALLOWED_HOST: &str = "allowed.example";
pub const DENY_HOST: &str = "deny.example";
pub const IGNORED_HOST: &str = "ignored.example";
pub const STALE_HOST: &str = "stale.example";
pub const BLOCKED_CHANNEL: &str = "allowed-blocked";

impl SyntheticSeeder {
    pub fn new(paths: PipelinePaths, model: EmbeddingModelConfig) -> Self {
        Self { paths, model }
    }
}

fn video(video_id: &str, title: &str, description: &str) -> VideoRecord {
    VideoRecord {
        video_id: video_id.to_string(),
        title: title.to_string(),
        description: Some(description.to_string()),
        duration_secs: Some(600),
        published_at: Some("2026-01-01T00:00:00Z".to_string()),
        views: Some(100),
        likes: Some(10),
    }
}

fn channel(channel_id: &str, name: &str, videos: Vec<VideoRecord>) -> ChannelRecord {
    ChannelRecord {
        channel_id: channel_id.to_string(),
        name: Some(name.to_string()),
        followers_count: Some(25),
        videos,
    }
}

fn synthetic_snapshots() -> Vec<HostSnapshot> {
    vec![
        HostSnapshot {
            host: ALLOWED_HOST.to_string(),
            channels: vec![
                channel(
                    "allowed-main",
                    "Allowed Workshop",
                    vec![
                        video("allowed-v1", "Rust ownership explained", "borrowing and moves"),
                        video("allowed-v2", "Rust lifetimes in practice", "borrowing across functions"),
                        video("allowed-v3", "Async Rust with tokio", "futures and executors"),
                    ],
                ),
                channel(
                    BLOCKED_CHANNEL,
                    "Allowed But Blocked",
                    vec![video("allowed-v4", "Rust ownership rant", "borrowing again")],
                ),
            ],
        },
        HostSnapshot {
            host: DENY_HOST.to_string(),
            channels: vec![channel(
                "deny-main",
                "Denied Channel",
                vec![
                    video("deny-v1", "Rust ownership copy", "borrowing stolen"),
                    video("deny-v2", "Bread baking", "sourdough starter"),
                ],
            )],
        },
        HostSnapshot {
            host: IGNORED_HOST.to_string(),
            channels: vec![channel(
                "ignored-main",
                "Unlisted Channel",
                vec![video("ignored-v1", "Rust ownership mirror", "borrowing mirror")],
            )],
        },
    ]
}

fn stale_production_channel() -> ChannelRecord {
    channel(
        "stale-main",
        "Retired Channel",
        vec![
            video("stale-v1", "Rust ownership archive", "borrowing archive"),
            video("stale-v2", "Old async talk", "futures archive"),
        ],
    )
}

impl FixtureSeeder for SyntheticSeeder {
    fn strategy(&self) -> &'static str {
        "synthetic"
    }

    fn seed(&self) -> Result<FixtureState> {
        let source_dir = &self.paths.source_dir;
        let snapshots = synthetic_snapshots();

        let feed = SourceFeed {
            total: 2,
            data: [ALLOWED_HOST, DENY_HOST]
                .iter()
                .map(|host| FeedHost {
                    host: host.to_string(),
                    extra: BTreeMap::new(),
                })
                .collect(),
        };
        write_json_pretty(&DirectorySource::feed_path(source_dir), &feed)?;
        for snapshot in &snapshots {
            write_json_pretty(&DirectorySource::host_path(source_dir, &snapshot.host), snapshot)?;
        }

        let mut stores = Stores::open(&self.paths.production_db, &self.paths.similarity_db)?;
        let stale = stale_production_channel();
        let seeded_at = now_utc_string();
        let tx = stores.connection.transaction()?;
        write_production_channel(&tx, STALE_HOST, &stale, &self.model, &seeded_at)?;
        tx.commit().context("failed to commit seeded production rows")?;
        stores.connection.execute(
            "INSERT INTO similarity.similarity_edges(video_id, neighbor_video_id, score, computed_at)
             VALUES('stale-v1', 'stale-v2', 0.5, ?1)
             ON CONFLICT(video_id, neighbor_video_id) DO NOTHING",
            [&seeded_at],
        )?;
        deny_host(&stores.connection, DENY_HOST, Some("synthetic fixture"))?;
        block_channel(&stores.connection, BLOCKED_CHANNEL, Some("synthetic fixture"))?;

        let mut hosts = snapshots
            .iter()
            .map(|snapshot| {
                let role = match snapshot.host.as_str() {
                    ALLOWED_HOST => HostRole::Allowed,
                    DENY_HOST => HostRole::Deny,
                    _ => HostRole::Ignored,
                };
                seeded_host(&snapshot.host, role, role != HostRole::Ignored, false, &snapshot.channels)
            })
            .collect::<Vec<_>>();
        hosts.push(seeded_host(
            STALE_HOST,
            HostRole::Stale,
            false,
            true,
            std::slice::from_ref(&stale),
        ));

        let state = FixtureState {
            strategy: self.strategy().to_string(),
            generated_at: seeded_at,
            source_dir: source_dir.display().to_string(),
            hosts,
            denied_hosts: vec![DENY_HOST.to_string()],
            blocked_channels: vec![BLOCKED_CHANNEL.to_string()],
        };
        finish_seed(&self.paths, &state)?;
        Ok(state)
    }
}

/// Copies the first `sample` hosts of an existing source into the run's
/// source directory.
pub struct SampledSeeder {
    paths: PipelinePaths,
    from_dir: PathBuf,
    sample: usize,
}

impl SampledSeeder {
    pub fn new(paths: PipelinePaths, from_dir: &Path, sample: usize) -> Self {
        Self {
            paths,
            from_dir: from_dir.to_path_buf(),
            sample,
        }
    }
}

impl FixtureSeeder for SampledSeeder {
    fn strategy(&self) -> &'static str {
        "sampled"
    }

    fn seed(&self) -> Result<FixtureState> {
        if self.sample == 0 {
            bail!("sample size must be at least 1");
        }

        let origin = DirectorySource::new(&self.from_dir);
        let feed = origin
            .fetch_feed()
            .with_context(|| format!("failed to read source feed in {}", self.from_dir.display()))?;
        let (universe, warnings) = join_universe(&feed);
        for warning in &warnings {
            warn!(warning = %warning, "sampled feed");
        }

        let sampled = universe.into_iter().take(self.sample).collect::<Vec<_>>();
        let mut snapshots = Vec::new();
        for host in &sampled {
            match origin.fetch_host(host) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => warn!(host = %host, error = %err, "sampled host has no snapshot"),
            }
        }

        let sampled_feed = SourceFeed {
            total: sampled.len(),
            data: sampled
                .iter()
                .map(|host| FeedHost {
                    host: host.clone(),
                    extra: BTreeMap::new(),
                })
                .collect(),
        };
        let source_dir = &self.paths.source_dir;
        write_json_pretty(&DirectorySource::feed_path(source_dir), &sampled_feed)?;
        for snapshot in &snapshots {
            write_json_pretty(&DirectorySource::host_path(source_dir, &snapshot.host), snapshot)?;
        }

        let stores = Stores::open(&self.paths.production_db, &self.paths.similarity_db)?;
        let join = sampled.iter().cloned().collect::<BTreeSet<_>>();
        let denied = load_string_set(&stores.connection, "SELECT host FROM main.denied_hosts")?;
        let current = load_string_set(
            &stores.connection,
            "SELECT host FROM main.hosts UNION SELECT host FROM main.channels",
        )?;
        let blocked = load_string_set(&stores.connection, "SELECT channel_id FROM main.blocked_channels")?;

        let mut hosts = Vec::new();
        for host in join.union(&current).chain(denied.difference(&join)) {
            let channels = snapshots
                .iter()
                .find(|snapshot| &snapshot.host == host)
                .map(|snapshot| snapshot.channels.as_slice())
                .unwrap_or_default();
            hosts.push(seeded_host(
                host,
                classify_host(host, &join, &denied, &current),
                join.contains(host),
                current.contains(host),
                channels,
            ));
        }
        hosts.sort_by(|left, right| left.host.cmp(&right.host));
        hosts.dedup_by(|left, right| left.host == right.host);

        let state = FixtureState {
            strategy: self.strategy().to_string(),
            generated_at: now_utc_string(),
            source_dir: source_dir.display().to_string(),
            hosts,
            denied_hosts: denied.into_iter().collect(),
            blocked_channels: blocked.into_iter().collect(),
        };
        finish_seed(&self.paths, &state)?;
        Ok(state)
    }
}

fn seeded_host(
    host: &str,
    role: HostRole,
    in_feed: bool,
    in_production: bool,
    channels: &[ChannelRecord],
) -> SeededHost {
    SeededHost {
        host: host.to_string(),
        role,
        in_feed,
        in_production,
        channels: channels.iter().map(|channel| channel.channel_id.clone()).collect(),
        videos: channels
            .iter()
            .flat_map(|channel| channel.videos.iter().map(|video| video.video_id.clone()))
            .collect(),
    }
}

fn write_production_channel(
    tx: &Transaction<'_>,
    host: &str,
    channel: &ChannelRecord,
    model: &EmbeddingModelConfig,
    seeded_at: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO main.hosts(host, first_seen_at, last_crawled_at) VALUES(?1, ?2, ?2)
         ON CONFLICT(host) DO UPDATE SET last_crawled_at=excluded.last_crawled_at",
        params![host, seeded_at],
    )?;
    tx.execute(
        "INSERT INTO main.channels(channel_id, host, name, followers_count, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(channel_id) DO UPDATE SET host=excluded.host, name=excluded.name",
        params![channel.channel_id, host, channel.name, channel.followers_count, seeded_at],
    )?;

    for video in &channel.videos {
        tx.execute(
            "INSERT INTO main.videos(video_id, channel_id, title, description, duration_secs, published_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(video_id) DO UPDATE SET title=excluded.title",
            params![
                video.video_id,
                channel.channel_id,
                video.title,
                video.description,
                video.duration_secs,
                video.published_at,
                seeded_at,
            ],
        )?;

        let Some(payload) = video_payload_for_embedding(
            &video.title,
            video.description.as_deref(),
            channel.name.as_deref(),
        ) else {
            continue;
        };
        tx.execute(
            "INSERT INTO main.embeddings(video_id, model_id, embedding, embedding_dim, text_hash, generated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(video_id) DO NOTHING",
            params![
                video.video_id,
                model.model_id,
                encode_embedding_blob(&embed_text_local(&payload, model.dimensions)),
                model.dimensions as i64,
                embedding_text_hash(&payload),
                seeded_at,
            ],
        )?;
    }
    Ok(())
}

fn finish_seed(paths: &PipelinePaths, state: &FixtureState) -> Result<()> {
    let path = fixture_state_path(paths);
    write_json_pretty(&path, state)?;

    let videos = state.hosts.iter().map(|host| host.videos.len()).sum::<usize>();
    info!(
        marker = "seed",
        stage = "seed",
        status = "pass",
        strategy = %state.strategy,
        counters = %serde_json::json!({
            "hosts": state.hosts.len(),
            "videos": videos,
            "denied_hosts": state.denied_hosts.len(),
            "blocked_channels": state.blocked_channels.len(),
        }),
        path = %path.display(),
        "fixture seeded"
    );
    Ok(())
}
