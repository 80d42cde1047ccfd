use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use tracing::{info, warn};

use crate::model::{HostReconciliation, HostRole, MergeBatch, MergeRule, TableMergeOutcome};
use crate::pipeline::error::PipelineError;
use crate::pipeline::moderation::{
    assert_no_dangling_similarity, purge_host_rows, sweep_dangling_similarity,
};
use crate::store::{Stores, count_rows, load_string_set};

/// One staging table promoted into production.
#[derive(Debug, Clone, Copy)]
pub struct MergeTable {
    pub table: &'static str,
    pub rule: MergeRule,
    pub key_columns: &'static [&'static str],
    pub columns: &'static [&'static str],
    /// Columns overwritten on key conflict under `InsertOrReplace`.
    pub replace_columns: &'static [&'static str],
}

pub const MERGE_TABLES: &[MergeTable] = &[
    MergeTable {
        table: "hosts",
        rule: MergeRule::InsertOrReplace,
        key_columns: &["host"],
        columns: &["host", "first_seen_at", "last_crawled_at"],
        replace_columns: &["last_crawled_at"],
    },
    MergeTable {
        table: "channels",
        rule: MergeRule::InsertOrReplace,
        key_columns: &["channel_id"],
        columns: &["channel_id", "host", "name", "followers_count", "updated_at"],
        replace_columns: &["host", "name", "followers_count", "updated_at"],
    },
    MergeTable {
        table: "videos",
        rule: MergeRule::InsertOrReplace,
        key_columns: &["video_id"],
        columns: &[
            "video_id",
            "channel_id",
            "title",
            "description",
            "duration_secs",
            "published_at",
            "updated_at",
        ],
        replace_columns: &[
            "channel_id",
            "title",
            "description",
            "duration_secs",
            "published_at",
            "updated_at",
        ],
    },
    MergeTable {
        table: "video_observations",
        rule: MergeRule::InsertOnly,
        key_columns: &["video_id", "observed_at"],
        columns: &["video_id", "observed_at", "views", "likes"],
        replace_columns: &[],
    },
    MergeTable {
        table: "embeddings",
        rule: MergeRule::InsertOrReplace,
        key_columns: &["video_id"],
        columns: &[
            "video_id",
            "model_id",
            "embedding",
            "embedding_dim",
            "text_hash",
            "generated_at",
        ],
        replace_columns: &[
            "model_id",
            "embedding",
            "embedding_dim",
            "text_hash",
            "generated_at",
        ],
    },
];

/// Promotes the staging file into production and reconciles the host set.
///
/// Staging is attached only for the duration of the call.
pub fn merge_staging(stores: &mut Stores, staging_path: &Path, run_id: &str) -> Result<MergeBatch> {
    stores.attach_staging(staging_path)?;
    let merged = merge_attached(&mut stores.connection, run_id);
    let detached = stores.detach_staging();
    let batch = merged?;
    detached?;
    Ok(batch)
}

/// Runs the merge against a connection that already has `staging` and
/// `similarity` attached.
///
/// Phase one (rules, duplicate-key check, stale-host purge) is one production
/// transaction. Phase two sweeps similarity edges orphaned by phase one and
/// then re-checks for dangling edges.
pub fn merge_attached(connection: &mut Connection, run_id: &str) -> Result<MergeBatch> {
    let mut batch = MergeBatch {
        run_id: run_id.to_string(),
        ..MergeBatch::default()
    };

    let tx = connection.transaction()?;

    let rejected = reject_staging_rows(&tx)?;
    if rejected.channels + rejected.videos > 0 {
        warn!(
            channels = rejected.channels,
            videos = rejected.videos,
            "staging rows from denied hosts or ownership moves dropped"
        );
    }
    batch.rejected_channels = rejected.channels;
    batch.rejected_videos = rejected.videos;

    for table in MERGE_TABLES {
        let outcome = apply_merge_rule(&tx, table)?;
        info!(
            table = table.table,
            rule = ?table.rule,
            staging_rows = outcome.staging_rows,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            skipped_existing = outcome.skipped_existing,
            "merge rule applied"
        );
        batch.tables.push(outcome);
    }

    for (table, outcome) in MERGE_TABLES.iter().zip(batch.tables.iter_mut()) {
        let groups = duplicate_key_groups(&tx, "main", table)?;
        outcome.duplicate_key_groups = groups;
        if groups > 0 {
            let sample_keys = sample_duplicate_keys(&tx, "main", table, 5)?;
            return Err(PipelineError::MergeIntegrity {
                table: table.table.to_string(),
                groups,
                sample_keys,
            }
            .into());
        }
    }

    let join = load_string_set(&tx, "SELECT host FROM staging.join_hosts")?;
    let denied = load_string_set(&tx, "SELECT host FROM main.denied_hosts")?;
    let current = load_current_hosts(&tx)?;
    batch.reconciliation = reconcile(&join, &denied, &current);

    for host in &batch.reconciliation.stale_hosts {
        let counts = purge_host_rows(&tx, host)?;
        info!(host = %host, videos = counts.videos, "stale host purged");
        batch.purge_totals.absorb(&counts);
        batch.purged_hosts.insert(host.clone(), counts);
    }

    for outcome in &mut batch.tables {
        outcome.production_rows_after =
            count_rows(&tx, &format!("SELECT COUNT(*) FROM main.{}", outcome.table))? as usize;
    }

    tx.commit().context("failed to commit production merge")?;

    let swept = sweep_dangling_similarity(connection)?;
    if swept > batch.purge_totals.similarity_edges {
        warn!(
            edges = swept - batch.purge_totals.similarity_edges,
            "dangling similarity edges not owned by a purged host removed"
        );
    }
    batch.dangling_similarity = assert_no_dangling_similarity(connection, "merge")?;

    Ok(batch)
}

#[derive(Debug, Default)]
struct RejectedRows {
    channels: usize,
    videos: usize,
}

const EFFECTIVE_HOSTS_SQL: &str = "
    SELECT host FROM staging.join_hosts
    WHERE host NOT IN (SELECT host FROM main.denied_hosts)
";

/// Drops staging rows that must not reach production: anything owned by a
/// denied host, and channels or videos that production already attributes to
/// a different host that is still being crawled.
fn reject_staging_rows(tx: &Transaction<'_>) -> Result<RejectedRows> {
    tx.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS merge_rejected_channels(channel_id TEXT PRIMARY KEY);
         CREATE TEMP TABLE IF NOT EXISTS merge_rejected_videos(video_id TEXT PRIMARY KEY);
         DELETE FROM temp.merge_rejected_channels;
         DELETE FROM temp.merge_rejected_videos;",
    )
    .context("failed to prepare merge rejection tables")?;

    tx.execute(
        "INSERT OR IGNORE INTO temp.merge_rejected_channels(channel_id)
         SELECT channel_id FROM staging.channels
         WHERE host IN (SELECT host FROM main.denied_hosts)",
        [],
    )?;
    tx.execute(
        &format!(
            "INSERT OR IGNORE INTO temp.merge_rejected_channels(channel_id)
             SELECT s.channel_id
             FROM staging.channels s
             JOIN main.channels p ON p.channel_id = s.channel_id
             WHERE p.host <> s.host AND p.host IN ({EFFECTIVE_HOSTS_SQL})"
        ),
        [],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO temp.merge_rejected_videos(video_id)
         SELECT video_id FROM staging.videos
         WHERE channel_id IN (SELECT channel_id FROM temp.merge_rejected_channels)",
        [],
    )?;
    tx.execute(
        &format!(
            "INSERT OR IGNORE INTO temp.merge_rejected_videos(video_id)
             SELECT s.video_id
             FROM staging.videos s
             JOIN staging.channels sc ON sc.channel_id = s.channel_id
             JOIN main.videos p ON p.video_id = s.video_id
             JOIN main.channels pc ON pc.channel_id = p.channel_id
             WHERE pc.host <> sc.host AND pc.host IN ({EFFECTIVE_HOSTS_SQL})"
        ),
        [],
    )?;

    tx.execute_batch(
        "DELETE FROM staging.embeddings
           WHERE video_id IN (SELECT video_id FROM temp.merge_rejected_videos);
         DELETE FROM staging.video_observations
           WHERE video_id IN (SELECT video_id FROM temp.merge_rejected_videos);
         DELETE FROM staging.videos
           WHERE video_id IN (SELECT video_id FROM temp.merge_rejected_videos);
         DELETE FROM staging.channels
           WHERE channel_id IN (SELECT channel_id FROM temp.merge_rejected_channels);
         DELETE FROM staging.hosts
           WHERE host IN (SELECT host FROM main.denied_hosts);",
    )
    .context("failed to drop rejected staging rows")?;

    let rejected = RejectedRows {
        channels: count_rows(tx, "SELECT COUNT(*) FROM temp.merge_rejected_channels")? as usize,
        videos: count_rows(tx, "SELECT COUNT(*) FROM temp.merge_rejected_videos")? as usize,
    };
    tx.execute_batch(
        "DROP TABLE temp.merge_rejected_channels;
         DROP TABLE temp.merge_rejected_videos;",
    )?;
    Ok(rejected)
}

fn apply_merge_rule(tx: &Transaction<'_>, table: &MergeTable) -> Result<TableMergeOutcome> {
    let name = table.table;
    let columns = table.columns.join(", ");
    let keys = table.key_columns.join(", ");
    let key_match = key_predicate(table.key_columns, "p", "s");

    let staging_rows = count_rows(tx, &format!("SELECT COUNT(*) FROM staging.{name}"))? as usize;
    let existing = count_rows(
        tx,
        &format!(
            "SELECT COUNT(*) FROM staging.{name} s
             WHERE EXISTS (SELECT 1 FROM main.{name} p WHERE {key_match})"
        ),
    )? as usize;

    let mut outcome = TableMergeOutcome {
        table: name.to_string(),
        rule: table.rule,
        key_columns: table.key_columns.iter().map(|key| key.to_string()).collect(),
        staging_rows,
        inserted: 0,
        replaced: 0,
        skipped_existing: 0,
        production_rows_after: 0,
        duplicate_key_groups: 0,
    };

    match table.rule {
        MergeRule::InsertOrReplace => {
            let updates = table
                .replace_columns
                .iter()
                .map(|column| format!("{column}=excluded.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            // `WHERE true` resolves the SELECT/ON CONFLICT parsing ambiguity.
            tx.execute(
                &format!(
                    "INSERT INTO main.{name}({columns})
                     SELECT {columns} FROM staging.{name} WHERE true
                     ON CONFLICT({keys}) DO UPDATE SET {updates}"
                ),
                [],
            )
            .with_context(|| format!("failed to merge {name}"))?;
            outcome.replaced = existing;
            outcome.inserted = staging_rows.saturating_sub(existing);
        }
        MergeRule::InsertOnly => {
            let selected = table
                .columns
                .iter()
                .map(|column| format!("s.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            let inserted = tx
                .execute(
                    &format!(
                        "INSERT INTO main.{name}({columns})
                         SELECT {selected} FROM staging.{name} s
                         WHERE s.rowid IN (
                           SELECT MIN(rowid) FROM staging.{name} GROUP BY {keys}
                         )
                         AND NOT EXISTS (SELECT 1 FROM main.{name} p WHERE {key_match})"
                    ),
                    [],
                )
                .with_context(|| format!("failed to merge {name}"))?;
            outcome.inserted = inserted;
            outcome.skipped_existing = staging_rows.saturating_sub(inserted);
        }
    }

    Ok(outcome)
}

fn key_predicate(keys: &[&str], left: &str, right: &str) -> String {
    keys.iter()
        .map(|key| format!("{left}.{key} = {right}.{key}"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Number of merge keys that map to more than one row in `schema.table`.
pub fn duplicate_key_groups(connection: &Connection, schema: &str, table: &MergeTable) -> Result<usize> {
    let keys = table.key_columns.join(", ");
    let groups = count_rows(
        connection,
        &format!(
            "SELECT COUNT(*) FROM (
               SELECT 1 FROM {schema}.{} GROUP BY {keys} HAVING COUNT(*) > 1
             )",
            table.table
        ),
    )?;
    Ok(groups as usize)
}

fn sample_duplicate_keys(
    connection: &Connection,
    schema: &str,
    table: &MergeTable,
    limit: usize,
) -> Result<Vec<String>> {
    let keys = table.key_columns.join(", ");
    let rendered = table
        .key_columns
        .iter()
        .map(|key| format!("CAST({key} AS TEXT)"))
        .collect::<Vec<_>>()
        .join(" || '|' || ");
    let mut statement = connection.prepare(&format!(
        "SELECT {rendered} FROM {schema}.{} GROUP BY {keys} HAVING COUNT(*) > 1 LIMIT ?1",
        table.table
    ))?;
    let mut rows = statement.query([limit as i64])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(0)?);
    }
    Ok(out)
}

fn load_current_hosts(connection: &Connection) -> Result<BTreeSet<String>> {
    load_string_set(
        connection,
        "SELECT host FROM main.hosts UNION SELECT host FROM main.channels",
    )
}

/// `effective = join - denied`, `stale = current - effective`.
pub fn reconcile(
    join: &BTreeSet<String>,
    denied: &BTreeSet<String>,
    current: &BTreeSet<String>,
) -> HostReconciliation {
    let effective: BTreeSet<String> = join.difference(denied).cloned().collect();
    let stale: BTreeSet<String> = current.difference(&effective).cloned().collect();

    let mut roles = BTreeMap::new();
    for host in join.iter().chain(denied).chain(current) {
        roles.insert(host.clone(), classify_host(host, join, denied, current));
    }

    HostReconciliation {
        join_hosts: join.iter().cloned().collect(),
        denied_hosts: denied.iter().cloned().collect(),
        current_hosts: current.iter().cloned().collect(),
        effective_hosts: effective.into_iter().collect(),
        stale_hosts: stale.into_iter().collect(),
        roles,
    }
}

/// Derived role of `host` against this pass's three sets. Never stored.
pub fn classify_host(
    host: &str,
    join: &BTreeSet<String>,
    denied: &BTreeSet<String>,
    current: &BTreeSet<String>,
) -> HostRole {
    if denied.contains(host) {
        HostRole::Deny
    } else if join.contains(host) {
        HostRole::Allowed
    } else if current.contains(host) {
        HostRole::Stale
    } else {
        HostRole::Ignored
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;
    use crate::pipeline::moderation::tests::{insert_edge, insert_host_rows};
    use crate::pipeline::moderation::{count_dangling_similarity, deny_host};
    use crate::store::StagingStore;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn add_join_host(staging: &Connection, host: &str) {
        staging
            .execute(
                "INSERT INTO main.join_hosts(host, listed_at) VALUES(?1, 'now')",
                [host],
            )
            .expect("join host");
    }

    fn staging_store(dir: &tempfile::TempDir) -> StagingStore {
        StagingStore::recreate(&dir.path().join("staging.sqlite")).expect("staging")
    }

    #[test]
    fn stale_hosts_follow_set_formula() {
        let join = set(&["a.example", "b.example", "d.example"]);
        let denied = set(&["d.example", "x.example"]);
        let current = set(&["a.example", "c.example", "d.example"]);

        let reconciliation = reconcile(&join, &denied, &current);

        assert_eq!(reconciliation.effective_hosts, vec!["a.example", "b.example"]);
        assert_eq!(reconciliation.stale_hosts, vec!["c.example", "d.example"]);
        assert_eq!(reconciliation.roles["a.example"], HostRole::Allowed);
        assert_eq!(reconciliation.roles["c.example"], HostRole::Stale);
        assert_eq!(reconciliation.roles["d.example"], HostRole::Deny);
        assert_eq!(reconciliation.roles["x.example"], HostRole::Deny);
        assert_eq!(
            classify_host("elsewhere.example", &join, &denied, &current),
            HostRole::Ignored
        );
    }

    #[test]
    fn empty_join_universe_makes_every_current_host_stale() {
        let current = set(&["a.example", "b.example"]);
        let reconciliation = reconcile(&BTreeSet::new(), &BTreeSet::new(), &current);
        assert_eq!(reconciliation.stale_hosts, vec!["a.example", "b.example"]);
    }

    #[test]
    fn insert_only_keeps_existing_rows_and_replace_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        insert_host_rows(&stores.connection, "a.example", "c1", &["v1"]);
        stores
            .connection
            .execute("UPDATE main.video_observations SET views = 7", [])
            .expect("views");

        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "a.example");
        insert_host_rows(&staging.connection, "a.example", "c1", &["v1", "v2"]);
        staging
            .connection
            .execute(
                "UPDATE main.channels SET followers_count = 99, updated_at = 'now'",
                [],
            )
            .expect("followers");
        staging
            .connection
            .execute(
                "UPDATE main.video_observations SET views = 500",
                [],
            )
            .expect("views");
        staging
            .connection
            .execute(
                "INSERT INTO main.video_observations(video_id, observed_at, views, likes)
                 VALUES('v1', 'later', 600, 2)",
                [],
            )
            .expect("new observation");

        let batch = merge_staging(&mut stores, &staging.path, "run-1").expect("merge");

        let followers: i64 = stores
            .connection
            .query_row(
                "SELECT followers_count FROM main.channels WHERE channel_id = 'c1'",
                [],
                |row| row.get(0),
            )
            .expect("followers");
        assert_eq!(followers, 99);

        let old_views: i64 = stores
            .connection
            .query_row(
                "SELECT views FROM main.video_observations WHERE video_id = 'v1' AND observed_at = 'then'",
                [],
                |row| row.get(0),
            )
            .expect("views");
        assert_eq!(old_views, 7);

        let observations = batch
            .tables
            .iter()
            .find(|outcome| outcome.table == "video_observations")
            .expect("observations outcome");
        assert_eq!(observations.rule, MergeRule::InsertOnly);
        assert_eq!(observations.inserted, 2);
        assert_eq!(observations.skipped_existing, 1);
        assert_eq!(observations.production_rows_after, 3);

        let channels = batch
            .tables
            .iter()
            .find(|outcome| outcome.table == "channels")
            .expect("channels outcome");
        assert_eq!(channels.replaced, 1);
        assert_eq!(channels.inserted, 0);

        for table in MERGE_TABLES {
            assert_eq!(
                duplicate_key_groups(&stores.connection, "main", table).expect("groups"),
                0
            );
        }
    }

    #[test]
    fn replaying_a_merge_adds_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "a.example");
        insert_host_rows(&staging.connection, "a.example", "c1", &["v1", "v2"]);

        merge_staging(&mut stores, &staging.path, "run-1").expect("first merge");
        let replay = merge_staging(&mut stores, &staging.path, "run-2").expect("replay");

        for outcome in &replay.tables {
            assert_eq!(outcome.inserted, 0, "{} grew on replay", outcome.table);
            assert_eq!(outcome.duplicate_key_groups, 0);
        }
        assert!(replay.purge_totals.is_zero());
    }

    #[test]
    fn duplicate_keys_abort_and_roll_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        insert_host_rows(&stores.connection, "a.example", "c1", &["v1"]);
        stores
            .connection
            .execute(
                "INSERT INTO main.video_observations(video_id, observed_at, views, likes)
                 VALUES('v1', 'then', 3, 3)",
                [],
            )
            .expect("duplicate observation");

        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "a.example");
        insert_host_rows(&staging.connection, "a.example", "c1", &["v1"]);
        staging
            .connection
            .execute("UPDATE main.channels SET followers_count = 42", [])
            .expect("followers");

        let err = merge_staging(&mut stores, &staging.path, "run-1").expect_err("must fail");
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::MergeIntegrity {
                table,
                groups,
                sample_keys,
            }) => {
                assert_eq!(table, "video_observations");
                assert_eq!(*groups, 1);
                assert_eq!(sample_keys, &vec!["v1|then".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let followers: i64 = stores
            .connection
            .query_row(
                "SELECT followers_count FROM main.channels WHERE channel_id = 'c1'",
                [],
                |row| row.get(0),
            )
            .expect("followers");
        assert_eq!(followers, 1);

        // Staging must be detached again so a later run can attach it.
        merge_staging(&mut stores, &staging.path, "run-2").expect_err("still duplicated");
    }

    fn video_owner(connection: &Connection, video_id: &str) -> String {
        connection
            .query_row(
                "SELECT channel_id FROM main.videos WHERE video_id = ?1",
                [video_id],
                |row| row.get(0),
            )
            .expect("owner")
    }

    #[test]
    fn denied_host_staging_rows_cannot_overwrite_allowed_videos() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        insert_host_rows(&stores.connection, "allowed.example", "c-allowed", &["v1"]);
        deny_host(&stores.connection, "deny.example", None).expect("deny");

        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "allowed.example");
        add_join_host(&staging.connection, "deny.example");
        insert_host_rows(&staging.connection, "deny.example", "c-deny", &["v1"]);

        let batch = merge_staging(&mut stores, &staging.path, "run-1").expect("merge");

        assert_eq!(batch.rejected_channels, 1);
        assert_eq!(batch.rejected_videos, 1);
        assert!(batch.reconciliation.stale_hosts.is_empty());
        assert_eq!(video_owner(&stores.connection, "v1"), "c-allowed");
        let hosts = load_string_set(
            &stores.connection,
            "SELECT host FROM main.hosts UNION SELECT host FROM main.channels",
        )
        .expect("hosts");
        assert_eq!(hosts, set(&["allowed.example"]));
        let embeddings = count_rows(&stores.connection, "SELECT COUNT(*) FROM main.embeddings")
            .expect("embeddings");
        assert_eq!(embeddings, 1);
    }

    #[test]
    fn channels_and_videos_keep_their_crawled_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        insert_host_rows(&stores.connection, "a.example", "c-a", &["v1"]);
        insert_host_rows(&stores.connection, "b.example", "c-b", &["b1"]);

        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "a.example");
        add_join_host(&staging.connection, "b.example");
        insert_host_rows(&staging.connection, "b.example", "c-b", &["b1", "v1", "b2"]);
        insert_host_rows(&staging.connection, "b.example", "c-a", &[]);

        let batch = merge_staging(&mut stores, &staging.path, "run-1").expect("merge");

        assert_eq!(batch.rejected_channels, 1);
        assert_eq!(batch.rejected_videos, 1);
        assert_eq!(video_owner(&stores.connection, "v1"), "c-a");
        assert_eq!(video_owner(&stores.connection, "b2"), "c-b");
        let owner_host: String = stores
            .connection
            .query_row(
                "SELECT host FROM main.channels WHERE channel_id = 'c-a'",
                [],
                |row| row.get(0),
            )
            .expect("channel host");
        assert_eq!(owner_host, "a.example");
    }

    #[test]
    fn stale_and_newly_denied_hosts_are_purged_with_their_edges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stores = Stores::open_in_memory().expect("stores");
        insert_host_rows(&stores.connection, "keep.example", "c-keep", &["k1"]);
        insert_host_rows(&stores.connection, "gone.example", "c-gone", &["g1"]);
        insert_host_rows(&stores.connection, "deny.example", "c-deny", &["d1"]);
        insert_edge(&stores.connection, "k1", "g1");
        insert_edge(&stores.connection, "d1", "k1");
        insert_edge(&stores.connection, "g1", "d1");
        deny_host(&stores.connection, "deny.example", None).expect("deny");

        let staging = staging_store(&dir);
        add_join_host(&staging.connection, "keep.example");
        add_join_host(&staging.connection, "deny.example");

        let batch = merge_staging(&mut stores, &staging.path, "run-1").expect("merge");

        assert_eq!(
            batch.reconciliation.stale_hosts,
            vec!["deny.example", "gone.example"]
        );
        assert_eq!(batch.purged_hosts["gone.example"].videos, 1);
        // The g1-d1 edge is credited once, to the host purged first.
        assert_eq!(batch.purged_hosts["deny.example"].similarity_edges, 2);
        assert_eq!(batch.purged_hosts["gone.example"].similarity_edges, 1);
        assert_eq!(batch.purge_totals.similarity_edges, 3);
        assert_eq!(batch.dangling_similarity, 0);

        let hosts = load_string_set(
            &stores.connection,
            "SELECT host FROM main.hosts UNION SELECT host FROM main.channels",
        )
        .expect("hosts");
        assert_eq!(hosts, set(&["keep.example"]));
        assert_eq!(count_dangling_similarity(&stores.connection).expect("dangling"), 0);

        let embeddings: i64 = stores
            .connection
            .query_row(
                "SELECT COUNT(*) FROM main.embeddings WHERE video_id = ?1",
                params!["d1"],
                |row| row.get(0),
            )
            .expect("embeddings");
        assert_eq!(embeddings, 0);
    }
}
