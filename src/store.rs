use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::util::{ensure_directory, now_utc_string, remove_file_if_exists, staging_sibling};

pub const DB_SCHEMA_VERSION: &str = "0.3.0";
pub const SIMILARITY_SCHEMA: &str = "similarity";
pub const STAGING_SCHEMA: &str = "staging";

/// Dataset tables hashed by [`dataset_fingerprint`], with their stable ordering.
const FINGERPRINT_TABLES: &[(&str, &str)] = &[
    ("hosts", "host"),
    ("channels", "channel_id"),
    ("videos", "video_id"),
    ("video_observations", "video_id, observed_at, views, likes"),
    ("embeddings", "video_id"),
    ("denied_hosts", "host"),
    ("blocked_channels", "channel_id"),
];

pub fn configure_connection(connection: &Connection, schema: Option<&str>) -> Result<()> {
    connection
        .pragma_update(schema, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(schema, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_dataset_schema(connection: &Connection) -> Result<()> {
    ensure_dataset_schema_in(connection, "main")
}

pub fn ensure_dataset_schema_in(connection: &Connection, schema: &str) -> Result<()> {
    connection
        .execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {schema}.metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.hosts (
              host TEXT PRIMARY KEY,
              first_seen_at TEXT NOT NULL,
              last_crawled_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.channels (
              channel_id TEXT PRIMARY KEY,
              host TEXT NOT NULL,
              name TEXT,
              followers_count INTEGER,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.videos (
              video_id TEXT PRIMARY KEY,
              channel_id TEXT NOT NULL,
              title TEXT NOT NULL,
              description TEXT,
              duration_secs INTEGER,
              published_at TEXT,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.video_observations (
              video_id TEXT NOT NULL,
              observed_at TEXT NOT NULL,
              views INTEGER,
              likes INTEGER
            );

            CREATE TABLE IF NOT EXISTS {schema}.embeddings (
              video_id TEXT PRIMARY KEY,
              model_id TEXT NOT NULL,
              embedding BLOB NOT NULL,
              embedding_dim INTEGER NOT NULL,
              text_hash TEXT NOT NULL,
              generated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.join_hosts (
              host TEXT PRIMARY KEY,
              listed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.denied_hosts (
              host TEXT PRIMARY KEY,
              reason TEXT,
              added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.blocked_channels (
              channel_id TEXT PRIMARY KEY,
              reason TEXT,
              added_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS {schema}.idx_channels_host ON channels(host);
            CREATE INDEX IF NOT EXISTS {schema}.idx_videos_channel ON videos(channel_id);
            CREATE INDEX IF NOT EXISTS {schema}.idx_video_observations_key
              ON video_observations(video_id, observed_at);
            "
        ))
        .with_context(|| format!("failed to initialize dataset schema in {schema}"))?;

    write_schema_metadata(connection, schema)
}

pub fn ensure_similarity_schema(connection: &Connection, schema: &str) -> Result<()> {
    connection
        .execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {schema}.metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS {schema}.similarity_edges (
              video_id TEXT NOT NULL,
              neighbor_video_id TEXT NOT NULL,
              score REAL NOT NULL,
              computed_at TEXT NOT NULL,
              PRIMARY KEY (video_id, neighbor_video_id)
            );

            CREATE INDEX IF NOT EXISTS {schema}.idx_similarity_neighbor
              ON similarity_edges(neighbor_video_id);
            "
        ))
        .context("failed to initialize similarity schema")?;

    write_schema_metadata(connection, schema)
}

fn write_schema_metadata(connection: &Connection, schema: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {schema}.metadata(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value"
    );
    connection.execute(&sql, params!["db_schema_version", DB_SCHEMA_VERSION])?;
    connection.execute(&sql, params!["db_opened_at", now_utc_string()])?;
    Ok(())
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to count rows: {}", sql.trim()))?;
    Ok(count)
}

pub fn load_string_set(connection: &Connection, sql: &str) -> Result<BTreeSet<String>> {
    let mut statement = connection
        .prepare(sql)
        .with_context(|| format!("failed to prepare: {}", sql.trim()))?;
    let mut rows = statement.query([])?;
    let mut out = BTreeSet::new();
    while let Some(row) = rows.next()? {
        out.insert(row.get::<_, String>(0)?);
    }
    Ok(out)
}

/// Production dataset with the similarity store attached as `similarity`.
///
/// Both stores live in separate files. Writes to each schema go through their
/// own transaction; the attachment exists so cross-store invariants can be
/// checked with a single query.
pub struct Stores {
    pub connection: Connection,
}

impl Stores {
    pub fn open(production_path: &Path, similarity_path: &Path) -> Result<Self> {
        for path in [production_path, similarity_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    ensure_directory(parent)?;
                }
            }
        }

        let connection = Connection::open(production_path)
            .with_context(|| format!("failed to open {}", production_path.display()))?;
        configure_connection(&connection, None)?;
        ensure_dataset_schema(&connection)?;

        let similarity = similarity_path.display().to_string();
        connection
            .execute("ATTACH DATABASE ?1 AS similarity", [&similarity])
            .with_context(|| format!("failed to attach {similarity}"))?;
        configure_connection(&connection, Some(SIMILARITY_SCHEMA))?;
        ensure_similarity_schema(&connection, SIMILARITY_SCHEMA)?;

        Ok(Self { connection })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory store")?;
        ensure_dataset_schema(&connection)?;
        connection
            .execute("ATTACH DATABASE ':memory:' AS similarity", [])
            .context("failed to attach in-memory similarity store")?;
        ensure_similarity_schema(&connection, SIMILARITY_SCHEMA)?;

        Ok(Self { connection })
    }

    pub fn attach_staging(&self, staging_path: &Path) -> Result<()> {
        let staging = staging_path.display().to_string();
        self.connection
            .execute("ATTACH DATABASE ?1 AS staging", [&staging])
            .with_context(|| format!("failed to attach staging store {staging}"))?;
        ensure_dataset_schema_in(&self.connection, STAGING_SCHEMA)
    }

    pub fn detach_staging(&self) -> Result<()> {
        self.connection
            .execute("DETACH DATABASE staging", [])
            .context("failed to detach staging store")?;
        Ok(())
    }
}

/// Disposable write target for the crawl and embed stages.
pub struct StagingStore {
    pub connection: Connection,
    pub path: PathBuf,
}

impl StagingStore {
    /// Drops whatever a previous run left behind and opens an empty store.
    pub fn recreate(path: &Path) -> Result<Self> {
        discard_staging_files(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }

        let connection = Connection::open(path)
            .with_context(|| format!("failed to open staging store {}", path.display()))?;
        configure_connection(&connection, None)?;
        ensure_dataset_schema(&connection)?;

        info!(path = %path.display(), "staging store created");

        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.connection);
        discard_staging_files(&path)
    }
}

fn discard_staging_files(path: &Path) -> Result<()> {
    remove_file_if_exists(path)?;
    remove_file_if_exists(&staging_sibling(path, "wal"))?;
    remove_file_if_exists(&staging_sibling(path, "shm"))?;
    Ok(())
}

/// SHA-256 over the ordered contents of every production dataset table.
pub fn dataset_fingerprint(connection: &Connection) -> Result<String> {
    let mut hasher = Sha256::new();

    for (table, order_by) in FINGERPRINT_TABLES {
        hasher.update(table.as_bytes());
        let sql = format!("SELECT * FROM main.{table} ORDER BY {order_by}");
        let mut statement = connection
            .prepare(&sql)
            .with_context(|| format!("failed to fingerprint {table}"))?;
        let column_count = statement.column_count();
        let mut rows = statement.query([])?;

        while let Some(row) = rows.next()? {
            hasher.update(b"\x1e");
            for index in 0..column_count {
                hasher.update(b"\x1f");
                match row.get_ref(index)? {
                    ValueRef::Null => hasher.update(b"n"),
                    ValueRef::Integer(value) => hasher.update(value.to_le_bytes()),
                    ValueRef::Real(value) => hasher.update(value.to_le_bytes()),
                    ValueRef::Text(value) | ValueRef::Blob(value) => hasher.update(value),
                }
            }
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}
