use anyhow::{Result, bail};
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::model::{EmbedStats, VideoFailure};
use crate::pipeline::config::ComputeMode;
use crate::semantic::{
    EmbeddingModelConfig, embed_text_local, embedding_text_hash, encode_embedding_blob,
    video_payload_for_embedding,
};
use crate::util::now_utc_string;

/// Black-box `embed(video) -> vector`.
pub trait Embedder: Sync {
    fn model(&self) -> &EmbeddingModelConfig;
    fn embed(&self, payload: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct LocalHashEmbedder {
    model: EmbeddingModelConfig,
}

impl LocalHashEmbedder {
    pub fn new(model: EmbeddingModelConfig) -> Self {
        Self { model }
    }
}

impl Embedder for LocalHashEmbedder {
    fn model(&self) -> &EmbeddingModelConfig {
        &self.model
    }

    fn embed(&self, payload: &str) -> Result<Vec<f32>> {
        Ok(embed_text_local(payload, self.model.dimensions))
    }
}

#[derive(Debug, Clone)]
struct StagedVideoRow {
    video_id: String,
    title: String,
    description: Option<String>,
    channel_name: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingVideo {
    video_id: String,
    payload: String,
    text_hash: String,
}

pub fn run_embed(
    staging: &mut Connection,
    production: &Connection,
    embedder: &dyn Embedder,
    compute_mode: ComputeMode,
    batch_size: usize,
) -> Result<EmbedStats> {
    let model = embedder.model().clone();
    let batch_size = compute_mode.effective_batch_size(batch_size);
    let rows = load_staged_videos(staging)?;

    let mut stats = EmbedStats {
        model_id: model.model_id.clone(),
        embedding_dim: model.dimensions,
        compute_mode: compute_mode.as_str().to_string(),
        batch_size,
        candidate_videos: rows.len(),
        ..EmbedStats::default()
    };

    let mut pending = Vec::<PendingVideo>::new();
    for row in rows {
        let Some(payload) = video_payload_for_embedding(
            &row.title,
            row.description.as_deref(),
            row.channel_name.as_deref(),
        ) else {
            stats.failures.push(VideoFailure {
                video_id: row.video_id,
                error: "video has no title or description to embed".to_string(),
            });
            continue;
        };

        let text_hash = embedding_text_hash(&payload);
        if production_embedding_is_current(production, &row.video_id, &model, &text_hash)? {
            stats.reused_embeddings += 1;
            continue;
        }

        pending.push(PendingVideo {
            video_id: row.video_id,
            payload,
            text_hash,
        });
    }

    for batch in pending.chunks(batch_size) {
        let computed = compute_batch(embedder, batch, compute_mode);

        let mut ready = Vec::<(String, String, Vec<u8>)>::with_capacity(computed.len());
        for (video, outcome) in batch.iter().zip(computed) {
            match outcome.and_then(|vector| check_dimensions(vector, model.dimensions)) {
                Ok(vector) => ready.push((
                    video.video_id.clone(),
                    video.text_hash.clone(),
                    encode_embedding_blob(&vector),
                )),
                Err(err) => {
                    warn!(video_id = %video.video_id, error = %err, "embedding failed");
                    stats.failures.push(VideoFailure {
                        video_id: video.video_id.clone(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        stats.embedded_videos += flush_embed_batch(staging, &model, &mut ready)?;
        stats.batches_committed += 1;
        info!(
            model_id = %model.model_id,
            embedded = stats.embedded_videos,
            pending = pending.len(),
            "embed batch committed"
        );
    }

    stats.failed_videos = stats.failures.len();
    Ok(stats)
}

fn compute_batch(
    embedder: &dyn Embedder,
    batch: &[PendingVideo],
    compute_mode: ComputeMode,
) -> Vec<Result<Vec<f32>>> {
    match compute_mode {
        ComputeMode::Batch => batch
            .par_iter()
            .map(|video| embedder.embed(&video.payload))
            .collect(),
        ComputeMode::Constrained => batch
            .iter()
            .map(|video| embedder.embed(&video.payload))
            .collect(),
    }
}

fn check_dimensions(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>> {
    if vector.len() != expected {
        bail!(
            "embedder returned {} dimensions, expected {expected}",
            vector.len()
        );
    }
    if vector.iter().any(|value| !value.is_finite()) {
        bail!("embedder returned a non-finite component");
    }
    Ok(vector)
}

fn load_staged_videos(staging: &Connection) -> Result<Vec<StagedVideoRow>> {
    let mut statement = staging.prepare(
        "
        SELECT v.video_id, v.title, v.description, c.name
        FROM videos v
        LEFT JOIN channels c ON c.channel_id = v.channel_id
        ORDER BY v.video_id ASC
        ",
    )?;

    let mut rows = statement.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(StagedVideoRow {
            video_id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            channel_name: row.get(3)?,
        });
    }
    Ok(out)
}

fn production_embedding_is_current(
    production: &Connection,
    video_id: &str,
    model: &EmbeddingModelConfig,
    text_hash: &str,
) -> Result<bool> {
    let existing = production
        .query_row(
            "
            SELECT model_id, embedding_dim, text_hash
            FROM main.embeddings
            WHERE video_id = ?1
            ",
            [video_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    Ok(existing
        .map(|(model_id, dim, hash)| {
            model_id == model.model_id && dim as usize == model.dimensions && hash == text_hash
        })
        .unwrap_or(false))
}

fn flush_embed_batch(
    staging: &mut Connection,
    model: &EmbeddingModelConfig,
    ready: &mut Vec<(String, String, Vec<u8>)>,
) -> Result<usize> {
    if ready.is_empty() {
        return Ok(0);
    }

    let generated_at = now_utc_string();
    let tx = staging.transaction()?;
    let mut written = 0usize;
    {
        let mut statement = tx.prepare(
            "
            INSERT INTO embeddings(video_id, model_id, embedding, embedding_dim, text_hash, generated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(video_id) DO UPDATE SET
              model_id=excluded.model_id,
              embedding=excluded.embedding,
              embedding_dim=excluded.embedding_dim,
              text_hash=excluded.text_hash,
              generated_at=excluded.generated_at
            ",
        )?;
        for (video_id, text_hash, blob) in ready.drain(..) {
            statement.execute(params![
                video_id,
                model.model_id,
                blob,
                model.dimensions as i64,
                text_hash,
                generated_at,
            ])?;
            written += 1;
        }
    }
    tx.commit()?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::resolve_model_config;
    use crate::store::{Stores, count_rows, ensure_dataset_schema};

    struct FailingEmbedder {
        model: EmbeddingModelConfig,
    }

    impl Embedder for FailingEmbedder {
        fn model(&self) -> &EmbeddingModelConfig {
            &self.model
        }

        fn embed(&self, payload: &str) -> Result<Vec<f32>> {
            if payload.contains("broken") {
                bail!("model rejected payload");
            }
            Ok(embed_text_local(payload, self.model.dimensions))
        }
    }

    fn staging_with_videos(videos: &[(&str, &str)]) -> Connection {
        let connection = Connection::open_in_memory().expect("open");
        ensure_dataset_schema(&connection).expect("schema");
        connection
            .execute(
                "INSERT INTO channels(channel_id, host, name, followers_count, updated_at)
                 VALUES('c1', 'a.example', 'Channel', 1, 'now')",
                [],
            )
            .expect("channel");
        for (video_id, title) in videos {
            connection
                .execute(
                    "INSERT INTO videos(video_id, channel_id, title, updated_at)
                     VALUES(?1, 'c1', ?2, 'now')",
                    params![video_id, title],
                )
                .expect("video");
        }
        connection
    }

    #[test]
    fn per_video_failures_are_recorded_and_others_embedded() {
        let mut staging =
            staging_with_videos(&[("v1", "good one"), ("v2", "broken one"), ("v3", "  ")]);
        let stores = Stores::open_in_memory().expect("stores");
        let embedder = FailingEmbedder {
            model: resolve_model_config(""),
        };

        let stats = run_embed(
            &mut staging,
            &stores.connection,
            &embedder,
            ComputeMode::Batch,
            2,
        )
        .expect("embed");

        // v3 has only a channel name, which is not enough to embed.
        assert_eq!(stats.candidate_videos, 3);
        assert_eq!(stats.embedded_videos, 1);
        assert_eq!(stats.failed_videos, 2);
        let rows = count_rows(&staging, "SELECT COUNT(*) FROM embeddings").expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn current_production_embeddings_are_reused() {
        let mut staging = staging_with_videos(&[("v1", "alpha"), ("v2", "beta")]);
        let stores = Stores::open_in_memory().expect("stores");
        let model = resolve_model_config("");
        let embedder = LocalHashEmbedder::new(model.clone());

        let payload = video_payload_for_embedding("alpha", None, Some("Channel")).expect("payload");
        stores
            .connection
            .execute(
                "INSERT INTO embeddings(video_id, model_id, embedding, embedding_dim, text_hash, generated_at)
                 VALUES('v1', ?1, ?2, ?3, ?4, 'then')",
                params![
                    model.model_id,
                    encode_embedding_blob(&embed_text_local(&payload, model.dimensions)),
                    model.dimensions as i64,
                    embedding_text_hash(&payload),
                ],
            )
            .expect("seed embedding");

        let stats = run_embed(
            &mut staging,
            &stores.connection,
            &embedder,
            ComputeMode::Constrained,
            64,
        )
        .expect("embed");

        assert_eq!(stats.batch_size, 16);
        assert_eq!(stats.reused_embeddings, 1);
        assert_eq!(stats.embedded_videos, 1);
    }
}
