//! Random-hyperplane LSH index over production embeddings.
//!
//! Always rebuilt in full. The serving copy is only replaced by renaming a
//! validated temporary file over it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::model::IndexMeta;
use crate::pipeline::error::PipelineError;
use crate::semantic::{EmbeddingModelConfig, cosine_similarity, decode_embedding_blob, stable_hash};
use crate::store::count_rows;
use crate::util::{
    ensure_directory, now_utc_string, read_json, remove_file_if_exists, sha256_hex,
    staging_sibling, write_json_pretty,
};

pub const INDEX_MAGIC: &[u8; 8] = b"VIDXANN1";
pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub video_id: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct VideoIndex {
    dimensions: usize,
    seed: u64,
    planes: Vec<Vec<f32>>,
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    buckets: HashMap<u32, Vec<usize>>,
}

impl VideoIndex {
    pub fn new(dimensions: usize, hyperplanes: u32, seed: u64) -> Self {
        Self {
            dimensions,
            seed,
            planes: derive_hyperplanes(dimensions, hyperplanes, seed),
            ids: Vec::new(),
            vectors: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn insert(&mut self, video_id: String, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            bail!(
                "vector for {video_id} has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            );
        }

        let position = self.ids.len();
        let signature = self.signature(&vector);
        self.buckets.entry(signature).or_default().push(position);
        self.ids.push(video_id);
        self.vectors.push(vector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn hyperplanes(&self) -> u32 {
        self.planes.len() as u32
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.ids
            .iter()
            .map(String::as_str)
            .zip(self.vectors.iter().map(Vec::as_slice))
    }

    fn signature(&self, vector: &[f32]) -> u32 {
        let mut signature = 0_u32;
        for (bit, plane) in self.planes.iter().enumerate() {
            if cosine_similarity(plane, vector) >= 0.0 {
                signature |= 1 << bit;
            }
        }
        signature
    }

    /// Top `k` by cosine score, highest first.
    ///
    /// Probes the query bucket and its Hamming-distance-one neighbours, and
    /// scans everything when that yields fewer than `k` candidates.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<IndexHit> {
        if k == 0 || query.len() != self.dimensions || self.is_empty() {
            return Vec::new();
        }

        let signature = self.signature(query);
        let mut candidates = Vec::<usize>::new();
        if let Some(bucket) = self.buckets.get(&signature) {
            candidates.extend(bucket);
        }
        for bit in 0..self.planes.len() {
            if let Some(bucket) = self.buckets.get(&(signature ^ (1 << bit))) {
                candidates.extend(bucket);
            }
        }
        if candidates.len() < k {
            candidates = (0..self.ids.len()).collect();
        }

        let mut hits = candidates
            .into_iter()
            .map(|position| IndexHit {
                video_id: self.ids[position].clone(),
                score: cosine_similarity(query, &self.vectors[position]),
            })
            .collect::<Vec<_>>();
        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.video_id.cmp(&right.video_id))
        });
        hits.truncate(k);
        hits
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        writer.write_all(INDEX_MAGIC)?;
        writer.write_all(&(self.dimensions as u32).to_le_bytes())?;
        writer.write_all(&self.hyperplanes().to_le_bytes())?;
        writer.write_all(&self.seed.to_le_bytes())?;
        writer.write_all(&(self.ids.len() as u64).to_le_bytes())?;
        for (video_id, vector) in self.entries() {
            writer.write_all(&(video_id.len() as u32).to_le_bytes())?;
            writer.write_all(video_id.as_bytes())?;
            for value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all())
            .with_context(|| format!("failed to flush {}", path.display()))?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0_u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            bail!("{} is not a video index file", path.display());
        }

        let dimensions = read_u32(&mut reader)? as usize;
        let hyperplanes = read_u32(&mut reader)?;
        let seed = read_u64(&mut reader)?;
        let total = read_u64(&mut reader)? as usize;

        let mut index = Self::new(dimensions, hyperplanes, seed);
        for _ in 0..total {
            let id_len = read_u32(&mut reader)? as usize;
            let mut id = vec![0_u8; id_len];
            reader.read_exact(&mut id)?;
            let video_id =
                String::from_utf8(id).with_context(|| format!("bad video id in {}", path.display()))?;

            let mut raw = vec![0_u8; dimensions * 4];
            reader.read_exact(&mut raw)?;
            let vector = raw
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            index.insert(video_id, vector)?;
        }

        Ok(index)
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut bytes = [0_u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut bytes = [0_u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Deterministic in `(dimensions, count, seed)` so a reloaded index buckets
/// queries exactly like the one that was written.
fn derive_hyperplanes(dimensions: usize, count: u32, seed: u64) -> Vec<Vec<f32>> {
    (0..count)
        .map(|plane| {
            (0..dimensions)
                .map(|component| {
                    let hash = stable_hash(&format!("{seed}:{plane}:{component}"));
                    (hash as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32
                })
                .collect()
        })
        .collect()
}

/// Rebuilds the index from `main.embeddings`, checks its cardinality and only
/// then swaps it into `index_path`.
///
/// `before_swap` runs after the candidate file is written; an error from it
/// abandons the candidate like a failed check does.
pub fn build_index<F>(
    connection: &Connection,
    index_path: &Path,
    meta_path: &Path,
    model: &EmbeddingModelConfig,
    hyperplanes: u32,
    seed: u64,
    before_swap: F,
) -> Result<IndexMeta>
where
    F: FnOnce() -> Result<()>,
{
    // Count and scan share one read snapshot.
    let snapshot = connection
        .unchecked_transaction()
        .context("failed to open index build snapshot")?;
    let expected = count_rows(&snapshot, "SELECT COUNT(*) FROM main.embeddings")? as usize;

    let mut index = VideoIndex::new(model.dimensions, hyperplanes, seed);
    let mut statement = snapshot.prepare(
        "SELECT video_id, model_id, embedding_dim, embedding
         FROM main.embeddings
         ORDER BY video_id ASC",
    )?;
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let video_id: String = row.get(0)?;
        let model_id: String = row.get(1)?;
        let embedding_dim: i64 = row.get(2)?;
        let blob: Vec<u8> = row.get(3)?;

        if model_id != model.model_id || embedding_dim as usize != model.dimensions {
            warn!(
                video_id = %video_id,
                model_id = %model_id,
                embedding_dim,
                "embedding does not match index model; left out"
            );
            continue;
        }
        let Some(vector) = decode_embedding_blob(&blob, model.dimensions) else {
            warn!(video_id = %video_id, bytes = blob.len(), "undecodable embedding left out");
            continue;
        };
        index.insert(video_id, vector)?;
    }
    drop(rows);
    drop(statement);
    snapshot.finish().context("failed to close index build snapshot")?;

    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory(parent)?;
        }
    }
    let candidate = staging_sibling(index_path, "tmp");
    index.write_to(&candidate)?;

    let validated = if index.len() != expected {
        Err(PipelineError::IndexCardinalityMismatch {
            expected,
            actual: index.len(),
        }
        .into())
    } else {
        before_swap()
    };
    if let Err(err) = validated {
        remove_file_if_exists(&candidate)?;
        return Err(err);
    }

    let checksum = sha256_hex(
        &fs::read(&candidate).with_context(|| format!("failed to read {}", candidate.display()))?,
    );
    fs::rename(&candidate, index_path)
        .with_context(|| format!("failed to swap index into {}", index_path.display()))?;

    let meta = IndexMeta {
        format_version: INDEX_FORMAT_VERSION,
        total: index.len(),
        dimensions: index.dimensions(),
        hyperplanes: index.hyperplanes(),
        seed,
        bucket_count: index.bucket_count(),
        model_id: model.model_id.clone(),
        built_at: now_utc_string(),
        checksum,
    };
    write_json_pretty(meta_path, &meta)?;

    info!(
        path = %index_path.display(),
        total = meta.total,
        buckets = meta.bucket_count,
        "index swapped into place"
    );

    Ok(meta)
}

pub fn load_index(index_path: &Path) -> Result<VideoIndex> {
    VideoIndex::read_from(index_path)
}

pub fn read_index_meta(meta_path: &Path) -> Result<Option<IndexMeta>> {
    if !meta_path.exists() {
        return Ok(None);
    }
    read_json(meta_path).map(Some)
}
