use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::params;
use tracing::{info, warn};

use crate::model::SimilarityStats;
use crate::pipeline::config::ComputeMode;
use crate::pipeline::index::VideoIndex;
use crate::pipeline::moderation::{assert_no_dangling_similarity, sweep_dangling_similarity};
use crate::store::{Stores, load_string_set};
use crate::util::now_utc_string;

#[derive(Debug, Clone)]
struct Edge {
    video_id: String,
    neighbor_video_id: String,
    score: f64,
}

/// Writes the nearest-neighbour graph of every indexed production video,
/// replacing each source video's previous edges.
pub fn precompute_similarity(
    stores: &mut Stores,
    index: &VideoIndex,
    compute_mode: ComputeMode,
    neighbors: usize,
    min_score: f64,
) -> Result<SimilarityStats> {
    let videos = load_string_set(&stores.connection, "SELECT video_id FROM main.videos")?;

    let sources = index
        .entries()
        .filter(|(video_id, _)| videos.contains(*video_id))
        .map(|(video_id, vector)| (video_id.to_string(), vector.to_vec()))
        .collect::<Vec<_>>();

    let neighbour_lists = match compute_mode {
        ComputeMode::Batch => sources
            .par_iter()
            .map(|(video_id, vector)| nearest(index, video_id, vector, neighbors, min_score))
            .collect::<Vec<_>>(),
        ComputeMode::Constrained => sources
            .iter()
            .map(|(video_id, vector)| nearest(index, video_id, vector, neighbors, min_score))
            .collect::<Vec<_>>(),
    };

    let mut stats = SimilarityStats {
        compute_mode: compute_mode.as_str().to_string(),
        videos_considered: sources.len(),
        neighbors_per_video: neighbors,
        min_score,
        ..SimilarityStats::default()
    };

    let mut edges = Vec::<Edge>::new();
    for list in neighbour_lists {
        for edge in list {
            if videos.contains(&edge.neighbor_video_id) {
                edges.push(edge);
            } else {
                stats.edges_dropped_absent_video += 1;
            }
        }
    }

    let sources = sources
        .into_iter()
        .map(|(video_id, _)| video_id)
        .collect::<BTreeSet<_>>();
    let computed_at = now_utc_string();

    let tx = stores.connection.transaction()?;
    {
        let mut clear = tx.prepare("DELETE FROM similarity.similarity_edges WHERE video_id = ?1")?;
        for video_id in &sources {
            stats.edges_replaced += clear.execute([video_id])?;
        }

        let swept = sweep_dangling_similarity(&tx)?;
        if swept > 0 {
            warn!(edges = swept, "dangling similarity edges removed before write");
        }

        let mut insert = tx.prepare(
            "INSERT INTO similarity.similarity_edges(video_id, neighbor_video_id, score, computed_at)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(video_id, neighbor_video_id) DO UPDATE SET
               score=excluded.score,
               computed_at=excluded.computed_at",
        )?;
        for edge in &edges {
            insert.execute(params![
                edge.video_id,
                edge.neighbor_video_id,
                edge.score,
                computed_at
            ])?;
            stats.edges_written += 1;
        }
    }
    tx.commit().context("failed to commit similarity graph")?;

    stats.dangling_similarity = assert_no_dangling_similarity(&stores.connection, "similarity")?;

    info!(
        videos = stats.videos_considered,
        edges = stats.edges_written,
        replaced = stats.edges_replaced,
        dropped = stats.edges_dropped_absent_video,
        "similarity graph written"
    );

    Ok(stats)
}

fn nearest(
    index: &VideoIndex,
    video_id: &str,
    vector: &[f32],
    neighbors: usize,
    min_score: f64,
) -> Vec<Edge> {
    index
        .search(vector, neighbors + 1)
        .into_iter()
        .filter(|hit| hit.video_id != video_id && hit.score >= min_score)
        .take(neighbors)
        .map(|hit| Edge {
            video_id: video_id.to_string(),
            neighbor_video_id: hit.video_id,
            score: hit.score,
        })
        .collect()
}
