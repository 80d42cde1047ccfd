use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_MODEL_ID: &str = "vidset-hash-v1";
pub const DEFAULT_MODEL_NAME: &str = "vidset/feature-hash-bigram";
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
pub const DEFAULT_NORMALIZATION: &str = "l2";
pub const DEFAULT_BACKEND: &str = "local-hash-v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    pub model_id: String,
    pub model_name: String,
    pub dimensions: usize,
    pub normalization: String,
    pub backend: String,
}

pub fn resolve_model_config(model_id: &str) -> EmbeddingModelConfig {
    let trimmed = model_id.trim();
    let resolved_id = if trimmed.is_empty() {
        DEFAULT_MODEL_ID
    } else {
        trimmed
    };

    let model_name = if resolved_id == DEFAULT_MODEL_ID {
        DEFAULT_MODEL_NAME
    } else {
        resolved_id
    };

    EmbeddingModelConfig {
        model_id: resolved_id.to_string(),
        model_name: model_name.to_string(),
        dimensions: DEFAULT_EMBEDDING_DIM,
        normalization: DEFAULT_NORMALIZATION.to_string(),
        backend: DEFAULT_BACKEND.to_string(),
    }
}

pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Text a video is embedded from. `None` when there is nothing to embed.
pub fn video_payload_for_embedding(
    title: &str,
    description: Option<&str>,
    channel_name: Option<&str>,
) -> Option<String> {
    let title_norm = normalize_whitespace(title);
    let description_norm = description.map(normalize_whitespace).unwrap_or_default();

    if title_norm.is_empty() && description_norm.is_empty() {
        return None;
    }

    let mut parts = Vec::<String>::new();
    if let Some(channel) = channel_name.map(normalize_whitespace) {
        if !channel.is_empty() {
            parts.push(channel);
        }
    }
    if !title_norm.is_empty() {
        parts.push(title_norm);
    }
    if !description_norm.is_empty() {
        parts.push(description_norm);
    }

    Some(parts.join("\n\n"))
}

pub fn embedding_text_hash(payload: &str) -> String {
    crate::util::sha256_hex(payload.as_bytes())
}

pub fn embed_text_local(payload: &str, dimensions: usize) -> Vec<f32> {
    let dims = dimensions.max(8);
    let mut vector = vec![0_f32; dims];
    let tokens = tokenize_payload(payload);

    if tokens.is_empty() {
        return vector;
    }

    for token in &tokens {
        let hash = stable_hash(token);
        let index = (hash as usize) % dims;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        let weight = 1.0 + (((hash >> 48) & 0xFF) as f32 / 255.0);
        vector[index] += sign * weight;
    }

    normalize_vector(&mut vector);
    vector
}

/// Dot product of two L2-normalised vectors.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    left.iter()
        .zip(right.iter())
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum::<f64>()
}

pub fn encode_embedding_blob(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::<u8>::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_embedding_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }

    let out = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect::<Vec<f32>>();

    Some(out)
}

/// First eight bytes of the SHA-256 digest, so persisted vectors do not
/// depend on the std hasher of a particular toolchain.
pub fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn tokenize_payload(payload: &str) -> Vec<String> {
    let normalized = normalize_whitespace(payload);
    if normalized.is_empty() {
        return Vec::new();
    }

    let words = normalized
        .split(' ')
        .map(|value| {
            value
                .chars()
                .filter(|character| character.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>();

    let mut features = Vec::<String>::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        features.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            features.push(format!("b:{word}_{next}"));
        }
    }
    features
}

pub fn normalize_vector(values: &mut [f32]) {
    let squared_norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>();

    if squared_norm <= 0.0 {
        return;
    }

    let norm = squared_norm.sqrt() as f32;
    if norm == 0.0 {
        return;
    }

    for value in values {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_requires_title_or_description() {
        assert!(video_payload_for_embedding("  ", None, Some("chan")).is_none());
        assert!(video_payload_for_embedding("", Some("   "), None).is_none());

        let payload = video_payload_for_embedding("Rust  tips", Some("ownership"), Some("Chan"))
            .expect("payload");
        assert_eq!(payload, "Chan\n\nRust tips\n\nownership");
    }

    #[test]
    fn local_embeddings_are_deterministic_and_normalised() {
        let first = embed_text_local("borrow checker deep dive", 64);
        let second = embed_text_local("borrow checker deep dive", 64);
        assert_eq!(first, second);

        let norm = first.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((cosine_similarity(&first, &second) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn blob_decoding_rejects_wrong_dimension() {
        let blob = encode_embedding_blob(&[0.5, -0.25, 1.0]);
        assert_eq!(decode_embedding_blob(&blob, 3), Some(vec![0.5, -0.25, 1.0]));
        assert!(decode_embedding_blob(&blob, 4).is_none());
        assert!(decode_embedding_blob(&blob, 0).is_none());
    }
}
