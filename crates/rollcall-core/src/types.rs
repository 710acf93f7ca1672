use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Face region reported by a detector, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Unit-norm face embedding.
///
/// The only way to build one is [`Embedding::normalized`], so every value
/// that reaches the matcher or the roster has an L2 norm of 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// L2-normalize a raw model output.
    pub fn normalized(raw: Vec<f32>) -> Result<Self, EmbeddingError> {
        if raw.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(idx) = raw.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(idx));
        }

        let norm = l2_norm(&raw);
        if norm <= f32::EPSILON || !norm.is_finite() {
            return Err(EmbeddingError::ZeroNorm);
        }

        Ok(Self {
            values: raw.into_iter().map(|v| v / norm).collect(),
        })
    }

    /// Normalize and check the dimension in one step.
    pub fn normalized_with_dim(raw: Vec<f32>, dim: usize) -> Result<Self, EmbeddingError> {
        if raw.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: raw.len(),
            });
        }
        Self::normalized(raw)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Euclidean norm of a raw vector.
pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine similarity of two raw vectors.
///
/// Returns 0.0 when either operand has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// A qualifying match of a probe against the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: String,
    /// Cosine similarity of the best candidate, always >= the acceptance threshold.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_has_unit_norm() {
        for raw in [
            vec![3.0, 4.0],
            vec![0.001, -0.002, 0.0005],
            vec![120.0, -7.5, 33.0, 0.0, 9.25],
        ] {
            let e = Embedding::normalized(raw).unwrap();
            assert!((e.norm() - 1.0).abs() < 1e-5, "norm was {}", e.norm());
        }
    }

    #[test]
    fn test_normalized_preserves_direction() {
        let e = Embedding::normalized(vec![3.0, 4.0]).unwrap();
        assert!((e.values()[0] - 0.6).abs() < 1e-6);
        assert!((e.values()[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_zero_vector() {
        assert_eq!(Embedding::normalized(vec![0.0; 4]), Err(EmbeddingError::ZeroNorm));
    }

    #[test]
    fn test_normalized_rejects_empty_and_nan() {
        assert_eq!(Embedding::normalized(vec![]), Err(EmbeddingError::Empty));
        assert_eq!(
            Embedding::normalized(vec![1.0, f32::NAN]),
            Err(EmbeddingError::NonFinite(1))
        );
    }

    #[test]
    fn test_normalized_with_dim_mismatch() {
        let err = Embedding::normalized_with_dim(vec![1.0, 0.0], 3).unwrap_err();
        assert_eq!(err, EmbeddingError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_cosine_similarity_identical() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_length_mismatch() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let pairs = [
            (vec![0.3, -0.7, 1.2], vec![2.0, 0.1, -0.4]),
            (vec![1.0, 1.0, 1.0], vec![-1.0, 0.5, 0.25]),
            (vec![0.0, 5.0, 0.0], vec![0.0, 0.0, 3.0]),
        ];
        for (a, b) in pairs {
            assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
        }
    }
}
