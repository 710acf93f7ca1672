//! Face embedding extraction.
//!
//! [`FaceEmbedder`] turns a face crop into a raw embedding vector. The
//! caller normalizes it. [`ArcFaceEmbedder`] runs an InsightFace ArcFace
//! model through ONNX Runtime.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Extracts a raw (un-normalized) embedding from a face crop.
pub trait FaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError>;
}

/// ArcFace recognizer.
pub struct ArcFaceEmbedder {
    session: Session,
    dim: usize,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model. `dim` is the expected output length.
    pub fn load(model_path: &str, dim: usize) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            dim,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Resize a crop to 112x112 and build a normalized BGR NCHW tensor.
    ///
    /// Planes are B, G, R, the order roster embeddings are enrolled with.
    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let resized = imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            tensor[[0, 0, y, x]] = (b as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 1, y, x]] = (g as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 2, y, x]] = (r as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::EmptyCrop);
        }

        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != self.dim {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dim,
                raw.len()
            )));
        }

        Ok(raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let face = RgbImage::from_pixel(90, 120, image::Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_bgr_planes() {
        let face = RgbImage::from_pixel(112, 112, image::Rgb([255, 0, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&face);
        let blue = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 5, 5]] - blue).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceEmbedder::load("/nonexistent/arcface.onnx", ARCFACE_EMBEDDING_DIM)
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
