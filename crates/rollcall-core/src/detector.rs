//! Face detection.
//!
//! [`FaceDetector`] is the capability the pipeline consumes. [`SsdDetector`]
//! implements it with the res10 300x300 SSD face model exported to ONNX and
//! run through ONNX Runtime.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- res10 SSD input contract ---
const SSD_INPUT_SIZE: u32 = 300;
/// Per-channel mean in B, G, R order.
const SSD_MEAN_BGR: [f32; 3] = [104.0, 177.0, 123.0];
/// Each detection row: [image_id, label, confidence, x1, y1, x2, y2].
const SSD_ROW_LEN: usize = 7;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame is empty")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates candidate face regions in a frame.
pub trait FaceDetector {
    /// Faces sorted by descending confidence, in frame pixel coordinates.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// res10 SSD face detector.
pub struct SsdDetector {
    session: Session,
}

impl SsdDetector {
    /// Load the SSD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SSD face detector"
        );

        Ok(Self { session })
    }

    /// Resize to 300x300 and build a BGR, mean-subtracted NCHW tensor.
    fn preprocess(frame: &RgbImage) -> Array4<f32> {
        let size = SSD_INPUT_SIZE as usize;
        let resized = imageops::resize(frame, SSD_INPUT_SIZE, SSD_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let [r, g, b] = pixel.0;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = b as f32 - SSD_MEAN_BGR[0];
            tensor[[0, 1, y, x]] = g as f32 - SSD_MEAN_BGR[1];
            tensor[[0, 2, y, x]] = r as f32 - SSD_MEAN_BGR[2];
        }

        tensor
    }
}

impl FaceDetector for SsdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectorError::EmptyFrame);
        }

        let input = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("detections: {e}")))?;

        Ok(decode_detections(raw, frame.width(), frame.height()))
    }
}

/// Decode SSD output rows into pixel-space boxes, highest confidence first.
///
/// Rows with non-finite values or non-positive confidence are dropped.
/// Coordinates are normalized to [0, 1] by the model and scaled here; they
/// are not clamped, the crop step does that.
fn decode_detections(raw: &[f32], width: u32, height: u32) -> Vec<BoundingBox> {
    let (w, h) = (width as f32, height as f32);

    let mut boxes: Vec<BoundingBox> = raw
        .chunks_exact(SSD_ROW_LEN)
        .filter(|row| row.iter().all(|v| v.is_finite()) && row[2] > 0.0)
        .map(|row| {
            let x1 = row[3] * w;
            let y1 = row[4] * h;
            let x2 = row[5] * w;
            let y2 = row[6] * h;
            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: row[2],
            }
        })
        .collect();

    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scales_to_frame() {
        let raw = [0.0, 1.0, 0.9, 0.25, 0.5, 0.75, 1.0];
        let boxes = decode_detections(&raw, 640, 480);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x - 160.0).abs() < 1e-3);
        assert!((b.y - 240.0).abs() < 1e-3);
        assert!((b.width - 320.0).abs() < 1e-3);
        assert!((b.height - 240.0).abs() < 1e-3);
        assert!((b.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_sorts_and_filters() {
        let raw = [
            0.0, 1.0, 0.4, 0.0, 0.0, 0.1, 0.1, //
            0.0, 1.0, 0.0, 0.0, 0.0, 0.1, 0.1, // zero confidence
            0.0, 1.0, 0.95, 0.5, 0.5, 0.6, 0.6, //
            0.0, 1.0, f32::NAN, 0.5, 0.5, 0.6, 0.6, // garbage
        ];
        let boxes = decode_detections(&raw, 100, 100);
        let confs: Vec<f32> = boxes.iter().map(|b| b.confidence).collect();
        assert_eq!(confs, vec![0.95, 0.4]);
    }

    #[test]
    fn test_decode_ignores_trailing_partial_row() {
        let raw = [0.0, 1.0, 0.9, 0.0, 0.0, 0.5, 0.5, 0.0, 1.0];
        assert_eq!(decode_detections(&raw, 10, 10).len(), 1);
    }

    #[test]
    fn test_preprocess_shape_and_channel_order() {
        let frame = RgbImage::from_pixel(40, 30, image::Rgb([10, 20, 30]));
        let tensor = SsdDetector::preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 300, 300]);
        // channel 0 is blue
        assert!((tensor[[0, 0, 150, 150]] - (30.0 - 104.0)).abs() < 1e-4);
        assert!((tensor[[0, 1, 150, 150]] - (20.0 - 177.0)).abs() < 1e-4);
        assert!((tensor[[0, 2, 150, 150]] - (10.0 - 123.0)).abs() < 1e-4);
    }

    #[test]
    fn test_load_missing_model() {
        let err = SsdDetector::load("/nonexistent/res10.onnx").err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
