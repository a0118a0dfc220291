//! ONNX-backed implementations of the three detection models.
//!
//! Tensor shapes are fixed by the model export:
//! - melspectrogram: `[1, 1280]` f32 → `[1, 1, 8, 32]` (8 mel frames)
//! - embedding:      `[1, 76, 32, 1]` → `[1, 1, 1, 96]`
//! - classifier:     `[1, 16, 96]`    → `[1, 1]` score
//!
//! Sessions are owned exclusively by the wake-word task; nothing here is
//! shared or locked.

use super::{
    Embedding, EmbeddingBackend, MelFrame, MelFrontend, ModelError, WakeClassifier, EMBEDDING_DIM,
    EMBEDDING_WINDOW, MEL_BINS, MEL_WINDOW,
};
use crate::FRAME_SAMPLES;
use ndarray::{Array2, Array3, Array4};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use std::path::Path;

fn load_session(path: &Path) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::Load(format!(
            "model file not found: {}",
            path.display()
        )));
    }
    SessionBuilder::new()
        .map_err(|e| ModelError::Load(e.to_string()))?
        .with_intra_threads(1)
        .map_err(|e| ModelError::Load(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| ModelError::Load(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| ModelError::Load(format!("{}: {}", path.display(), e)))
}

pub struct OnnxMelFrontend {
    session: Session,
}

impl OnnxMelFrontend {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        log::info!("Loading melspectrogram model from {}", path.display());
        Ok(Self {
            session: load_session(path)?,
        })
    }
}

impl MelFrontend for OnnxMelFrontend {
    fn mel_frames(&mut self, samples: &[f32]) -> Result<Vec<MelFrame>, ModelError> {
        if samples.len() != FRAME_SAMPLES {
            return Err(ModelError::Shape(format!(
                "expected {} samples, got {}",
                FRAME_SAMPLES,
                samples.len()
            )));
        }

        let input = Array2::from_shape_vec((1, FRAME_SAMPLES), samples.to_vec())
            .map_err(|e| ModelError::Shape(e.to_string()))?;
        let value = Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        if data.len() % MEL_BINS != 0 {
            return Err(ModelError::Shape(format!(
                "mel output length {} is not a multiple of {}",
                data.len(),
                MEL_BINS
            )));
        }

        // The exported model emits log-mel values scaled by 10 and shifted;
        // the embedding model expects the normalized range.
        let frames = data
            .chunks_exact(MEL_BINS)
            .map(|bins| {
                let mut frame = [0.0f32; MEL_BINS];
                for (slot, &v) in frame.iter_mut().zip(bins) {
                    *slot = v / 10.0 + 2.0;
                }
                frame
            })
            .collect();
        Ok(frames)
    }
}

pub struct OnnxEmbeddingBackend {
    session: Session,
}

impl OnnxEmbeddingBackend {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        log::info!("Loading embedding model from {}", path.display());
        Ok(Self {
            session: load_session(path)?,
        })
    }
}

impl EmbeddingBackend for OnnxEmbeddingBackend {
    fn embed(&mut self, window: &[&MelFrame]) -> Result<Embedding, ModelError> {
        if window.len() != MEL_WINDOW {
            return Err(ModelError::Shape(format!(
                "expected {} mel frames, got {}",
                MEL_WINDOW,
                window.len()
            )));
        }

        let mut input = Array4::<f32>::zeros((1, MEL_WINDOW, MEL_BINS, 1));
        for (i, frame) in window.iter().enumerate() {
            for (j, &v) in frame.iter().enumerate() {
                input[[0, i, j, 0]] = v;
            }
        }
        let value = Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        if data.len() != EMBEDDING_DIM {
            return Err(ModelError::Shape(format!(
                "expected {}-dim embedding, got {}",
                EMBEDDING_DIM,
                data.len()
            )));
        }
        let mut embedding = [0.0f32; EMBEDDING_DIM];
        embedding.copy_from_slice(data);
        Ok(embedding)
    }
}

pub struct OnnxWakeClassifier {
    session: Session,
}

impl OnnxWakeClassifier {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        log::info!("Loading wake-word model from {}", path.display());
        Ok(Self {
            session: load_session(path)?,
        })
    }
}

impl WakeClassifier for OnnxWakeClassifier {
    fn score(&mut self, window: &[&Embedding]) -> Result<f32, ModelError> {
        if window.len() != EMBEDDING_WINDOW {
            return Err(ModelError::Shape(format!(
                "expected {} embeddings, got {}",
                EMBEDDING_WINDOW,
                window.len()
            )));
        }

        let mut input = Array3::<f32>::zeros((1, EMBEDDING_WINDOW, EMBEDDING_DIM));
        for (i, embedding) in window.iter().enumerate() {
            for (j, &v) in embedding.iter().enumerate() {
                input[[0, i, j]] = v;
            }
        }
        let value = Value::from_array(input).map_err(|e| ModelError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| ModelError::Inference(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let raw = data
            .first()
            .copied()
            .ok_or_else(|| ModelError::Shape("empty classifier output".into()))?;
        Ok(raw.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_file_is_a_load_error() {
        let err = OnnxMelFrontend::load(Path::new("does/not/exist.onnx")).unwrap_err();
        assert!(matches!(err, ModelError::Load(_)));
        assert!(err.to_string().contains("not found"));
    }
}
