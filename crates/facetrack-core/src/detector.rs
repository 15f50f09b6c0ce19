//! Boundary to the external face detection / embedding capability.

use crate::types::{BoundingBox, Embedding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A face region together with its identity embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Face detector + embedding extractor.
///
/// Given an 8-bit grayscale image, returns every detected face, sorted by
/// confidence (highest first). Embeddings need not be normalized.
pub trait FaceDetector: Send {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, DetectorError>;
}
