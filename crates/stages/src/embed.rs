use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::StageError;
use crate::stage::{Stage, StageData, StageKind};

/// Turns summary text into a dense vector.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError>;
}

/// Feature-hashing embedder: each lowercase token is hashed into a signed
/// bucket, then the vector is L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dimensions;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, StageError> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Clone)]
pub struct EmbedStage {
    embedder: Arc<dyn Embedder>,
}

impl EmbedStage {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl Stage for EmbedStage {
    fn kind(&self) -> StageKind {
        StageKind::Embed
    }

    async fn transform(&self, mut input: StageData) -> Result<StageData, StageError> {
        let text = input.require_summary(StageKind::Embed)?.embedding_text();
        let vector = self.embedder.embed(&text).await?;
        if vector.len() != self.embedder.dimensions() {
            return Err(StageError::validation(format!(
                "embedding has {} dimensions, expected {}",
                vector.len(),
                self.embedder.dimensions()
            )));
        }
        input.embedding = Some(vector);
        Ok(input)
    }
}
