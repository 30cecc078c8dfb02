// src/embeddings.rs
// Local embedding provider over fastembed (ONNX runtime, no network service)

use crate::error::{MetaError, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};

/// Embedding dimension of all-MiniLM-L6-v2.
pub const EMBEDDING_DIM: usize = 384;

/// Text-to-vector client backed by a local sentence-embedding model.
///
/// The model is loaded once at startup and produces deterministic vectors
/// for the lifetime of the index.
#[derive(Clone)]
pub struct EmbeddingClient {
    model: Arc<Mutex<TextEmbedding>>,
}

impl EmbeddingClient {
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| MetaError::Embedding(format!("failed to load embedding model: {e}")))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }

    pub fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    pub fn model_name(&self) -> &'static str {
        "all-MiniLM-L6-v2"
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MetaError::Embedding("model returned no embedding".into()))
    }

    /// Embed multiple texts in one pass. The encode is CPU-bound, so it runs
    /// on the blocking pool.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.clone();
        let texts = texts.to_vec();
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = match model.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.embed(texts, None)
        })
        .await
        .map_err(|e| MetaError::Embedding(format!("embedding task failed: {e}")))?
        .map_err(|e| MetaError::Embedding(e.to_string()))?;

        Ok(vectors)
    }
}
