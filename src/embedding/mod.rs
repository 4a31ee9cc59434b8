//! Embedding service.
//!
//! Produces fixed-dimension vectors for short texts, deterministically for
//! a given text within a process lifetime. The backend is constructed once
//! at startup and stays resident. When the configured backend is
//! unavailable at startup the service runs degraded: `embed` returns a zero
//! vector and `/health` reports the flag.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{MindgateError, Result};
use crate::settings::{EmbeddingBackendKind, EmbeddingSettings};

/// Fixed output dimension.
pub const EMBEDDING_DIM: usize = 256;

#[async_trait]
trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ---------------------------------------------------------------------------
// Local projection backend
// ---------------------------------------------------------------------------

/// In-process embedder: hashed word and character-trigram features folded
/// into a fixed-width vector, L2-normalised. Stable across processes.
struct LocalProjectionBackend;

impl LocalProjectionBackend {
    fn fold(text: &str) -> Vec<f32> {
        let mut acc = vec![0.0f32; EMBEDDING_DIM];
        let lower = text.to_lowercase();

        for token in lower.split_whitespace() {
            Self::accumulate(&mut acc, token.as_bytes(), 1.0);
        }
        let chars: Vec<char> = lower.chars().collect();
        for gram in chars.windows(3) {
            let s: String = gram.iter().collect();
            Self::accumulate(&mut acc, s.as_bytes(), 0.5);
        }

        let norm = acc.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut acc {
                *v /= norm;
            }
        }
        acc
    }

    fn accumulate(acc: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        // Each 4-byte window contributes one signed bump.
        for chunk in digest.chunks_exact(4) {
            let idx = u16::from_le_bytes([chunk[0], chunk[1]]) as usize % EMBEDDING_DIM;
            let sign = if chunk[2] & 1 == 0 { 1.0 } else { -1.0 };
            let magnitude = (chunk[3] as f32 / 255.0) * weight;
            acc[idx] += sign * magnitude;
        }
    }
}

#[async_trait]
impl EmbeddingBackend for LocalProjectionBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::fold(text))
    }
}

// ---------------------------------------------------------------------------
// Remote backend
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RemoteEmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct RemoteEmbeddingResponse {
    data: Vec<RemoteEmbeddingItem>,
}

struct RemoteEmbeddingBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl RemoteEmbeddingBackend {
    fn new(settings: &EmbeddingSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.remote_base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for RemoteEmbeddingBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| MindgateError::GenerationFailed(format!("embedding request: {e}")))?
            .error_for_status()
            .map_err(|e| MindgateError::GenerationFailed(format!("embedding status: {e}")))?;

        let body: RemoteEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MindgateError::GenerationFailed(format!("embedding body: {e}")))?;

        let mut vector = body
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| MindgateError::GenerationFailed("empty embedding response".into()))?;
        vector.resize(EMBEDDING_DIM, 0.0);
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct EmbeddingService {
    backend: Box<dyn EmbeddingBackend>,
    degraded: AtomicBool,
}

impl EmbeddingService {
    /// Construct the configured backend and probe it once. A failed probe
    /// leaves the service in degraded mode rather than failing startup.
    pub async fn initialize(settings: &EmbeddingSettings) -> Self {
        let backend: Box<dyn EmbeddingBackend> = match settings.backend {
            EmbeddingBackendKind::Local => Box::new(LocalProjectionBackend),
            EmbeddingBackendKind::Remote => Box::new(RemoteEmbeddingBackend::new(settings)),
        };
        let service = Self { backend, degraded: AtomicBool::new(false) };

        if let Err(e) = service.backend.embed("startup probe").await {
            tracing::warn!(error = %e, "embedding backend unavailable, running degraded");
            service.degraded.store(true, Ordering::Relaxed);
        }
        service
    }

    /// Embed a text. Degraded mode yields the zero vector, which is still a
    /// deterministic function of the input.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        if self.degraded.load(Ordering::Relaxed) {
            return vec![0.0; EMBEDDING_DIM];
        }
        match self.backend.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, degrading");
                self.degraded.store(true, Ordering::Relaxed);
                vec![0.0; EMBEDDING_DIM]
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}
