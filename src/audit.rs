//! Audit hook.
//!
//! The core emits structured records through a write-only port; signing,
//! rotation, and integrity verification belong to the sink behind it. The
//! default sink appends JSONL through a buffered background task so the
//! request path never blocks on disk.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One routed request, as the audit trail sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: Uuid,
    pub decision: String,
    pub tier: Option<u8>,
    pub model_name: String,
    pub latency_ms: u64,
    pub degraded: bool,
    pub at: DateTime<Utc>,
}

/// Write-only audit port.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: AuditRecord);
}

/// Discards everything; used when auditing is disabled.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _record: AuditRecord) {}
}

/// Appends records as JSON lines to a file.
pub struct JsonlAuditSink {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl JsonlAuditSink {
    /// Spawn the writer task. Records sent after the task stops are
    /// silently dropped, which is acceptable for an advisory trail.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "audit sink disabled");
                    return;
                }
            };
            while let Some(record) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&record) else {
                    continue;
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, "audit write failed");
                }
            }
            let _ = file.flush().await;
        });
        Self { tx }
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, record: AuditRecord) {
        let _ = self.tx.send(record);
    }
}
