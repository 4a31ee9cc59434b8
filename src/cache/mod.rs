//! Semantic cache.
//!
//! Maps a quantised-embedding key to a previously computed routing decision
//! and weight pair. The cache is advisory: a miss never fails a request and
//! a stale entry is simply not returned. Size is bounded with LRU eviction;
//! a repeated `set` for the same key overwrites in place.
//!
//! Persistence is a JSONL snapshot under the state directory, loaded
//! leniently: missing or truncated files restart the cache cold.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::request::{RouteDecision, Weights};
use crate::settings::CacheSettings;

/// Quantise an embedding: rescale each dimension from `[-1, 1]` into
/// `[0, levels)` and cast to a byte. Pure; repeated application over the
/// same vector yields identical bytes.
pub fn quantise(embedding: &[f32], levels: u32) -> Vec<u8> {
    let levels = levels.clamp(1, 256) as f32;
    embedding
        .iter()
        .map(|v| {
            let unit = (v.clamp(-1.0, 1.0) + 1.0) / 2.0;
            ((unit * levels).min(levels - 1.0)) as u8
        })
        .collect()
}

/// Cache key: fingerprint of the quantised bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn from_embedding(embedding: &[f32], levels: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(quantise(embedding, levels));
        Self(hasher.finalize().into())
    }

    fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(hex, 16).ok()?;
        }
        Some(Self(out))
    }
}

/// What a hit returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDecision {
    pub weights: Weights,
    pub decision_hint: Option<RouteDecision>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    #[serde(flatten)]
    value: CachedDecision,
}

struct CacheInner {
    entries: HashMap<CacheKey, (CachedDecision, u64)>,
    tick: u64,
}

pub struct SemanticCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
    quant_levels: u32,
}

impl SemanticCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            inner: Mutex::new(CacheInner { entries: HashMap::new(), tick: 0 }),
            ttl: Duration::from_secs(settings.semantic_ttl_seconds),
            capacity: settings.capacity.max(1),
            quant_levels: settings.quant_levels,
        }
    }

    /// Look up by embedding. Returns the stored value only when its
    /// timestamp is within TTL; expired entries are dropped on the way out.
    pub fn get(&self, embedding: &[f32]) -> Option<CachedDecision> {
        let key = CacheKey::from_embedding(embedding, self.quant_levels);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.tick += 1;
        let tick = inner.tick;

        let fresh = match inner.entries.get_mut(&key) {
            Some((value, last_used)) => {
                let age = Utc::now().signed_duration_since(value.stored_at);
                if age.to_std().map(|a| a < self.ttl).unwrap_or(true) {
                    *last_used = tick;
                    Some(value.clone())
                } else {
                    None
                }
            }
            None => return None,
        };
        if fresh.is_none() {
            inner.entries.remove(&key);
        }
        fresh
    }

    /// Store a decision. Same key overwrites in place; beyond capacity the
    /// least recently used entry is evicted first.
    pub fn set(&self, embedding: &[f32], weights: Weights, decision_hint: Option<RouteDecision>) {
        let key = CacheKey::from_embedding(embedding, self.quant_levels);
        let value = CachedDecision { weights, decision_hint, stored_at: Utc::now() };

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(victim) =
                inner.entries.iter().min_by_key(|(_, (_, used))| *used).map(|(k, _)| *k)
            {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(key, (value, tick));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a JSONL snapshot. Unparseable lines are skipped so a truncated
    /// file restarts cold rather than failing startup.
    pub fn load(&self, path: &Path) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for line in raw.lines() {
            let Ok(entry) = serde_json::from_str::<PersistedEntry>(line) else {
                continue;
            };
            let Some(key) = CacheKey::from_hex(&entry.key) else {
                continue;
            };
            if inner.entries.len() >= self.capacity {
                break;
            }
            inner.tick += 1;
            let tick = inner.tick;
            inner.entries.insert(key, (entry.value, tick));
        }
        tracing::info!(entries = inner.entries.len(), "semantic cache loaded");
    }

    /// Write the JSONL snapshot.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = String::new();
        for (key, (value, _)) in &inner.entries {
            let entry = PersistedEntry { key: key.to_hex(), value: value.clone() };
            if let Ok(line) = serde_json::to_string(&entry) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        std::fs::write(path, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CascadeTier;

    fn cache_with(ttl: u64, capacity: usize) -> SemanticCache {
        SemanticCache::new(&CacheSettings {
            semantic_ttl_seconds: ttl,
            quant_levels: 32,
            capacity,
        })
    }

    fn embedding(seed: f32) -> Vec<f32> {
        (0..8).map(|i| ((i as f32) * 0.1 + seed).sin()).collect()
    }

    #[test]
    fn quantisation_is_pure() {
        let e = embedding(0.3);
        let a = quantise(&e, 32);
        let b = quantise(&e, 32);
        assert_eq!(a, b);
        assert!(a.iter().all(|&byte| byte < 32));
    }

    #[test]
    fn hit_within_ttl() {
        let cache = cache_with(60, 16);
        let e = embedding(0.1);
        cache.set(&e, Weights::from_alpha(0.95), Some(RouteDecision::Cascade(CascadeTier::T1)));
        let hit = cache.get(&e).unwrap();
        assert_eq!(hit.weights, Weights::from_alpha(0.95));
        assert_eq!(hit.decision_hint, Some(RouteDecision::Cascade(CascadeTier::T1)));
    }

    #[test]
    fn expired_entry_is_not_returned() {
        let cache = cache_with(0, 16);
        let e = embedding(0.2);
        cache.set(&e, Weights::from_alpha(0.6), None);
        assert!(cache.get(&e).is_none());
    }

    #[test]
    fn set_is_idempotent_on_size() {
        let cache = cache_with(60, 4);
        let e = embedding(0.5);
        cache.set(&e, Weights::from_alpha(0.6), None);
        cache.set(&e, Weights::from_alpha(0.8), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&e).unwrap().weights, Weights::from_alpha(0.8));
    }

    #[test]
    fn capacity_is_bounded_with_lru_eviction() {
        let cache = cache_with(60, 3);
        let keep = embedding(0.0);
        cache.set(&keep, Weights::from_alpha(0.9), None);
        cache.set(&embedding(1.0), Weights::from_alpha(0.5), None);
        cache.set(&embedding(2.0), Weights::from_alpha(0.5), None);
        // Touch the first entry so it is not the LRU victim.
        assert!(cache.get(&keep).is_some());
        cache.set(&embedding(3.0), Weights::from_alpha(0.5), None);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&keep).is_some());
    }

    #[test]
    fn nearby_vectors_share_a_bucket() {
        let cache = cache_with(60, 16);
        let a = embedding(0.4);
        // Perturbation below the quantisation step width.
        let b: Vec<f32> = a.iter().map(|v| v + 0.001).collect();
        cache.set(&a, Weights::from_alpha(0.2), None);
        assert!(cache.get(&b).is_some());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");

        let cache = cache_with(60, 16);
        let e = embedding(0.7);
        cache.set(&e, Weights::from_alpha(0.95), Some(RouteDecision::WebSynthesis));
        cache.save(&path).unwrap();

        let restored = cache_with(60, 16);
        restored.load(&path);
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.get(&e).unwrap().decision_hint,
            Some(RouteDecision::WebSynthesis)
        );
    }

    #[test]
    fn truncated_snapshot_restarts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");
        std::fs::write(&path, "{\"key\": \"abc\", \"truncat").unwrap();

        let cache = cache_with(60, 16);
        cache.load(&path);
        assert!(cache.is_empty());
    }
}
