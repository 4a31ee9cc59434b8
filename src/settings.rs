//! Runtime settings.
//!
//! Settings are read from a TOML file with env var > file > default
//! priority. Every key is recognised under two spellings (English and
//! Spanish); both resolve to the same internal field. Missing sections
//! yield defaults and never fail loading; unknown keys are logged and
//! ignored; type mismatches are startup-fatal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MindgateError, Result};
use crate::request::{BackendKind, ModelDescriptor};

/// Env var overriding the remote inference/embedding base URL.
pub const ENV_REMOTE_BASE_URL: &str = "MINDGATE_REMOTE_BASE_URL";
/// Env var overriding the directory local model files are resolved against.
pub const ENV_MODEL_DIR: &str = "MINDGATE_MODEL_DIR";
/// Env var overriding the persisted-state directory.
pub const ENV_STATE_DIR: &str = "MINDGATE_STATE_DIR";

/// Top-level settings document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Execution backend and concurrency limits.
    #[serde(default, alias = "ejecucion")]
    pub runtime: RuntimeSettings,

    /// RAM budget and residency policy.
    #[serde(default, alias = "memoria")]
    pub memory: MemorySettings,

    /// Cascade tier thresholds and bindings.
    #[serde(default, alias = "cascada")]
    pub cascade: CascadeSettings,

    /// Predictive health monitor tuning.
    #[serde(default, alias = "salud")]
    pub health: HealthSettings,

    /// Semantic cache tuning.
    #[serde(default, alias = "cache_semantica")]
    pub cache: CacheSettings,

    /// HTTP listener.
    #[serde(default, alias = "servidor")]
    pub server: ServerSettings,

    /// Iterative refiner tuning.
    #[serde(default, alias = "refinador")]
    pub refiner: RefinerSettings,

    /// Routing thresholds and decision→model bindings.
    #[serde(default, alias = "enrutador")]
    pub router: RouterSettings,

    /// Embedding service configuration.
    #[serde(default, alias = "incrustaciones")]
    pub embedding: EmbeddingSettings,

    /// Audit sink configuration.
    #[serde(default, alias = "auditoria")]
    pub audit: AuditSettings,

    /// Directory for persisted state (semantic cache, phase counter).
    #[serde(default, alias = "directorio_estado")]
    pub state_dir: Option<PathBuf>,

    /// Model catalog keyed by logical name. Empty means the built-in
    /// catalog is used.
    #[serde(default, alias = "modelos")]
    pub models: BTreeMap<String, ModelDescriptor>,
}

// ---------------------------------------------------------------------------
// [runtime]
// ---------------------------------------------------------------------------

/// Execution backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeBackend {
    #[default]
    LocalCpu,
    RemoteGpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// `local-cpu` or `remote-gpu`.
    #[serde(default, alias = "motor")]
    pub backend: RuntimeBackend,

    /// Upper bound on co-resident models.
    #[serde(default = "default_max_concurrent_models", alias = "max_modelos_concurrentes")]
    pub max_concurrent_models: usize,

    /// Worker threads servicing classification, generation, and prefetch.
    #[serde(default = "default_worker_threads", alias = "hilos_trabajo")]
    pub worker_threads: usize,

    /// Longest a `get` may block while a model loads.
    #[serde(default = "default_load_deadline", alias = "segundos_limite_carga")]
    pub load_deadline_seconds: u64,

    /// Quiet period before the prefetcher acts on partial input.
    #[serde(default = "default_prefetch_debounce", alias = "ms_antirebote_precarga")]
    pub prefetch_debounce_ms: u64,
}

fn default_max_concurrent_models() -> usize {
    2
}

fn default_worker_threads() -> usize {
    4
}

fn default_load_deadline() -> u64 {
    30
}

fn default_prefetch_debounce() -> u64 {
    300
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::LocalCpu,
            max_concurrent_models: default_max_concurrent_models(),
            worker_threads: default_worker_threads(),
            load_deadline_seconds: default_load_deadline(),
            prefetch_debounce_ms: default_prefetch_debounce(),
        }
    }
}

// ---------------------------------------------------------------------------
// [memory]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// RAM cap the pool's admission arithmetic enforces.
    #[serde(default = "default_max_ram_bytes", alias = "max_bytes_memoria")]
    pub max_ram_bytes: u64,

    /// Default idle TTL for resident models; per-descriptor values win.
    #[serde(default = "default_idle_ttl", alias = "segundos_ttl_inactivo")]
    pub idle_ttl_seconds: u64,

    /// Memory-map local model files instead of reading them.
    #[serde(default = "default_true", alias = "usar_mmap")]
    pub use_mmap: bool,

    /// Lock resident model pages in RAM.
    #[serde(default, alias = "bloquear_residente")]
    pub lock_resident: bool,
}

fn default_max_ram_bytes() -> u64 {
    12 * 1024 * 1024 * 1024
}

fn default_idle_ttl() -> u64 {
    600
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_ram_bytes: default_max_ram_bytes(),
            idle_ttl_seconds: default_idle_ttl(),
            use_mmap: true,
            lock_resident: false,
        }
    }
}

// ---------------------------------------------------------------------------
// [cascade]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSettings {
    /// Confidence floor for this tier (boundary inclusive).
    #[serde(default = "default_half", alias = "confianza_minima")]
    pub min_confidence: f64,
}

fn default_half() -> f64 {
    0.5
}

impl Default for TierSettings {
    fn default() -> Self {
        Self { min_confidence: default_half() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeSettings {
    #[serde(default = "default_tier1", alias = "nivel1")]
    pub tier1: TierSettings,

    #[serde(default = "default_tier2", alias = "nivel2")]
    pub tier2: TierSettings,

    /// Case-insensitive substrings that force Tier 3 unconditionally.
    #[serde(default = "default_force_patterns", alias = "patrones_forzados")]
    pub force_patterns: Vec<String>,

    /// Pool name each tier resolves to.
    #[serde(default = "default_tier1_model", alias = "modelo_nivel1")]
    pub tier1_model: String,
    #[serde(default = "default_tier2_model", alias = "modelo_nivel2")]
    pub tier2_model: String,
    #[serde(default = "default_tier3_model", alias = "modelo_nivel3")]
    pub tier3_model: String,
}

fn default_tier1() -> TierSettings {
    TierSettings { min_confidence: 0.75 }
}

fn default_tier2() -> TierSettings {
    TierSettings { min_confidence: 0.45 }
}

fn default_force_patterns() -> Vec<String> {
    vec![
        "prove".to_string(),
        "step by step".to_string(),
        "formal proof".to_string(),
        "deep analysis".to_string(),
    ]
}

fn default_tier1_model() -> String {
    "tiny".to_string()
}

fn default_tier2_model() -> String {
    "cascade.t2".to_string()
}

fn default_tier3_model() -> String {
    "cascade.t3".to_string()
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            tier1: default_tier1(),
            tier2: default_tier2(),
            force_patterns: default_force_patterns(),
            tier1_model: default_tier1_model(),
            tier2_model: default_tier2_model(),
            tier3_model: default_tier3_model(),
        }
    }
}

// ---------------------------------------------------------------------------
// [health]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Admission is rejected when the OOM ETA drops below this.
    #[serde(default = "default_oom_warn", alias = "segundos_aviso_oom")]
    pub oom_warn_seconds: u64,

    /// EWMA smoothing factor in (0, 1].
    #[serde(default = "default_ewma_alpha", alias = "alfa_ewma")]
    pub ewma_alpha: f64,

    /// RAM sampling period.
    #[serde(default = "default_sample_period", alias = "ms_periodo_muestreo")]
    pub sample_period_ms: u64,

    /// Samples required before an ETA is trusted.
    #[serde(default = "default_min_samples", alias = "muestras_minimas")]
    pub min_samples: usize,
}

fn default_oom_warn() -> u64 {
    60
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_sample_period() -> u64 {
    1000
}

fn default_min_samples() -> usize {
    6
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            oom_warn_seconds: default_oom_warn(),
            ewma_alpha: default_ewma_alpha(),
            sample_period_ms: default_sample_period(),
            min_samples: default_min_samples(),
        }
    }
}

// ---------------------------------------------------------------------------
// [cache]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Entries older than this are not returned.
    #[serde(default = "default_semantic_ttl", alias = "segundos_ttl_semantico")]
    pub semantic_ttl_seconds: u64,

    /// Quantisation levels per embedding dimension.
    #[serde(default = "default_quant_levels", alias = "niveles_cuantizacion")]
    pub quant_levels: u32,

    /// Bounded entry count; LRU beyond this.
    #[serde(default = "default_cache_capacity", alias = "capacidad")]
    pub capacity: usize,
}

fn default_semantic_ttl() -> u64 {
    900
}

fn default_quant_levels() -> u32 {
    32
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            semantic_ttl_seconds: default_semantic_ttl(),
            quant_levels: default_quant_levels(),
            capacity: default_cache_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// [server]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host", alias = "anfitrion")]
    pub host: String,

    #[serde(default = "default_port", alias = "puerto")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8484
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

// ---------------------------------------------------------------------------
// [refiner]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerSettings {
    #[serde(default = "default_true", alias = "activado")]
    pub enabled: bool,

    #[serde(default = "default_refiner_iterations", alias = "max_iteraciones")]
    pub max_iterations: usize,

    /// LCS similarity at or above this counts as converged.
    #[serde(default = "default_convergence", alias = "umbral_convergencia")]
    pub convergence_threshold: f64,

    /// Queries shorter than this skip refinement.
    #[serde(default = "default_min_query_len", alias = "longitud_minima_consulta")]
    pub min_query_len: usize,

    /// Composite quality weights: length, keyword overlap, sentence count,
    /// conclusion marker.
    #[serde(default = "default_quality_weights", alias = "pesos_calidad")]
    pub quality_weights: [f64; 4],
}

fn default_refiner_iterations() -> usize {
    3
}

fn default_convergence() -> f64 {
    0.95
}

fn default_min_query_len() -> usize {
    24
}

fn default_quality_weights() -> [f64; 4] {
    [0.3, 0.3, 0.2, 0.2]
}

impl Default for RefinerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_refiner_iterations(),
            convergence_threshold: default_convergence(),
            min_query_len: default_min_query_len(),
            quality_weights: default_quality_weights(),
        }
    }
}

// ---------------------------------------------------------------------------
// [router]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Programming-skill axis threshold for the code expert.
    #[serde(default = "default_code_threshold", alias = "umbral_codigo")]
    pub code_threshold: f64,

    /// `web_query` threshold for web synthesis.
    #[serde(default = "default_web_threshold", alias = "umbral_web")]
    pub web_threshold: f64,

    /// Minimum text length for the multimodal loop.
    #[serde(default = "default_multimodal_min", alias = "longitud_minima_multimodal")]
    pub multimodal_min_text_len: usize,

    /// α above this enters the cascade.
    #[serde(default = "default_alpha_cascade", alias = "umbral_alfa_cascada")]
    pub alpha_cascade_threshold: f64,

    #[serde(default = "default_vision_model", alias = "modelo_vision")]
    pub vision_model: String,
    #[serde(default = "default_code_model", alias = "modelo_codigo")]
    pub code_model: String,
    #[serde(default = "default_web_model", alias = "modelo_web")]
    pub web_model: String,
    #[serde(default = "default_multimodal_model", alias = "modelo_multimodal")]
    pub multimodal_model: String,
    #[serde(default = "default_audio_model", alias = "modelo_audio")]
    pub audio_model: String,
    #[serde(default = "default_empathic_model", alias = "modelo_empatico")]
    pub empathic_model: String,
}

fn default_code_threshold() -> f64 {
    0.5
}

fn default_web_threshold() -> f64 {
    0.7
}

fn default_multimodal_min() -> usize {
    120
}

fn default_alpha_cascade() -> f64 {
    0.7
}

fn default_vision_model() -> String {
    "vision".to_string()
}

fn default_code_model() -> String {
    "code".to_string()
}

fn default_web_model() -> String {
    "expert_short".to_string()
}

fn default_multimodal_model() -> String {
    "vision".to_string()
}

fn default_audio_model() -> String {
    "tiny".to_string()
}

fn default_empathic_model() -> String {
    "expert_short".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            code_threshold: default_code_threshold(),
            web_threshold: default_web_threshold(),
            multimodal_min_text_len: default_multimodal_min(),
            alpha_cascade_threshold: default_alpha_cascade(),
            vision_model: default_vision_model(),
            code_model: default_code_model(),
            web_model: default_web_model(),
            multimodal_model: default_multimodal_model(),
            audio_model: default_audio_model(),
            empathic_model: default_empathic_model(),
        }
    }
}

// ---------------------------------------------------------------------------
// [embedding]
// ---------------------------------------------------------------------------

/// Which embedding backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackendKind {
    /// In-process deterministic projection; always available.
    #[default]
    Local,
    /// Remote embedding endpoint; degrades to zero vectors when unreachable.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default, alias = "motor")]
    pub backend: EmbeddingBackendKind,

    /// Base URL for the remote backend.
    #[serde(default = "default_remote_base_url", alias = "url_base_remota")]
    pub remote_base_url: String,

    /// Model name sent to the remote backend.
    #[serde(default = "default_embedding_model", alias = "modelo")]
    pub model: String,
}

fn default_remote_base_url() -> String {
    "http://localhost:8089".to_string()
}

fn default_embedding_model() -> String {
    "all-minilm-l6-v2".to_string()
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::Local,
            remote_base_url: default_remote_base_url(),
            model: default_embedding_model(),
        }
    }
}

// ---------------------------------------------------------------------------
// [audit]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default = "default_true", alias = "activado")]
    pub enabled: bool,

    /// Record file path; defaults to `<state_dir>/audit.jsonl`.
    #[serde(default, alias = "ruta")]
    pub path: Option<PathBuf>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self { enabled: true, path: None }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Built-in model catalog
// ---------------------------------------------------------------------------

fn md(
    name: &str,
    backend: BackendKind,
    location: &str,
    ctx: u32,
    load_secs: f64,
    ttl: u64,
    ram: u64,
    swap_group: Option<&str>,
    fallback: &[&str],
) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        backend,
        location: location.to_string(),
        context_window: ctx,
        quantization: Some("q4_k_m".to_string()),
        load_secs_estimate: load_secs,
        idle_ttl_seconds: ttl,
        ram_estimate_bytes: ram,
        swap_group: swap_group.map(str::to_string),
        fallback: fallback.iter().map(|s| s.to_string()).collect(),
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// Catalog used when `[models]` is absent from the settings file.
pub fn builtin_models() -> BTreeMap<String, ModelDescriptor> {
    let entries = [
        md("expert_short", BackendKind::LocalFile, "expert-short.gguf", 8_192, 6.0, 600, 3 * GIB + GIB / 2, None, &["tiny"]),
        md("expert_long", BackendKind::LocalFile, "expert-long.gguf", 32_768, 14.0, 600, 6 * GIB, None, &["expert_short", "tiny"]),
        md("tiny", BackendKind::LocalFile, "tiny.gguf", 4_096, 2.0, 900, GIB, Some("compact"), &[]),
        md("vision", BackendKind::LocalFile, "vision.gguf", 4_096, 5.0, 300, 2 * GIB, Some("compact"), &["tiny"]),
        md("code", BackendKind::LocalFile, "code.gguf", 16_384, 8.0, 600, 4 * GIB, None, &["expert_short", "tiny"]),
        md("cascade.t2", BackendKind::RemoteRpc, "http://localhost:8090", 16_384, 0.5, 1800, 64 * 1024 * 1024, None, &["expert_short"]),
        md("cascade.t3", BackendKind::RemoteRpc, "http://localhost:8091", 32_768, 0.5, 1800, 64 * 1024 * 1024, None, &["cascade.t2", "expert_long"]),
    ];
    entries.into_iter().map(|d| (d.name.clone(), d)).collect()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    /// Default settings file path (`~/.mindgate/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mindgate")
            .join("config.toml")
    }

    /// Directory for persisted state, honouring the configured override.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mindgate")
                .join("state")
        })
    }

    /// Load from `path`, or defaults when the file is absent. Type errors
    /// are fatal; unknown keys warn; env overrides are applied last.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let value: toml::Value = raw
                    .parse()
                    .map_err(|e| MindgateError::ConfigInvalid(format!("{}: {e}", path.display())))?;
                warn_unknown_keys(&value);
                value
                    .try_into()
                    .map_err(|e| MindgateError::ConfigInvalid(format!("{}: {e}", path.display())))?
            }
            Err(_) => Self::default(),
        };
        settings.apply_env_overrides();
        settings.finish()?;
        Ok(settings)
    }

    /// Env var > file > default, as for every other setting source.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_REMOTE_BASE_URL) {
            if !url.is_empty() {
                self.embedding.remote_base_url = url.clone();
                for model in self.models.values_mut() {
                    if model.backend == BackendKind::RemoteRpc {
                        model.location = url.clone();
                    }
                }
            }
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            if !dir.is_empty() {
                self.state_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(dir) = std::env::var(ENV_MODEL_DIR) {
            if !dir.is_empty() {
                let base = PathBuf::from(dir);
                for model in self.models.values_mut() {
                    if model.backend == BackendKind::LocalFile {
                        let loc = PathBuf::from(&model.location);
                        if loc.is_relative() {
                            model.location = base.join(loc).to_string_lossy().into_owned();
                        }
                    }
                }
            }
        }
    }

    /// Fill in the built-in catalog, propagate table keys into descriptor
    /// names, and validate ranges.
    fn finish(&mut self) -> Result<()> {
        if self.models.is_empty() {
            self.models = builtin_models();
        }
        for (key, model) in self.models.iter_mut() {
            if model.name.is_empty() {
                model.name = key.clone();
            } else if model.name != *key {
                return Err(MindgateError::ConfigInvalid(format!(
                    "model table key '{key}' disagrees with name '{}'",
                    model.name
                )));
            }
        }
        self.validate()
    }

    /// Range and cross-reference checks. Run by `load_from`; callers that
    /// mutate settings afterwards (e.g. `set`) should re-run it.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: String) -> Result<()> {
            Err(MindgateError::ConfigInvalid(msg))
        }

        if self.runtime.max_concurrent_models < 1 {
            return bad("runtime.max_concurrent_models must be >= 1".into());
        }
        if self.runtime.worker_threads < 1 {
            return bad("runtime.worker_threads must be >= 1".into());
        }
        if !(self.health.ewma_alpha > 0.0 && self.health.ewma_alpha <= 1.0) {
            return bad(format!(
                "health.ewma_alpha must be in (0, 1], got {}",
                self.health.ewma_alpha
            ));
        }
        for (label, v) in [
            ("cascade.tier1.min_confidence", self.cascade.tier1.min_confidence),
            ("cascade.tier2.min_confidence", self.cascade.tier2.min_confidence),
            ("router.code_threshold", self.router.code_threshold),
            ("router.web_threshold", self.router.web_threshold),
            ("router.alpha_cascade_threshold", self.router.alpha_cascade_threshold),
            ("refiner.convergence_threshold", self.refiner.convergence_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return bad(format!("{label} must be in [0, 1], got {v}"));
            }
        }
        if self.cascade.tier1.min_confidence < self.cascade.tier2.min_confidence {
            return bad("cascade.tier1.min_confidence must be >= tier2.min_confidence".into());
        }
        if self.cache.quant_levels == 0 || self.cache.quant_levels > 256 {
            return bad(format!(
                "cache.quant_levels must be in [1, 256], got {}",
                self.cache.quant_levels
            ));
        }
        for (tier, name) in [
            ("tier1", &self.cascade.tier1_model),
            ("tier2", &self.cascade.tier2_model),
            ("tier3", &self.cascade.tier3_model),
        ] {
            if !self.models.contains_key(name) {
                return bad(format!("cascade.{tier}_model '{name}' is not in the model catalog"));
            }
        }
        for model in self.models.values() {
            for fb in &model.fallback {
                if !self.models.contains_key(fb) {
                    return bad(format!(
                        "model '{}' falls back to unknown model '{fb}'",
                        model.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Get a setting value by dotted path (e.g. "memory.max_ram_bytes").
    pub fn get(&self, path: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;

        for part in path.split('.') {
            current = current.get(part)?;
        }

        match current {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Null => Some("null".to_string()),
            serde_json::Value::Array(arr) => Some(serde_json::to_string(arr).unwrap_or_default()),
            serde_json::Value::Object(obj) => Some(serde_json::to_string(obj).unwrap_or_default()),
        }
    }

    /// Set a setting value by dotted path.
    ///
    /// The target type is inferred from the existing value; returns an
    /// error when the path is unknown or the value does not parse.
    pub fn set(&mut self, path: &str, value: &str) -> std::result::Result<(), String> {
        let mut json = serde_json::to_value(&self)
            .map_err(|e| format!("failed to serialize settings: {e}"))?;

        let parts: Vec<&str> = path.split('.').collect();
        if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return Err(format!("invalid settings path '{path}'"));
        }

        // Navigate to the parent table and set the final key.
        let mut current = &mut json;
        for part in &parts[..parts.len() - 1] {
            current = current
                .get_mut(*part)
                .ok_or_else(|| format!("path not found: {path}"))?;
        }

        let final_key = parts.last().expect("parts checked non-empty");
        let obj = current
            .as_object_mut()
            .ok_or_else(|| format!("parent is not a table: {path}"))?;

        let new_value = match obj.get(*final_key) {
            Some(serde_json::Value::Bool(_)) => {
                let b = value
                    .parse::<bool>()
                    .map_err(|_| format!("expected boolean for {path}, got '{value}'"))?;
                serde_json::Value::Bool(b)
            }
            Some(serde_json::Value::Number(n)) => {
                if n.is_u64() {
                    let n = value
                        .parse::<u64>()
                        .map_err(|_| format!("expected integer for {path}, got '{value}'"))?;
                    serde_json::Value::Number(n.into())
                } else if n.is_i64() {
                    let n = value
                        .parse::<i64>()
                        .map_err(|_| format!("expected integer for {path}, got '{value}'"))?;
                    serde_json::Value::Number(n.into())
                } else {
                    let n = value
                        .parse::<f64>()
                        .map_err(|_| format!("expected number for {path}, got '{value}'"))?;
                    serde_json::Number::from_f64(n)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| format!("non-finite number for {path}"))?
                }
            }
            Some(serde_json::Value::Null) => {
                // Option<T>: parse as JSON when possible, else a string.
                serde_json::from_str(value)
                    .unwrap_or(serde_json::Value::String(value.to_string()))
            }
            Some(serde_json::Value::Array(_)) => serde_json::from_str(value)
                .map_err(|e| format!("invalid JSON array for {path}: {e}"))?,
            Some(serde_json::Value::Object(_)) => serde_json::from_str(value)
                .map_err(|e| format!("invalid JSON object for {path}: {e}"))?,
            Some(serde_json::Value::String(_)) => serde_json::Value::String(value.to_string()),
            None => return Err(format!("path not found: {path}")),
        };

        obj.insert((*final_key).to_string(), new_value);

        *self = serde_json::from_value(json)
            .map_err(|e| format!("failed to apply setting {path}: {e}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unknown-key detection
// ---------------------------------------------------------------------------

/// Alias spellings accepted in addition to the canonical field names.
static KEY_ALIASES: &[&str] = &[
    "ejecucion", "memoria", "cascada", "salud", "cache_semantica", "servidor",
    "refinador", "enrutador", "incrustaciones", "auditoria", "modelos",
    "directorio_estado", "motor", "max_modelos_concurrentes", "hilos_trabajo",
    "segundos_limite_carga", "ms_antirebote_precarga", "max_bytes_memoria",
    "segundos_ttl_inactivo", "usar_mmap", "bloquear_residente", "nivel1",
    "nivel2", "confianza_minima", "patrones_forzados", "modelo_nivel1",
    "modelo_nivel2", "modelo_nivel3", "segundos_aviso_oom", "alfa_ewma",
    "ms_periodo_muestreo", "muestras_minimas", "segundos_ttl_semantico",
    "niveles_cuantizacion", "capacidad", "anfitrion", "puerto", "activado",
    "max_iteraciones", "umbral_convergencia", "longitud_minima_consulta",
    "pesos_calidad", "umbral_codigo", "umbral_web", "longitud_minima_multimodal",
    "umbral_alfa_cascada", "modelo_vision", "modelo_codigo", "modelo_web",
    "modelo_multimodal", "modelo_audio", "modelo_empatico", "url_base_remota",
    "modelo", "ruta",
];

/// Collect the key names serde will recognise by round-tripping the default
/// document, then walk the raw file and warn on anything else. Matching is by
/// key name: the `[models]` table has free-form keys and is skipped.
fn warn_unknown_keys(raw: &toml::Value) {
    let known = known_key_names();
    let mut unknown = Vec::new();
    collect_unknown(raw, "", &known, &mut unknown);
    for key in unknown {
        tracing::warn!(key = %key, "ignoring unknown settings key");
    }
}

fn known_key_names() -> std::collections::BTreeSet<String> {
    let mut names: std::collections::BTreeSet<String> =
        KEY_ALIASES.iter().map(|s| s.to_string()).collect();
    // Canonical names, harvested from a serialized default document so the
    // list never drifts from the struct definitions. Optional fields get
    // placeholder values so their keys serialize too.
    let mut doc = Settings::default();
    doc.models = builtin_models();
    doc.state_dir = Some(PathBuf::from("state"));
    doc.audit.path = Some(PathBuf::from("audit.jsonl"));
    if let Ok(value) = toml::Value::try_from(&doc) {
        collect_key_names(&value, &mut names);
    }
    names
}

fn collect_key_names(value: &toml::Value, out: &mut std::collections::BTreeSet<String>) {
    if let toml::Value::Table(table) = value {
        for (key, val) in table {
            out.insert(key.clone());
            collect_key_names(val, out);
        }
    }
}

fn collect_unknown(
    value: &toml::Value,
    path: &str,
    known: &std::collections::BTreeSet<String>,
    out: &mut Vec<String>,
) {
    if let toml::Value::Table(table) = value {
        for (key, val) in table {
            let full = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
            // Model names under [models] are user-chosen.
            if path == "models" || path == "modelos" {
                collect_unknown(val, &full, known, out);
                continue;
            }
            if !known.contains(key) {
                out.push(full);
                continue;
            }
            collect_unknown(val, &full, known, out);
        }
    }
}
