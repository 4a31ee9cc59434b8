//! Model pool.
//!
//! Owns every model handle in the process. Models load on demand, are
//! shared across requests while resident, and leave through LRU or idle-TTL
//! eviction. Loads that fail walk a declarative per-name fallback chain.
//!
//! Entry state machine:
//!
//! ```text
//! Absent ──get──▶ Loading ──success──▶ Ready ──idle>TTL or LRU──▶ Evicting ──shutdown──▶ Absent
//!                     │
//!                     └──failure──▶ removed (failure is transient, retry allowed)
//! ```
//!
//! Concurrency rules: the pool mutex guards the entry map and admission
//! arithmetic only and is never held across I/O. Load completion is
//! published through a per-entry watch channel; evictions and releases wake
//! waiters through a pool-wide notifier.

pub mod backend;
pub mod prefetch;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, Semaphore, watch};

use crate::error::{MindgateError, Result};
use crate::metrics::Metrics;
use crate::request::ModelDescriptor;
use crate::settings::Settings;

pub use backend::{BackendRegistry, GenerationParams, ModelBackend, ModelHandle};

type LoadOutcome = std::result::Result<(), String>;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

enum EntryState {
    Loading { done: watch::Receiver<Option<LoadOutcome>> },
    Ready { handle: Arc<dyn ModelHandle> },
    Evicting,
}

impl EntryState {
    fn label(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Ready { .. } => "ready",
            Self::Evicting => "evicting",
        }
    }
}

struct Entry {
    descriptor: ModelDescriptor,
    state: EntryState,
    last_used_at: Instant,
    loaded_at: Option<Instant>,
    in_flight: usize,
}

impl Entry {
    fn is_resident(&self) -> bool {
        matches!(self.state, EntryState::Loading { .. } | EntryState::Ready { .. })
    }
}

struct Prefetched {
    descriptor: ModelDescriptor,
    handle: Arc<dyn ModelHandle>,
    loaded_at: Instant,
}

/// Recent eviction, kept for `stats()` and the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionRecord {
    pub name: String,
    pub reason: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

const EVICTION_HISTORY: usize = 16;

struct PoolInner {
    entries: HashMap<String, Entry>,
    prefetched: HashMap<String, Prefetched>,
    last_evictions: VecDeque<EvictionRecord>,
    /// Watch senders parked between inserting a Loading entry and the
    /// loader task picking them up.
    loader_senders: HashMap<String, watch::Sender<Option<LoadOutcome>>>,
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ResidentModel {
    pub name: String,
    pub state: String,
    pub ram_estimate_bytes: u64,
    pub in_flight: usize,
    pub idle_seconds: u64,
    /// Seconds since the handle became Ready; absent while loading.
    pub resident_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub resident: Vec<ResidentModel>,
    pub loading: Vec<String>,
    pub prefetched: Vec<String>,
    pub last_evictions: Vec<EvictionRecord>,
    pub ram_committed_bytes: u64,
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A borrowed ready handle. The caller must hand it back with
/// [`ModelPool::release`]; generation never happens while any pool lock is
/// held.
#[derive(Debug)]
pub struct ModelLease {
    name: String,
    handle: Arc<dyn ModelHandle>,
}

impl ModelLease {
    pub fn model_name(&self) -> &str {
        &self.name
    }

    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        self.handle.generate(prompt, params).await
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent_models: usize,
    pub max_ram_bytes: u64,
    pub load_deadline: Duration,
}

impl PoolConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent_models: settings.runtime.max_concurrent_models,
            max_ram_bytes: settings.memory.max_ram_bytes,
            load_deadline: Duration::from_secs(settings.runtime.load_deadline_seconds),
        }
    }
}

enum Plan {
    Ready(Arc<dyn ModelHandle>),
    JoinLoad(watch::Receiver<Option<LoadOutcome>>),
    WaitChange,
    Evict(Vec<(String, Arc<dyn ModelHandle>)>),
    DropPrefetched(Vec<(String, Arc<dyn ModelHandle>)>),
    StartLoad(ModelDescriptor),
}

pub struct ModelPool {
    inner: Mutex<PoolInner>,
    catalog: HashMap<String, ModelDescriptor>,
    registry: BackendRegistry,
    config: PoolConfig,
    metrics: Arc<Metrics>,
    changed: Notify,
    /// Prefetch loads take a permit here so they never starve an
    /// interactive `get`.
    prefetch_limit: Semaphore,
}

impl ModelPool {
    pub fn new(
        catalog: HashMap<String, ModelDescriptor>,
        registry: BackendRegistry,
        config: PoolConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                prefetched: HashMap::new(),
                last_evictions: VecDeque::new(),
                loader_senders: HashMap::new(),
            }),
            catalog,
            registry,
            config,
            metrics,
            changed: Notify::new(),
            prefetch_limit: Semaphore::new(1),
        })
    }

    pub fn from_settings(settings: &Settings, metrics: Arc<Metrics>) -> Arc<Self> {
        let catalog = settings.models.clone().into_iter().collect();
        Self::new(
            catalog,
            BackendRegistry::with_defaults(&settings.memory),
            PoolConfig::from_settings(settings),
            metrics,
        )
    }

    /// Return a ready handle for `name`, loading it if needed. Blocks at
    /// most the configured load deadline; a load failure walks the fallback
    /// chain before giving up.
    pub async fn get(self: &Arc<Self>, name: &str) -> Result<ModelLease> {
        self.get_with_deadline(name, self.config.load_deadline).await
    }

    /// `get` under a caller-supplied deadline. The pool-wide load deadline
    /// still applies; the tighter of the two wins.
    pub async fn get_with_deadline(
        self: &Arc<Self>,
        name: &str,
        deadline: Duration,
    ) -> Result<ModelLease> {
        let deadline = deadline.min(self.config.load_deadline);
        match tokio::time::timeout(deadline, self.get_unbounded(name)).await {
            Ok(result) => result,
            Err(_) => Err(MindgateError::Timeout(deadline)),
        }
    }

    async fn get_unbounded(self: &Arc<Self>, name: &str) -> Result<ModelLease> {
        let chain = self.fallback_chain(name)?;
        let mut last_reason = String::new();

        for link in &chain {
            match self.acquire(link).await {
                Ok(lease) => {
                    if link != name {
                        self.metrics.record_fallback(name, link);
                        tracing::warn!(requested = name, served = %link, "request served via fallback");
                    }
                    return Ok(lease);
                }
                Err(MindgateError::BackendLoadFailed { name: failed, reason }) => {
                    tracing::warn!(model = %failed, reason = %reason, "model load failed");
                    last_reason = reason;
                }
                Err(other) => return Err(other),
            }
        }

        tracing::error!(model = name, reason = %last_reason, "fallback chain exhausted");
        Err(MindgateError::ModelUnavailable(name.to_string()))
    }

    /// `[name]` followed by its declared fallbacks. One level per link: a
    /// link's own chain is not expanded.
    fn fallback_chain(&self, name: &str) -> Result<Vec<String>> {
        let descriptor = self
            .catalog
            .get(name)
            .ok_or_else(|| MindgateError::ModelUnavailable(name.to_string()))?;
        let mut chain = vec![name.to_string()];
        for fb in &descriptor.fallback {
            if !chain.contains(fb) && self.catalog.contains_key(fb) {
                chain.push(fb.clone());
            }
        }
        Ok(chain)
    }

    /// Single-name admission. Loops until the entry is Ready, joining an
    /// in-flight loader or performing evictions as the map dictates.
    async fn acquire(self: &Arc<Self>, name: &str) -> Result<ModelLease> {
        loop {
            let plan = self.plan_acquire(name)?;
            match plan {
                Plan::Ready(handle) => {
                    return Ok(ModelLease { name: name.to_string(), handle });
                }
                Plan::JoinLoad(mut done) => {
                    let outcome = loop {
                        if let Some(outcome) = done.borrow().clone() {
                            break Some(outcome);
                        }
                        if done.changed().await.is_err() {
                            break None;
                        }
                    };
                    match outcome {
                        Some(Ok(())) | None => continue,
                        Some(Err(reason)) => {
                            return Err(MindgateError::BackendLoadFailed {
                                name: name.to_string(),
                                reason,
                            });
                        }
                    }
                }
                Plan::WaitChange => {
                    // Bounded wait: a notification between planning and
                    // parking would otherwise be missed.
                    let _ = tokio::time::timeout(
                        Duration::from_millis(50),
                        self.changed.notified(),
                    )
                    .await;
                }
                Plan::Evict(victims) => {
                    self.run_evictions(victims, "admission").await;
                }
                Plan::DropPrefetched(stale) => {
                    for (dropped, handle) in stale {
                        tracing::debug!(model = %dropped, "dropping prefetched handle for budget");
                        handle.shutdown().await;
                    }
                    self.changed.notify_waiters();
                }
                Plan::StartLoad(descriptor) => {
                    self.spawn_loader(descriptor);
                }
            }
        }
    }

    /// One bookkeeping step under the pool lock. Never awaits.
    fn plan_acquire(&self, name: &str) -> Result<Plan> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(entry) = inner.entries.get_mut(name) {
            return Ok(match &entry.state {
                EntryState::Ready { handle } => {
                    entry.last_used_at = Instant::now();
                    entry.in_flight += 1;
                    Plan::Ready(handle.clone())
                }
                EntryState::Loading { done } => Plan::JoinLoad(done.clone()),
                EntryState::Evicting => Plan::WaitChange,
            });
        }

        let descriptor = match inner.prefetched.get(name) {
            Some(pf) => pf.descriptor.clone(),
            None => self
                .catalog
                .get(name)
                .ok_or_else(|| MindgateError::ModelUnavailable(name.to_string()))?
                .clone(),
        };

        if descriptor.ram_estimate_bytes > self.config.max_ram_bytes {
            return Err(MindgateError::BackendLoadFailed {
                name: name.to_string(),
                reason: format!(
                    "ram estimate {} exceeds cap {}",
                    descriptor.ram_estimate_bytes, self.config.max_ram_bytes
                ),
            });
        }

        match self.plan_admission(&mut inner, &descriptor)? {
            Some(plan) => Ok(plan),
            None => {
                // Budget fits. Promote a prefetched handle or start a loader.
                if let Some(pf) = inner.prefetched.remove(name) {
                    let handle = pf.handle.clone();
                    inner.entries.insert(
                        name.to_string(),
                        Entry {
                            descriptor: pf.descriptor,
                            state: EntryState::Ready { handle: pf.handle },
                            last_used_at: Instant::now(),
                            loaded_at: Some(pf.loaded_at),
                            in_flight: 1,
                        },
                    );
                    tracing::debug!(model = name, "prefetched model promoted");
                    Ok(Plan::Ready(handle))
                } else {
                    let (tx, rx) = watch::channel(None);
                    inner.entries.insert(
                        name.to_string(),
                        Entry {
                            descriptor: descriptor.clone(),
                            state: EntryState::Loading { done: rx },
                            last_used_at: Instant::now(),
                            loaded_at: None,
                            in_flight: 0,
                        },
                    );
                    // The sender travels to the loader task via the plan.
                    inner.loader_senders.insert(name.to_string(), tx);
                    Ok(Plan::StartLoad(descriptor))
                }
            }
        }
    }

    /// Admission arithmetic for adding `descriptor` to the resident set.
    /// Returns `None` when it fits as-is, or a plan that makes progress.
    /// Victims are marked Evicting under the lock so racing planners never
    /// double-select them.
    fn plan_admission(
        &self,
        inner: &mut PoolInner,
        descriptor: &ModelDescriptor,
    ) -> Result<Option<Plan>> {
        // Swap group: at most one member resident. A loading or busy member
        // forces a wait; an idle Ready member is force-evicted first.
        if let Some(group) = &descriptor.swap_group {
            let conflict = inner
                .entries
                .iter()
                .find(|(other, e)| {
                    *other != &descriptor.name
                        && e.is_resident()
                        && e.descriptor.swap_group.as_deref() == Some(group.as_str())
                })
                .map(|(other, _)| other.clone());
            if let Some(other) = conflict {
                let entry = inner.entries.get_mut(&other).expect("entry just found");
                return Ok(Some(match &entry.state {
                    EntryState::Ready { handle } if entry.in_flight == 0 => {
                        let handle = handle.clone();
                        entry.state = EntryState::Evicting;
                        tracing::info!(
                            evicting = %other,
                            loading = %descriptor.name,
                            group = %group,
                            "swap group member force-evicted"
                        );
                        Plan::Evict(vec![(other, handle)])
                    }
                    // Busy or still loading: wait for it to drain.
                    _ => Plan::WaitChange,
                }));
            }
            // Prefetched swap partners just get dropped.
            let stale: Vec<String> = inner
                .prefetched
                .iter()
                .filter(|(other, pf)| {
                    *other != &descriptor.name
                        && pf.descriptor.swap_group.as_deref() == Some(group.as_str())
                })
                .map(|(other, _)| other.clone())
                .collect();
            if !stale.is_empty() {
                let dropped = stale
                    .into_iter()
                    .filter_map(|other| {
                        inner.prefetched.remove(&other).map(|pf| (other, pf.handle))
                    })
                    .collect();
                return Ok(Some(Plan::DropPrefetched(dropped)));
            }
        }

        let over_budget = |inner: &PoolInner| {
            let resident: Vec<&Entry> =
                inner.entries.values().filter(|e| e.is_resident()).collect();
            let count = resident.len() + 1;
            let ram: u64 = resident
                .iter()
                .map(|e| e.descriptor.ram_estimate_bytes)
                .chain(inner.prefetched.values().map(|p| p.descriptor.ram_estimate_bytes))
                .sum::<u64>()
                + descriptor.ram_estimate_bytes;
            count > self.config.max_concurrent_models || ram > self.config.max_ram_bytes
        };

        if !over_budget(inner) {
            return Ok(None);
        }

        // Cheapest relief first: drop prefetched handles that are not the
        // one being promoted.
        let stale: Vec<String> = inner
            .prefetched
            .keys()
            .filter(|other| *other != &descriptor.name)
            .cloned()
            .collect();
        if !stale.is_empty() {
            let dropped = stale
                .into_iter()
                .filter_map(|other| inner.prefetched.remove(&other).map(|pf| (other, pf.handle)))
                .collect();
            return Ok(Some(Plan::DropPrefetched(dropped)));
        }

        // LRU eviction: idle Ready entries, oldest last_used_at first.
        // Entries with in-flight work are pinned.
        let mut victims = Vec::new();
        while over_budget(inner) {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| {
                    matches!(e.state, EntryState::Ready { .. }) && e.in_flight == 0
                })
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(victim, _)| victim.clone());
            match victim {
                Some(victim) => {
                    let entry = inner.entries.get_mut(&victim).expect("victim just found");
                    if let EntryState::Ready { handle } = &entry.state {
                        victims.push((victim.clone(), handle.clone()));
                    }
                    entry.state = EntryState::Evicting;
                }
                None => break,
            }
        }

        if victims.is_empty() {
            // Everything resident is loading or pinned; wait for a release.
            Ok(Some(Plan::WaitChange))
        } else {
            Ok(Some(Plan::Evict(victims)))
        }
    }

    /// Run `shutdown()` on each victim outside the lock, then remove it.
    async fn run_evictions(&self, victims: Vec<(String, Arc<dyn ModelHandle>)>, reason: &str) {
        for (name, handle) in victims {
            handle.shutdown().await;
            {
                let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.entries.remove(&name);
                inner.last_evictions.push_back(EvictionRecord {
                    name: name.clone(),
                    reason: reason.to_string(),
                    at: chrono::Utc::now(),
                });
                while inner.last_evictions.len() > EVICTION_HISTORY {
                    inner.last_evictions.pop_front();
                }
            }
            tracing::info!(model = %name, reason, "model evicted");
        }
        self.changed.notify_waiters();
    }

    /// Spawn the single loader task for an entry just inserted as Loading.
    /// The task owns the watch sender and survives caller cancellation: a
    /// load that succeeds after its requester gave up still becomes Ready
    /// for future reuse.
    fn spawn_loader(self: &Arc<Self>, descriptor: ModelDescriptor) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let name = descriptor.name.clone();
            let tx = {
                let mut inner = pool.inner.lock().unwrap_or_else(|p| p.into_inner());
                match inner.loader_senders.remove(&name) {
                    Some(tx) => tx,
                    None => return,
                }
            };

            let started = Instant::now();
            let outcome = match pool.registry.get(descriptor.backend) {
                Ok(backend) => backend.load(&descriptor).await,
                Err(e) => Err(e),
            };

            let mut inner = pool.inner.lock().unwrap_or_else(|p| p.into_inner());
            match outcome {
                Ok(handle) => {
                    if let Some(entry) = inner.entries.get_mut(&name) {
                        entry.state = EntryState::Ready { handle };
                        entry.loaded_at = Some(Instant::now());
                        entry.last_used_at = Instant::now();
                        tracing::info!(
                            model = %name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "model ready"
                        );
                    }
                    drop(inner);
                    let _ = tx.send(Some(Ok(())));
                }
                Err(e) => {
                    // Failed is transient: the entry leaves the map at once
                    // so a later get may retry from Absent.
                    inner.entries.remove(&name);
                    drop(inner);
                    let _ = tx.send(Some(Err(e.to_string())));
                }
            }
            pool.changed.notify_waiters();
        });
    }

    /// Decrement the in-flight count and refresh recency; wakes admission
    /// waiters because a drained entry may now be evictable.
    pub fn release(&self, name: &str) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = inner.entries.get_mut(name) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.last_used_at = Instant::now();
            }
        }
        self.changed.notify_waiters();
    }

    /// Fire-and-forget load hint. The handle lands in a side map and is
    /// promoted into the resident set by the next `get`. Best effort: a
    /// hint that does not fit the budget is dropped, never queued.
    pub fn prefetch(self: &Arc<Self>, name: &str) {
        let pool = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.prefetch_load(&name).await {
                tracing::debug!(model = %name, error = %e, "prefetch skipped");
            }
        });
    }

    async fn prefetch_load(&self, name: &str) -> Result<()> {
        let descriptor = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.entries.contains_key(name) || inner.prefetched.contains_key(name) {
                return Ok(());
            }
            let descriptor = self
                .catalog
                .get(name)
                .ok_or_else(|| MindgateError::ModelUnavailable(name.to_string()))?
                .clone();
            if !self.prefetch_fits(&inner, &descriptor) {
                return Err(MindgateError::BackendLoadFailed {
                    name: name.to_string(),
                    reason: "prefetch would exceed budget".into(),
                });
            }
            descriptor
        };

        // Reduced parallelism: a single permit keeps prefetch loads from
        // competing with interactive gets for CPU.
        let _permit = self
            .prefetch_limit
            .acquire()
            .await
            .map_err(|_| MindgateError::Cancelled)?;

        let backend = self.registry.get(descriptor.backend)?;
        let handle = backend.load(&descriptor).await?;

        let leftover = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.entries.contains_key(name) || !self.prefetch_fits(&inner, &descriptor) {
                Some(handle)
            } else {
                tracing::debug!(model = name, "model prefetched");
                inner.prefetched.insert(
                    name.to_string(),
                    Prefetched { descriptor, handle, loaded_at: Instant::now() },
                );
                None
            }
        };
        if let Some(handle) = leftover {
            handle.shutdown().await;
        }
        Ok(())
    }

    fn prefetch_fits(&self, inner: &PoolInner, descriptor: &ModelDescriptor) -> bool {
        if let Some(group) = &descriptor.swap_group {
            let conflict = inner.entries.values().any(|e| {
                e.is_resident()
                    && e.descriptor.name != descriptor.name
                    && e.descriptor.swap_group.as_deref() == Some(group.as_str())
            });
            if conflict {
                return false;
            }
        }
        let resident = inner.entries.values().filter(|e| e.is_resident()).count()
            + inner.prefetched.len()
            + 1;
        let ram: u64 = inner
            .entries
            .values()
            .filter(|e| e.is_resident())
            .map(|e| e.descriptor.ram_estimate_bytes)
            .chain(inner.prefetched.values().map(|p| p.descriptor.ram_estimate_bytes))
            .sum::<u64>()
            + descriptor.ram_estimate_bytes;
        resident <= self.config.max_concurrent_models && ram <= self.config.max_ram_bytes
    }

    /// Evict Ready entries idle past their TTL and expire stale prefetched
    /// handles. Entries with in-flight work are never touched.
    pub async fn sweep_idle(&self) {
        let (victims, stale) = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let mut victims = Vec::new();
            for (name, entry) in inner.entries.iter_mut() {
                let ttl = Duration::from_secs(entry.descriptor.idle_ttl_seconds);
                if entry.in_flight == 0
                    && entry.last_used_at.elapsed() > ttl
                    && matches!(entry.state, EntryState::Ready { .. })
                {
                    if let EntryState::Ready { handle } = &entry.state {
                        victims.push((name.clone(), handle.clone()));
                    }
                    entry.state = EntryState::Evicting;
                }
            }
            let expired: Vec<String> = inner
                .prefetched
                .iter()
                .filter(|(_, pf)| {
                    pf.loaded_at.elapsed()
                        > Duration::from_secs(pf.descriptor.idle_ttl_seconds)
                })
                .map(|(name, _)| name.clone())
                .collect();
            let stale: Vec<Arc<dyn ModelHandle>> = expired
                .into_iter()
                .filter_map(|name| inner.prefetched.remove(&name).map(|pf| pf.handle))
                .collect();
            (victims, stale)
        };
        for handle in stale {
            handle.shutdown().await;
        }
        self.run_evictions(victims, "idle-ttl").await;
    }

    /// Background TTL sweeper; exits when the shutdown signal flips.
    pub async fn run_ttl_sweeper(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => self.sweep_idle().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Snapshot for `/health` and `stats` consumers.
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut resident = Vec::new();
        let mut loading = Vec::new();
        let mut ram = 0u64;
        for (name, entry) in &inner.entries {
            match &entry.state {
                EntryState::Loading { .. } => loading.push(name.clone()),
                EntryState::Ready { .. } => ram += entry.descriptor.ram_estimate_bytes,
                EntryState::Evicting => {}
            }
            resident.push(ResidentModel {
                name: name.clone(),
                state: entry.state.label().to_string(),
                ram_estimate_bytes: entry.descriptor.ram_estimate_bytes,
                in_flight: entry.in_flight,
                idle_seconds: entry.last_used_at.elapsed().as_secs(),
                resident_seconds: entry.loaded_at.map(|t| t.elapsed().as_secs()),
            });
        }
        resident.sort_by(|a, b| a.name.cmp(&b.name));
        PoolStats {
            resident,
            loading,
            prefetched: inner.prefetched.keys().cloned().collect(),
            last_evictions: inner.last_evictions.iter().cloned().collect(),
            ram_committed_bytes: ram,
        }
    }

    /// Drain in-flight work, then shut every handle down.
    pub async fn shutdown(&self) {
        let drain_deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let busy = {
                let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.entries.values().any(|e| e.in_flight > 0)
            };
            if !busy || Instant::now() > drain_deadline {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_millis(200), self.changed.notified()).await;
        }

        let handles: Vec<Arc<dyn ModelHandle>> = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let mut handles: Vec<Arc<dyn ModelHandle>> = inner
                .entries
                .drain()
                .filter_map(|(_, e)| match e.state {
                    EntryState::Ready { handle } => Some(handle),
                    _ => None,
                })
                .collect();
            handles.extend(inner.prefetched.drain().map(|(_, pf)| pf.handle));
            handles
        };
        futures::future::join_all(handles.iter().map(|h| h.shutdown())).await;
        tracing::info!(count = handles.len(), "model pool drained");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::request::BackendKind;

    struct MockHandle {
        name: String,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelHandle for MockHandle {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
            Ok(format!("[{}] {prompt}", self.name))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockBackend {
        loads: Mutex<HashMap<String, usize>>,
        failing: Mutex<HashSet<String>>,
        delay: Duration,
        shutdowns: Arc<AtomicUsize>,
    }

    impl MockBackend {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                delay,
                shutdowns: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn fail(&self, name: &str) {
            self.failing.lock().unwrap().insert(name.to_string());
        }

        fn loads_of(&self, name: &str) -> usize {
            self.loads.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ModelBackend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::LocalFile
        }

        async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelHandle>> {
            tokio::time::sleep(self.delay).await;
            *self
                .loads
                .lock()
                .unwrap()
                .entry(descriptor.name.clone())
                .or_insert(0) += 1;
            if self.failing.lock().unwrap().contains(&descriptor.name) {
                return Err(MindgateError::BackendLoadFailed {
                    name: descriptor.name.clone(),
                    reason: "mock failure".into(),
                });
            }
            Ok(Arc::new(MockHandle {
                name: descriptor.name.clone(),
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    fn descriptor(name: &str, ram: u64, group: Option<&str>, fallback: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            backend: BackendKind::LocalFile,
            location: format!("{name}.gguf"),
            context_window: 4096,
            quantization: None,
            load_secs_estimate: 0.1,
            idle_ttl_seconds: 3600,
            ram_estimate_bytes: ram,
            swap_group: group.map(str::to_string),
            fallback: fallback.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn pool_with(
        models: Vec<ModelDescriptor>,
        max_models: usize,
        max_ram: u64,
        backend: Arc<MockBackend>,
    ) -> Arc<ModelPool> {
        let catalog: HashMap<String, ModelDescriptor> =
            models.into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        ModelPool::new(
            catalog,
            registry,
            PoolConfig {
                max_concurrent_models: max_models,
                max_ram_bytes: max_ram,
                load_deadline: Duration::from_secs(5),
            },
            Arc::new(Metrics::new()),
        )
    }

    fn ready_names(pool: &ModelPool) -> Vec<String> {
        pool.stats()
            .resident
            .into_iter()
            .filter(|m| m.state == "ready")
            .map(|m| m.name)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_loads_once_and_reuses() {
        let backend = MockBackend::new(Duration::from_millis(5));
        let pool = pool_with(
            vec![descriptor("tiny", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        let lease = pool.get("tiny").await.unwrap();
        let text = lease.generate("hello", &GenerationParams::default()).await.unwrap();
        assert!(text.contains("hello"));
        pool.release("tiny");

        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());
        assert_eq!(backend.loads_of("tiny"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_gets_share_one_loader() {
        let backend = MockBackend::new(Duration::from_millis(50));
        let pool = pool_with(
            vec![descriptor("tiny", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let lease = pool.get("tiny").await.unwrap();
                pool.release(lease.model_name());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(backend.loads_of("tiny"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resident_count_and_ram_stay_bounded() {
        let backend = MockBackend::new(Duration::from_millis(2));
        let models = vec![
            descriptor("a", 2, None, &[]),
            descriptor("b", 2, None, &[]),
            descriptor("c", 2, None, &[]),
            descriptor("d", 2, None, &[]),
        ];
        let pool = pool_with(models, 2, 5, Arc::clone(&backend));

        for name in ["a", "b", "c", "d", "a", "c"] {
            let lease = pool.get(name).await.unwrap();
            pool.release(lease.model_name());

            let stats = pool.stats();
            let ready: Vec<_> =
                stats.resident.iter().filter(|m| m.state == "ready").collect();
            assert!(ready.len() <= 2, "resident {ready:?}");
            let ram: u64 = ready.iter().map(|m| m.ram_estimate_bytes).sum();
            assert!(ram <= 5, "ram {ram}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lru_evicts_oldest_idle_entry() {
        let backend = MockBackend::new(Duration::from_millis(2));
        let pool = pool_with(
            vec![descriptor("a", 2, None, &[]), descriptor("b", 2, None, &[])],
            2,
            3,
            Arc::clone(&backend),
        );

        let lease = pool.get("a").await.unwrap();
        pool.release(lease.model_name());
        let lease = pool.get("b").await.unwrap();
        pool.release(lease.model_name());

        let ready = ready_names(&pool);
        assert_eq!(ready, vec!["b".to_string()]);
        assert!(backend.shutdowns.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_entries_are_pinned() {
        let backend = MockBackend::new(Duration::from_millis(2));
        let catalog = vec![descriptor("a", 2, None, &[]), descriptor("b", 2, None, &[])];
        let catalog_map: HashMap<String, ModelDescriptor> =
            catalog.into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut registry = BackendRegistry::new();
        registry.register(Arc::clone(&backend) as Arc<dyn ModelBackend>);
        let pool = ModelPool::new(
            catalog_map,
            registry,
            PoolConfig {
                max_concurrent_models: 2,
                max_ram_bytes: 3,
                load_deadline: Duration::from_millis(300),
            },
            Arc::new(Metrics::new()),
        );

        // Hold "a" in flight; "b" cannot evict it and times out.
        let _held = pool.get("a").await.unwrap();
        let err = pool.get("b").await.unwrap_err();
        assert!(matches!(err, MindgateError::Timeout(_)));
        assert_eq!(ready_names(&pool), vec!["a".to_string()]);

        // Released, "a" becomes the LRU victim and "b" loads.
        pool.release("a");
        let lease = pool.get("b").await.unwrap();
        pool.release(lease.model_name());
        assert_eq!(ready_names(&pool), vec!["b".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn caller_deadline_tighter_than_pool_default_wins() {
        let backend = MockBackend::new(Duration::from_millis(200));
        let pool = pool_with(
            vec![descriptor("tiny", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        let err = pool
            .get_with_deadline("tiny", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MindgateError::Timeout(d) if d == Duration::from_millis(20)));

        // The abandoned load still completes and is reused later.
        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());
        assert_eq!(backend.loads_of("tiny"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn swap_group_members_are_never_coresident() {
        let backend = MockBackend::new(Duration::from_millis(5));
        let pool = pool_with(
            vec![
                descriptor("tiny", 1, Some("compact"), &[]),
                descriptor("vision", 2, Some("compact"), &[]),
            ],
            4,
            100,
            Arc::clone(&backend),
        );

        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());

        let lease = pool.get("vision").await.unwrap();
        pool.release(lease.model_name());

        let ready = ready_names(&pool);
        assert_eq!(ready, vec!["vision".to_string()], "tiny must be force-evicted");

        // And back again.
        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());
        assert_eq!(ready_names(&pool), vec!["tiny".to_string()]);
        assert_eq!(backend.loads_of("tiny"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_failure_walks_fallback_chain() {
        let backend = MockBackend::new(Duration::from_millis(2));
        backend.fail("expert_long");
        let pool = pool_with(
            vec![
                descriptor("expert_long", 4, None, &["expert_short", "tiny"]),
                descriptor("expert_short", 2, None, &["tiny"]),
                descriptor("tiny", 1, None, &[]),
            ],
            2,
            10,
            Arc::clone(&backend),
        );

        let lease = pool.get("expert_long").await.unwrap();
        assert_eq!(lease.model_name(), "expert_short");
        pool.release(lease.model_name());
        assert_eq!(backend.loads_of("expert_long"), 1);
        assert_eq!(backend.loads_of("expert_short"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exhausted_chain_is_model_unavailable() {
        let backend = MockBackend::new(Duration::from_millis(2));
        backend.fail("expert_long");
        backend.fail("expert_short");
        backend.fail("tiny");
        let pool = pool_with(
            vec![
                descriptor("expert_long", 4, None, &["expert_short", "tiny"]),
                descriptor("expert_short", 2, None, &["tiny"]),
                descriptor("tiny", 1, None, &[]),
            ],
            2,
            10,
            Arc::clone(&backend),
        );

        let err = pool.get("expert_long").await.unwrap_err();
        assert!(matches!(err, MindgateError::ModelUnavailable(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_load_does_not_prevent_retry() {
        let backend = MockBackend::new(Duration::from_millis(2));
        backend.fail("tiny");
        let pool = pool_with(
            vec![descriptor("tiny", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        assert!(pool.get("tiny").await.is_err());

        // Transient: clearing the fault allows a fresh load from Absent.
        backend.failing.lock().unwrap().clear();
        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());
        assert_eq!(backend.loads_of("tiny"), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_ttl_sweep_evicts() {
        let backend = MockBackend::new(Duration::from_millis(2));
        let mut d = descriptor("tiny", 1, None, &[]);
        d.idle_ttl_seconds = 0;
        let pool = pool_with(vec![d], 2, 10, Arc::clone(&backend));

        let lease = pool.get("tiny").await.unwrap();
        pool.release(lease.model_name());
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.sweep_idle().await;
        assert!(ready_names(&pool).is_empty());
        let stats = pool.stats();
        assert_eq!(stats.last_evictions.len(), 1);
        assert_eq!(stats.last_evictions[0].reason, "idle-ttl");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn prefetch_promotes_without_second_load() {
        let backend = MockBackend::new(Duration::from_millis(5));
        let pool = pool_with(
            vec![descriptor("code", 2, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        pool.prefetch("code");
        // Wait for the side map to fill.
        for _ in 0..100 {
            if !pool.stats().prefetched.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.stats().prefetched, vec!["code".to_string()]);

        let lease = pool.get("code").await.unwrap();
        assert_eq!(lease.model_name(), "code");
        pool.release(lease.model_name());
        assert_eq!(backend.loads_of("code"), 1, "promotion must not reload");
        assert!(pool.stats().prefetched.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stats_reports_loading_entries() {
        let backend = MockBackend::new(Duration::from_millis(80));
        let pool = pool_with(
            vec![descriptor("tiny", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        let getter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.get("tiny").await.unwrap();
                pool.release(lease.model_name());
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.stats().loading, vec!["tiny".to_string()]);
        getter.await.unwrap();
        assert_eq!(ready_names(&pool), vec!["tiny".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_drains_all_handles() {
        let backend = MockBackend::new(Duration::from_millis(2));
        let pool = pool_with(
            vec![descriptor("a", 1, None, &[]), descriptor("b", 1, None, &[])],
            2,
            10,
            Arc::clone(&backend),
        );

        for name in ["a", "b"] {
            let lease = pool.get(name).await.unwrap();
            pool.release(lease.model_name());
        }
        pool.shutdown().await;
        assert!(pool.stats().resident.is_empty());
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 2);
    }
}
