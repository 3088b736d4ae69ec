//! Discovery, lazy startup, sharing, and idle shutdown of capability providers.

use crate::cache::{CacheArea, StateCache};
use crate::capability::descriptor::{load_manifest, ProviderDescriptor, ProviderSource};
use crate::capability::provider::{Capability, CapabilityRequest, ProcessLauncher, ProviderLauncher};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, instrument, warn};

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Discovered,
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderState::Discovered => "discovered",
            ProviderState::Starting => "starting",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
            ProviderState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Read-only view of one provider for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub descriptor: ProviderDescriptor,
    pub state: ProviderState,
    pub refcount: usize,
    pub failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub invalid: Vec<String>,
}

/// A provider acquired for use. Hand it back with [`CapabilityRegistry::release`].
#[derive(Clone)]
pub struct ProviderHandle {
    pub provider_id: String,
    capability: Arc<dyn Capability>,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle").field("provider_id", &self.provider_id).finish()
    }
}

impl ProviderHandle {
    pub async fn respond(&self, request: CapabilityRequest) -> AppResult<String> {
        self.capability.respond(request).await
    }
}

struct ProviderEntry {
    descriptor: ProviderDescriptor,
    launcher: Arc<dyn ProviderLauncher>,
    state: ProviderState,
    instance: Option<Arc<dyn Capability>>,
    refcount: usize,
    idle_since: Option<Instant>,
    failures: u32,
    cooldown_until: Option<Instant>,
}

impl ProviderEntry {
    fn new(descriptor: ProviderDescriptor, launcher: Arc<dyn ProviderLauncher>) -> Self {
        Self {
            descriptor,
            launcher,
            state: ProviderState::Discovered,
            instance: None,
            refcount: 0,
            idle_since: None,
            failures: 0,
            cooldown_until: None,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.state == ProviderState::Degraded && self.cooldown_until.map_or(false, |t| Instant::now() < t)
    }

    fn info(&self) -> ProviderInfo {
        let cooldown_remaining_ms = if self.in_cooldown() {
            self.cooldown_until
                .map(|t| t.saturating_duration_since(Instant::now()).as_millis() as u64)
        } else {
            None
        };
        ProviderInfo {
            descriptor: self.descriptor.clone(),
            state: self.state,
            refcount: self.refcount,
            failures: self.failures,
            cooldown_remaining_ms,
        }
    }

    fn acquire_ready(&mut self) -> Option<ProviderHandle> {
        if self.state != ProviderState::Ready {
            return None;
        }
        let capability = self.instance.clone()?;
        self.refcount += 1;
        self.idle_since = None;
        Some(ProviderHandle {
            provider_id: self.descriptor.id.clone(),
            capability,
        })
    }

    /// Detaches the running instance. The caller shuts it down after dropping the lock.
    fn retire(&mut self, state: ProviderState) -> Option<Arc<dyn Capability>> {
        self.state = state;
        self.idle_since = None;
        self.instance.take()
    }
}

/// Entry locks are only held for bookkeeping, never across a launch or shutdown.
/// `startup` admits one launch per provider at a time.
struct ProviderSlot {
    seq: u64,
    entry: TokioMutex<ProviderEntry>,
    startup: TokioMutex<()>,
}

pub struct CapabilityRegistry {
    config: Arc<Config>,
    providers: StdRwLock<HashMap<String, Arc<ProviderSlot>>>,
    next_seq: AtomicU64,
    process_launcher: Arc<dyn ProviderLauncher>,
    cache: Option<StateCache>,
    shutting_down: AtomicBool,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry").finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    pub fn new(config: Arc<Config>, cache: Option<StateCache>) -> Self {
        Self::with_process_launcher(config, cache, Arc::new(ProcessLauncher))
    }

    /// Like [`new`](Self::new) with a custom launcher for manifest providers.
    pub fn with_process_launcher(
        config: Arc<Config>,
        cache: Option<StateCache>,
        process_launcher: Arc<dyn ProviderLauncher>,
    ) -> Self {
        Self {
            config,
            providers: StdRwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            process_launcher,
            cache,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> Vec<Arc<ProviderSlot>> {
        let mut slots: Vec<Arc<ProviderSlot>> = match self.providers.read() {
            Ok(providers) => providers.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        slots.sort_by_key(|slot| slot.seq);
        slots
    }

    fn slot(&self, id: &str) -> Option<Arc<ProviderSlot>> {
        match self.providers.read() {
            Ok(providers) => providers.get(id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(id).cloned(),
        }
    }

    fn insert(&self, descriptor: ProviderDescriptor, launcher: Arc<dyn ProviderLauncher>) -> AppResult<()> {
        let mut providers = self
            .providers
            .write()
            .map_err(|e| AppError::ProcessFault(format!("provider table lock poisoned: {}", e)))?;
        if providers.contains_key(&descriptor.id) {
            return Err(AppError::InvalidState(format!("provider '{}' is already registered", descriptor.id)));
        }
        let slot = Arc::new(ProviderSlot {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            entry: TokioMutex::new(ProviderEntry::new(descriptor.clone(), launcher)),
            startup: TokioMutex::new(()),
        });
        providers.insert(descriptor.id, slot);
        Ok(())
    }

    /// Registers an in-process provider.
    pub fn register(&self, descriptor: ProviderDescriptor, launcher: Arc<dyn ProviderLauncher>) -> AppResult<()> {
        descriptor.validate()?;
        info!(provider = %descriptor.id, supports = ?descriptor.supports, "Registering provider");
        self.insert(descriptor, launcher)
    }

    /// Scans the configured provider directories for `*.json` manifests. Known
    /// providers keep their runtime state; manifests that disappeared are forgotten
    /// unless the provider is in use.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut found: Vec<(PathBuf, ProviderDescriptor)> = Vec::new();

        for dir in &self.config.provider_dirs {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Provider directory not readable");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let parsed = match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => load_manifest(&path, &contents),
                    Err(e) => Err(AppError::Io(e)),
                };
                match parsed {
                    Ok(descriptor) => found.push((path, descriptor)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping invalid provider manifest");
                        report.invalid.push(path.display().to_string());
                    }
                }
            }
        }
        found.sort_by(|(pa, a), (pb, b)| a.id.cmp(&b.id).then_with(|| pa.cmp(pb)));

        let mut seen = HashSet::new();
        for (path, descriptor) in found {
            if !seen.insert(descriptor.id.clone()) {
                warn!(provider = %descriptor.id, path = %path.display(), "Duplicate provider id; keeping the first manifest");
                report.invalid.push(path.display().to_string());
                continue;
            }
            if let Some(cache) = &self.cache {
                cache.store(CacheArea::Providers, &descriptor.id, &descriptor).await;
            }
            match self.slot(&descriptor.id) {
                Some(slot) => {
                    let mut entry = slot.entry.lock().await;
                    let idle = entry.instance.is_none() && entry.state != ProviderState::Starting;
                    if entry.descriptor != descriptor && idle {
                        entry.descriptor = descriptor.clone();
                        report.updated.push(descriptor.id.clone());
                    }
                }
                None => {
                    let id = descriptor.id.clone();
                    if self.insert(descriptor, self.process_launcher.clone()).is_ok() {
                        report.added.push(id);
                    }
                }
            }
        }

        for slot in self.slots() {
            let entry = slot.entry.lock().await;
            let from_manifest = matches!(entry.descriptor.source, ProviderSource::Manifest { .. });
            let idle = entry.instance.is_none() && entry.state != ProviderState::Starting;
            if from_manifest && !seen.contains(&entry.descriptor.id) && idle {
                report.removed.push(entry.descriptor.id.clone());
            }
        }
        if !report.removed.is_empty() {
            if let Ok(mut providers) = self.providers.write() {
                for id in &report.removed {
                    providers.remove(id);
                }
            }
            if let Some(cache) = &self.cache {
                for id in &report.removed {
                    cache.remove(CacheArea::Providers, id).await;
                }
            }
        }

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            invalid = report.invalid.len(),
            "Provider discovery complete"
        );
        report
    }

    /// Acquires a provider supporting `tag`, starting one if none is ready.
    #[instrument(skip(self))]
    pub async fn ensure_ready(&self, tag: &str) -> AppResult<ProviderHandle> {
        self.acquire(|d| d.supports(tag), &format!("no provider for '{}'", tag)).await
    }

    /// Acquires a default provider.
    #[instrument(skip(self))]
    pub async fn ensure_default(&self) -> AppResult<ProviderHandle> {
        self.acquire(|d| d.is_default, "no default provider").await
    }

    async fn acquire<F>(&self, eligible: F, missing: &str) -> AppResult<ProviderHandle>
    where
        F: Fn(&ProviderDescriptor) -> bool,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AppError::Cancelled("capability registry is shutting down".to_string()));
        }

        let mut candidates = Vec::new();
        for slot in self.slots() {
            let mut entry = slot.entry.lock().await;
            if !eligible(&entry.descriptor) {
                continue;
            }
            if let Some(handle) = entry.acquire_ready() {
                debug!(provider = %handle.provider_id, refcount = entry.refcount, "Reusing ready provider");
                return Ok(handle);
            }
            candidates.push(slot.clone());
        }

        let mut last_error = None;
        for slot in candidates {
            // Waits only on a startup of this same provider.
            let _startup = slot.startup.lock().await;
            let (descriptor, launcher) = {
                let mut entry = slot.entry.lock().await;
                if let Some(handle) = entry.acquire_ready() {
                    return Ok(handle);
                }
                if !eligible(&entry.descriptor) {
                    continue;
                }
                if entry.in_cooldown() {
                    debug!(provider = %entry.descriptor.id, "Provider in cooldown; skipping");
                    continue;
                }
                entry.state = ProviderState::Starting;
                (entry.descriptor.clone(), entry.launcher.clone())
            };

            let started = self.start(&descriptor, launcher).await;

            let mut entry = slot.entry.lock().await;
            match started {
                Ok(capability) if self.shutting_down.load(Ordering::SeqCst) => {
                    entry.state = ProviderState::Stopped;
                    drop(entry);
                    capability.shutdown().await;
                    return Err(AppError::Cancelled("capability registry is shutting down".to_string()));
                }
                Ok(capability) => {
                    entry.instance = Some(capability);
                    entry.state = ProviderState::Ready;
                    entry.failures = 0;
                    entry.cooldown_until = None;
                    entry.idle_since = Some(Instant::now());
                    if let Some(handle) = entry.acquire_ready() {
                        return Ok(handle);
                    }
                }
                Err(e) => {
                    entry.failures += self.config.provider_start_retries + 1;
                    entry.state = ProviderState::Degraded;
                    entry.cooldown_until = Some(Instant::now() + self.config.provider_cooldown);
                    warn!(provider = %descriptor.id, failures = entry.failures, cooldown = ?self.config.provider_cooldown, "Provider degraded");
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::NoCapabilityAvailable(match last_error {
            Some(e) => format!("{} ({})", missing, e),
            None => missing.to_string(),
        }))
    }

    /// Launch plus health check, retried with exponential backoff. Runs without
    /// holding the provider's entry lock.
    async fn start(
        &self,
        descriptor: &ProviderDescriptor,
        launcher: Arc<dyn ProviderLauncher>,
    ) -> AppResult<Arc<dyn Capability>> {
        let id = &descriptor.id;
        let startup_timeout = self.config.provider_startup_timeout;
        let attempts = self.config.provider_start_retries + 1;
        let mut last_error = AppError::NoCapabilityAvailable(format!("provider '{}' never started", id));

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }
            let launched = timeout(startup_timeout, async {
                let capability = launcher.launch(descriptor).await?;
                if let Err(e) = capability.health_check().await {
                    capability.shutdown().await;
                    return Err(e);
                }
                Ok(capability)
            })
            .await;

            match launched {
                Ok(Ok(capability)) => {
                    info!(provider = %id, attempt, "Provider ready");
                    return Ok(capability);
                }
                Ok(Err(e)) => {
                    warn!(provider = %id, attempt, error = %e, "Provider failed to start");
                    last_error = e;
                }
                Err(_) => {
                    warn!(provider = %id, attempt, "Provider startup timed out");
                    last_error = AppError::Timeout(format!("provider '{}' did not start within {:?}", id, startup_timeout));
                }
            }
        }
        Err(last_error)
    }

    /// Returns a provider acquired through `ensure_ready`/`ensure_default`.
    pub async fn release(&self, provider_id: &str) {
        let Some(slot) = self.slot(provider_id) else {
            return;
        };
        let mut entry = slot.entry.lock().await;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 && entry.state == ProviderState::Ready {
            entry.idle_since = Some(Instant::now());
        }
    }

    /// Retires the instance behind `handle` after it faulted in use. The next
    /// acquire launches a fresh instance. Reports against an instance that was
    /// already replaced are ignored.
    pub async fn report_failure(&self, handle: &ProviderHandle, error: &AppError) {
        let Some(slot) = self.slot(&handle.provider_id) else {
            return;
        };
        let retired = {
            let mut entry = slot.entry.lock().await;
            let current = entry
                .instance
                .as_ref()
                .map_or(false, |instance| Arc::ptr_eq(instance, &handle.capability));
            if !current {
                return;
            }
            entry.failures += 1;
            warn!(provider = %handle.provider_id, failures = entry.failures, error = %error, "Retiring faulted provider");
            entry.retire(ProviderState::Discovered)
        };
        if let Some(instance) = retired {
            instance.shutdown().await;
        }
    }

    /// Stops ready providers that have been unused for `provider_idle_timeout`.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.provider_idle_timeout;
        let mut reaped = Vec::new();
        for slot in self.slots() {
            let (id, retired) = {
                let mut entry = slot.entry.lock().await;
                let idle = entry.refcount == 0 && entry.idle_since.map_or(false, |t| t.elapsed() >= idle_timeout);
                if entry.state != ProviderState::Ready || !idle {
                    continue;
                }
                (entry.descriptor.id.clone(), entry.retire(ProviderState::Stopped))
            };
            if let Some(instance) = retired {
                instance.shutdown().await;
            }
            info!(provider = %id, "Stopped idle provider");
            reaped.push(id);
        }
        reaped
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        let mut infos = Vec::new();
        for slot in self.slots() {
            infos.push(slot.entry.lock().await.info());
        }
        infos
    }

    /// Stops every running provider. Later acquires fail with `Cancelled`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for slot in self.slots() {
            let retired = {
                let mut entry = slot.entry.lock().await;
                if entry.instance.is_none() {
                    continue;
                }
                entry.retire(ProviderState::Stopped)
            };
            if let Some(instance) = retired {
                instance.shutdown().await;
            }
        }
        info!("All providers stopped");
    }
}
