//! Composition root: builds every component once, runs the background loops and
//! owns the shutdown order.

use crate::bridge::ConversationalBridge;
use crate::cache::StateCache;
use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::monitor::{ResourceSampler, SessionResourceMonitor, SysinfoSampler};
use crate::project::ProjectContextProbe;
use crate::session::SessionPool;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, instrument};

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Engine {
    config: Arc<Config>,
    pool: SessionPool,
    monitor: Arc<SessionResourceMonitor>,
    registry: Arc<CapabilityRegistry>,
    bridge: Arc<ConversationalBridge>,
    probe: ProjectContextProbe,
    cancel: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("pool", &self.pool).finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self::with_sampler(config, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(config: Config, sampler: Box<dyn ResourceSampler>) -> Self {
        let config = Arc::new(config);
        let cache = config.state_dir.as_ref().map(StateCache::new);
        let monitor = Arc::new(SessionResourceMonitor::with_sampler(&config, sampler));
        let pool = SessionPool::with_cache(config.clone(), monitor.clone(), cache.clone());
        let registry = Arc::new(CapabilityRegistry::new(config.clone(), cache));
        let bridge = Arc::new(ConversationalBridge::new(config.clone(), pool.clone(), registry.clone()));
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            pool,
            monitor,
            registry,
            bridge,
            probe: ProjectContextProbe::default(),
            cancel,
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<SessionResourceMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<ConversationalBridge> {
        &self.bridge
    }

    pub fn probe(&self) -> &ProjectContextProbe {
        &self.probe
    }

    /// Restores cached records, discovers providers and starts the background loops.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        self.pool.restore_cached().await;
        self.registry.discover().await;

        let mut handles = Vec::new();

        let pool = self.pool.clone();
        let period = self.config.attention_sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.sweep().await;
            }
        }));

        let pool = self.pool.clone();
        let period = self.config.sample_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.check_resources().await;
            }
        }));

        let registry = self.registry.clone();
        let period = (self.config.provider_idle_timeout / 4).clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.reap_idle().await;
            }
        }));

        handles.push(self.bridge.spawn_listener());

        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
        info!(max_sessions = self.pool.max_sessions(), "Engine started");
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Runs `operation` unless shutdown begins first, in which case `Cancelled`.
    pub async fn run_cancellable<T, F>(&self, operation: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow() {
            return Err(AppError::Cancelled("engine is shutting down".to_string()));
        }
        tokio::select! {
            result = operation => result,
            _ = cancel.wait_for(|cancelled| *cancelled) => {
                Err(AppError::Cancelled("engine is shutting down".to_string()))
            }
        }
    }

    /// Cancels in-flight operations, terminates sessions, stops providers, then
    /// stops the background loops.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.cancel.send_replace(true);
        self.pool.shutdown().await;
        self.registry.shutdown().await;
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            handle.abort();
        }
        info!("Engine stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::monitor::testing::FixedSampler;
    use crate::session::types::SessionStatus;

    fn engine() -> Engine {
        let config = Config {
            default_shell: Some("sh".into()),
            provider_dirs: Vec::new(),
            state_dir: None,
            attention_sweep_interval: Duration::from_millis(20),
            ..Config::default()
        };
        Engine::with_sampler(config, Box::new(FixedSampler::default()))
    }

    #[tokio::test]
    async fn shutdown_terminates_sessions_and_cancels() {
        let engine = engine();
        engine.start().await;
        let dir = tempfile::tempdir().unwrap();
        let id = engine.pool().create(dir.path(), None).await.unwrap();

        let pending = engine.run_cancellable(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, AppError>(())
        });
        let (result, _) = tokio::join!(pending, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.shutdown().await;
        });
        assert!(matches!(result, Err(AppError::Cancelled(_))));

        let session = engine.pool().get(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(engine.pool().active_count(), 0);
        assert!(matches!(
            engine.pool().create(dir.path(), None).await,
            Err(AppError::Cancelled(_))
        ));
        assert!(engine.is_cancelled());
    }
}
