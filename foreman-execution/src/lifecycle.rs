//! Start-up, health sweeps and shutdown of the whole worker fleet

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use foreman_config::ForemanConfig;
use foreman_ipc::WorkerCategory;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{Ping, RequestDispatcher};
use crate::error::DispatchResult;
use crate::handle::HandleState;
use crate::launcher::{CommandLauncher, WorkerLauncher};
use crate::pool::{PoolSettings, WorkerHealth, WorkerPool};

/// Timing knobs for the controller
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub restart_on_crash: bool,
}

impl LifecycleSettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self {
            handshake_timeout: config.dispatch.handshake_timeout,
            heartbeat_interval: config.dispatch.heartbeat_interval,
            restart_on_crash: config.workers.restart_on_crash,
        }
    }
}

/// Owns the pool and dispatcher for the lifetime of the host
pub struct LifecycleController {
    pool: Arc<WorkerPool>,
    dispatcher: RequestDispatcher,
    settings: LifecycleSettings,
    stop: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    shut_down: tokio::sync::Mutex<bool>,
}

impl LifecycleController {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        pool_settings: PoolSettings,
        default_timeout: Duration,
        settings: LifecycleSettings,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(launcher, pool_settings));
        let dispatcher = RequestDispatcher::new(Arc::clone(&pool), default_timeout);
        let (stop, _) = watch::channel(false);

        Self {
            pool,
            dispatcher,
            settings,
            stop,
            monitor: Mutex::new(None),
            shut_down: tokio::sync::Mutex::new(false),
        }
    }

    /// Validate `config`, then build a controller from it
    pub fn try_from_config(config: &ForemanConfig) -> DispatchResult<Self> {
        config.validate_all()?;
        Ok(Self::from_config(config))
    }

    /// Controller launching real processes as configured
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self::new(
            Arc::new(CommandLauncher::from_config(&config.workers)),
            PoolSettings::from_config(&config.dispatch),
            config.dispatch.default_timeout,
            LifecycleSettings::from_config(config),
        )
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Start and handshake the given categories concurrently.
    ///
    /// Returns true when at least one category came up, or when there was
    /// nothing to start. Categories that fail are logged and left empty;
    /// they are retried lazily on first use.
    pub async fn initialize(&self, categories: &[WorkerCategory]) -> bool {
        if categories.is_empty() {
            return true;
        }
        info!(count = categories.len(), "Pre-warming workers");

        let outcomes = join_all(categories.iter().map(|category| async move {
            (category, self.prewarm(category).await)
        }))
        .await;

        let mut started = 0;
        for (category, outcome) in outcomes {
            match outcome {
                Ok(()) => started += 1,
                Err(e) => warn!(worker = %category, "Pre-warm failed: {}", e),
            }
        }

        info!(started, requested = categories.len(), "Pre-warm finished");
        started > 0
    }

    async fn prewarm(&self, category: &WorkerCategory) -> DispatchResult<()> {
        self.pool.get(category).await?;

        let ping = Ping::new(category.clone());
        if let Err(e) = self
            .dispatcher
            .request(&ping, self.settings.handshake_timeout)
            .await
        {
            // Do not leave a worker that fails its handshake in the pool
            self.pool.remove(category).await;
            return Err(e);
        }
        debug!(worker = %category, "Handshake complete");
        Ok(())
    }

    /// Start the periodic health sweep. A second call is a no-op.
    pub fn spawn_health_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() || *self.stop.borrow() {
            return;
        }

        let pool = Arc::clone(&self.pool);
        let interval = self.settings.heartbeat_interval;
        let restart_on_crash = self.settings.restart_on_crash;
        let mut stop = self.stop.subscribe();

        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep(&pool, restart_on_crash).await,
                    _ = stop.changed() => break,
                }
            }
            debug!("Health monitor stopped");
        }));
    }

    pub fn health(&self) -> BTreeMap<WorkerCategory, WorkerHealth> {
        self.pool.health_snapshot()
    }

    /// Stop the monitor and every worker. Later calls return immediately.
    pub async fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock().await;
        if *shut_down {
            debug!("Shutdown already completed");
            return;
        }

        info!("Shutting down workers");
        self.stop.send_replace(true);
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        self.pool.shutdown_all().await;
        *shut_down = true;
    }
}

async fn sweep(pool: &WorkerPool, restart_on_crash: bool) {
    for (category, health) in pool.health_snapshot() {
        match health.state {
            HandleState::Crashed | HandleState::Dead => {
                if !restart_on_crash {
                    debug!(worker = %category, "Worker is down, restart disabled");
                    continue;
                }
                match pool.revive(&category).await {
                    Ok(true) => info!(worker = %category, "Health sweep restarted worker"),
                    Ok(false) => {}
                    Err(e) => warn!(worker = %category, "Health sweep restart failed: {}", e),
                }
            }
            _ => debug!(
                worker = %category,
                state = %health.state,
                in_flight = health.in_flight,
                "Worker healthy"
            ),
        }
    }
}
