//! One worker process per category, created lazily and replaced on failure

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use foreman_config::DispatchConfig;
use foreman_ipc::WorkerCategory;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::handle::{HandleSettings, HandleState, ShutdownSettings, WorkerProcessHandle};
use crate::launcher::WorkerLauncher;
use crate::process::ProcessExit;

/// Point-in-time view of one category
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub category: WorkerCategory,
    pub alive: bool,
    pub state: HandleState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub memory_resident_bytes: Option<u64>,
    pub restart_count: u32,
    pub in_flight: usize,
    pub last_exit: Option<ProcessExit>,
}

/// Per-category bookkeeping
struct Slot {
    /// Serialises creation and replacement of the handle
    creation: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<WorkerProcessHandle>>>,
    restarts: AtomicU32,
    last_exit: Mutex<Option<ProcessExit>>,
    /// A handle was torn down for replacement and no successor is installed
    replacing: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            creation: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            restarts: AtomicU32::new(0),
            last_exit: Mutex::new(None),
            replacing: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<Arc<WorkerProcessHandle>> {
        self.current.lock().clone()
    }

    fn live(&self) -> Option<Arc<WorkerProcessHandle>> {
        self.current().filter(|handle| handle.is_alive())
    }
}

/// Settings the pool applies to every handle it creates
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub handle: HandleSettings,
    pub shutdown: ShutdownSettings,
    pub startup_grace: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            handle: HandleSettings::from_config(config),
            shutdown: ShutdownSettings::from_config(config),
            startup_grace: config.startup_grace,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Owns at most one live worker process per category.
///
/// Lookups of a live handle never wait on another category. Creation of a
/// handle is serialised per category, so concurrent first callers share one
/// process.
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    settings: PoolSettings,
    slots: Mutex<HashMap<WorkerCategory, Arc<Slot>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, settings: PoolSettings) -> Self {
        Self {
            launcher,
            settings,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn slot(&self, category: &WorkerCategory) -> Arc<Slot> {
        Arc::clone(
            self.slots
                .lock()
                .entry(category.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    fn ensure_open(&self, category: &WorkerCategory) -> DispatchResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DispatchError::unavailable(category, "worker pool is shut down"))
        } else {
            Ok(())
        }
    }

    /// Live handle for `category`, starting a process if there is none.
    ///
    /// A dead handle found here is disposed of and replaced.
    pub async fn get(&self, category: &WorkerCategory) -> DispatchResult<Arc<WorkerProcessHandle>> {
        self.ensure_open(category)?;
        let slot = self.slot(category);
        if let Some(handle) = slot.live() {
            return Ok(handle);
        }

        let _creation = slot.creation.lock().await;
        self.ensure_open(category)?;
        if let Some(handle) = slot.live() {
            return Ok(handle);
        }

        self.replace(category, &slot).await
    }

    /// Tear down whatever handle the category has and start a fresh one
    pub async fn restart(&self, category: &WorkerCategory) -> DispatchResult<Arc<WorkerProcessHandle>> {
        self.ensure_open(category)?;
        let slot = self.slot(category);
        let _creation = slot.creation.lock().await;
        self.ensure_open(category)?;

        info!(worker = %category, "Restarting worker");
        self.replace(category, &slot).await
    }

    /// Replace `failed` if it is still the category's handle.
    ///
    /// Many callers may observe the same crash; only the first one to get
    /// here restarts the process. Returns whether a restart happened.
    pub async fn recover(
        &self,
        category: &WorkerCategory,
        failed: &Arc<WorkerProcessHandle>,
    ) -> DispatchResult<bool> {
        self.recover_where(category, |current| {
            current.is_some_and(|current| Arc::ptr_eq(current, failed))
        })
        .await
    }

    /// Replace the category's handle if it is no longer alive.
    ///
    /// Also retries a category whose previous replacement failed to start.
    pub async fn revive(&self, category: &WorkerCategory) -> DispatchResult<bool> {
        self.recover_where(category, |_| true).await
    }

    async fn recover_where<F>(&self, category: &WorkerCategory, matches: F) -> DispatchResult<bool>
    where
        F: Fn(Option<&Arc<WorkerProcessHandle>>) -> bool,
    {
        if self.is_closed() {
            return Ok(false);
        }
        let slot = self.slot(category);
        let _creation = slot.creation.lock().await;
        if self.is_closed() {
            return Ok(false);
        }

        let due = match slot.current() {
            Some(current) => matches(Some(&current)) && !current.is_alive(),
            None => matches(None) && slot.replacing.load(Ordering::SeqCst),
        };
        if !due {
            return Ok(false);
        }

        warn!(worker = %category, "Recovering crashed worker");
        self.replace(category, &slot).await?;
        Ok(true)
    }

    /// Dispose of the current handle and install a new one.
    /// Caller holds the slot's creation lock.
    async fn replace(&self, category: &WorkerCategory, slot: &Slot) -> DispatchResult<Arc<WorkerProcessHandle>> {
        let previous = slot.current.lock().take();
        if let Some(previous) = previous {
            slot.replacing.store(true, Ordering::SeqCst);
            self.dispose(slot, &previous).await;
        }
        // Still set when an earlier replacement failed to start
        let restarting = slot.replacing.load(Ordering::SeqCst);

        let handle = self.create(category).await?;
        if self.is_closed() {
            // Closed while starting
            handle.shutdown(&self.settings.shutdown).await;
            return Err(DispatchError::unavailable(category, "worker pool is shut down"));
        }

        if restarting {
            slot.replacing.store(false, Ordering::SeqCst);
            let count = slot.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            info!(worker = %category, restarts = count, "Worker restarted");
        }
        *slot.current.lock() = Some(Arc::clone(&handle));
        Ok(handle)
    }

    async fn create(&self, category: &WorkerCategory) -> DispatchResult<Arc<WorkerProcessHandle>> {
        let launched = self.launcher.launch(category).await?;
        let handle = Arc::new(WorkerProcessHandle::start(
            category.clone(),
            launched,
            &self.settings.handle,
        ));

        if let Err(e) = handle.await_startup(self.settings.startup_grace).await {
            warn!(worker = %category, "Worker failed to start: {}", e);
            handle.shutdown(&self.settings.shutdown).await;
            return Err(e);
        }

        info!(worker = %category, pid = ?handle.pid(), "Worker ready");
        Ok(handle)
    }

    async fn dispose(&self, slot: &Slot, handle: &WorkerProcessHandle) {
        handle.shutdown(&self.settings.shutdown).await;
        if let Some(exit) = handle.exit_status() {
            *slot.last_exit.lock() = Some(exit);
        }
    }

    /// Stop and forget the category's process, if any
    pub async fn remove(&self, category: &WorkerCategory) {
        let slot = self.slot(category);
        let _creation = slot.creation.lock().await;
        let current = slot.current.lock().take();
        slot.replacing.store(false, Ordering::SeqCst);
        if let Some(handle) = current {
            debug!(worker = %category, "Removing worker");
            self.dispose(&slot, &handle).await;
        }
    }

    /// Whether the category currently has a live process. Never starts one.
    pub fn is_available(&self, category: &WorkerCategory) -> bool {
        let slot = self.slots.lock().get(category).cloned();
        slot.and_then(|slot| slot.live()).is_some()
    }

    /// Categories the pool has seen
    pub fn categories(&self) -> Vec<WorkerCategory> {
        let mut categories: Vec<_> = self.slots.lock().keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Health of every known category
    pub fn health_snapshot(&self) -> BTreeMap<WorkerCategory, WorkerHealth> {
        let slots: Vec<(WorkerCategory, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(category, slot)| (category.clone(), Arc::clone(slot)))
            .collect();

        let entries: Vec<(WorkerCategory, Arc<Slot>, Option<Arc<WorkerProcessHandle>>)> = slots
            .into_iter()
            .map(|(category, slot)| {
                let handle = slot.current();
                (category, slot, handle)
            })
            .collect();

        let pids: Vec<Pid> = entries
            .iter()
            .filter_map(|(_, _, handle)| handle.as_ref())
            .filter(|handle| handle.is_alive())
            .filter_map(|handle| handle.pid())
            .map(Pid::from_u32)
            .collect();

        let mut system = System::new();
        if !pids.is_empty() {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&pids),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
        }

        entries
            .into_iter()
            .map(|(category, slot, handle)| {
                let restart_count = slot.restarts.load(Ordering::SeqCst);
                let health = match handle {
                    Some(handle) => {
                        let alive = handle.is_alive();
                        let memory = handle
                            .pid()
                            .filter(|_| alive)
                            .and_then(|pid| system.process(Pid::from_u32(pid)))
                            .map(|process| process.memory());
                        WorkerHealth {
                            category: category.clone(),
                            alive,
                            state: handle.state(),
                            pid: handle.pid(),
                            started_at: Some(handle.started_at()),
                            memory_resident_bytes: memory,
                            restart_count,
                            in_flight: handle.in_flight(),
                            last_exit: handle.exit_status().or(*slot.last_exit.lock()),
                        }
                    }
                    None => {
                        let last_exit = *slot.last_exit.lock();
                        WorkerHealth {
                            category: category.clone(),
                            alive: false,
                            // A category whose process was stopped reads as dead
                            state: if last_exit.is_some() {
                                HandleState::Dead
                            } else {
                                HandleState::Unstarted
                            },
                            pid: None,
                            started_at: None,
                            memory_resident_bytes: None,
                            restart_count,
                            in_flight: 0,
                            last_exit,
                        }
                    }
                };
                (category, health)
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse all further creation. Existing handles are untouched.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Close the pool and stop every process it owns, concurrently
    pub async fn shutdown_all(&self) {
        self.close();

        let slots: Vec<(WorkerCategory, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(category, slot)| (category.clone(), Arc::clone(slot)))
            .collect();

        join_all(slots.iter().map(|(category, slot)| async move {
            // Waits out any creation that was already underway
            let _creation = slot.creation.lock().await;
            let current = slot.current.lock().take();
            if let Some(handle) = current {
                debug!(worker = %category, "Stopping worker");
                self.dispose(slot, &handle).await;
            }
        }))
        .await;

        info!("All workers stopped");
    }
}
