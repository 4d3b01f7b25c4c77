//! Connection lifecycle management.
//!
//! [`LifecycleManager`] owns the pool and the connection state machine:
//!
//! ```text
//! Disconnected --start--> Connecting --probe ok--> Connected
//!      ^                      |  ^                     |
//!      |                      +--+ retry forever       |
//!      +-------------- health probe failed ------------+
//! ```
//!
//! Two background tasks drive it. The connect task opens the pool, probes
//! it, initializes the schema and publishes `Connected`; on failure it sleeps
//! the retry backoff and starts over, never giving up. The monitor task
//! probes the pool every health interval; on a failed probe it tears the
//! pool down and hands over to a fresh connect task. Only one of the two is
//! active at a time, and both stop promptly when [`LifecycleManager::close`]
//! is called, which joins them.
//!
//! State is published through a `watch` channel, so health snapshots never
//! block and [`LifecycleManager::wait_until_ready`] wakes on the transition
//! instead of polling.

use crate::config::DatabaseSettings;
use crate::db::Dialect;
use crate::db::pool::DbPool;
use crate::db::tables::initialize_schema;
use crate::error::{DbError, DbResult};
use crate::models::{HealthSnapshot, PoolState, TableDef};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct StateCell {
    state: PoolState,
    last_error: Option<String>,
    /// Health probes completed by the monitor task.
    probes: u64,
    /// Of those, the ones that failed and tore the pool down.
    failed_probes: u64,
    probing: bool,
}

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    settings: DatabaseSettings,
    tables: Vec<TableDef>,
    state_tx: watch::Sender<StateCell>,
    pool: RwLock<Option<DbPool>>,
    tasks: Mutex<Tasks>,
    shutdown_tx: watch::Sender<bool>,
    probe_now: Notify,
}

/// Owns the pool and keeps it connected.
///
/// Cloning is cheap; every clone drives the same state machine.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("settings", &self.inner.settings)
            .field("state", &self.state())
            .finish()
    }
}

impl LifecycleManager {
    /// Create a manager for the given settings and tables. Nothing connects
    /// until [`start`](Self::start) is called.
    pub fn new(settings: DatabaseSettings, tables: Vec<TableDef>) -> Self {
        let initial = if settings.enabled {
            PoolState::Disconnected
        } else {
            PoolState::Degraded
        };
        let (state_tx, _) = watch::channel(StateCell {
            state: initial,
            last_error: None,
            probes: 0,
            failed_probes: 0,
            probing: false,
        });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                settings,
                tables,
                state_tx,
                pool: RwLock::new(None),
                tasks: Mutex::new(Tasks::default()),
                shutdown_tx,
                probe_now: Notify::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.settings.enabled
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.settings.dialect
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.inner.settings
    }

    /// Current state of the state machine.
    pub fn state(&self) -> PoolState {
        self.inner.state_tx.borrow().state
    }

    /// Point-in-time connectivity report. Never suspends.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let cell = self.inner.state_tx.borrow();
        HealthSnapshot::new(cell.state, cell.last_error.clone())
    }

    /// Spawn the connect task.
    ///
    /// Does nothing when the feature is disabled, after `close()`, or when
    /// already started.
    pub fn start(&self) {
        if !self.is_enabled() {
            info!("Database disabled by configuration, not connecting");
            return;
        }
        {
            let tasks = self.lock_tasks();
            if tasks.connect.is_some() || tasks.monitor.is_some() {
                debug!("Lifecycle already started");
                return;
            }
        }
        info!(
            dialect = %self.dialect(),
            url = %self.inner.settings.masked_connection_string(),
            "Starting database connection"
        );
        self.spawn_connect_task();
    }

    /// Suspend until the pool is connected and return it.
    ///
    /// Fails fast with [`DbError::FeatureDisabled`] when the feature is off,
    /// and with [`DbError::PoolClosed`] once the manager is closed. Waits
    /// indefinitely otherwise, including before `start()`.
    pub async fn wait_until_ready(&self) -> DbResult<DbPool> {
        if !self.is_enabled() {
            return Err(DbError::FeatureDisabled);
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                return Err(DbError::PoolClosed);
            }
            if state_rx.borrow_and_update().state == PoolState::Connected {
                if let Some(pool) = self.current_pool() {
                    return Ok(pool);
                }
            }
            tokio::select! {
                _ = state_rx.changed() => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Wake the monitor task for an immediate probe.
    pub fn request_probe(&self) {
        self.inner.probe_now.notify_one();
    }

    /// Decide whether a failed checkout means the database is unreachable.
    ///
    /// Requests an immediate health probe and waits for its verdict. Returns
    /// `true` when the manager is no longer connected (the probe failed and
    /// the pool is being rebuilt, or the manager was closed) and `false` when
    /// a probe that started after the request found the server reachable.
    pub async fn confirm_outage(&self) -> bool {
        let mut state_rx = self.inner.state_tx.subscribe();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let (target, failed_before) = {
            let cell = state_rx.borrow_and_update();
            if cell.state != PoolState::Connected {
                return true;
            }
            // A probe already in flight may predate the failure.
            let target = if cell.probing {
                cell.probes + 2
            } else {
                cell.probes + 1
            };
            (target, cell.failed_probes)
        };
        self.request_probe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                return true;
            }
            {
                let cell = state_rx.borrow_and_update();
                // The pool may already be rebuilt by the time this wakes.
                if cell.state != PoolState::Connected || cell.failed_probes != failed_before {
                    return true;
                }
                if cell.probes >= target {
                    return false;
                }
            }
            tokio::select! {
                changed = state_rx.changed() => if changed.is_err() {
                    return true;
                },
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Stop both background tasks, wait for them to exit and close the pool.
    pub async fn close(&self) {
        self.inner.shutdown_tx.send_replace(true);

        let (connect, monitor) = {
            let mut tasks = self.lock_tasks();
            (tasks.connect.take(), tasks.monitor.take())
        };
        for handle in [connect, monitor].into_iter().flatten() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Lifecycle task panicked");
                }
            }
        }

        let pool = self.take_pool();
        if let Some(pool) = pool {
            pool.close().await;
            debug!("Pool closed");
        }

        if self.is_enabled() {
            self.inner.state_tx.send_if_modified(|cell| {
                let changed = cell.state != PoolState::Disconnected;
                cell.state = PoolState::Disconnected;
                changed
            });
        }
        info!("Database lifecycle stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current_pool(&self) -> Option<DbPool> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_pool(&self) -> Option<DbPool> {
        self.inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spawn_connect_task(&self) {
        let mut tasks = self.lock_tasks();
        if self.is_closed() {
            return;
        }
        let manager = self.clone();
        tasks.connect = Some(tokio::spawn(manager.connect_loop()));
    }

    fn spawn_monitor_task(&self) {
        let mut tasks = self.lock_tasks();
        if self.is_closed() {
            return;
        }
        let manager = self.clone();
        tasks.monitor = Some(tokio::spawn(manager.monitor_loop()));
    }

    async fn connect_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let policy = self.inner.settings.reconnect;
        let mut throttle = LogThrottle::new(policy.error_log_window);
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }
            self.inner.state_tx.send_if_modified(|cell| {
                let changed = cell.state != PoolState::Connecting;
                cell.state = PoolState::Connecting;
                changed
            });
            attempt += 1;

            let result = tokio::select! {
                _ = shutdown.changed() => return,
                result = self.try_connect() => result,
            };

            match result {
                Ok(pool) => {
                    *self
                        .inner
                        .pool
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = Some(pool);
                    self.inner.state_tx.send_modify(|cell| {
                        cell.state = PoolState::Connected;
                        cell.last_error = None;
                    });
                    info!(attempt, "Database connected");
                    self.spawn_monitor_task();
                    return;
                }
                Err(e) => {
                    if let Some(suppressed) = throttle.should_log(Instant::now()) {
                        warn!(
                            error = %e,
                            attempt,
                            suppressed,
                            suggestion = e.suggestion().unwrap_or_default(),
                            "Database connection failed, retrying"
                        );
                    }
                    let message = e.to_string();
                    self.inner
                        .state_tx
                        .send_modify(|cell| cell.last_error = Some(message));
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(policy.retry_backoff) => {}
            }
        }
    }

    /// Open, probe and prepare a pool.
    async fn try_connect(&self) -> DbResult<DbPool> {
        let pool = DbPool::connect(&self.inner.settings).await?;
        if let Err(e) = pool.probe().await {
            pool.close().await;
            return Err(e);
        }
        if let Some(version) = pool.server_version().await {
            info!(version = %version, "Database server reachable");
        }
        initialize_schema(&pool, &self.inner.tables).await;
        Ok(pool)
    }

    async fn monitor_loop(self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let interval = self.inner.settings.reconnect.health_interval;
        let connect_timeout = self.inner.settings.pool.connect_timeout;
        // Checkout through the pool, then possibly a direct connection.
        let probe_timeout = connect_timeout * 2;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(interval) => {}
                _ = self.inner.probe_now.notified() => debug!("Immediate probe requested"),
            }
            if *shutdown.borrow() {
                return;
            }
            let Some(pool) = self.current_pool() else {
                return;
            };

            self.inner.state_tx.send_modify(|cell| cell.probing = true);
            let result = tokio::select! {
                _ = shutdown.changed() => return,
                result = tokio::time::timeout(probe_timeout, pool.check_health()) => result
                    .unwrap_or_else(|_| Err(DbError::timeout("health probe", probe_timeout.as_secs()))),
            };

            match result {
                Ok(()) => {
                    self.inner.state_tx.send_modify(|cell| {
                        cell.probes += 1;
                        cell.probing = false;
                    });
                    debug!("Health probe succeeded");
                }
                Err(e) => {
                    error!(error = %e, "Health probe failed, reconnecting");
                    let stale = self.take_pool();
                    let message = e.to_string();
                    self.inner.state_tx.send_modify(|cell| {
                        cell.state = PoolState::Disconnected;
                        cell.last_error = Some(message);
                        cell.probes += 1;
                        cell.failed_probes += 1;
                        cell.probing = false;
                    });
                    if let Some(stale) = stale {
                        if tokio::time::timeout(connect_timeout, stale.close())
                            .await
                            .is_err()
                        {
                            warn!("Timed out waiting for connections of the old pool");
                        }
                    }
                    self.spawn_connect_task();
                    return;
                }
            }
        }
    }
}

/// Rate limiter for repeated failure logs: at most one entry per window.
#[derive(Debug)]
struct LogThrottle {
    window: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of entries suppressed since the previous log when
    /// this one should be logged, `None` when it should be dropped.
    fn should_log(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.window => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}
