use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::resilience::CancelToken;
use rusqlite::{Connection, OpenFlags};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a single wait slice lasts; bounds cancellation latency while
/// blocked on the condvar.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct PoolOptions {
    path: PathBuf,
    readonly: bool,
    min_connections: usize,
    max_connections: usize,
    connection_timeout: Duration,
    idle_timeout: Duration,
    pragmas: crate::config::PragmaConfig,
    /// Shared-cache URI for in-memory mode; None for file-backed databases
    memory_uri: Option<String>,
}

struct IdleHandle {
    conn: Connection,
    idle_since: Instant,
}

struct PoolState {
    idle: Vec<IdleHandle>,
    /// Handles in existence, idle or leased
    total: usize,
    waiters: usize,
    closed: bool,
    /// Pins the shared in-memory database for the pool lifetime
    anchor: Option<Connection>,
}

#[derive(Default)]
struct AcquireTimes {
    total_ns: u128,
    count: u64,
    peak_ns: u128,
}

/// Counters published through `PoolStats`.
#[derive(Default)]
struct Counters {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    destroyed: AtomicU64,
    timeouts: AtomicU64,
}

/// Snapshot of pool health.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub destroyed: u64,
    pub timeouts: u64,
    pub available: usize,
    pub in_use: usize,
    pub waiters: usize,
    pub avg_acquire_ms: f64,
    pub peak_acquire_ms: f64,
}

/// Bounded pool of SQLite handles over a single database.
///
/// `acquire` blocks cooperatively until a handle frees up or the connection
/// timeout elapses. Handles are validated on release with a `SELECT 1` probe;
/// a failed probe destroys the handle and a replacement is created on next
/// demand. Idle handles beyond the minimum are reaped after the idle timeout.
pub struct ConnectionPool {
    options: PoolOptions,
    state: Mutex<PoolState>,
    available: Condvar,
    counters: Counters,
    acquire_times: Mutex<AcquireTimes>,
}

impl ConnectionPool {
    /// Builds the pool and warms up `min_connections` handles.
    pub fn new(config: &StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let memory_uri = if config.is_in_memory() {
            Some(format!(
                "file:code_index_{}?mode=memory&cache=shared",
                uuid::Uuid::new_v4().simple()
            ))
        } else {
            None
        };

        let options = PoolOptions {
            path: config.path.clone(),
            readonly: config.readonly,
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            pragmas: config.pragmas.clone(),
            memory_uri,
        };

        let pool = Arc::new(Self {
            options,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                waiters: 0,
                closed: false,
                anchor: None,
            }),
            available: Condvar::new(),
            counters: Counters::default(),
            acquire_times: Mutex::new(AcquireTimes::default()),
        });

        // The anchor holds the shared in-memory database open even when the
        // pool is momentarily empty.
        if pool.options.memory_uri.is_some() {
            let anchor = pool.open_handle()?;
            pool.lock_state().anchor = Some(anchor);
        }

        {
            let mut state = pool.lock_state();
            for _ in 0..pool.options.min_connections {
                let conn = pool.open_handle()?;
                pool.counters.created.fetch_add(1, Ordering::Relaxed);
                state.total += 1;
                state.idle.push(IdleHandle {
                    conn,
                    idle_since: Instant::now(),
                });
            }
        }

        debug!(
            path = %pool.options.path.display(),
            min = pool.options.min_connections,
            max = pool.options.max_connections,
            "connection pool ready"
        );
        Ok(pool)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state lock poisoned")
    }

    fn ensure_database_directory(&self) -> Result<()> {
        if self.options.memory_uri.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.options.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::connection(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Opens and configures a new handle.
    fn open_handle(&self) -> Result<Connection> {
        self.ensure_database_directory()?;

        let conn = if let Some(uri) = &self.options.memory_uri {
            let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            Connection::open_with_flags(uri, flags)
        } else {
            let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if self.options.readonly {
                flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
            } else {
                flags |= OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
            }
            Connection::open_with_flags(&self.options.path, flags)
        }
        .map_err(|e| StoreError::connection(format!("failed to open database: {e}")))?;

        self.configure_handle(&conn)?;
        Ok(conn)
    }

    /// Applies the pragma contract. The journal-and-foreign-keys combination
    /// is relied on by the FTS triggers and CASCADE semantics.
    fn configure_handle(&self, conn: &Connection) -> Result<()> {
        let pragmas = &self.options.pragmas;
        let foreign_keys = if pragmas.foreign_keys { "ON" } else { "OFF" };
        let cache_size = pragmas.cache_size_kib;
        let statements = if self.options.memory_uri.is_some() {
            // WAL is not supported for in-memory databases
            format!(
                "PRAGMA foreign_keys = {foreign_keys};\n\
                 PRAGMA synchronous = OFF;\n\
                 PRAGMA cache_size = -{cache_size};\n\
                 PRAGMA temp_store = {};",
                pragmas.temp_store
            )
        } else {
            format!(
                "PRAGMA journal_mode = {};\n\
                 PRAGMA synchronous = {};\n\
                 PRAGMA foreign_keys = {foreign_keys};\n\
                 PRAGMA cache_size = -{cache_size};\n\
                 PRAGMA temp_store = {};",
                pragmas.journal_mode, pragmas.synchronous, pragmas.temp_store
            )
        };
        conn.execute_batch(&statements)
            .map_err(|e| StoreError::connection(format!("failed to configure handle: {e}")))?;
        conn.busy_timeout(self.options.connection_timeout)
            .map_err(|e| StoreError::connection(format!("failed to set busy timeout: {e}")))?;
        Ok(())
    }

    /// Acquires a handle, blocking up to the configured connection timeout.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        self.acquire_with(None)
    }

    /// Acquire with a cancellation token observed while waiting.
    pub fn acquire_with(self: &Arc<Self>, cancel: Option<&CancelToken>) -> Result<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.options.connection_timeout;
        let mut state = self.lock_state();

        loop {
            if state.closed {
                return Err(StoreError::connection("pool is closed"));
            }
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(StoreError::connection("acquisition cancelled"));
                }
            }

            self.reap_locked(&mut state);

            if let Some(handle) = state.idle.pop() {
                drop(state);
                self.record_acquired(started);
                return Ok(PooledConnection::new(Arc::clone(self), handle.conn));
            }

            if state.total < self.options.max_connections {
                state.total += 1;
                drop(state);
                match self.open_handle() {
                    Ok(conn) => {
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        self.record_acquired(started);
                        return Ok(PooledConnection::new(Arc::clone(self), conn));
                    }
                    Err(err) => {
                        let mut state = self.lock_state();
                        state.total -= 1;
                        self.available.notify_one();
                        return Err(err);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = self.options.connection_timeout.as_millis() as u64;
                warn!(timeout_ms, "pool acquisition timed out");
                return Err(StoreError::resource_exhausted(
                    format!("no connection became available within {timeout_ms}ms"),
                    Some(timeout_ms / 2),
                ));
            }

            let wait = (deadline - now).min(WAIT_SLICE);
            state.waiters += 1;
            let (guard, _outcome) = self
                .available
                .wait_timeout(state, wait)
                .expect("pool state lock poisoned");
            state = guard;
            state.waiters -= 1;
        }
    }

    fn record_acquired(&self, started: Instant) {
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed().as_nanos();
        let mut times = self
            .acquire_times
            .lock()
            .expect("acquire time lock poisoned");
        times.total_ns += elapsed;
        times.count += 1;
        times.peak_ns = times.peak_ns.max(elapsed);
    }

    /// Returns a handle to the pool, validating it first.
    fn release(&self, conn: Connection) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        let healthy = conn
            .query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
            .map(|v| v == 1)
            .unwrap_or(false);

        let mut state = self.lock_state();
        if !healthy || state.closed {
            if !healthy {
                warn!("discarding handle that failed validation");
            }
            state.total -= 1;
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            drop(conn);
        } else {
            state.idle.push(IdleHandle {
                conn,
                idle_since: Instant::now(),
            });
        }
        self.available.notify_one();
    }

    /// Drops idle handles past the idle timeout, keeping the minimum warm.
    fn reap_locked(&self, state: &mut PoolState) {
        let idle_timeout = self.options.idle_timeout;
        let min = self.options.min_connections;
        let mut i = 0;
        while i < state.idle.len() {
            if state.total <= min {
                break;
            }
            if state.idle[i].idle_since.elapsed() > idle_timeout {
                let handle = state.idle.swap_remove(i);
                state.total -= 1;
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                drop(handle.conn);
            } else {
                i += 1;
            }
        }
    }

    /// Explicit reap entry point for owners that run maintenance ticks.
    pub fn reap_idle(&self) {
        let mut state = self.lock_state();
        self.reap_locked(&mut state);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let times = self
            .acquire_times
            .lock()
            .expect("acquire time lock poisoned");
        let avg_acquire_ms = if times.count > 0 {
            (times.total_ns as f64 / times.count as f64) / 1_000_000.0
        } else {
            0.0
        };
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            available: state.idle.len(),
            in_use: state.total - state.idle.len(),
            waiters: state.waiters,
            avg_acquire_ms,
            peak_acquire_ms: times.peak_ns as f64 / 1_000_000.0,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        self.options.connection_timeout
    }

    /// Closes the pool. Leased handles are destroyed as they return.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        let dropped = state.idle.len();
        state.total -= dropped;
        self.counters
            .destroyed
            .fetch_add(dropped as u64, Ordering::Relaxed);
        state.idle.clear();
        state.anchor = None;
        self.available.notify_all();
        debug!("connection pool closed");
    }
}

/// A short-lived lease on a pooled handle. The handle returns to the pool on
/// drop, on every exit path including unwinding.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
