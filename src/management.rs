//! Management - the control surface of the stack
//!
//! A [`Management`] instance owns the server and association tables, the
//! persistence store, the selector thread and the worker dispatcher. Every
//! mutating call takes the tables exclusively, checks everything before
//! touching state, and finishes with a synchronous snapshot write.

use mio::{Poll, Waker};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::association::Association;
use crate::change::{ChangeQueue, CloseAck, WAKE_TOKEN};
use crate::clock::Clock;
use crate::error::{require_non_empty, require_port, ManagementError, Result};
use crate::persistence::{JsonFileStore, PersistenceStore, Snapshot};
use crate::selector::{LoopState, LoopStateCell, SelectorThread};
use crate::server::Server;
use crate::transport::{MetricsSnapshot, TransportMetrics};
use crate::worker::{Dispatcher, InlineDispatcher, PooledDispatcher, WorkerAssigner};
use crate::{default_worker_threads, ManagementBuilder};

/// Longest wait for the loop to release a stopped server's port
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the control surface, the entities and the selector loop
pub(crate) struct Core {
    pub(crate) changes: ChangeQueue,
    pub(crate) workers: WorkerAssigner,
    pub(crate) metrics: TransportMetrics,
    pub(crate) clock: Arc<dyn Clock>,
    connect_delay_ms: AtomicU64,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl Core {
    pub(crate) fn new(clock: Arc<dyn Clock>, workers: usize) -> Self {
        Self {
            changes: ChangeQueue::new(),
            workers: WorkerAssigner::new(workers),
            metrics: TransportMetrics::new(),
            clock,
            connect_delay_ms: AtomicU64::new(crate::DEFAULT_CONNECT_DELAY_MS),
            loop_thread: Mutex::new(None),
        }
    }

    pub(crate) fn connect_delay_ms(&self) -> u64 {
        self.connect_delay_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_delay_ms(&self, delay_ms: u64) {
        self.connect_delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub(crate) fn set_loop_thread(&self, thread: Option<ThreadId>) {
        *self.loop_thread.lock() = thread;
    }

    /// Whether the caller is the selector thread, e.g. an inline callback
    pub(crate) fn on_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }
}

/// Servers and associations keyed by name
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) servers: BTreeMap<String, Arc<Server>>,
    pub(crate) associations: BTreeMap<String, Arc<Association>>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.associations.is_empty()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.servers.values().map(|s| s.to_record()).collect(),
            self.associations.values().map(|a| a.to_record()).collect(),
        )
    }

    fn from_snapshot(snapshot: &Snapshot, core: &Arc<Core>) -> Self {
        let mut tables = Tables::default();
        for record in &snapshot.servers {
            tables
                .servers
                .insert(record.name.clone(), Arc::new(Server::from_record(record, core.clone())));
        }
        for record in &snapshot.associations {
            if let Some(server) = record.server_name.as_deref() {
                if !tables.servers.contains_key(server) {
                    warn!(association = %record.name, server, "Persisted association names a missing server");
                }
            }
            tables.associations.insert(
                record.name.clone(),
                Arc::new(Association::from_record(record, core.clone())),
            );
        }
        tables
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) worker_threads: usize,
    pub(crate) single_thread: bool,
    pub(crate) persist_dir: PathBuf,
}

struct LoopRuntime {
    handle: JoinHandle<()>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Orchestrator for servers, associations, the selector loop and persistence
pub struct Management {
    name: String,
    core: Arc<Core>,
    tables: Arc<RwLock<Tables>>,
    custom_store: Option<Arc<dyn PersistenceStore>>,
    store: RwLock<Option<Arc<dyn PersistenceStore>>>,
    settings: Mutex<Settings>,
    started: AtomicBool,
    runtime: Mutex<Option<LoopRuntime>>,
    loop_state: Arc<LoopStateCell>,
}

impl std::fmt::Debug for Management {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("Management")
            .field("name", &self.name)
            .field("started", &self.is_started())
            .field("servers", &tables.servers.len())
            .field("associations", &tables.associations.len())
            .finish()
    }
}


impl Management {
    /// Instance persisting to `<persist_dir>/<name>_sctp.json`
    pub fn new(name: &str) -> Self {
        ManagementBuilder::new(name).build()
    }

    /// Instance persisting through `store`
    pub fn with_store(name: &str, store: Arc<dyn PersistenceStore>) -> Self {
        ManagementBuilder::new(name).with_store(store).build()
    }

    /// Instance configured from a loaded [`ManagementConfig`](crate::ManagementConfig)
    pub fn from_config(config: &crate::ManagementConfig) -> Self {
        ManagementBuilder::new(&config.name).with_config(config.clone()).build()
    }

    pub(crate) fn assemble(
        name: String,
        settings: Settings,
        connect_delay_ms: u64,
        store: Option<Arc<dyn PersistenceStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let core = Arc::new(Core::new(clock, settings.worker_threads));
        core.set_connect_delay_ms(connect_delay_ms);
        Self {
            name,
            core,
            tables: Arc::new(RwLock::new(Tables::default())),
            custom_store: store,
            store: RwLock::new(None),
            settings: Mutex::new(settings),
            started: AtomicBool::new(false),
            runtime: Mutex::new(None),
            loop_state: Arc::new(LoopStateCell::new(LoopState::Stopped)),
        }
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`start`](Self::start) has run and [`stop`](Self::stop) has not
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Current selector thread state
    pub fn loop_state(&self) -> LoopState {
        self.loop_state.get()
    }

    /// Transport and loop counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    fn resolve_store(&self) -> Arc<dyn PersistenceStore> {
        match &self.custom_store {
            Some(store) => store.clone(),
            None => {
                let dir = self.settings.lock().persist_dir.clone();
                Arc::new(JsonFileStore::in_dir(&dir, &self.name))
            }
        }
    }

    /// Create the loop and workers, reload persisted state and restart every
    /// entity persisted as started
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Management name={} already started",
                self.name
            )));
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        self.core.changes.clear();
        self.core.changes.install_waker(waker);

        let store = self.resolve_store();
        *self.store.write() = Some(store.clone());

        let settings = self.settings.lock().clone();
        self.core.workers.configure(settings.worker_threads);
        let dispatcher: Arc<dyn Dispatcher> = if settings.single_thread {
            Arc::new(InlineDispatcher)
        } else {
            match PooledDispatcher::new(&self.name, settings.worker_threads) {
                Ok(pool) => Arc::new(pool),
                Err(e) => {
                    self.core.changes.reset();
                    return Err(e.into());
                }
            }
        };

        let snapshot = match store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(management = %self.name, "Failed to load persisted state, starting empty: {}", e);
                None
            }
        };
        let (restart_servers, restart_associations) = match &snapshot {
            Some(snapshot) => {
                let mut tables = self.tables.write();
                if tables.is_empty() {
                    *tables = Tables::from_snapshot(snapshot, &self.core);
                }
                (
                    snapshot.servers.iter().filter(|r| r.started).map(|r| r.name.clone()).collect(),
                    snapshot.associations.iter().filter(|r| r.started).map(|r| r.name.clone()).collect(),
                )
            }
            None => (Vec::new(), Vec::new()),
        };

        self.loop_state.set(LoopState::Running);
        let selector = SelectorThread::new(
            poll,
            self.core.clone(),
            self.tables.clone(),
            dispatcher.clone(),
            self.loop_state.clone(),
        );
        let handle = match thread::Builder::new()
            .name(format!("sctp-selector-{}", self.name))
            .spawn(move || selector.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.loop_state.set(LoopState::Stopped);
                dispatcher.shutdown();
                self.core.changes.reset();
                return Err(e.into());
            }
        };

        *runtime = Some(LoopRuntime { handle, dispatcher });
        self.started.store(true, Ordering::SeqCst);
        drop(runtime);

        self.restart(&restart_servers, &restart_associations);
        info!(
            management = %self.name,
            workers = settings.worker_threads,
            single_thread = settings.single_thread,
            "Management started"
        );
        Ok(())
    }

    fn restart(&self, servers: &[String], associations: &[String]) {
        let tables = self.tables.write();
        for name in servers {
            let Some(server) = tables.servers.get(name) else { continue };
            if server.is_started() {
                continue;
            }
            if let Err(e) = server.start() {
                error!(server = %name, "Failed to restart server: {}", e);
            }
        }
        for name in associations {
            let Some(association) = tables.associations.get(name) else { continue };
            if association.is_started() {
                continue;
            }
            if let Err(e) = association.start() {
                error!(association = %name, "Failed to restart association: {}", e);
            }
        }
    }

    /// Persist, close every channel, stop the loop and drain the workers
    pub fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if !self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Management name={} is not started",
                self.name
            )));
        }

        {
            let tables = self.tables.write();
            self.persist(&tables);
            self.started.store(false, Ordering::SeqCst);
        }

        self.loop_state.set(LoopState::Stopping);
        self.core.changes.wakeup();
        if let Some(LoopRuntime { handle, dispatcher }) = runtime.take() {
            if handle.join().is_err() {
                error!(management = %self.name, "Selector thread panicked");
            }
            dispatcher.shutdown();
        }
        self.loop_state.set(LoopState::Stopped);
        self.core.changes.reset();
        self.core.changes.clear();

        let tables = self.tables.read();
        for server in tables.servers.values() {
            server.halt();
        }
        for association in tables.associations.values() {
            association.halt();
        }

        info!(management = %self.name, "Management stopped");
        Ok(())
    }

    fn require_started(&self) -> Result<()> {
        if !self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Management name={} is not started",
                self.name
            )));
        }
        Ok(())
    }

    fn persist(&self, tables: &Tables) {
        let Some(store) = self.store.read().clone() else {
            return;
        };
        if let Err(e) = store.save(&tables.snapshot()) {
            error!(management = %self.name, "Failed to persist configuration: {}", e);
        }
    }

    // ---- servers ----

    /// Create a stopped server bound (once started) to `host_address:port`
    pub fn add_server(&self, name: &str, host_address: &str, port: u16) -> Result<Arc<Server>> {
        require_non_empty("Server name", name)?;
        require_non_empty("Host address", host_address)?;
        require_port("Host port", port)?;

        let mut tables = self.tables.write();
        self.require_started()?;
        if tables.servers.contains_key(name) {
            return Err(ManagementError::Conflict(format!("Server name={name} already exists")));
        }
        if let Some(existing) = tables.servers.values().find(|s| s.binds(host_address, port)) {
            return Err(ManagementError::Conflict(format!(
                "Server name={} already bound to {host_address}:{port}",
                existing.name()
            )));
        }

        let server = Arc::new(Server::new(name, host_address, port, self.core.clone()));
        tables.servers.insert(name.to_string(), server.clone());
        self.persist(&tables);
        info!(server = name, host = host_address, port, "Server added");
        Ok(server)
    }

    /// Remove a stopped server; its associations are left in place
    pub fn remove_server(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        self.require_started()?;
        let server = lookup(&tables.servers, "Server", name)?;
        if server.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Server name={name} is started, stop it first"
            )));
        }

        tables.servers.remove(name);
        self.persist(&tables);
        info!(server = name, "Server removed");
        Ok(())
    }

    /// Bind and register the server's listening socket
    pub fn start_server(&self, name: &str) -> Result<()> {
        let tables = self.tables.write();
        self.require_started()?;
        lookup(&tables.servers, "Server", name)?.start()?;
        self.persist(&tables);
        Ok(())
    }

    /// Close the listening socket; every owned association must be stopped
    pub fn stop_server(&self, name: &str) -> Result<()> {
        let closed = {
            let tables = self.tables.write();
            self.require_started()?;
            let closed = Self::stop_server_locked(&tables, name)?;
            self.persist(&tables);
            closed
        };

        // Wait unlocked: the loop reads the tables while matching accepted peers
        if let Some(closed) = closed {
            if !self.core.on_loop_thread() && !closed.wait(CLOSE_TIMEOUT) {
                warn!(server = name, "Listener close not confirmed within {:?}", CLOSE_TIMEOUT);
            }
        }
        Ok(())
    }

    fn stop_server_locked(tables: &Tables, name: &str) -> Result<Option<CloseAck>> {
        let server = lookup(&tables.servers, "Server", name)?;
        if !server.is_started() {
            return Err(ManagementError::Precondition(format!("Server name={name} is not started")));
        }
        let running: Vec<String> = server
            .association_names()
            .into_iter()
            .filter(|a| tables.associations.get(a).map_or(false, |a| a.is_started()))
            .collect();
        if !running.is_empty() {
            return Err(ManagementError::Precondition(format!(
                "Server name={name} still has started associations: {}",
                running.join(", ")
            )));
        }

        server.stop()
    }

    /// Server by name
    pub fn get_server(&self, name: &str) -> Result<Arc<Server>> {
        lookup(&self.tables.read().servers, "Server", name).cloned()
    }

    /// Every server, ordered by name
    pub fn get_servers(&self) -> Vec<Arc<Server>> {
        self.tables.read().servers.values().cloned().collect()
    }

    // ---- associations ----

    /// Create a stopped client association from `host` to `peer`
    pub fn add_association(
        &self,
        host_address: &str,
        host_port: u16,
        peer_address: &str,
        peer_port: u16,
        name: &str,
    ) -> Result<Arc<Association>> {
        require_non_empty("Host address", host_address)?;
        require_port("Host port", host_port)?;
        require_non_empty("Peer address", peer_address)?;
        require_port("Peer port", peer_port)?;
        require_non_empty("Association name", name)?;

        let mut tables = self.tables.write();
        self.require_started()?;
        check_name_free(&tables, name)?;
        check_peer_free(&tables, peer_address, peer_port)?;
        if let Some(existing) = tables
            .associations
            .values()
            .find(|a| a.host_address() == host_address && a.host_port() == host_port)
        {
            return Err(ManagementError::Conflict(format!(
                "Association name={} already uses host {host_address}:{host_port}",
                existing.name()
            )));
        }

        let association = Arc::new(Association::client(
            name,
            host_address,
            host_port,
            peer_address,
            peer_port,
            self.core.clone(),
        ));
        tables.associations.insert(name.to_string(), association.clone());
        self.persist(&tables);
        info!(association = name, peer = peer_address, peer_port, "Client association added");
        Ok(association)
    }

    /// Create a stopped server association accepting `peer` on `server_name`
    pub fn add_server_association(
        &self,
        peer_address: &str,
        peer_port: u16,
        server_name: &str,
        name: &str,
    ) -> Result<Arc<Association>> {
        require_non_empty("Peer address", peer_address)?;
        require_port("Peer port", peer_port)?;
        require_non_empty("Server name", server_name)?;
        require_non_empty("Association name", name)?;

        let mut tables = self.tables.write();
        self.require_started()?;
        check_name_free(&tables, name)?;
        let server = lookup(&tables.servers, "Server", server_name)?.clone();
        check_peer_free(&tables, peer_address, peer_port)?;

        let association = Arc::new(Association::server_side(
            name,
            server_name,
            server.host_address(),
            server.host_port(),
            peer_address,
            peer_port,
            self.core.clone(),
        ));
        server.link(name);
        tables.associations.insert(name.to_string(), association.clone());
        self.persist(&tables);
        info!(association = name, server = server_name, "Server association added");
        Ok(association)
    }

    /// Remove a stopped association and unlink it from its server
    pub fn remove_association(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        self.require_started()?;
        let association = lookup(&tables.associations, "Association", name)?;
        if association.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Association name={name} is started, stop it first"
            )));
        }

        if let Some(server) = association.server_name().and_then(|s| tables.servers.get(s)) {
            server.unlink(name);
        }
        tables.associations.remove(name);
        self.persist(&tables);
        info!(association = name, "Association removed");
        Ok(())
    }

    /// Open the association's channel: connect a client, await the peer for
    /// a server association
    pub fn start_association(&self, name: &str) -> Result<()> {
        let tables = self.tables.write();
        self.require_started()?;
        lookup(&tables.associations, "Association", name)?.start()?;
        self.persist(&tables);
        Ok(())
    }

    /// Mark the association stopped; its channel closes on the loop thread
    pub fn stop_association(&self, name: &str) -> Result<()> {
        let tables = self.tables.write();
        self.require_started()?;
        lookup(&tables.associations, "Association", name)?.stop()?;
        self.persist(&tables);
        Ok(())
    }

    /// Association by name
    pub fn get_association(&self, name: &str) -> Result<Arc<Association>> {
        lookup(&self.tables.read().associations, "Association", name).cloned()
    }

    /// Every association, ordered by name
    pub fn get_associations(&self) -> Vec<Arc<Association>> {
        self.tables.read().associations.values().cloned().collect()
    }

    /// Next `count` worker indices from the shared round-robin cursor
    pub fn assign_workers(&self, count: usize) -> Vec<usize> {
        self.core.workers.assign(count)
    }

    // ---- settings ----

    /// Backoff before a client association reconnects
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.core.connect_delay_ms())
    }

    /// Change the reconnect backoff; applies to reconnects scheduled later
    pub fn set_connect_delay(&self, delay: Duration) {
        self.core.set_connect_delay_ms(delay.as_millis() as u64);
    }

    /// Worker pool size used by the next start
    pub fn worker_threads(&self) -> usize {
        self.settings.lock().worker_threads
    }

    /// Set the worker pool size; 0 selects the default
    pub fn set_worker_threads(&self, workers: usize) {
        let workers = if workers < 1 { default_worker_threads() } else { workers };
        self.settings.lock().worker_threads = workers;
        debug!(management = %self.name, workers, "Worker threads set");
    }

    /// Whether callbacks run on the selector thread
    pub fn single_thread(&self) -> bool {
        self.settings.lock().single_thread
    }

    /// Choose inline or pooled dispatch; only before start
    pub fn set_single_thread(&self, single_thread: bool) -> Result<()> {
        let _runtime = self.runtime.lock();
        if self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Management name={} is started, dispatch mode is fixed",
                self.name
            )));
        }
        self.settings.lock().single_thread = single_thread;
        Ok(())
    }

    /// Directory of the default JSON store
    pub fn persist_dir(&self) -> PathBuf {
        self.settings.lock().persist_dir.clone()
    }

    /// Change the directory of the default JSON store; only before start
    pub fn set_persist_dir(&self, dir: &Path) -> Result<()> {
        let _runtime = self.runtime.lock();
        if self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Management name={} is started, persist directory is fixed",
                self.name
            )));
        }
        self.settings.lock().persist_dir = dir.to_path_buf();
        Ok(())
    }
}

impl Drop for Management {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop();
        }
    }
}

fn lookup<'a, T>(map: &'a BTreeMap<String, Arc<T>>, kind: &str, name: &str) -> Result<&'a Arc<T>> {
    map.get(name)
        .ok_or_else(|| ManagementError::NotFound(format!("{kind} name={name} not found")))
}

fn check_name_free(tables: &Tables, name: &str) -> Result<()> {
    if tables.associations.contains_key(name) {
        return Err(ManagementError::Conflict(format!("Association name={name} already exists")));
    }
    Ok(())
}

fn check_peer_free(tables: &Tables, peer_address: &str, peer_port: u16) -> Result<()> {
    if let Some(existing) = tables
        .associations
        .values()
        .find(|a| a.peer_address() == peer_address && a.peer_port() == peer_port)
    {
        return Err(ManagementError::Conflict(format!(
            "Association name={} already connects to peer {peer_address}:{peer_port}",
            existing.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn started(store: Arc<MemoryStore>) -> Management {
        let management = Management::with_store("unit", store);
        management.set_single_thread(true).unwrap();
        management.start().unwrap();
        management
    }

    #[test]
    fn test_mutations_require_started() {
        let management = Management::with_store("unit", Arc::new(MemoryStore::new()));
        assert!(matches!(
            management.add_server("S1", "127.0.0.1", 2905),
            Err(ManagementError::Precondition(_))
        ));
        assert!(matches!(management.stop(), Err(ManagementError::Precondition(_))));
    }

    #[test]
    fn test_start_twice_fails() {
        let management = started(Arc::new(MemoryStore::new()));
        assert!(matches!(management.start(), Err(ManagementError::Precondition(_))));
        assert_eq!(management.loop_state(), LoopState::Running);
        management.stop().unwrap();
        assert_eq!(management.loop_state(), LoopState::Stopped);
    }

    #[test]
    fn test_validation_before_mutation() {
        let store = Arc::new(MemoryStore::new());
        let management = started(store.clone());
        assert!(matches!(management.add_server("", "127.0.0.1", 1), Err(ManagementError::Validation(_))));
        assert!(matches!(management.add_server("S1", " ", 1), Err(ManagementError::Validation(_))));
        assert!(matches!(management.add_server("S1", "127.0.0.1", 0), Err(ManagementError::Validation(_))));
        assert!(matches!(
            management.add_association("10.0.0.1", 1000, "10.0.0.2", 0, "A1"),
            Err(ManagementError::Validation(_))
        ));
        assert!(management.get_servers().is_empty());
        assert!(management.get_associations().is_empty());
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_lookups_not_found() {
        let management = started(Arc::new(MemoryStore::new()));
        assert!(matches!(management.get_association("A9"), Err(ManagementError::NotFound(_))));
        assert!(matches!(management.get_server("S9"), Err(ManagementError::NotFound(_))));
        assert!(matches!(management.remove_server("S9"), Err(ManagementError::NotFound(_))));
        assert!(matches!(management.start_association("A9"), Err(ManagementError::NotFound(_))));
        assert!(matches!(
            management.add_server_association("10.0.0.2", 2000, "S9", "SA1"),
            Err(ManagementError::NotFound(_))
        ));
    }

    #[test]
    fn test_peer_and_host_conflicts() {
        let management = started(Arc::new(MemoryStore::new()));
        management.add_server("S1", "127.0.0.1", 2905).unwrap();
        management.add_association("10.0.0.1", 1000, "10.0.0.2", 2000, "A1").unwrap();

        assert!(matches!(
            management.add_association("10.0.0.1", 1001, "10.0.0.2", 2000, "A2"),
            Err(ManagementError::Conflict(_))
        ));
        assert!(matches!(
            management.add_association("10.0.0.1", 1000, "10.0.0.3", 2000, "A2"),
            Err(ManagementError::Conflict(_))
        ));
        assert!(matches!(
            management.add_server_association("10.0.0.2", 2000, "S1", "SA1"),
            Err(ManagementError::Conflict(_))
        ));
        assert!(matches!(
            management.add_server_association("10.0.0.5", 2000, "S1", "A1"),
            Err(ManagementError::Conflict(_))
        ));

        let sa = management.add_server_association("10.0.0.5", 2000, "S1", "SA1").unwrap();
        assert_eq!(sa.host_port(), 2905);
        assert_eq!(sa.server_name(), Some("S1"));
        assert_eq!(management.get_server("S1").unwrap().association_names(), vec!["SA1"]);

        management.remove_association("SA1").unwrap();
        assert!(management.get_server("S1").unwrap().association_names().is_empty());
    }

    #[test]
    fn test_every_mutation_persists() {
        let store = Arc::new(MemoryStore::new());
        let management = started(store.clone());
        management.add_server("S1", "127.0.0.1", 2905).unwrap();
        assert_eq!(store.snapshot().unwrap().servers.len(), 1);
        management.add_association("10.0.0.1", 1000, "10.0.0.2", 2000, "A1").unwrap();
        assert_eq!(store.snapshot().unwrap().associations.len(), 1);
        management.remove_server("S1").unwrap();
        assert!(store.snapshot().unwrap().servers.is_empty());
    }

    #[test]
    fn test_settings() {
        let management = Management::with_store("unit", Arc::new(MemoryStore::new()));
        management.set_worker_threads(0);
        assert_eq!(management.worker_threads(), default_worker_threads());
        management.set_worker_threads(3);
        assert_eq!(management.worker_threads(), 3);

        management.set_connect_delay(Duration::from_millis(250));
        assert_eq!(management.connect_delay(), Duration::from_millis(250));

        management.set_single_thread(true).unwrap();
        management.start().unwrap();
        assert!(matches!(management.set_single_thread(false), Err(ManagementError::Precondition(_))));
        assert!(matches!(
            management.set_persist_dir(Path::new("/tmp")),
            Err(ManagementError::Precondition(_))
        ));
        assert!(management.single_thread());

        assert_eq!(management.assign_workers(4), vec![0, 1, 2, 0]);
    }
}
