//! SCTP management core - association lifecycle over a single selector loop
//!
//! This crate is the control and I/O-multiplexing core of an SCTP stack. A
//! [`Management`] instance owns listening [`Server`]s and point-to-point
//! [`Association`]s, runs every socket through one non-blocking selector
//! thread, hands listener callbacks to a per-association worker and persists
//! its configuration so the stack can be recreated after a restart.
//!
//! ```no_run
//! use sctp_core::{Management, ManagementBuilder, MemoryStore};
//! use std::sync::Arc;
//!
//! let management = ManagementBuilder::new("gnb")
//!     .with_store(Arc::new(MemoryStore::new()))
//!     .build();
//! management.start()?;
//! management.add_server("S1", "127.0.0.1", 38412)?;
//! management.start_server("S1")?;
//! # Ok::<(), sctp_core::ManagementError>(())
//! ```

#![warn(missing_docs)]

pub mod association;
pub mod change;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod management;
pub mod persistence;
pub mod protocol;
pub mod selector;
pub mod server;
pub mod transport;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

pub use association::{
    Association, AssociationEvent, AssociationListener, AssociationState, AssociationType,
    MAX_OUTBOUND_BYTES,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ManagementConfig;
pub use error::{ManagementError, Result};
pub use management::Management;
pub use persistence::{
    AssociationRecord, JsonFileStore, MemoryStore, PersistenceStore, ServerRecord, Snapshot,
};
pub use protocol::{PayloadData, NGAP_PPID};
pub use selector::{LoopState, MAX_POLL_INTERVAL};
pub use server::Server;
pub use transport::MetricsSnapshot;

/// Default backoff before a client association reconnects
pub const DEFAULT_CONNECT_DELAY_MS: u64 = 30_000;

/// Default worker pool size: twice the available parallelism
pub fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

/// Builder for configured [`Management`] instances
pub struct ManagementBuilder {
    config: ManagementConfig,
    store: Option<Arc<dyn PersistenceStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ManagementBuilder {
    /// Builder with default settings for instance `name`
    pub fn new(name: &str) -> Self {
        Self {
            config: ManagementConfig {
                name: name.to_string(),
                ..ManagementConfig::default()
            },
            store: None,
            clock: None,
        }
    }

    /// Take every setting, name included, from `config`
    pub fn with_config(mut self, config: ManagementConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist through `store` instead of the default JSON file
    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Schedule reconnects against `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Dispatch callbacks on the selector thread
    pub fn single_thread(mut self, single_thread: bool) -> Self {
        self.config.single_thread = single_thread;
        self
    }

    /// Worker pool size; 0 selects the default
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.config.worker_threads = workers;
        self
    }

    /// Reconnect backoff in milliseconds
    pub fn connect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.config.connect_delay_ms = delay_ms;
        self
    }

    /// Directory of the default JSON store
    pub fn persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.persist_dir = Some(dir.into());
        self
    }

    /// Build the stopped instance
    pub fn build(self) -> Management {
        let worker_threads = if self.config.worker_threads < 1 {
            default_worker_threads()
        } else {
            self.config.worker_threads
        };
        let settings = management::Settings {
            worker_threads,
            single_thread: self.config.single_thread,
            persist_dir: self
                .config
                .persist_dir
                .unwrap_or_else(config::default_persist_dir),
        };
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        Management::assemble(
            self.config.name,
            settings,
            self.config.connect_delay_ms,
            self.store,
            clock,
        )
    }
}
