//! Snapshot persistence
//!
//! The live entity graph is mapped to plain [`ServerRecord`] and
//! [`AssociationRecord`] values and stored as one [`Snapshot`]. Stores only
//! need to honour the load/save contract; [`JsonFileStore`] is the default.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::association::AssociationType;
use crate::error::Result;

/// Persisted form of a [`Server`](crate::Server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Server name
    pub name: String,
    /// Bound address
    pub host_address: String,
    /// Bound port
    pub host_port: u16,
    /// Whether the server was started when the snapshot was taken
    pub started: bool,
    /// Linked association names
    #[serde(default)]
    pub associations: Vec<String>,
}

/// Persisted form of an [`Association`](crate::Association)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRecord {
    /// Association name
    pub name: String,
    /// Client or server side
    #[serde(rename = "type")]
    pub kind: AssociationType,
    /// Local address
    pub host_address: String,
    /// Local port
    pub host_port: u16,
    /// Remote address
    pub peer_address: String,
    /// Remote port
    pub peer_port: u16,
    /// Owning server for server associations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Whether the association was started when the snapshot was taken
    pub started: bool,
}

/// Full persisted configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was written
    pub saved_at: DateTime<Utc>,
    /// All servers, ordered by name
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    /// All associations, ordered by name
    #[serde(default)]
    pub associations: Vec<AssociationRecord>,
}

impl Snapshot {
    /// Snapshot stamped with the current time
    pub fn new(servers: Vec<ServerRecord>, associations: Vec<AssociationRecord>) -> Self {
        Self {
            saved_at: Utc::now(),
            servers,
            associations,
        }
    }
}

/// Save/load contract for snapshots
pub trait PersistenceStore: Send + Sync {
    /// Last saved snapshot; `Ok(None)` when nothing was ever saved
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Snapshot stored as pretty-printed JSON in a single file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location `<dir>/<name>_sctp.json`
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(format!("{name}_sctp.json")))
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistenceStore for JsonFileStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_str(&contents)?;
        debug!(
            path = %self.path.display(),
            servers = snapshot.servers.len(),
            associations = snapshot.associations.len(),
            "Loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Saved snapshot");
        Ok(())
    }
}

/// In-process store, handy for tests and embedders that persist elsewhere
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `snapshot`
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    /// Last saved snapshot
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.lock().clone()
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}
