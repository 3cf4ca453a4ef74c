//! Servers - bound listening endpoints that accept server associations

use mio::{Interest, Token};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::change::{ChangeRequest, CloseAck};
use crate::error::{ManagementError, Result};
use crate::management::Core;
use crate::persistence::ServerRecord;
use crate::transport::{self, Channel};

/// A listening endpoint. Associations are referenced by name and owned by
/// [`Management`](crate::Management).
pub struct Server {
    name: String,
    host_address: String,
    host_port: u16,
    started: AtomicBool,
    associations: Mutex<Vec<String>>,
    token: Mutex<Option<Token>>,
    core: Arc<Core>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("host", &format_args!("{}:{}", self.host_address, self.host_port))
            .field("started", &self.is_started())
            .field("associations", &*self.associations.lock())
            .finish()
    }
}

impl Server {
    pub(crate) fn new(name: &str, host_address: &str, host_port: u16, core: Arc<Core>) -> Self {
        Self {
            name: name.to_string(),
            host_address: host_address.to_string(),
            host_port,
            started: AtomicBool::new(false),
            associations: Mutex::new(Vec::new()),
            token: Mutex::new(None),
            core,
        }
    }

    pub(crate) fn from_record(record: &ServerRecord, core: Arc<Core>) -> Self {
        let server = Self::new(&record.name, &record.host_address, record.host_port, core);
        for name in &record.associations {
            server.link(name);
        }
        server
    }

    pub(crate) fn to_record(&self) -> ServerRecord {
        ServerRecord {
            name: self.name.clone(),
            host_address: self.host_address.clone(),
            host_port: self.host_port,
            started: self.is_started(),
            associations: self.association_names(),
        }
    }

    /// Unique server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound address
    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    /// Bound port
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Whether the listening socket is open
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Names of the associations owned by this server, in link order
    pub fn association_names(&self) -> Vec<String> {
        self.associations.lock().clone()
    }

    pub(crate) fn binds(&self, host_address: &str, host_port: u16) -> bool {
        self.host_port == host_port && self.host_address == host_address
    }

    pub(crate) fn link(&self, association: &str) {
        let mut names = self.associations.lock();
        if !names.iter().any(|n| n == association) {
            names.push(association.to_string());
        }
    }

    pub(crate) fn unlink(&self, association: &str) {
        self.associations.lock().retain(|n| n != association);
    }

    /// Bind the listener now; registration happens on the next loop drain
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let mut token = self.token.lock();
        if self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Server name={} already started",
                self.name
            )));
        }

        let socket = transport::listen(&self.host_address, self.host_port)?;
        let registration = self.core.changes.next_token();
        *token = Some(registration);
        self.started.store(true, Ordering::SeqCst);
        self.core.changes.submit(ChangeRequest::register(
            registration,
            Channel::Listener {
                server: self.clone(),
                socket,
            },
            Interest::READABLE,
        ));

        info!(server = %self.name, host = %self.host_address, port = self.host_port, "Server started");
        Ok(())
    }

    /// Mark the server stopped and ask the loop to drop the listener; the
    /// returned handle resolves once the port is free again
    pub(crate) fn stop(&self) -> Result<Option<CloseAck>> {
        let mut token = self.token.lock();
        if !self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Server name={} is not started",
                self.name
            )));
        }

        self.started.store(false, Ordering::SeqCst);
        let closed = token.take().map(|registration| {
            let (request, closed) = ChangeRequest::close_acked(registration);
            self.core.changes.submit(request);
            closed
        });
        info!(server = %self.name, "Server stopped");
        Ok(closed)
    }

    pub(crate) fn halt(&self) {
        let mut token = self.token.lock();
        self.started.store(false, Ordering::SeqCst);
        *token = None;
    }

    pub(crate) fn owns(&self, registration: Token) -> bool {
        self.is_started() && *self.token.lock() == Some(registration)
    }
}
