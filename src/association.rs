//! Associations - one peer relationship each, client- or server-owned
//!
//! An [`Association`] holds its configuration plus a small runtime record
//! guarded by one mutex: lifecycle state, the registry token of its current
//! channel, the pinned worker index and a start generation. The selector
//! loop and the control surface both go through that mutex, so a stop racing
//! an accept or a reconnect is decided in one place.

use bytes::BytesMut;
use mio::{Interest, Token};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::change::ChangeRequest;
use crate::error::{ManagementError, Result};
use crate::management::Core;
use crate::persistence::AssociationRecord;
use crate::protocol::{Frame, PayloadData, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};

/// Unsent bytes an association may hold before [`Association::send`] refuses more
pub const MAX_OUTBOUND_BYTES: usize = 16 * 1024 * 1024;

/// Which side opened the association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssociationType {
    /// Connects out to its peer
    Client,
    /// Accepted by a [`Server`](crate::Server)
    Server,
}

impl fmt::Display for AssociationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociationType::Client => write!(f, "CLIENT"),
            AssociationType::Server => write!(f, "SERVER"),
        }
    }
}

/// Runtime state of an association's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssociationState {
    /// Not started, or halted with the management loop
    Stopped,
    /// Client connect in flight
    Connecting,
    /// Client waiting out the connect delay after a loss or failure
    Reconnecting,
    /// Server association started, no matching peer accepted yet
    AwaitingPeer,
    /// Channel up and exchanging data
    Established,
}

/// Callbacks delivered on the association's pinned worker, in FIFO order
pub trait AssociationListener: Send + Sync {
    /// Channel established
    fn on_association_up(&self, association: &Association);

    /// Channel closed by a stop or by management shutdown
    fn on_association_down(&self, association: &Association);

    /// Channel lost (EOF, read error or framing error)
    fn on_communication_lost(&self, association: &Association);

    /// Data frame received
    fn on_data_arrived(&self, association: &Association, payload: PayloadData);
}

/// Event handed to an [`AssociationListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationEvent {
    /// See [`AssociationListener::on_association_up`]
    Up,
    /// See [`AssociationListener::on_association_down`]
    Down,
    /// See [`AssociationListener::on_communication_lost`]
    CommunicationLost,
    /// See [`AssociationListener::on_data_arrived`]
    Data(PayloadData),
}

/// What the loop must do after a channel was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LossOutcome {
    /// The token was stale; nothing to do
    Stale,
    /// Association is stopped or waits for its peer again
    Idle,
    /// Client must reconnect; carries the start generation
    Reconnect(u64),
}

#[derive(Debug)]
struct Runtime {
    state: AssociationState,
    token: Option<Token>,
    worker: usize,
    generation: u64,
}

/// A configured peer relationship and its channel state
pub struct Association {
    name: String,
    kind: AssociationType,
    host_address: String,
    host_port: u16,
    peer_address: String,
    peer_port: u16,
    server_name: Option<String>,
    started: AtomicBool,
    runtime: Mutex<Runtime>,
    outbound: Mutex<BytesMut>,
    listener: RwLock<Option<Arc<dyn AssociationListener>>>,
    core: Arc<Core>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("host", &format_args!("{}:{}", self.host_address, self.host_port))
            .field("peer", &format_args!("{}:{}", self.peer_address, self.peer_port))
            .field("server_name", &self.server_name)
            .field("started", &self.is_started())
            .field("state", &self.state())
            .finish()
    }
}

impl Association {
    pub(crate) fn client(
        name: &str,
        host_address: &str,
        host_port: u16,
        peer_address: &str,
        peer_port: u16,
        core: Arc<Core>,
    ) -> Self {
        Self::build(
            name,
            AssociationType::Client,
            host_address,
            host_port,
            peer_address,
            peer_port,
            None,
            core,
        )
    }

    pub(crate) fn server_side(
        name: &str,
        server_name: &str,
        host_address: &str,
        host_port: u16,
        peer_address: &str,
        peer_port: u16,
        core: Arc<Core>,
    ) -> Self {
        Self::build(
            name,
            AssociationType::Server,
            host_address,
            host_port,
            peer_address,
            peer_port,
            Some(server_name.to_string()),
            core,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: &str,
        kind: AssociationType,
        host_address: &str,
        host_port: u16,
        peer_address: &str,
        peer_port: u16,
        server_name: Option<String>,
        core: Arc<Core>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            host_address: host_address.to_string(),
            host_port,
            peer_address: peer_address.to_string(),
            peer_port,
            server_name,
            started: AtomicBool::new(false),
            runtime: Mutex::new(Runtime {
                state: AssociationState::Stopped,
                token: None,
                worker: 0,
                generation: 0,
            }),
            outbound: Mutex::new(BytesMut::new()),
            listener: RwLock::new(None),
            core,
        }
    }

    pub(crate) fn from_record(record: &AssociationRecord, core: Arc<Core>) -> Self {
        Self::build(
            &record.name,
            record.kind,
            &record.host_address,
            record.host_port,
            &record.peer_address,
            record.peer_port,
            record.server_name.clone(),
            core,
        )
    }

    pub(crate) fn to_record(&self) -> AssociationRecord {
        AssociationRecord {
            name: self.name.clone(),
            kind: self.kind,
            host_address: self.host_address.clone(),
            host_port: self.host_port,
            peer_address: self.peer_address.clone(),
            peer_port: self.peer_port,
            server_name: self.server_name.clone(),
            started: self.is_started(),
        }
    }

    /// Unique association name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Client or server side
    pub fn association_type(&self) -> AssociationType {
        self.kind
    }

    /// Local address
    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    /// Local port
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    /// Remote address
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Remote port
    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    /// Owning server, set only for server associations
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Configured intent: started by the control surface and not stopped since
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the channel is established
    pub fn is_up(&self) -> bool {
        self.state() == AssociationState::Established
    }

    /// Current runtime state
    pub fn state(&self) -> AssociationState {
        self.runtime.lock().state
    }

    /// Worker index callbacks are pinned to
    pub fn worker(&self) -> usize {
        self.runtime.lock().worker
    }

    /// Install the callback receiver
    pub fn set_listener(&self, listener: Arc<dyn AssociationListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the callback receiver; later events are dropped
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// Queue `payload` for transmission.
    ///
    /// Fails with [`ManagementError::Validation`] if the payload does not fit
    /// in one frame, and with [`ManagementError::Precondition`] unless the
    /// channel is up with room in its outbound queue.
    pub fn send(&self, payload: &PayloadData) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ManagementError::Validation(format!(
                "Association name={} payload of {} bytes exceeds the {} byte frame limit",
                self.name,
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }

        let runtime = self.runtime.lock();
        let token = match (runtime.state, runtime.token) {
            (AssociationState::Established, Some(token)) => token,
            _ => {
                return Err(ManagementError::Precondition(format!(
                    "Association name={} is not up",
                    self.name
                )))
            }
        };

        let mut outbound = self.outbound.lock();
        if outbound.len() + FRAME_HEADER_LEN + payload.len() > MAX_OUTBOUND_BYTES {
            return Err(ManagementError::Precondition(format!(
                "Association name={} has {} unsent bytes queued, peer is not reading",
                self.name,
                outbound.len()
            )));
        }
        Frame::data(payload).encode(&mut outbound);
        drop(outbound);
        self.core.metrics.record_frame_sent();
        self.core
            .changes
            .submit(ChangeRequest::change_ops(token, Interest::READABLE | Interest::WRITABLE));
        Ok(())
    }

    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Association name={} already started",
                self.name
            )));
        }

        runtime.generation += 1;
        runtime.worker = self.core.workers.assign(1).first().copied().unwrap_or(0);
        self.outbound.lock().clear();
        self.started.store(true, Ordering::SeqCst);

        match self.kind {
            AssociationType::Client => {
                let token = self.core.changes.next_token();
                runtime.state = AssociationState::Connecting;
                runtime.token = Some(token);
                self.core
                    .changes
                    .submit(ChangeRequest::connect(token, self.clone(), runtime.generation));
            }
            AssociationType::Server => {
                runtime.state = AssociationState::AwaitingPeer;
                runtime.token = None;
            }
        }

        info!(association = %self.name, kind = %self.kind, worker = runtime.worker, "Association started");
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if !self.is_started() {
            return Err(ManagementError::Precondition(format!(
                "Association name={} is not started",
                self.name
            )));
        }

        self.started.store(false, Ordering::SeqCst);
        runtime.state = AssociationState::Stopped;
        if let Some(token) = runtime.token.take() {
            self.core.changes.submit(ChangeRequest::close(token));
        }
        self.outbound.lock().clear();

        info!(association = %self.name, "Association stopped");
        Ok(())
    }

    /// Reset to stopped once the loop has exited; the persisted snapshot
    /// still records whether the association was started
    pub(crate) fn halt(&self) {
        let mut runtime = self.runtime.lock();
        self.started.store(false, Ordering::SeqCst);
        runtime.state = AssociationState::Stopped;
        runtime.token = None;
        self.outbound.lock().clear();
    }

    /// Whether a request issued for `generation` and `token` still applies
    pub(crate) fn is_current(&self, token: Token, generation: u64) -> bool {
        let runtime = self.runtime.lock();
        self.is_started() && runtime.generation == generation && runtime.token == Some(token)
    }

    /// Whether `token` is the association's live channel token
    pub(crate) fn owns(&self, token: Token) -> bool {
        self.is_started() && self.runtime.lock().token == Some(token)
    }

    /// Reserve a token for an accepted peer channel
    pub(crate) fn attach(&self) -> Option<Token> {
        let mut runtime = self.runtime.lock();
        if !self.is_started()
            || runtime.state != AssociationState::AwaitingPeer
            || runtime.token.is_some()
        {
            return None;
        }
        let token = self.core.changes.next_token();
        runtime.token = Some(token);
        Some(token)
    }

    /// Mark the channel for `token` established; false if the token is stale
    pub(crate) fn establish(&self, token: Token) -> bool {
        let mut runtime = self.runtime.lock();
        if !self.is_started() || runtime.token != Some(token) {
            return false;
        }
        runtime.state = AssociationState::Established;
        true
    }

    /// Record the loss of the channel for `token`
    pub(crate) fn channel_lost(&self, token: Token) -> LossOutcome {
        let mut runtime = self.runtime.lock();
        if runtime.token != Some(token) {
            return LossOutcome::Stale;
        }
        runtime.token = None;
        self.outbound.lock().clear();

        if !self.is_started() {
            runtime.state = AssociationState::Stopped;
            return LossOutcome::Idle;
        }
        match self.kind {
            AssociationType::Client => {
                runtime.state = AssociationState::Reconnecting;
                LossOutcome::Reconnect(runtime.generation)
            }
            AssociationType::Server => {
                runtime.state = AssociationState::AwaitingPeer;
                LossOutcome::Idle
            }
        }
    }

    /// Claim a fresh token for a reconnect attempt of `generation`
    pub(crate) fn begin_reconnect(&self, generation: u64) -> Option<Token> {
        let mut runtime = self.runtime.lock();
        if !self.is_started()
            || runtime.generation != generation
            || runtime.state != AssociationState::Reconnecting
        {
            return None;
        }
        let token = self.core.changes.next_token();
        runtime.state = AssociationState::Connecting;
        runtime.token = Some(token);
        Some(token)
    }

    /// Append an already encoded frame to the outbound queue
    pub(crate) fn queue_frame(&self, frame: &Frame) {
        frame.encode(&mut self.outbound.lock());
    }

    /// Take everything queued for transmission
    pub(crate) fn take_outbound(&self) -> BytesMut {
        self.outbound.lock().split()
    }

    /// Put back bytes a write could not flush, ahead of anything newer
    pub(crate) fn restore_outbound(&self, mut unsent: BytesMut) {
        let mut outbound = self.outbound.lock();
        unsent.unsplit(outbound.split());
        *outbound = unsent;
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.lock().is_empty()
    }

    /// Deliver `event` to the current listener
    pub(crate) fn notify(&self, event: AssociationEvent) {
        let listener = self.listener.read().clone();
        let Some(listener) = listener else {
            debug!(association = %self.name, ?event, "No listener, event dropped");
            return;
        };
        match event {
            AssociationEvent::Up => listener.on_association_up(self),
            AssociationEvent::Down => listener.on_association_down(self),
            AssociationEvent::CommunicationLost => listener.on_communication_lost(self),
            AssociationEvent::Data(payload) => listener.on_data_arrived(self, payload),
        }
    }
}
