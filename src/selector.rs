//! Selector loop - the single thread that owns the multiplexer
//!
//! Each iteration drains the [`ChangeQueue`](crate::change::ChangeQueue) and
//! applies every request to the registry, blocks in [`Poll::poll`], fires due
//! reconnect timers and finally services ready channels. Nothing else ever
//! touches the registry. Listener callbacks leave the loop through the
//! [`Dispatcher`], tagged with the association's pinned worker.

use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::RwLock;
use socket2::SockRef;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::association::{Association, AssociationEvent, AssociationType, LossOutcome};
use crate::change::{ChangeKind, ChangeRequest, WAKE_TOKEN};
use crate::logging::hex_preview;
use crate::management::{Core, Tables};
use crate::protocol::{Frame, FrameKind};
use crate::server::Server;
use crate::transport::{self, Channel, ConnectProgress};
use crate::worker::Dispatcher;

/// Longest block while reconnect timers are pending
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

const EVENTS_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Lifecycle of the selector thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Servicing channels
    Running = 0,
    /// Asked to exit; closes every channel on its way out
    Stopping = 1,
    /// Not running
    Stopped = 2,
}

/// Atomically shared [`LoopState`]
#[derive(Debug)]
pub(crate) struct LoopStateCell(AtomicU8);

impl LoopStateCell {
    pub(crate) fn new(state: LoopState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> LoopState {
        match self.0.load(Ordering::SeqCst) {
            0 => LoopState::Running,
            1 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

enum Source {
    Listener {
        server: Arc<Server>,
        socket: TcpListener,
    },
    Stream {
        association: Arc<Association>,
        socket: TcpStream,
        connected: bool,
        inbound: BytesMut,
    },
}

struct Registration {
    source: Source,
    interest: Interest,
}

struct ReconnectTimer {
    deadline_ms: u64,
    seq: u64,
    association: Arc<Association>,
    generation: u64,
}

impl PartialEq for ReconnectTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for ReconnectTimer {}

impl PartialOrd for ReconnectTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReconnectTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline_ms, self.seq).cmp(&(other.deadline_ms, other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
    failed: bool,
}

enum ReadyKind {
    Accept,
    Connect,
    Io,
}

pub(crate) struct SelectorThread {
    poll: Poll,
    events: Events,
    core: Arc<Core>,
    tables: Arc<RwLock<Tables>>,
    dispatcher: Arc<dyn Dispatcher>,
    state: Arc<LoopStateCell>,
    registrations: HashMap<Token, Registration>,
    timers: BinaryHeap<Reverse<ReconnectTimer>>,
    timer_seq: u64,
    read_buf: Vec<u8>,
}

impl SelectorThread {
    pub(crate) fn new(
        poll: Poll,
        core: Arc<Core>,
        tables: Arc<RwLock<Tables>>,
        dispatcher: Arc<dyn Dispatcher>,
        state: Arc<LoopStateCell>,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            core,
            tables,
            dispatcher,
            state,
            registrations: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            read_buf: vec![0; READ_CHUNK],
        }
    }

    pub(crate) fn run(mut self) {
        info!("Selector loop running");
        self.core.set_loop_thread(Some(std::thread::current().id()));

        while self.state.get() == LoopState::Running {
            self.core.metrics.record_loop_iteration();
            self.apply_changes();

            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Selector poll failed: {}", e);
                break;
            }
            if self.state.get() != LoopState::Running {
                break;
            }

            self.fire_timers();

            let ready: Vec<Readiness> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| Readiness {
                    token: event.token(),
                    readable: event.is_readable() || event.is_read_closed(),
                    writable: event.is_writable(),
                    failed: event.is_error() || event.is_write_closed(),
                })
                .collect();
            for readiness in ready {
                self.handle_ready(readiness);
            }
        }

        self.shutdown();
        self.core.set_loop_thread(None);
        self.state.set(LoopState::Stopped);
        info!("Selector loop stopped");
    }

    fn apply_changes(&mut self) {
        for ChangeRequest { token, kind } in self.core.changes.drain() {
            self.core.metrics.record_change_applied();
            match kind {
                ChangeKind::Register { channel, interest } => self.register(token, channel, interest),
                ChangeKind::Connect {
                    association,
                    generation,
                } => self.connect(token, association, generation),
                ChangeKind::ChangeOps { interest } => self.change_ops(token, interest),
                ChangeKind::Close { done } => {
                    self.close(token);
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
            }
        }
    }

    fn register(&mut self, token: Token, channel: Channel, interest: Interest) {
        match channel {
            Channel::Listener { server, mut socket } => {
                if !server.owns(token) {
                    debug!(server = %server.name(), "Listener for stopped server dropped");
                    return;
                }
                if let Err(e) = self.poll.registry().register(&mut socket, token, interest) {
                    error!(server = %server.name(), "Failed to register listener: {}", e);
                    return;
                }
                debug!(server = %server.name(), token = token.0, "Listener registered");
                self.registrations.insert(
                    token,
                    Registration {
                        source: Source::Listener { server, socket },
                        interest,
                    },
                );
            }
            Channel::Stream {
                association,
                mut socket,
            } => {
                if !association.owns(token) {
                    debug!(association = %association.name(), "Accepted channel for stopped association dropped");
                    return;
                }
                if let Err(e) = self.poll.registry().register(&mut socket, token, interest) {
                    warn!(association = %association.name(), "Failed to register accepted channel: {}", e);
                    association.channel_lost(token);
                    return;
                }
                if !association.establish(token) {
                    let _ = self.poll.registry().deregister(&mut socket);
                    return;
                }

                self.registrations.insert(
                    token,
                    Registration {
                        source: Source::Stream {
                            association: association.clone(),
                            socket,
                            connected: true,
                            inbound: BytesMut::new(),
                        },
                        interest,
                    },
                );
                self.core.metrics.record_association_up();
                info!(association = %association.name(), "Association up");
                self.dispatch(&association, AssociationEvent::Up);
            }
        }
    }

    fn connect(&mut self, token: Token, association: Arc<Association>, generation: u64) {
        if !association.is_current(token, generation) {
            debug!(association = %association.name(), generation, "Stale connect request dropped");
            return;
        }

        let opened = transport::connect(
            association.host_address(),
            association.host_port(),
            association.peer_address(),
            association.peer_port(),
        );
        let mut socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                warn!(association = %association.name(), "Connect failed: {}", e);
                self.connect_failed(token, &association);
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(&mut socket, token, Interest::WRITABLE) {
            warn!(association = %association.name(), "Failed to register connecting channel: {}", e);
            self.connect_failed(token, &association);
            return;
        }

        debug!(association = %association.name(), token = token.0, "Connect in progress");
        self.registrations.insert(
            token,
            Registration {
                source: Source::Stream {
                    association,
                    socket,
                    connected: false,
                    inbound: BytesMut::new(),
                },
                interest: Interest::WRITABLE,
            },
        );
    }

    fn change_ops(&mut self, token: Token, interest: Interest) {
        let Some(registration) = self.registrations.get_mut(&token) else {
            trace!(token = token.0, "Interest change for closed channel ignored");
            return;
        };

        let result = match &mut registration.source {
            Source::Listener { socket, .. } => {
                self.poll.registry().reregister(socket, token, interest).map(|_| interest)
            }
            Source::Stream {
                association,
                socket,
                connected,
                ..
            } => {
                let mut interest = interest;
                if !*connected || association.has_outbound() {
                    interest = interest.add(Interest::WRITABLE);
                }
                self.poll.registry().reregister(socket, token, interest).map(|_| interest)
            }
        };

        match result {
            Ok(interest) => {
                trace!(token = token.0, previous = ?registration.interest, current = ?interest, "Interest changed");
                registration.interest = interest;
            }
            Err(e) => {
                warn!(token = token.0, "Failed to change interest: {}", e);
                self.lose(token, e.to_string());
            }
        }
    }

    fn close(&mut self, token: Token) {
        match self.registrations.remove(&token) {
            Some(registration) => self.release(token, registration),
            None => trace!(token = token.0, "Close for unknown channel ignored"),
        }
    }

    fn release(&mut self, token: Token, mut registration: Registration) {
        let result = match &mut registration.source {
            Source::Listener { socket, .. } => self.poll.registry().deregister(socket),
            Source::Stream {
                association, socket, ..
            } => {
                // A client reuses its fixed local endpoint on restart, so
                // close with RST and leave no TIME_WAIT behind
                if association.association_type() == AssociationType::Client {
                    if let Err(e) = SockRef::from(&*socket).set_linger(Some(Duration::ZERO)) {
                        debug!(association = %association.name(), "Failed to set SO_LINGER: {}", e);
                    }
                }
                self.poll.registry().deregister(socket)
            }
        };
        if let Err(e) = result {
            debug!(token = token.0, "Deregister failed: {}", e);
        }

        match registration.source {
            Source::Listener { server, .. } => {
                debug!(server = %server.name(), "Listener closed");
            }
            Source::Stream {
                association,
                connected: true,
                ..
            } => {
                self.core.metrics.record_association_down();
                info!(association = %association.name(), "Association down");
                self.dispatch(&association, AssociationEvent::Down);
            }
            Source::Stream { association, .. } => {
                debug!(association = %association.name(), "Pending connect abandoned");
            }
        }
    }

    fn handle_ready(&mut self, readiness: Readiness) {
        let kind = match self.registrations.get(&readiness.token) {
            Some(Registration {
                source: Source::Listener { .. },
                ..
            }) => ReadyKind::Accept,
            Some(Registration {
                source: Source::Stream { connected: false, .. },
                ..
            }) => ReadyKind::Connect,
            Some(_) => ReadyKind::Io,
            None => return,
        };

        match kind {
            ReadyKind::Accept => self.accept_all(readiness.token),
            ReadyKind::Connect => self.finish_connect(readiness.token),
            ReadyKind::Io => {
                if readiness.readable || readiness.failed {
                    self.read_ready(readiness.token);
                }
                if readiness.writable && self.registrations.contains_key(&readiness.token) {
                    self.write_ready(readiness.token);
                }
            }
        }
    }

    fn accept_all(&mut self, token: Token) {
        loop {
            let (accepted, server) = match self.registrations.get(&token) {
                Some(Registration {
                    source: Source::Listener { server, socket },
                    ..
                }) => (socket.accept(), server.clone()),
                _ => return,
            };

            match accepted {
                Ok((stream, peer)) => self.adopt(&server, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(server = %server.name(), "Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn adopt(&mut self, server: &Arc<Server>, stream: TcpStream, peer: SocketAddr) {
        let candidate = {
            let tables = self.tables.read();
            let names = server.association_names();
            let found = names
                .iter()
                .filter_map(|name| tables.associations.get(name))
                .find(|a| a.is_started() && transport::matches_endpoint(peer, a.peer_address(), a.peer_port()))
                .cloned();
            found
        };

        let Some(association) = candidate else {
            warn!(server = %server.name(), %peer, "No started association matches peer, connection closed");
            self.core.metrics.record_accept_rejected();
            return;
        };
        let Some(token) = association.attach() else {
            warn!(association = %association.name(), %peer, "Association already has a channel, connection closed");
            self.core.metrics.record_accept_rejected();
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(association = %association.name(), "Failed to set TCP_NODELAY: {}", e);
        }
        debug!(association = %association.name(), %peer, "Peer accepted");
        self.core.changes.enqueue(ChangeRequest::register(
            token,
            Channel::Stream {
                association,
                socket: stream,
            },
            Interest::READABLE,
        ));
    }

    fn finish_connect(&mut self, token: Token) {
        let progress = match self.registrations.get(&token) {
            Some(Registration {
                source: Source::Stream { socket, .. },
                ..
            }) => transport::connect_progress(socket),
            _ => return,
        };

        match progress {
            ConnectProgress::Pending => {}
            ConnectProgress::Connected => {
                let Some(Registration {
                    source:
                        Source::Stream {
                            association,
                            connected,
                            ..
                        },
                    ..
                }) = self.registrations.get_mut(&token)
                else {
                    return;
                };
                // A stop already queued the close for this token
                if !association.establish(token) {
                    return;
                }
                *connected = true;
                let association = association.clone();

                self.core.metrics.record_association_up();
                info!(association = %association.name(), "Association up");
                self.core
                    .changes
                    .enqueue(ChangeRequest::change_ops(token, Interest::READABLE));
                self.dispatch(&association, AssociationEvent::Up);
            }
            ConnectProgress::Failed(e) => {
                let Some(mut registration) = self.registrations.remove(&token) else {
                    return;
                };
                if let Source::Stream {
                    association, socket, ..
                } = &mut registration.source
                {
                    let _ = self.poll.registry().deregister(socket);
                    warn!(association = %association.name(), "Connect failed: {}", e);
                    let association = association.clone();
                    self.connect_failed(token, &association);
                }
            }
        }
    }

    fn connect_failed(&mut self, token: Token, association: &Arc<Association>) {
        self.core.metrics.record_connect_failure();
        if let LossOutcome::Reconnect(generation) = association.channel_lost(token) {
            self.schedule_reconnect(association.clone(), generation);
        }
    }

    fn read_ready(&mut self, token: Token) {
        let metrics = &self.core.metrics;
        let read_buf = &mut self.read_buf;
        let Some(Registration {
            source:
                Source::Stream {
                    association,
                    socket,
                    inbound,
                    ..
                },
            ..
        }) = self.registrations.get_mut(&token)
        else {
            return;
        };

        let mut lost = None;
        loop {
            match socket.read(&mut read_buf[..]) {
                Ok(0) => {
                    lost = Some("peer closed the channel".to_string());
                    break;
                }
                Ok(n) => {
                    inbound.extend_from_slice(&read_buf[..n]);
                    metrics.record_bytes_received(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match Frame::decode(inbound) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }
        let association = association.clone();

        for frame in frames {
            self.handle_frame(token, &association, frame);
        }
        if let Some(reason) = lost {
            self.lose(token, reason);
        }
    }

    fn handle_frame(&mut self, token: Token, association: &Arc<Association>, frame: Frame) {
        self.core.metrics.record_frame_received();
        match frame.kind {
            FrameKind::Data => {
                trace!(
                    association = %association.name(),
                    stream_id = frame.stream_id,
                    ppid = frame.ppid,
                    len = frame.payload.len(),
                    data = %hex_preview(&frame.payload, 16),
                    "Data frame"
                );
                self.dispatch(association, AssociationEvent::Data(frame.into_payload()));
            }
            FrameKind::Heartbeat => {
                self.core.metrics.record_control_frame();
                association.queue_frame(&Frame::heartbeat_ack(&frame));
                self.core.metrics.record_frame_sent();
                self.core.changes.enqueue(ChangeRequest::change_ops(
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ));
            }
            FrameKind::HeartbeatAck => {
                self.core.metrics.record_control_frame();
                trace!(association = %association.name(), "Heartbeat acknowledged");
            }
        }
    }

    fn write_ready(&mut self, token: Token) {
        let metrics = &self.core.metrics;
        let Some(Registration {
            source:
                Source::Stream {
                    association,
                    socket,
                    connected: true,
                    ..
                },
            ..
        }) = self.registrations.get_mut(&token)
        else {
            return;
        };

        let mut pending = association.take_outbound();
        let mut lost = None;
        while !pending.is_empty() {
            match socket.write(&pending) {
                Ok(0) => {
                    lost = Some("channel refused further writes".to_string());
                    break;
                }
                Ok(n) => {
                    pending.advance(n);
                    metrics.record_bytes_sent(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    lost = Some(e.to_string());
                    break;
                }
            }
        }

        let flushed = pending.is_empty();
        if !flushed {
            association.restore_outbound(pending);
        }
        let association = association.clone();

        if let Some(reason) = lost {
            self.lose(token, reason);
        } else if flushed && !association.has_outbound() {
            self.core
                .changes
                .enqueue(ChangeRequest::change_ops(token, Interest::READABLE));
        }
    }

    fn lose(&mut self, token: Token, reason: String) {
        let Some(mut registration) = self.registrations.remove(&token) else {
            return;
        };
        let result = match &mut registration.source {
            Source::Listener { socket, .. } => self.poll.registry().deregister(socket),
            Source::Stream { socket, .. } => self.poll.registry().deregister(socket),
        };
        if let Err(e) = result {
            debug!(token = token.0, "Deregister failed: {}", e);
        }

        let Source::Stream {
            association,
            connected,
            ..
        } = registration.source
        else {
            return;
        };

        match association.channel_lost(token) {
            LossOutcome::Stale => {
                // Stopped while the channel was up; the queued close finds nothing
                if connected {
                    self.core.metrics.record_association_down();
                    self.dispatch(&association, AssociationEvent::Down);
                }
            }
            outcome => {
                self.core.metrics.record_communication_lost();
                warn!(association = %association.name(), %reason, "Communication lost");
                // Timer goes in first so listeners observe a pending reconnect
                if let LossOutcome::Reconnect(generation) = outcome {
                    self.schedule_reconnect(association.clone(), generation);
                }
                if connected {
                    self.dispatch(&association, AssociationEvent::CommunicationLost);
                }
            }
        }
    }

    fn schedule_reconnect(&mut self, association: Arc<Association>, generation: u64) {
        let delay_ms = self.core.connect_delay_ms();
        let deadline_ms = self.core.clock.now_ms().saturating_add(delay_ms);
        self.timer_seq += 1;
        info!(association = %association.name(), delay_ms, "Reconnect scheduled");
        self.timers.push(Reverse(ReconnectTimer {
            deadline_ms,
            seq: self.timer_seq,
            association,
            generation,
        }));
        self.core.metrics.record_reconnect_scheduled();
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let Reverse(next) = self.timers.peek()?;
        let wait = next.deadline_ms.saturating_sub(self.core.clock.now_ms());
        Some(Duration::from_millis(wait).min(MAX_POLL_INTERVAL))
    }

    fn fire_timers(&mut self) {
        let now = self.core.clock.now_ms();
        while self
            .timers
            .peek()
            .map_or(false, |Reverse(timer)| timer.deadline_ms <= now)
        {
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            match timer.association.begin_reconnect(timer.generation) {
                Some(token) => {
                    debug!(association = %timer.association.name(), "Reconnecting");
                    self.core.changes.enqueue(ChangeRequest::connect(
                        token,
                        timer.association,
                        timer.generation,
                    ));
                }
                None => {
                    trace!(association = %timer.association.name(), "Stale reconnect timer ignored");
                }
            }
        }
    }

    fn dispatch(&self, association: &Arc<Association>, event: AssociationEvent) {
        let worker = association.worker();
        let association = association.clone();
        self.dispatcher
            .dispatch(worker, Box::new(move || association.notify(event)));
    }

    fn shutdown(&mut self) {
        let registrations: Vec<_> = self.registrations.drain().collect();
        debug!(channels = registrations.len(), "Closing channels");
        for (token, registration) in registrations {
            self.release(token, registration);
        }
        self.timers.clear();
    }
}
