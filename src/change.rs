//! Registration change queue
//!
//! Any thread may ask the selector loop to alter what it watches, but only
//! the loop thread touches the multiplexer. Requests are pushed onto a
//! lock-free MPSC queue and the loop is woken through a [`mio::Waker`]; it
//! drains the queue before every block on the multiplexer.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::SegQueue;
use mio::{Interest, Token, Waker};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::association::Association;
use crate::transport::Channel;

/// Token reserved for the queue's waker
pub const WAKE_TOKEN: Token = Token(0);

/// What the loop should do with the target token
#[derive(Debug)]
pub enum ChangeKind {
    /// Adopt `channel` and register it with `interest`
    Register {
        /// Socket and owning entity
        channel: Channel,
        /// Initial interest set
        interest: Interest,
    },
    /// Open a client channel and register it for connect completion.
    ///
    /// `generation` is the association's start generation when the request
    /// was made; the loop drops the request if the association has since
    /// been stopped or restarted.
    Connect {
        /// Client association to connect
        association: Arc<Association>,
        /// Start generation the request belongs to
        generation: u64,
    },
    /// Re-register the channel with a new interest set
    ChangeOps {
        /// Replacement interest set
        interest: Interest,
    },
    /// Deregister and close the channel
    Close {
        /// Signalled once the socket has been dropped
        done: Option<Sender<()>>,
    },
}

/// One pending interest-set mutation
#[derive(Debug)]
pub struct ChangeRequest {
    /// Registry token of the target channel
    pub token: Token,
    /// Mutation to apply
    pub kind: ChangeKind,
}

impl ChangeRequest {
    /// Register a freshly opened channel
    pub fn register(token: Token, channel: Channel, interest: Interest) -> Self {
        Self {
            token,
            kind: ChangeKind::Register { channel, interest },
        }
    }

    /// Connect a client association
    pub fn connect(token: Token, association: Arc<Association>, generation: u64) -> Self {
        Self {
            token,
            kind: ChangeKind::Connect {
                association,
                generation,
            },
        }
    }

    /// Replace the interest set of a registered channel
    pub fn change_ops(token: Token, interest: Interest) -> Self {
        Self {
            token,
            kind: ChangeKind::ChangeOps { interest },
        }
    }

    /// Close a channel
    pub fn close(token: Token) -> Self {
        Self {
            token,
            kind: ChangeKind::Close { done: None },
        }
    }

    /// Close a channel and get a handle that resolves once the socket is gone
    pub fn close_acked(token: Token) -> (Self, CloseAck) {
        let (done, rx) = bounded(1);
        let request = Self {
            token,
            kind: ChangeKind::Close { done: Some(done) },
        };
        (request, CloseAck(rx))
    }
}

/// Completion of a [`ChangeRequest::close_acked`] request.
///
/// Resolves when the loop has closed the socket, or when the request is
/// discarded unapplied because the loop shut down.
#[derive(Debug)]
pub struct CloseAck(Receiver<()>);

impl CloseAck {
    /// Block until the socket is closed; `false` if `timeout` ran out first
    pub fn wait(self, timeout: Duration) -> bool {
        match self.0.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// MPSC queue of [`ChangeRequest`]s plus the waker of the loop consuming it
pub struct ChangeQueue {
    pending: SegQueue<ChangeRequest>,
    waker: RwLock<Option<Arc<Waker>>>,
    next_token: AtomicUsize,
}

impl ChangeQueue {
    /// Empty queue with no loop attached
    pub fn new() -> Self {
        Self {
            pending: SegQueue::new(),
            waker: RwLock::new(None),
            // Token(0) belongs to the waker
            next_token: AtomicUsize::new(1),
        }
    }

    /// Allocate a registry token; tokens are never reused
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a request and wake the loop
    pub fn submit(&self, request: ChangeRequest) {
        trace!(token = request.token.0, "change request submitted");
        self.pending.push(request);
        self.wakeup();
    }

    /// Queue a request without waking; for use on the loop thread itself,
    /// which drains again before its next block
    pub fn enqueue(&self, request: ChangeRequest) {
        self.pending.push(request);
    }

    /// Take every request queued at the moment of the call, in FIFO order.
    ///
    /// Requests pushed while draining are left for the next cycle.
    pub fn drain(&self) -> Vec<ChangeRequest> {
        let count = self.pending.len();
        let mut drained = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pending.pop() {
                Some(request) => drained.push(request),
                None => break,
            }
        }
        drained
    }

    /// Wake the loop if one is attached
    pub fn wakeup(&self) {
        if let Some(waker) = self.waker.read().as_ref() {
            if let Err(e) = waker.wake() {
                warn!("Failed to wake selector: {}", e);
            }
        }
    }

    /// Attach the waker of a newly created loop
    pub fn install_waker(&self, waker: Arc<Waker>) {
        *self.waker.write() = Some(waker);
    }

    /// Detach the waker once the loop has exited
    pub fn reset(&self) {
        *self.waker.write() = None;
    }

    /// Drop every pending request
    pub fn clear(&self) {
        while self.pending.pop().is_some() {}
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::time::Duration;

    #[test]
    fn test_tokens_skip_waker() {
        let queue = ChangeQueue::new();
        assert_eq!(queue.next_token(), Token(1));
        assert_eq!(queue.next_token(), Token(2));
    }

    #[test]
    fn test_drain_is_fifo() {
        let queue = ChangeQueue::new();
        queue.enqueue(ChangeRequest::close(Token(3)));
        queue.enqueue(ChangeRequest::change_ops(Token(4), Interest::READABLE));
        queue.enqueue(ChangeRequest::close(Token(5)));
        assert_eq!(queue.len(), 3);

        let tokens: Vec<_> = queue.drain().into_iter().map(|r| r.token).collect();
        assert_eq!(tokens, vec![Token(3), Token(4), Token(5)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_close_ack_resolves() {
        let (request, ack) = ChangeRequest::close_acked(Token(9));
        let ChangeKind::Close { done: Some(done) } = request.kind else {
            panic!("close request without completion");
        };
        done.send(()).unwrap();
        assert!(ack.wait(Duration::from_millis(10)));

        // A request dropped unapplied still releases the waiter
        let queue = ChangeQueue::new();
        let (request, ack) = ChangeRequest::close_acked(Token(10));
        queue.enqueue(request);
        queue.clear();
        assert!(ack.wait(Duration::from_secs(1)));

        let (_request, ack) = ChangeRequest::close_acked(Token(11));
        assert!(!ack.wait(Duration::from_millis(20)));
    }

    #[test]
    fn test_submit_wakes_blocked_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).unwrap());
        let queue = Arc::new(ChangeQueue::new());
        queue.install_waker(waker);

        let submitter = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                queue.submit(ChangeRequest::close(Token(7)));
            })
        };

        let mut events = Events::with_capacity(8);
        // Without the wake this would block for the full timeout
        poll.poll(&mut events, Some(Duration::from_secs(10))).unwrap();
        assert!(events.iter().any(|e| e.token() == WAKE_TOKEN));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].token, Token(7));
        submitter.join().unwrap();
    }
}
