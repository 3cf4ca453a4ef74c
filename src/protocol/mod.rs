//! Payload model and channel framing
//!
//! The management core treats the byte-level SCTP codec as a swappable
//! collaborator. This module holds the payload type exchanged with listeners
//! and the minimal frame codec used on association channels.

use bytes::Bytes;

pub mod frames;

pub use frames::{Frame, FrameError, FrameKind, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};

/// NGAP payload protocol identifier, handy default for telecom peers
pub const NGAP_PPID: u32 = 60;

/// One application message sent or received on an association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadData {
    stream_id: u16,
    ppid: u32,
    unordered: bool,
    data: Bytes,
}

impl PayloadData {
    /// Create an ordered payload for `stream_id`
    pub fn new(stream_id: u16, ppid: u32, data: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            ppid,
            unordered: false,
            data: data.into(),
        }
    }

    /// Mark the payload as unordered
    pub fn with_unordered(mut self, unordered: bool) -> Self {
        self.unordered = unordered;
        self
    }

    /// Stream the payload travels on
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Payload protocol identifier
    pub fn ppid(&self) -> u32 {
        self.ppid
    }

    /// Whether the sender asked for unordered delivery
    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    /// Payload bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload carries no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
