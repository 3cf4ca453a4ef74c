//! Channel framing
//!
//! Every message on an association channel is a frame: a fixed 12-byte
//! header followed by `length` payload bytes. All integers are big-endian.
//!
//! ```text
//! 0        1        2                 4                 8                12
//! +--------+--------+--------+--------+--------+--------+--------+--------+---
//! |  kind  | flags  |    stream_id    |          ppid   |     length      | payload...
//! +--------+--------+--------+--------+--------+--------+--------+--------+---
//! ```
//!
//! Decoding is incremental: [`Frame::decode`] consumes a frame from the front
//! of a receive buffer only once the whole frame is present.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::trace;

use super::PayloadData;

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest payload a single frame may carry (1 MiB)
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Flag bit marking an unordered data frame
pub const FLAG_UNORDERED: u8 = 0x01;

/// Frame type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Application payload, delivered to the association listener
    Data = 0,
    /// Liveness check, answered inline by the selector thread
    Heartbeat = 1,
    /// Answer to a heartbeat, consumed inline
    HeartbeatAck = 2,
}

impl FrameKind {
    /// Whether frames of this kind are handled on the selector thread
    pub fn is_control(self) -> bool {
        !matches!(self, FrameKind::Data)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Heartbeat),
            2 => Ok(FrameKind::HeartbeatAck),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Framing errors; any of these means the channel is unusable
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Header announced a frame type this codec does not know
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
    /// Header announced a payload larger than [`MAX_FRAME_PAYLOAD`]
    #[error("Frame payload too large: {0} bytes")]
    Oversize(usize),
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub kind: FrameKind,
    /// Flag bits (see [`FLAG_UNORDERED`])
    pub flags: u8,
    /// Stream the frame belongs to
    pub stream_id: u16,
    /// Payload protocol identifier
    pub ppid: u32,
    /// Frame body
    pub payload: Bytes,
}

impl Frame {
    /// Data frame carrying an application payload
    pub fn data(payload: &PayloadData) -> Self {
        Self {
            kind: FrameKind::Data,
            flags: if payload.is_unordered() { FLAG_UNORDERED } else { 0 },
            stream_id: payload.stream_id(),
            ppid: payload.ppid(),
            payload: payload.data().clone(),
        }
    }

    /// Heartbeat request with an opaque body echoed back by the peer
    pub fn heartbeat(body: Bytes) -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            flags: 0,
            stream_id: 0,
            ppid: 0,
            payload: body,
        }
    }

    /// Acknowledgement for `request`, carrying the same body
    pub fn heartbeat_ack(request: &Frame) -> Self {
        Self {
            kind: FrameKind::HeartbeatAck,
            flags: 0,
            stream_id: 0,
            ppid: 0,
            payload: request.payload.clone(),
        }
    }

    /// Convert a data frame into the payload handed to listeners
    pub fn into_payload(self) -> PayloadData {
        PayloadData::new(self.stream_id, self.ppid, self.payload)
            .with_unordered(self.flags & FLAG_UNORDERED != 0)
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.flags);
        dst.put_u16(self.stream_id);
        dst.put_u32(self.ppid);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        trace!(kind = ?self.kind, len = self.payload.len(), "encoded frame");
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the frame is still
    /// incomplete. Header errors are reported as soon as the header is in.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = FrameKind::try_from(src[0])?;
        let length = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversize(length));
        }
        if src.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }

        let mut header = src.split_to(FRAME_HEADER_LEN);
        header.advance(1);
        let flags = header.get_u8();
        let stream_id = header.get_u16();
        let ppid = header.get_u32();
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            kind,
            flags,
            stream_id,
            ppid,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_decode() {
        let payload = PayloadData::new(3, 60, Bytes::from_static(b"NGAP message")).with_unordered(true);
        let mut buf = BytesMut::new();
        Frame::data(&payload).encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN + 12);

        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.into_payload(), payload);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let encoded = Frame::heartbeat(Bytes::from_static(b"ping")).to_bytes();

        let mut buf = BytesMut::from(&encoded[..5]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&encoded[5..14]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[14..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Heartbeat);
        assert_eq!(&frame.payload[..], b"ping");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        for i in 0..3u16 {
            let payload = PayloadData::new(i, 0, Bytes::from(vec![i as u8; 4]));
            Frame::data(&payload).encode(&mut buf);
        }

        let mut streams = Vec::new();
        while let Some(frame) = Frame::decode(&mut buf).unwrap() {
            streams.push(frame.stream_id);
        }
        assert_eq!(streams, vec![0, 1, 2]);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);
        assert_eq!(
            Frame::decode(&mut buf),
            Err(FrameError::Oversize(MAX_FRAME_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::from(&[0x7fu8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0][..]);
        assert_eq!(Frame::decode(&mut buf), Err(FrameError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_heartbeat_ack_echoes_body() {
        let request = Frame::heartbeat(Bytes::from_static(b"\x00\x01\x02"));
        let ack = Frame::heartbeat_ack(&request);
        assert_eq!(ack.kind, FrameKind::HeartbeatAck);
        assert_eq!(ack.payload, request.payload);
        assert!(ack.kind.is_control());
        assert!(!FrameKind::Data.is_control());
    }
}
