use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;

/// Set on the final frame of a direction; no further frames may follow it.
pub const FLAG_END_STREAM: u8 = 0x01;

/// Set when a HEADERS frame carries a complete header block.
pub const FLAG_END_HEADERS: u8 = 0x04;

/// The fixed prefix in front of every payload: type, flags, length.
const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    Ping = 0x6,
    Goaway = 0x7,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x0 => Some(Self::Data),
            0x1 => Some(Self::Headers),
            0x2 => Some(Self::Priority),
            0x3 => Some(Self::RstStream),
            0x4 => Some(Self::Settings),
            0x6 => Some(Self::Ping),
            0x7 => Some(Self::Goaway),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum FrameError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),

    #[error("frame payload of {got} bytes exceeds limit of {limit}")]
    Oversize { got: u32, limit: u32 },

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(Arc::new(err))
    }
}

/// A single frame inside a transport stream.
///
/// The codec is transport-neutral: QUIC writes frames straight onto a bidi
/// stream, the WebSocket adapter wraps each one in a substream envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: u8, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags,
            payload,
        }
    }

    pub fn data(payload: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        Self::new(FrameType::Data, flags, payload)
    }

    pub fn headers(block: Bytes, end_stream: bool) -> Self {
        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        Self::new(FrameType::Headers, flags, block)
    }

    /// A stream reset carrying the transport error code that caused it.
    pub fn rst_stream(code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(code);
        Self::new(FrameType::RstStream, 0, payload.freeze())
    }

    /// A keepalive probe with 8 opaque bytes the peer echoes back.
    pub fn ping(payload: [u8; 8]) -> Self {
        Self::new(FrameType::Ping, 0, Bytes::copy_from_slice(&payload))
    }

    pub fn goaway(last_stream_id: u32, code: u32) -> Self {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(last_stream_id);
        payload.put_u32(code);
        Self::new(FrameType::Goaway, 0, payload.freeze())
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    /// The error code inside a RST_STREAM payload, if well-formed.
    pub fn reset_code(&self) -> Option<u32> {
        if self.frame_type != FrameType::RstStream || self.payload.len() < 4 {
            return None;
        }
        let mut buf = self.payload.clone();
        Some(buf.get_u32())
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
    /// consuming nothing, so the caller can retry once more bytes arrive.
    /// The fixed header is peeked from the buffer's contiguous front, which
    /// holds for every buffer the adapters use (`Bytes`, `BytesMut`, cursors).
    pub fn decode<B: Buf>(buf: &mut B, max_frame_size: u32) -> Result<Option<Self>, FrameError> {
        let chunk = buf.chunk();
        if chunk.len() < HEADER_LEN {
            return Ok(None);
        }

        let typ = FrameType::from_u8(chunk[0]).ok_or(FrameError::UnknownType(chunk[0]))?;
        let flags = chunk[1];
        let length = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);

        let limit = max_frame_size.min(MAX_FRAME_SIZE);
        if length > limit {
            return Err(FrameError::Oversize { got: length, limit });
        }

        if buf.remaining() < HEADER_LEN + length as usize {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.copy_to_bytes(length as usize);

        Ok(Some(Self {
            frame_type: typ,
            flags,
            payload,
        }))
    }

    /// Read exactly one frame from a stream.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary.
    pub async fn read<S: AsyncRead + Unpin>(
        stream: &mut S,
        max_frame_size: u32,
    ) -> Result<Option<Self>, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }

        let typ = FrameType::from_u8(header[0]).ok_or(FrameError::UnknownType(header[0]))?;
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

        let limit = max_frame_size.min(MAX_FRAME_SIZE);
        if length > limit {
            return Err(FrameError::Oversize { got: length, limit });
        }

        let mut payload = vec![0u8; length as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|_| FrameError::UnexpectedEnd)?;

        Ok(Some(Self {
            frame_type: typ,
            flags: header[1],
            payload: Bytes::from(payload),
        }))
    }

    pub async fn write<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<(), FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        stream.write_all_buf(&mut buf).await?;
        Ok(())
    }
}

/// Resumable decoder for byte streams that arrive in arbitrary chunks.
///
/// Feed it bytes as they arrive and drain complete frames; partial frames are
/// held internally until the rest shows up.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Raise the payload limit after a SETTINGS exchange.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete frame, or `None` until more bytes are pushed.
    pub fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        Frame::decode(&mut self.buf, self.max_frame_size)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf, MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_roundtrip() {
        roundtrip(Frame::data(Bytes::from_static(b"hello"), false));
        roundtrip(Frame::data(Bytes::new(), true));
        roundtrip(Frame::headers(Bytes::from_static(b"\x00\x01a\x00\x01b"), false));
        roundtrip(Frame::rst_stream(8));
        roundtrip(Frame::ping(*b"pingpong"));
        roundtrip(Frame::goaway(41, 2));
    }

    #[test]
    fn decode_partial_consumes_nothing() {
        let frame = Frame::data(Bytes::from_static(b"partial payload"), true);
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);

        // Feed the wire image one byte at a time; only the final byte yields.
        let mut partial = BytesMut::new();
        let full = wire.clone().freeze();
        for (i, byte) in full.iter().enumerate() {
            partial.extend_from_slice(&[*byte]);
            let before = partial.len();
            let got = Frame::decode(&mut partial, MAX_FRAME_SIZE).unwrap();
            if i + 1 < full.len() {
                assert!(got.is_none());
                assert_eq!(partial.len(), before, "partial decode consumed bytes");
            } else {
                assert_eq!(got.unwrap(), frame);
            }
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x5f);
        wire.put_u8(0);
        wire.put_u32(0);
        assert!(matches!(
            Frame::decode(&mut wire, MAX_FRAME_SIZE),
            Err(FrameError::UnknownType(0x5f))
        ));
    }

    #[test]
    fn decode_rejects_oversize_length() {
        let mut wire = BytesMut::new();
        wire.put_u8(FrameType::Data as u8);
        wire.put_u8(0);
        wire.put_u32(0xFFFF_FFFF);
        assert!(matches!(
            Frame::decode(&mut wire, MAX_FRAME_SIZE),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn decode_respects_negotiated_limit() {
        let frame = Frame::data(Bytes::from(vec![0u8; 32]), false);
        let mut wire = BytesMut::new();
        frame.encode(&mut wire);
        assert!(matches!(
            Frame::decode(&mut wire.clone(), 16),
            Err(FrameError::Oversize { got: 32, limit: 16 })
        ));
        assert!(Frame::decode(&mut wire, 64).unwrap().is_some());
    }

    #[test]
    fn decode_never_panics_on_arbitrary_input() {
        // A deterministic spray of junk prefixes; every outcome must be a
        // value or an error, never a panic.
        let mut seed = 0x2545F491u32;
        for len in 0..64 {
            let mut junk = Vec::with_capacity(len);
            for _ in 0..len {
                seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
                junk.push((seed >> 24) as u8);
            }
            let mut buf = Bytes::from(junk);
            let _ = Frame::decode(&mut buf, MAX_FRAME_SIZE);
        }
    }

    #[test]
    fn decoder_resumes_across_chunks() {
        let first = Frame::data(Bytes::from_static(b"first"), false);
        let second = Frame::data(Bytes::from_static(b"second"), true);
        let mut wire = BytesMut::new();
        first.encode(&mut wire);
        second.encode(&mut wire);

        let mut decoder = FrameDecoder::new(MAX_FRAME_SIZE);
        let mid = wire.len() / 2 + 1;
        decoder.push(&wire[..mid]);
        // At most one frame can be complete after half the bytes.
        let mut got = Vec::new();
        while let Some(frame) = decoder.next().unwrap() {
            got.push(frame);
        }
        decoder.push(&wire[mid..]);
        while let Some(frame) = decoder.next().unwrap() {
            got.push(frame);
        }
        assert_eq!(got, vec![first, second]);
        assert!(decoder.is_empty());
    }

    #[test]
    fn reset_code_extraction() {
        assert_eq!(Frame::rst_stream(9).reset_code(), Some(9));
        assert_eq!(Frame::data(Bytes::new(), false).reset_code(), None);
    }

    #[tokio::test]
    async fn read_exact_consumption() {
        let frame = Frame::data(Bytes::from_static(b"async"), true);
        let mut wire = Vec::new();
        let mut tmp = BytesMut::new();
        frame.encode(&mut tmp);
        wire.extend_from_slice(&tmp);
        let trailing = b"leftover";
        wire.extend_from_slice(trailing);

        let mut cursor = std::io::Cursor::new(wire);
        let decoded = Frame::read(&mut cursor, MAX_FRAME_SIZE).await.unwrap().unwrap();
        assert_eq!(decoded, frame);

        let pos = cursor.position() as usize;
        assert_eq!(&cursor.into_inner()[pos..], trailing);
    }

    #[tokio::test]
    async fn read_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(Frame::read(&mut cursor, MAX_FRAME_SIZE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_truncated_payload() {
        let mut wire = Vec::new();
        wire.push(FrameType::Data as u8);
        wire.push(0);
        wire.extend_from_slice(&100u32.to_be_bytes());
        wire.extend_from_slice(b"short");

        let mut cursor = std::io::Cursor::new(wire);
        let err = Frame::read(&mut cursor, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEnd));
    }

    #[tokio::test]
    async fn write_then_read() {
        let frame = Frame::headers(Bytes::from_static(b"block"), true);
        let mut wire = Vec::new();
        frame.write(&mut wire).await.unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let decoded = Frame::read(&mut cursor, MAX_FRAME_SIZE).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}
