use bytes::{Buf, BufMut, Bytes, BytesMut};
use zrpc_proto::{Frame, FrameType, Headers};
use zrpc_transport::{Stream as TransportStream, TransportError};

use crate::Status;

/// Length prefix in front of every message inside the DATA byte stream.
///
/// Frames delimit flow-control units, not messages; the envelope is what
/// makes N-message streaming shapes observable and lets one message span
/// multiple frames.
const ENVELOPE_PREFIX: usize = 4;

/// Largest message the engine will reassemble.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Write one length-delimited message, chunked at the frame size limit.
///
/// The final chunk carries `END_STREAM` when `end_stream` is set.
pub(crate) async fn send_message(
    stream: &dyn TransportStream,
    payload: &Bytes,
    max_frame: u32,
    end_stream: bool,
) -> Result<(), TransportError> {
    let mut wire = BytesMut::with_capacity(ENVELOPE_PREFIX + payload.len());
    wire.put_u32(payload.len() as u32);
    wire.extend_from_slice(payload);
    let mut wire = wire.freeze();

    loop {
        let take = wire.len().min(max_frame as usize);
        let chunk = wire.split_to(take);
        let last = wire.is_empty();
        stream
            .write_frame(Frame::data(chunk, last && end_stream))
            .await?;
        if last {
            return Ok(());
        }
    }
}

/// Reassembles length-delimited messages from the DATA byte stream and
/// captures a trailing HEADERS block when one arrives.
pub(crate) struct MessageReader {
    buf: BytesMut,
    ended: bool,
    trailers: Option<Headers>,
}

impl MessageReader {
    pub fn new(already_ended: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            ended: already_ended,
            trailers: None,
        }
    }

    pub fn trailers(&self) -> Option<&Headers> {
        self.trailers.as_ref()
    }

    fn buffered_message(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < ENVELOPE_PREFIX {
            return Ok(None);
        }
        let declared =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if declared > MAX_MESSAGE_SIZE {
            return Err(Status::resource_exhausted(format!(
                "message of {declared} bytes exceeds limit"
            )));
        }
        if self.buf.len() < ENVELOPE_PREFIX + declared {
            return Ok(None);
        }
        self.buf.advance(ENVELOPE_PREFIX);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }

    /// The next complete message, or `None` once the peer's side has ended.
    ///
    /// `map_err` localizes the transport-to-status mapping to the caller's
    /// side of the connection.
    pub async fn next_message(
        &mut self,
        stream: &dyn TransportStream,
        map_err: impl Fn(&TransportError) -> Status,
    ) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.buffered_message()? {
                return Ok(Some(message));
            }
            if self.ended {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Status::internal("stream ended inside a message"));
            }

            match stream.read_frame().await.map_err(|err| map_err(&err))? {
                // A clean transport-level end counts the same as END_STREAM.
                None => self.ended = true,
                Some(frame) => match frame.frame_type {
                    FrameType::Data => {
                        self.buf.extend_from_slice(&frame.payload);
                        if frame.is_end_stream() {
                            self.ended = true;
                        }
                    }
                    FrameType::Headers => {
                        let mut block = frame.payload.clone();
                        let trailers = Headers::decode(&mut block).map_err(|err| {
                            Status::internal(format!("malformed trailers: {err}"))
                        })?;
                        self.trailers = Some(trailers);
                        // Trailers always end the message sequence.
                        self.ended = true;
                    }
                    other => {
                        return Err(Status::internal(format!(
                            "unexpected {other:?} frame between messages"
                        )))
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_message_waits_for_full_envelope() {
        let mut reader = MessageReader::new(false);
        reader.buf.put_u32(5);
        reader.buf.extend_from_slice(b"abc");
        assert!(reader.buffered_message().unwrap().is_none());

        reader.buf.extend_from_slice(b"de");
        assert_eq!(
            reader.buffered_message().unwrap().unwrap(),
            Bytes::from_static(b"abcde")
        );
    }

    #[test]
    fn buffered_message_rejects_oversize_declaration() {
        let mut reader = MessageReader::new(false);
        reader.buf.put_u32(u32::MAX);
        assert!(reader.buffered_message().is_err());
    }
}
