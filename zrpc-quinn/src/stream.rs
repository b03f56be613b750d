use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use zrpc_proto::{Frame, FrameType, MAX_FRAME_SIZE};
use zrpc_transport::{Stream, TransportError, TransportErrorKind};

use crate::error::{map_read_error, map_write_error};

/// One RPC stream mapped onto a QUIC bidirectional stream.
///
/// The send and receive halves live behind separate locks so the two
/// directions can be driven concurrently through a shared handle.
pub struct QuinnStream {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    cancelled: CancellationToken,
    reset_sent: AtomicBool,
}

struct SendHalf {
    stream: quinn::SendStream,
    finished: bool,
}

struct RecvHalf {
    stream: quinn::RecvStream,
    done: bool,
}

impl QuinnStream {
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        let id = quinn::VarInt::from(send.id()).into_inner();
        Self {
            inner: Arc::new(Inner {
                id,
                send: Mutex::new(SendHalf {
                    stream: send,
                    finished: false,
                }),
                recv: Mutex::new(RecvHalf {
                    stream: recv,
                    done: false,
                }),
                cancelled: CancellationToken::new(),
                reset_sent: AtomicBool::new(false),
            }),
        }
    }

    fn cancelled_error(&self) -> TransportError {
        TransportError::cancelled("stream cancelled")
    }

    /// Reset both directions with a protocol violation code; used when the
    /// peer's framing is malformed so other streams stay usable.
    fn reset_protocol(&self) {
        self.cancel(TransportErrorKind::Protocol.code());
    }
}

#[async_trait]
impl Stream for QuinnStream {
    fn id(&self) -> u64 {
        self.inner.id
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.inner.cancelled.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let mut send = tokio::select! {
            guard = self.inner.send.lock() => guard,
            _ = self.inner.cancelled.cancelled() => return Err(self.cancelled_error()),
        };

        if send.finished {
            return Err(TransportError::closed("send side already finished"));
        }

        let end_stream = frame.is_end_stream();
        let mut wire = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut wire);

        // Suspends while the QUIC stream window is exhausted; a cancel mid
        // write abandons the frame and the reset catches up with the peer.
        tokio::select! {
            res = send.stream.write_all(&wire) => res.map_err(map_write_error)?,
            _ = self.inner.cancelled.cancelled() => return Err(self.cancelled_error()),
        }

        if end_stream {
            send.stream.finish().ok();
            send.finished = true;
        }

        Ok(())
    }

    async fn read_frame(&self) -> Result<Option<Frame>, TransportError> {
        let mut recv = tokio::select! {
            guard = self.inner.recv.lock() => guard,
            _ = self.inner.cancelled.cancelled() => return Err(self.cancelled_error()),
        };

        if recv.done {
            return Ok(None);
        }
        if self.inner.cancelled.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let mut header = [0u8; 6];
        let read = tokio::select! {
            res = recv.stream.read_exact(&mut header) => res,
            _ = self.inner.cancelled.cancelled() => return Err(self.cancelled_error()),
        };

        match read {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(0)) => {
                recv.done = true;
                return Ok(None);
            }
            Err(quinn::ReadExactError::FinishedEarly(_)) => {
                drop(recv);
                self.reset_protocol();
                return Err(TransportError::invalid_frame("truncated frame header"));
            }
            Err(quinn::ReadExactError::ReadError(err)) => return Err(map_read_error(err)),
        }

        let Some(frame_type) = FrameType::from_u8(header[0]) else {
            drop(recv);
            self.reset_protocol();
            return Err(TransportError::invalid_frame(format!(
                "unknown frame type {:#04x}",
                header[0]
            )));
        };
        let flags = header[1];
        let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);

        if length > MAX_FRAME_SIZE {
            drop(recv);
            self.reset_protocol();
            return Err(TransportError::invalid_frame(format!(
                "frame length {length} exceeds ceiling"
            )));
        }

        let mut payload = vec![0u8; length as usize];
        let read = tokio::select! {
            res = recv.stream.read_exact(&mut payload) => res,
            _ = self.inner.cancelled.cancelled() => return Err(self.cancelled_error()),
        };

        match read {
            Ok(()) => {}
            Err(quinn::ReadExactError::FinishedEarly(_)) => {
                drop(recv);
                self.reset_protocol();
                return Err(TransportError::invalid_frame("truncated frame payload"));
            }
            Err(quinn::ReadExactError::ReadError(err)) => return Err(map_read_error(err)),
        }

        Ok(Some(Frame::new(frame_type, flags, Bytes::from(payload))))
    }

    fn cancel(&self, code: u32) {
        // At most one reset per direction; later calls are no-ops.
        if self.inner.reset_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancelled.cancel();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let code = quinn::VarInt::from_u32(code);

            let mut send = inner.send.lock().await;
            if !send.finished {
                send.stream.reset(code).ok();
                send.finished = true;
            }
            drop(send);

            let mut recv = inner.recv.lock().await;
            if !recv.done {
                recv.stream.stop(code).ok();
                recv.done = true;
            }
        });
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut send = self.inner.send.lock().await;
        if !send.finished {
            send.stream.finish().ok();
            send.finished = true;
        }
        Ok(())
    }
}
