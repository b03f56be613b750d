use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use zrpc_proto::{Frame, FrameType};
use zrpc_transport::{Stream, TransportError, TransportErrorKind};

use crate::connection::{Outbound, Shared};

/// One logical RPC stream multiplexed over the socket.
pub struct WsStream {
    inner: Arc<Inner>,
}

struct Inner {
    id: u16,
    shared: Arc<Shared>,
    mailbox: Mutex<mpsc::Receiver<Frame>>,
    cancelled: CancellationToken,
    reset_sent: AtomicBool,
    send_finished: AtomicBool,
    saw_end: AtomicBool,
}

impl WsStream {
    pub(crate) fn new(id: u16, shared: Arc<Shared>, mailbox: mpsc::Receiver<Frame>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                shared,
                mailbox: Mutex::new(mailbox),
                cancelled: CancellationToken::new(),
                reset_sent: AtomicBool::new(false),
                send_finished: AtomicBool::new(false),
                saw_end: AtomicBool::new(false),
            }),
        }
    }

    fn cancelled_error(&self) -> TransportError {
        TransportError::cancelled("stream cancelled")
    }
}

#[async_trait]
impl Stream for WsStream {
    fn id(&self) -> u64 {
        self.inner.id as u64
    }

    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.cancelled.is_cancelled() {
            return Err(self.cancelled_error());
        }
        if inner.shared.closed.is_cancelled() {
            return Err(inner.shared.error());
        }
        if inner.send_finished.load(Ordering::Acquire) {
            return Err(TransportError::closed("send side already finished"));
        }

        let max = inner.shared.peer_max_frame();
        if frame.payload.len() > max as usize {
            return Err(TransportError::invalid_argument(format!(
                "frame payload of {} bytes exceeds peer limit {max}",
                frame.payload.len()
            )));
        }

        let end_stream = frame.is_end_stream();

        // The bounded writer queue is the send-side backpressure: a slow
        // socket suspends every writer on the connection.
        tokio::select! {
            biased;
            _ = inner.cancelled.cancelled() => return Err(self.cancelled_error()),
            _ = inner.shared.closed.cancelled() => return Err(inner.shared.error()),
            sent = inner.shared.writer.send(Outbound::Frame {
                substream: inner.id,
                frame,
            }) => {
                if sent.is_err() {
                    return Err(inner.shared.error());
                }
            }
        }

        if end_stream {
            inner.send_finished.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn read_frame(&self) -> Result<Option<Frame>, TransportError> {
        let inner = &self.inner;

        let mut mailbox = tokio::select! {
            biased;
            _ = inner.cancelled.cancelled() => return Err(self.cancelled_error()),
            guard = inner.mailbox.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = inner.cancelled.cancelled() => Err(self.cancelled_error()),
            _ = inner.shared.closed.cancelled() => Err(inner.shared.error()),
            frame = mailbox.recv() => match frame {
                Some(frame) if frame.frame_type == FrameType::RstStream => {
                    let kind = frame
                        .reset_code()
                        .map(TransportErrorKind::from_code)
                        .unwrap_or(TransportErrorKind::Protocol);
                    // A peer reset is terminal for both halves; no reset of
                    // our own goes back.
                    inner.reset_sent.store(true, Ordering::Release);
                    inner.cancelled.cancel();
                    Err(TransportError::new(kind, "stream reset by peer"))
                }
                Some(frame) => {
                    if frame.is_end_stream() {
                        inner.saw_end.store(true, Ordering::Release);
                    }
                    Ok(Some(frame))
                }
                None => {
                    if inner.saw_end.load(Ordering::Acquire) {
                        Ok(None)
                    } else if inner.shared.closed.is_cancelled() {
                        Err(inner.shared.error())
                    } else {
                        Err(TransportError::connection_reset("substream dropped"))
                    }
                }
            },
        }
    }

    fn cancel(&self, code: u32) {
        let inner = &self.inner;
        if inner.reset_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.cancelled.cancel();
        inner.send_finished.store(true, Ordering::Release);

        // Stop routing inbound frames to this substream immediately; the
        // reset itself goes out through the writer task.
        inner.shared.remove_substream(inner.id);

        let shared = inner.shared.clone();
        let substream = inner.id;
        tokio::spawn(async move {
            shared
                .writer
                .send(Outbound::Frame {
                    substream,
                    frame: Frame::rst_stream(code),
                })
                .await
                .ok();
        });
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.send_finished.load(Ordering::Acquire) {
            return Ok(());
        }
        self.write_frame(Frame::data(Bytes::new(), true)).await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.reset_sent.load(Ordering::Acquire) {
            return;
        }
        if self.send_finished.load(Ordering::Acquire) && self.saw_end.load(Ordering::Acquire) {
            return;
        }

        // Abandoned mid-call: reset so the peer does not wait on us forever.
        self.shared.remove_substream(self.id);
        self.shared
            .writer
            .try_send(Outbound::Frame {
                substream: self.id,
                frame: Frame::rst_stream(TransportErrorKind::Cancelled.code()),
            })
            .ok();
    }
}
