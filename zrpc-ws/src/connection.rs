use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use zrpc_proto::{Frame, FrameType, Settings};
use zrpc_transport::{Connection, Stream, TransportError, TransportErrorKind};

use crate::error::map_ws_error;
use crate::stream::WsStream;
use crate::{CONTROL_SUBSTREAM, MAILBOX_FRAMES, WRITER_QUEUE};

const PING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// An outbound unit for the writer task.
pub(crate) enum Outbound {
    Frame { substream: u16, frame: Frame },
    Shutdown,
}

/// State shared between the connection handle, its streams and the two
/// socket tasks.
pub(crate) struct Shared {
    server: bool,
    next_id: AtomicU16,
    streams: StdMutex<HashMap<u16, mpsc::Sender<Frame>>>,
    live_streams: AtomicU32,
    pub(crate) writer: mpsc::Sender<Outbound>,
    pub(crate) closed: CancellationToken,
    close_reason: StdMutex<Option<TransportError>>,
    goaway: AtomicBool,
    local_settings: Settings,
    peer_max_frame: AtomicU32,
    peer_max_streams: AtomicU32,
    pending_pings: StdMutex<HashMap<u64, oneshot::Sender<()>>>,
    ping_nonce: AtomicU64,
    peer_identity: Option<String>,
}

impl Shared {
    /// The terminal error for this connection, once there is one.
    pub(crate) fn error(&self) -> TransportError {
        self.close_reason
            .lock()
            .expect("close reason lock poisoned")
            .clone()
            .unwrap_or_else(|| TransportError::not_connected("connection closed"))
    }

    pub(crate) fn peer_max_frame(&self) -> u32 {
        self.peer_max_frame.load(Ordering::Acquire)
    }

    /// Tear the connection down exactly once; every live stream observes the
    /// reason through the cancellation token.
    pub(crate) fn shutdown(&self, reason: TransportError) {
        {
            let mut slot = self.close_reason.lock().expect("close reason lock poisoned");
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
        self.streams.lock().expect("stream map lock poisoned").clear();
        self.pending_pings
            .lock()
            .expect("ping map lock poisoned")
            .clear();
    }

    pub(crate) fn remove_substream(&self, id: u16) {
        let removed = self
            .streams
            .lock()
            .expect("stream map lock poisoned")
            .remove(&id)
            .is_some();
        if removed {
            self.live_streams.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn peer_initiated(&self, id: u16) -> bool {
        // Client ids are odd, server ids even; the peer owns the other parity.
        let odd = id % 2 == 1;
        if self.server {
            odd
        } else {
            !odd && id != CONTROL_SUBSTREAM
        }
    }

    /// Reset one substream for a local protocol violation, leaving every
    /// other substream on the connection usable.
    async fn reset_substream(&self, id: u16, context: &str) {
        tracing::warn!(substream = id, context, "resetting substream");
        let rst = Frame::rst_stream(TransportErrorKind::Protocol.code());

        // Let the local reader observe the reset before the entry goes away.
        let entry = self
            .streams
            .lock()
            .expect("stream map lock poisoned")
            .get(&id)
            .cloned();
        if let Some(tx) = entry {
            tx.send(rst.clone()).await.ok();
        }
        self.remove_substream(id);

        self.writer
            .send(Outbound::Frame {
                substream: id,
                frame: rst,
            })
            .await
            .ok();
    }

    async fn handle_control(&self, frame: Frame) -> Result<(), TransportError> {
        match frame.frame_type {
            FrameType::Settings => {
                let mut payload = frame.payload.clone();
                let settings = Settings::decode(&mut payload)
                    .map_err(|err| TransportError::protocol(format!("bad settings: {err}")))?;
                // Only ever raise the write limit; the default stays the floor.
                self.peer_max_frame
                    .fetch_max(settings.max_frame_size, Ordering::AcqRel);
                self.peer_max_streams
                    .store(settings.max_streams, Ordering::Release);
            }
            FrameType::Ping => {
                if frame.payload.len() != 8 {
                    return Err(TransportError::protocol("ping payload must be 8 bytes"));
                }
                let nonce = u64::from_be_bytes(frame.payload[..8].try_into().expect("len checked"));
                let pending = self
                    .pending_pings
                    .lock()
                    .expect("ping map lock poisoned")
                    .remove(&nonce);
                match pending {
                    // The echo of a probe we sent.
                    Some(reply) => {
                        reply.send(()).ok();
                    }
                    // A peer probe: echo it back before reading on.
                    None => {
                        self.writer
                            .send(Outbound::Frame {
                                substream: CONTROL_SUBSTREAM,
                                frame,
                            })
                            .await
                            .ok();
                    }
                }
            }
            FrameType::Goaway => {
                self.goaway.store(true, Ordering::Release);
            }
            other => {
                tracing::debug!(?other, "ignoring control frame");
            }
        }
        Ok(())
    }

    async fn handle_binary(
        self: &Arc<Self>,
        mut data: Bytes,
        accept_tx: &mpsc::Sender<WsStream>,
    ) -> Result<(), TransportError> {
        if data.len() < 2 {
            return Err(TransportError::protocol("message below substream header"));
        }
        let substream = data.get_u16();

        let frame = match Frame::decode(&mut data, self.local_settings.max_frame_size) {
            Ok(Some(frame)) if !data.has_remaining() => frame,
            // Truncated frame, trailing bytes or an oversize length: the
            // violation is scoped to the one substream.
            Ok(_) | Err(_) if substream != CONTROL_SUBSTREAM => {
                self.reset_substream(substream, "malformed frame").await;
                return Ok(());
            }
            Ok(_) => return Err(TransportError::protocol("malformed control frame")),
            Err(err) => return Err(TransportError::protocol(format!("control frame: {err}"))),
        };

        if substream == CONTROL_SUBSTREAM {
            return self.handle_control(frame).await;
        }

        let entry = self
            .streams
            .lock()
            .expect("stream map lock poisoned")
            .get(&substream)
            .cloned();

        match entry {
            Some(tx) => {
                let terminal = frame.is_end_stream() || frame.frame_type == FrameType::RstStream;
                // Bounded mailbox: a full buffer pauses this reader, which
                // stops acknowledging the socket and halts the peer.
                tx.send(frame).await.ok();
                if terminal {
                    self.remove_substream(substream);
                }
            }
            None if self.peer_initiated(substream) => {
                let (tx, rx) = mpsc::channel(MAILBOX_FRAMES);
                let terminal = frame.is_end_stream() || frame.frame_type == FrameType::RstStream;
                tx.send(frame).await.expect("fresh mailbox");

                if !terminal {
                    self.streams
                        .lock()
                        .expect("stream map lock poisoned")
                        .insert(substream, tx);
                    self.live_streams.fetch_add(1, Ordering::AcqRel);
                }

                let stream = WsStream::new(substream, self.clone(), rx);
                if accept_tx.send(stream).await.is_err() {
                    // Connection handle dropped; tear down.
                    return Err(TransportError::closed("connection dropped"));
                }
            }
            None => {
                // A frame for a substream we already reset or finished.
                tracing::trace!(substream, "dropping frame for closed substream");
            }
        }

        Ok(())
    }
}

/// An RPC connection multiplexed over one WebSocket.
pub struct WsConnection {
    shared: Arc<Shared>,
    accept_rx: Mutex<mpsc::Receiver<WsStream>>,
}

impl WsConnection {
    /// Wrap an established WebSocket, spawn its socket tasks and announce
    /// local SETTINGS on the control substream.
    pub(crate) async fn new<S>(
        ws: WebSocketStream<S>,
        server: bool,
        peer_identity: Option<String>,
        settings: Settings,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(MAILBOX_FRAMES);

        let shared = Arc::new(Shared {
            server,
            next_id: AtomicU16::new(if server { 2 } else { 1 }),
            streams: StdMutex::new(HashMap::new()),
            live_streams: AtomicU32::new(0),
            writer: writer_tx,
            closed: CancellationToken::new(),
            close_reason: StdMutex::new(None),
            goaway: AtomicBool::new(false),
            local_settings: settings,
            peer_max_frame: AtomicU32::new(zrpc_proto::DEFAULT_MAX_FRAME_SIZE),
            peer_max_streams: AtomicU32::new(settings.max_streams),
            pending_pings: StdMutex::new(HashMap::new()),
            ping_nonce: AtomicU64::new(1),
            peer_identity,
        });

        tokio::spawn(run_writer(sink, writer_rx, shared.clone()));
        tokio::spawn(run_reader(source, shared.clone(), accept_tx));

        let mut payload = BytesMut::new();
        settings.encode(&mut payload);
        shared
            .writer
            .send(Outbound::Frame {
                substream: CONTROL_SUBSTREAM,
                frame: Frame::new(FrameType::Settings, 0, payload.freeze()),
            })
            .await
            .map_err(|_| TransportError::closed("connection closed during setup"))?;

        Ok(Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
        })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn open_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.error());
        }
        if self.shared.goaway.load(Ordering::Acquire) {
            return Err(TransportError::not_connected("peer sent goaway"));
        }

        let max = self.shared.peer_max_streams.load(Ordering::Acquire);
        if self.shared.live_streams.load(Ordering::Acquire) >= max {
            return Err(TransportError::resource_exhausted(format!(
                "peer limit of {max} streams reached"
            )));
        }

        // Ids are never reused within a connection, so the counter saturates
        // instead of wrapping.
        let id = self
            .shared
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(2))
            .map_err(|_| TransportError::resource_exhausted("substream ids exhausted"))?;
        let (tx, rx) = mpsc::channel(MAILBOX_FRAMES);
        self.shared
            .streams
            .lock()
            .expect("stream map lock poisoned")
            .insert(id, tx);
        self.shared.live_streams.fetch_add(1, Ordering::AcqRel);

        tracing::trace!(substream = id, "opened substream");
        Ok(Box::new(WsStream::new(id, self.shared.clone(), rx)))
    }

    async fn accept_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(self.shared.error()),
            stream = accept_rx.recv() => match stream {
                Some(stream) => Ok(Box::new(stream) as Box<dyn Stream>),
                None => Err(self.shared.error()),
            },
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::not_connected(self.shared.error().to_string()));
        }

        let nonce = self.shared.ping_nonce.fetch_add(1, Ordering::AcqRel);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending_pings
            .lock()
            .expect("ping map lock poisoned")
            .insert(nonce, reply_tx);

        self.shared
            .writer
            .send(Outbound::Frame {
                substream: CONTROL_SUBSTREAM,
                frame: Frame::ping(nonce.to_be_bytes()),
            })
            .await
            .map_err(|_| TransportError::not_connected("connection closed"))?;

        tokio::select! {
            _ = self.shared.closed.cancelled() => Err(TransportError::not_connected(self.shared.error().to_string())),
            echo = tokio::time::timeout(PING_TIMEOUT, reply_rx) => match echo {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(TransportError::not_connected("connection closed")),
                Err(_) => {
                    self.shared
                        .pending_pings
                        .lock()
                        .expect("ping map lock poisoned")
                        .remove(&nonce);
                    Err(TransportError::connection_timeout("ping timed out"))
                }
            },
        }
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    fn peer_identity(&self) -> Option<String> {
        self.shared.peer_identity.clone()
    }

    async fn close(&self) {
        self.shared.writer.send(Outbound::Shutdown).await.ok();
        self.shared
            .shutdown(TransportError::closed("connection closed locally"));
    }
}

async fn run_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frame { substream, frame } => {
                let mut wire = BytesMut::with_capacity(2 + frame.encoded_len());
                wire.put_u16(substream);
                frame.encode(&mut wire);

                if let Err(err) = sink.send(Message::Binary(wire.freeze())).await {
                    shared.shutdown(map_ws_error(err));
                    break;
                }
            }
            Outbound::Shutdown => {
                sink.send(Message::Close(None)).await.ok();
                sink.flush().await.ok();
                break;
            }
        }
    }
}

async fn run_reader<S>(
    mut source: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<WsStream>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        let msg = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break shared.error(),
            msg = source.next() => msg,
        };

        match msg {
            None => break TransportError::connection_reset("websocket ended"),
            Some(Err(err)) => break map_ws_error(err),
            Some(Ok(Message::Binary(data))) => {
                if let Err(reason) = shared.handle_binary(data, &accept_tx).await {
                    break reason;
                }
            }
            Some(Ok(Message::Close(_))) => {
                break TransportError::closed("close opcode from peer")
            }
            // WS-level ping/pong is answered by tungstenite itself.
            Some(Ok(_)) => continue,
        }
    };

    tracing::debug!(%reason, "websocket reader finished");
    shared.shutdown(reason);
}
