//! End-to-end scenarios over the WebSocket transport, including raw-socket
//! protocol violations.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use common::ReverseEcho;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use zrpc::{CallOptions, Client, Server, StatusCode};
use zrpc_proto::{Frame, FrameType, Headers, MAX_FRAME_SIZE};
use zrpc_transport::{Endpoint, Scheme, TransportRegistry};
use zrpc_ws::WsTransport;

fn registry() -> TransportRegistry {
    TransportRegistry::new().register(Scheme::Ws, Arc::new(WsTransport::new()))
}

async fn start() -> (Endpoint, Arc<AtomicUsize>) {
    common::init_tracing();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut server = Server::builder(registry()).finish();
    server.register(
        "Echo/Say",
        ReverseEcho {
            calls: calls.clone(),
        },
    );

    let local = server.bind("ws://127.0.0.1:0").await.expect("bind");
    tokio::spawn(server.serve());
    (local, calls)
}

#[tokio::test]
async fn unary_round_trip() {
    let (local, calls) = start().await;

    let client = Client::builder(registry())
        .dial(&local.to_string())
        .await
        .expect("dial");

    let reply = client
        .call("Echo/Say", Bytes::from_static(b"ws"), CallOptions::new())
        .await
        .expect("call");
    assert_eq!(reply.as_ref(), b"sw");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_streams_stay_isolated() {
    let (local, calls) = start().await;

    let client = Client::builder(registry())
        .dial(&local.to_string())
        .await
        .expect("dial");

    // Two calls multiplexed over the one socket; neither sees the other's
    // frames.
    let left = client.call("Echo/Say", Bytes::from_static(b"left"), CallOptions::new());
    let right = client.call(
        "Echo/Say",
        Bytes::from_static(b"right"),
        CallOptions::new(),
    );
    let (left, right) = tokio::join!(left, right);

    assert_eq!(left.expect("left").as_ref(), b"tfel");
    assert_eq!(right.expect("right").as_ref(), b"thgir");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ping_echoes_through_control_substream() {
    let (local, _calls) = start().await;

    let client = Client::builder(registry())
        .dial(&local.to_string())
        .await
        .expect("dial");
    client.ping().await.expect("ping");
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let (local, calls) = start().await;

    let client = Client::builder(registry())
        .dial(&local.to_string())
        .await
        .expect("dial");

    let err = client
        .call("Svc/Missing", Bytes::from_static(b"x"), CallOptions::new())
        .await
        .expect_err("must fail");
    assert_eq!(err.code(), StatusCode::Unimplemented);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Drives the wire by hand: a substream header, then raw frame bytes.
struct RawClient {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl RawClient {
    async fn connect(local: &Endpoint) -> Self {
        let url = format!("ws://127.0.0.1:{}/", local.port().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.expect("upgrade");
        Self { ws }
    }

    async fn send_frame(&mut self, substream: u16, frame: &Frame) {
        let mut wire = BytesMut::new();
        wire.put_u16(substream);
        frame.encode(&mut wire);
        self.ws
            .send(Message::Binary(wire.freeze()))
            .await
            .expect("send");
    }

    async fn send_raw(&mut self, payload: Vec<u8>) {
        self.ws
            .send(Message::Binary(Bytes::from(payload)))
            .await
            .expect("send");
    }

    /// The next non-control frame, with its substream id.
    async fn next_frame(&mut self) -> (u16, Frame) {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .expect("socket open")
                .expect("socket ok");
            let Message::Binary(mut data) = msg else {
                continue;
            };
            let substream = data.get_u16();
            let frame = Frame::decode(&mut data, MAX_FRAME_SIZE)
                .expect("well-formed server frame")
                .expect("complete server frame");
            if substream == 0 {
                continue;
            }
            return (substream, frame);
        }
    }
}

fn request_headers(method: &str) -> Frame {
    let mut headers = Headers::new();
    headers.insert(":method", method);
    Frame::headers(headers.to_bytes().expect("encodable headers"), false)
}

fn envelope(payload: &[u8], end: bool) -> Frame {
    let mut data = BytesMut::new();
    data.put_u32(payload.len() as u32);
    data.extend_from_slice(payload);
    Frame::data(data.freeze(), end)
}

/// Collect one full response off a substream: status code and concatenated
/// message payload.
async fn read_response(raw: &mut RawClient, substream: u16) -> (u32, Vec<u8>) {
    let mut status = None;
    let mut payload = Vec::new();

    loop {
        let (id, frame) = raw.next_frame().await;
        if id != substream {
            continue;
        }
        match frame.frame_type {
            FrameType::Headers => {
                let mut block = frame.payload.clone();
                let headers = Headers::decode(&mut block).expect("headers");
                status = headers.get(":status").and_then(|s| s.parse().ok());
            }
            FrameType::Data => payload.extend_from_slice(&frame.payload),
            other => panic!("unexpected frame {other:?}"),
        }
        if frame.is_end_stream() {
            break;
        }
    }

    // Strip the message envelope when a payload came back.
    if payload.len() >= 4 {
        let declared = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        payload = payload[4..4 + declared].to_vec();
    }
    (status.expect("status header"), payload)
}

#[tokio::test]
async fn malformed_frame_resets_only_offending_stream() {
    let (local, _calls) = start().await;
    let mut raw = RawClient::connect(&local).await;

    // Substream 1: a frame header whose length field claims 0xFFFFFFFF.
    let mut junk = Vec::new();
    junk.extend_from_slice(&1u16.to_be_bytes());
    junk.push(0x00); // DATA
    junk.push(0x00);
    junk.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    raw.send_raw(junk).await;

    // The adapter answers with RST_STREAM carrying the PROTOCOL code.
    let (substream, frame) = raw.next_frame().await;
    assert_eq!(substream, 1);
    assert_eq!(frame.frame_type, FrameType::RstStream);
    assert_eq!(
        frame.reset_code(),
        Some(zrpc_transport::TransportErrorKind::Protocol.code())
    );

    // Substream 3 on the same connection still completes a call.
    raw.send_frame(3, &request_headers("Echo/Say")).await;
    raw.send_frame(3, &envelope(b"ok?", true)).await;

    let (status, payload) = read_response(&mut raw, 3).await;
    assert_eq!(status, 0);
    assert_eq!(payload, b"?ko");
}

#[tokio::test]
async fn control_ping_is_echoed_before_further_frames() {
    let (local, _calls) = start().await;
    let mut raw = RawClient::connect(&local).await;

    let nonce = *b"\x00\x00\x00\x00\x00\x00\x00\x2a";
    raw.send_frame(0, &Frame::ping(nonce)).await;

    // First thing back (after the server's own SETTINGS) is the echo.
    loop {
        let msg = raw.ws.next().await.expect("open").expect("ok");
        let Message::Binary(mut data) = msg else {
            continue;
        };
        let substream = data.get_u16();
        let frame = Frame::decode(&mut data, MAX_FRAME_SIZE)
            .expect("frame")
            .expect("complete");
        if substream == 0 && frame.frame_type == FrameType::Ping {
            assert_eq!(frame.payload.as_ref(), &nonce);
            return;
        }
        assert_eq!(substream, 0, "rpc frame arrived before the ping echo");
    }
}
