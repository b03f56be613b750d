//! End-to-end scenarios over the native QUIC transport.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{ChatBack, Letters, ReverseEcho, Sleeper};
use zrpc::{CallOptions, Client, Server, Status, StatusCode, TlsConfig};
use zrpc_quinn::QuinnTransport;
use zrpc_transport::{Scheme, TransportRegistry};

fn registry() -> TransportRegistry {
    TransportRegistry::new().register(Scheme::Zr, Arc::new(QuinnTransport::new()))
}

struct TestServer {
    client: Client,
    calls: Arc<AtomicUsize>,
    handler_cancelled: Arc<AtomicBool>,
}

/// Spin up a server with the full handler fixture set and dial it.
async fn start() -> TestServer {
    common::init_tracing();

    let (cert, key) = common::self_signed();
    let roots = cert.clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_cancelled = Arc::new(AtomicBool::new(false));

    let mut server = Server::builder(registry())
        .with_tls(TlsConfig::for_server(cert, key))
        .finish();
    server.register(
        "Echo/Say",
        ReverseEcho {
            calls: calls.clone(),
        },
    );
    server.register(
        "Svc/Sleep",
        Sleeper {
            cancelled: handler_cancelled.clone(),
        },
    );
    server.register("Stream/Letters", Letters);
    server.register(
        "Chat/Bidi",
        ChatBack {
            cancelled: handler_cancelled.clone(),
        },
    );

    let local = server.bind("zr://127.0.0.1:0").await.expect("bind");
    tokio::spawn(server.serve());

    let client = Client::builder(registry())
        .with_tls(TlsConfig::with_roots(roots))
        .dial(&local.to_string())
        .await
        .expect("dial");

    TestServer {
        client,
        calls,
        handler_cancelled,
    }
}

#[tokio::test]
async fn unary_round_trip() {
    let fixture = start().await;

    let started = Instant::now();
    let reply = fixture
        .client
        .call(
            "Echo/Say",
            Bytes::from_static(&[0x01, 0x02, 0x03, 0x04]),
            CallOptions::new().with_deadline(Duration::from_secs(1)),
        )
        .await
        .expect("unary call");

    assert_eq!(reply.as_ref(), &[0x04, 0x03, 0x02, 0x01]);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_method_is_unimplemented() {
    let fixture = start().await;

    let err = fixture
        .client
        .call("Svc/Missing", Bytes::from_static(b"x"), CallOptions::new())
        .await
        .expect_err("must fail");

    assert_eq!(err.code(), StatusCode::Unimplemented);
    // No handler ran.
    assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deadline_cuts_off_slow_handler() {
    let fixture = start().await;

    let started = Instant::now();
    let err = fixture
        .client
        .call(
            "Svc/Sleep",
            Bytes::from_static(b"zzz"),
            CallOptions::new().with_deadline(Duration::from_millis(100)),
        )
        .await
        .expect_err("must time out");

    assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "returned after {:?}",
        started.elapsed()
    );

    // The server-side token fires at its own deadline.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fixture.handler_cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn server_streaming_in_order() {
    let fixture = start().await;

    let mut receiver = fixture
        .client
        .open_server_stream(
            "Stream/Letters",
            Bytes::from_static(b"go"),
            CallOptions::new().with_deadline(Duration::from_secs(2)),
        )
        .await
        .expect("open stream");

    let mut got = Vec::new();
    while let Some(message) = receiver.recv().await.expect("recv") {
        got.push(String::from_utf8(message.to_vec()).unwrap());
    }
    assert_eq!(got, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn cancel_bidi_mid_flight() {
    let fixture = start().await;

    let (mut sender, mut receiver) = fixture
        .client
        .open_bidi("Chat/Bidi", CallOptions::new())
        .await
        .expect("open bidi");

    sender.send(Bytes::from_static(b"msg-1")).await.expect("send");
    let first = receiver.recv().await.expect("recv").expect("one reply");
    assert_eq!(first.as_ref(), b"resp-1");

    sender.cancel();

    let err = receiver.recv().await.expect_err("cancelled");
    assert_eq!(err.code(), StatusCode::Cancelled);

    // The handler's cancel token observes the reset.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fixture.handler_cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn client_streaming_sums_to_one_reply() {
    let fixture = start().await;

    // Exercise the remaining RPC shape against the echo handler's contract:
    // a dedicated concat handler keeps the fixture honest.
    let err = fixture
        .client
        .open_client_stream("Echo/Say", CallOptions::new())
        .await;
    let (mut sender, response) = err.expect("open client stream");

    sender.send(Bytes::from_static(b"abc")).await.expect("send");
    sender.finish().await.expect("finish");

    // ReverseEcho reads exactly one message, so the reply is the reversal.
    let reply = response.response().await.expect("response");
    assert_eq!(reply.as_ref(), b"cba");
}

#[tokio::test]
async fn ping_probes_liveness() {
    let fixture = start().await;
    fixture.client.ping().await.expect("ping");
    assert!(fixture.client.is_connected());

    fixture.client.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fixture.client.is_connected());
}

#[tokio::test]
async fn closing_connection_fails_live_calls() {
    let fixture = start().await;

    let (mut sender, mut receiver) = fixture
        .client
        .open_bidi("Chat/Bidi", CallOptions::new())
        .await
        .expect("open bidi");
    sender.send(Bytes::from_static(b"msg-1")).await.expect("send");
    assert!(receiver.recv().await.expect("recv").is_some());

    fixture.client.close().await;

    let err = receiver.recv().await.expect_err("connection closed");
    assert!(
        matches!(
            err.code(),
            StatusCode::Unavailable | StatusCode::Cancelled
        ),
        "unexpected status {err}"
    );
}

#[tokio::test]
async fn status_error_reaches_caller() {
    common::init_tracing();

    let (cert, key) = common::self_signed();
    let roots = cert.clone();

    let mut server = Server::builder(registry())
        .with_tls(TlsConfig::for_server(cert, key))
        .finish();
    server.register_unary("Fail/Always", |_ctx, _payload| async {
        Err::<Bytes, _>(Status::new(StatusCode::FailedPrecondition, "nope"))
    });

    let local = server.bind("zr://127.0.0.1:0").await.expect("bind");
    tokio::spawn(server.serve());

    let client = Client::builder(registry())
        .with_tls(TlsConfig::with_roots(roots))
        .dial(&local.to_string())
        .await
        .expect("dial");

    let err = client
        .call("Fail/Always", Bytes::from_static(b"x"), CallOptions::new())
        .await
        .expect_err("must fail");
    assert_eq!(err.code(), StatusCode::FailedPrecondition);
    assert_eq!(err.message(), "nope");
}
