#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use zrpc::{Handler, RequestContext, ResponseSink, Status, StatusCode, StreamReceiver};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A throwaway certificate for 127.0.0.1 / localhost.
pub fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let signed = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("generate certificate");

    let cert = signed.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        signed.key_pair.serialize_der(),
    ));
    (vec![cert], key)
}

/// Counts invocations and replies with the reversed request payload.
pub struct ReverseEcho {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for ReverseEcho {
    async fn call(
        &self,
        _ctx: RequestContext,
        mut request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(payload) = request.recv().await? else {
            return Err(Status::invalid_argument("request carried no payload"));
        };
        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        response.send(Bytes::from(reversed)).await?;
        Ok(())
    }
}

/// Sleeps well past any test deadline, recording whether its cancel token
/// fired.
pub struct Sleeper {
    pub cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for Sleeper {
    async fn call(
        &self,
        ctx: RequestContext,
        _request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status> {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            _ = ctx.cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                return Err(Status::cancelled("handler cancelled"));
            }
        }
        response.send(Bytes::from_static(b"done")).await?;
        Ok(())
    }
}

/// Emits "a", "b", "c" and ends the stream.
pub struct Letters;

#[async_trait]
impl Handler for Letters {
    async fn call(
        &self,
        _ctx: RequestContext,
        _request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status> {
        for letter in ["a", "b", "c"] {
            response.send(Bytes::from(letter)).await?;
        }
        Ok(())
    }
}

/// Replies `resp-<n>` per inbound message, flagging cancellation when the
/// client resets the stream.
pub struct ChatBack {
    pub cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl Handler for ChatBack {
    async fn call(
        &self,
        ctx: RequestContext,
        mut request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status> {
        let mut n = 0usize;
        loop {
            match request.recv().await {
                Ok(Some(_msg)) => {
                    n += 1;
                    response.send(Bytes::from(format!("resp-{n}"))).await?;
                }
                Ok(None) => return Ok(()),
                Err(status) => {
                    if status.code() == StatusCode::Cancelled || ctx.is_cancelled() {
                        self.cancelled.store(true, Ordering::SeqCst);
                    }
                    return Err(status);
                }
            }
        }
    }
}
