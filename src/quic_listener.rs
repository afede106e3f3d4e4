//! HTTP/3 accept loop.
//!
//! Serves the QUIC side of an HTTP/3 binding: accepts connections (0-RTT
//! allowed), negotiates HTTP/3, and feeds each request through the owning
//! binding's dispatch. Every request runs in its own task, so a panic is
//! confined to that request and answered with a 500.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use h3_quinn::Connection as H3Connection;
use http::header::HeaderValue;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, error, info};

use crate::bind::Binding;

/// Accept QUIC connections until the endpoint is closed, then drain.
pub async fn run(bind: Arc<Binding>, endpoint: quinn::Endpoint) {
    info!(address = ?endpoint.local_addr(), "QUIC listener running");

    while let Some(incoming) = endpoint.accept().await {
        let remote_addr = incoming.remote_address();
        let bind = bind.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(bind, incoming, remote_addr).await {
                debug!(%remote_addr, error = %err, "QUIC connection error");
            }
        });
    }

    endpoint.wait_idle().await;
    info!("QUIC listener stopped");
}

async fn handle_connection(
    bind: Arc<Binding>,
    incoming: quinn::Incoming,
    remote_addr: SocketAddr,
) -> anyhow::Result<()> {
    let connecting = incoming.accept()?;

    // 0-RTT when the client resumes with an early-data ticket, otherwise the
    // full handshake.
    let connection = match connecting.into_0rtt() {
        Ok((connection, _accepted)) => connection,
        Err(connecting) => connecting.await?,
    };

    debug!(%remote_addr, "QUIC connection established");

    let mut h3_conn: h3::server::Connection<H3Connection, Bytes> =
        h3::server::Connection::new(H3Connection::new(connection)).await?;

    loop {
        match h3_conn.accept().await {
            Ok(Some((request, stream))) => {
                let bind = bind.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_request(bind, request, stream, remote_addr).await {
                        debug!(%remote_addr, error = %err, "HTTP/3 request failed");
                    }
                });
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%remote_addr, error = %err, "HTTP/3 accept error");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    bind: Arc<Binding>,
    request: Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    remote_addr: SocketAddr,
) -> anyhow::Result<()> {
    let (parts, ()) = request.into_parts();

    let mut body = BytesMut::new();
    while let Some(chunk) = stream.recv_data().await? {
        body.put(chunk);
    }
    let request = Request::from_parts(parts, Body::from(body.freeze()));

    let response = dispatch_guarded(bind.clone(), request, remote_addr).await;
    let (mut parts, body) = response.into_parts();

    if let Ok(value) = HeaderValue::from_str(&bind.alt_svc_value()) {
        parts.headers.insert("alt-svc", value);
    }

    let body = body
        .collect()
        .await
        .map_err(|err| anyhow::anyhow!("collecting response body: {err}"))?
        .to_bytes();

    stream
        .send_response(http::Response::from_parts(parts, ()))
        .await?;
    if !body.is_empty() {
        stream.send_data(body).await?;
    }
    stream.finish().await?;

    Ok(())
}

/// Dispatch in a child task so a panic answers 500 instead of tearing the
/// connection down.
async fn dispatch_guarded(
    bind: Arc<Binding>,
    request: Request<Body>,
    remote_addr: SocketAddr,
) -> Response {
    let dispatched =
        tokio::spawn(async move { bind.dispatch(request, remote_addr.ip()).await }).await;

    match dispatched {
        Ok(response) => response,
        Err(join_err) => {
            error!(error = %join_err, "recovering from panic in HTTP/3 dispatch");
            (StatusCode::INTERNAL_SERVER_ERROR, "Service not available").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_bodies_accumulate_chunks() {
        let mut body = BytesMut::new();
        body.put(Bytes::from_static(b"hello "));
        body.put(Bytes::from_static(b"world"));
        assert_eq!(body.freeze().as_ref(), b"hello world");
    }
}
