//! Backend endpoints and the upstream forward path.
//!
//! An `Endpoint` owns everything needed to reach one backend origin: the
//! parsed target, an HTTP client built once at group start, the liveness and
//! in-flight-request atomics, and the signature used by stateless session
//! persistence. `serve` carries the same-endpoint rung of the retry ladder;
//! the cross-endpoint rung lives in the owning group.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use axum::body::Body;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, HOST, LOCATION};
use http::request::Parts;
use http::uri::{Authority, Scheme, Uri};
use http::Request;
use http_body_util::Full;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::EndpointConfig;
use crate::session::SessionAffinity;

/// Cap on each rung of the retry ladder.
pub const MAX_RETRY: u32 = 3;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Headers that belong to a single hop and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request retry counters, threaded by reference through the dispatch
/// path. Both are monotone within a request.
#[derive(Debug, Default)]
pub struct DispatchState {
    pub retry_same_endpoint: u32,
    pub retry_another_endpoint: u32,
}

/// Why a forward attempt gave up on this endpoint.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The client went away; nothing should be written or retried.
    #[error("upstream round trip cancelled by the client")]
    Canceled,
    /// Same-endpoint retries are exhausted; the group may pick another.
    #[error("endpoint exhausted its retry budget")]
    Exhausted,
}

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Outbound override derived from `proxyPass`.
#[derive(Debug)]
struct ProxyPass {
    scheme: Scheme,
    authority: Authority,
    /// Always non-empty; `Uri` normalizes an absent path to `/`.
    path: String,
}

/// One backend origin with its runtime state.
#[derive(Debug)]
pub struct Endpoint {
    address: String,
    scheme: Scheme,
    authority: Authority,
    proxy_pass: Option<ProxyPass>,
    proxy_redirect: bool,
    group_path: String,
    signature: String,
    client: UpstreamClient,
    active_connections: AtomicU64,
    alive: AtomicBool,
}

impl Endpoint {
    /// Build the runtime endpoint: parse the target, derive the affinity
    /// signature, construct the upstream client. Endpoints start dead until
    /// the first health sweep.
    pub fn new(
        config: &EndpointConfig,
        group_path: &str,
        affinity: &SessionAffinity,
    ) -> anyhow::Result<Arc<Self>> {
        let address: Uri = config
            .address
            .parse()
            .with_context(|| format!("invalid endpoint address {:?}", config.address))?;
        let scheme = address
            .scheme()
            .cloned()
            .ok_or_else(|| anyhow!("endpoint address {:?} has no scheme", config.address))?;
        let authority = address
            .authority()
            .cloned()
            .ok_or_else(|| anyhow!("endpoint address {:?} has no host", config.address))?;

        let proxy_pass = match config.proxy_pass.as_deref() {
            Some(raw) => {
                let uri: Uri = raw
                    .parse()
                    .with_context(|| format!("invalid proxyPass {raw:?}"))?;
                let scheme = uri
                    .scheme()
                    .cloned()
                    .ok_or_else(|| anyhow!("proxyPass {raw:?} has no scheme"))?;
                let authority = uri
                    .authority()
                    .cloned()
                    .ok_or_else(|| anyhow!("proxyPass {raw:?} has no host"))?;
                Some(ProxyPass {
                    scheme,
                    authority,
                    path: uri.path().to_string(),
                })
            }
            None => None,
        };

        Ok(Arc::new(Self {
            signature: sign(&config.address, group_path, affinity),
            address: config.address.clone(),
            scheme,
            authority,
            proxy_pass,
            proxy_redirect: config.proxy_redirect,
            group_path: group_path.to_string(),
            client: build_client(config.tls_insecure_skip_verify)?,
            active_connections: AtomicU64::new(0),
            alive: AtomicBool::new(false),
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Forward one request to this backend, retrying transient faults until
    /// the same-endpoint budget runs out. On exhaustion the endpoint is
    /// marked dead and the caller re-balances.
    pub async fn serve(
        &self,
        parts: &Parts,
        body: Bytes,
        state: &mut DispatchState,
        client_ip: IpAddr,
    ) -> Result<Response, ForwardError> {
        let _guard = ConnectionGuard::acquire(&self.active_connections);

        loop {
            match self.forward_once(parts, body.clone(), client_ip).await {
                Ok(response) => return Ok(response),
                Err(err) if is_client_cancel(&err) => {
                    debug!(endpoint = %self.address, "client cancelled in-flight request");
                    return Err(ForwardError::Canceled);
                }
                Err(err) => {
                    debug!(endpoint = %self.address, error = %err, "upstream round trip failed");
                    if state.retry_same_endpoint < MAX_RETRY {
                        state.retry_same_endpoint += 1;
                        continue;
                    }
                    self.set_alive(false);
                    return Err(ForwardError::Exhausted);
                }
            }
        }
    }

    async fn forward_once(
        &self,
        parts: &Parts,
        body: Bytes,
        client_ip: IpAddr,
    ) -> anyhow::Result<Response> {
        let path = self.rewrite_path(parts.uri.path());
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        let (scheme, authority) = match &self.proxy_pass {
            Some(pass) => (pass.scheme.clone(), pass.authority.clone()),
            None => (self.scheme.clone(), self.authority.clone()),
        };

        let uri = Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build()
            .context("assembling upstream uri")?;

        let mut headers = HeaderMap::with_capacity(parts.headers.len() + 2);
        for (name, value) in &parts.headers {
            if HOP_BY_HOP.contains(&name.as_str()) || name == &HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        // The inbound Host travels upstream untouched unless proxyPass
        // redirects the request at a different origin.
        let host = match &self.proxy_pass {
            Some(pass) => HeaderValue::from_str(pass.authority.as_str()).ok(),
            None => inbound_host(parts),
        };
        if let Some(host) = host {
            headers.insert(HOST, host);
        }

        let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }

        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(Full::new(body))
            .context("assembling upstream request")?;
        *request.headers_mut() = headers;

        let response = self
            .client
            .request(request)
            .await
            .context("upstream request")?;

        let (mut response_parts, upstream_body) = response.into_parts();
        self.rewrite_location(&mut response_parts.headers);

        Ok(Response::from_parts(response_parts, Body::new(upstream_body)))
    }

    /// Outbound path. Without `proxyPass` the inbound path passes through
    /// unchanged; with it, the group path prefix is stripped once and the
    /// remainder joined onto the `proxyPass` path.
    fn rewrite_path(&self, inbound: &str) -> String {
        let Some(pass) = &self.proxy_pass else {
            return inbound.to_string();
        };

        let group_path = self.group_path.as_str();
        let remainder = if inbound == group_path || (inbound == "/" && group_path == "/") {
            "/".to_string()
        } else {
            inbound.replacen(group_path, "", 1)
        };

        join_url_path(&pass.path, &remainder)
    }

    /// Append a `Location` header with the `proxyPass` path prefix stripped,
    /// leaving the upstream's own header in place. Relative locations pass
    /// through untouched.
    fn rewrite_location(&self, headers: &mut HeaderMap) {
        if !self.proxy_redirect {
            return;
        }
        let Some(pass) = &self.proxy_pass else {
            return;
        };
        let Some(location) = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            return;
        };
        if location.starts_with('.') || !location.starts_with('/') {
            return;
        }

        let stripped = location.replacen(pass.path.as_str(), "", 1);
        if stripped.is_empty() {
            return;
        }
        if let Ok(value) = HeaderValue::from_str(&stripped) {
            headers.append(LOCATION, value);
        }
    }

    /// TCP-connect liveness probe with a 5 s deadline. No HTTP exchange.
    pub async fn health_check(&self) {
        let target = self.probe_address();
        let alive = matches!(
            tokio::time::timeout(HEALTH_PROBE_TIMEOUT, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        );
        self.alive.store(alive, Ordering::Release);
    }

    fn probe_address(&self) -> String {
        let host = self.authority.host();
        let port = self.authority.port_u16().unwrap_or_else(|| {
            if self.scheme == Scheme::HTTPS {
                443
            } else {
                80
            }
        });
        format!("{host}:{port}")
    }
}

/// In-flight request accounting; the decrement rides `Drop` so panics and
/// cancellations cannot leak a count.
struct ConnectionGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> ConnectionGuard<'a> {
    fn acquire(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Stable endpoint identity for stateless affinity: SHA-1 over the address,
/// the group path, and the configured cookie attributes, URL-safe base64.
fn sign(address: &str, group_path: &str, affinity: &SessionAffinity) -> String {
    let mut hasher = Sha1::new();
    hasher.update(address.as_bytes());
    if !group_path.is_empty() {
        hasher.update(group_path.as_bytes());
    }
    hasher.update(affinity.signature_seed().as_bytes());
    URL_SAFE.encode(hasher.finalize())
}

fn inbound_host(parts: &Parts) -> Option<HeaderValue> {
    if let Some(host) = parts.headers.get(HOST) {
        return Some(host.clone());
    }
    parts
        .uri
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
}

fn join_url_path(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        if base.is_empty() {
            return "/".to_string();
        }
        return base.to_string();
    }
    format!("{base}/{rest}")
}

fn is_client_cancel(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<hyper::Error>()
            .map(hyper::Error::is_canceled)
            .unwrap_or(false)
    })
}

fn build_client(tls_insecure_skip_verify: bool) -> anyhow::Result<UpstreamClient> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let tls = if tls_insecure_skip_verify {
        rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .context("tls protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("tls protocol versions")?
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .build(connector))
}

/// Accepts any upstream certificate; selected per endpoint by
/// `tlsInsecureSkipVerify`.
#[derive(Debug)]
struct InsecureCertVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
