//! Listeners.
//!
//! A binding terminates one `host:port` on one protocol and routes every
//! request into the matching group. HTTP/1.1 and HTTP/2 are served over TCP
//! by axum-server; HTTP/3 couples a QUIC endpoint with an HTTP/1.1+TLS
//! companion on the same address so clients discover the `Alt-Svc` upgrade.
//!
//! Virtual-host routing scans all groups and keeps overwriting the match, so
//! with overlapping groups the LAST declared one wins. First-match would be
//! the conventional choice; the observed behavior is kept deliberately —
//! existing configurations order their groups around it.

use std::any::Any;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::StatusCode;
use http_body_util::Full;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info};

use crate::config::{BindConfig, Protocol};
use crate::group::Group;
use crate::quic_listener;
use crate::session::SessionAffinity;
use crate::tls::{self, SniCertResolver};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One listening socket with its groups.
pub struct Binding {
    protocol: Protocol,
    address: SocketAddr,
    virtual_host: bool,
    /// Declared in the configuration but not acted upon.
    /// TODO: decide whether plain-HTTP bindings should 301 to their HTTPS
    /// counterpart; the intended semantics was never pinned down.
    #[allow(dead_code)]
    redirect_to_https: bool,
    groups: Vec<Arc<Group>>,
    config: BindConfig,
    handle: Handle,
    quic_endpoint: OnceLock<quinn::Endpoint>,
}

impl Binding {
    /// Build the runtime binding: resolve the listen address and construct
    /// every group (which in turn signs and wires its endpoints).
    pub fn from_config(
        config: &BindConfig,
        affinity: Arc<SessionAffinity>,
    ) -> anyhow::Result<Arc<Self>> {
        let address = config
            .address
            .to_socket_addrs()
            .with_context(|| format!("resolving bind address {:?}", config.address))?
            .next()
            .ok_or_else(|| anyhow!("bind address {:?} resolves to nothing", config.address))?;

        let mut groups = Vec::with_capacity(config.groups.len());
        for group_config in &config.groups {
            match Group::from_config(group_config, affinity.clone()) {
                Ok(group) => groups.push(Arc::new(group)),
                // A broken group must not take the whole binding down.
                Err(err) => error!(group = %group_config.address, error = %err, "error initializing group"),
            }
        }
        if groups.is_empty() {
            bail!("binding {} has no usable groups", config.address);
        }

        Ok(Arc::new(Self {
            protocol: config.protocol_kind(),
            address,
            virtual_host: config.virtual_host,
            redirect_to_https: config.redirect_to_https,
            groups,
            config: config.clone(),
            handle: Handle::new(),
            quic_endpoint: OnceLock::new(),
        }))
    }

    pub fn groups(&self) -> &[Arc<Group>] {
        &self.groups
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address the TCP server actually bound, once it is up. Useful when the
    /// configuration asked for port 0.
    pub async fn listening(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Launch serving in the background and return immediately.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        match self.protocol {
            Protocol::Http1 => self.start_http1(),
            Protocol::Http2 => self.start_http2(),
            Protocol::Http3 => self.start_http3(),
        }
    }

    /// Graceful shutdown with a bounded grace period, TCP side first, then
    /// the QUIC endpoint if one exists.
    pub async fn stop(&self) {
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.handle.connection_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(endpoint) = self.quic_endpoint.get() {
            endpoint.close(0u32.into(), b"shutdown");
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, endpoint.wait_idle()).await;
        }
    }

    fn start_http1(self: &Arc<Self>) -> anyhow::Result<()> {
        let service = self
            .router(false)
            .into_make_service_with_connect_info::<SocketAddr>();

        // Plaintext unless certificates are configured and load cleanly.
        let rustls_config = if self.config.ssl.is_empty() {
            None
        } else {
            match SniCertResolver::load(&self.config.ssl)
                .and_then(|resolver| tls::server_config(resolver, &[b"http/1.1"]))
            {
                Ok(config) => Some(RustlsConfig::from_config(Arc::new(config))),
                Err(err) => {
                    error!(error = %err, "error loading TLS SNI certificate and key");
                    None
                }
            }
        };

        let address = self.address;
        let handle = self.handle.clone();
        let this = self.clone();

        tokio::spawn(async move {
            let served = match rustls_config {
                Some(config) => {
                    info!(%address, "HTTP/1.1 listener starting (TLS)");
                    let mut server = axum_server::bind_rustls(address, config).handle(handle);
                    this.apply_http_config(&mut server);
                    server.serve(service).await
                }
                None => {
                    info!(%address, "HTTP/1.1 listener starting");
                    let mut server = axum_server::bind(address).handle(handle);
                    this.apply_http_config(&mut server);
                    server.serve(service).await
                }
            };
            if let Err(err) = served {
                error!(%address, error = %err, "unable to start binding");
            }
        });

        Ok(())
    }

    fn start_http2(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.ssl.is_empty() {
            bail!("cannot start HTTP/2 without SSL certificate");
        }

        let resolver = SniCertResolver::load(&self.config.ssl)?;
        let tls_config = tls::server_config(resolver, &[b"h2", b"http/1.1"])?;
        let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));

        let service = self
            .router(false)
            .into_make_service_with_connect_info::<SocketAddr>();
        let address = self.address;
        let handle = self.handle.clone();
        let this = self.clone();

        tokio::spawn(async move {
            info!(%address, "HTTP/2 listener starting");
            let mut server = axum_server::bind_rustls(address, rustls_config).handle(handle);
            this.apply_http_config(&mut server);
            if let Err(err) = server.serve(service).await {
                error!(%address, error = %err, "unable to start binding");
            }
        });

        Ok(())
    }

    /// HTTP/3 runs two coupled servers sharing the dispatch: the QUIC
    /// endpoint itself and an HTTP/1.1+TLS companion that advertises it.
    fn start_http3(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.config.ssl.is_empty() {
            bail!("cannot start HTTP/3 without SSL certificate");
        }

        let resolver = SniCertResolver::load(&self.config.ssl)?;
        let tls_config = tls::server_config(resolver.clone(), &[b"h2", b"http/1.1"])?;
        let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));

        let mut server_config =
            quinn::ServerConfig::with_crypto(Arc::new(tls::quic_server_config(resolver)?));
        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(
            self.config
                .idle_timeout()
                .try_into()
                .map_err(|_| anyhow!("idle timeout too large for QUIC"))?,
        ));
        server_config.transport = Arc::new(transport);

        let endpoint = quinn::Endpoint::server(server_config, self.address)
            .with_context(|| format!("binding QUIC endpoint on {}", self.address))?;
        let _ = self.quic_endpoint.set(endpoint.clone());

        info!(address = %self.address, "HTTP/3 listener starting");
        tokio::spawn(quic_listener::run(self.clone(), endpoint.clone()));

        let service = self
            .router(true)
            .into_make_service_with_connect_info::<SocketAddr>();
        let address = self.address;
        let handle = self.handle.clone();
        let this = self.clone();

        let tcp_task = tokio::spawn(async move {
            let mut server = axum_server::bind_rustls(address, rustls_config).handle(handle);
            this.apply_http_config(&mut server);
            server.serve(service).await
        });

        // A dead TLS companion closes the QUIC endpoint. A dead QUIC
        // endpoint leaves the TLS companion running; requests keep being
        // served over TCP without the upgrade path.
        tokio::spawn(async move {
            match tcp_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(%address, error = %err, "TLS companion failed, closing QUIC endpoint");
                    endpoint.close(0u32.into(), b"tls companion failed");
                }
                Err(join_err) => {
                    error!(%address, error = %join_err, "TLS companion task aborted, closing QUIC endpoint");
                    endpoint.close(0u32.into(), b"tls companion failed");
                }
            }
        });

        Ok(())
    }

    fn apply_http_config<A>(&self, server: &mut axum_server::Server<A>) {
        server
            .http_builder()
            .http1()
            .header_read_timeout(self.config.read_header_timeout())
            .keep_alive(true)
            .max_buf_size(self.config.max_header_bytes());
    }

    fn router(self: &Arc<Self>, with_alt_svc: bool) -> Router {
        let mut router = Router::new()
            .fallback(any(dispatch_handler))
            .with_state(self.clone());

        if with_alt_svc {
            router = router.layer(middleware::from_fn_with_state(
                self.clone(),
                alt_svc_middleware,
            ));
        }

        // The panic guard must stay outermost.
        router.layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(TimeoutLayer::new(self.config.write_timeout()))
                .into_inner(),
        )
    }

    /// Route a request into its group and dispatch it. Shared by the TCP
    /// handler and the HTTP/3 accept loop.
    pub async fn dispatch(&self, request: Request<Body>, client_ip: std::net::IpAddr) -> Response {
        let path = request.uri().path().to_string();

        let group = if self.virtual_host {
            let host = request_host(&request);
            self.grab_group(&host, &path)
        } else {
            // Without hostname distinction the first group serves everything
            // its path allows.
            let first = &self.groups[0];
            if first.is_path_compliant(&path) {
                Some(first.clone())
            } else {
                debug!(%path, "path not compliant with the only group running");
                None
            }
        };

        match group {
            Some(group) => group.handle(request, client_ip).await,
            None => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service not available").into_response()
            }
        }
    }

    /// Last matching group wins; see the module docs.
    fn grab_group(&self, host: &str, path: &str) -> Option<Arc<Group>> {
        let mut found = None;
        for group in &self.groups {
            if group.address() == host && group.is_path_compliant(path) {
                found = Some(group.clone());
            }
        }
        found
    }

    /// QUIC advertisement value for this binding.
    pub fn alt_svc_value(&self) -> String {
        format!("h3=\":{}\"; ma=86400", self.address.port())
    }
}

async fn dispatch_handler(
    State(bind): State<Arc<Binding>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    bind.dispatch(request, client_addr.ip()).await
}

/// Stamp the QUIC advertisement on every response of the TLS companion.
async fn alt_svc_middleware(
    State(bind): State<Arc<Binding>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&bind.alt_svc_value()) {
        response.headers_mut().insert("alt-svc", value);
    }
    response
}

/// Convert a panic anywhere under the router into a 500 and keep serving.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> http::Response<Full<Bytes>> {
    let details = if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else {
        "unknown panic payload"
    };
    error!(panic = details, "recovering from panic in request handler");

    http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::from("Service not available"))
        .unwrap_or_else(|_| http::Response::new(Full::from("")))
}

/// Hostname from the `Host` header (or the URI authority for HTTP/2+),
/// without any port suffix.
fn request_host(request: &Request<Body>) -> String {
    let raw = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    raw.split(':').next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, GroupConfig};

    fn binding(groups: Vec<GroupConfig>, virtual_host: bool) -> Arc<Binding> {
        let config = BindConfig {
            address: "127.0.0.1:0".into(),
            virtual_host,
            groups,
            ..Default::default()
        };
        Binding::from_config(&config, Arc::new(SessionAffinity::default())).unwrap()
    }

    fn group_config(address: &str, path: &str) -> GroupConfig {
        GroupConfig {
            address: address.into(),
            path: path.into(),
            endpoints: vec![EndpointConfig {
                address: format!("http://10.0.0.1:80{path}"),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn grab_group_last_match_wins() {
        let bind = binding(
            vec![
                group_config("example.com", "/"),
                group_config("example.com", "/api"),
            ],
            true,
        );

        let chosen = bind.grab_group("example.com", "/api/x").unwrap();
        assert_eq!(chosen.path(), "/api");

        let root = bind.grab_group("example.com", "/web").unwrap();
        assert_eq!(root.path(), "/");

        assert!(bind.grab_group("other.com", "/api/x").is_none());
    }

    #[test]
    fn grab_group_requires_path_compliance() {
        let bind = binding(vec![group_config("example.com", "/api")], true);
        assert!(bind.grab_group("example.com", "/web").is_none());
        assert!(bind.grab_group("example.com", "/api").is_some());
    }

    #[test]
    fn alt_svc_value_carries_port() {
        let config = BindConfig {
            address: "127.0.0.1:8443".into(),
            groups: vec![group_config("example.com", "")],
            ..Default::default()
        };
        let bind = Binding::from_config(&config, Arc::new(SessionAffinity::default())).unwrap();
        assert_eq!(bind.alt_svc_value(), "h3=\":8443\"; ma=86400");
    }

    #[test]
    fn tls_protocols_require_ssl_to_start() {
        let config = BindConfig {
            address: "127.0.0.1:0".into(),
            protocol: "HTTP/2".into(),
            groups: vec![group_config("example.com", "")],
            ..Default::default()
        };
        let bind = Binding::from_config(&config, Arc::new(SessionAffinity::default())).unwrap();
        assert!(bind.start().is_err());
    }
}
