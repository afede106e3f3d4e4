//! TLS certificate material for listeners.
//!
//! Each binding may carry several certificate/key pairs; the resolver picks
//! one by SNI at handshake time, matching the names baked into each
//! certificate (wildcards included) and falling back to the first pair when
//! nothing matches or the client sent no server name.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::config::SslConfig;

/// One loaded certificate chain with the names it is valid for.
struct LoadedCert {
    key: Arc<CertifiedKey>,
    names: Vec<String>,
}

/// SNI-aware certificate source shared by the TCP and QUIC acceptors of a
/// binding.
pub struct SniCertResolver {
    certs: Vec<LoadedCert>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("certs", &self.certs.len())
            .finish()
    }
}

impl SniCertResolver {
    /// Load every configured pair. Paths have already been resolved against
    /// the configuration file directory.
    pub fn load(ssl: &[SslConfig]) -> anyhow::Result<Arc<Self>> {
        if ssl.is_empty() {
            bail!("no SSL certificate configured");
        }

        let mut certs = Vec::with_capacity(ssl.len());
        for entry in ssl {
            let loaded = load_pair(&entry.cert_file_name, &entry.key_file_name)
                .with_context(|| {
                    format!("loading certificate {}", entry.cert_file_name.display())
                })?;
            debug!(
                cert = %entry.cert_file_name.display(),
                names = ?loaded.names,
                "certificate loaded"
            );
            certs.push(loaded);
        }

        Ok(Arc::new(Self { certs }))
    }

    fn resolve_name(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .iter()
            .find(|cert| cert.names.iter().any(|name| name_matches(name, server_name)))
            .map(|cert| cert.key.clone())
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        if let Some(server_name) = client_hello.server_name() {
            if let Some(key) = self.resolve_name(server_name) {
                return Some(key);
            }
        }
        self.certs.first().map(|cert| cert.key.clone())
    }
}

/// Server config for the TCP side of a binding with the given ALPN set.
pub fn server_config(
    resolver: Arc<SniCertResolver>,
    alpn: &[&[u8]],
) -> anyhow::Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Crypto config for the QUIC endpoint of an HTTP/3 binding, with 0-RTT
/// allowed.
pub fn quic_server_config(
    resolver: Arc<SniCertResolver>,
) -> anyhow::Result<quinn::crypto::rustls::QuicServerConfig> {
    let mut config = server_config(resolver, &[b"h3"])?;
    config.max_early_data_size = u32::MAX;
    quinn::crypto::rustls::QuicServerConfig::try_from(config)
        .map_err(|err| anyhow!("building QUIC server config: {err}"))
}

fn load_pair(cert_path: &Path, key_path: &Path) -> anyhow::Result<LoadedCert> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("opening certificate file {}", cert_path.display()))?;
    let mut cert_reader = BufReader::new(cert_file);
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("reading certificate chain")?;
    if chain.is_empty() {
        bail!("no certificates found in {}", cert_path.display());
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("opening key file {}", key_path.display()))?;
    let mut key_reader = BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .context("reading private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|err| anyhow!("unsupported private key type: {err}"))?;

    let names = certificate_names(&chain[0]);
    if names.is_empty() {
        warn!(
            cert = %cert_path.display(),
            "certificate carries no usable names, it will only serve as fallback"
        );
    }

    Ok(LoadedCert {
        key: Arc::new(CertifiedKey::new(chain, signing_key)),
        names,
    })
}

/// DNS names the leaf certificate is valid for: subject alternative names
/// plus the subject common name.
fn certificate_names(leaf: &CertificateDer<'_>) -> Vec<String> {
    let mut names = Vec::new();

    let Ok((_, cert)) = X509Certificate::from_der(leaf.as_ref()) else {
        return names;
    };

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }

    for cn in cert.subject().iter_common_name() {
        if let Ok(value) = cn.as_str() {
            let value = value.to_ascii_lowercase();
            if !names.contains(&value) {
                names.push(value);
            }
        }
    }

    names
}

/// `*.example.com` matches exactly one additional label, per RFC 6125.
fn name_matches(pattern: &str, server_name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match server_name.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        }
    } else {
        pattern == server_name
    }
}
