//! Configuration model.
//!
//! The configuration is a single JSON document (default `./conf.json`,
//! overridable with `--conf`). Certificate and key file references are
//! resolved relative to the directory containing the configuration file.
//! Duration values are strings such as `"15s"`; an unparsable duration is
//! logged and replaced with the documented default rather than failing
//! startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Default configuration file name, looked up in the working directory.
pub const CONF_FILE_NAME: &str = "conf.json";

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub global: GlobalConfig,
    pub settings: Settings,
    /// Directory of the configuration file. Derived at load time, never read
    /// from the document itself.
    #[serde(skip)]
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub logger: LoggerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    pub enable_debug: bool,
}

/// Load-balancer settings: bindings plus the process-wide knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub health_check_interval: Option<String>,
    pub session_persistence_details: SessionPersistenceConfig,
    pub bindings: Vec<BindConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPersistenceConfig {
    /// Affinity cookie name; empty means the built-in `_gbsps`.
    pub cookie_name: String,
    /// Raw cookie attribute strings appended to `Set-Cookie`
    /// (e.g. `HttpOnly`, `Secure`, `SameSite=Lax`). The list participates in
    /// endpoint signature derivation, so changing it invalidates outstanding
    /// affinity cookies.
    pub cookie_settings: Vec<String>,
}

/// One listening socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindConfig {
    /// `HTTP/1.1` (default), `HTTP/2` or `HTTP/3`, case-insensitive.
    pub protocol: String,
    /// Declared but not yet enforced; see DESIGN.md.
    pub redirect_to_https: bool,
    /// `host:port` to bind.
    pub address: String,
    /// When false every request is routed to the first group regardless of
    /// the `Host` header.
    pub virtual_host: bool,
    pub ssl: Vec<SslConfig>,
    pub groups: Vec<GroupConfig>,
    // The legacy key spelling (`readTimout` etc.) is what existing
    // configuration files carry; both spellings are accepted.
    #[serde(alias = "readTimout")]
    pub read_timeout: Option<String>,
    #[serde(alias = "readHeaderTimout")]
    pub read_header_timeout: Option<String>,
    #[serde(alias = "writeTimout")]
    pub write_timeout: Option<String>,
    #[serde(alias = "idleTimout")]
    pub idle_timeout: Option<String>,
    pub max_header_bytes: usize,
}

/// One SNI certificate entry. File names are relative to the configuration
/// file directory until [`Config::load`] resolves them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConfig {
    pub cert_file_name: PathBuf,
    pub key_file_name: PathBuf,
}

/// A virtual-host + path scope owning a set of endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupConfig {
    /// Hostname matched against the request `Host` when virtual hosting is on.
    pub address: String,
    /// Path prefix the request must begin with; empty matches any path.
    pub path: String,
    pub session_persistence: bool,
    /// `roundrobin` (default) or `failover`, case-insensitive.
    pub algorithm: String,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointConfig {
    /// Upstream origin URL: scheme + host[:port], optional path.
    pub address: String,
    pub tls_insecure_skip_verify: bool,
    /// When set, overrides the outbound host/scheme and prefix-rewrites the
    /// request path.
    pub proxy_pass: Option<String>,
    /// Rewrite upstream `Location` headers by stripping the `proxyPass` path
    /// prefix.
    pub proxy_redirect: bool,
}

impl Config {
    /// Read and parse the configuration file, deriving `base_path` from its
    /// location and resolving every SSL file reference against it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;

        let mut config: Config = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;

        config.base_path = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        for bind in &mut config.settings.bindings {
            for ssl in &mut bind.ssl {
                ssl.cert_file_name = config.base_path.join(&ssl.cert_file_name);
                ssl.key_file_name = config.base_path.join(&ssl.key_file_name);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Structural checks that must hold before anything starts listening.
    pub fn validate(&self) -> anyhow::Result<()> {
        for bind in &self.settings.bindings {
            if bind.address.is_empty() {
                bail!("binding without an address");
            }
            if bind.groups.is_empty() {
                bail!("binding {} has no groups", bind.address);
            }
            for group in &bind.groups {
                if group.endpoints.is_empty() {
                    bail!(
                        "group {:?} on binding {} has no endpoints",
                        group.address,
                        bind.address
                    );
                }
            }
            if matches!(bind.protocol_kind(), Protocol::Http2 | Protocol::Http3)
                && bind.ssl.is_empty()
            {
                bail!(
                    "cannot bind {} as {} without an SSL certificate",
                    bind.address,
                    bind.protocol
                );
            }
        }
        Ok(())
    }

    /// Health probe interval with the 15 s default.
    pub fn health_check_interval(&self) -> Duration {
        duration_or_default(
            self.settings.health_check_interval.as_deref(),
            DEFAULT_HEALTH_CHECK_INTERVAL,
        )
    }
}

/// Listener protocol choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl BindConfig {
    /// Parsed protocol; unknown strings fall back to HTTP/1.1.
    pub fn protocol_kind(&self) -> Protocol {
        match self.protocol.to_ascii_uppercase().as_str() {
            "HTTP/2" => Protocol::Http2,
            "HTTP/3" => Protocol::Http3,
            _ => Protocol::Http1,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        duration_or_default(self.read_timeout.as_deref(), DEFAULT_READ_TIMEOUT)
    }

    pub fn read_header_timeout(&self) -> Duration {
        duration_or_default(
            self.read_header_timeout.as_deref(),
            DEFAULT_READ_HEADER_TIMEOUT,
        )
    }

    pub fn write_timeout(&self) -> Duration {
        duration_or_default(self.write_timeout.as_deref(), DEFAULT_WRITE_TIMEOUT)
    }

    pub fn idle_timeout(&self) -> Duration {
        duration_or_default(self.idle_timeout.as_deref(), DEFAULT_IDLE_TIMEOUT)
    }

    pub fn max_header_bytes(&self) -> usize {
        if self.max_header_bytes == 0 {
            DEFAULT_MAX_HEADER_BYTES
        } else {
            self.max_header_bytes
        }
    }
}

/// Resolve an optional duration string, logging and substituting the default
/// when the value is absent or unparsable.
pub fn duration_or_default(raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw else {
        return default;
    };
    match parse_duration(raw) {
        Ok(duration) => duration,
        Err(err) => {
            error!(value = raw, %err, "unparsable duration, using default");
            default
        }
    }
}

/// Parse duration strings of the form `500ms`, `5s`, `2m`, `1h`. A bare
/// number is taken as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => bail!("unknown duration unit {other:?} in {s:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn duration_fallback_on_garbage() {
        assert_eq!(
            duration_or_default(Some("not-a-duration"), DEFAULT_READ_TIMEOUT),
            DEFAULT_READ_TIMEOUT
        );
        assert_eq!(
            duration_or_default(None, DEFAULT_IDLE_TIMEOUT),
            DEFAULT_IDLE_TIMEOUT
        );
        assert_eq!(
            duration_or_default(Some("30s"), DEFAULT_IDLE_TIMEOUT),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn protocol_parsing_is_case_insensitive() {
        let mut bind = BindConfig::default();
        assert_eq!(bind.protocol_kind(), Protocol::Http1);

        bind.protocol = "http/2".into();
        assert_eq!(bind.protocol_kind(), Protocol::Http2);

        bind.protocol = "HTTP/3".into();
        assert_eq!(bind.protocol_kind(), Protocol::Http3);

        bind.protocol = "SPDY".into();
        assert_eq!(bind.protocol_kind(), Protocol::Http1);
    }

    #[test]
    fn timeout_defaults_apply() {
        let bind = BindConfig::default();
        assert_eq!(bind.read_timeout(), DEFAULT_READ_TIMEOUT);
        assert_eq!(bind.read_header_timeout(), DEFAULT_READ_HEADER_TIMEOUT);
        assert_eq!(bind.write_timeout(), DEFAULT_WRITE_TIMEOUT);
        assert_eq!(bind.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(bind.max_header_bytes(), DEFAULT_MAX_HEADER_BYTES);
    }

    #[test]
    fn validate_rejects_tls_protocols_without_ssl() {
        let config: Config = serde_json::from_str(
            r#"{
                "settings": {
                    "bindings": [{
                        "protocol": "HTTP/2",
                        "address": "0.0.0.0:443",
                        "groups": [{
                            "address": "example.com",
                            "endpoints": [{"address": "http://10.0.0.1:8080"}]
                        }]
                    }]
                }
            }"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
