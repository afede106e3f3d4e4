//! Stateless session persistence.
//!
//! A client is pinned to an endpoint through a cookie carrying the endpoint's
//! signature. Nothing is kept server-side: the signature is deterministic, so
//! affinity survives process restarts as long as the configuration does not
//! change. Flipping the configured cookie attributes changes every signature
//! and thereby invalidates outstanding cookies.

use std::sync::Arc;

use http::header::{HeaderMap, COOKIE};

use crate::config::SessionPersistenceConfig;
use crate::endpoint::Endpoint;

const DEFAULT_COOKIE_NAME: &str = "_gbsps";

/// Process-wide affinity settings, shared down to every group.
#[derive(Debug, Default)]
pub struct SessionAffinity {
    cookie_name: String,
    cookie_settings: Vec<String>,
}

impl SessionAffinity {
    pub fn from_config(config: &SessionPersistenceConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            cookie_settings: config.cookie_settings.clone(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        if self.cookie_name.is_empty() {
            DEFAULT_COOKIE_NAME
        } else {
            &self.cookie_name
        }
    }

    /// Cookie attributes concatenated for signature derivation.
    pub fn signature_seed(&self) -> String {
        self.cookie_settings.concat()
    }

    /// First affinity-cookie value present on the request, if any.
    pub fn cookie_value(&self, headers: &HeaderMap) -> Option<String> {
        let name = self.cookie_name();
        for header in headers.get_all(COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            for pair in raw.split(';') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                if key.trim() == name {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }

    /// Endpoint the request's cookie points at, if the signature matches one.
    pub fn find(&self, headers: &HeaderMap, endpoints: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        let wanted = self.cookie_value(headers)?;
        endpoints
            .iter()
            .find(|endpoint| endpoint.signature() == wanted)
            .cloned()
    }

    /// `Set-Cookie` value pinning the client to `endpoint`.
    pub fn format_set_cookie(&self, group_path: &str, endpoint: &Endpoint) -> String {
        let mut cookie = format!("{}={}", self.cookie_name(), endpoint.signature());

        if !group_path.is_empty() {
            cookie.push_str("; Path=");
            cookie.push_str(group_path);
        }

        if !self.cookie_settings.is_empty() {
            cookie.push_str("; ");
            cookie.push_str(&self.cookie_settings.join("; "));
        }

        cookie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use http::HeaderValue;

    fn affinity(settings: &[&str]) -> SessionAffinity {
        SessionAffinity {
            cookie_name: String::new(),
            cookie_settings: settings.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn endpoint(address: &str, affinity: &SessionAffinity) -> Arc<Endpoint> {
        let config = EndpointConfig {
            address: address.to_string(),
            ..Default::default()
        };
        Endpoint::new(&config, "/", affinity).unwrap()
    }

    #[test]
    fn default_cookie_name_applies() {
        assert_eq!(affinity(&[]).cookie_name(), "_gbsps");

        let named = SessionAffinity {
            cookie_name: "affinity".into(),
            cookie_settings: Vec::new(),
        };
        assert_eq!(named.cookie_name(), "affinity");
    }

    #[test]
    fn cookie_value_found_among_others() {
        let aff = affinity(&[]);
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; _gbsps=abc123"));

        assert_eq!(aff.cookie_value(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn cookie_value_across_multiple_headers() {
        let aff = affinity(&[]);
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(COOKIE, HeaderValue::from_static("_gbsps=zzz"));

        assert_eq!(aff.cookie_value(&headers).as_deref(), Some("zzz"));
    }

    #[test]
    fn missing_cookie_yields_none() {
        let aff = affinity(&[]);
        let headers = HeaderMap::new();
        assert!(aff.cookie_value(&headers).is_none());
        assert!(aff.find(&headers, &[]).is_none());
    }

    #[test]
    fn find_matches_signature() {
        let aff = affinity(&["HttpOnly"]);
        let a = endpoint("http://10.0.0.1:8080", &aff);
        let b = endpoint("http://10.0.0.2:8080", &aff);

        let mut headers = HeaderMap::new();
        let cookie = format!("_gbsps={}", b.signature());
        headers.append(COOKIE, HeaderValue::from_str(&cookie).unwrap());

        let found = aff.find(&headers, &[a, b.clone()]).unwrap();
        assert_eq!(found.signature(), b.signature());
    }

    #[test]
    fn set_cookie_format() {
        let aff = affinity(&["HttpOnly", "SameSite=Lax"]);
        let ep = endpoint("http://10.0.0.1:8080", &aff);

        let cookie = aff.format_set_cookie("/api", &ep);
        assert_eq!(
            cookie,
            format!("_gbsps={}; Path=/api; HttpOnly; SameSite=Lax", ep.signature())
        );

        let bare = affinity(&[]);
        let ep2 = endpoint("http://10.0.0.1:8080", &bare);
        assert_eq!(
            bare.format_set_cookie("", &ep2),
            format!("_gbsps={}", ep2.signature())
        );
    }
}
