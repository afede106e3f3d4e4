//! Endpoint groups.
//!
//! A group is the unit balancing and session affinity operate over: one
//! virtual host + path prefix owning an ordered endpoint pool and a policy.
//! `handle` runs the cross-endpoint rung of the retry ladder; the
//! same-endpoint rung is inside `Endpoint::serve`.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::bail;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{HeaderValue, SET_COOKIE};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, error};

use crate::balancer::{self, BalanceError, Balancer};
use crate::config::GroupConfig;
use crate::endpoint::{DispatchState, Endpoint, ForwardError, MAX_RETRY};
use crate::session::SessionAffinity;

const SERVICE_NOT_AVAILABLE: &str = "Service not available";

pub struct Group {
    address: String,
    path: String,
    session_persistence: bool,
    endpoints: Vec<Arc<Endpoint>>,
    balancer: Box<dyn Balancer>,
    affinity: Arc<SessionAffinity>,
}

impl Group {
    pub fn from_config(
        config: &GroupConfig,
        affinity: Arc<SessionAffinity>,
    ) -> anyhow::Result<Self> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint_config in &config.endpoints {
            endpoints.push(Endpoint::new(endpoint_config, &config.path, &affinity)?);
        }

        // Affinity cookies carry signatures, so two endpoints hashing alike
        // would be indistinguishable to returning clients.
        for (i, a) in endpoints.iter().enumerate() {
            for b in &endpoints[i + 1..] {
                if a.signature() == b.signature() {
                    bail!(
                        "endpoints {} and {} in group {:?} produce the same signature",
                        a.address(),
                        b.address(),
                        config.address
                    );
                }
            }
        }

        Ok(Self {
            address: config.address.clone(),
            path: config.path.clone(),
            session_persistence: config.session_persistence,
            endpoints,
            balancer: balancer::from_algorithm(&config.algorithm),
            affinity,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// True iff the group accepts this request path.
    pub fn is_path_compliant(&self, path: &str) -> bool {
        self.path.is_empty() || path.starts_with(&self.path)
    }

    /// Dispatch one request. The caller has already verified path
    /// compliance.
    pub async fn handle(&self, request: Request<Body>, client_ip: IpAddr) -> Response {
        let (parts, body) = request.into_parts();

        // Ladder attempts replay the request, so the inbound body is
        // collected once up front; responses stream through untouched.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                debug!(error = %err, "failed reading request body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        let mut state = DispatchState::default();

        loop {
            let (endpoint, set_cookie) = match self.choose(&parts.headers) {
                Ok(choice) => choice,
                Err(err) => {
                    debug!(group = %self.address, error = %err, "no endpoint to serve request");
                    return (StatusCode::SERVICE_UNAVAILABLE, SERVICE_NOT_AVAILABLE)
                        .into_response();
                }
            };

            debug!(endpoint = %endpoint.address(), "chosen endpoint");

            match endpoint.serve(&parts, body.clone(), &mut state, client_ip).await {
                Ok(mut response) => {
                    if let Some(cookie) = set_cookie {
                        match HeaderValue::from_str(&cookie) {
                            Ok(value) => {
                                response.headers_mut().append(SET_COOKIE, value);
                            }
                            Err(err) => {
                                error!(error = %err, "affinity cookie is not a valid header")
                            }
                        }
                    }
                    return response;
                }
                Err(ForwardError::Canceled) => {
                    // The client is gone; the status below is never read.
                    return StatusCode::BAD_GATEWAY.into_response();
                }
                Err(ForwardError::Exhausted) => {
                    if state.retry_another_endpoint < MAX_RETRY {
                        state.retry_another_endpoint += 1;
                        continue;
                    }
                    debug!(group = %self.address, "retried too many endpoints, giving up");
                    return (StatusCode::SERVICE_UNAVAILABLE, SERVICE_NOT_AVAILABLE)
                        .into_response();
                }
            }
        }
    }

    /// Pick the endpoint for this attempt, plus the affinity cookie to set
    /// when a fresh selection established a new session.
    fn choose(
        &self,
        headers: &http::HeaderMap,
    ) -> Result<(Arc<Endpoint>, Option<String>), BalanceError> {
        if self.session_persistence {
            if let Some(pinned) = self.affinity.find(headers, &self.endpoints) {
                if pinned.is_alive() {
                    return Ok((pinned, None));
                }
                debug!(endpoint = %pinned.address(), "pinned endpoint is dead, rebalancing");
            }
            let endpoint = self.get_balanced_endpoint()?;
            let cookie = self.affinity.format_set_cookie(&self.path, &endpoint);
            return Ok((endpoint, Some(cookie)));
        }

        Ok((self.get_balanced_endpoint()?, None))
    }

    /// Policy selection with the small-pool shortcuts.
    fn get_balanced_endpoint(&self) -> Result<Arc<Endpoint>, BalanceError> {
        match self.endpoints.len() {
            0 => Err(BalanceError::Empty),
            1 => {
                let endpoint = &self.endpoints[0];
                if endpoint.is_alive() {
                    Ok(endpoint.clone())
                } else {
                    Err(BalanceError::SoleEndpointDown)
                }
            }
            _ => self.balancer.select(&self.endpoints),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;

    fn group_config(path: &str, endpoints: &[&str]) -> GroupConfig {
        GroupConfig {
            address: "example.com".into(),
            path: path.into(),
            endpoints: endpoints
                .iter()
                .map(|address| EndpointConfig {
                    address: address.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn group(config: GroupConfig) -> Group {
        Group::from_config(&config, Arc::new(SessionAffinity::default())).unwrap()
    }

    #[test]
    fn path_compliance() {
        let api = group(group_config("/api", &["http://10.0.0.1:80"]));
        assert!(api.is_path_compliant("/api"));
        assert!(api.is_path_compliant("/api/users"));
        assert!(!api.is_path_compliant("/web"));

        let any = group(group_config("", &["http://10.0.0.1:80"]));
        assert!(any.is_path_compliant("/anything"));
        assert!(any.is_path_compliant("/"));
    }

    #[test]
    fn duplicate_signatures_are_rejected() {
        let config = group_config("/api", &["http://10.0.0.1:80", "http://10.0.0.1:80"]);
        let result = Group::from_config(&config, Arc::new(SessionAffinity::default()));
        assert!(result.is_err());
    }

    #[test]
    fn sole_endpoint_bypasses_policy() {
        let group = group(group_config("", &["http://10.0.0.1:80"]));

        assert_eq!(
            group.get_balanced_endpoint().unwrap_err(),
            BalanceError::SoleEndpointDown
        );

        group.endpoints[0].set_alive(true);
        let chosen = group.get_balanced_endpoint().unwrap();
        assert!(Arc::ptr_eq(&chosen, &group.endpoints[0]));
    }

    #[test]
    fn default_algorithm_is_round_robin() {
        let group = group(group_config("", &["http://a:80", "http://b:80"]));
        assert_eq!(group.balancer.name(), balancer::ROUND_ROBIN);

        let mut config = group_config("", &["http://a:80", "http://b:80"]);
        config.algorithm = "Failover".into();
        assert_eq!(
            Group::from_config(&config, Arc::new(SessionAffinity::default()))
                .unwrap()
                .balancer
                .name(),
            balancer::FAILOVER
        );
    }

    #[test]
    fn affinity_choice_prefers_pinned_alive_endpoint() {
        let mut config = group_config("/api", &["http://a:80", "http://b:80"]);
        config.session_persistence = true;
        let group = group(config);
        for endpoint in &group.endpoints {
            endpoint.set_alive(true);
        }

        let mut headers = http::HeaderMap::new();
        let cookie = format!("_gbsps={}", group.endpoints[1].signature());
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_str(&cookie).unwrap(),
        );

        let (chosen, set_cookie) = group.choose(&headers).unwrap();
        assert!(Arc::ptr_eq(&chosen, &group.endpoints[1]));
        assert!(set_cookie.is_none(), "pinned sessions must not re-set the cookie");
    }

    #[test]
    fn dead_pinned_endpoint_falls_back_with_fresh_cookie() {
        let mut config = group_config("/api", &["http://a:80", "http://b:80"]);
        config.session_persistence = true;
        let group = group(config);
        group.endpoints[0].set_alive(true);
        group.endpoints[1].set_alive(false);

        let mut headers = http::HeaderMap::new();
        let cookie = format!("_gbsps={}", group.endpoints[1].signature());
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_str(&cookie).unwrap(),
        );

        let (chosen, set_cookie) = group.choose(&headers).unwrap();
        assert!(Arc::ptr_eq(&chosen, &group.endpoints[0]));
        let cookie = set_cookie.expect("fallback selection must pin the new endpoint");
        assert!(cookie.contains(group.endpoints[0].signature()));
        assert!(cookie.contains("Path=/api"));
    }
}
