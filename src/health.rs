//! Passive health monitoring.
//!
//! Liveness is a TCP-connect probe, no HTTP traffic involved. One sweep runs
//! synchronously before the listeners come up so the first selections see
//! real state; after that a ticker repeats the sweep until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::bind::Binding;

pub struct HealthMonitor {
    shutdown_tx: mpsc::Sender<()>,
}

impl HealthMonitor {
    /// Probe everything once, then spawn the periodic sweep.
    pub async fn start(interval: Duration, bindings: Vec<Arc<Binding>>) -> Self {
        sweep(&bindings).await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            // The synchronous sweep above covered the first round; start
            // ticking one full interval out.
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("passive health check started");
                        sweep(&bindings).await;
                        debug!("passive health check completed");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self { shutdown_tx }
    }

    /// Cancel the periodic sweep.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.try_send(());
    }
}

/// Probe every endpoint of every group of every binding, sequentially.
pub async fn sweep(bindings: &[Arc<Binding>]) {
    for binding in bindings {
        for group in binding.groups() {
            for endpoint in group.endpoints() {
                endpoint.health_check().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindConfig, EndpointConfig, GroupConfig};
    use crate::session::SessionAffinity;
    use tokio::net::TcpListener;

    async fn binding_with_endpoint(address: String) -> Arc<Binding> {
        let config = BindConfig {
            address: "127.0.0.1:0".into(),
            groups: vec![GroupConfig {
                address: "example.com".into(),
                endpoints: vec![EndpointConfig {
                    address,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        Binding::from_config(&config, Arc::new(SessionAffinity::default())).unwrap()
    }

    #[tokio::test]
    async fn sweep_marks_reachable_endpoint_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let binding = binding_with_endpoint(format!("http://127.0.0.1:{port}")).await;

        let endpoint = binding.groups()[0].endpoints()[0].clone();
        assert!(!endpoint.is_alive());

        sweep(&[binding]).await;
        assert!(endpoint.is_alive());
    }

    #[tokio::test]
    async fn sweep_marks_unreachable_endpoint_dead() {
        // Bind then drop, so the port is very likely refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let binding = binding_with_endpoint(format!("http://127.0.0.1:{port}")).await;
        let endpoint = binding.groups()[0].endpoints()[0].clone();
        endpoint.set_alive(true);

        sweep(&[binding]).await;
        assert!(!endpoint.is_alive());
    }

    #[tokio::test]
    async fn monitor_stops_cleanly() {
        let monitor = HealthMonitor::start(Duration::from_secs(3600), Vec::new()).await;
        monitor.stop();
    }
}
