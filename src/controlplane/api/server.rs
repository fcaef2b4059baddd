//! Admission Webhook Server
//!
//! Serves the admission routes over HTTPS.

use crate::error::{Error, Result};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::AdmissionRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the admission webhook
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// HTTPS bind address
    pub addr: SocketAddr,
    /// TLS certificate path
    pub cert_path: PathBuf,
    /// TLS key path
    pub key_path: PathBuf,
    /// Time in-flight reviews get to finish on shutdown
    pub shutdown_grace: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 30443)),
            cert_path: PathBuf::from("/etc/certs/cert.pem"),
            key_path: PathBuf::from("/etc/certs/key.pem"),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Webhook Server
// =============================================================================

pub struct WebhookServer {
    config: WebhookConfig,
}

impl WebhookServer {
    pub fn new(config: WebhookConfig) -> Self {
        Self { config }
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let tls = RustlsConfig::from_pem_file(&self.config.cert_path, &self.config.key_path)
            .await
            .map_err(|e| {
                Error::Configuration(format!(
                    "loading TLS material {} / {}: {}",
                    self.config.cert_path.display(),
                    self.config.key_path.display(),
                    e
                ))
            })?;

        let handle = Handle::new();
        let grace = self.config.shutdown_grace;
        let watcher = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("admission webhook shutting down");
            watcher.graceful_shutdown(Some(grace));
        });

        info!(addr = %self.config.addr, "admission webhook listening");
        axum_server::bind_rustls(self.config.addr, tls)
            .handle(handle)
            .serve(AdmissionRouter::build().into_make_service())
            .await
            .map_err(|e| Error::Internal(format!("admission webhook error: {e}")))?;
        Ok(())
    }
}
