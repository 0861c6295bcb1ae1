//! Sidecar adapter (HTTP).
//!
//! Implements the `tgw-core` SidecarNotifier over the sidecar's two
//! lifecycle endpoints. Every failure is logged and swallowed here.

use std::time::Duration;

use async_trait::async_trait;

use tgw_core::{config::Config, errors::Error, ports::SidecarNotifier, Result};

#[derive(Clone, Debug)]
pub struct HttpSidecar {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSidecar {
    pub fn new(cfg: &Config) -> Result<Self> {
        Self::with_timeout(&cfg.sidecar_url, cfg.sidecar_timeout)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Sidecar(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn start_url(&self) -> String {
        format!("{}/start-request", self.base_url)
    }

    fn end_url(&self, duration: Duration) -> String {
        format!(
            "{}/end-request?duration={}s",
            self.base_url,
            duration.as_secs_f64()
        )
    }

    async fn post(&self, url: &str) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| Error::Sidecar(format!("request error: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Sidecar(format!("sidecar returned {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl SidecarNotifier for HttpSidecar {
    async fn notify_start(&self) {
        if let Err(e) = self.post(&self.start_url()).await {
            tracing::warn!(error = %e, "failed to notify sidecar start");
        }
    }

    async fn notify_end(&self, duration: Duration) {
        if let Err(e) = self.post(&self.end_url(duration)).await {
            tracing::warn!(error = %e, "failed to notify sidecar end");
        }
    }
}
