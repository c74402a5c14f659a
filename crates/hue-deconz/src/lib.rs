use std::time::Duration;

use async_trait::async_trait;
use hue_core::config::Config;
use hue_core::models::DeviceState;
use hue_core::upstream_map::{map_device_state, UpstreamRequest};
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("deCONZ at {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("deCONZ rejected {path} with status {status}")]
    Rejected { path: String, status: u16 },
    #[error("http client error: {0}")]
    Client(String),
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn forward(&self, state: &DeviceState) -> Result<(), UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct DeconzClient {
    pub address: String,
    pub api_key: String,
    http: reqwest::Client,
}

impl DeconzClient {
    pub fn new(address: String, api_key: String) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| UpstreamError::Client(err.to_string()))?;
        Ok(Self {
            address,
            api_key,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/api/{}/{}", self.address, self.api_key, path)
    }

    pub async fn put(&self, request: &UpstreamRequest) -> Result<(), UpstreamError> {
        let resp = self
            .http
            .put(self.url(&request.path))
            .json(&request.body)
            .send()
            .await
            .map_err(|err| UpstreamError::Unreachable {
                address: self.address.clone(),
                reason: err.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(UpstreamError::Rejected {
                path: request.path.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeconzAdapter {
    pub client: DeconzClient,
}

impl DeconzAdapter {
    /// Builds the adapter when a deCONZ address is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, UpstreamError> {
        let Some(address) = config.deconz_address.clone() else {
            return Ok(None);
        };
        let client = DeconzClient::new(address, config.deconz_api_key.clone())?;
        Ok(Some(Self { client }))
    }
}

#[async_trait]
impl UpstreamAdapter for DeconzAdapter {
    async fn forward(&self, state: &DeviceState) -> Result<(), UpstreamError> {
        let Some(request) = map_device_state(state) else {
            tracing::debug!(device_id = %state.device_id, "Nothing to forward to deCONZ");
            return Ok(());
        };
        self.client.put(&request).await
    }
}

/// Forwards a state change and swallows failures; local operation never
/// depends on the upstream gateway.
pub async fn forward_or_log(adapter: &dyn UpstreamAdapter, state: &DeviceState) -> bool {
    match adapter.forward(state).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(device_id = %state.device_id, "deCONZ forward failed: {err}");
            false
        }
    }
}
