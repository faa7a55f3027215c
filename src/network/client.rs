//! Network Client
//!
//! reqwest-based client for other replica nodes.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::time::timeout;

use super::PeerClient;
use crate::error::{Error, Result};
use crate::ledger::{Clock, UserExport};
use crate::replication::protocol::{
    BatchClockStatusRequest, BatchClockStatusResponse, ClockStatusResponse, ExportResponse,
    HealthCheckResponse, SyncRequest, UserClockStatus,
};

/// HTTP client for peer nodes
pub struct HttpPeerClient {
    http: reqwest::Client,
    /// Timeout for sync, export and content calls
    request_timeout: Duration,
    /// Timeout for health probes
    health_timeout: Duration,
    /// Maximum users per batch clock status call
    max_batch_size: usize,
}

impl HttpPeerClient {
    /// Create a new peer client
    pub fn new(request_timeout: Duration, health_timeout: Duration, max_batch_size: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("wolfreplica/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            request_timeout,
            health_timeout,
            max_batch_size: max_batch_size.max(1),
        })
    }

    /// Send a request with a deadline, mapping transport failures to `PeerUnreachable`
    async fn send(&self, endpoint: &str, request: reqwest::RequestBuilder, limit: Duration) -> Result<reqwest::Response> {
        let result = timeout(limit, request.send()).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(unreachable(endpoint, e)),
            Err(_) => Err(Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("request timed out after {:?}", limit),
            }),
        }
    }

    async fn json<T: DeserializeOwned>(&self, endpoint: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {}: {}", status, body),
            });
        }
        response.json::<T>().await.map_err(|e| unreachable(endpoint, e))
    }
}

fn unreachable(endpoint: &str, e: reqwest::Error) -> Error {
    Error::PeerUnreachable {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait::async_trait]
impl PeerClient for HttpPeerClient {
    async fn export(&self, endpoint: &str, user_key: &str, clock_range_min: Clock) -> Result<Option<UserExport>> {
        let request = self
            .http
            .get(format!("{}/export", endpoint))
            .query(&[("user", user_key.to_string()), ("clock_range_min", clock_range_min.to_string())]);
        let response = self.send(endpoint, request, self.request_timeout).await?;

        if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Replication(format!("Export from {} failed: {}", endpoint, body)));
        }

        let mut exports: ExportResponse = self.json(endpoint, response).await?;
        Ok(exports.remove(user_key))
    }

    async fn fetch_content(&self, endpoint: &str, hash: &str) -> Result<Vec<u8>> {
        let request = self.http.get(format!("{}/content/{}", endpoint, hash));
        let response = self.send(endpoint, request, self.request_timeout).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::ContentNotFound(format!("{} not found on {}", hash, endpoint)));
        }
        if !response.status().is_success() {
            return Err(Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| unreachable(endpoint, e))?;
        Ok(bytes.to_vec())
    }

    async fn request_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<()> {
        let builder = self.http.post(format!("{}/sync", endpoint)).json(request);
        let response = self.send(endpoint, builder, self.request_timeout).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(Error::SyncInProgress(request.wallet.join(","))),
            status => Err(Error::PeerUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("sync request rejected with HTTP {}", status),
            }),
        }
    }

    async fn batch_clock_status(&self, endpoint: &str, user_keys: &[String]) -> Result<Vec<UserClockStatus>> {
        let mut users = Vec::with_capacity(user_keys.len());

        for chunk in user_keys.chunks(self.max_batch_size) {
            let body = BatchClockStatusRequest {
                wallet_public_keys: chunk.to_vec(),
            };
            let request = self
                .http
                .post(format!("{}/users/batch_clock_status", endpoint))
                .json(&body);
            let response = self.send(endpoint, request, self.request_timeout).await?;
            let batch: BatchClockStatusResponse = self.json(endpoint, response).await?;
            users.extend(batch.users);
        }

        Ok(users)
    }

    async fn clock_status(&self, endpoint: &str, user_key: &str) -> Result<Clock> {
        let request = self
            .http
            .get(format!("{}/users/clock_status/{}", endpoint, user_key));
        let response = self.send(endpoint, request, self.request_timeout).await?;
        let status: ClockStatusResponse = self.json(endpoint, response).await?;
        Ok(status.clock_value)
    }

    async fn health_check(&self, endpoint: &str) -> Result<HealthCheckResponse> {
        let request = self.http.get(format!("{}/health_check", endpoint));
        let response = self.send(endpoint, request, self.health_timeout).await?;
        self.json(endpoint, response).await
    }
}
