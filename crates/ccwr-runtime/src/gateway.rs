//! Single request/response exchanges against the backend's HTTP surface.
//!
//! The gateway carries no retry or supervision logic; it maps one exchange
//! to one typed result. Retry policy lives entirely in the supervisor.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use ccwr_core::error::ServiceError;

/// Timeout for readiness probes (not for regular exchanges, which may be
/// long-running compilations).
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for the backend's JSON endpoints.
#[derive(Debug, Clone)]
pub struct Gateway {
    client: Client,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Perform one exchange: GET without a body, POST with a JSON body.
    ///
    /// `path_and_query` is joined below the base URL and may carry a query
    /// string. Only a 200 response is decoded; any other status maps to
    /// [`ServiceError::HttpStatusFailure`], transport problems to
    /// [`ServiceError::TransportFailure`], and an unparseable body to
    /// [`ServiceError::DecodeFailure`].
    pub async fn exchange(
        &self,
        base: &Url,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> Result<Value, ServiceError> {
        let url = join_path(base, path_and_query)?;
        debug!(%url, has_body = body.is_some(), "dispatching exchange");

        let request = match body {
            Some(payload) => self.client.post(url).json(payload),
            None => self.client.get(url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::TransportFailure(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ServiceError::HttpStatusFailure {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unrecognized status")
                    .to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::TransportFailure(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ServiceError::DecodeFailure(e.to_string()))
    }

    /// Probe the status endpoint once with a short timeout.
    ///
    /// Used for startup confirmation; any failure is simply "not reachable
    /// yet".
    pub async fn probe(&self, base: &Url) -> bool {
        let Ok(url) = join_path(base, "status") else {
            return false;
        };
        match self.client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(_) => false,
        }
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

fn join_path(base: &Url, path_and_query: &str) -> Result<Url, ServiceError> {
    base.join(path_and_query)
        .map_err(|e| ServiceError::InvalidEndpoint {
            url: format!("{base}{path_and_query}"),
            reason: e.to_string(),
        })
}
