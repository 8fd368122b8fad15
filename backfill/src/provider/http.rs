use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use error_stack::{Report, Result, ResultExt};
use reqwest::Client;
use serde_json::{json, Value};

use crate::fetcher::RetryableContext;

use super::models;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CometRpcError {
    Request,
    NotFound,
    DeserializeResponse,
    Timeout,
    ServerError,
    Rpc,
    Configuration,
}

#[derive(Debug, Clone)]
pub struct CometRpcProviderOptions {
    /// Timeout for block and block results requests.
    pub timeout: Duration,
    /// Timeout for the health probe.
    pub health_timeout: Duration,
    /// Maximum number of idle connections kept in the pool.
    pub max_idle_connections: usize,
}

/// JSON-RPC client for a CometBFT node.
///
/// Cloning is cheap and clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct CometRpcProvider {
    client: Client,
    url: String,
    options: CometRpcProviderOptions,
    request_id: Arc<AtomicU64>,
}

pub trait CometRpcErrorExt {
    fn is_not_found(&self) -> bool;
}

impl CometRpcProvider {
    pub fn new(
        url: impl Into<String>,
        options: CometRpcProviderOptions,
    ) -> Result<Self, CometRpcError> {
        let url = url.into().trim_end_matches('/').to_string();

        let client = Client::builder()
            .pool_max_idle_per_host(options.max_idle_connections)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()
            .change_context(CometRpcError::Configuration)
            .attach_printable("failed to build http client")?;

        Ok(Self {
            client,
            url,
            options,
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn health_timeout(&self) -> Duration {
        self.options.health_timeout
    }

    pub async fn status(&self) -> Result<models::StatusResponse, CometRpcError> {
        self.send_request(StatusRequest, self.options.timeout).await
    }

    /// Same as `status` but with the short health timeout.
    pub async fn probe_status(&self) -> Result<models::StatusResponse, CometRpcError> {
        self.send_request(StatusRequest, self.options.health_timeout)
            .await
    }

    pub async fn block(&self, height: u64) -> Result<models::BlockResponse, CometRpcError> {
        self.send_request(BlockRequest { height }, self.options.timeout)
            .await
    }

    pub async fn block_results(
        &self,
        height: u64,
    ) -> Result<models::BlockResultsResponse, CometRpcError> {
        self.send_request(BlockResultsRequest { height }, self.options.timeout)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn send_request<Req>(
        &self,
        request: Req,
        timeout: Duration,
    ) -> Result<Req::Response, CometRpcError>
    where
        Req: CometRpcRequest + Debug,
    {
        let body = models::JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method: request.method(),
            params: request.params(),
        };

        let response = match self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(err)
                    .change_context(CometRpcError::Timeout)
                    .attach_printable_lazy(|| format!("method: {}", request.method()));
            }
            Err(err) => {
                return Err(err)
                    .change_context(CometRpcError::Request)
                    .attach_printable_lazy(|| format!("method: {}", request.method()));
            }
        };

        let status = response.status();

        if status.as_u16() == 404 {
            return Err(CometRpcError::NotFound.into());
        }

        // The node answers JSON-RPC errors with a 500 and a json body.
        let text_response = response
            .text()
            .await
            .change_context(CometRpcError::Request)?;

        let Ok(response) =
            serde_json::from_str::<models::JsonRpcResponse<Req::Response>>(&text_response)
        else {
            if !status.is_success() {
                return Err(CometRpcError::ServerError)
                    .attach_printable_lazy(|| format!("status: {status}"));
            }

            return Err(CometRpcError::DeserializeResponse)
                .attach_printable_lazy(|| format!("method: {}", request.method()));
        };

        if let Some(error) = response.error {
            let context = if error.is_height_unavailable() {
                CometRpcError::NotFound
            } else {
                CometRpcError::Rpc
            };

            return Err(context).attach_printable_lazy(|| format!("rpc error: {error}"));
        }

        if !status.is_success() {
            return Err(CometRpcError::ServerError)
                .attach_printable_lazy(|| format!("status: {status}"));
        }

        response
            .result
            .ok_or(CometRpcError::DeserializeResponse)
            .attach_printable("response is missing the result field")
    }
}

pub trait CometRpcRequest {
    type Response: serde::de::DeserializeOwned;

    fn method(&self) -> &'static str;

    fn params(&self) -> Value;
}

#[derive(Debug)]
pub struct StatusRequest;

#[derive(Debug)]
pub struct BlockRequest {
    height: u64,
}

#[derive(Debug)]
pub struct BlockResultsRequest {
    height: u64,
}

impl CometRpcRequest for StatusRequest {
    type Response = models::StatusResponse;

    fn method(&self) -> &'static str {
        "status"
    }

    fn params(&self) -> Value {
        json!({})
    }
}

impl CometRpcRequest for BlockRequest {
    type Response = models::BlockResponse;

    fn method(&self) -> &'static str {
        "block"
    }

    fn params(&self) -> Value {
        json!({ "height": self.height.to_string() })
    }
}

impl CometRpcRequest for BlockResultsRequest {
    type Response = models::BlockResultsResponse;

    fn method(&self) -> &'static str {
        "block_results"
    }

    fn params(&self) -> Value {
        json!({ "height": self.height.to_string() })
    }
}

impl CometRpcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CometRpcError::NotFound)
    }
}

impl CometRpcErrorExt for Report<CometRpcError> {
    fn is_not_found(&self) -> bool {
        self.current_context().is_not_found()
    }
}

impl RetryableContext for CometRpcError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CometRpcError::NotFound | CometRpcError::Configuration
        )
    }
}

impl error_stack::Context for CometRpcError {}

impl std::fmt::Display for CometRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CometRpcError::Request => write!(f, "failed to send request"),
            CometRpcError::NotFound => write!(f, "not found"),
            CometRpcError::DeserializeResponse => write!(f, "failed to deserialize response"),
            CometRpcError::Timeout => write!(f, "the request timed out"),
            CometRpcError::ServerError => write!(f, "server error"),
            CometRpcError::Rpc => write!(f, "json-rpc error"),
            CometRpcError::Configuration => write!(f, "configuration error"),
        }
    }
}
