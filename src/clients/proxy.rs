use std::{sync::Arc, time::Duration};

use axum::body::Bytes;
use reqwest::{
    Client, Method, StatusCode,
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap},
};
use tracing::{debug, info, warn};

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    error::{BreakerError, ProxyError},
};

/// Inbound request as seen by the gateway, ready to be replayed downstream.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path plus query string, e.g. `/api/v1/users/42?fields=email`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Forwards requests to one downstream service behind a circuit breaker.
///
/// Only transport failures count against the breaker; downstream error
/// statuses are passed through untouched.
pub struct ProxyGateway {
    service_name: String,
    http_client: Client,
    base_url: Option<String>,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl ProxyGateway {
    pub fn new(
        service_name: impl Into<String>,
        base_url: Option<String>,
        timeout: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ProxyError> {
        let service_name = service_name.into();
        let http_client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.map(|url| url.trim_end_matches('/').to_string());

        match &base_url {
            Some(url) => info!(service = %service_name, base_url = %url, "Proxy initialized"),
            None => warn!(service = %service_name, "No downstream URL configured, proxy disabled"),
        }

        Ok(Self {
            service_name,
            http_client,
            base_url,
            circuit_breaker,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let base_url = self.base_url.as_deref().ok_or(ProxyError::NotConfigured)?;
        let url = format!("{}{}", base_url, request.path_and_query);

        let mut headers = request.headers;
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        debug!(service = %self.service_name, method = %request.method, %url, "Forwarding request");

        let outbound = self
            .http_client
            .request(request.method, &url)
            .headers(headers)
            .body(request.body);

        let response = self
            .circuit_breaker
            .execute(|| async move {
                let response = outbound.send().await?;
                let status = response.status();
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await?;

                Ok::<_, reqwest::Error>(ProxyResponse {
                    status,
                    content_type,
                    body,
                })
            })
            .await;

        match response {
            Ok(response) => Ok(response),
            Err(BreakerError::Inner(e)) => {
                warn!(service = %self.service_name, %url, error = %e, "Downstream call failed");
                Err(ProxyError::Transport(e))
            }
            Err(rejected) => {
                warn!(service = %self.service_name, error = %rejected, "Downstream call rejected");
                Err(ProxyError::BreakerOpen)
            }
        }
    }
}
