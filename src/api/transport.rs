//! HTTP transport seam and the reqwest-backed implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;

use super::request::Method;

#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub method: Method,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
  pub status: u16,
  /// Reason phrase for the status, used when the body carries no message.
  pub reason: String,
  pub body: String,
}

impl TransportResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// The exchange never produced an HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportFailure(pub String);

/// One HTTP round trip. Implementations do not retry or time out on their
/// own; the executor owns both.
#[async_trait]
pub trait HttpTransport: Send + Sync {
  async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure>;
}

/// Production transport over `reqwest`.
///
/// Keeps a cookie store so session cookies travel with every request.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .cookie_store(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }

  fn method(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportFailure> {
    let mut builder = self
      .client
      .request(Self::method(request.method), &request.url);

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.to_string());
    }

    let response = builder.send().await.map_err(|e| {
      tracing::debug!(method = %request.method, url = %request.url, error = %e, "Request failed");
      TransportFailure(e.to_string())
    })?;

    let status = response.status();
    let reason = status.canonical_reason().unwrap_or_default().to_string();
    let body = response
      .text()
      .await
      .map_err(|e| TransportFailure(format!("Failed to read response body: {}", e)))?;

    tracing::debug!(
      method = %request.method,
      url = %request.url,
      status = status.as_u16(),
      "Request completed"
    );

    Ok(TransportResponse {
      status: status.as_u16(),
      reason,
      body,
    })
  }
}
