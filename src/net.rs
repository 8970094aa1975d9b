//! Upstream network access.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use url::Url;

use crate::http::{HeaderList, Request, Response};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Failure to obtain any response from the network.
///
/// A non-success status is not an error: it is a `Response` like any other.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
  /// DNS failure, refused connection, reset, timeout
  #[error("network unreachable: {0}")]
  Unreachable(String),
  /// The request could not be expressed on the wire
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Something that can turn a request into a response over the network.
pub trait Network: Clone + Send + Sync + 'static {
  fn fetch(&self, request: Request) -> impl Future<Output = Result<Response, NetworkError>> + Send;
}

/// HTTP client for the origin server.
#[derive(Clone)]
pub struct UpstreamClient {
  client: reqwest::Client,
  origin: Url,
}

impl UpstreamClient {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }
}

impl Network for UpstreamClient {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body);
    }

    let response = builder.send().await.map_err(classify)?;

    let status = response.status().as_u16();
    let headers: HeaderList = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(classify)?;

    Ok(Response::new(status, headers, body))
  }
}

fn classify(err: reqwest::Error) -> NetworkError {
  if err.is_builder() {
    NetworkError::InvalidRequest(err.to_string())
  } else {
    NetworkError::Unreachable(err.to_string())
  }
}

fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hop_by_hop_filtering() {
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(is_hop_by_hop("host"));
    assert!(!is_hop_by_hop("x-csrftoken"));
    assert!(!is_hop_by_hop("content-type"));
  }

  #[tokio::test]
  async fn test_unreachable_origin_is_network_error() {
    // Nothing listens on the discard port locally.
    let origin = Url::parse("http://127.0.0.1:9/").unwrap();
    let client = UpstreamClient::new(origin.clone()).unwrap();

    let err = client.fetch(Request::get(origin)).await.unwrap_err();
    assert!(matches!(err, NetworkError::Unreachable(_)));
  }
}
