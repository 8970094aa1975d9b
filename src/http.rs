//! Owned request and response values passed between the HTTP front, the
//! router, the response cache and the upstream client.
//!
//! A `Response` is not `Clone`. Reading its body consumes it, so
//! any second reader (typically a cache write) must be handed an explicit
//! `duplicate()` taken before the original is returned to the caller.

use bytes::Bytes;
use url::Url;

/// Header list in arrival order. Names are stored lowercase.
pub type HeaderList = Vec<(String, String)>;

/// Body returned when an API request fails offline and nothing is cached.
pub const OFFLINE_API_ERROR: &str = "You are offline. This action requires an internet connection.";

/// An outbound request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub headers: HeaderList,
  pub body: Bytes,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// POST with a JSON body and matching content type.
  pub fn post_json(url: Url, body: Vec<u8>) -> Self {
    Self::new("POST", url)
      .with_header("content-type", "application/json")
      .with_body(body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// First header value with the given name (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Whether the request is a top-level page navigation.
  pub fn is_navigation(&self) -> bool {
    self
      .header("sec-fetch-mode")
      .is_some_and(|mode| mode.eq_ignore_ascii_case("navigate"))
  }
}

/// A response captured from the network, the cache, or synthesized locally.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  status: u16,
  headers: HeaderList,
  body: Bytes,
}

impl Response {
  pub fn new(status: u16, headers: HeaderList, body: impl Into<Bytes>) -> Self {
    let headers = headers
      .into_iter()
      .map(|(name, value)| (name.to_ascii_lowercase(), value))
      .collect();

    Self {
      status,
      headers,
      body: body.into(),
    }
  }

  /// A JSON response with the given status.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(
      status,
      vec![("content-type".to_string(), "application/json".to_string())],
      value.to_string(),
    )
  }

  /// The synthetic answer for API requests that cannot reach the network.
  pub fn offline_api_error() -> Self {
    Self::json(200, &serde_json::json!({ "error": OFFLINE_API_ERROR }))
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  /// Mirrors `Response.ok`: any 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Borrow the body without consuming the response.
  pub fn body(&self) -> &[u8] {
    &self.body
  }

  /// Produce an independent copy that a second reader may consume.
  pub fn duplicate(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  #[cfg(test)]
  pub fn into_body(self) -> Bytes {
    self.body
  }

  pub fn into_parts(self) -> (u16, HeaderList, Bytes) {
    (self.status, self.headers, self.body)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(key, _)| key.eq_ignore_ascii_case(name))
    .map(|(_, value)| value.as_str())
}
