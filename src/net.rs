//! Outbound HTTP: the request/response model the worker intercepts, and the
//! reqwest-backed fetcher used for shell precache and cache-miss fall-through.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// An intercepted request, reduced to what cache identity and replay need.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: String,
  pub url: Url,
  /// Request headers, by lowercased name
  pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
  /// A plain GET with no headers.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: BTreeMap::new(),
    }
  }

  /// Look up a header value, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    let name = name.to_lowercase();
    self
      .headers
      .iter()
      .find(|(k, _)| k.to_lowercase() == name)
      .map(|(_, v)| v.as_str())
  }
}

/// A response as the worker hands it back to the caller.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// Whether this response was served from the resource cache
  pub served_from_cache: bool,
}

impl FetchResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Network fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }

  /// Perform the request and buffer the full response.
  pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid request method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(FetchResponse {
      status,
      headers,
      body,
      served_from_cache: false,
    })
  }

  /// Probe a URL for reachability. Any transport-level failure means offline.
  pub async fn probe(&self, url: &Url) -> bool {
    match self.client.head(url.clone()).send().await {
      Ok(_) => true,
      Err(_) => false,
    }
  }
}
