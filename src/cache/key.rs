//! Canonical request identity used to index cached responses.

use sha2::{Digest, Sha256};
use url::Url;

use crate::net::FetchRequest;

/// Identity of a cached resource, derived from method, URL and the
/// cache-relevant header values.
///
/// Two requests with the same key address the same cache entry; the last
/// stored response wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  /// Derive the key for a request.
  ///
  /// `vary_headers` names the headers that participate in identity; a named
  /// header only contributes when the request carries it, so requests
  /// without it (shell precache, for instance) key identically.
  pub fn from_request(request: &FetchRequest, vary_headers: &[String]) -> Self {
    let mut input = String::new();
    input.push_str(&request.method.to_uppercase());
    input.push('\n');
    input.push_str(&normalize_url(&request.url));

    let mut names: Vec<String> = vary_headers.iter().map(|h| h.to_lowercase()).collect();
    names.sort();
    names.dedup();
    for name in names {
      if let Some(value) = request.header(&name) {
        input.push('\n');
        input.push_str(&name);
        input.push(':');
        input.push_str(value.trim());
      }
    }

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn as_hex(&self) -> &str {
    &self.0
  }
}

/// Normalize a URL for stable identity: the fragment never reaches the
/// server, so it is dropped. Host casing and default ports are already
/// normalized by the Url type itself.
fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn request(url: &str) -> FetchRequest {
    FetchRequest::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_identical_requests_share_a_key() {
    let a = RequestKey::from_request(&request("https://vault.example.com/index.html"), &[]);
    let b = RequestKey::from_request(&request("https://vault.example.com/index.html"), &[]);

    assert_eq!(a, b);
  }

  #[test]
  fn test_method_distinguishes_keys() {
    let get = request("https://vault.example.com/");
    let mut post = request("https://vault.example.com/");
    post.method = "POST".to_string();

    assert_ne!(
      RequestKey::from_request(&get, &[]),
      RequestKey::from_request(&post, &[])
    );
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::from_request(&request("https://vault.example.com/app#section"), &[]);
    let b = RequestKey::from_request(&request("https://vault.example.com/app"), &[]);

    assert_eq!(a, b);
  }

  #[test]
  fn test_vary_header_participates_only_when_present() {
    let vary = vec!["Accept-Language".to_string()];

    let bare = request("https://vault.example.com/");
    let mut localized = request("https://vault.example.com/");
    localized
      .headers
      .insert("accept-language".to_string(), "de".to_string());

    let bare_key = RequestKey::from_request(&bare, &vary);
    let localized_key = RequestKey::from_request(&localized, &vary);

    assert_ne!(bare_key, localized_key);
    // Without the header, the vary configuration changes nothing
    assert_eq!(bare_key, RequestKey::from_request(&bare, &[]));
  }

  #[test]
  fn test_unrelated_headers_do_not_affect_identity() {
    let mut a = request("https://vault.example.com/");
    a.headers
      .insert("x-request-id".to_string(), "123".to_string());
    let b = request("https://vault.example.com/");

    let mut headers = BTreeMap::new();
    headers.insert("x-request-id".to_string(), "456".to_string());

    assert_eq!(
      RequestKey::from_request(&a, &[]),
      RequestKey::from_request(&b, &[])
    );
  }
}
