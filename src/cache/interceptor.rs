//! Fetch interception: bypass rules, cache-first lookup, network
//! fall-through with decoupled cache population.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::key::RequestKey;
use super::store::{CacheStore, CachedResponse};
use crate::net::{FetchRequest, FetchResponse};

/// Requests matching these rules are never answered from cache and never
/// populate it; they always go to the network. The live API of the remote
/// backend must match, or authenticated reads would go stale.
#[derive(Debug, Clone, Default)]
pub struct BypassRules {
  hosts: Vec<String>,
  path_prefixes: Vec<String>,
}

impl BypassRules {
  pub fn new(hosts: Vec<String>, path_prefixes: Vec<String>) -> Self {
    Self {
      hosts: hosts.into_iter().map(|h| h.to_lowercase()).collect(),
      path_prefixes,
    }
  }

  pub fn matches(&self, url: &Url) -> bool {
    if let Some(host) = url.host_str() {
      let host = host.to_lowercase();
      for bypass in &self.hosts {
        if host == *bypass || host.ends_with(&format!(".{}", bypass)) {
          return true;
        }
      }
    }

    self
      .path_prefixes
      .iter()
      .any(|prefix| url.path().starts_with(prefix.as_str()))
  }
}

/// A cache population task, decoupled from the response path.
///
/// The response has already been delivered when this runs; storage failures
/// are logged and swallowed.
pub struct PendingWrite<S: CacheStore> {
  store: Arc<S>,
  label: String,
  key: RequestKey,
  method: String,
  url: String,
  response: CachedResponse,
}

impl<S: CacheStore> PendingWrite<S> {
  pub fn commit(self) {
    if let Err(e) = self
      .store
      .put(&self.label, &self.key, &self.method, &self.url, &self.response)
    {
      warn!(url = %self.url, "cache population failed: {}", e);
    } else {
      debug!(url = %self.url, "cached network response");
    }
  }
}

/// Outcome of interception: the response for the caller plus, on a cache
/// miss that produced a cacheable response, the deferred store task.
pub struct Intercepted<S: CacheStore> {
  pub response: FetchResponse,
  pub pending_write: Option<PendingWrite<S>>,
}

/// Decides, per intercepted request, between cache and network.
///
/// Policy is cache-first: a hit is returned without touching the network,
/// favoring offline availability over freshness for shell assets. Misses
/// fall through to the network and eligible responses are stored for next
/// time, without delaying delivery to the caller.
pub struct FetchInterceptor<S: CacheStore> {
  store: Arc<S>,
  label: String,
  bypass: BypassRules,
  app_origin: Url,
  vary_headers: Vec<String>,
}

impl<S: CacheStore> FetchInterceptor<S> {
  pub fn new(
    store: Arc<S>,
    label: impl Into<String>,
    bypass: BypassRules,
    app_origin: Url,
    vary_headers: Vec<String>,
  ) -> Self {
    Self {
      store,
      label: label.into(),
      bypass,
      app_origin,
      vary_headers,
    }
  }

  /// Produce a response for the request.
  ///
  /// The fetcher is only invoked on bypass or cache miss. A network failure
  /// with no cache entry propagates to the caller; there is no synthetic
  /// fallback response.
  pub async fn intercept<F, Fut>(&self, request: &FetchRequest, fetcher: F) -> Result<Intercepted<S>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<FetchResponse>>,
  {
    if self.bypass.matches(&request.url) {
      debug!(url = %request.url, "bypassing cache for live API request");
      let response = fetcher().await?;
      return Ok(Intercepted {
        response,
        pending_write: None,
      });
    }

    let key = RequestKey::from_request(request, &self.vary_headers);

    // A storage error on lookup degrades to a miss; the request must still
    // be answered.
    let cached = match self.store.get(&self.label, &key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, "cache lookup failed, falling through: {}", e);
        None
      }
    };

    if let Some(cached) = cached {
      debug!(url = %request.url, "cache hit");
      return Ok(Intercepted {
        response: FetchResponse {
          status: cached.status,
          headers: cached.headers,
          body: cached.body,
          served_from_cache: true,
        },
        pending_write: None,
      });
    }

    debug!(url = %request.url, "cache miss, fetching");
    let response = fetcher().await?;

    let pending_write = if self.cacheable(request, &response) {
      Some(PendingWrite {
        store: Arc::clone(&self.store),
        label: self.label.clone(),
        key,
        method: request.method.clone(),
        url: request.url.to_string(),
        response: CachedResponse {
          status: response.status,
          headers: response.headers.clone(),
          body: response.body.clone(),
          stored_at: chrono::Utc::now(),
        },
      })
    } else {
      None
    };

    Ok(Intercepted {
      response,
      pending_write,
    })
  }

  /// Only successful same-origin GET responses enter the cache;
  /// cross-origin responses and non-2xx statuses never do.
  fn cacheable(&self, request: &FetchRequest, response: &FetchResponse) -> bool {
    request.method.eq_ignore_ascii_case("GET")
      && response.is_success()
      && same_origin(&request.url, &self.app_origin)
  }
}

fn same_origin(a: &Url, b: &Url) -> bool {
  a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}
