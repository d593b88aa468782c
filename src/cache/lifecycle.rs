//! Cache generation lifecycle: install, activate, supersede.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use url::Url;

use super::key::RequestKey;
use super::store::{CacheStore, CachedResponse};
use crate::net::{FetchRequest, FetchResponse};

/// Lifecycle state of a cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Created but not yet serving; shell precache may be in flight
  Installing,
  /// The one generation fetches are answered from
  Active,
  /// Replaced by a newer generation; no longer serving
  Superseded,
}

/// What activation did, for the registration surface to report to the host
/// (an eviction means a previous deployment was replaced and open pages may
/// want to prompt for a reload).
#[derive(Debug, Clone)]
pub struct ActivationReport {
  pub label: String,
  /// Labels of the superseded generations that were deleted
  pub evicted: Vec<String>,
}

/// Manages the install → activate → supersede lifecycle of the current
/// cache generation.
pub struct CacheLifecycle<S: CacheStore> {
  store: Arc<S>,
  label: String,
  state: LifecycleState,
  installed: bool,
}

impl<S: CacheStore> CacheLifecycle<S> {
  pub fn new(store: Arc<S>, label: impl Into<String>) -> Self {
    Self {
      store,
      label: label.into(),
      state: LifecycleState::Installing,
      installed: false,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  /// Install the generation: open it and precache every shell resource.
  ///
  /// All shell fetches run concurrently; any failure (network error or
  /// non-success status) fails the install and nothing is stored, so a
  /// previously active generation keeps serving. A failed install must not
  /// be activated.
  pub async fn install<F, Fut>(&mut self, shell: &[String], origin: &Url, fetcher: F) -> Result<()>
  where
    F: Fn(FetchRequest) -> Fut,
    Fut: Future<Output = Result<FetchResponse>>,
  {
    if self.state != LifecycleState::Installing {
      return Err(eyre!(
        "Generation {} is {:?}, cannot install",
        self.label,
        self.state
      ));
    }

    let mut requests = Vec::with_capacity(shell.len());
    for path in shell {
      let url = origin
        .join(path)
        .map_err(|e| eyre!("Invalid shell resource path {}: {}", path, e))?;
      requests.push(FetchRequest::get(url));
    }

    let responses = join_all(requests.iter().map(|request| fetcher(request.clone()))).await;

    let mut fetched = Vec::with_capacity(requests.len());
    for (request, result) in requests.iter().zip(responses) {
      let response =
        result.map_err(|e| eyre!("Install failed fetching {}: {}", request.url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Install failed: shell resource {} returned status {}",
          request.url,
          response.status
        ));
      }
      fetched.push((request, response));
    }

    // Every shell resource fetched; now persist the generation as a whole.
    self.store.open_generation(&self.label)?;
    for (request, response) in fetched {
      let key = RequestKey::from_request(request, &[]);
      let cached = CachedResponse {
        status: response.status,
        headers: response.headers,
        body: response.body,
        stored_at: chrono::Utc::now(),
      };
      self
        .store
        .put(&self.label, &key, &request.method, request.url.as_str(), &cached)?;
    }

    self.installed = true;
    info!(label = %self.label, resources = shell.len(), "cache generation installed");
    Ok(())
  }

  /// Activate the generation: delete every other stored generation so
  /// exactly one remains, then start serving.
  ///
  /// Requires a completed install.
  pub fn activate(&mut self) -> Result<ActivationReport> {
    if !self.installed {
      return Err(eyre!(
        "Generation {} was not installed, refusing to activate",
        self.label
      ));
    }
    if self.state != LifecycleState::Installing {
      return Err(eyre!(
        "Generation {} is {:?}, cannot activate",
        self.label,
        self.state
      ));
    }

    let mut evicted = Vec::new();
    for label in self.store.generations()? {
      if label != self.label && self.store.delete_generation(&label)? {
        info!(old = %label, "deleted superseded cache generation");
        evicted.push(label);
      }
    }

    self.state = LifecycleState::Active;
    info!(label = %self.label, "cache generation activated");

    Ok(ActivationReport {
      label: self.label.clone(),
      evicted,
    })
  }

  /// Mark this generation as replaced by a newer one. A retired lifecycle
  /// refuses further installs and activations.
  pub fn retire(&mut self) {
    self.state = LifecycleState::Superseded;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::store::SqliteStore;
  use std::collections::BTreeMap;

  fn ok_response(body: &[u8]) -> FetchResponse {
    FetchResponse {
      status: 200,
      headers: BTreeMap::new(),
      body: body.to_vec(),
      served_from_cache: false,
    }
  }

  fn origin() -> Url {
    Url::parse("https://vault.example.com").unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_shell() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut lifecycle = CacheLifecycle::new(store.clone(), "vault-shell-v1");

    let shell = vec!["/".to_string(), "/index.html".to_string()];
    lifecycle
      .install(&shell, &origin(), |_req| async { Ok(ok_response(b"ok")) })
      .await
      .unwrap();

    assert_eq!(store.entry_count("vault-shell-v1").unwrap(), 2);

    let key = RequestKey::from_request(
      &FetchRequest::get(origin().join("/index.html").unwrap()),
      &[],
    );
    assert!(store.get("vault-shell-v1", &key).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_install_stores_nothing_and_refuses_activation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut lifecycle = CacheLifecycle::new(store.clone(), "vault-shell-v2");

    let shell = vec!["/".to_string(), "/missing.js".to_string()];
    let result = lifecycle
      .install(&shell, &origin(), |req| async move {
        if req.url.path() == "/missing.js" {
          Ok(FetchResponse {
            status: 404,
            ..ok_response(b"")
          })
        } else {
          Ok(ok_response(b"ok"))
        }
      })
      .await;

    assert!(result.is_err());
    assert!(!store
      .generations()
      .unwrap()
      .contains(&"vault-shell-v2".to_string()));
    assert!(lifecycle.activate().is_err());
  }

  #[tokio::test]
  async fn test_activation_leaves_exactly_one_generation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());

    // Previous deployment
    let mut old = CacheLifecycle::new(store.clone(), "vault-shell-v1");
    old
      .install(&["/".to_string()], &origin(), |_| async {
        Ok(ok_response(b"old"))
      })
      .await
      .unwrap();
    old.activate().unwrap();

    // New deployment supersedes it
    let mut new = CacheLifecycle::new(store.clone(), "vault-shell-v2");
    new
      .install(&["/".to_string()], &origin(), |_| async {
        Ok(ok_response(b"new"))
      })
      .await
      .unwrap();
    let report = new.activate().unwrap();

    assert_eq!(report.evicted, vec!["vault-shell-v1".to_string()]);
    assert_eq!(store.generations().unwrap(), vec!["vault-shell-v2".to_string()]);
  }

  #[tokio::test]
  async fn test_retired_lifecycle_refuses_activation() {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut lifecycle = CacheLifecycle::new(store, "vault-shell-v1");
    lifecycle
      .install(&["/".to_string()], &origin(), |_| async {
        Ok(ok_response(b"ok"))
      })
      .await
      .unwrap();

    lifecycle.retire();
    assert_eq!(lifecycle.state(), LifecycleState::Superseded);
    assert!(lifecycle.activate().is_err());
  }
}
