//! Remote vault API client used during queue drain.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use super::queue::{MutationBackend, Operation, QueuedMutation, SubmitError};
use crate::config::Config;

/// reqwest-backed client for the vault's CRUD surface.
///
/// Only the drain path talks to this client; live reads go to the backend
/// directly because the interceptor bypasses caching for them.
#[derive(Clone)]
pub struct VaultBackend {
  client: reqwest::Client,
  entries_url: Url,
}

impl VaultBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::api_token()?;

    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| eyre!("Invalid API token: {}", e))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(Duration::from_secs(config.sync.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to build backend client: {}", e))?;

    let mut base = config.backend_url()?;
    // Joining relative paths requires a trailing slash on the base
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }
    let entries_url = base
      .join("passwords/")
      .map_err(|e| eyre!("Invalid backend URL: {}", e))?;

    Ok(Self {
      client,
      entries_url,
    })
  }

  fn entry_url(&self, entity_id: &str) -> Result<Url, SubmitError> {
    self
      .entries_url
      .join(entity_id)
      .map_err(|e| SubmitError::Terminal(format!("invalid entity id '{}': {}", entity_id, e)))
  }
}

impl MutationBackend for VaultBackend {
  async fn submit(&self, mutation: &QueuedMutation) -> Result<(), SubmitError> {
    let request = match mutation.operation {
      Operation::Create => self
        .client
        .post(self.entries_url.clone())
        .body(mutation.payload.clone()),
      Operation::Update => self
        .client
        .patch(self.entry_url(&mutation.entity_id)?)
        .body(mutation.payload.clone()),
      Operation::Delete => self.client.delete(self.entry_url(&mutation.entity_id)?),
    };

    let response = request.send().await.map_err(|e| {
      if e.is_timeout() {
        SubmitError::Recoverable(format!("request timed out: {}", e))
      } else {
        SubmitError::Recoverable(format!("network error: {}", e))
      }
    })?;

    classify_status(response.status())
  }
}

/// Map a backend status to the drain taxonomy: 2xx acknowledges the
/// mutation; timeouts, rate limiting and server errors are worth retrying;
/// any other 4xx is a validation rejection that retrying cannot fix.
fn classify_status(status: StatusCode) -> Result<(), SubmitError> {
  if status.is_success() {
    return Ok(());
  }

  if status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
  {
    return Err(SubmitError::Recoverable(format!(
      "backend returned {}",
      status
    )));
  }

  Err(SubmitError::Terminal(format!("backend rejected: {}", status)))
}
