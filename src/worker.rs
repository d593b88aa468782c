//! The worker process: lifecycle bring-up, event dispatch, and keep-alive
//! tracking for decoupled side effects.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BypassRules, CacheLifecycle, CacheStore, FetchInterceptor};
use crate::config::Config;
use crate::event::{EventHandler, WorkerEvent};
use crate::net::{FetchRequest, FetchResponse, HttpFetcher};
use crate::notify::{Dispatcher, NotificationDefaults};
use crate::platform::Platform;
use crate::sync::{MutationBackend, SyncQueue, SYNC_TAG};

/// The offline cache and deferred-sync worker.
///
/// Runs as a single event-driven process: install and activation happen
/// before the first fetch is answered, events are handled one at a time,
/// and decoupled side effects (cache population) are tracked so the process
/// stays alive until they settle.
pub struct Worker<S, B, P>
where
  S: CacheStore + 'static,
  B: MutationBackend,
  P: Platform,
{
  lifecycle: CacheLifecycle<S>,
  interceptor: FetchInterceptor<S>,
  queue: Arc<SyncQueue>,
  backend: B,
  dispatcher: Dispatcher<P>,
  platform: Arc<P>,
  fetcher: HttpFetcher,
  events: EventHandler,
  shell: Vec<String>,
  origin: Url,
  /// In-flight side effects; drained before the worker exits
  tasks: JoinSet<()>,
}

impl<S, B, P> Worker<S, B, P>
where
  S: CacheStore + 'static,
  B: MutationBackend,
  P: Platform,
{
  pub fn new(
    config: &Config,
    store: Arc<S>,
    queue: Arc<SyncQueue>,
    backend: B,
    platform: Arc<P>,
    fetcher: HttpFetcher,
    events: EventHandler,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let label = config.generation_label();

    // The backend's live API is always bypassed, plus whatever the
    // configuration adds.
    let mut bypass_hosts = config.cache.bypass_hosts.clone();
    if let Some(host) = config.backend_url()?.host_str() {
      bypass_hosts.push(host.to_string());
    }
    let bypass = BypassRules::new(bypass_hosts, config.cache.bypass_path_prefixes.clone());

    let lifecycle = CacheLifecycle::new(Arc::clone(&store), label.clone());
    let interceptor = FetchInterceptor::new(
      Arc::clone(&store),
      label,
      bypass,
      origin.clone(),
      config.cache.vary_headers.clone(),
    );

    let defaults = NotificationDefaults {
      title: config.app.name.clone(),
      body: "New notification".to_string(),
      url: "/".to_string(),
      icon: config.app.notification_icon.clone(),
      badge: config.app.notification_badge.clone(),
    };
    let dispatcher = Dispatcher::new(Arc::clone(&platform), defaults);

    Ok(Self {
      lifecycle,
      interceptor,
      queue,
      backend,
      dispatcher,
      platform,
      fetcher,
      events,
      shell: config.app.shell.clone(),
      origin,
      tasks: JoinSet::new(),
    })
  }

  /// Sender-backed handle for delivering events to this worker.
  pub fn handle(&self) -> WorkerHandle {
    WorkerHandle {
      tx: self.events.sender(),
    }
  }

  /// The mutation queue, for recording writes that could not complete
  /// against the live API.
  pub fn queue(&self) -> Arc<SyncQueue> {
    Arc::clone(&self.queue)
  }

  /// Install and activate the configured generation, then process events
  /// until shutdown.
  pub async fn run(&mut self) -> Result<()> {
    self.install_and_activate().await?;

    while let Some(event) = self.events.next().await {
      match event {
        WorkerEvent::Fetch { request, respond } => self.handle_fetch(request, respond).await,
        WorkerEvent::Sync { tag } => self.handle_sync(&tag).await,
        WorkerEvent::Push { data } => self.dispatcher.deliver(data.as_deref()),
        WorkerEvent::NotificationClick {
          notification_id,
          target_url,
        } => self.dispatcher.clicked(notification_id, &target_url),
        WorkerEvent::Shutdown => {
          info!("shutdown requested");
          break;
        }
      }

      // Reap settled side effects without blocking event dispatch
      while self.tasks.try_join_next().is_some() {}
    }

    // Keep-alive guarantee: pending cache writes settle before we exit
    while self.tasks.join_next().await.is_some() {}
    Ok(())
  }

  /// Bring the cache generation up before any fetch is answered. Events are
  /// only consumed after this returns, which is what makes the
  /// install → activate → intercept ordering hold, and makes activation
  /// plus client claiming atomic with respect to fetch handling.
  async fn install_and_activate(&mut self) -> Result<()> {
    let fetcher = self.fetcher.clone();
    self
      .lifecycle
      .install(&self.shell, &self.origin, move |request| {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(&request).await }
      })
      .await?;

    let report = self.lifecycle.activate()?;
    if let Err(e) = self.platform.claim_clients(&report.label) {
      warn!("could not claim clients: {}", e);
    }
    if !report.evicted.is_empty() {
      info!(evicted = ?report.evicted, "previous deployment superseded");
    }

    Ok(())
  }

  async fn handle_fetch(
    &mut self,
    request: FetchRequest,
    respond: oneshot::Sender<Result<FetchResponse>>,
  ) {
    let fetcher = self.fetcher.clone();
    let net_request = request.clone();

    let result = self
      .interceptor
      .intercept(&request, move || {
        let fetcher = fetcher.clone();
        async move { fetcher.fetch(&net_request).await }
      })
      .await;

    match result {
      Ok(outcome) => {
        // Population is decoupled from the response path; the task is
        // tracked so the process outlives it.
        if let Some(write) = outcome.pending_write {
          self.tasks.spawn(async move { write.commit() });
        }
        let _ = respond.send(Ok(outcome.response));
      }
      Err(e) => {
        let _ = respond.send(Err(e));
      }
    }
  }

  async fn handle_sync(&mut self, tag: &str) {
    if tag != SYNC_TAG {
      debug!(tag, "ignoring sync trigger with unknown tag");
      return;
    }

    match self.queue.drain(&self.backend).await {
      Ok(outcome) => debug!(?outcome, "drain finished"),
      Err(e) => warn!("drain failed: {}", e),
    }
  }
}

/// Handle the embedding host uses to deliver events to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerHandle {
  /// Intercept a request and await the worker's response.
  pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
    let (respond, rx) = oneshot::channel();
    self
      .tx
      .send(WorkerEvent::Fetch { request, respond })
      .map_err(|_| eyre!("worker stopped"))?;

    rx.await.map_err(|_| eyre!("worker dropped the request"))?
  }

  /// Fire a sync trigger.
  pub fn trigger_sync(&self, tag: &str) -> Result<()> {
    self
      .tx
      .send(WorkerEvent::Sync {
        tag: tag.to_string(),
      })
      .map_err(|_| eyre!("worker stopped"))
  }

  /// Deliver a push payload.
  pub fn push(&self, data: Option<Vec<u8>>) -> Result<()> {
    self
      .tx
      .send(WorkerEvent::Push { data })
      .map_err(|_| eyre!("worker stopped"))
  }

  /// Report a notification click.
  pub fn notification_click(&self, notification_id: u64, target_url: &str) -> Result<()> {
    self
      .tx
      .send(WorkerEvent::NotificationClick {
        notification_id,
        target_url: target_url.to_string(),
      })
      .map_err(|_| eyre!("worker stopped"))
  }

  /// Request shutdown.
  pub fn shutdown(&self) -> Result<()> {
    self
      .tx
      .send(WorkerEvent::Shutdown)
      .map_err(|_| eyre!("worker stopped"))
  }
}
