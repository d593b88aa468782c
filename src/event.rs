//! Worker events and the platform event sources for the daemon.

use color_eyre::Result;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use url::Url;

use crate::net::{FetchRequest, FetchResponse, HttpFetcher};

/// Events the host platform delivers to the worker.
///
/// The worker may be terminated between any two events; everything a
/// handler needs lives in the event itself or in the persisted stores.
#[derive(Debug)]
pub enum WorkerEvent {
  /// An intercepted request; the response goes back over the oneshot
  Fetch {
    request: FetchRequest,
    respond: oneshot::Sender<Result<FetchResponse>>,
  },
  /// A sync trigger fired; the tag selects the queue to drain
  Sync { tag: String },
  /// Push delivery, with the raw payload if one was attached
  Push { data: Option<Vec<u8>> },
  /// The user clicked a rendered notification
  NotificationClick {
    notification_id: u64,
    target_url: String,
  },
  /// Stop the worker once pending side effects settle
  Shutdown,
}

/// Event source merging host-delivered events with the daemon's own signal
/// sources (connectivity probe, shutdown).
pub struct EventHandler {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Sender half for delivering host events (fetches, pushes, clicks).
  pub fn sender(&self) -> mpsc::UnboundedSender<WorkerEvent> {
    self.tx.clone()
  }

  /// Spawn a prober that fires the sync trigger whenever the backend
  /// transitions from unreachable to reachable.
  ///
  /// The first probe runs immediately, so a worker starting up with
  /// connectivity gets one trigger right away and drains anything the
  /// previous incarnation left queued.
  pub fn spawn_connectivity_probe(
    &self,
    fetcher: HttpFetcher,
    probe_url: Url,
    interval: Duration,
    tag: String,
  ) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let mut online = false;
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

      loop {
        ticker.tick().await;
        let now_online = fetcher.probe(&probe_url).await;
        if now_online && !online {
          info!("backend reachable, requesting sync");
          if tx.send(WorkerEvent::Sync { tag: tag.clone() }).is_err() {
            break;
          }
        }
        online = now_online;
      }
    });
  }

  /// Spawn a ctrl-c listener that requests shutdown.
  pub fn spawn_shutdown_signal(&self) {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(WorkerEvent::Shutdown);
      }
    });
  }

  /// Receive the next event.
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
