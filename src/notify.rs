//! Push payload handling and notification click routing.
//!
//! Push delivery is best-effort end to end: malformed payloads fall back to
//! defaults, rendering failures are logged and swallowed, and a click that
//! can neither focus nor open a window degrades to a no-op. Nothing in this
//! module is allowed to take the worker down.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::platform::Platform;

/// Wire format of a push payload. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
}

/// Defaults applied when a push payload omits fields.
#[derive(Debug, Clone)]
pub struct NotificationDefaults {
  /// Application display name, used as the default title
  pub title: String,
  pub body: String,
  pub url: String,
  pub icon: String,
  pub badge: String,
}

/// A notification ready to render. Ephemeral: lives only for the duration
/// of dispatch and click routing.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationIntent {
  pub title: String,
  pub body: String,
  pub target_url: String,
  pub icon: String,
  pub badge: String,
}

impl NotificationIntent {
  /// Build an intent from raw push data, defaulting every missing or
  /// unparseable field. Never fails.
  pub fn from_push(data: Option<&[u8]>, defaults: &NotificationDefaults) -> Self {
    let payload = match data {
      Some(bytes) => serde_json::from_slice::<PushPayload>(bytes).unwrap_or_else(|e| {
        warn!("malformed push payload, using defaults: {}", e);
        PushPayload::default()
      }),
      None => PushPayload::default(),
    };

    Self {
      title: payload.title.unwrap_or_else(|| defaults.title.clone()),
      body: payload.body.unwrap_or_else(|| defaults.body.clone()),
      target_url: payload.url.unwrap_or_else(|| defaults.url.clone()),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
    }
  }
}

/// Renders notifications and routes clicks back into application windows.
pub struct Dispatcher<P: Platform> {
  platform: Arc<P>,
  defaults: NotificationDefaults,
}

impl<P: Platform> Dispatcher<P> {
  pub fn new(platform: Arc<P>, defaults: NotificationDefaults) -> Self {
    Self { platform, defaults }
  }

  /// Handle a push delivery: parse the payload and render a notification.
  pub fn deliver(&self, data: Option<&[u8]>) {
    let intent = NotificationIntent::from_push(data, &self.defaults);
    debug!(title = %intent.title, url = %intent.target_url, "push received");

    if let Err(e) = self.platform.show_notification(&intent) {
      warn!("failed to show notification: {}", e);
    }
  }

  /// Handle a notification click: close the notification, then focus a
  /// window already showing the target URL, or open a new one. A matching
  /// window is never duplicated.
  pub fn clicked(&self, notification_id: u64, target_url: &str) {
    if let Err(e) = self.platform.close_notification(notification_id) {
      warn!("failed to close notification {}: {}", notification_id, e);
    }

    for window in self.platform.windows() {
      if window.url == target_url {
        if let Err(e) = self.platform.focus_window(window.id) {
          warn!(url = target_url, "could not focus matching window: {}", e);
        }
        return;
      }
    }

    if let Err(e) = self.platform.open_window(target_url) {
      warn!(url = target_url, "could not open window: {}", e);
    }
  }
}
