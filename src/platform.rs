//! Seam between the engine and the host platform.
//!
//! The worker never talks to a concrete window system or notification
//! surface; the host supplies an implementation of [`Platform`] and the
//! engine drives it.

use color_eyre::Result;

use crate::notify::NotificationIntent;

/// An open application window the worker can route notifications to.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowClient {
  pub id: u64,
  pub url: String,
  pub focused: bool,
}

/// Host-platform surface the worker drives.
pub trait Platform: Send + Sync {
  /// Enumerate open application windows.
  fn windows(&self) -> Vec<WindowClient>;

  /// Bring an existing window to the foreground.
  fn focus_window(&self, id: u64) -> Result<()>;

  /// Open a new window at the given URL.
  fn open_window(&self, url: &str) -> Result<WindowClient>;

  /// Route all open clients to the newly activated cache generation so the
  /// switch takes effect without a reload.
  fn claim_clients(&self, generation: &str) -> Result<()>;

  /// Render a user-visible notification. Returns an id for later close.
  fn show_notification(&self, intent: &NotificationIntent) -> Result<u64>;

  /// Dismiss a previously shown notification.
  fn close_notification(&self, id: u64) -> Result<()>;
}
