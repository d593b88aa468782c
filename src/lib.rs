//! Offline cache and deferred-sync engine for the vault application.
//!
//! The worker sits between the application and the network. It serves
//! cache-first responses for application-shell assets out of a versioned
//! resource cache, passes live API traffic straight through, records vault
//! mutations made while the backend is unreachable in a durable queue, and
//! replays that queue in order once connectivity returns. Push payloads are
//! turned into notifications and clicks are routed back to an existing
//! application window where one exists.
//!
//! The engine is event-driven: the host platform delivers install, fetch,
//! sync, push, and notification-click events, and nothing outside the
//! persisted stores (cache generations, queued mutations) is assumed to
//! survive between events.

pub mod cache;
pub mod config;
pub mod event;
pub mod net;
pub mod notify;
pub mod platform;
pub mod sync;
pub mod worker;
