//! Versioned resource cache with generation lifecycle and fetch interception.
//!
//! Responses are stored under a deterministic request identity inside named
//! generations. One generation is current at a time: it is created and
//! pre-populated on install, becomes the only stored generation on
//! activation, and is deleted wholesale when a newer one activates. The
//! interceptor answers requests cache-first and populates the store from
//! the network as a decoupled side effect.

mod interceptor;
mod key;
mod lifecycle;
mod store;

pub use interceptor::{BypassRules, FetchInterceptor, Intercepted, PendingWrite};
pub use key::RequestKey;
pub use lifecycle::{ActivationReport, CacheLifecycle, LifecycleState};
pub use store::{CacheStore, CachedResponse, SqliteStore};
