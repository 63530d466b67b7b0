//! Tidepool client sync: keeps a locally rendered view consistent with an
//! authoritative, slow, and occasionally disconnected backend while the
//! user keeps acting.
//!
//! Responsibilities:
//! - speculative edits that confirm, merge, revert, retry, or time out
//!   against server responses ([`reconciler`])
//! - per-operation progress subscriptions with reconnect and backoff
//!   ([`subscription`]), resumable across page reloads via durable
//!   bookkeeping ([`registry`])
//! - adaptive polling for data not covered by push streams ([`poller`])
//!
//! One engine instance per client session, passed by reference to
//! consumers. The REST layer, UI rendering, and concrete storage/transport
//! backends live outside this crate behind the seams in [`store`] and
//! [`channel`].

pub mod channel;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod subscription;

pub use channel::{ChannelError, LocalProgressChannel, ProgressChannel, ProgressStream};
pub use poller::{
    effective_interval, AdaptivePolicy, PollAction, PollConfig, PollError, PollScheduler,
    PollSettings,
};
pub use reconciler::{Reconciler, RetryFn, UpdateOptions, UpdateStatus};
pub use registry::{OperationRecord, OperationRegistry, ResumableOperation};
pub use store::{KvStore, MemoryStore, StoreError};
pub use subscription::{
    ConnectionState, ReconnectConfig, SubscribeError, SubscriptionHandler, SubscriptionManager,
};
