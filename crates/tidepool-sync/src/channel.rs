//! Push-channel seam between the subscription manager and the transport.
//!
//! Production clients implement [`ProgressChannel`] over their real push
//! transport; [`LocalProgressChannel`] is an in-memory adapter for tests
//! and local wiring, with failure injection so reconnect paths can be
//! exercised without a network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

use tidepool_proto::ProgressEvent;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("stream dropped")]
    Dropped,
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
}

/// Ordered stream of progress events for one operation. The stream ending
/// without a terminal event is a transport drop, not completion.
pub type ProgressStream = BoxStream<'static, Result<ProgressEvent, ChannelError>>;

#[async_trait]
pub trait ProgressChannel: Send + Sync {
    async fn open(&self, operation_id: &str) -> Result<ProgressStream, ChannelError>;
}

/// Broadcast-per-operation in-memory channel.
#[derive(Default)]
pub struct LocalProgressChannel {
    topics: RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    failing_connects: Mutex<usize>,
}

impl LocalProgressChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` calls to `open` fail, then connects succeed again.
    pub fn fail_next_connects(&self, count: usize) {
        *self.failing_connects.lock() = count;
    }

    /// Delivers an event to every open stream for its operation id.
    pub fn publish(&self, event: ProgressEvent) -> Result<(), ChannelError> {
        let sender = self.sender_for(&event.operation_id);
        sender.send(event).map(|_| ()).map_err(|_| ChannelError::Dropped)
    }

    /// Severs every open stream for the operation without a terminal event,
    /// simulating a transport drop.
    pub fn sever(&self, operation_id: &str) {
        self.topics.write().remove(operation_id);
    }

    fn sender_for(&self, operation_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut guard = self.topics.write();
        guard
            .entry(operation_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl ProgressChannel for LocalProgressChannel {
    async fn open(&self, operation_id: &str) -> Result<ProgressStream, ChannelError> {
        {
            let mut failing = self.failing_connects.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(ChannelError::Connect("injected connect failure".into()));
            }
        }
        let rx = self.sender_for(operation_id).subscribe();
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    Some((Err(ChannelError::Lagged(missed)), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })))
    }
}
