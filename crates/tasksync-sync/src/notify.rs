//! Broadcast change feed
//!
//! In-process [`IChangeNotifier`] backed by a `tokio::sync::broadcast`
//! channel. Every subscriber gets its own copy of each [`EntityChange`];
//! a lagging subscriber loses old events instead of slowing the publisher.

use tokio::sync::broadcast;
use tracing::trace;

use tasksync_core::ports::{EntityChange, IChangeNotifier};

/// Fan-out of committed entity changes
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<EntityChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl IChangeNotifier for ChangeFeed {
    async fn notify(&self, change: &EntityChange) -> anyhow::Result<()> {
        match self.sender.send(change.clone()) {
            Ok(receivers) => {
                trace!(entity_id = %change.entity_id, receivers, "Change published");
            }
            // Nobody listening
            Err(_) => {
                trace!(entity_id = %change.entity_id, "Change dropped, no subscribers");
            }
        }
        Ok(())
    }
}
