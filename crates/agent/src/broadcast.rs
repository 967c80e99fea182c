//! Push channel for surface updates. Clients subscribe per process; a
//! publish with no subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use tandem_core::domain::conversation::ConversationId;
use tandem_core::surface::Surface;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SurfaceUpdate {
    pub conversation_id: ConversationId,
    pub surface: Surface,
}

pub trait SurfaceBroadcaster: Send + Sync {
    /// Returns how many subscribers received the update.
    fn publish(&self, update: SurfaceUpdate) -> usize;
}

pub struct BroadcastHub {
    sender: broadcast::Sender<SurfaceUpdate>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SurfaceUpdate> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl SurfaceBroadcaster for BroadcastHub {
    fn publish(&self, update: SurfaceUpdate) -> usize {
        let surface_id = update.surface.id.clone();
        let delivered = self.sender.send(update).unwrap_or(0);
        debug!(event_name = "surface.published", surface_id = %surface_id, delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use tandem_core::domain::conversation::ConversationId;
    use tandem_core::surface::Surface;

    use super::{BroadcastHub, SurfaceBroadcaster, SurfaceUpdate};

    fn update() -> SurfaceUpdate {
        SurfaceUpdate {
            conversation_id: ConversationId("conv-1".to_string()),
            surface: Surface::new("followup:1"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.publish(update()), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_updates() {
        let hub = BroadcastHub::new(4);
        let mut receiver = hub.subscribe();
        assert_eq!(hub.publish(update()), 1);
        let received = receiver.recv().await.expect("update");
        assert_eq!(received.surface.id, "followup:1");
    }
}
