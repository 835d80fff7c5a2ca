use tokio::sync::broadcast;

use super::records::EntityFamily;

/// Explicitly owned publish/subscribe channel. Publishing never blocks and never
/// fails; with no subscribers the event is dropped.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: T) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Store-level changes other parts of the app react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    EntitiesChanged { family: EntityFamily },
    ProgressSaved { book_id: String },
    CoverCached { family: EntityFamily, entity_id: String },
    PushOperationFailed { op_id: i64, entity_id: String },
}
