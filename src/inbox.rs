//! Single-message inbox
//!
//! Holds the latest inbound clip and whether the user has been told about
//! it. Newest always wins: an unplayed message is silently replaced by the
//! next arrival.

use crate::models::InboundMessage;
use log::debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Default)]
struct SlotInner {
    message: Option<Arc<InboundMessage>>,
}

/// Latest inbound message plus its unseen flag; cheap to clone
#[derive(Clone)]
pub struct InboxSlot {
    inner: Arc<Mutex<SlotInner>>,
    unseen: Arc<watch::Sender<bool>>,
}

impl InboxSlot {
    pub fn new() -> Self {
        let (unseen, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(SlotInner::default())),
            unseen: Arc::new(unseen),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace whatever is held and flag it unseen
    pub fn deposit(&self, message: InboundMessage) {
        let mut inner = self.lock();
        if let Some(previous) = &inner.message {
            if *self.unseen.borrow() {
                debug!("Dropping unplayed message {} for {}", previous.id, message.id);
            }
        }
        inner.message = Some(Arc::new(message));
        self.unseen.send_replace(true);
    }

    /// Current message; leaves the unseen flag alone
    pub fn peek(&self) -> Option<Arc<InboundMessage>> {
        self.lock().message.clone()
    }

    /// Clear the unseen flag but keep the message
    pub fn mark_seen(&self) {
        let _guard = self.lock();
        self.unseen.send_replace(false);
    }

    /// Message to hand to playback; stays in the slot for replays
    pub fn consume(&self) -> Option<Arc<InboundMessage>> {
        self.lock().message.clone()
    }

    pub fn has_unseen(&self) -> bool {
        *self.unseen.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().message.is_none()
    }

    /// Notified whenever the unseen flag changes
    pub fn subscribe_unseen(&self) -> watch::Receiver<bool> {
        self.unseen.subscribe()
    }
}

impl Default for InboxSlot {
    fn default() -> Self {
        Self::new()
    }
}
