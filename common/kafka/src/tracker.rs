use std::collections::HashMap;
use std::sync::Mutex;

use crate::consumer::MessageHandle;

/// Per-stage map from content id to the broker message that carried it.
/// A stage tracks the handle on ingest and claims it back right before
/// committing, once the downstream publish that message fed is durable.
/// Claiming removes the entry, so a handle is committed at most once.
#[derive(Default)]
pub struct MessageTracker {
    entries: Mutex<HashMap<String, MessageHandle>>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, content_id: &str, handle: MessageHandle) {
        self.entries
            .lock()
            .expect("message tracker poisoned")
            .insert(content_id.to_string(), handle);
    }

    /// Get-and-remove. Returns `None` when the id was never tracked or was
    /// already claimed (e.g. the same content id appeared twice in a batch).
    pub fn claim(&self, content_id: &str) -> Option<MessageHandle> {
        self.entries
            .lock()
            .expect("message tracker poisoned")
            .remove(content_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("message tracker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the tracker, handing back whatever was never claimed. Used
    /// on shutdown to surface entries that would otherwise leak.
    pub fn drain(&self) -> Vec<(String, MessageHandle)> {
        self.entries
            .lock()
            .expect("message tracker poisoned")
            .drain()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(offset: i64) -> MessageHandle {
        MessageHandle {
            topic: "raw-content".to_string(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn claim_removes_the_entry() {
        let tracker = MessageTracker::new();
        tracker.track("c1", handle(7));
        assert_eq!(tracker.len(), 1);

        let claimed = tracker.claim("c1").unwrap();
        assert_eq!(claimed.offset, 7);
        assert!(tracker.claim("c1").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn tracking_the_same_id_twice_keeps_the_newest_handle() {
        let tracker = MessageTracker::new();
        tracker.track("c1", handle(7));
        tracker.track("c1", handle(9));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.claim("c1").unwrap().offset, 9);
    }

    #[test]
    fn drain_surfaces_unclaimed_entries() {
        let tracker = MessageTracker::new();
        tracker.track("c1", handle(1));
        tracker.track("c2", handle(2));
        tracker.claim("c1");

        let leaked = tracker.drain();
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].0, "c2");
        assert!(tracker.is_empty());
    }
}
