//! Shared batch buffer used by every pipeline stage.
//!
//! Many ingest tasks push into the buffer; exactly one flusher drains it,
//! either because the stage's batch size was reached or because the flush
//! timer ticked. Draining takes the whole batch atomically so the flusher
//! never observes a half-built batch.

use std::sync::Mutex;

use tracing::debug;

pub struct BatchBuffer<T> {
    buffer: Mutex<Vec<T>>,
    capacity_hint: usize,
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity_hint: usize) -> Self {
        BatchBuffer {
            buffer: Mutex::new(Vec::with_capacity(capacity_hint)),
            capacity_hint,
        }
    }

    pub fn add(&self, item: T) {
        self.buffer.lock().expect("batch buffer poisoned").push(item);
    }

    pub fn size(&self) -> usize {
        self.buffer.lock().expect("batch buffer poisoned").len()
    }

    pub fn has_data(&self) -> bool {
        self.size() > 0
    }

    /// Atomic take-and-clear. The only consuming accessor; the single
    /// flusher per stage is the only caller.
    pub fn drain(&self) -> Vec<T> {
        let mut buffer = self.buffer.lock().expect("batch buffer poisoned");
        if buffer.is_empty() {
            return Vec::new();
        }
        std::mem::replace(&mut *buffer, Vec::with_capacity(self.capacity_hint))
    }

    pub fn log_batch(&self, stage: &str) {
        debug!(stage, batch_size = self.size(), "processing batch");
    }
}

impl<T: Clone> BatchBuffer<T> {
    /// Copy of the current contents, for inspection without consuming.
    pub fn peek(&self) -> Vec<T> {
        self.buffer.lock().expect("batch buffer poisoned").clone()
    }
}

impl<T> Default for BatchBuffer<T> {
    fn default() -> Self {
        BatchBuffer::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drain_takes_everything_and_clears() {
        let buffer = BatchBuffer::new(4);
        buffer.add(1);
        buffer.add(2);
        buffer.add(3);
        assert_eq!(buffer.size(), 3);

        let drained = buffer.drain();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(buffer.size(), 0);
        assert!(!buffer.has_data());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn peek_leaves_contents_in_place() {
        let buffer = BatchBuffer::new(4);
        buffer.add("a");
        buffer.add("b");

        assert_eq!(buffer.peek(), vec!["a", "b"]);
        assert_eq!(buffer.size(), 2);
    }

    #[tokio::test]
    async fn many_producers_single_drainer() {
        let buffer = Arc::new(BatchBuffer::new(64));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    buffer.add(worker * 100 + i);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut drained = buffer.drain();
        drained.sort_unstable();
        assert_eq!(drained.len(), 800);
        assert_eq!(drained.first(), Some(&0));
        assert_eq!(drained.last(), Some(&799));
    }
}
