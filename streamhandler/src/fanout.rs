use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common_batch::BatchBuffer;
use common_store::{ChangeEventType, ChangeStream, StoreError};

use crate::BatchSink;

const EVENTS_DECODED: &str = "sentiflow_cdc_events_decoded";
const EVENTS_SKIPPED: &str = "sentiflow_cdc_events_skipped";
const FLUSH_FAILURES: &str = "sentiflow_cdc_flush_failures";
const ITEMS_WRITTEN: &str = "sentiflow_cdc_items_written";

/// Fans one table's change stream into every configured sink.
///
/// Only INSERT events are materialized. Decode failures skip the single
/// record; a sink failing a whole batch does not stop the other sink, and
/// the batch is re-queued for the next flush tick (sinks are idempotent
/// by key, so the surviving sink rewriting it is harmless).
pub struct FanOut<T> {
    table: &'static str,
    stream: Box<dyn ChangeStream>,
    sinks: Vec<Arc<dyn BatchSink<T>>>,
    buffer: BatchBuffer<T>,
    flush_interval: Duration,
    poll_idle: Duration,
}

impl<T> FanOut<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(
        table: &'static str,
        stream: Box<dyn ChangeStream>,
        sinks: Vec<Arc<dyn BatchSink<T>>>,
        flush_interval: Duration,
        poll_idle: Duration,
    ) -> Self {
        FanOut {
            table,
            stream,
            sinks,
            buffer: BatchBuffer::new(64),
            flush_interval,
            poll_idle,
        }
    }

    pub async fn run(&mut self, token: &CancellationToken) -> Result<(), StoreError> {
        info!(table = self.table, "starting change stream fan-out");
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.flush().await;
                    info!(table = self.table, "fan-out stopped");
                    return Ok(());
                }
                _ = ticker.tick() => self.flush().await,
                polled = self.stream.poll(token) => {
                    let events = match polled {
                        Ok(events) => events,
                        Err(StoreError::Cancelled) => continue,
                        Err(err) => {
                            error!(table = self.table, error = %err, "change stream poll failed");
                            tokio::time::sleep(self.poll_idle).await;
                            continue;
                        }
                    };
                    if events.is_empty() {
                        tokio::time::sleep(self.poll_idle).await;
                        continue;
                    }
                    self.ingest(events);
                }
            }
        }
    }

    /// Decode INSERT events into the buffer; everything else is dropped.
    pub fn ingest(&self, events: Vec<common_store::ChangeEvent>) {
        for event in events {
            if event.event_type != ChangeEventType::Insert {
                counter!(EVENTS_SKIPPED, "table" => self.table, "cause" => "non_insert")
                    .increment(1);
                continue;
            }
            match serde_json::from_value::<T>(event.new_image) {
                Ok(item) => {
                    counter!(EVENTS_DECODED, "table" => self.table).increment(1);
                    self.buffer.add(item);
                }
                Err(err) => {
                    // One bad record must not stall the table's stream.
                    counter!(EVENTS_SKIPPED, "table" => self.table, "cause" => "decode")
                        .increment(1);
                    warn!(table = self.table, error = %err, "skipping undecodable change record");
                }
            }
        }
    }

    /// Two independent writes per flush; a failure in one sink never
    /// aborts the other.
    pub async fn flush(&self) {
        let batch = self.buffer.drain();
        if batch.is_empty() {
            return;
        }

        let mut any_failed = false;
        for sink in &self.sinks {
            match sink.write(&batch).await {
                Ok(()) => {
                    counter!(ITEMS_WRITTEN, "table" => self.table, "sink" => sink.name())
                        .increment(batch.len() as u64);
                }
                Err(err) => {
                    any_failed = true;
                    counter!(FLUSH_FAILURES, "table" => self.table, "sink" => sink.name())
                        .increment(1);
                    error!(
                        table = self.table,
                        sink = sink.name(),
                        batch_size = batch.len(),
                        error = %err,
                        "sink rejected batch, will retry on the next tick"
                    );
                }
            }
        }

        if any_failed {
            for item in batch {
                self.buffer.add(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common_store::memory::MemoryChangeStream;
    use common_store::ChangeEvent;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::SinkError;

    #[derive(Default)]
    struct RecordingSink {
        written: Mutex<Vec<Vec<String>>>,
        fail_next: AtomicU32,
    }

    impl RecordingSink {
        fn total_items(&self) -> usize {
            self.written.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl BatchSink<String> for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write(&self, items: &[String]) -> Result<(), SinkError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(SinkError::Search("scripted failure".to_string()));
            }
            self.written.lock().unwrap().push(items.to_vec());
            Ok(())
        }
    }

    fn insert(value: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            event_type: ChangeEventType::Insert,
            new_image: value,
        }
    }

    fn fanout(sinks: Vec<Arc<dyn BatchSink<String>>>) -> FanOut<String> {
        FanOut::new(
            "TestTable",
            Box::new(MemoryChangeStream::new()),
            sinks,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn only_insert_events_reach_the_sinks() {
        let sink = Arc::new(RecordingSink::default());
        let fan = fanout(vec![sink.clone()]);

        fan.ingest(vec![
            insert(json!("kept")),
            ChangeEvent {
                event_type: ChangeEventType::Modify,
                new_image: json!("modified"),
            },
            ChangeEvent {
                event_type: ChangeEventType::Remove,
                new_image: json!("removed"),
            },
        ]);
        fan.flush().await;

        assert_eq!(sink.written.lock().unwrap().as_slice(), &[vec!["kept".to_string()]]);
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped_without_stalling_the_batch() {
        let sink = Arc::new(RecordingSink::default());
        let fan = fanout(vec![sink.clone()]);

        fan.ingest(vec![
            insert(json!("first")),
            insert(json!({"not": "a string"})),
            insert(json!("second")),
        ]);
        fan.flush().await;

        assert_eq!(sink.total_items(), 2);
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_abort_the_other() {
        let healthy = Arc::new(RecordingSink::default());
        let failing = Arc::new(RecordingSink::default());
        failing.fail_next.store(1, Ordering::SeqCst);
        let fan = fanout(vec![failing.clone(), healthy.clone()]);

        fan.ingest(vec![insert(json!("item"))]);
        fan.flush().await;

        // The healthy sink got the batch despite its sibling failing.
        assert_eq!(healthy.total_items(), 1);
        assert_eq!(failing.total_items(), 0);

        // Next tick retries; the previously failing sink catches up.
        fan.flush().await;
        assert_eq!(failing.total_items(), 1);
        assert_eq!(healthy.total_items(), 2);
    }

    #[tokio::test]
    async fn run_drains_the_stream_and_flushes_on_cancel() {
        let stream = MemoryChangeStream::new();
        stream.push_batch(vec![insert(json!("a")), insert(json!("b"))]);
        let sink = Arc::new(RecordingSink::default());
        let mut fan = FanOut::new(
            "TestTable",
            Box::new(stream),
            vec![sink.clone() as Arc<dyn BatchSink<String>>],
            Duration::from_secs(60),
            Duration::from_millis(5),
        );

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        fan.run(&token).await.unwrap();
        assert_eq!(sink.total_items(), 2);
    }
}
