pub mod analysis;
pub mod gate;
pub mod raw_content;
pub mod results;
pub mod summary;

pub use gate::Gate;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::error;

use common_kafka::ports::Publisher;

/// Grace period for the final flush a stage performs on shutdown. A flush
/// either completes inside this window (publish then commit) or is
/// abandoned whole; it is never left half done.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Republish an undecodable payload to the dead-letter topic, when one is
/// configured. The consumer already committed the poison offset, so this
/// is the only remaining trace of the message.
pub async fn dead_letter_poison(
    publisher: &Arc<dyn Publisher>,
    token: &CancellationToken,
    dead_letter_topic: Option<&str>,
    source_topic: &str,
    reason: &str,
    payload: &[u8],
) {
    let Some(topic) = dead_letter_topic else {
        return;
    };
    let envelope = json!({
        "source_topic": source_topic,
        "reason": reason,
        "payload": String::from_utf8_lossy(payload),
    });
    if let Err(err) = publisher.publish(token, topic, source_topic, &envelope).await {
        error!(topic, error = %err, "failed to dead-letter poison message");
    }
}
