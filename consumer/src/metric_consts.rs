pub const MESSAGES_RECEIVED: &str = "sentiflow_messages_received";
pub const POISON_MESSAGES: &str = "sentiflow_poison_messages";
pub const DEDUP_SKIPPED: &str = "sentiflow_dedup_skipped";
pub const BATCHES_PUBLISHED: &str = "sentiflow_batches_published";
pub const PUBLISH_FAILURES: &str = "sentiflow_publish_failures";
pub const OFFSETS_COMMITTED: &str = "sentiflow_offsets_committed";
pub const GATE_HELD: &str = "sentiflow_gate_held_flushes";
pub const ITEMS_SHED: &str = "sentiflow_items_shed";
pub const SUMMARIES_REJECTED: &str = "sentiflow_summaries_rejected";
pub const RESULTS_STORED: &str = "sentiflow_results_stored";
pub const DEAD_LETTERED: &str = "sentiflow_dead_lettered";
