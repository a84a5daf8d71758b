use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:29092")]
    pub kafka_broker: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "100000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages queued in the producer

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Bound on delivery, including librdkafka-internal retries

    #[envconfig(default = "60000")]
    pub kafka_transaction_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // Pins the transactional id instead of deriving one per process.
    // Deployment must guarantee no two live producers share it.
    pub kafka_producer_id: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "sentiflow-consumer-group")]
    pub kafka_consumer_group_id: String,

    // Which pipeline stage this process runs; must match a registered topic.
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // When set, poison messages are republished here instead of only logged.
    pub kafka_dead_letter_topic: Option<String>,
}

impl ConsumerConfig {
    /// The consumer topic is application specific, so binaries seed their
    /// own default before init'ing the main config struct.
    pub fn set_defaults(consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        }
    }
}
