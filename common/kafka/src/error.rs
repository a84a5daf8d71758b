use common_retry::{Classify, ErrorClass};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to serialize payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("producer is in a fatal state and could not be rebuilt")]
    ProducerFatal,
    #[error("operation cancelled")]
    Cancelled,
}

/// The one place broker error codes are inspected. Stages and ports only
/// ever see the retryable/fatal verdict.
pub fn classify_code(code: RDKafkaErrorCode) -> ErrorClass {
    match code {
        RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::OperationTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::QueueFull => ErrorClass::Retryable,
        _ => ErrorClass::Fatal,
    }
}

pub fn classify_kafka_error(err: &KafkaError) -> ErrorClass {
    match err {
        KafkaError::Transaction(inner) => {
            if inner.is_retriable() {
                ErrorClass::Retryable
            } else {
                ErrorClass::Fatal
            }
        }
        other => match other.rdkafka_error_code() {
            Some(code) => classify_code(code),
            None => ErrorClass::Fatal,
        },
    }
}

/// Producer-state errors invalidate the whole producer instance; the only
/// recovery is tearing it down and rebuilding with fresh transactions.
pub fn requires_producer_rebuild(err: &KafkaError) -> bool {
    if let KafkaError::Transaction(inner) = err {
        if inner.is_fatal() {
            return true;
        }
    }
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::InvalidProducerEpoch)
            | Some(RDKafkaErrorCode::InvalidProducerIdMapping)
            | Some(RDKafkaErrorCode::ProducerFenced)
            | Some(RDKafkaErrorCode::Fenced)
    )
}

impl Classify for BrokerError {
    fn classify(&self) -> ErrorClass {
        match self {
            BrokerError::Kafka(err) => classify_kafka_error(err),
            BrokerError::Serde(_) => ErrorClass::Fatal,
            BrokerError::ProducerFatal => ErrorClass::Fatal,
            BrokerError::Cancelled => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        for code in [
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::OperationTimedOut,
            RDKafkaErrorCode::RequestTimedOut,
            RDKafkaErrorCode::BrokerNotAvailable,
            RDKafkaErrorCode::LeaderNotAvailable,
            RDKafkaErrorCode::AllBrokersDown,
        ] {
            assert_eq!(classify_code(code), ErrorClass::Retryable, "{code:?}");
        }
    }

    #[test]
    fn producer_state_and_auth_errors_are_fatal() {
        for code in [
            RDKafkaErrorCode::InvalidProducerEpoch,
            RDKafkaErrorCode::InvalidProducerIdMapping,
            RDKafkaErrorCode::SaslAuthenticationFailed,
            RDKafkaErrorCode::Authentication,
        ] {
            assert_eq!(classify_code(code), ErrorClass::Fatal, "{code:?}");
        }
    }

    #[test]
    fn epoch_loss_demands_a_rebuild() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::InvalidProducerEpoch);
        assert!(requires_producer_rebuild(&err));

        let transient = KafkaError::MessageProduction(RDKafkaErrorCode::RequestTimedOut);
        assert!(!requires_producer_rebuild(&transient));
    }

    #[test]
    fn serialization_failures_never_retry() {
        let err = BrokerError::Serde(serde_json::from_str::<u32>("not json").unwrap_err());
        assert_eq!(err.classify(), ErrorClass::Fatal);
    }
}
