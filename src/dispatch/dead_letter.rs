//! Dead-letter sink for messages that exhaust their processing retries

use crate::error::DeadLetterError;
use crate::message::InboundMessage;
use tracing::warn;

/// Destination for messages the dispatcher has given up on
///
/// The sink receives the message together with the reason the final
/// handler attempt failed. Delivery here is best effort: the dispatcher
/// acknowledges the message to the broker afterwards either way, so a
/// failing sink loses the message downstream but never wedges the
/// pipeline in a redelivery loop.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn deliver(
        &self,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), DeadLetterError>;
}

/// Sink that records dead-lettered messages in the log and drops them
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDeadLetter;

#[async_trait::async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn deliver(
        &self,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        warn!(
            topic = %message.topic,
            tag = %message.tag,
            qos = ?message.qos,
            payload_bytes = message.payload.len(),
            reason = reason,
            "message dead-lettered"
        );
        Ok(())
    }
}
