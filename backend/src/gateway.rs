//! Outbound messaging gateway abstraction.
//!
//! Any chat-bot or messaging API that can deliver a text message to an
//! opaque chat id satisfies this contract. The host owns timeouts on the
//! underlying network call.

use async_trait::async_trait;
use thiserror::Error;

/// Error returned by a gateway send. The raw text matters: the dispatcher
/// classifies permanent failures (unreachable recipient) from it.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

impl SendError {
    /// Whether the gateway reported the recipient as unreachable (chat gone,
    /// bot blocked, account deactivated). Such recipients are deactivated so
    /// future dispatches skip them instead of retrying a doomed send.
    pub fn is_permanent(&self) -> bool {
        let SendError::Delivery(text) = self;
        let lower = text.to_lowercase();
        lower.contains("chat not found")
            || lower.contains("blocked")
            || lower.contains("deactivated")
    }
}

/// Receipt for a delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    /// Gateway-side message id, when the gateway reports one
    pub message_id: Option<String>,
}

/// A single outbound call abstraction over the messaging channel.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<SendReceipt, SendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_failure_classification() {
        assert!(SendError::Delivery("Bad Request: chat not found".into()).is_permanent());
        assert!(SendError::Delivery("Forbidden: bot was blocked by the user".into()).is_permanent());
        assert!(SendError::Delivery("Forbidden: user is deactivated".into()).is_permanent());
        assert!(!SendError::Delivery("Too Many Requests: retry after 30".into()).is_permanent());
        assert!(!SendError::Delivery("connection timed out".into()).is_permanent());
    }
}
