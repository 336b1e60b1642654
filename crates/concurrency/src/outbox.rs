//! Outbox messages
//!
//! Messages enqueued during an execution become visible to the relay worker
//! only after the transaction commits. A failed or rolled-back transaction
//! discards its outbox without side effect.

use theus_core::value::Value;

/// A message staged for post-commit delivery
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    /// Routing topic
    pub topic: String,
    /// Message body
    pub payload: Value,
}

impl OutboxMessage {
    /// Create a message
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        OutboxMessage {
            topic: topic.into(),
            payload,
        }
    }
}
