//! The unit of wire transfer: routing metadata plus an opaque payload.

use crate::member::MemberKey;
use serde::{Deserialize, Serialize};

/// A message envelope.
///
/// The payload is already encoded by a payload codec; `class_name` tells the
/// receiver which codec to decode it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity of the originating member.
    pub sender: MemberKey,
    /// Symmetric key material. Present exactly when the envelope is encrypted.
    pub key: Option<Vec<u8>>,
    /// Scheduling offset, interpreted by the receiver.
    pub execute_time: i32,
    /// Sender-side timestamp used for staleness heuristics by consumers.
    pub milliseconds_since_midnight: i32,
    /// Logical channel name.
    pub topic: String,
    /// Optional routing sub-key within the topic. Empty when unused.
    pub partition: String,
    /// Type identifier of the payload.
    pub class_name: String,
    /// Encoded application message.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Unencrypted envelope with no partition, execute time, or timestamp.
    pub fn new(
        sender: MemberKey,
        topic: impl Into<String>,
        class_name: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            sender,
            key: None,
            execute_time: 0,
            milliseconds_since_midnight: 0,
            topic: topic.into(),
            partition: String::new(),
            class_name: class_name.into(),
            payload,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_execute_time(mut self, execute_time: i32) -> Self {
        self.execute_time = execute_time;
        self
    }

    pub fn with_timestamp(mut self, milliseconds_since_midnight: i32) -> Self {
        self.milliseconds_since_midnight = milliseconds_since_midnight;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// String form of the sender identity.
    pub fn sender_key(&self) -> String {
        self.sender.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let sender: MemberKey = "10.0.0.5:9000:9001".parse().unwrap();
        let env = Envelope::new(sender, "orders", "OrderPlaced", vec![1, 2, 3])
            .with_partition("eu")
            .with_execute_time(250)
            .with_timestamp(1_000);
        assert!(!env.is_encrypted());
        assert_eq!(env.sender_key(), "10.0.0.5:9000:9001");
        assert_eq!(env.partition, "eu");
        assert_eq!(env.execute_time, 250);

        let env = env.with_key(vec![9; 16]);
        assert!(env.is_encrypted());
    }
}
