//!
//! Producer API: what the template needs from the broker client.
//!
use crate::error::ClientError;
use crate::message::{Message, MessageQueue};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub send_status: SendStatus,
    /// Client-side unique id of the message.
    pub msg_id: String,
    /// Broker-side id encoding store host and commit log offset.
    pub offset_msg_id: Option<String>,
    pub message_queue: MessageQueue,
    pub queue_offset: i64,
}

/// Completion handler of an asynchronous send.
pub type SendCallback = Box<dyn FnOnce(Result<SendResult, ClientError>) + Send + 'static>;

/// Picks the destination queue of a message from the writable queues of its topic.
pub trait MessageQueueSelector: Send + Sync {
    fn select(&self, mqs: &[MessageQueue], msg: &Message, arg: &str) -> Option<MessageQueue>;
}

/// Routes by the hash of the argument so equal keys land on the same queue.
///
/// The hash is the JVM `String.hashCode`, keeping placement consistent with Java producers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectMessageQueueByHash;

impl MessageQueueSelector for SelectMessageQueueByHash {
    fn select(&self, mqs: &[MessageQueue], _msg: &Message, arg: &str) -> Option<MessageQueue> {
        if mqs.is_empty() {
            return None;
        }
        let index = java_hash_code(arg).unsigned_abs() as usize % mqs.len();
        mqs.get(index).cloned()
    }
}

pub(crate) fn java_hash_code(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// A started broker producer.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    async fn start(&self) -> Result<(), ClientError>;

    /// Close connections. Repeated calls are no-ops.
    async fn shutdown(&self);

    /// Timeout applied when a send does not name one.
    fn send_timeout(&self) -> Duration;

    /// Send and wait for the broker acknowledgment, retrying failed attempts internally.
    async fn send(&self, msg: Message, timeout: Duration) -> Result<SendResult, ClientError>;

    /// Send to the queue chosen by `selector` for `arg`.
    async fn send_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        timeout: Duration,
    ) -> Result<SendResult, ClientError>;

    /// Submit a send and return; the outcome is handed to `callback`.
    ///
    /// Errors detected before submission are returned and `callback` is dropped uncalled.
    fn send_async(
        &self,
        msg: Message,
        callback: SendCallback,
        timeout: Duration,
    ) -> Result<(), ClientError>;

    fn send_async_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        callback: SendCallback,
        timeout: Duration,
    ) -> Result<(), ClientError>;

    /// Write the message without waiting for any acknowledgment.
    async fn send_oneway(&self, msg: Message) -> Result<(), ClientError>;

    async fn send_oneway_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_java_hash_code() {
        assert_eq!(java_hash_code(""), 0);
        assert_eq!(java_hash_code("hello"), 99162322);
        // Overflows the same way the JVM does.
        assert_eq!(java_hash_code("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn test_select_by_hash_is_stable() {
        let mqs: Vec<MessageQueue> = (0..4).map(|i| MessageQueue::new("T", "b1", i)).collect();
        let msg = Message::new("T", "body");
        let selector = SelectMessageQueueByHash;

        // 99162322 % 4 == 2
        assert_eq!(selector.select(&mqs, &msg, "hello"), Some(mqs[2].clone()));
        for key in ["order-1", "order-2", "订单-3"] {
            let first = selector.select(&mqs, &msg, key);
            assert!(first.is_some());
            assert_eq!(selector.select(&mqs, &msg, key), first);
        }
        // |i32::MIN| does not fit an i32; it must not panic or go negative.
        assert_eq!(
            selector.select(&mqs, &msg, "polygenelubricants"),
            Some(mqs[0].clone())
        );
        assert_eq!(selector.select(&[], &msg, "hello"), None);
    }
}
