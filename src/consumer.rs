//!
//! Push consumer API: what a listener container needs from the broker client.
//!
//! The broker client owns the consume thread pool, pulls batches and calls the registered
//! [`MessageListener`]; redelivery timing is driven by the status and context the listener returns.
//!
use crate::error::ClientError;
use crate::message::{MessageExt, MessageQueue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_CONSUME_THREAD_MIN: u32 = 20;
pub const DEFAULT_CONSUME_THREAD_MAX: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageModel {
    /// Each message goes to one consumer of the group.
    #[default]
    Clustering,
    /// Each message goes to every consumer of the group.
    Broadcasting,
}

impl fmt::Display for MessageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageModel::Clustering => f.write_str("CLUSTERING"),
            MessageModel::Broadcasting => f.write_str("BROADCASTING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionType {
    Tag,
    Sql92,
}

/// Server side filter of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSelector {
    pub expression_type: ExpressionType,
    pub expression: String,
}

impl MessageSelector {
    /// Tag match, e.g. `TagA || TagB`; `*` or empty subscribes to all.
    pub fn by_tag(expression: &str) -> Self {
        let expression = if expression.trim().is_empty() {
            "*"
        } else {
            expression
        };
        Self {
            expression_type: ExpressionType::Tag,
            expression: expression.to_owned(),
        }
    }

    pub fn by_sql(expression: &str) -> Self {
        Self {
            expression_type: ExpressionType::Sql92,
            expression: expression.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeConcurrentlyContext {
    pub message_queue: MessageQueue,
    /// -1 sends straight to the dead letter queue, 0 lets the broker pick, >0 is the client's choice.
    pub delay_level_when_next_consume: i32,
    pub ack_index: i32,
}

impl ConsumeConcurrentlyContext {
    pub fn new(message_queue: MessageQueue) -> Self {
        Self {
            message_queue,
            delay_level_when_next_consume: 0,
            ack_index: i32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeConcurrentlyStatus {
    ConsumeSuccess,
    ReconsumeLater,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOrderlyContext {
    pub message_queue: MessageQueue,
    pub auto_commit: bool,
    /// Non-positive values leave the pause to the consumer default.
    pub suspend_current_queue_time_millis: i64,
}

impl ConsumeOrderlyContext {
    pub fn new(message_queue: MessageQueue) -> Self {
        Self {
            message_queue,
            auto_commit: true,
            suspend_current_queue_time_millis: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOrderlyStatus {
    Success,
    SuspendCurrentQueueAMoment,
}

/// Consumes batches from any queue, possibly many at once.
#[async_trait]
pub trait MessageListenerConcurrently: Send + Sync {
    async fn consume_message(
        &self,
        msgs: &[MessageExt],
        context: &mut ConsumeConcurrentlyContext,
    ) -> ConsumeConcurrentlyStatus;
}

/// Consumes batches of one queue at a time, in queue order.
#[async_trait]
pub trait MessageListenerOrderly: Send + Sync {
    async fn consume_message(
        &self,
        msgs: &[MessageExt],
        context: &mut ConsumeOrderlyContext,
    ) -> ConsumeOrderlyStatus;
}

/// Dispatch routine installed on a push consumer.
#[derive(Clone)]
pub enum MessageListener {
    Concurrently(Arc<dyn MessageListenerConcurrently>),
    Orderly(Arc<dyn MessageListenerOrderly>),
}

impl fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageListener::Concurrently(_) => f.write_str("MessageListener::Concurrently"),
            MessageListener::Orderly(_) => f.write_str("MessageListener::Orderly"),
        }
    }
}

/// Settings a push consumer is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConsumerOptions {
    pub consumer_group: String,
    pub name_server: String,
    pub message_model: MessageModel,
    pub consume_thread_min: u32,
    pub consume_thread_max: u32,
}

impl PushConsumerOptions {
    pub fn new(consumer_group: &str, name_server: &str) -> Self {
        Self {
            consumer_group: consumer_group.to_owned(),
            name_server: name_server.to_owned(),
            message_model: MessageModel::default(),
            consume_thread_min: DEFAULT_CONSUME_THREAD_MIN,
            consume_thread_max: DEFAULT_CONSUME_THREAD_MAX,
        }
    }
}

/// A broker subscription delivering messages to one listener.
#[async_trait]
pub trait PushConsumer: Send + Sync {
    fn subscribe(&mut self, topic: &str, selector: MessageSelector) -> Result<(), ClientError>;

    fn register_message_listener(&mut self, listener: MessageListener);

    /// Connect and begin delivering to the registered listener.
    async fn start(&mut self) -> Result<(), ClientError>;

    async fn shutdown(&mut self);
}

/// Creates push consumers; one per listener container.
///
/// [`ConsumeServiceFactory`](crate::consume_service::ConsumeServiceFactory) runs them in process.
pub trait ConsumerFactory: Send + Sync {
    fn create(&self, options: PushConsumerOptions) -> Result<Box<dyn PushConsumer>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors() {
        assert_eq!(MessageSelector::by_tag("").expression, "*");
        assert_eq!(MessageSelector::by_tag("TagA || TagB").expression, "TagA || TagB");
        let sql = MessageSelector::by_sql("a > 5");
        assert_eq!(sql.expression_type, ExpressionType::Sql92);
    }

    #[test]
    fn test_contexts_defaults() {
        let queue = MessageQueue::new("T", "b1", 0);
        let concurrently = ConsumeConcurrentlyContext::new(queue.clone());
        assert_eq!(concurrently.delay_level_when_next_consume, 0);
        let orderly = ConsumeOrderlyContext::new(queue);
        assert!(orderly.auto_commit);
        assert_eq!(orderly.suspend_current_queue_time_millis, -1);
    }

    #[test]
    fn test_message_model_serde() -> Result<(), serde_json::Error> {
        let model: MessageModel = serde_json::from_str("\"BROADCASTING\"")?;
        assert_eq!(model, MessageModel::Broadcasting);
        assert_eq!(model.to_string(), "BROADCASTING");
        Ok(())
    }
}
