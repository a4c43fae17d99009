//!
//! Producer facade: six ways to send an [`Envelope`].
//!
//! | Operation | Waits for the broker | Queue |
//! |---|---|---|
//! | `sync_send` | yes | round-robin |
//! | `sync_send_orderly` | yes | hash of the key |
//! | `async_send` | no, callback | round-robin |
//! | `async_send_orderly` | no, callback | hash of the key |
//! | `send_one_way` | never | round-robin |
//! | `send_one_way_orderly` | never | hash of the key |
//!
//! Failed synchronous and asynchronous sends are retried inside the client, so a message may
//! reach consumers more than once. Consumers should deduplicate on the message keys.
//!
use crate::envelope::Envelope;
use crate::error::{ClientError, MessagingError};
use crate::message::Message;
use crate::producer::{
    MessageQueueSelector, ProducerClient, SelectMessageQueueByHash, SendCallback, SendResult,
};
use crate::resolver::Charset;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct RocketMQTemplate {
    producer: Arc<dyn ProducerClient>,
    message_queue_selector: Arc<dyn MessageQueueSelector>,
    charset: Charset,
    destroyed: AtomicBool,
}

impl RocketMQTemplate {
    pub fn new(producer: Arc<dyn ProducerClient>) -> Self {
        Self {
            producer,
            message_queue_selector: Arc::new(SelectMessageQueueByHash),
            charset: Charset::Utf8,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Replace the hash selector used by the orderly sends.
    pub fn with_message_queue_selector(mut self, selector: Arc<dyn MessageQueueSelector>) -> Self {
        self.message_queue_selector = selector;
        self
    }

    /// Charset text bodies are encoded with.
    pub fn with_charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    pub fn producer(&self) -> &Arc<dyn ProducerClient> {
        &self.producer
    }

    pub async fn start(&self) -> Result<(), MessagingError> {
        self.producer.start().await.map_err(MessagingError::Client)
    }

    /// Shut the producer down. Repeated calls are no-ops.
    pub async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.producer.shutdown().await;
        }
    }

    /// Send and wait for the broker acknowledgment, within the producer's send timeout.
    pub async fn sync_send<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<SendResult, MessagingError> {
        self.sync_send_with_timeout(envelope, self.producer.send_timeout())
            .await
    }

    pub async fn sync_send_with_timeout<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        timeout: Duration,
    ) -> Result<SendResult, MessagingError> {
        const OPERATION: &str = "syncSend";
        let msg = self.convert(OPERATION, envelope)?;
        let sending = self.producer.send(msg, timeout);
        match tokio::time::timeout(timeout, sending).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(failed(OPERATION, envelope, e)),
            Err(_) => Err(failed(OPERATION, envelope, ClientError::Timeout(timeout.as_millis()))),
        }
    }

    /// Send to the queue picked from `hash_key`; messages sharing a key keep their order.
    pub async fn sync_send_orderly<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        hash_key: &str,
    ) -> Result<SendResult, MessagingError> {
        self.sync_send_orderly_with_timeout(envelope, hash_key, self.producer.send_timeout())
            .await
    }

    pub async fn sync_send_orderly_with_timeout<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        hash_key: &str,
        timeout: Duration,
    ) -> Result<SendResult, MessagingError> {
        const OPERATION: &str = "syncSendOrderly";
        let msg = self.convert(OPERATION, envelope)?;
        let sending = self.producer.send_to_selected(
            msg,
            Arc::clone(&self.message_queue_selector),
            hash_key,
            timeout,
        );
        match tokio::time::timeout(timeout, sending).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(failed(OPERATION, envelope, e)),
            Err(_) => Err(failed(OPERATION, envelope, ClientError::Timeout(timeout.as_millis()))),
        }
    }

    /// Submit a send and return at once; `callback` receives the outcome.
    ///
    /// An error returned here means the send was never submitted and `callback` will not run.
    pub fn async_send<T, F>(&self, envelope: &Envelope<T>, callback: F) -> Result<(), MessagingError>
    where
        T: Serialize,
        F: FnOnce(Result<SendResult, MessagingError>) + Send + 'static,
    {
        self.async_send_with_timeout(envelope, callback, self.producer.send_timeout())
    }

    pub fn async_send_with_timeout<T, F>(
        &self,
        envelope: &Envelope<T>,
        callback: F,
        timeout: Duration,
    ) -> Result<(), MessagingError>
    where
        T: Serialize,
        F: FnOnce(Result<SendResult, MessagingError>) + Send + 'static,
    {
        const OPERATION: &str = "asyncSend";
        let msg = self.convert(OPERATION, envelope)?;
        self.producer
            .send_async(msg, wrap_callback(OPERATION, callback), timeout)
            .map_err(|e| failed(OPERATION, envelope, e))
    }

    pub fn async_send_orderly<T, F>(
        &self,
        envelope: &Envelope<T>,
        hash_key: &str,
        callback: F,
    ) -> Result<(), MessagingError>
    where
        T: Serialize,
        F: FnOnce(Result<SendResult, MessagingError>) + Send + 'static,
    {
        self.async_send_orderly_with_timeout(
            envelope,
            hash_key,
            callback,
            self.producer.send_timeout(),
        )
    }

    pub fn async_send_orderly_with_timeout<T, F>(
        &self,
        envelope: &Envelope<T>,
        hash_key: &str,
        callback: F,
        timeout: Duration,
    ) -> Result<(), MessagingError>
    where
        T: Serialize,
        F: FnOnce(Result<SendResult, MessagingError>) + Send + 'static,
    {
        const OPERATION: &str = "asyncSendOrderly";
        let msg = self.convert(OPERATION, envelope)?;
        self.producer
            .send_async_to_selected(
                msg,
                Arc::clone(&self.message_queue_selector),
                hash_key,
                wrap_callback(OPERATION, callback),
                timeout,
            )
            .map_err(|e| failed(OPERATION, envelope, e))
    }

    /// Write the message without waiting for the broker. Delivery is not guaranteed.
    pub async fn send_one_way<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<(), MessagingError> {
        const OPERATION: &str = "sendOneWay";
        let msg = self.convert(OPERATION, envelope)?;
        self.producer
            .send_oneway(msg)
            .await
            .map_err(|e| failed(OPERATION, envelope, e))
    }

    pub async fn send_one_way_orderly<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
        hash_key: &str,
    ) -> Result<(), MessagingError> {
        const OPERATION: &str = "sendOneWayOrderly";
        let msg = self.convert(OPERATION, envelope)?;
        self.producer
            .send_oneway_to_selected(msg, Arc::clone(&self.message_queue_selector), hash_key)
            .await
            .map_err(|e| failed(OPERATION, envelope, e))
    }

    fn convert<T: Serialize>(
        &self,
        operation: &'static str,
        envelope: &Envelope<T>,
    ) -> Result<Message, MessagingError> {
        envelope.to_message(self.charset).map_err(|e| {
            info!(
                "{} failed. destination:{}, message is invalid: {}",
                operation,
                envelope.topic(),
                e
            );
            e
        })
    }
}

fn failed<T>(operation: &'static str, envelope: &Envelope<T>, source: ClientError) -> MessagingError {
    info!(
        error = %source,
        "{} failed. destination:{}, keys:{}",
        operation,
        envelope.topic(),
        envelope.keys().unwrap_or_default()
    );
    MessagingError::Send { operation, source }
}

fn wrap_callback<F>(operation: &'static str, callback: F) -> SendCallback
where
    F: FnOnce(Result<SendResult, MessagingError>) + Send + 'static,
{
    Box::new(move |result| {
        callback(result.map_err(|source| MessagingError::Send { operation, source }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockProducerClient, SendMode};
    use serde::Deserialize;
    use tokio::sync::oneshot;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderEvent {
        id: u64,
        amount: i64,
    }

    async fn template(behavior: MockBehavior) -> (RocketMQTemplate, Arc<MockProducerClient>) {
        let client = Arc::new(MockProducerClient::new(behavior, 4));
        let template = RocketMQTemplate::new(Arc::clone(&client) as Arc<dyn ProducerClient>);
        template.start().await.unwrap();
        (template, client)
    }

    #[tokio::test]
    async fn test_sync_send() -> Result<(), MessagingError> {
        let (template, client) = template(MockBehavior::Acknowledge).await;

        let result = template
            .sync_send(&Envelope::new("T", OrderEvent { id: 1, amount: 10 }).with_tags("TagA"))
            .await?;
        assert!(!result.msg_id.is_empty());

        let sent = client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mode, SendMode::Sync);
        assert_eq!(sent[0].message.tags(), Some("TagA"));
        assert_eq!(&sent[0].message.body[..], br#"{"amount":10,"id":1}"#);
        Ok(())
    }

    #[tokio::test]
    async fn test_orderly_sends_share_a_queue_per_key() -> Result<(), MessagingError> {
        let (template, client) = template(MockBehavior::Acknowledge).await;

        for i in 0..3 {
            let result = template
                .sync_send_orderly(&Envelope::text("T", format!("step-{}", i)), "hello")
                .await?;
            assert!(!result.msg_id.is_empty());
            assert_eq!(result.message_queue.queue_id, 2);
        }
        template
            .send_one_way_orderly(&Envelope::text("T", "step-3"), "hello")
            .await?;

        let sent = client.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent
            .iter()
            .all(|record| record.queue.as_ref().map(|mq| mq.queue_id) == Some(2)));
        assert_eq!(sent[3].mode, SendMode::Oneway);
        Ok(())
    }

    #[tokio::test]
    async fn test_async_sends_report_through_callback() -> Result<(), Box<dyn std::error::Error>> {
        let (template, client) = template(MockBehavior::Acknowledge).await;

        let (tx, rx) = oneshot::channel();
        template.async_send(&Envelope::text("T", "hello"), move |result| {
            let _ = tx.send(result);
        })?;
        assert!(!rx.await??.msg_id.is_empty());

        client.set_behavior(MockBehavior::Fail);
        let (tx, rx) = oneshot::channel();
        template.async_send_orderly(&Envelope::text("T", "hello"), "order-1", move |result| {
            let _ = tx.send(result);
        })?;
        match rx.await? {
            Err(MessagingError::Send { operation, source }) => {
                assert_eq!(operation, "asyncSendOrderly");
                assert!(matches!(source, ClientError::Broker { .. }));
            }
            other => panic!("expected a send failure, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_name_the_operation() {
        let (template, _client) = template(MockBehavior::Fail).await;
        let err = template
            .sync_send(&Envelope::text("T", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::Send {
                operation: "syncSend",
                source: ClientError::Broker { .. }
            }
        ));
        assert!(err.to_string().starts_with("syncSend failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_sync_send_times_out() {
        let (template, _client) = template(MockBehavior::Hang).await;

        let begin = tokio::time::Instant::now();
        let result = template
            .sync_send_with_timeout(&Envelope::text("T", "hello"), Duration::from_millis(3000))
            .await;
        assert!(matches!(
            result,
            Err(MessagingError::Send {
                operation: "syncSend",
                source: ClientError::Timeout(3000)
            })
        ));
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test]
    async fn test_invalid_envelopes_never_reach_the_client() {
        let (template, client) = template(MockBehavior::Acknowledge).await;
        let empty_topic = Envelope::text("", "hello");
        let empty_body = Envelope::text("T", "");

        for envelope in [&empty_topic, &empty_body] {
            assert!(matches!(
                template.sync_send(envelope).await,
                Err(MessagingError::IllegalArgument(_))
            ));
            assert!(matches!(
                template.sync_send_orderly(envelope, "k").await,
                Err(MessagingError::IllegalArgument(_))
            ));
            assert!(matches!(
                template.async_send(envelope, |_| {}),
                Err(MessagingError::IllegalArgument(_))
            ));
            assert!(matches!(
                template.async_send_orderly(envelope, "k", |_| {}),
                Err(MessagingError::IllegalArgument(_))
            ));
            assert!(matches!(
                template.send_one_way(envelope).await,
                Err(MessagingError::IllegalArgument(_))
            ));
            assert!(matches!(
                template.send_one_way_orderly(envelope, "k").await,
                Err(MessagingError::IllegalArgument(_))
            ));
        }
        assert!(client.sent().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (template, client) = template(MockBehavior::Acknowledge).await;
        template.destroy().await;
        template.destroy().await;
        assert!(!client.is_started());
        assert_eq!(client.shutdown_calls(), 1);
    }
}
