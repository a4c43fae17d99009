//!
//! In-process doubles of the broker client traits.
//!
//! [`MockConsumerFactory`] records every consumer a container creates and lets a test push
//! batches through the installed listener. [`ChannelMessageSource`] feeds a
//! [`ConsumeService`](crate::consume_service::ConsumeService) with batches pushed by the test.
//! [`MockProducerClient`] acknowledges, fails or ignores sends and records what it was asked to
//! send.
//!
use crate::consume_service::{Batch, MessageSource};
use crate::consumer::{
    ConsumeConcurrentlyContext, ConsumeConcurrentlyStatus, ConsumeOrderlyContext,
    ConsumeOrderlyStatus, ConsumerFactory, MessageListener, MessageSelector, PushConsumer,
    PushConsumerOptions,
};
use crate::error::ClientError;
use crate::message::{Message, MessageExt, MessageQueue};
use crate::producer::{
    MessageQueueSelector, ProducerClient, SendCallback, SendResult, SendStatus,
};
use crate::publisher;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a mock consumer was configured with and asked to do.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub options: PushConsumerOptions,
    pub subscription: Option<(String, MessageSelector)>,
    pub listener: Option<MessageListener>,
    pub started: bool,
    pub shutdown_calls: usize,
}

pub struct MockPushConsumer {
    record: Arc<Mutex<ConsumerRecord>>,
}

#[async_trait]
impl PushConsumer for MockPushConsumer {
    fn subscribe(&mut self, topic: &str, selector: MessageSelector) -> Result<(), ClientError> {
        lock(&self.record).subscription = Some((topic.to_owned(), selector));
        Ok(())
    }

    fn register_message_listener(&mut self, listener: MessageListener) {
        lock(&self.record).listener = Some(listener);
    }

    async fn start(&mut self) -> Result<(), ClientError> {
        lock(&self.record).started = true;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let mut record = lock(&self.record);
        record.started = false;
        record.shutdown_calls += 1;
    }
}

#[derive(Default)]
pub struct MockConsumerFactory {
    records: Mutex<Vec<Arc<Mutex<ConsumerRecord>>>>,
}

impl MockConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of consumers created so far.
    pub fn created(&self) -> usize {
        lock(&self.records).len()
    }

    /// Snapshot of the consumer created `index`-th.
    pub fn consumer(&self, index: usize) -> Option<ConsumerRecord> {
        lock(&self.records)
            .get(index)
            .map(|record| lock(record).clone())
    }

    fn listener(&self, index: usize) -> Option<(MessageListener, String)> {
        let record = self.consumer(index)?;
        let topic = record.subscription.map(|(topic, _)| topic)?;
        Some((record.listener?, topic))
    }

    /// Deliver `msgs` through a concurrently listener, as the consume pool would.
    ///
    /// Returns `None` if the consumer does not exist or has no concurrently listener.
    pub async fn deliver_concurrently(
        &self,
        index: usize,
        msgs: &[MessageExt],
    ) -> Option<(ConsumeConcurrentlyStatus, ConsumeConcurrentlyContext)> {
        match self.listener(index)? {
            (MessageListener::Concurrently(listener), topic) => {
                let mut context = ConsumeConcurrentlyContext::new(queue_of(&topic, msgs));
                let status = listener.consume_message(msgs, &mut context).await;
                Some((status, context))
            }
            (MessageListener::Orderly(_), _) => None,
        }
    }

    /// Deliver `msgs` through an orderly listener.
    pub async fn deliver_orderly(
        &self,
        index: usize,
        msgs: &[MessageExt],
    ) -> Option<(ConsumeOrderlyStatus, ConsumeOrderlyContext)> {
        match self.listener(index)? {
            (MessageListener::Orderly(listener), topic) => {
                let mut context = ConsumeOrderlyContext::new(queue_of(&topic, msgs));
                let status = listener.consume_message(msgs, &mut context).await;
                Some((status, context))
            }
            (MessageListener::Concurrently(_), _) => None,
        }
    }
}

fn queue_of(topic: &str, msgs: &[MessageExt]) -> MessageQueue {
    match msgs.first() {
        Some(first) => MessageQueue::new(topic, &first.broker_name, first.queue_id),
        None => MessageQueue::new(topic, "", 0),
    }
}

impl ConsumerFactory for MockConsumerFactory {
    fn create(&self, options: PushConsumerOptions) -> Result<Box<dyn PushConsumer>, ClientError> {
        let record = Arc::new(Mutex::new(ConsumerRecord {
            options,
            subscription: None,
            listener: None,
            started: false,
            shutdown_calls: 0,
        }));
        lock(&self.records).push(Arc::clone(&record));
        Ok(Box::new(MockPushConsumer { record }))
    }
}

/// Message source handing out the batches given to [`ChannelMessageSource::push`], in order.
pub struct ChannelMessageSource {
    sender: mpsc::UnboundedSender<Batch>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Batch>>,
    subscription: Mutex<Option<(String, MessageSelector)>>,
    closed: AtomicBool,
}

impl Default for ChannelMessageSource {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

impl ChannelMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch of `queue` for delivery.
    pub fn push(&self, queue: MessageQueue, messages: Vec<MessageExt>) -> bool {
        self.sender.send(Batch { queue, messages }).is_ok()
    }

    /// Topic and selector the source was opened with.
    pub fn subscription(&self) -> Option<(String, MessageSelector)> {
        lock(&self.subscription).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ChannelMessageSource {
    async fn open(&self, topic: &str, selector: &MessageSelector) -> Result<(), ClientError> {
        *lock(&self.subscription) = Some((topic.to_owned(), selector.clone()));
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self) -> Option<Batch> {
        self.receiver.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// How a [`MockProducerClient`] answers sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Acknowledge with `SEND_OK`.
    Acknowledge,
    /// Reject with a broker error.
    Fail,
    /// Never answer: synchronous sends wait forever, callbacks never run.
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Sync,
    Async,
    Oneway,
}

/// One send the mock was asked to perform.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub mode: SendMode,
    pub message: Message,
    /// Queue picked by the selector, for selector-routed sends.
    pub queue: Option<MessageQueue>,
}

pub struct MockProducerClient {
    behavior: Mutex<MockBehavior>,
    queues: Vec<MessageQueue>,
    sent: Mutex<Vec<SentRecord>>,
    started: AtomicBool,
    shutdown_calls: AtomicUsize,
    offset: AtomicI64,
}

impl MockProducerClient {
    /// Mock producer whose topics have `queues` queues on broker `mock-broker`.
    pub fn new(behavior: MockBehavior, queues: i32) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            queues: (0..queues)
                .map(|queue_id| MessageQueue::new("", "mock-broker", queue_id))
                .collect(),
            sent: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_calls: AtomicUsize::new(0),
            offset: AtomicI64::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        lock(&self.sent).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        *lock(&self.behavior)
    }

    fn queues_of(&self, topic: &str) -> Vec<MessageQueue> {
        self.queues
            .iter()
            .map(|mq| MessageQueue::new(topic, &mq.broker_name, mq.queue_id))
            .collect()
    }

    fn record(
        &self,
        mode: SendMode,
        msg: &Message,
        selected: Option<(&dyn MessageQueueSelector, &str)>,
    ) -> Result<MessageQueue, ClientError> {
        if !self.is_started() {
            return Err(ClientError::NotRunning);
        }
        let mqs = self.queues_of(&msg.topic);
        let queue = match selected {
            Some((selector, arg)) => Some(selector.select(&mqs, msg, arg).ok_or_else(|| {
                ClientError::IllegalArgument("select message queue returned none".to_owned())
            })?),
            None => None,
        };
        lock(&self.sent).push(SentRecord {
            mode,
            message: msg.clone(),
            queue: queue.clone(),
        });
        queue
            .or_else(|| mqs.first().cloned())
            .ok_or_else(|| ClientError::NoRoute(msg.topic.clone()))
    }

    fn answer(&self, mq: MessageQueue) -> Result<SendResult, ClientError> {
        match self.behavior() {
            MockBehavior::Fail => Err(ClientError::Broker {
                addr: "mock-broker".to_owned(),
                code: 1,
                remark: "mock failure".to_owned(),
            }),
            _ => {
                let offset = self.offset.fetch_add(1, Ordering::SeqCst);
                Ok(SendResult {
                    send_status: SendStatus::SendOk,
                    msg_id: format!("{:032X}", offset + 1),
                    offset_msg_id: None,
                    message_queue: mq,
                    queue_offset: offset,
                })
            }
        }
    }

    async fn send_sync(
        &self,
        msg: Message,
        selected: Option<(&dyn MessageQueueSelector, &str)>,
    ) -> Result<SendResult, ClientError> {
        let mq = self.record(SendMode::Sync, &msg, selected)?;
        if self.behavior() == MockBehavior::Hang {
            futures::future::pending::<()>().await;
        }
        self.answer(mq)
    }

    fn send_async_inner(
        &self,
        msg: Message,
        selected: Option<(&dyn MessageQueueSelector, &str)>,
        callback: SendCallback,
    ) -> Result<(), ClientError> {
        let runtime = publisher::runtime()?;
        let mq = self.record(SendMode::Async, &msg, selected)?;
        if self.behavior() == MockBehavior::Hang {
            return Ok(());
        }
        let result = self.answer(mq);
        runtime.spawn(async move { callback(result) });
        Ok(())
    }
}

#[async_trait]
impl ProducerClient for MockProducerClient {
    async fn start(&self) -> Result<(), ClientError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn send_timeout(&self) -> Duration {
        Duration::from_millis(3000)
    }

    async fn send(&self, msg: Message, _timeout: Duration) -> Result<SendResult, ClientError> {
        self.send_sync(msg, None).await
    }

    async fn send_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        _timeout: Duration,
    ) -> Result<SendResult, ClientError> {
        self.send_sync(msg, Some((selector.as_ref(), arg))).await
    }

    fn send_async(
        &self,
        msg: Message,
        callback: SendCallback,
        _timeout: Duration,
    ) -> Result<(), ClientError> {
        self.send_async_inner(msg, None, callback)
    }

    fn send_async_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        callback: SendCallback,
        _timeout: Duration,
    ) -> Result<(), ClientError> {
        self.send_async_inner(msg, Some((selector.as_ref(), arg)), callback)
    }

    async fn send_oneway(&self, msg: Message) -> Result<(), ClientError> {
        self.record(SendMode::Oneway, &msg, None).map(|_| ())
    }

    async fn send_oneway_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
    ) -> Result<(), ClientError> {
        self.record(SendMode::Oneway, &msg, Some((selector.as_ref(), arg)))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::SelectMessageQueueByHash;

    #[tokio::test]
    async fn test_mock_producer_records_sends() -> Result<(), ClientError> {
        let client = MockProducerClient::new(MockBehavior::Acknowledge, 4);
        assert!(matches!(
            client.send(Message::new("T", "a"), Duration::from_secs(1)).await,
            Err(ClientError::NotRunning)
        ));

        client.start().await?;
        let first = client.send(Message::new("T", "a"), Duration::from_secs(1)).await?;
        let second = client
            .send_to_selected(
                Message::new("T", "b"),
                Arc::new(SelectMessageQueueByHash),
                "hello",
                Duration::from_secs(1),
            )
            .await?;
        assert_ne!(first.msg_id, second.msg_id);
        assert_eq!(second.message_queue.queue_id, 2);

        client.set_behavior(MockBehavior::Fail);
        assert!(client
            .send(Message::new("T", "c"), Duration::from_secs(1))
            .await
            .is_err());
        assert_eq!(client.sent().len(), 3);

        client.shutdown().await;
        client.shutdown().await;
        assert_eq!(client.shutdown_calls(), 1);
        Ok(())
    }
}
