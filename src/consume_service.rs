//!
//! In-process push consumer: pulls batches from a [`MessageSource`] and drives the registered
//! [`MessageListener`].
//!
//! At most `consume_thread_max` listener calls run at once. Concurrently listeners may see any
//! number of batches in flight; a batch answered with `ReconsumeLater` is delivered again after
//! the pause of its delay level, or dropped in broadcasting mode. Orderly listeners see one batch
//! of a queue at a time. A suspended queue is retried after its pause while other queues keep
//! being consumed.
//!
use crate::consumer::{
    ConsumeConcurrentlyContext, ConsumeConcurrentlyStatus, ConsumeOrderlyContext,
    ConsumeOrderlyStatus, ConsumerFactory, MessageListener, MessageListenerConcurrently,
    MessageListenerOrderly, MessageModel, MessageSelector, PushConsumer, PushConsumerOptions,
};
use crate::error::ClientError;
use crate::message::{MessageExt, MessageQueue};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Broker delay levels `1s 5s 10s 30s 1m 2m 3m 4m 5m 6m 7m 8m 9m 10m 20m 30m 1h 2h`, in seconds.
const DELAY_LEVEL_SECONDS: [u64; 18] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
];

/// Deliveries after which a failing message is moved to the dead letter queue.
pub const MAX_RECONSUME_TIMES: i32 = 16;

const DEFAULT_SUSPEND_MILLIS: u64 = 1000;

/// Messages pulled from one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub queue: MessageQueue,
    pub messages: Vec<MessageExt>,
}

/// Where a [`ConsumeService`] pulls its batches from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Begin fetching `topic` filtered by `selector`.
    async fn open(&self, topic: &str, selector: &MessageSelector) -> Result<(), ClientError>;

    /// Next batch, `None` once the source is exhausted.
    async fn poll(&self) -> Option<Batch>;

    async fn close(&self);
}

/// Creates one source per consumer.
pub trait MessageSourceFactory: Send + Sync {
    fn create(&self, options: &PushConsumerOptions) -> Result<Arc<dyn MessageSource>, ClientError>;
}

impl<F> MessageSourceFactory for F
where
    F: Fn(&PushConsumerOptions) -> Result<Arc<dyn MessageSource>, ClientError> + Send + Sync,
{
    fn create(&self, options: &PushConsumerOptions) -> Result<Arc<dyn MessageSource>, ClientError> {
        self(options)
    }
}

/// Pause before a failed batch is delivered again, `None` once it belongs to the dead letter queue.
///
/// Level 0 lets the delay grow with the number of deliveries, starting at level 3.
pub fn redelivery_delay(delay_level: i32, reconsume_times: i32) -> Option<Duration> {
    if delay_level < 0 || reconsume_times >= MAX_RECONSUME_TIMES {
        return None;
    }
    let level = if delay_level == 0 {
        3 + reconsume_times
    } else {
        delay_level
    };
    let index = level.clamp(1, DELAY_LEVEL_SECONDS.len() as i32) - 1;
    DELAY_LEVEL_SECONDS
        .get(index as usize)
        .map(|seconds| Duration::from_secs(*seconds))
}

fn suspend_duration(millis: i64) -> Duration {
    match u64::try_from(millis) {
        Ok(millis) if millis > 0 => Duration::from_millis(millis),
        _ => Duration::from_millis(DEFAULT_SUSPEND_MILLIS),
    }
}

struct Running {
    stop: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
}

/// [`PushConsumer`] consuming from a [`MessageSource`] in this process.
pub struct ConsumeService {
    options: PushConsumerOptions,
    source: Arc<dyn MessageSource>,
    subscription: Option<(String, MessageSelector)>,
    listener: Option<MessageListener>,
    running: Option<Running>,
}

impl ConsumeService {
    pub fn new(options: PushConsumerOptions, source: Arc<dyn MessageSource>) -> Self {
        Self {
            options,
            source,
            subscription: None,
            listener: None,
            running: None,
        }
    }

    pub fn options(&self) -> &PushConsumerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

#[async_trait]
impl PushConsumer for ConsumeService {
    fn subscribe(&mut self, topic: &str, selector: MessageSelector) -> Result<(), ClientError> {
        if self.is_running() {
            return Err(ClientError::IllegalArgument(
                "subscription cannot change while consuming".to_owned(),
            ));
        }
        self.subscription = Some((topic.to_owned(), selector));
        Ok(())
    }

    fn register_message_listener(&mut self, listener: MessageListener) {
        self.listener = Some(listener);
    }

    async fn start(&mut self) -> Result<(), ClientError> {
        if self.is_running() {
            return Ok(());
        }
        let (topic, selector) = self.subscription.as_ref().ok_or_else(|| {
            ClientError::IllegalArgument("subscribe before starting the consumer".to_owned())
        })?;
        let listener = self.listener.clone().ok_or_else(|| {
            ClientError::IllegalArgument("register a message listener before starting".to_owned())
        })?;
        if self.options.consume_thread_max == 0 {
            return Err(ClientError::IllegalArgument(
                "consume_thread_max must be positive".to_owned(),
            ));
        }

        self.source.open(topic, selector).await?;
        info!(
            group = %self.options.consumer_group,
            topic = %topic,
            model = %self.options.message_model,
            consume_thread_max = self.options.consume_thread_max,
            "Consume service started"
        );

        let (stop, stopped) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.source),
            listener,
            self.options.clone(),
            stopped,
        ));
        self.running = Some(Running { stop, dispatcher });
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(true);
            if let Err(e) = running.dispatcher.await {
                warn!("Consume dispatcher ended abnormally. Cause: {}", e);
            }
            self.source.close().await;
            info!(group = %self.options.consumer_group, "Consume service shut down");
        }
    }
}

/// Creates a [`ConsumeService`] per container over sources from `sources`.
pub struct ConsumeServiceFactory {
    sources: Arc<dyn MessageSourceFactory>,
}

impl ConsumeServiceFactory {
    pub fn new(sources: Arc<dyn MessageSourceFactory>) -> Self {
        Self { sources }
    }
}

impl ConsumerFactory for ConsumeServiceFactory {
    fn create(&self, options: PushConsumerOptions) -> Result<Box<dyn PushConsumer>, ClientError> {
        let source = self.sources.create(&options)?;
        Ok(Box::new(ConsumeService::new(options, source)))
    }
}

async fn dispatch(
    source: Arc<dyn MessageSource>,
    listener: MessageListener,
    options: PushConsumerOptions,
    mut stopped: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(options.consume_thread_max as usize));
    let mut tasks = JoinSet::new();
    let mut queues: HashMap<MessageQueue, mpsc::UnboundedSender<Vec<MessageExt>>> =
        HashMap::new();

    loop {
        let batch = tokio::select! {
            _ = stopped.changed() => break,
            batch = source.poll() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        if batch.messages.is_empty() {
            continue;
        }

        match &listener {
            MessageListener::Concurrently(listener) => {
                let permit = tokio::select! {
                    _ = stopped.changed() => break,
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                tasks.spawn(consume_concurrently(
                    Arc::clone(listener),
                    batch,
                    Arc::clone(&permits),
                    permit,
                    options.message_model,
                ));
            }
            MessageListener::Orderly(listener) => {
                let queue = batch.queue.clone();
                let worker = queues.entry(queue.clone()).or_insert_with(|| {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    tasks.spawn(consume_orderly(
                        Arc::clone(listener),
                        queue.clone(),
                        receiver,
                        Arc::clone(&permits),
                    ));
                    sender
                });
                if worker.send(batch.messages).is_err() {
                    warn!(queue = %queue, "Orderly worker is gone, batch dropped");
                }
            }
        }

        while let Some(Some(joined)) = tasks.join_next().now_or_never() {
            if let Err(e) = joined {
                warn!("Consume task failed. Cause: {}", e);
            }
        }
    }

    drop(queues);
    tasks.shutdown().await;
    debug!(group = %options.consumer_group, "Dispatcher stopped");
}

async fn consume_concurrently(
    listener: Arc<dyn MessageListenerConcurrently>,
    batch: Batch,
    permits: Arc<Semaphore>,
    permit: OwnedSemaphorePermit,
    model: MessageModel,
) {
    let Batch {
        queue,
        mut messages,
    } = batch;
    let mut permit = Some(permit);

    loop {
        let held = match permit.take() {
            Some(held) => held,
            None => match Arc::clone(&permits).acquire_owned().await {
                Ok(held) => held,
                Err(_) => return,
            },
        };
        let mut context = ConsumeConcurrentlyContext::new(queue.clone());
        let status = listener.consume_message(&messages, &mut context).await;
        drop(held);

        // Messages up to `ack_index` are done; the rest are redelivered.
        let acknowledged = match status {
            ConsumeConcurrentlyStatus::ConsumeSuccess => usize::try_from(context.ack_index)
                .map(|index| index.saturating_add(1).min(messages.len()))
                .unwrap_or(0),
            ConsumeConcurrentlyStatus::ReconsumeLater => 0,
        };
        messages = messages.split_off(acknowledged);
        if messages.is_empty() {
            return;
        }

        if model == MessageModel::Broadcasting {
            for message in &messages {
                warn!(
                    queue = %queue,
                    msg_id = %message.msg_id,
                    "Consume failed in broadcasting mode, message dropped"
                );
            }
            return;
        }

        let reconsume_times = messages
            .iter()
            .map(|message| message.reconsume_times)
            .max()
            .unwrap_or_default();
        let delay = match redelivery_delay(context.delay_level_when_next_consume, reconsume_times) {
            Some(delay) => delay,
            None => {
                for message in &messages {
                    warn!(
                        queue = %queue,
                        msg_id = %message.msg_id,
                        reconsume_times = message.reconsume_times,
                        "Message moved to dead letter queue"
                    );
                }
                return;
            }
        };
        debug!(
            queue = %queue,
            count = messages.len(),
            delay_ms = delay.as_millis() as u64,
            "Reconsume later"
        );
        for message in messages.iter_mut() {
            message.reconsume_times += 1;
        }
        tokio::time::sleep(delay).await;
    }
}

async fn consume_orderly(
    listener: Arc<dyn MessageListenerOrderly>,
    queue: MessageQueue,
    mut batches: mpsc::UnboundedReceiver<Vec<MessageExt>>,
    permits: Arc<Semaphore>,
) {
    while let Some(mut messages) = batches.recv().await {
        loop {
            let held = match Arc::clone(&permits).acquire_owned().await {
                Ok(held) => held,
                Err(_) => return,
            };
            let mut context = ConsumeOrderlyContext::new(queue.clone());
            let status = listener.consume_message(&messages, &mut context).await;
            drop(held);

            match status {
                ConsumeOrderlyStatus::Success => break,
                ConsumeOrderlyStatus::SuspendCurrentQueueAMoment => {
                    let pause = suspend_duration(context.suspend_current_queue_time_millis);
                    debug!(
                        queue = %queue,
                        pause_ms = pause.as_millis() as u64,
                        "Suspend current queue a moment"
                    );
                    for message in messages.iter_mut() {
                        message.reconsume_times += 1;
                    }
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}
