//!
//! Listener containers bind one listener to one push consumer subscription.
//!
//! A container goes `Created -> Started -> Destroyed`. `start` validates the configuration, opens
//! the subscription and installs the dispatch routine matching the consume mode; `destroy` stops
//! dispatch and releases the subscription. A destroyed container cannot be started again.
//!
use crate::config::{ConsumeMode, ContainerConfig, SelectorType};
use crate::consumer::{
    ConsumeConcurrentlyContext, ConsumeConcurrentlyStatus, ConsumeOrderlyContext,
    ConsumeOrderlyStatus, ConsumerFactory, MessageListener, MessageListenerConcurrently,
    MessageListenerOrderly, MessageSelector, PushConsumer, PushConsumerOptions,
};
use crate::error::MessagingError;
use crate::message::MessageExt;
use crate::resolver::{Charset, Payload, PayloadType};
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Error a listener reports for a message it could not process.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback receiving decoded messages.
///
/// Returning an error, or panicking, asks the broker to deliver the message again later.
#[async_trait]
pub trait RocketMQListener<T>: Send + Sync {
    async fn on_message(&self, message: T) -> Result<(), ListenerError>;
}

struct ListenerFn<F>(F);

#[async_trait]
impl<T, F, Fut> RocketMQListener<T> for ListenerFn<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn on_message(&self, message: T) -> Result<(), ListenerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a listener.
pub fn listener_fn<T, F, Fut>(f: F) -> Arc<dyn RocketMQListener<T>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    Arc::new(ListenerFn(f))
}

/// Result of handling one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Success,
    /// Decoding failed or the listener failed; the message must be redelivered.
    Failure,
}

/// Per-message handling shared by both consume modes.
struct Dispatcher<T> {
    listener: Arc<dyn RocketMQListener<T>>,
    payload: Payload<T>,
    charset: Charset,
    delay_level_when_next_consume: i32,
    suspend_current_queue_time_millis: u64,
}

impl<T: Send + 'static> Dispatcher<T> {
    async fn handle(&self, message: &MessageExt) -> ConsumeOutcome {
        debug!(msg_id = %message.msg_id, "received msg: {}", message);
        let begin = Instant::now();

        let payload = match self.payload.convert(message, self.charset) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    msg_id = %message.msg_id,
                    body = %String::from_utf8_lossy(&message.body),
                    error = %e,
                    "consume message failed"
                );
                return ConsumeOutcome::Failure;
            }
        };

        match AssertUnwindSafe(self.listener.on_message(payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                debug!(
                    msg_id = %message.msg_id,
                    cost_ms = begin.elapsed().as_millis() as u64,
                    "consume message"
                );
                ConsumeOutcome::Success
            }
            Ok(Err(e)) => {
                warn!(
                    msg_id = %message.msg_id,
                    body = %String::from_utf8_lossy(&message.body),
                    error = %e,
                    "consume message failed"
                );
                ConsumeOutcome::Failure
            }
            Err(_) => {
                warn!(
                    msg_id = %message.msg_id,
                    body = %String::from_utf8_lossy(&message.body),
                    "listener panicked while consuming message"
                );
                ConsumeOutcome::Failure
            }
        }
    }

    /// Handle `msgs` in order, stopping at the first failure.
    async fn handle_batch(&self, msgs: &[MessageExt]) -> ConsumeOutcome {
        for message in msgs {
            if self.handle(message).await == ConsumeOutcome::Failure {
                return ConsumeOutcome::Failure;
            }
        }
        ConsumeOutcome::Success
    }
}

#[async_trait]
impl<T: Send + 'static> MessageListenerConcurrently for Dispatcher<T> {
    async fn consume_message(
        &self,
        msgs: &[MessageExt],
        context: &mut ConsumeConcurrentlyContext,
    ) -> ConsumeConcurrentlyStatus {
        match self.handle_batch(msgs).await {
            ConsumeOutcome::Success => ConsumeConcurrentlyStatus::ConsumeSuccess,
            ConsumeOutcome::Failure => {
                context.delay_level_when_next_consume = self.delay_level_when_next_consume;
                ConsumeConcurrentlyStatus::ReconsumeLater
            }
        }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageListenerOrderly for Dispatcher<T> {
    async fn consume_message(
        &self,
        msgs: &[MessageExt],
        context: &mut ConsumeOrderlyContext,
    ) -> ConsumeOrderlyStatus {
        match self.handle_batch(msgs).await {
            ConsumeOutcome::Success => ConsumeOrderlyStatus::Success,
            ConsumeOutcome::Failure => {
                context.suspend_current_queue_time_millis =
                    i64::try_from(self.suspend_current_queue_time_millis).unwrap_or(i64::MAX);
                ConsumeOrderlyStatus::SuspendCurrentQueueAMoment
            }
        }
    }
}

#[derive(Default)]
struct Runtime {
    consumer: Option<Box<dyn PushConsumer>>,
    destroyed: bool,
}

/// Settings checked at start.
struct Validated<'a, T> {
    listener: Arc<dyn RocketMQListener<T>>,
    consumer_group: &'a str,
    name_server: &'a str,
    topic: &'a str,
    charset: Charset,
}

pub struct ListenerContainer<T> {
    config: ContainerConfig,
    listener: Option<Arc<dyn RocketMQListener<T>>>,
    payload: Payload<T>,
    factory: Arc<dyn ConsumerFactory>,
    runtime: Mutex<Runtime>,
    started: AtomicBool,
}

impl<T: Send + 'static> ListenerContainer<T> {
    pub fn new(
        config: ContainerConfig,
        payload: Payload<T>,
        factory: Arc<dyn ConsumerFactory>,
    ) -> Self {
        Self {
            config,
            listener: None,
            payload,
            factory,
            runtime: Mutex::new(Runtime::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn RocketMQListener<T>>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn set_listener(&mut self, listener: Arc<dyn RocketMQListener<T>>) {
        self.listener = Some(listener);
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload.kind()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Open the subscription and begin dispatching to the listener.
    ///
    /// # Errors
    /// * `AlreadyStarted` if the container is running, `Destroyed` if it was destroyed;
    /// * `MissingProperty` / `InvalidProperty` naming the offending setting, before any
    ///   consumer is created;
    /// * `Client` if the consumer cannot be created, subscribed or started.
    pub async fn start(&self) -> Result<(), MessagingError> {
        let mut runtime = self.runtime.lock().await;
        if self.is_running() {
            return Err(MessagingError::AlreadyStarted(self.to_string()));
        }
        if runtime.destroyed {
            return Err(MessagingError::Destroyed(self.to_string()));
        }

        let settings = self.validate()?;

        let mut options = PushConsumerOptions::new(settings.consumer_group, settings.name_server);
        options.message_model = self.config.message_model;
        options.consume_thread_max = self.config.consume_thread_max;
        if options.consume_thread_max < options.consume_thread_min {
            options.consume_thread_min = options.consume_thread_max;
        }

        let mut consumer = self
            .factory
            .create(options)
            .map_err(MessagingError::Client)?;

        let selector = match self.config.selector_type {
            SelectorType::Tag => MessageSelector::by_tag(&self.config.selector_express),
            SelectorType::Sql92 => MessageSelector::by_sql(&self.config.selector_express),
        };
        consumer
            .subscribe(settings.topic, selector)
            .map_err(MessagingError::Client)?;

        let dispatcher = Arc::new(Dispatcher {
            listener: settings.listener,
            payload: self.payload,
            charset: settings.charset,
            delay_level_when_next_consume: self.config.delay_level_when_next_consume,
            suspend_current_queue_time_millis: self.config.suspend_current_queue_time_millis,
        });
        let listener = match self.config.consume_mode {
            ConsumeMode::Concurrently => MessageListener::Concurrently(dispatcher),
            ConsumeMode::Orderly => MessageListener::Orderly(dispatcher),
        };
        consumer.register_message_listener(listener);

        if let Err(e) = consumer.start().await {
            consumer.shutdown().await;
            return Err(MessagingError::Client(e));
        }

        runtime.consumer = Some(consumer);
        self.started.store(true, Ordering::SeqCst);
        info!(payload_type = ?self.payload.kind(), "running container: {}", self);
        Ok(())
    }

    /// Stop dispatch and release the subscription. Safe to call in any state.
    pub async fn destroy(&self) {
        let mut runtime = self.runtime.lock().await;
        self.started.store(false, Ordering::SeqCst);
        if let Some(mut consumer) = runtime.consumer.take() {
            consumer.shutdown().await;
            info!("container destroyed, {}", self);
        }
        runtime.destroyed = true;
    }

    fn validate(&self) -> Result<Validated<'_, T>, MessagingError> {
        let listener = self
            .listener
            .as_ref()
            .map(Arc::clone)
            .ok_or(MessagingError::MissingProperty("rocketMQListener"))?;
        let consumer_group = required(&self.config.consumer_group, "consumerGroup")?;
        let name_server = required(&self.config.name_server, "nameServer")?;
        let topic = required(&self.config.topic, "topic")?;

        let charset = self
            .config
            .charset
            .parse::<Charset>()
            .map_err(|e| MessagingError::InvalidProperty {
                property: "charset",
                reason: e.to_string(),
            })?;
        if self.config.consume_thread_max == 0 {
            return Err(MessagingError::InvalidProperty {
                property: "consumeThreadMax",
                reason: "must be positive".to_owned(),
            });
        }

        Ok(Validated {
            listener,
            consumer_group,
            name_server,
            topic,
            charset,
        })
    }
}

fn required<'a>(
    value: &'a Option<String>,
    property: &'static str,
) -> Result<&'a str, MessagingError> {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(MessagingError::MissingProperty(property)),
    }
}

impl<T> fmt::Display for ListenerContainer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ListenerContainer{{consumerGroup='{}', nameServer='{}', topic='{}', consumeMode={}, selectorType={}, selectorExpress='{}', messageModel={}}}",
            self.config.consumer_group.as_deref().unwrap_or_default(),
            self.config.name_server.as_deref().unwrap_or_default(),
            self.config.topic.as_deref().unwrap_or_default(),
            self.config.consume_mode,
            self.config.selector_type,
            self.config.selector_express,
            self.config.message_model,
        )
    }
}
