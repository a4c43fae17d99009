//!
//! Remoting producer: publishes messages to brokers resolved through the name servers.
//!
use crate::config::ProducerConfig;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::frame::{Frame, RequestCode};
use crate::message::{
    self, Message, MessageQueue, PROPERTY_UNIQ_CLIENT_MESSAGE_ID_KEYIDX,
};
use crate::producer::{
    MessageQueueSelector, ProducerClient, SendCallback, SendResult, SendStatus,
};
use crate::protocol::{
    response_code, SendMessageRequestHeader, SendMessageResponseHeader, TopicRouteData,
};
use crate::route::RouteManager;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const DEFAULT_TOPIC: &str = "TBW102";
const DEFAULT_TOPIC_QUEUE_NUMS: i32 = 4;

/// `sysFlag` bit marking a zlib-compressed body.
pub(crate) const COMPRESSED_FLAG: i32 = 0x1;
const COMPRESS_LEVEL: u32 = 5;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Producer speaking the remoting protocol. Cheap to clone; clones share connections and routes.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProducerConfig,
    routes: RouteManager,
    connections: ConnectionManager,
    state: AtomicU8,
    send_index: AtomicUsize,
}

impl Publisher {
    /// Create a publisher for the `;` separated `name_server` list.
    pub fn new(name_server: &str, config: ProducerConfig) -> Result<Self, ClientError> {
        if config.group.trim().is_empty() {
            return Err(ClientError::IllegalArgument(
                "producer group must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                routes: RouteManager::new(name_server)?.with_ttl(config.route_ttl()),
                connections: ConnectionManager::new(),
                config,
                state: AtomicU8::new(CREATED),
                send_index: AtomicUsize::new(0),
            }),
        })
    }

    pub fn group(&self) -> &str {
        &self.inner.config.group
    }
}

#[async_trait]
impl ProducerClient for Publisher {
    async fn start(&self) -> Result<(), ClientError> {
        match self
            .inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                info!(group = %self.inner.config.group, "Producer started");
                Ok(())
            }
            Err(RUNNING) => Ok(()),
            Err(_) => Err(ClientError::NotRunning),
        }
    }

    async fn shutdown(&self) {
        if self.inner.state.swap(SHUT_DOWN, Ordering::SeqCst) != SHUT_DOWN {
            self.inner.connections.close_all();
            info!(group = %self.inner.config.group, "Producer shut down");
        }
    }

    fn send_timeout(&self) -> Duration {
        self.inner.config.send_timeout()
    }

    async fn send(&self, msg: Message, timeout: Duration) -> Result<SendResult, ClientError> {
        self.inner.ensure_running()?;
        let msg = self.inner.prepare(msg)?;
        let retries = self.inner.config.retry_times_when_send_failed;
        self.inner.send_default(&msg, retries, timeout).await
    }

    async fn send_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        timeout: Duration,
    ) -> Result<SendResult, ClientError> {
        self.inner.ensure_running()?;
        let msg = self.inner.prepare(msg)?;
        self.inner
            .send_selected(&msg, selector.as_ref(), arg, timeout)
            .await
    }

    fn send_async(
        &self,
        msg: Message,
        callback: SendCallback,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.inner.ensure_running()?;
        let runtime = runtime()?;
        let msg = self.inner.prepare(msg)?;
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let retries = inner.config.retry_times_when_send_async_failed;
            callback(inner.send_default(&msg, retries, timeout).await);
        });
        Ok(())
    }

    fn send_async_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
        callback: SendCallback,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        self.inner.ensure_running()?;
        let runtime = runtime()?;
        let msg = self.inner.prepare(msg)?;
        let inner = Arc::clone(&self.inner);
        let arg = arg.to_owned();
        runtime.spawn(async move {
            callback(
                inner
                    .send_selected(&msg, selector.as_ref(), &arg, timeout)
                    .await,
            );
        });
        Ok(())
    }

    async fn send_oneway(&self, msg: Message) -> Result<(), ClientError> {
        self.inner.ensure_running()?;
        let msg = self.inner.prepare(msg)?;
        let timeout = self.inner.config.send_timeout();
        let (route, mq) = self.inner.pick_queue(&msg, None, timeout).await?;
        self.inner.send_oneway_to(&msg, &route, &mq, timeout).await
    }

    async fn send_oneway_to_selected(
        &self,
        msg: Message,
        selector: Arc<dyn MessageQueueSelector>,
        arg: &str,
    ) -> Result<(), ClientError> {
        self.inner.ensure_running()?;
        let msg = self.inner.prepare(msg)?;
        let timeout = self.inner.config.send_timeout();
        let (route, mq) = self
            .inner
            .pick_selected_queue(&msg, selector.as_ref(), arg, timeout)
            .await?;
        self.inner.send_oneway_to(&msg, &route, &mq, timeout).await
    }
}

/// Handle of the runtime the caller runs on; asynchronous sends are spawned there.
pub(crate) fn runtime() -> Result<tokio::runtime::Handle, ClientError> {
    tokio::runtime::Handle::try_current().map_err(|e| {
        warn!("Asynchronous send outside a tokio runtime. Cause: {}", e);
        ClientError::NoRuntime
    })
}

impl Inner {
    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.state.load(Ordering::SeqCst) == RUNNING {
            Ok(())
        } else {
            Err(ClientError::NotRunning)
        }
    }

    /// Check the message against producer limits and stamp its unique key.
    fn prepare(&self, mut msg: Message) -> Result<Message, ClientError> {
        if msg.topic.is_empty() {
            return Err(ClientError::IllegalArgument("topic is empty".to_owned()));
        }
        if msg.body.is_empty() {
            return Err(ClientError::IllegalArgument("message body is empty".to_owned()));
        }
        if msg.body.len() > self.config.max_message_size {
            return Err(ClientError::MessageTooLarge {
                size: msg.body.len(),
                limit: self.config.max_message_size,
            });
        }
        if msg.unique_key().is_none() {
            let key = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
            msg.put_property(PROPERTY_UNIQ_CLIENT_MESSAGE_ID_KEYIDX, &key);
        }
        Ok(msg)
    }

    async fn send_default(
        &self,
        msg: &Message,
        retries: u32,
        timeout: Duration,
    ) -> Result<SendResult, ClientError> {
        let begin = Instant::now();
        let mut last_broker: Option<String> = None;
        let mut last_error = ClientError::NoRoute(msg.topic.clone());

        for attempt in 0..=retries {
            let remaining = match timeout.checked_sub(begin.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Err(ClientError::Timeout(timeout.as_millis())),
            };
            let (route, mq) = match self.pick_queue(msg, last_broker.as_deref(), remaining).await {
                Ok(picked) => picked,
                Err(e) if e.is_retryable() => {
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            last_broker = Some(mq.broker_name.clone());

            match self.send_to(msg, &route, &mq, remaining).await {
                Ok(result) => {
                    if result.send_status != SendStatus::SendOk
                        && self.config.retry_another_broker_when_not_store_ok
                        && attempt < retries
                    {
                        warn!(
                            msg_id = %result.msg_id,
                            status = ?result.send_status,
                            "Store not OK, retry on another broker"
                        );
                        continue;
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        attempt,
                        queue = %mq,
                        error = %e,
                        "Send attempt failed"
                    );
                    self.routes.invalidate(&msg.topic);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn send_selected(
        &self,
        msg: &Message,
        selector: &dyn MessageQueueSelector,
        arg: &str,
        timeout: Duration,
    ) -> Result<SendResult, ClientError> {
        let begin = Instant::now();
        let (route, mq) = self.pick_selected_queue(msg, selector, arg, timeout).await?;
        let remaining = timeout
            .checked_sub(begin.elapsed())
            .ok_or(ClientError::Timeout(timeout.as_millis()))?;
        self.send_to(msg, &route, &mq, remaining).await
    }

    /// Round-robin over writable queues, avoiding `avoid_broker` when another broker is available.
    async fn pick_queue(
        &self,
        msg: &Message,
        avoid_broker: Option<&str>,
        timeout: Duration,
    ) -> Result<(Arc<TopicRouteData>, MessageQueue), ClientError> {
        let route = self
            .routes
            .route(&msg.topic, &self.connections, timeout)
            .await?;
        let mqs = route.message_queues(&msg.topic);
        if mqs.is_empty() {
            return Err(ClientError::NoRoute(msg.topic.clone()));
        }
        let start = self.send_index.fetch_add(1, Ordering::Relaxed);
        let mq = (0..mqs.len())
            .map(|offset| &mqs[(start + offset) % mqs.len()])
            .find(|mq| Some(mq.broker_name.as_str()) != avoid_broker)
            .unwrap_or(&mqs[start % mqs.len()])
            .clone();
        Ok((route, mq))
    }

    async fn pick_selected_queue(
        &self,
        msg: &Message,
        selector: &dyn MessageQueueSelector,
        arg: &str,
        timeout: Duration,
    ) -> Result<(Arc<TopicRouteData>, MessageQueue), ClientError> {
        let route = self
            .routes
            .route(&msg.topic, &self.connections, timeout)
            .await?;
        let mqs = route.message_queues(&msg.topic);
        let mq = selector.select(&mqs, msg, arg).ok_or_else(|| {
            ClientError::IllegalArgument("select message queue returned none".to_owned())
        })?;
        Ok((route, mq))
    }

    /// Body as written to the wire plus the `sysFlag` describing it.
    fn encode_body(&self, body: &Bytes) -> (Bytes, i32) {
        if body.len() <= self.config.compress_msg_body_over_howmuch {
            return (body.clone(), 0);
        }
        match compress(body) {
            Ok(compressed) => {
                debug!(
                    size = body.len(),
                    compressed = compressed.len(),
                    "Compressed message body"
                );
                (Bytes::from(compressed), COMPRESSED_FLAG)
            }
            Err(e) => {
                warn!("Failed to compress message body, send it as is. Cause: {}", e);
                (body.clone(), 0)
            }
        }
    }

    fn request(&self, msg: &Message, mq: &MessageQueue) -> Frame {
        let (body, sys_flag) = self.encode_body(&msg.body);
        let born_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or_default();
        let header = SendMessageRequestHeader {
            producer_group: self.config.group.clone(),
            topic: msg.topic.clone(),
            default_topic: DEFAULT_TOPIC.to_owned(),
            default_topic_queue_nums: DEFAULT_TOPIC_QUEUE_NUMS,
            queue_id: mq.queue_id,
            sys_flag,
            born_timestamp,
            flag: msg.flag,
            properties: Some(message::properties_to_string(msg.properties())),
            reconsume_times: Some(0),
            unit_mode: Some(false),
            batch: Some(false),
            max_reconsume_times: None,
        };
        let mut frame = Frame::request(RequestCode::SendMessage);
        frame.add_ext_headers(header);
        frame.body = body;
        frame
    }

    fn broker_address<'a>(
        &self,
        route: &'a TopicRouteData,
        mq: &MessageQueue,
    ) -> Result<&'a str, ClientError> {
        route
            .master_address(&mq.broker_name)
            .ok_or_else(|| ClientError::NoRoute(mq.topic.clone()))
    }

    async fn send_to(
        &self,
        msg: &Message,
        route: &TopicRouteData,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<SendResult, ClientError> {
        let addr = self.broker_address(route, mq)?;
        let request = self.request(msg, mq);
        let response = self.connections.invoke(addr, &request, timeout).await?;

        let send_status = match response.code {
            response_code::SUCCESS => SendStatus::SendOk,
            response_code::FLUSH_DISK_TIMEOUT => SendStatus::FlushDiskTimeout,
            response_code::FLUSH_SLAVE_TIMEOUT => SendStatus::FlushSlaveTimeout,
            response_code::SLAVE_NOT_AVAILABLE => SendStatus::SlaveNotAvailable,
            code => {
                return Err(ClientError::Broker {
                    addr: addr.to_owned(),
                    code,
                    remark: response.remark().to_owned(),
                })
            }
        };
        let header = SendMessageResponseHeader::try_from(&response.ext_fields)?;
        let result = SendResult {
            send_status,
            msg_id: msg
                .unique_key()
                .map(str::to_owned)
                .unwrap_or_else(|| header.msg_id.clone()),
            offset_msg_id: Some(header.msg_id),
            message_queue: MessageQueue::new(&mq.topic, &mq.broker_name, header.queue_id),
            queue_offset: header.queue_offset,
        };
        debug!(msg_id = %result.msg_id, queue = %result.message_queue, "Message sent");
        Ok(result)
    }

    async fn send_oneway_to(
        &self,
        msg: &Message,
        route: &TopicRouteData,
        mq: &MessageQueue,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let addr = self.broker_address(route, mq)?;
        let mut request = self.request(msg, mq);
        request.mark_oneway();
        self.connections.invoke_oneway(addr, &request, timeout).await
    }
}

fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESS_LEVEL));
    encoder.write_all(body)?;
    encoder.finish()
}
