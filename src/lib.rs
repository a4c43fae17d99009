//! This crate provides APIs to publish messages to and subscribe messages from [Apache RocketMQ](http://rocketmq.apache.org)
//!
//! * [`ListenerContainer`] binds an application listener to a push consumer subscription and turns
//!   listener failures into broker redelivery;
//! * [`RocketMQTemplate`] sends typed [`Envelope`]s synchronously, asynchronously or one-way,
//!   optionally ordered by a hash key;
//! * [`Registrar`] builds, starts and shuts down both from configuration.
//!
//! The remoting [`Publisher`] talks to name servers and brokers directly. Push consumers are
//! supplied through [`ConsumerFactory`]; [`ConsumeServiceFactory`] runs them in process over any
//! [`MessageSource`](consume_service::MessageSource).
pub mod config;
pub mod connection;
pub mod consume_service;
pub mod consumer;
pub mod container;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod message;
pub mod mock;
pub mod producer;
pub mod protocol;
pub mod publisher;
pub mod registrar;
pub mod resolver;
pub mod route;
pub mod template;

pub use config::{ConsumeMode, ContainerConfig, ProducerConfig, RocketMQProperties, SelectorType};
pub use consume_service::{ConsumeService, ConsumeServiceFactory};
pub use consumer::{ConsumerFactory, MessageModel, PushConsumer};
pub use container::{listener_fn, ListenerContainer, ListenerError, RocketMQListener};
pub use envelope::{BodyEncoding, Envelope};
pub use error::{ClientError, MessagingError};
pub use message::{Message, MessageExt, MessageQueue};
pub use producer::{ProducerClient, SendResult, SendStatus};
pub use publisher::Publisher;
pub use registrar::{Lifecycle, Registrar};
pub use resolver::{Charset, Payload, PayloadType};
pub use template::RocketMQTemplate;
