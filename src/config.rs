//!
//! Configuration supplied by the host application.
//!
//! All structs deserialize from camelCase keys and fall back to the documented defaults, so they
//! can be bound from whatever configuration source the host uses. Validation happens when a
//! container or producer starts.
//!
use crate::consumer::{MessageModel, DEFAULT_CONSUME_THREAD_MAX};
use crate::error::MessagingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeMode {
    /// Receive delivered messages concurrently.
    #[default]
    #[serde(alias = "CONCURRENT")]
    Concurrently,

    /// Receive delivered messages orderly: one queue, one thread.
    #[serde(alias = "ORDERED")]
    Orderly,
}

impl FromStr for ConsumeMode {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONCURRENTLY" | "CONCURRENT" => Ok(ConsumeMode::Concurrently),
            "ORDERLY" | "ORDERED" => Ok(ConsumeMode::Orderly),
            _ => Err(MessagingError::InvalidProperty {
                property: "consumeMode",
                reason: format!("unknown consume mode `{}`", s),
            }),
        }
    }
}

impl fmt::Display for ConsumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeMode::Concurrently => f.write_str("CONCURRENTLY"),
            ConsumeMode::Orderly => f.write_str("ORDERLY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectorType {
    /// Plain tag match, e.g. `TagA || TagB`.
    #[default]
    Tag,

    /// SQL92 expression over message properties.
    #[serde(alias = "EXPRESSION")]
    Sql92,
}

impl FromStr for SelectorType {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TAG" => Ok(SelectorType::Tag),
            "SQL92" | "EXPRESSION" => Ok(SelectorType::Sql92),
            _ => Err(MessagingError::InvalidProperty {
                property: "selectorType",
                reason: format!("unknown selector type `{}`", s),
            }),
        }
    }
}

impl fmt::Display for SelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorType::Tag => f.write_str("TAG"),
            SelectorType::Sql92 => f.write_str("SQL92"),
        }
    }
}

/// Settings of one listener container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerConfig {
    pub name_server: Option<String>,
    pub consumer_group: Option<String>,
    pub topic: Option<String>,
    pub consume_mode: ConsumeMode,
    pub selector_type: SelectorType,
    pub selector_express: String,
    pub message_model: MessageModel,
    pub consume_thread_max: u32,
    pub charset: String,
    /// Used on failure in concurrent mode; see `ConsumeConcurrentlyContext`.
    pub delay_level_when_next_consume: i32,
    /// Used on failure in orderly mode.
    pub suspend_current_queue_time_millis: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name_server: None,
            consumer_group: None,
            topic: None,
            consume_mode: ConsumeMode::Concurrently,
            selector_type: SelectorType::Tag,
            selector_express: "*".to_owned(),
            message_model: MessageModel::Clustering,
            consume_thread_max: DEFAULT_CONSUME_THREAD_MAX,
            charset: "UTF-8".to_owned(),
            delay_level_when_next_consume: 0,
            suspend_current_queue_time_millis: 1000,
        }
    }
}

impl ContainerConfig {
    pub fn new(name_server: &str, consumer_group: &str, topic: &str) -> Self {
        Self {
            name_server: Some(name_server.to_owned()),
            consumer_group: Some(consumer_group.to_owned()),
            topic: Some(topic.to_owned()),
            ..Default::default()
        }
    }

    pub fn with_consume_mode(mut self, consume_mode: ConsumeMode) -> Self {
        self.consume_mode = consume_mode;
        self
    }

    pub fn with_selector(mut self, selector_type: SelectorType, selector_express: &str) -> Self {
        self.selector_type = selector_type;
        self.selector_express = selector_express.to_owned();
        self
    }

    pub fn with_message_model(mut self, message_model: MessageModel) -> Self {
        self.message_model = message_model;
        self
    }

    pub fn with_consume_thread_max(mut self, consume_thread_max: u32) -> Self {
        self.consume_thread_max = consume_thread_max;
        self
    }

    pub fn with_charset(mut self, charset: &str) -> Self {
        self.charset = charset.to_owned();
        self
    }

    pub fn with_delay_level_when_next_consume(mut self, level: i32) -> Self {
        self.delay_level_when_next_consume = level;
        self
    }

    pub fn with_suspend_current_queue_time_millis(mut self, millis: u64) -> Self {
        self.suspend_current_queue_time_millis = millis;
        self
    }
}

/// Settings of the producer client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerConfig {
    pub group: String,
    /// Milliseconds.
    pub send_msg_timeout: u64,
    pub retry_times_when_send_failed: u32,
    pub retry_times_when_send_async_failed: u32,
    /// Bytes.
    pub max_message_size: usize,
    /// Bytes. Larger bodies are zlib-compressed on the wire.
    pub compress_msg_body_over_howmuch: usize,
    pub retry_another_broker_when_not_store_ok: bool,
    /// Milliseconds a cached topic route is trusted before it is fetched again.
    pub poll_name_server_interval: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            send_msg_timeout: 3000,
            retry_times_when_send_failed: 2,
            retry_times_when_send_async_failed: 2,
            max_message_size: 1024 * 1024 * 4,
            compress_msg_body_over_howmuch: 1024 * 4,
            retry_another_broker_when_not_store_ok: false,
            poll_name_server_interval: 30_000,
        }
    }
}

impl ProducerConfig {
    pub fn new(group: &str) -> Self {
        Self {
            group: group.to_owned(),
            ..Default::default()
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_msg_timeout)
    }

    pub fn route_ttl(&self) -> Duration {
        Duration::from_millis(self.poll_name_server_interval)
    }
}

/// Top level settings: name servers plus an optional producer section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RocketMQProperties {
    pub name_server: Option<String>,
    pub producer: Option<ProducerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.consume_mode, ConsumeMode::Concurrently);
        assert_eq!(config.selector_type, SelectorType::Tag);
        assert_eq!(config.selector_express, "*");
        assert_eq!(config.message_model, MessageModel::Clustering);
        assert_eq!(config.consume_thread_max, 64);
        assert_eq!(config.charset, "UTF-8");
        assert_eq!(config.delay_level_when_next_consume, 0);
        assert_eq!(config.suspend_current_queue_time_millis, 1000);
        assert_eq!(config.consumer_group, None);
    }

    #[test]
    fn test_container_from_json() -> Result<(), serde_json::Error> {
        let json = r#"{
            "nameServer": "127.0.0.1:9876",
            "consumerGroup": "G",
            "topic": "T",
            "consumeMode": "ORDERED",
            "selectorType": "EXPRESSION",
            "selectorExpress": "a > 5",
            "consumeThreadMax": 8
        }"#;
        let config: ContainerConfig = serde_json::from_str(json)?;
        assert_eq!(config.consumer_group.as_deref(), Some("G"));
        assert_eq!(config.consume_mode, ConsumeMode::Orderly);
        assert_eq!(config.selector_type, SelectorType::Sql92);
        assert_eq!(config.consume_thread_max, 8);
        assert_eq!(config.charset, "UTF-8");

        let unknown = r#"{"consumeMode": "SOMETIMES"}"#;
        assert!(serde_json::from_str::<ContainerConfig>(unknown).is_err());
        Ok(())
    }

    #[test]
    fn test_mode_and_selector_from_str() {
        assert_eq!("orderly".parse::<ConsumeMode>().ok(), Some(ConsumeMode::Orderly));
        assert_eq!(
            "concurrent".parse::<ConsumeMode>().ok(),
            Some(ConsumeMode::Concurrently)
        );
        assert_eq!("sql92".parse::<SelectorType>().ok(), Some(SelectorType::Sql92));
        assert!(matches!(
            "regex".parse::<SelectorType>(),
            Err(MessagingError::InvalidProperty {
                property: "selectorType",
                ..
            })
        ));
        assert!(matches!(
            "BATCH".parse::<ConsumeMode>(),
            Err(MessagingError::InvalidProperty {
                property: "consumeMode",
                ..
            })
        ));
    }

    #[test]
    fn test_properties_from_json() -> Result<(), serde_json::Error> {
        let json = r#"{"nameServer":"127.0.0.1:9876","producer":{"group":"P","sendMsgTimeout":1000}}"#;
        let properties: RocketMQProperties = serde_json::from_str(json)?;
        let producer = properties.producer.unwrap_or_default();
        assert_eq!(producer.group, "P");
        assert_eq!(producer.send_timeout(), Duration::from_millis(1000));
        assert_eq!(producer.retry_times_when_send_failed, 2);
        assert_eq!(producer.max_message_size, 4 * 1024 * 1024);
        assert!(!producer.retry_another_broker_when_not_store_ok);
        assert_eq!(producer.compress_msg_body_over_howmuch, 4096);
        assert_eq!(producer.route_ttl(), Duration::from_secs(30));
        Ok(())
    }
}
