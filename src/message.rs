use bytes;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

pub const PROPERTY_TAGS: &str = "TAGS";
pub const PROPERTY_KEYS: &str = "KEYS";
pub const PROPERTY_DELAY_TIME_LEVEL: &str = "DELAY";
pub const PROPERTY_WAIT_STORE_MSG_OK: &str = "WAIT";
pub const PROPERTY_UNIQ_CLIENT_MESSAGE_ID_KEYIDX: &str = "UNIQ_KEY";
pub const PROPERTY_SHARDING_KEY: &str = "__SHARDINGKEY";

const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';
const KEY_SEPARATOR: &str = " ";

/// Raw message in the shape brokers store it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// In the publisher-subscriber model, a topic is an addresses where messages are delivered to and subscribed from.
    pub topic: String,

    pub flag: i32,

    /// System and user properties
    ///
    /// System properties include key-value pairs to modify how messages are delivered to subscribers. For example, publishers
    /// may publish a timed message, which should be invisible to subscribers before specified delay level elapses.
    pub(crate) properties: HashMap<String, String>,

    pub body: bytes::Bytes,
}

impl Message {
    pub fn new(topic: &str, body: impl Into<bytes::Bytes>) -> Self {
        Message {
            topic: topic.to_owned(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn tags(&self) -> Option<&str> {
        self.property(PROPERTY_TAGS)
    }

    pub fn set_tags(&mut self, tags: &str) {
        self.put_property(PROPERTY_TAGS, tags);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.property(PROPERTY_KEYS)
            .map(|keys| keys.split(KEY_SEPARATOR).filter(|k| !k.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn set_keys(&mut self, keys: &str) {
        self.put_property(PROPERTY_KEYS, keys);
    }

    pub fn delay_time_level(&self) -> u32 {
        self.property(PROPERTY_DELAY_TIME_LEVEL)
            .and_then(|level| level.parse().ok())
            .unwrap_or(0)
    }

    /// Level 0 means immediate delivery and removes the property.
    pub fn set_delay_time_level(&mut self, level: u32) {
        if level == 0 {
            self.properties.remove(PROPERTY_DELAY_TIME_LEVEL);
        } else {
            self.put_property(PROPERTY_DELAY_TIME_LEVEL, &level.to_string());
        }
    }

    pub fn set_wait_store_msg_ok(&mut self, wait: bool) {
        self.put_property(PROPERTY_WAIT_STORE_MSG_OK, if wait { "true" } else { "false" });
    }

    pub fn unique_key(&self) -> Option<&str> {
        self.property(PROPERTY_UNIQ_CLIENT_MESSAGE_ID_KEYIDX)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// User defined attributes.
    /// Attributes are indexed by backend broker servers, thus, may be utilized to query.
    pub fn put_user_property(&mut self, name: &str, value: &str) {
        self.put_property(name, value);
    }

    pub(crate) fn put_property(&mut self, name: &str, value: &str) {
        self.properties.insert(name.to_owned(), value.to_owned());
    }

    pub(crate) fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Encode properties the way brokers store them: `name\u{1}value\u{2}` repeated.
pub(crate) fn properties_to_string(properties: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = properties.keys().collect();
    names.sort();
    names.iter().fold(String::new(), |mut acc, name| {
        acc.push_str(name);
        acc.push(NAME_VALUE_SEPARATOR);
        acc.push_str(&properties[*name]);
        acc.push(PROPERTY_SEPARATOR);
        acc
    })
}

pub(crate) fn string_to_properties(encoded: &str) -> HashMap<String, String> {
    encoded
        .split(PROPERTY_SEPARATOR)
        .filter_map(|pair| pair.split_once(NAME_VALUE_SEPARATOR))
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
}

/// A partition of a topic hosted by one broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl MessageQueue {
    pub fn new(topic: &str, broker_name: &str, queue_id: i32) -> Self {
        Self {
            topic: topic.to_owned(),
            broker_name: broker_name.to_owned(),
            queue_id,
        }
    }
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageQueue [topic={}, brokerName={}, queueId={}]",
            self.topic, self.broker_name, self.queue_id
        )
    }
}

/// Message as delivered to consumers, with broker-assigned metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageExt {
    pub message: Message,
    pub msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub broker_name: String,
    pub reconsume_times: i32,
    pub born_timestamp: i64,
    pub store_timestamp: i64,
}

impl MessageExt {
    pub fn new(message: Message, msg_id: &str, queue_id: i32, queue_offset: i64) -> Self {
        MessageExt {
            message,
            msg_id: msg_id.to_owned(),
            queue_id,
            queue_offset,
            ..Default::default()
        }
    }
}

impl Deref for MessageExt {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl fmt::Display for MessageExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageExt [msgId={}, topic={}, queueId={}, queueOffset={}, reconsumeTimes={}, body={}]",
            self.msg_id,
            self.topic,
            self.queue_id,
            self.queue_offset,
            self.reconsume_times,
            String::from_utf8_lossy(&self.body)
        )
    }
}
