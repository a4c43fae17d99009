use serde::Deserialize;
use std::collections::HashMap;
use std::vec::Vec;

use crate::error::ClientError;
use crate::message::MessageQueue;

pub(crate) mod response_code {
    pub(crate) const SUCCESS: i32 = 0;
    pub(crate) const FLUSH_DISK_TIMEOUT: i32 = 10;
    pub(crate) const SLAVE_NOT_AVAILABLE: i32 = 11;
    pub(crate) const FLUSH_SLAVE_TIMEOUT: i32 = 12;
    pub(crate) const TOPIC_NOT_EXIST: i32 = 17;
}

pub(crate) const PERM_WRITE: i32 = 1 << 1;
pub(crate) const MASTER_ID: i64 = 0;

pub struct GetRouteInfoRequestHeader {
    topic: String,
}

impl GetRouteInfoRequestHeader {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
        }
    }
}

impl From<GetRouteInfoRequestHeader> for HashMap<String, String> {
    fn from(header: GetRouteInfoRequestHeader) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("topic".to_owned(), header.topic);
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendMessageRequestHeader {
    pub producer_group: String,
    pub topic: String,
    pub default_topic: String,
    pub default_topic_queue_nums: i32,
    pub queue_id: i32,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub flag: i32,
    pub properties: Option<String>,
    pub reconsume_times: Option<i32>,
    pub unit_mode: Option<bool>,
    pub batch: Option<bool>,
    pub max_reconsume_times: Option<i32>,
}

impl From<SendMessageRequestHeader> for HashMap<String, String> {
    fn from(header: SendMessageRequestHeader) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("producerGroup".to_owned(), header.producer_group);
        map.insert("topic".to_owned(), header.topic);
        map.insert("defaultTopic".to_owned(), header.default_topic);
        map.insert(
            "defaultTopicQueueNums".to_owned(),
            header.default_topic_queue_nums.to_string(),
        );
        map.insert("queueId".to_owned(), header.queue_id.to_string());
        map.insert("sysFlag".to_owned(), header.sys_flag.to_string());
        map.insert("bornTimestamp".to_owned(), header.born_timestamp.to_string());
        map.insert("flag".to_owned(), header.flag.to_string());
        if let Some(properties) = header.properties {
            map.insert("properties".to_owned(), properties);
        }
        if let Some(reconsume_times) = header.reconsume_times {
            map.insert("reconsumeTimes".to_owned(), reconsume_times.to_string());
        }
        if let Some(unit_mode) = header.unit_mode {
            map.insert("unitMode".to_owned(), unit_mode.to_string());
        }
        if let Some(batch) = header.batch {
            map.insert("batch".to_owned(), batch.to_string());
        }
        if let Some(max_reconsume_times) = header.max_reconsume_times {
            map.insert("maxReconsumeTimes".to_owned(), max_reconsume_times.to_string());
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendMessageResponseHeader {
    pub msg_id: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub transaction_id: Option<String>,
}

impl TryFrom<&HashMap<String, String>> for SendMessageResponseHeader {
    type Error = ClientError;

    fn try_from(fields: &HashMap<String, String>) -> Result<Self, Self::Error> {
        let field = |name: &str| {
            fields.get(name).ok_or_else(|| {
                ClientError::InvalidFrame(format!("Send response misses `{}`", name))
            })
        };
        let malformed =
            |name: &str| ClientError::InvalidFrame(format!("Send response has malformed `{}`", name));
        let number = |name: &str| -> Result<i64, ClientError> {
            field(name)?.parse::<i64>().map_err(|_e| malformed(name))
        };
        Ok(Self {
            msg_id: field("msgId")?.clone(),
            queue_id: i32::try_from(number("queueId")?).map_err(|_e| malformed("queueId"))?,
            queue_offset: number("queueOffset")?,
            transaction_id: fields.get("transactionId").cloned(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueData {
    broker_name: String,
    read_queue_nums: i32,
    write_queue_nums: i32,
    perm: i32,
    topic_syn_flag: i32,
}

impl QueueData {
    pub(crate) fn is_writable(&self) -> bool {
        self.perm & PERM_WRITE == PERM_WRITE
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerData {
    cluster: String,
    broker_name: String,
    broker_addrs: HashMap<i64, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRouteData {
    order_topic_conf: Option<String>,
    queue_datas: Vec<QueueData>,
    broker_datas: Vec<BrokerData>,

    // deprecated
    #[serde(default)]
    filter_server_table: HashMap<String, Vec<String>>,
}

impl TopicRouteData {
    /// Writable queues of `topic`, ordered by broker name then queue id.
    pub(crate) fn message_queues(&self, topic: &str) -> Vec<MessageQueue> {
        let mut queue_datas: Vec<&QueueData> = self
            .queue_datas
            .iter()
            .filter(|queue_data| queue_data.is_writable())
            .filter(|queue_data| self.master_address(&queue_data.broker_name).is_some())
            .collect();
        queue_datas.sort_by(|a, b| a.broker_name.cmp(&b.broker_name));
        queue_datas
            .iter()
            .flat_map(|queue_data| {
                (0..queue_data.write_queue_nums)
                    .map(move |queue_id| MessageQueue::new(topic, &queue_data.broker_name, queue_id))
            })
            .collect()
    }

    pub(crate) fn master_address(&self, broker_name: &str) -> Option<&str> {
        self.broker_datas
            .iter()
            .find(|broker_data| broker_data.broker_name == broker_name)
            .and_then(|broker_data| broker_data.broker_addrs.get(&MASTER_ID))
            .map(String::as_str)
    }
}
