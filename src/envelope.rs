use crate::error::MessagingError;
use crate::message::{Message, MessageExt, PROPERTY_SHARDING_KEY};
use crate::resolver::{Charset, DecodeError, Payload, PayloadType};
use serde::Serialize;

pub const TOPIC_MAX_LENGTH: usize = 127;

/// How an envelope body is written to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    /// The body string, encoded with the template charset.
    Text,
    /// The body serialized as JSON.
    Json,
}

/// A typed message handed to the producer template.
///
/// [`Envelope::new`] sends its body as JSON and [`Envelope::text`] sends a string as is, so the
/// matching `Payload::json()` or `Payload::text()` listener reads back the same value.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    topic: String,
    tags: Option<String>,
    body: T,
    encoding: BodyEncoding,
    keys: Option<String>,
    sharding_key: Option<String>,
    delay_level: u32,
    message_id: Option<String>,
}

impl Envelope<String> {
    /// Envelope whose body is sent as plain text.
    pub fn text(topic: &str, body: impl Into<String>) -> Self {
        Envelope::with_encoding(topic, body.into(), BodyEncoding::Text)
    }
}

impl<T> Envelope<T> {
    /// Envelope whose body is sent as JSON.
    pub fn new(topic: &str, body: T) -> Self {
        Envelope::with_encoding(topic, body, BodyEncoding::Json)
    }

    fn with_encoding(topic: &str, body: T, encoding: BodyEncoding) -> Self {
        Envelope {
            topic: topic.to_owned(),
            tags: None,
            body,
            encoding,
            keys: None,
            sharding_key: None,
            delay_level: 0,
            message_id: None,
        }
    }

    /// Tag consumers may filter on.
    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = Some(tags.to_owned());
        self
    }

    /// Business key, e.g. an order id, usable for deduplication and queries.
    pub fn with_keys(mut self, keys: &str) -> Self {
        self.keys = Some(keys.to_owned());
        self
    }

    pub fn with_sharding_key(mut self, sharding_key: &str) -> Self {
        self.sharding_key = Some(sharding_key.to_owned());
        self
    }

    /// Broker delay level; 0 delivers immediately.
    pub fn with_delay_level(mut self, delay_level: u32) -> Self {
        self.delay_level = delay_level;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn tags(&self) -> Option<&str> {
        self.tags.as_deref()
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn encoding(&self) -> BodyEncoding {
        self.encoding
    }

    pub fn keys(&self) -> Option<&str> {
        self.keys.as_deref()
    }

    pub fn sharding_key(&self) -> Option<&str> {
        self.sharding_key.as_deref()
    }

    pub fn delay_level(&self) -> u32 {
        self.delay_level
    }

    /// Broker-assigned id; only set on envelopes built from delivered messages.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn validate_topic(&self) -> Result<(), MessagingError> {
        if self.topic.is_empty() {
            return Err(MessagingError::IllegalArgument(
                "`message` and `message.topic` cannot be empty".to_owned(),
            ));
        }
        if self.topic.len() > TOPIC_MAX_LENGTH {
            return Err(MessagingError::IllegalArgument(format!(
                "`message.topic` is longer than {} characters",
                TOPIC_MAX_LENGTH
            )));
        }
        let legal = self
            .topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '%' | '|' | '_' | '-'));
        if !legal {
            return Err(MessagingError::IllegalArgument(format!(
                "`message.topic` `{}` contains illegal characters",
                self.topic
            )));
        }
        Ok(())
    }
}

impl<T: Serialize> Envelope<T> {
    /// Validate the envelope and convert it to the broker representation.
    pub fn to_message(&self, charset: Charset) -> Result<Message, MessagingError> {
        self.validate_topic()?;

        let body = match (
            self.encoding,
            serde_json::to_value(&self.body).map_err(MessagingError::Encode)?,
        ) {
            (_, serde_json::Value::Null) => Vec::new(),
            (BodyEncoding::Text, serde_json::Value::String(text)) => charset.encode(&text),
            (BodyEncoding::Text, _) => {
                return Err(MessagingError::IllegalArgument(
                    "text `message.body` must be a string".to_owned(),
                ))
            }
            (BodyEncoding::Json, value) => {
                serde_json::to_vec(&value).map_err(MessagingError::Encode)?
            }
        };
        if body.is_empty() {
            return Err(MessagingError::IllegalArgument(
                "`message` and `message.body` cannot be empty".to_owned(),
            ));
        }

        let mut message = Message::new(&self.topic, body);
        if let Some(tags) = &self.tags {
            message.set_tags(tags);
        }
        if let Some(keys) = &self.keys {
            message.set_keys(keys);
        }
        if let Some(sharding_key) = &self.sharding_key {
            message.put_property(PROPERTY_SHARDING_KEY, sharding_key);
        }
        message.set_delay_time_level(self.delay_level);
        Ok(message)
    }
}

impl<T> Envelope<T> {
    /// Rebuild an envelope from a delivered message, decoding its body with `payload`.
    pub fn from_message(
        message: &MessageExt,
        payload: &Payload<T>,
        charset: Charset,
    ) -> Result<Self, DecodeError> {
        let keys = message.keys();
        Ok(Envelope {
            topic: message.topic.clone(),
            tags: message.tags().map(str::to_owned),
            body: payload.convert(message, charset)?,
            encoding: match payload.kind() {
                PayloadType::Text => BodyEncoding::Text,
                PayloadType::Raw | PayloadType::Json => BodyEncoding::Json,
            },
            keys: if keys.is_empty() {
                None
            } else {
                Some(keys.join(" "))
            },
            sharding_key: message.property(PROPERTY_SHARDING_KEY).map(str::to_owned),
            delay_level: message.delay_time_level(),
            message_id: Some(message.msg_id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderEvent {
        id: u64,
        amount: i64,
    }

    #[test]
    fn test_text_body_is_sent_verbatim() -> Result<(), MessagingError> {
        let envelope = Envelope::text("T", "hello")
            .with_tags("TagA")
            .with_keys("order-1")
            .with_delay_level(2);
        let message = envelope.to_message(Charset::Utf8)?;
        assert_eq!(message.topic, "T");
        assert_eq!(&message.body[..], b"hello");
        assert_eq!(message.tags(), Some("TagA"));
        assert_eq!(message.keys(), vec!["order-1"]);
        assert_eq!(message.delay_time_level(), 2);
        assert_eq!(envelope.message_id(), None);
        Ok(())
    }

    #[test]
    fn test_structured_body_is_sent_as_json() -> Result<(), MessagingError> {
        let message = Envelope::new("T", OrderEvent { id: 1, amount: 10 })
            .with_sharding_key("1")
            .to_message(Charset::Utf8)?;
        assert_eq!(&message.body[..], br#"{"amount":10,"id":1}"#);
        assert_eq!(message.property(PROPERTY_SHARDING_KEY), Some("1"));
        assert_eq!(message.delay_time_level(), 0);
        Ok(())
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Status {
        Active,
        Closed,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderId(String);

    #[test]
    fn test_string_like_values_round_trip_as_json() -> Result<(), Box<dyn std::error::Error>> {
        let message = Envelope::new("T", Status::Active).to_message(Charset::Utf8)?;
        assert_eq!(&message.body[..], br#""Active""#);
        let delivered = MessageExt::new(message, "MSG-1", 0, 0);
        assert_eq!(
            Payload::<Status>::json().convert(&delivered, Charset::Utf8)?,
            Status::Active
        );

        let message = Envelope::new("T", OrderId("o-1".to_owned())).to_message(Charset::Utf8)?;
        let delivered = MessageExt::new(message, "MSG-2", 0, 0);
        assert_eq!(
            Payload::<OrderId>::json().convert(&delivered, Charset::Utf8)?,
            OrderId("o-1".to_owned())
        );

        // A plain string under `new` is JSON too; `text` is the way to send it bare.
        let message = Envelope::new("T", "hello").to_message(Charset::Utf8)?;
        let delivered = MessageExt::new(message, "MSG-3", 0, 0);
        assert_eq!(
            Payload::<String>::json().convert(&delivered, Charset::Utf8)?,
            "hello"
        );
        let message = Envelope::text("T", "hello").to_message(Charset::Utf8)?;
        let delivered = MessageExt::new(message, "MSG-4", 0, 0);
        assert_eq!(Payload::text().convert(&delivered, Charset::Utf8)?, "hello");
        Ok(())
    }

    #[test]
    fn test_encoding_follows_payload_kind() -> Result<(), Box<dyn std::error::Error>> {
        let message = Envelope::new("T", Status::Closed).to_message(Charset::Utf8)?;
        let delivered = MessageExt::new(message, "MSG-5", 0, 0);

        let json = Envelope::from_message(&delivered, &Payload::<Status>::json(), Charset::Utf8)?;
        assert_eq!(json.encoding(), BodyEncoding::Json);
        assert_eq!(json.to_message(Charset::Utf8)?.body, delivered.body);

        let text = Envelope::from_message(&delivered, &Payload::text(), Charset::Utf8)?;
        assert_eq!(text.encoding(), BodyEncoding::Text);
        assert_eq!(text.body(), r#""Closed""#);
        Ok(())
    }

    #[test]
    fn test_invalid_envelopes() {
        let cases = vec![
            Envelope::text("", "hello"),
            Envelope::text("T", ""),
            Envelope::text("bad topic", "hello"),
            Envelope::text(&"t".repeat(TOPIC_MAX_LENGTH + 1), "hello"),
        ];
        for envelope in cases {
            assert!(
                matches!(
                    envelope.to_message(Charset::Utf8),
                    Err(MessagingError::IllegalArgument(_))
                ),
                "{:?} should be rejected",
                envelope
            );
        }
        let none: Envelope<Option<u8>> = Envelope::new("T", None);
        assert!(matches!(
            none.to_message(Charset::Utf8),
            Err(MessagingError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_from_delivered_message() -> Result<(), Box<dyn std::error::Error>> {
        let message = Envelope::new("T", OrderEvent { id: 7, amount: 3 })
            .with_tags("TagA")
            .with_keys("order-7")
            .to_message(Charset::Utf8)?;
        let delivered = MessageExt::new(message, "MSG-7", 1, 0);

        let envelope = Envelope::from_message(&delivered, &Payload::<OrderEvent>::json(), Charset::Utf8)?;
        assert_eq!(envelope.body(), &OrderEvent { id: 7, amount: 3 });
        assert_eq!(envelope.tags(), Some("TagA"));
        assert_eq!(envelope.keys(), Some("order-7"));
        assert_eq!(envelope.message_id(), Some("MSG-7"));
        Ok(())
    }
}
