//!
//! Payload resolution: decides how the body of a delivered message becomes the value a listener receives.
//!
//! The strategy is chosen explicitly when a listener is registered, via [`Payload`]:
//!
//! * [`Payload::raw`] passes the [`MessageExt`] through untouched;
//! * [`Payload::text`] decodes the body with the container charset;
//! * [`Payload::json`] decodes the body as text, then parses it into the declared type.
//!
use crate::message::MessageExt;
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Character sets a container may decode message bodies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    UsAscii,
    Iso8859_1,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unsupported charset `{0}`")]
pub struct UnsupportedCharset(pub String);

impl FromStr for Charset {
    type Err = UnsupportedCharset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "UTF-8" | "UTF8" => Ok(Charset::Utf8),
            "US-ASCII" | "ASCII" => Ok(Charset::UsAscii),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => Ok(Charset::Iso8859_1),
            _ => Err(UnsupportedCharset(s.to_owned())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Charset::Utf8 => "UTF-8",
            Charset::UsAscii => "US-ASCII",
            Charset::Iso8859_1 => "ISO-8859-1",
        };
        f.write_str(name)
    }
}

impl Charset {
    /// Decode `bytes`, replacing malformed input with U+FFFD.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
                .collect(),
            Charset::Iso8859_1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encode `text`, replacing unmappable characters with `?`.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::UsAscii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Charset::Iso8859_1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

/// The kind of value a listener declared it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Raw,
    Text,
    Json,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot convert message to {type_name}")]
    Json {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

type DecodeFn<T> = fn(&MessageExt, Charset) -> Result<T, DecodeError>;

/// Decode strategy of a listener payload type.
pub struct Payload<T> {
    kind: PayloadType,
    type_name: &'static str,
    decode: DecodeFn<T>,
}

impl<T> Clone for Payload<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Payload<T> {}

impl<T> fmt::Debug for Payload<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish()
    }
}

impl Payload<MessageExt> {
    pub fn raw() -> Self {
        Payload {
            kind: PayloadType::Raw,
            type_name: std::any::type_name::<MessageExt>(),
            decode: |message, _charset| Ok(message.clone()),
        }
    }
}

impl Payload<String> {
    pub fn text() -> Self {
        Payload {
            kind: PayloadType::Text,
            type_name: std::any::type_name::<String>(),
            decode: |message, charset| Ok(charset.decode(&message.body)),
        }
    }
}

impl<T: DeserializeOwned> Payload<T> {
    pub fn json() -> Self {
        Payload {
            kind: PayloadType::Json,
            type_name: std::any::type_name::<T>(),
            decode: |message, charset| {
                let text = charset.decode(&message.body);
                serde_json::from_str(&text).map_err(|e| DecodeError::Json {
                    type_name: std::any::type_name::<T>(),
                    source: e,
                })
            },
        }
    }
}

impl<T> Payload<T> {
    pub fn kind(&self) -> PayloadType {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Turn a delivered message into the listener payload.
    pub fn convert(&self, message: &MessageExt, charset: Charset) -> Result<T, DecodeError> {
        (self.decode)(message, charset)
    }
}
