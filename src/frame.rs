use bytes::{self, Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::default::Default;
use std::io::Cursor;
use std::sync::atomic::{self, Ordering};

use crate::error::{self, ClientError};

// Bit 0 marks a response, bit 1 marks a one-way request.
const RPC_TYPE: i32 = 1;
const RPC_ONEWAY: i32 = 1 << 1;

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy, Default)]
pub(crate) enum Language {
    JAVA,
    CPP,
    #[default]
    RUST,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestCode {
    SendMessage = 10,
    GetRouteInfoByTopic = 105,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    // Operation code for requests, response code for responses
    pub(crate) code: i32,

    // Language of the SDK that generates this frame
    pub(crate) language: Language,

    // Version of the SDK that generates this frame
    pub(crate) version: i32,

    // frame identifier
    pub(crate) opaque: i32,

    // Bit-wise flag that overrides semantics of certain fields
    pub(crate) flag: i32,

    // Human readable remarks
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) remark: String,

    #[serde(skip_serializing_if = "HashMap::is_empty", default = "HashMap::new")]
    pub(crate) ext_fields: HashMap<String, String>,

    #[serde(skip)]
    pub(crate) body: bytes::Bytes,
}

#[derive(Debug)]
pub(crate) enum Error {
    // Not enough data is available to parse a message
    Incomplete,

    // Invalid message encoding
    Other(error::ClientError),
}

#[derive(Debug, PartialEq)]
pub(crate) enum Type {
    Request,
    Response,
}

impl Frame {
    // Generate next opaque, aka, request identifier.
    fn next_opaque() -> i32 {
        static SEQUENCE: atomic::AtomicI32 = atomic::AtomicI32::new(0);
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn new() -> Self {
        Frame {
            opaque: Frame::next_opaque(),
            ..Default::default()
        }
    }

    pub(crate) fn request(code: RequestCode) -> Self {
        let mut frame = Frame::new();
        frame.code = code as i32;
        frame
    }

    /// Build the response to a request identified by `opaque`.
    pub(crate) fn response(opaque: i32, code: i32, remark: &str) -> Self {
        let mut frame = Frame {
            code,
            opaque,
            remark: remark.to_owned(),
            ..Default::default()
        };
        frame.mark_response_type();
        frame
    }

    pub(crate) fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        // frame-length = 4 + len(header) + len(body)
        // frame-layout |header-length|---header-data---|---body---|
        let frame_length = Frame::read_i32(src)?;
        if frame_length < 4 {
            return Err(Error::Other(ClientError::InvalidFrame(format!(
                "Frame length {} is too small",
                frame_length
            ))));
        }

        if src.remaining() < frame_length as usize {
            return Err(Error::Incomplete);
        }

        src.advance(frame_length as usize);

        Ok(())
    }

    pub(crate) fn parse(src: &mut Cursor<&[u8]>) -> Result<Option<Self>, ClientError> {
        let frame_length = Frame::read_i32(src)
            .map_err(|_e| ClientError::InvalidFrame("Invalid frame length".to_string()))?;
        // The high byte carries the header serialization type; only JSON is spoken here.
        let header_length = Frame::read_i32(src)
            .map_err(|_e| ClientError::InvalidFrame("Invalid frame header length".to_string()))?
            & 0x00FF_FFFF;

        let body_length = frame_length - 4 - header_length;
        if header_length as usize > src.remaining() || body_length < 0 {
            return Err(ClientError::InvalidFrame(
                "Frame header length exceeds frame length".to_string(),
            ));
        }

        let header = src.copy_to_bytes(header_length as usize);
        let mut frame: Frame = serde_json::from_reader(header.reader())
            .map_err(|_e| ClientError::InvalidFrame("Invalid frame header JSON".to_string()))?;

        if body_length > 0 {
            frame.body = src.copy_to_bytes(body_length as usize);
        }
        Ok(Some(frame))
    }

    fn read_i32(src: &mut Cursor<&[u8]>) -> Result<i32, Error> {
        if src.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        Ok(src.get_i32())
    }

    pub(crate) fn encode(&self) -> Result<Bytes, ClientError> {
        let header = serde_json::to_vec(self).map_err(|_e| {
            ClientError::InvalidFrame("Failed to JSON serialize frame header".to_string())
        })?;
        let len = 4 + header.len() + self.body.len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_i32(len as i32);
        buf.put_i32(header.len() as i32);
        buf.put_slice(&header);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    pub(crate) fn put_ext_field(&mut self, key: &str, value: &str) {
        self.ext_fields.insert(key.to_owned(), value.to_owned());
    }

    pub(crate) fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    pub(crate) fn remark(&self) -> &str {
        self.remark.as_str()
    }

    pub(crate) fn frame_type(&self) -> Type {
        if self.flag & RPC_TYPE == RPC_TYPE {
            return Type::Response;
        }
        Type::Request
    }

    pub(crate) fn mark_response_type(&mut self) {
        self.flag |= RPC_TYPE;
    }

    pub(crate) fn mark_oneway(&mut self) {
        self.flag |= RPC_ONEWAY;
    }

    pub(crate) fn is_oneway(&self) -> bool {
        self.flag & RPC_ONEWAY == RPC_ONEWAY
    }

    pub(crate) fn add_ext_headers(&mut self, header: impl Into<HashMap<String, String>>) {
        let map: HashMap<String, String> = header.into();
        self.ext_fields.extend(map);
    }

    pub(crate) fn body(&self) -> bytes::Bytes {
        self.body.clone()
    }
}
