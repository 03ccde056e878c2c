use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{BincodeCodec, Codec};
use crate::error::Result;

/// Application message carried by the messenger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    address: Option<String>,
    reply_to: Option<String>,
    subject: Option<String>,
    correlation_id: Option<String>,
    content_type: Option<String>,
    properties: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn set_address(&mut self, address: Option<String>) {
        self.address = address;
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn set_reply_to(&mut self, reply_to: Option<String>) {
        self.reply_to = reply_to;
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn set_subject(&mut self, subject: Option<String>) {
        self.subject = subject;
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn set_correlation_id(&mut self, id: Option<String>) {
        self.correlation_id = id;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: Option<String>) {
        self.content_type = content_type;
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Encode into `buf`, returning the number of bytes written
    ///
    /// Returns [`Error::Overflow`](crate::Error::Overflow) when `buf` is too small.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        BincodeCodec.encode_into(self, buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        BincodeCodec.decode(bytes)
    }
}
