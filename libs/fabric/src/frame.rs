use serde::{Deserialize, Serialize};

use crate::codec::{BincodeCodec, Codec};
use crate::error::{Error, Result};

/// Frames above this size are rejected to bound memory use
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// Sender settle mode negotiated on attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SettleMode {
    /// Every transfer is settled before it leaves the sender
    Settled,
    /// The receiver reports an outcome before settlement
    #[default]
    Unsettled,
}

/// Delivery outcome carried by dispositions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Accepted,
    Rejected,
    Released,
    Modified,
}

/// Target of a redirect condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub host: Option<String>,
    pub port: Option<String>,
}

/// Error condition attached to detach, end and close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub description: String,
    pub redirect: Option<Redirect>,
}

impl Condition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            redirect: None,
        }
    }

    /// Condition asking the peer to reconnect elsewhere
    pub fn redirect(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: "amqp:connection:redirect".to_string(),
            description: String::new(),
            redirect: Some(Redirect {
                host: Some(host.into()),
                port: Some(port.into()),
            }),
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect.is_some()
    }
}

/// Source or target of a link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminus {
    pub address: Option<String>,
    pub dynamic: bool,
}

impl Terminus {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            dynamic: false,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            address: None,
            dynamic: true,
        }
    }
}

/// Protocol frame exchanged between two connection engines
///
/// Link-scoped frames carry the handle chosen by the side that sent them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Open {
        container: String,
        hostname: Option<String>,
    },
    Begin {
        channel: u16,
        remote_channel: Option<u16>,
    },
    Attach {
        channel: u16,
        handle: u32,
        name: String,
        role: Role,
        source: Terminus,
        target: Terminus,
        snd_settle: SettleMode,
    },
    Flow {
        handle: u32,
        delivery_count: u32,
        link_credit: u32,
        drain: bool,
    },
    Transfer {
        handle: u32,
        delivery_id: u32,
        tag: Vec<u8>,
        payload: Vec<u8>,
        settled: bool,
    },
    Disposition {
        role: Role,
        delivery_id: u32,
        state: Option<Disposition>,
        settled: bool,
    },
    Detach {
        handle: u32,
        error: Option<Condition>,
    },
    End {
        channel: u16,
        error: Option<Condition>,
    },
    Close {
        error: Option<Condition>,
    },
}

/// Encode a frame with its 4-byte big-endian length prefix
pub fn encode(frame: &Frame, out: &mut Vec<u8>) -> Result<()> {
    let body = BincodeCodec.encode(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidFrame(format!(
            "Frame too large: {} bytes",
            body.len()
        )));
    }
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Incremental decoder for length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        if self.buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        let frame = BincodeCodec.decode(&self.buf[LENGTH_PREFIX..LENGTH_PREFIX + len])?;
        self.buf.drain(..LENGTH_PREFIX + len);
        Ok(Some(frame))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
