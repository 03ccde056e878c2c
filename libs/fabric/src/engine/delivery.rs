use crate::engine::LinkId;
use crate::frame::{Disposition, Role};

/// A single message transfer and its settlement state
#[derive(Debug)]
pub struct Delivery {
    pub(crate) link: LinkId,
    pub(crate) role: Role,
    pub(crate) tag: Vec<u8>,
    pub(crate) bytes: Vec<u8>,
    pub(crate) offset: usize,
    pub(crate) wire_id: Option<u32>,

    pub(crate) local_state: Option<Disposition>,
    pub(crate) remote_state: Option<Disposition>,
    pub(crate) local_settled: bool,
    pub(crate) remote_settled: bool,
    pub(crate) updated: bool,

    // sender side: handed to the wire
    pub(crate) transmitted: bool,
    // receiver side: advanced past by the application
    pub(crate) consumed: bool,
    pub(crate) disposition_pending: bool,
    // settlement already visible to the peer, no disposition needed
    pub(crate) settled_on_wire: bool,
}

impl Delivery {
    pub(crate) fn outgoing(link: LinkId, tag: Vec<u8>) -> Self {
        Self::new(link, Role::Sender, tag, Vec::new())
    }

    pub(crate) fn incoming(link: LinkId, wire_id: u32, tag: Vec<u8>, bytes: Vec<u8>) -> Self {
        let mut delivery = Self::new(link, Role::Receiver, tag, bytes);
        delivery.wire_id = Some(wire_id);
        delivery
    }

    fn new(link: LinkId, role: Role, tag: Vec<u8>, bytes: Vec<u8>) -> Self {
        Self {
            link,
            role,
            tag,
            bytes,
            offset: 0,
            wire_id: None,
            local_state: None,
            remote_state: None,
            local_settled: false,
            remote_settled: false,
            updated: false,
            transmitted: false,
            consumed: false,
            disposition_pending: false,
            settled_on_wire: false,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    pub fn local_state(&self) -> Option<Disposition> {
        self.local_state
    }

    pub fn remote_state(&self) -> Option<Disposition> {
        self.remote_state
    }

    pub fn is_settled(&self) -> bool {
        self.local_settled
    }

    pub fn is_remote_settled(&self) -> bool {
        self.remote_settled
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Bytes not yet read by the receiver
    pub fn pending(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Still held by the sender, not yet written to the wire
    pub fn is_buffered(&self) -> bool {
        self.role == Role::Sender && !self.transmitted
    }

    pub(crate) fn needs_disposition(&self) -> bool {
        self.disposition_pending && self.wire_id.is_some()
    }
}
