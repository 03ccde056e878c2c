//! In-process protocol engine
//!
//! A [`Connection`] owns its sessions, links and deliveries and addresses them
//! by stable ids. Every endpoint carries a local and a remote [`State`]; the
//! application drives the local side and the peer's frames drive the remote
//! side. Bytes move in and out through [`Connection::input`] and
//! [`Connection::output`], which a driver pumps.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::error::{Error, Result};
use crate::frame::{Condition, Disposition, FrameDecoder, Role, SettleMode, Terminus};

mod delivery;
mod link;
mod transport;

pub use delivery::Delivery;
pub use link::{Link, Session};

/// Owner-assigned identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryId(u32);

/// Lifecycle state of one side of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    Uninit,
    Active,
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    container: String,
    hostname: Option<String>,
    local: State,
    remote: State,
    remote_container: Option<String>,
    remote_hostname: Option<String>,
    local_condition: Option<Condition>,
    remote_condition: Option<Condition>,

    sessions: BTreeMap<SessionId, Session>,
    links: BTreeMap<LinkId, Link>,
    deliveries: BTreeMap<DeliveryId, Delivery>,

    next_session: u16,
    next_link: u32,
    next_delivery: u32,
    next_wire_id: u32,

    remote_channels: HashMap<u16, SessionId>,
    remote_handles: HashMap<u32, LinkId>,
    outgoing_ids: HashMap<u32, DeliveryId>,
    incoming_ids: HashMap<u32, DeliveryId>,

    open_sent: bool,
    close_sent: bool,
    decoder: FrameDecoder,
}

impl Connection {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            hostname: None,
            local: State::Uninit,
            remote: State::Uninit,
            remote_container: None,
            remote_hostname: None,
            local_condition: None,
            remote_condition: None,
            sessions: BTreeMap::new(),
            links: BTreeMap::new(),
            deliveries: BTreeMap::new(),
            next_session: 0,
            next_link: 0,
            next_delivery: 0,
            next_wire_id: 0,
            remote_channels: HashMap::new(),
            remote_handles: HashMap::new(),
            outgoing_ids: HashMap::new(),
            incoming_ids: HashMap::new(),
            open_sent: false,
            close_sent: false,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    pub fn local_state(&self) -> State {
        self.local
    }

    pub fn remote_state(&self) -> State {
        self.remote
    }

    pub fn remote_container(&self) -> Option<&str> {
        self.remote_container.as_deref()
    }

    pub fn remote_hostname(&self) -> Option<&str> {
        self.remote_hostname.as_deref()
    }

    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    pub fn open(&mut self) {
        if self.local == State::Uninit {
            self.local = State::Active;
        }
    }

    pub fn close(&mut self) {
        self.local = State::Closed;
    }

    /// Close with a condition, e.g. a redirect
    pub fn close_with(&mut self, condition: Condition) {
        self.local_condition = Some(condition);
        self.close();
    }

    /// Forget all wire state so the connection can be replayed on a new transport
    ///
    /// Sessions and links keep their ids and local state; anything active is
    /// begun and attached again once the connection reopens. Receivers
    /// re-announce their outstanding credit.
    pub fn reset(&mut self) {
        self.local = State::Uninit;
        self.remote = State::Uninit;
        self.remote_container = None;
        self.remote_hostname = None;
        self.remote_condition = None;
        self.local_condition = None;
        self.open_sent = false;
        self.close_sent = false;
        self.decoder.clear();
        self.remote_channels.clear();
        self.remote_handles.clear();
        self.outgoing_ids.clear();
        self.incoming_ids.clear();
        self.next_wire_id = 0;

        self.sessions.retain(|_, s| !s.freed);
        for session in self.sessions.values_mut() {
            session.remote = State::Uninit;
            session.remote_channel = None;
            session.remote_condition = None;
            session.begin_sent = false;
            session.end_sent = false;
        }

        self.links.retain(|_, l| !l.freed);
        for link in self.links.values_mut() {
            link.remote = State::Uninit;
            link.remote_handle = None;
            link.remote_condition = None;
            link.attach_sent = false;
            link.detach_sent = false;
            link.delivery_count = 0;
            match link.role {
                Role::Sender => {
                    link.credit = 0;
                    link.drain = false;
                    link.flow_pending = false;
                }
                Role::Receiver => {
                    link.flow_pending = link.remote_credit() > 0;
                }
            }
        }

        for delivery in self.deliveries.values_mut() {
            if delivery.wire_id.take().is_some() {
                delivery.settled_on_wire = true;
                delivery.disposition_pending = false;
            }
        }
    }

    pub fn new_session(&mut self) -> SessionId {
        let id = SessionId(self.next_session as u32);
        self.sessions.insert(id, Session::new(self.next_session));
        self.next_session = self.next_session.wrapping_add(1);
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id).filter(|s| !s.freed)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.freed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn open_session(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.local == State::Uninit {
                session.local = State::Active;
            }
        }
    }

    pub fn close_session(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.local = State::Closed;
        }
    }

    /// Release a session and every link on it
    pub fn free_session(&mut self, id: SessionId) {
        let links: Vec<LinkId> = self
            .links
            .iter()
            .filter(|(_, l)| l.session == id)
            .map(|(lid, _)| *lid)
            .collect();
        for link in links {
            self.free_link(link);
        }

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.local == State::Active {
            session.local = State::Closed;
        }
        if let Some(channel) = session.remote_channel {
            self.remote_channels.remove(&channel);
        }
        if session.needs_end() {
            session.freed = true;
        } else {
            self.sessions.remove(&id);
        }
    }

    /// Create a link on a session; names must be unique per role
    pub fn new_link(&mut self, session: SessionId, role: Role, name: impl Into<String>) -> Result<LinkId> {
        if self.session(session).is_none() {
            return Err(Error::Custom(format!("Unknown session {:?}", session)));
        }
        let id = LinkId(self.next_link);
        self.next_link = self.next_link.wrapping_add(1);
        self.links.insert(id, Link::new(session, id.0, name.into(), role));
        Ok(id)
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id).filter(|l| !l.freed)
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|(_, l)| !l.freed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn set_source(&mut self, id: LinkId, source: Terminus) {
        if let Some(link) = self.links.get_mut(&id) {
            link.source = source;
        }
    }

    pub fn set_target(&mut self, id: LinkId, target: Terminus) {
        if let Some(link) = self.links.get_mut(&id) {
            link.target = target;
        }
    }

    pub fn set_snd_settle(&mut self, id: LinkId, mode: SettleMode) {
        if let Some(link) = self.links.get_mut(&id) {
            link.snd_settle = mode;
        }
    }

    pub fn open_link(&mut self, id: LinkId) {
        if let Some(link) = self.links.get_mut(&id) {
            if link.local == State::Uninit {
                link.local = State::Active;
            }
        }
    }

    pub fn close_link(&mut self, id: LinkId) {
        if let Some(link) = self.links.get_mut(&id) {
            link.local = State::Closed;
        }
    }

    /// Release a link and every delivery on it
    pub fn free_link(&mut self, id: LinkId) {
        let deliveries: Vec<DeliveryId> = self
            .deliveries
            .iter()
            .filter(|(_, d)| d.link == id)
            .map(|(did, _)| *did)
            .collect();
        for delivery in deliveries {
            self.remove_delivery(delivery);
        }

        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if link.local == State::Active {
            link.local = State::Closed;
        }
        link.pending.clear();
        link.current = None;
        link.queued = 0;
        if let Some(handle) = link.remote_handle {
            self.remote_handles.remove(&handle);
        }
        if link.needs_detach() {
            link.freed = true;
        } else {
            self.links.remove(&id);
        }
    }

    /// Grant `credit` more transfers to a receiver
    pub fn flow(&mut self, id: LinkId, credit: u32) {
        if let Some(link) = self.links.get_mut(&id) {
            if link.role == Role::Receiver && credit > 0 {
                link.credit = link.credit.saturating_add(credit);
                link.flow_pending = true;
            }
        }
    }

    pub fn set_drain(&mut self, id: LinkId, drain: bool) {
        if let Some(link) = self.links.get_mut(&id) {
            if link.drain != drain {
                link.drain = drain;
                if link.role == Role::Receiver && drain {
                    link.flow_pending = true;
                }
            }
        }
    }

    pub fn drain(&self, id: LinkId) -> bool {
        self.links.get(&id).map(|l| l.drain).unwrap_or(false)
    }

    /// A receiver that asked to drain and still has credit open on the wire
    pub fn draining(&self, id: LinkId) -> bool {
        self.links
            .get(&id)
            .map(|l| l.role == Role::Receiver && l.drain && l.remote_credit() > 0)
            .unwrap_or(false)
    }

    /// Credit given back by a drain
    ///
    /// Receivers report (and reset) the credit the sender relinquished.
    /// Senders asked to drain with nothing left to send relinquish their
    /// credit here and tell the peer.
    pub fn drained(&mut self, id: LinkId) -> u32 {
        let Some(link) = self.links.get_mut(&id) else {
            return 0;
        };
        match link.role {
            Role::Receiver => std::mem::take(&mut link.drained),
            Role::Sender => {
                if link.drain && link.pending.is_empty() && link.credit > 0 {
                    let relinquished = link.credit;
                    link.delivery_count = link.delivery_count.wrapping_add(relinquished);
                    link.credit = 0;
                    link.flow_pending = true;
                    relinquished
                } else {
                    0
                }
            }
        }
    }

    /// Credit the peer may still use on this link
    pub fn remote_credit(&self, id: LinkId) -> u32 {
        self.links.get(&id).map(Link::remote_credit).unwrap_or(0)
    }

    /// Local credit: unconsumed grants for receivers, usable credit for senders
    pub fn credit(&self, id: LinkId) -> u32 {
        self.links.get(&id).map(|l| l.credit).unwrap_or(0)
    }

    /// Deliveries waiting on the link: unsent for senders, unread for receivers
    pub fn queued(&self, id: LinkId) -> u32 {
        self.links.get(&id).map(|l| l.queued).unwrap_or(0)
    }

    /// Start a new outgoing delivery; it becomes the link's current one
    pub fn delivery(&mut self, link: LinkId, tag: Vec<u8>) -> Result<DeliveryId> {
        let Some(l) = self.links.get_mut(&link).filter(|l| !l.freed) else {
            return Err(Error::Custom(format!("Unknown link {:?}", link)));
        };
        if l.role != Role::Sender {
            return Err(Error::Custom("Deliveries are created on senders".to_string()));
        }
        let id = DeliveryId(self.next_delivery);
        self.next_delivery = self.next_delivery.wrapping_add(1);
        if l.current.is_none() {
            l.current = Some(id);
        }
        self.deliveries.insert(id, Delivery::outgoing(link, tag));
        Ok(id)
    }

    pub fn current(&self, link: LinkId) -> Option<DeliveryId> {
        self.links.get(&link).and_then(|l| l.current)
    }

    /// Append bytes to the sender's current delivery
    pub fn send(&mut self, link: LinkId, bytes: &[u8]) -> Result<usize> {
        let current = self
            .current(link)
            .ok_or_else(|| Error::Custom("No current delivery".to_string()))?;
        let delivery = self
            .deliveries
            .get_mut(&current)
            .ok_or_else(|| Error::Custom("No current delivery".to_string()))?;
        delivery.bytes.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Read from the receiver's current delivery, `None` at end of stream
    pub fn recv(&mut self, link: LinkId, buf: &mut [u8]) -> Option<usize> {
        let current = self.current(link)?;
        let delivery = self.deliveries.get_mut(&current)?;
        let remaining = delivery.bytes.len() - delivery.offset;
        if remaining == 0 {
            return None;
        }
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&delivery.bytes[delivery.offset..delivery.offset + n]);
        delivery.offset += n;
        Some(n)
    }

    /// Move past the current delivery
    ///
    /// A sender's delivery is queued for transmit. A receiver's delivery is
    /// consumed, using up one unit of credit.
    pub fn advance(&mut self, link: LinkId) -> bool {
        let Some(l) = self.links.get_mut(&link) else {
            return false;
        };
        let Some(current) = l.current else {
            return false;
        };
        match l.role {
            Role::Sender => {
                l.pending.push_back(current);
                l.queued += 1;
                l.current = None;
            }
            Role::Receiver => {
                l.pending.pop_front();
                l.queued = l.queued.saturating_sub(1);
                l.credit = l.credit.saturating_sub(1);
                l.current = l.pending.front().copied();
                if let Some(delivery) = self.deliveries.get_mut(&current) {
                    delivery.consumed = true;
                    delivery.bytes = Vec::new();
                }
            }
        }
        true
    }

    pub fn delivery_ref(&self, id: DeliveryId) -> Option<&Delivery> {
        self.deliveries.get(&id)
    }

    pub fn delivery_link(&self, id: DeliveryId) -> Option<LinkId> {
        self.deliveries.get(&id).map(|d| d.link)
    }

    /// A received delivery at the head of its link, ready to read
    pub fn readable(&self, id: DeliveryId) -> bool {
        self.deliveries
            .get(&id)
            .map(|d| {
                d.role == Role::Receiver
                    && !d.consumed
                    && self.links.get(&d.link).and_then(|l| l.current) == Some(id)
            })
            .unwrap_or(false)
    }

    pub fn updated(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map(|d| d.updated).unwrap_or(false)
    }

    /// Acknowledge a remote update
    pub fn clear(&mut self, id: DeliveryId) {
        if let Some(delivery) = self.deliveries.get_mut(&id) {
            delivery.updated = false;
        }
    }

    pub fn local_disposition(&self, id: DeliveryId) -> Option<Disposition> {
        self.deliveries.get(&id).and_then(|d| d.local_state)
    }

    pub fn remote_disposition(&self, id: DeliveryId) -> Option<Disposition> {
        self.deliveries.get(&id).and_then(|d| d.remote_state)
    }

    pub fn remote_settled(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map(|d| d.remote_settled).unwrap_or(false)
    }

    /// Whether the delivery is still held locally, unsent
    pub fn buffered(&self, id: DeliveryId) -> bool {
        self.deliveries.get(&id).map(Delivery::is_buffered).unwrap_or(false)
    }

    /// Set the local outcome of a delivery
    pub fn update(&mut self, id: DeliveryId, state: Disposition) {
        if let Some(delivery) = self.deliveries.get_mut(&id) {
            if delivery.local_settled {
                return;
            }
            delivery.local_state = Some(state);
            if !delivery.remote_settled && !delivery.settled_on_wire {
                delivery.disposition_pending = true;
            }
        }
    }

    /// Settle locally; the delivery is forgotten once the peer has been told
    pub fn settle(&mut self, id: DeliveryId) {
        let Some(delivery) = self.deliveries.get_mut(&id) else {
            return;
        };
        delivery.local_settled = true;
        if delivery.is_buffered() {
            return;
        }
        if delivery.remote_settled || delivery.settled_on_wire || delivery.wire_id.is_none() {
            self.remove_delivery(id);
        } else {
            delivery.disposition_pending = true;
        }
    }

    /// Deliveries on a link that are not yet settled locally, oldest first
    pub fn unsettled(&self, link: LinkId) -> Vec<DeliveryId> {
        self.deliveries
            .iter()
            .filter(|(_, d)| d.link == link && !d.local_settled)
            .map(|(id, _)| *id)
            .collect()
    }

    /// First delivery needing attention: remotely updated or readable
    pub fn work_head(&self) -> Option<DeliveryId> {
        self.deliveries
            .keys()
            .copied()
            .find(|id| self.is_work(*id))
    }

    pub fn work_next(&self, after: DeliveryId) -> Option<DeliveryId> {
        self.deliveries
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(id, _)| *id)
            .find(|id| self.is_work(*id))
    }

    fn is_work(&self, id: DeliveryId) -> bool {
        self.updated(id) || self.readable(id)
    }

    fn remove_delivery(&mut self, id: DeliveryId) {
        let Some(delivery) = self.deliveries.remove(&id) else {
            return;
        };
        if let Some(wire_id) = delivery.wire_id {
            let ids = match delivery.role {
                Role::Sender => &mut self.outgoing_ids,
                Role::Receiver => &mut self.incoming_ids,
            };
            ids.remove(&wire_id);
        }
        if let Some(link) = self.links.get_mut(&delivery.link) {
            if link.current == Some(id) {
                link.current = None;
            }
            if let Some(pos) = link.pending.iter().position(|d| *d == id) {
                link.pending.remove(pos);
                link.queued = link.queued.saturating_sub(1);
            }
        }
    }
}
