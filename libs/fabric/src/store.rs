//! In-memory message store
//!
//! Holds encoded payloads keyed by address until they are sent (outgoing)
//! or consumed (incoming). Entries are tracked by sequence number for status
//! queries while they stay inside the store's window.

use std::collections::{BTreeMap, HashMap, VecDeque};

use courier_core::{Status, UpdateFlags};

use crate::engine::{ConnectionId, DeliveryId};
use crate::frame::Disposition;

/// Store-local identity of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Protocol delivery an entry is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryRef {
    pub connection: ConnectionId,
    pub delivery: DeliveryId,
}

/// Work for the owner of the deliveries, produced by store updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Give the delivery a local outcome, if it has none yet.
    /// `None` mirrors the remote outcome.
    Update {
        entry: EntryId,
        delivery: DeliveryRef,
        outcome: Option<Disposition>,
    },
    Settle {
        delivery: DeliveryRef,
    },
}

#[derive(Debug)]
pub struct Entry<C> {
    address: String,
    bytes: Vec<u8>,
    status: Status,
    delivery: Option<DeliveryRef>,
    context: Option<C>,
    seq: Option<u32>,
    queued: bool,
}

impl<C> Entry<C> {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn delivery(&self) -> Option<DeliveryRef> {
        self.delivery
    }

    pub fn context(&self) -> Option<&C> {
        self.context.as_ref()
    }

    /// Tracking sequence, once assigned
    pub fn sequence(&self) -> Option<u32> {
        self.seq
    }
}

/// FIFO store with per-address streams and a tracking window
///
/// `C` is an opaque per-entry context supplied by the owner.
#[derive(Debug)]
pub struct Store<C = ()> {
    entries: HashMap<EntryId, Entry<C>>,
    streams: HashMap<String, VecDeque<EntryId>>,
    queue: VecDeque<EntryId>,
    tracked: BTreeMap<u32, EntryId>,
    by_delivery: HashMap<DeliveryRef, EntryId>,
    next_id: u64,
    lwm: u32,
    hwm: u32,
    window: u32,
    actions: Vec<DeliveryAction>,
}

impl<C> Default for Store<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            streams: HashMap::new(),
            queue: VecDeque::new(),
            tracked: BTreeMap::new(),
            by_delivery: HashMap::new(),
            next_id: 0,
            lwm: 0,
            hwm: 0,
            window: 0,
            actions: Vec::new(),
        }
    }
}

impl<C> Store<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries still queued
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn set_window(&mut self, window: u32) {
        self.window = window;
        self.gc();
    }

    /// Queue an encoded payload under an address
    pub fn put(&mut self, address: &str, bytes: Vec<u8>) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                address: address.to_string(),
                bytes,
                status: Status::Unknown,
                delivery: None,
                context: None,
                seq: None,
                queued: true,
            },
        );
        self.streams
            .entry(address.to_string())
            .or_default()
            .push_back(id);
        self.queue.push_back(id);
        id
    }

    /// Oldest queued entry for the address, or overall for `None`
    pub fn get(&self, address: Option<&str>) -> Option<EntryId> {
        match address {
            Some(address) => self.streams.get(address).and_then(|s| s.front().copied()),
            None => self.queue.front().copied(),
        }
    }

    pub fn entry(&self, id: EntryId) -> Option<&Entry<C>> {
        self.entries.get(&id)
    }

    /// Entry for a tracking sequence, while it is inside the window
    pub fn lookup(&self, seq: u32) -> Option<EntryId> {
        self.tracked.get(&seq).copied()
    }

    /// Assign the next tracking sequence
    pub fn track(&mut self, id: EntryId) -> Option<u32> {
        let entry = self.entries.get_mut(&id)?;
        if let Some(seq) = entry.seq {
            return Some(seq);
        }
        let seq = self.hwm;
        self.hwm = self.hwm.wrapping_add(1);
        entry.seq = Some(seq);
        self.tracked.insert(seq, id);
        self.gc();
        Some(seq)
    }

    /// Dequeue an entry; it is forgotten unless still tracked
    pub fn free(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.queued {
            entry.queued = false;
            entry.bytes = Vec::new();
            let address = entry.address.clone();
            if let Some(stream) = self.streams.get_mut(&address) {
                stream.retain(|e| *e != id);
                if stream.is_empty() {
                    self.streams.remove(&address);
                }
            }
            self.queue.retain(|e| *e != id);
        }
        self.finalize(id);
    }

    pub fn bind(&mut self, id: EntryId, delivery: DeliveryRef) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(old) = entry.delivery.replace(delivery) {
                self.by_delivery.remove(&old);
            }
            self.by_delivery.insert(delivery, id);
        }
    }

    /// Drop the delivery binding without settling it
    pub fn unbind(&mut self, id: EntryId) {
        if let Some(delivery) = self.entries.get_mut(&id).and_then(|e| e.delivery.take()) {
            self.by_delivery.remove(&delivery);
        }
    }

    pub fn entry_for(&self, delivery: DeliveryRef) -> Option<EntryId> {
        self.by_delivery.get(&delivery).copied()
    }

    pub fn set_context(&mut self, id: EntryId, context: C) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.context = Some(context);
        }
    }

    /// Set the status; terminal statuses are final
    pub fn set_status(&mut self, id: EntryId, status: Status) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if !entry.status.is_terminal() {
                entry.status = status;
            }
        }
    }

    /// Apply an outcome and/or settlement to a tracked entry
    ///
    /// With [`UpdateFlags::CUMULATIVE`] every tracked entry from the low
    /// water mark up to `seq` is updated. `match_remote` mirrors the peer's
    /// outcome instead of `outcome`. Returns false if `seq` is not tracked.
    pub fn update(
        &mut self,
        seq: u32,
        outcome: Option<Disposition>,
        flags: UpdateFlags,
        settle: bool,
        match_remote: bool,
    ) -> bool {
        if !self.tracked.contains_key(&seq) {
            return false;
        }

        let targets: Vec<(u32, EntryId)> = if flags.is_cumulative() {
            self.tracked
                .iter()
                .filter(|(s, _)| self.within(**s, seq))
                .map(|(s, id)| (*s, *id))
                .collect()
        } else {
            vec![(seq, self.tracked[&seq])]
        };

        for (s, id) in targets {
            let delivery = self.entries.get(&id).and_then(|e| e.delivery);
            if let Some(delivery) = delivery {
                if match_remote || outcome.is_some() {
                    self.actions.push(DeliveryAction::Update {
                        entry: id,
                        delivery,
                        outcome: if match_remote { None } else { outcome },
                    });
                }
            }
            if settle {
                if let Some(delivery) = delivery {
                    self.unbind(id);
                    self.actions.push(DeliveryAction::Settle { delivery });
                }
                self.tracked.remove(&s);
                self.finalize(id);
            }
        }

        while self.lwm != self.hwm && !self.tracked.contains_key(&self.lwm) {
            self.lwm = self.lwm.wrapping_add(1);
        }
        true
    }

    /// Delivery work produced since the last call
    pub fn take_actions(&mut self) -> Vec<DeliveryAction> {
        std::mem::take(&mut self.actions)
    }

    // seq lies in [lwm, upto] in wrapping order
    fn within(&self, seq: u32, upto: u32) -> bool {
        seq.wrapping_sub(self.lwm) <= upto.wrapping_sub(self.lwm)
    }

    fn gc(&mut self) {
        while self.hwm.wrapping_sub(self.lwm) > self.window {
            if let Some(id) = self.tracked.remove(&self.lwm) {
                self.finalize(id);
            }
            self.lwm = self.lwm.wrapping_add(1);
        }
    }

    // Forget an entry that is neither queued nor tracked; settle its delivery
    fn finalize(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let tracked = entry.seq.map(|s| self.tracked.contains_key(&s)).unwrap_or(false);
        if entry.queued || tracked {
            return;
        }
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(delivery) = entry.delivery {
                self.by_delivery.remove(&delivery);
                self.actions.push(DeliveryAction::Settle { delivery });
            }
        }
    }
}
