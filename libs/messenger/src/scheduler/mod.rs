//! Receiver credit scheduling
//!
//! The scheduler owns a pool of ungranted credit and hands it out to receiver
//! links in arrival order. Every registered receiver sits in exactly one of
//! two queues: `blocked` (no credit outstanding on the wire) or `credited`.
//! When there is not enough credit to unblock everyone, credited links are
//! asked to drain after a grace period so their unused credit can be
//! redistributed.

use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

mod queue;

pub use queue::FifoSet;

/// Grace period before credit is reclaimed from credited links
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A link is topped up once its outstanding credit falls below this share
pub const DEFAULT_TOP_UP_RATIO: f64 = 0.2;

pub const DEFAULT_BATCH: u32 = 1024;

/// How the credit pool is sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// The application asked for a fixed number of messages
    Explicit,
    /// Keep `receivers * batch` messages in flight or buffered
    Auto { batch: u32 },
}

/// The receiver links the scheduler hands credit to
///
/// Implemented over the protocol engine by the messenger and by mocks in
/// tests.
pub trait LinkCredit<K> {
    /// Credit the peer may still use
    fn remote_credit(&self, link: &K) -> u32;

    /// Credit granted to the link and not yet consumed locally
    fn credit(&self, link: &K) -> u32;

    fn flow(&mut self, link: &K, credit: u32);

    fn drain(&self, link: &K) -> bool;

    fn set_drain(&mut self, link: &K, drain: bool);

    /// Drain requested and still waiting for the peer
    fn draining(&self, link: &K) -> bool;

    /// Take the credit the peer gave back
    fn drained(&mut self, link: &K) -> u32;

    /// Push pending protocol work for the link out now
    fn process(&mut self, link: &K);
}

#[derive(Debug)]
pub struct CreditScheduler<K> {
    mode: CreditMode,
    credit: u32,
    distributed: u32,
    receivers: u32,
    draining: u32,
    blocked: FifoSet<K>,
    credited: FifoSet<K>,
    next_drain: Option<Instant>,
    drain_grace: Duration,
    top_up_ratio: f64,
}

impl<K: Clone + Eq + Hash> Default for CreditScheduler<K> {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_GRACE, DEFAULT_TOP_UP_RATIO)
    }
}

impl<K: Clone + Eq + Hash> CreditScheduler<K> {
    pub fn new(drain_grace: Duration, top_up_ratio: f64) -> Self {
        Self {
            mode: CreditMode::Explicit,
            credit: 0,
            distributed: 0,
            receivers: 0,
            draining: 0,
            blocked: FifoSet::new(),
            credited: FifoSet::new(),
            next_drain: None,
            drain_grace,
            top_up_ratio,
        }
    }

    /// Aim for `n` messages in total
    ///
    /// Credit already on the wire is never revoked; only the ungranted part
    /// of the pool is adjusted.
    pub fn set_explicit(&mut self, n: u32) {
        self.mode = CreditMode::Explicit;
        self.credit = n.saturating_sub(self.distributed);
    }

    pub fn set_auto(&mut self, batch: u32) {
        self.mode = CreditMode::Auto { batch };
    }

    pub fn mode(&self) -> CreditMode {
        self.mode
    }

    /// Ungranted credit
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Granted credit not yet consumed
    pub fn distributed(&self) -> u32 {
        self.distributed
    }

    pub fn receiving(&self) -> u32 {
        self.credit + self.distributed
    }

    pub fn receivers(&self) -> u32 {
        self.receivers
    }

    pub fn draining(&self) -> u32 {
        self.draining
    }

    pub fn next_drain(&self) -> Option<Instant> {
        self.next_drain
    }

    pub fn is_blocked(&self, link: &K) -> bool {
        self.blocked.contains(link)
    }

    pub fn is_credited(&self, link: &K) -> bool {
        self.credited.contains(link)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &K> {
        self.blocked.iter()
    }

    pub fn credited(&self) -> impl Iterator<Item = &K> {
        self.credited.iter()
    }

    /// Share of the total credit each receiver may hold, at least one
    pub fn fair_share(&self) -> u32 {
        if self.receivers == 0 {
            0
        } else {
            ((self.credit + self.distributed) / self.receivers).max(1)
        }
    }

    /// Start scheduling a newly opened receiver; it waits in `blocked`
    pub fn add_receiver(&mut self, link: K) {
        if self.blocked.contains(&link) || self.credited.contains(&link) {
            return;
        }
        self.receivers += 1;
        self.blocked.push_back(link);
    }

    /// Forget a receiver and return its unconsumed credit to the pool
    pub fn remove_receiver<L: LinkCredit<K>>(&mut self, links: &mut L, link: &K) {
        if !self.blocked.contains(link) && !self.credited.contains(link) {
            return;
        }

        let unused = links.credit(link);
        if unused > 0 {
            self.credit += unused;
            self.distributed = self.distributed.saturating_sub(unused);
        }

        self.receivers = self.receivers.saturating_sub(1);
        if links.drain(link) {
            links.set_drain(link, false);
            self.draining = self.draining.saturating_sub(1);
        }
        self.credited.remove(link);
        self.blocked.remove(link);
    }

    /// Reconcile the pool with the links
    ///
    /// `buffered` is the number of received messages not yet taken by the
    /// application. Returns whether any link was granted credit or asked to
    /// drain.
    pub fn flow<L: LinkCredit<K>>(&mut self, links: &mut L, buffered: u32, now: Instant) -> bool {
        if self.receivers == 0 {
            return false;
        }

        if let CreditMode::Auto { batch } = self.mode {
            let max = self.receivers.saturating_mul(batch);
            let used = self.distributed + buffered;
            if max > used {
                self.credit = max - used;
            }
        }

        if self.draining > 0 {
            self.reclaim_drained(links);
        }

        let batch = self.fair_share();
        let mut updated = false;
        while self.credit > 0 {
            let Some(link) = self.blocked.pop_front() else {
                break;
            };
            let grant = self.credit.min(batch);
            links.flow(&link, grant);
            self.credit -= grant;
            self.distributed += grant;
            trace!(grant, pool = self.credit, "granted credit");
            links.process(&link);
            self.credited.push_back(link);
            updated = true;
        }

        if self.blocked.is_empty() {
            self.next_drain = None;
        } else if self.draining == 0 {
            match self.next_drain {
                None => self.next_drain = Some(now + self.drain_grace),
                Some(deadline) if deadline <= now => {
                    self.next_drain = None;
                    updated |= self.start_drain(links, batch);
                }
                Some(_) => {}
            }
        }

        updated
    }

    /// A message was consumed from `link`
    ///
    /// Tops the link up if it runs low while nobody else waits, and moves it
    /// to `blocked` once its credit on the wire is used up.
    pub fn consumed<L: LinkCredit<K>>(&mut self, links: &mut L, link: &K) {
        self.distributed = self.distributed.saturating_sub(1);
        self.top_up(links, link);

        if !self.blocked.contains(link) && links.remote_credit(link) == 0 {
            self.credited.remove(link);
            if links.drain(link) {
                links.set_drain(link, false);
                self.draining = self.draining.saturating_sub(1);
            }
            self.blocked.push_back(link.clone());
        }
    }

    /// Grant more credit to a single link without a full [`flow`](Self::flow) pass
    pub fn top_up<L: LinkCredit<K>>(&mut self, links: &mut L, link: &K) -> bool {
        if links.drain(link) || !self.blocked.is_empty() || self.credit == 0 {
            return false;
        }

        let max = self.fair_share();
        let low = (max as f64 * self.top_up_ratio + 0.5) as u32;
        let remote = links.remote_credit(link);
        if remote >= low {
            return false;
        }

        let more = self.credit.min(max.saturating_sub(remote));
        if more == 0 {
            return false;
        }
        links.flow(link, more);
        self.credit -= more;
        self.distributed += more;
        trace!(more, pool = self.credit, "topped up link");
        true
    }

    // Links whose drain completed hand back their unused credit and queue up again
    fn reclaim_drained<L: LinkCredit<K>>(&mut self, links: &mut L) {
        let finished: Vec<K> = self
            .credited
            .iter()
            .filter(|link| links.drain(link) && !links.draining(link))
            .cloned()
            .collect();

        for link in finished {
            let drained = links.drained(&link);
            self.distributed = self.distributed.saturating_sub(drained);
            self.credit += drained;
            links.set_drain(&link, false);
            self.draining = self.draining.saturating_sub(1);
            self.credited.remove(&link);
            self.blocked.push_back(link);
            debug!(drained, pool = self.credit, "drain complete");
        }
    }

    // Ask credited links, oldest first, to give back enough for the blocked ones
    fn start_drain<L: LinkCredit<K>>(&mut self, links: &mut L, batch: u32) -> bool {
        let mut needed = self.blocked.len() as i64 * batch as i64;
        let candidates: Vec<K> = self.credited.iter().cloned().collect();
        let mut updated = false;

        for link in candidates {
            if !links.drain(&link) {
                links.set_drain(&link, true);
                needed -= links.remote_credit(&link) as i64;
                self.draining += 1;
                links.process(&link);
                updated = true;
            }
            if needed <= 0 {
                break;
            }
        }

        if updated {
            debug!(
                draining = self.draining,
                blocked = self.blocked.len(),
                "draining credit"
            );
        }
        updated
    }
}
