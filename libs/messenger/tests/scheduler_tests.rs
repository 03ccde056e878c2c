use std::collections::HashMap;
use std::time::{Duration, Instant};

use courier_messenger::scheduler::{CreditMode, CreditScheduler, FifoSet, LinkCredit};
use proptest::prelude::*;

#[derive(Debug, Default)]
struct MockLink {
    credit: u32,
    queued: u32,
    drain: bool,
    drained: u32,
    processed: u32,
}

/// Receiver links that behave like the engine's: arrivals use up remote
/// credit, consumption uses up local credit.
#[derive(Debug, Default)]
struct MockLinks {
    links: HashMap<u32, MockLink>,
}

impl MockLinks {
    fn with(n: u32) -> Self {
        let mut links = Self::default();
        for k in 0..n {
            links.links.insert(k, MockLink::default());
        }
        links
    }

    fn link(&self, k: u32) -> &MockLink {
        &self.links[&k]
    }

    /// The peer sends one message
    fn arrive(&mut self, k: u32) {
        self.links.get_mut(&k).unwrap().queued += 1;
    }

    /// The application reads one message
    fn consume(&mut self, scheduler: &mut CreditScheduler<u32>, k: u32) {
        let link = self.links.get_mut(&k).unwrap();
        link.credit -= 1;
        link.queued -= 1;
        scheduler.consumed(self, &k);
    }

    /// The peer answers a drain by giving back what it did not use
    fn peer_drain(&mut self, k: u32) {
        let link = self.links.get_mut(&k).unwrap();
        let unused = link.credit - link.queued;
        link.credit -= unused;
        link.drained += unused;
    }
}

impl LinkCredit<u32> for MockLinks {
    fn remote_credit(&self, k: &u32) -> u32 {
        let link = &self.links[k];
        link.credit - link.queued
    }

    fn credit(&self, k: &u32) -> u32 {
        self.links[k].credit
    }

    fn flow(&mut self, k: &u32, credit: u32) {
        self.links.get_mut(k).unwrap().credit += credit;
    }

    fn drain(&self, k: &u32) -> bool {
        self.links[k].drain
    }

    fn set_drain(&mut self, k: &u32, drain: bool) {
        self.links.get_mut(k).unwrap().drain = drain;
    }

    fn draining(&self, k: &u32) -> bool {
        self.links[k].drain && self.remote_credit(k) > 0
    }

    fn drained(&mut self, k: &u32) -> u32 {
        std::mem::take(&mut self.links.get_mut(k).unwrap().drained)
    }

    fn process(&mut self, k: &u32) {
        self.links.get_mut(k).unwrap().processed += 1;
    }
}

fn scheduler_with(receivers: u32) -> CreditScheduler<u32> {
    let mut scheduler = CreditScheduler::default();
    for k in 0..receivers {
        scheduler.add_receiver(k);
    }
    scheduler
}

#[test]
fn explicit_credit_is_split_fairly() {
    let mut links = MockLinks::with(3);
    let mut scheduler = scheduler_with(3);
    scheduler.set_explicit(10);

    assert!(scheduler.flow(&mut links, 0, Instant::now()));
    for k in 0..3 {
        assert_eq!(links.remote_credit(&k), 3);
        assert_eq!(links.link(k).processed, 1);
        assert!(scheduler.is_credited(&k));
    }
    assert_eq!(scheduler.distributed(), 9);
    assert_eq!(scheduler.credit(), 1);
    assert_eq!(scheduler.next_drain(), None);
}

#[test]
fn receivers_are_credited_in_arrival_order() {
    let mut links = MockLinks::with(3);
    let mut scheduler = scheduler_with(3);
    scheduler.set_explicit(2);

    let now = Instant::now();
    assert!(scheduler.flow(&mut links, 0, now));
    assert_eq!(links.remote_credit(&0), 1);
    assert_eq!(links.remote_credit(&1), 1);
    assert_eq!(links.remote_credit(&2), 0);
    assert_eq!(scheduler.blocked().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(scheduler.credited().copied().collect::<Vec<_>>(), vec![0, 1]);
}

#[test]
fn drain_starts_after_the_grace_period() {
    let grace = Duration::from_millis(250);
    let mut links = MockLinks::with(3);
    let mut scheduler = CreditScheduler::new(grace, 0.2);
    for k in 0..3 {
        scheduler.add_receiver(k);
    }
    scheduler.set_explicit(2);

    let start = Instant::now();
    scheduler.flow(&mut links, 0, start);
    assert_eq!(scheduler.next_drain(), Some(start + grace));

    // Too early: nothing changes
    assert!(!scheduler.flow(&mut links, 0, start + grace / 2));
    assert_eq!(scheduler.draining(), 0);

    // The oldest credited link is asked for its credit back
    assert!(scheduler.flow(&mut links, 0, start + grace));
    assert_eq!(scheduler.draining(), 1);
    assert!(links.drain(&0));
    assert!(!links.drain(&1));
    assert_eq!(links.link(0).processed, 2);

    // Once the peer gives it back it goes to the blocked receiver
    links.peer_drain(0);
    assert!(scheduler.flow(&mut links, 0, start + grace));
    assert_eq!(scheduler.draining(), 0);
    assert!(!links.drain(&0));
    assert_eq!(links.remote_credit(&2), 1);
    assert!(scheduler.is_blocked(&0));
    assert_eq!(scheduler.credited().copied().collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn drain_timer_is_cleared_when_nobody_waits() {
    let mut links = MockLinks::with(2);
    let mut scheduler = scheduler_with(2);
    scheduler.set_explicit(1);

    let now = Instant::now();
    scheduler.flow(&mut links, 0, now);
    assert!(scheduler.next_drain().is_some());

    scheduler.set_explicit(2);
    assert!(scheduler.flow(&mut links, 0, now));
    assert_eq!(scheduler.next_drain(), None);
}

#[test]
fn exhausted_link_is_blocked_again() {
    let mut links = MockLinks::with(1);
    let mut scheduler = scheduler_with(1);
    scheduler.set_explicit(1);
    scheduler.flow(&mut links, 0, Instant::now());
    assert!(scheduler.is_credited(&0));

    links.arrive(0);
    links.consume(&mut scheduler, 0);
    assert!(scheduler.is_blocked(&0));
    assert!(!scheduler.is_credited(&0));
    assert_eq!(scheduler.distributed(), 0);
}

#[test]
fn auto_mode_keeps_a_batch_in_flight() {
    let mut links = MockLinks::with(1);
    let mut scheduler = scheduler_with(1);
    scheduler.set_auto(1024);
    assert_eq!(scheduler.mode(), CreditMode::Auto { batch: 1024 });

    let now = Instant::now();
    scheduler.flow(&mut links, 0, now);
    assert_eq!(links.remote_credit(&0), 1024);
    assert_eq!(scheduler.receiving(), 1024);

    for _ in 0..900 {
        links.arrive(0);
        links.consume(&mut scheduler, 0);
    }
    assert_eq!(scheduler.distributed(), 124);
    assert_eq!(links.remote_credit(&0), 124);

    scheduler.flow(&mut links, 0, now);
    assert_eq!(scheduler.receiving(), 1024);
    assert_eq!(scheduler.credit(), 900);
}

#[test]
fn auto_mode_counts_buffered_messages() {
    let mut links = MockLinks::with(2);
    let mut scheduler = scheduler_with(2);
    scheduler.set_auto(10);

    scheduler.flow(&mut links, 5, Instant::now());
    assert_eq!(scheduler.receiving(), 15);
    assert_eq!(links.remote_credit(&0), 7);
    assert_eq!(links.remote_credit(&1), 7);
}

#[test]
fn low_link_is_topped_up() {
    let mut links = MockLinks::with(1);
    let mut scheduler = scheduler_with(1);
    scheduler.set_explicit(10);
    scheduler.flow(&mut links, 0, Instant::now());
    scheduler.set_explicit(20);
    assert_eq!(scheduler.credit(), 10);

    for _ in 0..8 {
        links.arrive(0);
        links.consume(&mut scheduler, 0);
    }
    assert_eq!(links.remote_credit(&0), 2);
    assert_eq!(scheduler.credit(), 10);

    links.arrive(0);
    links.consume(&mut scheduler, 0);
    assert_eq!(links.remote_credit(&0), 11);
    assert_eq!(scheduler.credit(), 0);
    assert_eq!(scheduler.distributed(), 11);
}

#[test]
fn draining_link_is_not_topped_up() {
    let mut links = MockLinks::with(1);
    let mut scheduler = scheduler_with(1);
    scheduler.set_explicit(2);
    scheduler.flow(&mut links, 0, Instant::now());
    scheduler.set_explicit(10);
    links.set_drain(&0, true);

    assert!(!scheduler.top_up(&mut links, &0));
    assert_eq!(links.remote_credit(&0), 2);
}

#[test]
fn removed_receiver_returns_its_credit() {
    let mut links = MockLinks::with(2);
    let mut scheduler = scheduler_with(2);
    scheduler.set_explicit(10);
    scheduler.flow(&mut links, 0, Instant::now());
    assert_eq!(scheduler.distributed(), 10);

    scheduler.remove_receiver(&mut links, &0);
    assert_eq!(scheduler.receivers(), 1);
    assert_eq!(scheduler.distributed(), 5);
    assert_eq!(scheduler.credit(), 5);
    assert!(!scheduler.is_credited(&0));

    // Removing twice is harmless
    scheduler.remove_receiver(&mut links, &0);
    assert_eq!(scheduler.receivers(), 1);
}

#[test]
fn adding_a_receiver_twice_counts_once() {
    let mut scheduler = scheduler_with(1);
    scheduler.add_receiver(0);
    assert_eq!(scheduler.receivers(), 1);
    assert_eq!(scheduler.blocked().count(), 1);
}

#[test]
fn explicit_credit_is_not_revoked() {
    let mut links = MockLinks::with(1);
    let mut scheduler = scheduler_with(1);
    scheduler.set_explicit(10);
    scheduler.flow(&mut links, 0, Instant::now());

    scheduler.set_explicit(4);
    assert_eq!(scheduler.credit(), 0);
    assert_eq!(scheduler.distributed(), 10);
}

#[test]
fn fifo_set_keeps_order_without_duplicates() {
    let mut set = FifoSet::new();
    assert!(set.push_back("a"));
    assert!(set.push_back("b"));
    assert!(!set.push_back("a"));
    assert!(set.push_back("c"));
    assert_eq!(set.len(), 3);

    assert!(set.remove(&"b"));
    assert!(!set.remove(&"b"));
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec!["a", "c"]);

    assert_eq!(set.pop_front(), Some("a"));
    assert!(set.push_back("a"));
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec!["c", "a"]);
    assert!(set.contains(&"c"));
}

proptest! {
    #[test]
    fn explicit_flow_never_overcommits(n in 0u32..200, receivers in 1u32..20) {
        let mut links = MockLinks::with(receivers);
        let mut scheduler = scheduler_with(receivers);
        scheduler.set_explicit(n);
        prop_assert!(scheduler.fair_share() >= 1);

        let now = Instant::now();
        scheduler.flow(&mut links, 0, now);
        prop_assert!(scheduler.distributed() <= n);
        prop_assert_eq!(scheduler.credit() + scheduler.distributed(), n);
        if n <= receivers || n % receivers == 0 {
            prop_assert_eq!(scheduler.distributed(), n);
        }

        for k in 0..receivers {
            prop_assert_eq!(scheduler.is_blocked(&k), links.remote_credit(&k) == 0);
            prop_assert!(scheduler.is_blocked(&k) != scheduler.is_credited(&k));
        }

        prop_assert!(!scheduler.flow(&mut links, 0, now));
    }

    #[test]
    fn granted_credit_matches_the_links(n in 0u32..200, receivers in 1u32..20) {
        let mut links = MockLinks::with(receivers);
        let mut scheduler = scheduler_with(receivers);
        scheduler.set_explicit(n);
        scheduler.flow(&mut links, 0, Instant::now());

        let total: u32 = (0..receivers).map(|k| links.remote_credit(&k)).sum();
        prop_assert_eq!(total, scheduler.distributed());
    }
}
