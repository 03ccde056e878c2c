use courier_fabric::{
    error::Error,
    frame::{self, Frame, FrameDecoder, MAX_FRAME_SIZE},
    Condition, Connection, Disposition, LinkId, Role, SettleMode, State, Terminus,
};

/// Shuttle bytes between two engines until neither has anything to say
fn pump(a: &mut Connection, b: &mut Connection) {
    for _ in 0..32 {
        let ab = a.output().unwrap();
        let ba = b.output().unwrap();
        if ab.is_empty() && ba.is_empty() {
            return;
        }
        b.input(&ab).unwrap();
        a.input(&ba).unwrap();
    }
    panic!("engines never went quiet");
}

/// Accept every endpoint the peer opened, mirroring its termini
fn accept_all(conn: &mut Connection) {
    conn.open();
    for session in conn.session_ids() {
        if conn.session(session).unwrap().local_state() == State::Uninit {
            conn.open_session(session);
        }
    }
    for link in conn.link_ids() {
        let l = conn.link(link).unwrap();
        if l.local_state() == State::Uninit {
            let source = l.remote_source().clone();
            let target = l.remote_target().clone();
            conn.set_source(link, source);
            conn.set_target(link, target);
            conn.open_link(link);
        }
    }
}

/// Client `a` with a sender to "queue", server `b` with the matching receiver
fn linked() -> (Connection, Connection, LinkId, LinkId) {
    let mut a = Connection::new("a");
    let mut b = Connection::new("b");

    a.open();
    let session = a.new_session();
    a.open_session(session);
    let sender = a.new_link(session, Role::Sender, "sender-0").unwrap();
    a.set_target(sender, Terminus::address("queue"));
    a.open_link(sender);
    pump(&mut a, &mut b);

    accept_all(&mut b);
    pump(&mut a, &mut b);

    let receiver = b.link_ids()[0];
    (a, b, sender, receiver)
}

fn queue_message(conn: &mut Connection, link: LinkId, tag: &[u8], body: &[u8]) {
    conn.delivery(link, tag.to_vec()).unwrap();
    conn.send(link, body).unwrap();
    assert!(conn.advance(link));
}

#[test]
fn handshake_attaches_matching_links() {
    let (a, b, sender, receiver) = linked();

    assert_eq!(a.remote_state(), State::Active);
    assert_eq!(a.remote_container(), Some("b"));
    assert_eq!(b.remote_container(), Some("a"));

    let s = a.link(sender).unwrap();
    assert_eq!(s.remote_state(), State::Active);
    assert_eq!(s.remote_target().address.as_deref(), Some("queue"));

    let r = b.link(receiver).unwrap();
    assert!(r.is_receiver());
    assert_eq!(r.name(), "sender-0");
    assert_eq!(r.target().address.as_deref(), Some("queue"));
}

#[test]
fn transfers_are_bounded_by_credit() {
    let (mut a, mut b, sender, receiver) = linked();

    for (tag, body) in [(b"1", b"one"), (b"2", b"two"), (b"3", b"six")] {
        queue_message(&mut a, sender, tag, body);
    }
    assert_eq!(a.queued(sender), 3);
    pump(&mut a, &mut b);
    assert_eq!(b.queued(receiver), 0);

    b.flow(receiver, 2);
    pump(&mut a, &mut b);

    assert_eq!(a.credit(sender), 0);
    assert_eq!(a.queued(sender), 1);
    assert_eq!(b.queued(receiver), 2);
    assert_eq!(b.remote_credit(receiver), 0);

    let head = b.current(receiver).unwrap();
    assert!(b.readable(head));
    assert_eq!(b.delivery_ref(head).unwrap().tag(), b"1");
    assert_eq!(b.delivery_ref(head).unwrap().pending(), 3);

    let mut buf = [0u8; 3];
    assert_eq!(b.recv(receiver, &mut buf), Some(3));
    assert_eq!(&buf, b"one");
    assert_eq!(b.recv(receiver, &mut [0u8; 1]), None);

    assert!(b.advance(receiver));
    assert_eq!(b.credit(receiver), 1);
    assert_eq!(b.queued(receiver), 1);
    assert!(!b.readable(head));
    assert_eq!(b.work_head(), b.current(receiver));
}

#[test]
fn drain_returns_unused_credit_to_receiver() {
    let (mut a, mut b, sender, receiver) = linked();

    b.flow(receiver, 5);
    pump(&mut a, &mut b);
    assert_eq!(a.credit(sender), 5);

    b.set_drain(receiver, true);
    pump(&mut a, &mut b);
    assert!(b.draining(receiver));

    assert_eq!(a.drained(sender), 5);
    assert_eq!(a.credit(sender), 0);
    pump(&mut a, &mut b);

    assert!(!b.draining(receiver));
    assert_eq!(b.drained(receiver), 5);
    assert_eq!(b.drained(receiver), 0);
    assert_eq!(b.remote_credit(receiver), 0);
}

#[test]
fn sender_with_backlog_does_not_drain() {
    let (mut a, mut b, sender, receiver) = linked();

    b.flow(receiver, 1);
    b.set_drain(receiver, true);
    queue_message(&mut a, sender, b"1", b"x");
    pump(&mut a, &mut b);

    // the queued message used up the credit instead
    assert_eq!(a.drained(sender), 0);
    assert_eq!(b.queued(receiver), 1);
    assert!(!b.draining(receiver));
}

#[test]
fn dispositions_reach_the_sender() {
    let (mut a, mut b, sender, receiver) = linked();

    queue_message(&mut a, sender, b"1", b"payload");
    let outgoing = a.unsettled(sender)[0];
    assert!(a.buffered(outgoing));

    b.flow(receiver, 1);
    pump(&mut a, &mut b);
    assert!(!a.buffered(outgoing));

    let incoming = b.current(receiver).unwrap();
    b.advance(receiver);
    b.update(incoming, Disposition::Accepted);
    b.settle(incoming);
    pump(&mut a, &mut b);
    assert!(b.delivery_ref(incoming).is_none());

    assert_eq!(a.work_head(), Some(outgoing));
    assert!(a.updated(outgoing));
    assert_eq!(a.remote_disposition(outgoing), Some(Disposition::Accepted));
    assert!(a.remote_settled(outgoing));

    a.clear(outgoing);
    assert_eq!(a.work_head(), None);
    a.settle(outgoing);
    assert!(a.delivery_ref(outgoing).is_none());
}

#[test]
fn presettled_links_skip_dispositions() {
    let mut a = Connection::new("a");
    let mut b = Connection::new("b");
    a.open();
    let session = a.new_session();
    a.open_session(session);
    let sender = a.new_link(session, Role::Sender, "sender-0").unwrap();
    a.set_snd_settle(sender, SettleMode::Settled);
    a.open_link(sender);
    pump(&mut a, &mut b);
    accept_all(&mut b);
    let receiver = b.link_ids()[0];
    assert_eq!(b.link(receiver).unwrap().remote_snd_settle(), SettleMode::Settled);

    b.flow(receiver, 1);
    queue_message(&mut a, sender, b"1", b"x");
    pump(&mut a, &mut b);

    let incoming = b.current(receiver).unwrap();
    assert!(b.remote_settled(incoming));

    let outgoing = a.unsettled(sender)[0];
    a.settle(outgoing);
    assert!(a.delivery_ref(outgoing).is_none());
    assert!(a.quiesced());
}

#[test]
fn remote_detach_is_reported() {
    let (mut a, mut b, sender, receiver) = linked();

    b.close_link(receiver);
    pump(&mut a, &mut b);

    assert_eq!(a.link(sender).unwrap().remote_state(), State::Closed);
    a.close_link(sender);
    a.free_link(sender);
    pump(&mut a, &mut b);
    assert!(a.link(sender).is_none());

    b.free_link(receiver);
    assert!(b.link(receiver).is_none());
}

#[test]
fn redirect_condition_and_close_handshake() {
    let (mut a, mut b, _, _) = linked();

    b.close_with(Condition::redirect("elsewhere", "6000"));
    pump(&mut a, &mut b);

    assert_eq!(a.remote_state(), State::Closed);
    let condition = a.remote_condition().unwrap();
    assert!(condition.is_redirect());
    let redirect = condition.redirect.as_ref().unwrap();
    assert_eq!(redirect.host.as_deref(), Some("elsewhere"));
    assert_eq!(redirect.port.as_deref(), Some("6000"));
    assert!(!b.transport_closed());

    a.close();
    pump(&mut a, &mut b);
    assert!(a.transport_closed());
    assert!(b.transport_closed());
}

#[test]
fn reset_replays_endpoints_on_a_new_peer() {
    let (mut a, mut b, sender, receiver) = linked();
    b.flow(receiver, 3);
    pump(&mut a, &mut b);
    queue_message(&mut a, sender, b"1", b"late");

    a.reset();
    assert_eq!(a.local_state(), State::Uninit);
    assert_eq!(a.remote_state(), State::Uninit);
    assert_eq!(a.credit(sender), 0);
    let link = a.link(sender).unwrap();
    assert_eq!(link.local_state(), State::Active);
    assert_eq!(link.remote_state(), State::Uninit);

    let mut c = Connection::new("c");
    a.open();
    pump(&mut a, &mut c);
    accept_all(&mut c);
    pump(&mut a, &mut c);

    assert_eq!(a.remote_container(), Some("c"));
    assert_eq!(a.link(sender).unwrap().remote_state(), State::Active);

    let fresh = c.link_ids()[0];
    c.flow(fresh, 1);
    pump(&mut a, &mut c);
    assert_eq!(c.queued(fresh), 1);
    assert_eq!(a.queued(sender), 0);
}

#[test]
fn quiesced_tracks_pending_output() {
    let mut a = Connection::new("a");
    assert!(a.quiesced());
    a.open();
    assert!(!a.quiesced());
    a.output().unwrap();
    assert!(a.quiesced());
}

#[test]
fn oversized_frame_is_rejected() {
    let mut decoder = FrameDecoder::new();
    decoder.push(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());

    match decoder.next_frame().unwrap_err() {
        Error::InvalidFrame(msg) => assert!(msg.contains("too large")),
        other => panic!("Expected InvalidFrame error, got {:?}", other),
    }
}

#[test]
fn decoder_waits_for_whole_frames() {
    let mut bytes = Vec::new();
    frame::encode(&Frame::Close { error: None }, &mut bytes).unwrap();

    let mut decoder = FrameDecoder::new();
    let (head, tail) = bytes.split_at(bytes.len() - 1);
    decoder.push(head);
    assert_eq!(decoder.next_frame().unwrap(), None);
    decoder.push(tail);
    assert_eq!(
        decoder.next_frame().unwrap(),
        Some(Frame::Close { error: None })
    );
    assert!(decoder.is_empty());
}
