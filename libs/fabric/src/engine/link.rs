use std::collections::VecDeque;

use crate::engine::{DeliveryId, SessionId, State};
use crate::frame::{Condition, Role, SettleMode, Terminus};

#[derive(Debug)]
pub struct Session {
    pub(crate) channel: u16,
    pub(crate) remote_channel: Option<u16>,
    pub(crate) local: State,
    pub(crate) remote: State,
    pub(crate) remote_condition: Option<Condition>,
    pub(crate) begin_sent: bool,
    pub(crate) end_sent: bool,
    pub(crate) freed: bool,
}

impl Session {
    pub(crate) fn new(channel: u16) -> Self {
        Self {
            channel,
            remote_channel: None,
            local: State::Uninit,
            remote: State::Uninit,
            remote_condition: None,
            begin_sent: false,
            end_sent: false,
            freed: false,
        }
    }

    pub fn local_state(&self) -> State {
        self.local
    }

    pub fn remote_state(&self) -> State {
        self.remote
    }

    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    pub(crate) fn needs_end(&self) -> bool {
        self.local == State::Closed && self.begin_sent && !self.end_sent
    }
}

/// One direction of message flow between two termini
///
/// Receivers count `credit` as everything granted and not yet consumed, so
/// the credit still open on the wire is `credit - queued`. Senders count
/// `credit` as transfers they may still emit.
#[derive(Debug)]
pub struct Link {
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) local: State,
    pub(crate) remote: State,
    pub(crate) handle: u32,
    pub(crate) remote_handle: Option<u32>,
    pub(crate) source: Terminus,
    pub(crate) target: Terminus,
    pub(crate) remote_source: Terminus,
    pub(crate) remote_target: Terminus,
    pub(crate) snd_settle: SettleMode,
    pub(crate) remote_snd_settle: SettleMode,
    pub(crate) remote_condition: Option<Condition>,

    pub(crate) credit: u32,
    pub(crate) delivery_count: u32,
    pub(crate) drain: bool,
    pub(crate) drained: u32,
    pub(crate) queued: u32,
    pub(crate) flow_pending: bool,

    pub(crate) current: Option<DeliveryId>,
    // senders: advanced and awaiting transmit; receivers: arrived, not consumed
    pub(crate) pending: VecDeque<DeliveryId>,

    pub(crate) attach_sent: bool,
    pub(crate) detach_sent: bool,
    pub(crate) freed: bool,
}

impl Link {
    pub(crate) fn new(session: SessionId, handle: u32, name: String, role: Role) -> Self {
        Self {
            session,
            name,
            role,
            local: State::Uninit,
            remote: State::Uninit,
            handle,
            remote_handle: None,
            source: Terminus::default(),
            target: Terminus::default(),
            remote_source: Terminus::default(),
            remote_target: Terminus::default(),
            snd_settle: SettleMode::default(),
            remote_snd_settle: SettleMode::default(),
            remote_condition: None,
            credit: 0,
            delivery_count: 0,
            drain: false,
            drained: 0,
            queued: 0,
            flow_pending: false,
            current: None,
            pending: VecDeque::new(),
            attach_sent: false,
            detach_sent: false,
            freed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_sender(&self) -> bool {
        self.role == Role::Sender
    }

    pub fn is_receiver(&self) -> bool {
        self.role == Role::Receiver
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn local_state(&self) -> State {
        self.local
    }

    pub fn remote_state(&self) -> State {
        self.remote
    }

    pub fn source(&self) -> &Terminus {
        &self.source
    }

    pub fn target(&self) -> &Terminus {
        &self.target
    }

    pub fn remote_source(&self) -> &Terminus {
        &self.remote_source
    }

    pub fn remote_target(&self) -> &Terminus {
        &self.remote_target
    }

    pub fn snd_settle(&self) -> SettleMode {
        self.snd_settle
    }

    pub fn remote_snd_settle(&self) -> SettleMode {
        self.remote_snd_settle
    }

    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    pub(crate) fn remote_credit(&self) -> u32 {
        match self.role {
            Role::Receiver => self.credit.saturating_sub(self.queued),
            Role::Sender => self.credit,
        }
    }

    pub(crate) fn needs_detach(&self) -> bool {
        self.local == State::Closed && self.attach_sent && !self.detach_sent
    }

    pub(crate) fn can_transmit(&self) -> bool {
        self.role == Role::Sender
            && self.attach_sent
            && self.remote == State::Active
            && self.credit > 0
            && !self.pending.is_empty()
    }
}
