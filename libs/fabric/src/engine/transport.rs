use tracing::trace;

use crate::engine::{Connection, Delivery, DeliveryId, Link, LinkId, SessionId, State};
use crate::error::{Error, Result};
use crate::frame::{self, Frame, Role};

impl Connection {
    /// Feed bytes read from the transport
    pub fn input(&mut self, bytes: &[u8]) -> Result<()> {
        self.decoder.push(bytes);
        while let Some(frame) = self.decoder.next_frame()? {
            trace!(container = %self.container, ?frame, "frame in");
            self.handle(frame)?;
        }
        Ok(())
    }

    /// Bytes that should be written to the transport
    pub fn output(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for frame in self.collect_frames() {
            trace!(container = %self.container, ?frame, "frame out");
            frame::encode(&frame, &mut out)?;
        }
        Ok(out)
    }

    /// Nothing is waiting to be written
    pub fn quiesced(&self) -> bool {
        if (self.local == State::Active && !self.open_sent) || self.needs_close() {
            return false;
        }
        if !self.open_sent {
            return true;
        }
        if self
            .sessions
            .values()
            .any(|s| (s.local == State::Active && !s.begin_sent) || s.needs_end())
        {
            return false;
        }
        if self.links.values().any(|l| self.link_has_output(l)) {
            return false;
        }
        !self.deliveries.values().any(Delivery::needs_disposition)
    }

    /// Both sides have exchanged close; the transport can be torn down
    pub fn transport_closed(&self) -> bool {
        self.close_sent && self.remote == State::Closed
    }

    fn needs_close(&self) -> bool {
        self.local == State::Closed && self.open_sent && !self.close_sent
    }

    fn session_begun(&self, id: SessionId) -> bool {
        self.sessions.get(&id).map(|s| s.begin_sent).unwrap_or(false)
    }

    fn link_has_output(&self, link: &Link) -> bool {
        if !self.session_begun(link.session) {
            return false;
        }
        (link.local == State::Active && !link.attach_sent)
            || (link.attach_sent && !link.detach_sent && link.flow_pending)
            || link.can_transmit()
            || link.needs_detach()
    }

    fn collect_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();

        if self.local == State::Active && !self.open_sent {
            frames.push(Frame::Open {
                container: self.container.clone(),
                hostname: self.hostname.clone(),
            });
            self.open_sent = true;
        }
        if !self.open_sent {
            return frames;
        }

        for session in self.sessions.values_mut() {
            if session.local == State::Active && !session.begin_sent {
                frames.push(Frame::Begin {
                    channel: session.channel,
                    remote_channel: session.remote_channel,
                });
                session.begin_sent = true;
            }
        }

        let link_ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in &link_ids {
            self.attach_frame(*id, &mut frames);
        }
        for id in &link_ids {
            self.flow_frame(*id, &mut frames);
        }
        for id in &link_ids {
            self.transfer_frames(*id, &mut frames);
        }

        let pending: Vec<DeliveryId> = self
            .deliveries
            .iter()
            .filter(|(_, d)| d.needs_disposition())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.disposition_frame(id, &mut frames);
        }

        for id in &link_ids {
            self.detach_frame(*id, &mut frames);
        }

        let mut ended = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.needs_end() {
                frames.push(Frame::End {
                    channel: session.channel,
                    error: None,
                });
                session.end_sent = true;
                if session.freed {
                    ended.push(*id);
                }
            }
        }
        for id in ended {
            self.sessions.remove(&id);
        }

        if self.needs_close() {
            frames.push(Frame::Close {
                error: self.local_condition.clone(),
            });
            self.close_sent = true;
        }

        frames
    }

    fn attach_frame(&mut self, id: LinkId, frames: &mut Vec<Frame>) {
        let Some(link) = self.links.get(&id) else {
            return;
        };
        if link.local != State::Active || link.attach_sent {
            return;
        }
        let Some(channel) = self
            .sessions
            .get(&link.session)
            .filter(|s| s.begin_sent)
            .map(|s| s.channel)
        else {
            return;
        };
        frames.push(Frame::Attach {
            channel,
            handle: link.handle,
            name: link.name.clone(),
            role: link.role,
            source: link.source.clone(),
            target: link.target.clone(),
            snd_settle: link.snd_settle,
        });
        if let Some(link) = self.links.get_mut(&id) {
            link.attach_sent = true;
        }
    }

    fn flow_frame(&mut self, id: LinkId, frames: &mut Vec<Frame>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.attach_sent || link.detach_sent || !link.flow_pending {
            return;
        }
        frames.push(Frame::Flow {
            handle: link.handle,
            delivery_count: link.delivery_count,
            link_credit: link.remote_credit(),
            drain: link.drain,
        });
        link.flow_pending = false;
    }

    fn transfer_frames(&mut self, id: LinkId, frames: &mut Vec<Frame>) {
        loop {
            let Some(link) = self.links.get_mut(&id) else {
                return;
            };
            if !link.can_transmit() {
                return;
            }
            let Some(did) = link.pending.pop_front() else {
                return;
            };
            link.queued = link.queued.saturating_sub(1);
            link.credit -= 1;
            link.delivery_count = link.delivery_count.wrapping_add(1);
            let handle = link.handle;
            let presettled = link.snd_settle == frame::SettleMode::Settled;

            let Some(delivery) = self.deliveries.get_mut(&did) else {
                continue;
            };
            let wire_id = self.next_wire_id;
            self.next_wire_id = self.next_wire_id.wrapping_add(1);
            let settled = delivery.local_settled || presettled;
            delivery.wire_id = Some(wire_id);
            delivery.transmitted = true;
            frames.push(Frame::Transfer {
                handle,
                delivery_id: wire_id,
                tag: delivery.tag.clone(),
                payload: std::mem::take(&mut delivery.bytes),
                settled,
            });

            if delivery.local_settled {
                self.deliveries.remove(&did);
            } else {
                delivery.settled_on_wire = settled;
                self.outgoing_ids.insert(wire_id, did);
            }
        }
    }

    fn disposition_frame(&mut self, id: DeliveryId, frames: &mut Vec<Frame>) {
        let Some(delivery) = self.deliveries.get_mut(&id) else {
            return;
        };
        let Some(wire_id) = delivery.wire_id else {
            return;
        };
        frames.push(Frame::Disposition {
            role: delivery.role,
            delivery_id: wire_id,
            state: delivery.local_state,
            settled: delivery.local_settled,
        });
        delivery.disposition_pending = false;
        if delivery.local_settled {
            self.remove_delivery(id);
        }
    }

    fn detach_frame(&mut self, id: LinkId, frames: &mut Vec<Frame>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.needs_detach() {
            return;
        }
        frames.push(Frame::Detach {
            handle: link.handle,
            error: None,
        });
        link.detach_sent = true;
        if link.freed {
            self.links.remove(&id);
        }
    }

    fn handle(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Open {
                container,
                hostname,
            } => {
                self.remote = State::Active;
                self.remote_container = Some(container);
                self.remote_hostname = hostname;
            }
            Frame::Begin {
                channel,
                remote_channel,
            } => {
                let ours = remote_channel.and_then(|rc| {
                    self.sessions
                        .iter()
                        .find(|(_, s)| s.channel == rc && !s.freed)
                        .map(|(id, _)| *id)
                });
                let id = match ours {
                    Some(id) => id,
                    None => self.new_session(),
                };
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.remote = State::Active;
                    session.remote_channel = Some(channel);
                }
                self.remote_channels.insert(channel, id);
            }
            Frame::Attach {
                channel,
                handle,
                name,
                role,
                source,
                target,
                snd_settle,
            } => {
                let session = *self.remote_channels.get(&channel).ok_or_else(|| {
                    Error::InvalidFrame(format!("Attach on unknown channel {}", channel))
                })?;
                let existing = self
                    .links
                    .iter()
                    .find(|(_, l)| {
                        l.session == session
                            && l.name == name
                            && l.role == role.opposite()
                            && l.remote_handle.is_none()
                            && !l.freed
                    })
                    .map(|(id, _)| *id);
                let id = match existing {
                    Some(id) => id,
                    None => self.new_link(session, role.opposite(), name)?,
                };
                if let Some(link) = self.links.get_mut(&id) {
                    link.remote = State::Active;
                    link.remote_handle = Some(handle);
                    link.remote_source = source;
                    link.remote_target = target;
                    link.remote_snd_settle = snd_settle;
                }
                self.remote_handles.insert(handle, id);
            }
            Frame::Flow {
                handle,
                delivery_count,
                link_credit,
                drain,
            } => {
                // a flow racing our own detach is dropped
                let Some(link) = self.remote_link(handle) else {
                    return Ok(());
                };
                match link.role {
                    Role::Sender => {
                        let credit = delivery_count as i64 + link_credit as i64
                            - link.delivery_count as i64;
                        link.credit = credit.max(0) as u32;
                        link.drain = drain;
                    }
                    Role::Receiver => {
                        let relinquished = delivery_count.wrapping_sub(link.delivery_count);
                        if relinquished > 0 && relinquished < u32::MAX / 2 {
                            link.delivery_count = delivery_count;
                            link.credit = link.credit.saturating_sub(relinquished);
                            link.drained = link.drained.saturating_add(relinquished);
                        }
                    }
                }
            }
            Frame::Transfer {
                handle,
                delivery_id,
                tag,
                payload,
                settled,
            } => {
                let id = DeliveryId(self.next_delivery);
                let Some(link_id) = self.remote_handles.get(&handle).copied() else {
                    return Ok(());
                };
                let Some(link) = self.links.get_mut(&link_id) else {
                    return Ok(());
                };
                if link.role != Role::Receiver {
                    return Err(Error::InvalidFrame("Transfer to a sender".to_string()));
                }
                link.pending.push_back(id);
                link.queued += 1;
                link.delivery_count = link.delivery_count.wrapping_add(1);
                if link.current.is_none() {
                    link.current = Some(id);
                }

                self.next_delivery = self.next_delivery.wrapping_add(1);
                let mut delivery = Delivery::incoming(link_id, delivery_id, tag, payload);
                delivery.remote_settled = settled;
                self.deliveries.insert(id, delivery);
                self.incoming_ids.insert(delivery_id, id);
            }
            Frame::Disposition {
                role,
                delivery_id,
                state,
                settled,
            } => {
                let ids = match role {
                    Role::Receiver => &self.outgoing_ids,
                    Role::Sender => &self.incoming_ids,
                };
                if let Some(id) = ids.get(&delivery_id).copied() {
                    let mut forget = false;
                    if let Some(delivery) = self.deliveries.get_mut(&id) {
                        if state.is_some() {
                            delivery.remote_state = state;
                        }
                        delivery.remote_settled |= settled;
                        delivery.updated = true;
                        forget = delivery.remote_settled && delivery.local_settled;
                    }
                    if forget {
                        self.remove_delivery(id);
                    }
                }
            }
            Frame::Detach { handle, error } => {
                if let Some(id) = self.remote_handles.remove(&handle) {
                    if let Some(link) = self.links.get_mut(&id) {
                        link.remote = State::Closed;
                        link.remote_condition = error;
                        link.remote_handle = None;
                    }
                }
            }
            Frame::End { channel, error } => {
                if let Some(id) = self.remote_channels.remove(&channel) {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        session.remote = State::Closed;
                        session.remote_condition = error;
                    }
                }
            }
            Frame::Close { error } => {
                self.remote = State::Closed;
                self.remote_condition = error;
            }
        }
        Ok(())
    }

    fn remote_link(&mut self, handle: u32) -> Option<&mut Link> {
        let id = self.remote_handles.get(&handle).copied()?;
        self.links.get_mut(&id)
    }
}
