//! The wait loop every blocking operation runs on

use std::time::{Duration, Instant};

use courier_core::{Error, Progress, Result};
use courier_fabric::{
    driver::{ConnectorId, ListenerId, Wakeup},
    Connection, ConnectionId, Driver, State,
};
use tracing::{debug, error, trace, warn};

use crate::context::{ConnectionContext, Endpoint};
use crate::messenger::Messenger;

impl<D: Driver> Messenger<D> {
    /// Run the event loop until `predicate` holds or `timeout` passes
    ///
    /// `None` waits forever. An interrupt ends the wait early and is only
    /// reported when the predicate did not hold yet.
    pub(crate) fn tsync<P>(&mut self, mut predicate: P, timeout: Option<Duration>) -> Result<()>
    where
        P: FnMut(&mut Self) -> bool,
    {
        let connectors: Vec<(ConnectorId, ConnectionId)> =
            self.by_connector.iter().map(|(c, id)| (*c, *id)).collect();
        for (connector, id) in connectors {
            self.endpoints(id);
            self.process_connection(connector, id);
        }
        self.reap_closed();

        let mut now = Instant::now();
        let deadline = timeout.map(|t| now + t);
        loop {
            let satisfied = predicate(self);
            let expired = deadline.map(|d| now > d).unwrap_or(false);
            if satisfied || expired {
                break;
            }

            self.flow();
            let mut wait = deadline.map(|d| d.saturating_duration_since(now));
            if let Some(drain) = self.scheduler.next_drain() {
                let until_drain = drain.saturating_duration_since(now);
                wait = Some(wait.map_or(until_drain, |w| w.min(until_drain)));
            }

            trace!(?wait, "waiting");
            match self.driver.wait(wait) {
                Ok(Wakeup::Interrupted) => {
                    debug!("wait interrupted");
                    return if predicate(self) {
                        Ok(())
                    } else {
                        Err(Error::Interrupted)
                    };
                }
                Ok(_) => {}
                Err(e) => return Err(Error::network(format!("wait failed: {}", e))),
            }

            while let Some(listener) = self.driver.ready_listener() {
                self.accept_connections(listener);
            }
            while let Some(connector) = self.driver.ready_connector() {
                self.worked = true;
                self.service(connector);
            }
            self.reap_closed();
            now = Instant::now();
        }

        if predicate(self) {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// [`tsync`](Self::tsync) with the configured blocking behaviour
    ///
    /// A non-blocking messenger makes a single pass and reports
    /// [`Progress::InProgress`] when the predicate does not hold yet.
    pub(crate) fn sync<P>(&mut self, predicate: P) -> Result<Progress>
    where
        P: FnMut(&mut Self) -> bool,
    {
        if self.config.blocking {
            self.tsync(predicate, self.config.timeout)?;
            return Ok(Progress::Complete);
        }
        match self.tsync(predicate, Some(Duration::ZERO)) {
            Ok(()) => Ok(Progress::Complete),
            Err(Error::Timeout) => Ok(Progress::InProgress),
            Err(e) => Err(e),
        }
    }

    fn accept_connections(&mut self, listener: ListenerId) {
        let Some(scheme) = self.listeners.get(&listener).map(|l| l.subscription.scheme()) else {
            return;
        };
        loop {
            match self.driver.accept(listener) {
                Ok(Some(connector)) => {
                    self.worked = true;
                    let id = self.next_connection_id();
                    let connection = Connection::new(self.config.name.clone());
                    self.connections.insert(
                        id,
                        Endpoint::new(connection, ConnectionContext::inbound(scheme.clone(), connector)),
                    );
                    self.by_connector.insert(connector, id);
                    debug!(listener = listener.0, connector = connector.0, connection = id.0, "accepted");
                }
                Ok(None) => return,
                Err(e) => {
                    error!(listener = listener.0, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn service(&mut self, connector: ConnectorId) {
        let Some(id) = self.by_connector.get(&connector).copied() else {
            if self.driver.closed(connector) {
                self.driver.close(connector);
            }
            return;
        };

        self.process_connection(connector, id);
        self.endpoints(id);
        if !self.reap(connector, id) {
            self.process_connection(connector, id);
        }
    }

    /// Drop the connection of a connector that has gone away
    fn reap(&mut self, connector: ConnectorId, id: ConnectionId) -> bool {
        if !self.driver.closed(connector) {
            return false;
        }
        debug!(connector = connector.0, connection = id.0, "connector closed");
        self.driver.close(connector);
        if self.by_connector.remove(&connector).is_some() {
            self.reclaim(id);
        }
        true
    }

    // Connectors can hang up outside `service`, e.g. while flushing credit
    fn reap_closed(&mut self) {
        let connectors: Vec<(ConnectorId, ConnectionId)> =
            self.by_connector.iter().map(|(c, id)| (*c, *id)).collect();
        for (connector, id) in connectors {
            self.reap(connector, id);
        }
    }

    pub(crate) fn process_connection(&mut self, connector: ConnectorId, id: ConnectionId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = self.driver.process(connector, &mut endpoint.connection) {
            warn!(connector = connector.0, error = %e, "process failed");
        }
    }

    /// Everything queued has left, down to the send threshold
    pub(crate) fn sent(&mut self) -> bool {
        let mut total = self.outgoing.size();

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(endpoint) = self.connections.get(&id) else {
                continue;
            };
            let connection = &endpoint.connection;
            if !connection.quiesced() {
                let connector = endpoint.context.connector;
                self.process_connection(connector, id);
                return false;
            }

            for link in connection.link_ids() {
                let sending = connection
                    .link(link)
                    .map(|l| l.local_state() == State::Active && l.is_sender())
                    .unwrap_or(false);
                if !sending {
                    continue;
                }
                total += connection.queued(link) as usize;
                total += connection
                    .unsettled(link)
                    .into_iter()
                    .filter(|d| {
                        connection.remote_disposition(*d).is_none()
                            && !connection.remote_settled(*d)
                    })
                    .count();
            }
        }

        total <= self.send_threshold
    }

    /// A message is waiting, or there is nothing left to receive from
    pub(crate) fn received(&mut self) -> bool {
        if self.incoming.size() > 0 {
            return true;
        }
        let readable = self.connections.values().any(|endpoint| {
            let connection = &endpoint.connection;
            let mut cursor = connection.work_head();
            while let Some(delivery) = cursor {
                if connection.readable(delivery) {
                    return true;
                }
                cursor = connection.work_next(delivery);
            }
            false
        });
        readable || self.no_sources()
    }

    pub(crate) fn has_worked(&mut self) -> bool {
        self.worked
    }
}
