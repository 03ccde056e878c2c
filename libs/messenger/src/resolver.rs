//! Address resolution: addresses to listeners, connections and links
//!
//! Connections are shared by every address that reaches the same peer, and
//! links are shared by every address with the same terminus name on that
//! connection.

use courier_core::{address::MAX_ADDRESS_LEN, Address, Error, Result};
use courier_fabric::{
    driver::{ClientSecurity, ClientTls, PeerVerification, Sasl, ServerSecurity, TlsCredentials},
    error::Error as FabricError,
    Connection, ConnectionId, Driver, Role, SettleMode, State, Terminus, Transform,
};
use tracing::{debug, error};

use crate::context::{ConnectionContext, Endpoint, LinkContext, LinkKey, ListenerContext};
use crate::messenger::Messenger;
use crate::subscription::Subscription;

impl<D: Driver> Messenger<D> {
    /// Apply routing rules and parse the result
    pub(crate) fn route_address(&self, address: &str) -> Result<Address> {
        if address.len() > MAX_ADDRESS_LEN {
            return Err(Error::generic(format!(
                "address exceeded maximum length: {}",
                address
            )));
        }
        let routed = self
            .routes
            .apply(address)
            .map_err(|e| Error::generic(format!("transformation error: {}", e)))?;
        Address::parse(routed.as_deref().unwrap_or(address))
    }

    /// Find or open the connection an address lives on
    ///
    /// Passive addresses bind a listener instead and resolve to no
    /// connection: peers arrive later through accept. A connection refused
    /// for bad credentials also resolves to none, with the connection error
    /// flag set.
    pub(crate) fn resolve(&mut self, address: &str) -> Result<(Address, Option<ConnectionId>)> {
        self.connection_error = false;
        let parsed = self.route_address(address)?;

        if parsed.passive {
            self.listen(address, &parsed)?;
            return Ok((parsed, None));
        }

        let domain = parsed.domain();
        let existing = self.connections.iter().find(|(_, endpoint)| {
            endpoint.context.matches(&parsed)
                || endpoint.connection.remote_container() == Some(domain.as_str())
        });
        if let Some((id, _)) = existing {
            return Ok((parsed, Some(*id)));
        }

        let security = self.client_security(&parsed);
        let connector = match self
            .driver
            .connect(&parsed.host, parsed.port_or_default(), &security)
        {
            Ok(connector) => connector,
            Err(FabricError::Credentials(msg)) => {
                error!(address, %msg, "invalid credentials");
                self.connection_error = true;
                return Ok((parsed, None));
            }
            Err(e) => {
                return Err(Error::network(format!(
                    "unable to connect to {}: {}",
                    address, e
                )))
            }
        };

        let mut connection = Connection::new(self.config.name.clone());
        connection.set_hostname(parsed.host.clone());
        connection.open();

        let id = self.next_connection_id();
        debug!(address, connection = id.0, connector = connector.0, "opened connection");
        self.connections.insert(
            id,
            Endpoint::new(connection, ConnectionContext::outbound(&parsed, connector)),
        );
        self.by_connector.insert(connector, id);
        Ok((parsed, Some(id)))
    }

    /// Find or open the link for an address
    ///
    /// Returns `None` when the address is passive or its connection could
    /// not be opened.
    pub(crate) fn resolve_link(&mut self, address: &str, sender: bool) -> Result<Option<LinkKey>> {
        let (parsed, connection) = self.resolve(address)?;
        let Some(connection) = connection else {
            return Ok(None);
        };

        let outgoing_window = self.outgoing.window();
        let incoming_window = self.incoming.window();
        let link_number = self.next_link;

        let Some(endpoint) = self.connections.get_mut(&connection) else {
            return Ok(None);
        };
        let name = parsed.name.clone();

        let existing = endpoint.connection.link_ids().into_iter().find(|id| {
            endpoint
                .connection
                .link(*id)
                .filter(|l| l.local_state() == State::Active && l.is_sender() == sender)
                .map(|l| {
                    let terminus = if sender { l.target() } else { l.source() };
                    terminus.address == name
                })
                .unwrap_or(false)
        });
        if let Some(link) = existing {
            if sender {
                endpoint.links.entry(link).or_default().serve(address);
            }
            return Ok(Some(LinkKey { connection, link }));
        }

        let session = endpoint.connection.new_session();
        endpoint.connection.open_session(session);
        let (role, label) = if sender {
            (Role::Sender, "sender")
        } else {
            (Role::Receiver, "receiver")
        };
        let link = endpoint
            .connection
            .new_link(session, role, format!("{}-{}", label, link_number))?;
        self.next_link += 1;

        let window = if sender { outgoing_window } else { incoming_window };
        let settle = if window > 0 {
            SettleMode::Unsettled
        } else {
            SettleMode::Settled
        };
        endpoint.connection.set_snd_settle(link, settle);

        if parsed.is_dynamic() {
            if sender {
                endpoint.connection.set_target(link, Terminus::dynamic());
            } else {
                endpoint.connection.set_source(link, Terminus::dynamic());
            }
        } else {
            let terminus = Terminus {
                address: name,
                dynamic: false,
            };
            endpoint.connection.set_target(link, terminus.clone());
            endpoint.connection.set_source(link, terminus);
        }

        let mut context = LinkContext::default();
        if sender {
            context.serve(address);
        } else {
            let subscription = Subscription::new(
                endpoint.context.scheme.as_deref(),
                endpoint.context.host.as_deref(),
                endpoint.context.port.as_deref(),
            );
            self.subscriptions.push(subscription.clone());
            context.subscription = Some(subscription);
        }
        endpoint.links.insert(link, context);
        endpoint.connection.open_link(link);

        let key = LinkKey { connection, link };
        if !sender {
            self.scheduler.add_receiver(key);
        }
        debug!(address, sender, link = ?link, "opened link");
        Ok(Some(key))
    }

    /// Subscribe to a source
    ///
    /// A passive source binds a listener (or reuses the one already bound
    /// to the same host and port); any other source opens a receiver.
    pub fn subscribe(&mut self, source: &str) -> Result<Subscription> {
        let parsed = self.route_address(source)?;

        if parsed.passive {
            return self.listen(source, &parsed);
        }

        let key = self
            .resolve_link(source, false)?
            .ok_or_else(|| Error::network(format!("unable to subscribe to {}", source)))?;
        self.connections
            .get(&key.connection)
            .and_then(|e| e.links.get(&key.link))
            .and_then(|c| c.subscription.clone())
            .ok_or_else(|| Error::generic(format!("no subscription for {}", source)))
    }

    fn listen(&mut self, address: &str, parsed: &Address) -> Result<Subscription> {
        let port = parsed.port_or_default().to_string();
        let bound = self
            .listeners
            .values()
            .find(|ctx| ctx.host == parsed.host && ctx.port == port);
        if let Some(ctx) = bound {
            return Ok(ctx.subscription.clone());
        }

        let security = self.server_security(parsed);
        let listener = self
            .driver
            .listen(&parsed.host, &port, &security)
            .map_err(|e| {
                Error::network(format!(
                    "unable to bind to address {}: {}:{}: {}",
                    address, parsed.host, port, e
                ))
            })?;

        let subscription = Subscription::new(
            parsed.scheme.as_deref(),
            Some(parsed.host.as_str()),
            parsed.port.as_deref(),
        );
        self.subscriptions.push(subscription.clone());
        self.listeners.insert(
            listener,
            ListenerContext {
                host: parsed.host.clone(),
                port,
                subscription: subscription.clone(),
                security,
            },
        );
        debug!(address, listener = listener.0, "listening");
        Ok(subscription)
    }

    /// TLS and SASL settings for connecting to `address`
    pub(crate) fn client_security(&self, address: &Address) -> ClientSecurity {
        let sasl = match &address.user {
            Some(user) => Sasl::Plain {
                user: user.clone(),
                password: address.pass.clone().unwrap_or_default(),
            },
            None => Sasl::Anonymous,
        };
        self.connection_security(address.is_secure(), sasl)
    }

    pub(crate) fn connection_security(&self, secure: bool, sasl: Sasl) -> ClientSecurity {
        let credentials = &self.config.credentials;
        let tls = secure.then(|| ClientTls {
            credentials: self.tls_credentials(),
            verification: match &credentials.trusted_certificates {
                Some(path) => PeerVerification::Verify {
                    trusted_certificates: path.clone(),
                },
                None => PeerVerification::Anonymous,
            },
        });
        ClientSecurity { tls, sasl }
    }

    fn server_security(&self, address: &Address) -> ServerSecurity {
        if !address.is_secure() {
            return ServerSecurity::default();
        }
        ServerSecurity {
            tls: self.tls_credentials(),
            trusted_certificates: self.config.credentials.trusted_certificates.clone(),
        }
    }

    fn tls_credentials(&self) -> Option<TlsCredentials> {
        let credentials = &self.config.credentials;
        match (&credentials.certificate, &credentials.private_key) {
            (Some(certificate), Some(private_key)) => Some(TlsCredentials {
                certificate: certificate.clone(),
                private_key: private_key.clone(),
                password: credentials.password.clone(),
            }),
            _ => None,
        }
    }
}
