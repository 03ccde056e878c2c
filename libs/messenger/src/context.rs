//! Side structures the messenger keeps for engine and driver objects

use std::collections::HashMap;

use courier_core::Address;
use courier_fabric::{
    driver::{ConnectorId, ServerSecurity},
    Connection, ConnectionId, LinkId,
};

use crate::subscription::Subscription;

/// Receiver link identity across all connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub connection: ConnectionId,
    pub link: LinkId,
}

/// What a connection was opened for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub connector: ConnectorId,
}

impl ConnectionContext {
    pub(crate) fn outbound(address: &Address, connector: ConnectorId) -> Self {
        Self {
            scheme: address.scheme.clone(),
            user: address.user.clone(),
            pass: address.pass.clone(),
            host: Some(address.host.clone()),
            port: address.port.clone(),
            connector,
        }
    }

    pub(crate) fn inbound(scheme: Option<String>, connector: ConnectorId) -> Self {
        Self {
            scheme,
            user: None,
            pass: None,
            host: None,
            port: None,
            connector,
        }
    }

    /// Same peer as `address` reached the same way
    pub(crate) fn matches(&self, address: &Address) -> bool {
        self.scheme == address.scheme
            && self.user == address.user
            && self.pass == address.pass
            && self.host.as_deref() == Some(address.host.as_str())
            && self.port == address.port
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkContext {
    /// Where messages from a receiver are delivered to
    pub subscription: Option<Subscription>,
    /// Outgoing store streams a sender serves
    pub addresses: Vec<String>,
}

impl LinkContext {
    pub(crate) fn serve(&mut self, address: &str) {
        if !self.addresses.iter().any(|a| a == address) {
            self.addresses.push(address.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub host: String,
    pub port: String,
    pub subscription: Subscription,
    pub security: ServerSecurity,
}

/// A connection and everything the messenger attached to it
#[derive(Debug)]
pub struct Endpoint {
    pub connection: Connection,
    pub context: ConnectionContext,
    pub links: HashMap<LinkId, LinkContext>,
}

impl Endpoint {
    pub(crate) fn new(connection: Connection, context: ConnectionContext) -> Self {
        Self {
            connection,
            context,
            links: HashMap::new(),
        }
    }
}
