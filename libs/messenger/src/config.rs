use std::path::PathBuf;
use std::time::Duration;

use courier_fabric::Driver;
use serde::Deserialize;

use crate::messenger::Messenger;
use crate::scheduler::{DEFAULT_BATCH, DEFAULT_DRAIN_GRACE, DEFAULT_TOP_UP_RATIO};

/// TLS material used for `amqps` connections and listeners
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
    pub trusted_certificates: Option<PathBuf>,
}

/// Tuning for the receiver credit scheduler
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CreditConfig {
    /// Per-receiver credit in automatic mode
    pub batch: u32,
    /// How long blocked receivers wait before credit is drained from others
    pub drain_grace: Duration,
    /// Fraction of the fair share below which a link is topped up
    pub top_up_ratio: f64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            drain_grace: DEFAULT_DRAIN_GRACE,
            top_up_ratio: DEFAULT_TOP_UP_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Container name announced to peers
    pub name: String,
    pub credentials: Credentials,
    /// Deadline for blocking operations, `None` waits forever
    pub timeout: Option<Duration>,
    pub blocking: bool,
    pub outgoing_window: u32,
    pub incoming_window: u32,
    pub credit: CreditConfig,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            credentials: Credentials::default(),
            timeout: None,
            blocking: true,
            outgoing_window: 0,
            incoming_window: 0,
            credit: CreditConfig::default(),
        }
    }
}

/// Builder for configuring a [`Messenger`]
#[derive(Debug, Default)]
pub struct MessengerBuilder {
    config: MessengerConfig,
}

impl MessengerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.credentials.certificate = Some(path.into());
        self
    }

    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.credentials.private_key = Some(path.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.credentials.password = Some(password.into());
        self
    }

    pub fn trusted_certificates(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.credentials.trusted_certificates = Some(path.into());
        self
    }

    /// Set the deadline for blocking operations
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.config.blocking = blocking;
        self
    }

    pub fn outgoing_window(mut self, window: u32) -> Self {
        self.config.outgoing_window = window;
        self
    }

    pub fn incoming_window(mut self, window: u32) -> Self {
        self.config.incoming_window = window;
        self
    }

    pub fn credit_batch(mut self, batch: u32) -> Self {
        self.config.credit.batch = batch;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.config.credit.drain_grace = grace;
        self
    }

    pub fn top_up_ratio(mut self, ratio: f64) -> Self {
        self.config.credit.top_up_ratio = ratio;
        self
    }

    /// Build the messenger over a driver
    pub fn build<D: Driver>(self, driver: D) -> Messenger<D> {
        Messenger::with_config(driver, self.config)
    }
}
