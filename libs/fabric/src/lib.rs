//! Courier Fabric - protocol engine, I/O driver and storage collaborators
//!
//! Provides everything the messenger drives but does not own: the message
//! codec, length-prefixed frame codec, the connection engine
//! (sessions, links, deliveries and credit), an I/O [`Driver`] with an
//! in-process [`MemoryDriver`], the message [`Store`] and address
//! [`Transform`] rules.
//!
//! # Example
//!
//! ```no_run
//! use courier_fabric::{
//!     driver::{ClientSecurity, Driver, MemoryDriver, MemoryNetwork},
//!     Connection,
//! };
//!
//! # fn example() -> Result<(), courier_fabric::Error> {
//! let network = MemoryNetwork::new();
//! let mut driver = MemoryDriver::new(network)?;
//! let connector = driver.connect("broker", "5672", &ClientSecurity::default())?;
//!
//! let mut connection = Connection::new("client-1");
//! connection.open();
//! driver.process(connector, &mut connection)?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod driver;
pub mod engine;
pub mod error;
pub mod frame;
pub mod message;
pub mod store;
pub mod transform;

// Re-exports for convenience
pub use driver::{Driver, MemoryDriver, MemoryNetwork};
pub use engine::{Connection, ConnectionId, DeliveryId, LinkId, SessionId, State};
pub use error::{Error, Result};
pub use frame::{Condition, Disposition, Role, SettleMode, Terminus};
pub use message::Message;
pub use store::{DeliveryAction, DeliveryRef, EntryId, Store};
pub use transform::{Rules, Transform};
