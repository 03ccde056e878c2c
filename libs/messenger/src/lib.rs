//! Courier Messenger - address-based messaging over the courier fabric
//!
//! A [`Messenger`] turns addresses such as `amqp://user@broker:5672/queue`
//! into connections, sessions and links, queues outgoing messages per
//! address, spreads receive credit fairly across its receivers with a
//! [`CreditScheduler`], and runs the driver's event loop inside each
//! blocking call.
//!
//! # Example
//!
//! ```no_run
//! use courier_fabric::{MemoryDriver, MemoryNetwork, Message};
//! use courier_messenger::MessengerBuilder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let network = MemoryNetwork::new();
//! let mut messenger = MessengerBuilder::new()
//!     .name("client")
//!     .build(MemoryDriver::new(network)?);
//!
//! messenger.put(&Message::new().with_address("amqp://broker/queue").with_body("hello"))?;
//! messenger.send(None)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
mod endpoints;
mod event_loop;
pub mod messenger;
mod resolver;
pub mod rewrite;
pub mod scheduler;
pub mod subscription;

// Re-exports for convenience
pub use config::{CreditConfig, Credentials, MessengerBuilder, MessengerConfig};
pub use context::LinkKey;
pub use courier_core::{Address, Direction, Error, Progress, Result, Status, Tracker, UpdateFlags};
pub use messenger::Messenger;
pub use scheduler::{CreditMode, CreditScheduler, FifoSet, LinkCredit};
pub use subscription::Subscription;
