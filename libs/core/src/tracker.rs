use std::fmt;

use serde::{Deserialize, Serialize};

/// Which store a tracker refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Stable handle for one store entry
///
/// Trackers never refer across stores: the direction selects the store and
/// the sequence number selects the entry inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tracker {
    direction: Direction,
    sequence: u32,
}

impl Tracker {
    pub fn new(direction: Direction, sequence: u32) -> Self {
        Self {
            direction,
            sequence,
        }
    }

    pub fn outgoing(sequence: u32) -> Self {
        Self::new(Direction::Outgoing, sequence)
    }

    pub fn incoming(sequence: u32) -> Self {
        Self::new(Direction::Incoming, sequence)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.direction {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
        };
        write!(f, "{}:{}", tag, self.sequence)
    }
}

/// Delivery status of a tracked entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Unknown,
    Pending,
    Accepted,
    Rejected,
    Released,
    Modified,
    Aborted,
}

impl Status {
    /// Terminal states never change once reached
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Unknown | Status::Pending)
    }
}

/// Flags for tracker updates (settle, accept, reject)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const NONE: UpdateFlags = UpdateFlags(0);

    /// Apply the update to every tracked entry up to and including the tracker
    pub const CUMULATIVE: UpdateFlags = UpdateFlags(0x1);

    pub fn is_cumulative(self) -> bool {
        self.0 & Self::CUMULATIVE.0 != 0
    }
}
