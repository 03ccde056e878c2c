use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod bincode;

pub use self::bincode::BincodeCodec;

/// Codec trait for serializing and deserializing messages and frames
pub trait Codec: Send + Sync {
    /// Encode a value into bytes
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Encode a value into a caller-provided buffer, returning the bytes used
    ///
    /// Fails with [`Error::Overflow`](crate::Error::Overflow) when the buffer
    /// is too small; nothing useful is left in the buffer in that case.
    fn encode_into<T: Serialize>(&self, value: &T, buf: &mut [u8]) -> Result<usize>;

    /// Decode bytes into a value
    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T>;
}
