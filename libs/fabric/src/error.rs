use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    /// Encode target buffer too small, caller should retry with a larger one
    #[error("Buffer overflow")]
    Overflow,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unable to bind {0}")]
    Bind(String),

    #[error("Unable to connect to {0}")]
    Connect(String),

    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for courier_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(_)
            | Error::ConnectionClosed
            | Error::Bind(_)
            | Error::Connect(_)
            | Error::Credentials(_) => courier_core::Error::Network(err.to_string()),
            Error::Codec(_) | Error::Overflow | Error::InvalidFrame(_) | Error::Custom(_) => {
                courier_core::Error::Generic(err.to_string())
            }
        }
    }
}
