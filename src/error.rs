use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy. Each kind maps to exactly one recovery
/// action at the relay level: drop the datagram, destroy the connection,
/// or abort startup.
#[derive(Error, Debug)]
pub enum Error {
    /// The configured cipher method name is not in the supported table.
    #[error("unsupported cipher method: {0}")]
    UnsupportedCipherMethod(String),

    /// Cipher construction failed for a supported method.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Malformed SOCKS5 or relay framing: bad ATYP/CMD, truncated
    /// header, non-zero FRAG, short IV.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// Startup-time failures: unreadable config, missing fields.
    #[error("config error: {0}")]
    Config(String),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
