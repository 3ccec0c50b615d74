use std::io;

pub mod cache;
pub mod macro_def;
pub mod net;

pub const LW_BUFFER_SIZE: usize = 4096;
pub const HW_BUFFER_SIZE: usize = 32_768;

/// Largest datagram the relay will carry in one piece.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

pub fn new_error<T: ToString>(message: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.to_string())
}
