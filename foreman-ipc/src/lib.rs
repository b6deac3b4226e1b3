//! Inter-process communication for Foreman
//!
//! This crate provides the line-delimited JSON protocol spoken between the
//! host and its worker processes: message types, the line codec, and a
//! bounded line transport over async byte streams.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use codec::{decode_command, decode_response, encode_command, encode_response};
pub use error::{IpcError, IpcResult, ProtocolError};
pub use protocol::{
    Command, IncomingCommand, Response, WireCommand, WireResponse, WorkerCategory,
    DEFAULT_MAX_LINE_LENGTH, PING_COMMAND, SHUTDOWN_COMMAND,
};
pub use transport::{LineRead, LineReader, LineWriter};
