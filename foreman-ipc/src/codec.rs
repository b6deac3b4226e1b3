//! Encoding and decoding of single protocol lines
//!
//! Every message is one compact JSON object. Lines returned by the encoders
//! carry no trailing newline; the transport appends it.

use chrono::Utc;

use crate::error::{IpcError, IpcResult, ProtocolError};
use crate::protocol::{Command, IncomingCommand, Response, WireResponse};

/// Encode a command as one line of JSON
pub fn encode_command(command: &Command) -> IpcResult<String> {
    let line = serde_json::to_string(&command.to_wire())
        .map_err(|e| IpcError::Serialization(e.to_string()))?;
    debug_assert!(!line.contains('\n'));
    Ok(line)
}

/// Decode one response line received from a worker
pub fn decode_response(line: &str, max_line_length: usize) -> IpcResult<Response> {
    let line = checked_line(line, max_line_length)?;

    let wire: WireResponse = serde_json::from_str(line)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let correlation_id = match wire.correlation_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(ProtocolError::MissingCorrelationId.into()),
    };

    Ok(Response {
        correlation_id,
        success: wire.success,
        payload: wire.data,
        error_message: wire.error,
        completed_at: Utc::now(),
        server_elapsed_ms: wire.execution_time_ms,
    })
}

/// Decode one command line, as seen from the worker side
pub fn decode_command(line: &str, max_line_length: usize) -> IpcResult<IncomingCommand> {
    let line = checked_line(line, max_line_length)?;

    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match value.get("correlationId") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => {}
        _ => return Err(ProtocolError::MissingCorrelationId.into()),
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()).into())
}

/// Encode a response line, as written by the worker side
pub fn encode_response(response: &WireResponse) -> IpcResult<String> {
    serde_json::to_string(response).map_err(|e| IpcError::Serialization(e.to_string()))
}

fn checked_line(line: &str, max_line_length: usize) -> IpcResult<&str> {
    if line.len() > max_line_length {
        return Err(ProtocolError::LineTooLong {
            len: line.len(),
            max: max_line_length,
        }
        .into());
    }
    Ok(line.trim_end_matches(&['\n', '\r'][..]))
}
