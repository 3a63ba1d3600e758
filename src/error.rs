use crate::protocol::Command;
use std::time::Duration;

/// Errors of the BMS communication layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request payload does not fit the command's length rule.
    #[error("Cannot encode request: {0}")]
    Encoding(String),
    /// The CRC of a received frame does not match its content.
    #[error("Invalid checksum - calculated={calculated:#06X} received={received:#06X}")]
    Checksum { calculated: u16, received: u16 },
    /// A received frame is structurally inconsistent with the request.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    /// No complete reply arrived in time.
    #[error("No reply within {0:?}")]
    Timeout(Duration),
    /// The link itself failed, or is not connected.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// All attempts of a logical call failed on transient errors.
    #[error("Command {command} failed after {attempts} attempts: {last}")]
    CommunicationFailed {
        command: Command,
        attempts: u8,
        #[source]
        last: Box<Error>,
    },
    /// The operation is not allowed for the command or a parameter is out of range.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    /// Another exchange is outstanding.
    #[error("Another exchange is in progress")]
    Busy,
    /// The serial port could not be claimed.
    #[error("Cannot open serial port '{port}': {source}")]
    Connection {
        port: String,
        #[source]
        source: std::io::Error,
    },
    /// The poller gave up after too many consecutive failed cycles.
    #[error("Link lost after {0} consecutive failed poll cycles")]
    LinkLost(u32),
}

impl Error {
    /// Frame level faults that a re-send may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Checksum { .. } | Error::MalformedFrame(_)
        )
    }

    pub(crate) fn not_connected() -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "session is not connected",
        ))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
