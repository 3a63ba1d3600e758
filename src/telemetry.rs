//! Exchange events for an external log collaborator.

use crate::protocol::Command;
use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One attempt of a logical call as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExchangeEvent {
    pub timestamp: DateTime<Utc>,
    pub device: u8,
    pub command: Command,
    /// 1-based attempt number within the logical call.
    pub attempt: u8,
    pub request: Vec<u8>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Outcome {
    /// Validated reply.
    Response(Vec<u8>),
    /// Reply that failed validation.
    Rejected { response: Vec<u8>, error: String },
    /// No usable reply at all.
    Error(String),
}

/// Receives every exchange event; implementations must not block for long.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &ExchangeEvent);
}

impl<F> TelemetrySink for F
where
    F: Fn(&ExchangeEvent) + Send + Sync,
{
    fn record(&self, event: &ExchangeEvent) {
        self(event)
    }
}

/// Writes events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, event: &ExchangeEvent) {
        match &event.outcome {
            Outcome::Response(rx) => log::debug!(
                "{} #{} dev={:#04X} TX: {:02X?} RX: {:02X?}",
                event.command,
                event.attempt,
                event.device,
                event.request,
                rx
            ),
            Outcome::Rejected { response, error } => log::debug!(
                "{} #{} dev={:#04X} TX: {:02X?} RX: {:02X?} rejected: {}",
                event.command,
                event.attempt,
                event.device,
                event.request,
                response,
                error
            ),
            Outcome::Error(err) => log::debug!(
                "{} #{} dev={:#04X} TX: {:02X?} failed: {}",
                event.command,
                event.attempt,
                event.device,
                event.request,
                err
            ),
        }
    }
}
