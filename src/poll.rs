//! Periodic telemetry reads over a chain of boards.

use crate::client::Bms;
use crate::protocol::{Device, Telemetry};
use crate::Error;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Consecutive failed ticks after which the link is considered lost.
pub const MAX_FAILED_TICKS: u32 = 5;

const STOP_POLL_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PollRate {
    HalfHertz,
    #[default]
    OneHertz,
}

impl PollRate {
    pub fn hertz(self) -> f64 {
        match self {
            PollRate::HalfHertz => 0.5,
            PollRate::OneHertz => 1.0,
        }
    }

    pub fn period(self) -> Duration {
        match self {
            PollRate::HalfHertz => Duration::from_secs(2),
            PollRate::OneHertz => Duration::from_secs(1),
        }
    }
}

impl TryFrom<f64> for PollRate {
    type Error = Error;

    fn try_from(hertz: f64) -> Result<Self, Self::Error> {
        if hertz == 0.5 {
            Ok(PollRate::HalfHertz)
        } else if hertz == 1.0 {
            Ok(PollRate::OneHertz)
        } else {
            Err(Error::InvalidOperation(format!(
                "poll rate {hertz} Hz not supported, use 0.5 or 1"
            )))
        }
    }
}

impl fmt::Display for PollRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} Hz", self.hertz())
    }
}

/// Stops a running [`Poller`] from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reads [`Telemetry`] of every configured device once per tick.
///
/// A tick fails when no device answered and none was skipped as
/// [`Error::Busy`]. After [`MAX_FAILED_TICKS`] failed ticks in a row the
/// session is closed and [`Error::LinkLost`] returned.
/// An I/O error ends polling at once.
#[derive(Debug)]
pub struct Poller<'a> {
    bms: &'a Bms,
    devices: Vec<Device>,
    period: Duration,
    stop: StopHandle,
}

impl<'a> Poller<'a> {
    pub fn new(bms: &'a Bms, devices: Vec<Device>, rate: PollRate) -> Self {
        Self {
            bms,
            devices,
            period: rate.period(),
            stop: StopHandle::default(),
        }
    }

    /// Overrides the tick period of the poll rate.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Polls until stopped and returns the number of completed ticks.
    ///
    /// `on_reading` gets every result; `ControlFlow::Break` stops after the
    /// current tick.
    pub fn run<F>(&self, mut on_reading: F) -> Result<u64, Error>
    where
        F: FnMut(Device, &Result<Telemetry, Error>) -> ControlFlow<()>,
    {
        log::info!(
            "Polling {} device(s) every {:?}",
            self.devices.len(),
            self.period
        );
        let start = Instant::now();
        let mut ticks: u64 = 0;
        let mut failed_ticks: u32 = 0;
        while !self.stop.is_stopped() {
            let mut answered = false;
            let mut busy = false;
            let mut stop = false;
            for &device in &self.devices {
                let result = self.bms.telemetry(device);
                match &result {
                    Ok(_) => answered = true,
                    Err(Error::Busy) => {
                        log::debug!("Poll of {device} skipped, another call is outstanding");
                        busy = true;
                    }
                    Err(err) => log::warn!("Poll of {device} failed: {err}"),
                }
                if on_reading(device, &result).is_break() {
                    stop = true;
                }
                if let Err(Error::Io(err)) = result {
                    log::error!("Polling stopped: {err}");
                    return Err(Error::Io(err));
                }
                if stop || self.stop.is_stopped() {
                    break;
                }
            }
            ticks += 1;

            if answered {
                failed_ticks = 0;
            } else if !busy {
                failed_ticks += 1;
            }
            if failed_ticks >= MAX_FAILED_TICKS {
                log::error!("No reply in {failed_ticks} consecutive polls, disconnecting");
                self.bms.session().close();
                return Err(Error::LinkLost(failed_ticks));
            }
            if stop {
                break;
            }
            self.sleep_until(start + self.period.saturating_mul(ticks as u32));
        }
        log::info!("Polling stopped after {ticks} tick(s)");
        Ok(ticks)
    }

    fn sleep_until(&self, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline || self.stop.is_stopped() {
                return;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
    }
}
