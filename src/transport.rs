//! Serial transport session.
//!
//! A [`Session`] owns at most one open link and runs at most one
//! request/reply exchange at a time. Reads are done in short slices so that
//! [`Session::close`] can abort an outstanding exchange without waiting for
//! its timeout.

use crate::frame::MIN_FRAME_LENGTH;
use crate::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Time allowed for a complete reply per attempt.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound of a single blocking read.
pub const READ_SLICE: Duration = Duration::from_millis(10);
/// Line silence that ends a reply of unknown length.
pub const IDLE_GAP: Duration = Duration::from_millis(20);

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Byte stream to the BMS. Reads should block for no longer than [`READ_SLICE`]
/// and report an empty line with `ErrorKind::TimedOut`.
pub trait Link: Read + Write + Send {
    /// Discards bytes received but not read yet.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "serialport")]
impl Link for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        let pending = self.bytes_to_read().map_err(io::Error::from)?;
        if pending > 0 {
            log::trace!("Discarding {} pending bytes", pending);
        }
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a flag as taken for its lifetime; a second claim fails with [`Error::Busy`].
pub(crate) struct ExchangeGuard<'a>(&'a AtomicBool);

impl<'a> ExchangeGuard<'a> {
    pub(crate) fn claim(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Session {
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Box<dyn Link>>>,
    port: Mutex<Option<String>>,
    exchanging: AtomicBool,
    abort: AtomicBool,
    timeout: Duration,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("port", &self.port_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_timeout(RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            link: Mutex::new(None),
            port: Mutex::new(None),
            exchanging: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Identifier of the last opened port.
    pub fn port_name(&self) -> Option<String> {
        lock(&self.port).clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!("Connection state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Opens `port` at 115200 baud, 8 data bits, no parity, one stop bit.
    #[cfg(feature = "serialport")]
    pub fn open(&self, port: &str) -> Result<()> {
        self.connect_with(port, || {
            let serial = serialport::new(port, crate::protocol::BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(READ_SLICE)
                .open()?;
            Ok(Box::new(serial) as Box<dyn Link>)
        })
    }

    /// Takes over an already opened link.
    pub fn attach(&self, name: &str, link: Box<dyn Link>) -> Result<()> {
        self.connect_with(name, || Ok(link))
    }

    fn connect_with<F>(&self, name: &str, open: F) -> Result<()>
    where
        F: FnOnce() -> io::Result<Box<dyn Link>>,
    {
        let _guard = ExchangeGuard::claim(&self.exchanging)?;
        if lock(&self.link).take().is_some() {
            log::info!("Releasing previous link before opening '{name}'");
        }
        self.abort.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        match open() {
            Ok(link) => {
                *lock(&self.link) = Some(link);
                *lock(&self.port) = Some(name.to_string());
                self.set_state(ConnectionState::Connected);
                // A close() since the abort flag was reset wins over the open.
                if self.abort.load(Ordering::SeqCst) {
                    lock(&self.link).take();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(Error::Connection {
                        port: name.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "closed while opening",
                        ),
                    });
                }
                log::info!("Connected to '{name}'");
                Ok(())
            }
            Err(source) => {
                self.set_state(ConnectionState::Disconnected);
                Err(Error::Connection {
                    port: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Releases the link. An outstanding exchange fails with [`Error::Io`].
    pub fn close(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        // Waits for an outstanding exchange to observe the abort flag.
        if lock(&self.link).take().is_some() {
            log::info!(
                "Closed '{}'",
                self.port_name().unwrap_or_else(|| "<unknown>".into())
            );
        }
    }

    /// Sends `request` and waits for the reply.
    ///
    /// With `reply_size` the reply is complete after that many bytes, otherwise
    /// once the line stays idle for [`IDLE_GAP`].
    pub fn write_then_read(&self, request: &[u8], reply_size: Option<usize>) -> Result<Vec<u8>> {
        let _guard = ExchangeGuard::claim(&self.exchanging)?;
        if !self.is_connected() {
            return Err(Error::not_connected());
        }
        let mut slot = lock(&self.link);
        let Some(link) = slot.as_mut() else {
            return Err(Error::not_connected());
        };
        match exchange(link.as_mut(), request, reply_size, self.timeout, &self.abort) {
            Err(Error::Io(err)) if !self.abort.load(Ordering::SeqCst) => {
                log::error!("Link fault: {err}");
                *slot = None;
                drop(slot);
                self.set_state(ConnectionState::Faulted);
                Err(Error::Io(err))
            }
            result => result,
        }
    }
}

fn exchange(
    link: &mut dyn Link,
    request: &[u8],
    reply_size: Option<usize>,
    timeout: Duration,
    abort: &AtomicBool,
) -> Result<Vec<u8>> {
    // clear all incoming serial to avoid data collision
    link.clear_input()?;
    log::trace!("send_bytes: {:02X?}", request);
    link.write_all(request)?;
    link.flush()?;

    let deadline = Instant::now() + timeout;
    let mut rx_buffer = Vec::with_capacity(reply_size.unwrap_or(64));
    let mut chunk = [0u8; 64];
    let mut last_rx = Instant::now();
    loop {
        if abort.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed during exchange",
            )
            .into());
        }
        let complete = match reply_size {
            Some(size) => rx_buffer.len() >= size,
            None => rx_buffer.len() >= MIN_FRAME_LENGTH && last_rx.elapsed() >= IDLE_GAP,
        };
        if complete {
            break;
        }
        if Instant::now() >= deadline {
            if reply_size.is_none() && rx_buffer.len() >= MIN_FRAME_LENGTH {
                break;
            }
            log::trace!("Timeout with partial reply {:02X?}", rx_buffer);
            return Err(Error::Timeout(timeout));
        }
        let want = reply_size.map_or(chunk.len(), |size| (size - rx_buffer.len()).min(chunk.len()));
        match link.read(&mut chunk[..want]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => {
                rx_buffer.extend_from_slice(&chunk[..n]);
                last_rx = Instant::now();
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err.into()),
        }
    }
    log::trace!("receive_bytes: {:02X?}", rx_buffer);
    Ok(rx_buffer)
}
