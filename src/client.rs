use crate::convert;
use crate::frame::Frame;
use crate::protocol::*;
use crate::telemetry::{ExchangeEvent, LogSink, Outcome, TelemetrySink};
use crate::transport::{ExchangeGuard, Session};
use crate::Error;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Error>;

/// Attempts per logical call, the first one included.
pub const MAX_ATTEMPTS: u8 = 3;
/// Bus silence kept between the end of one exchange and the next request.
pub const MINIMUM_DELAY: Duration = Duration::from_millis(1);

/// Validated reply of a logical call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub frame: Frame,
    pub raw: Vec<u8>,
    /// Attempts it took, 1 if the first one succeeded.
    pub attempts: u8,
}

enum State {
    Sending { attempt: u8 },
    AwaitingResponse { attempt: u8, raw: Vec<u8> },
    Retrying { attempt: u8, cause: Error },
    Validated(Exchange),
    Failed(Error),
}

macro_rules! expect_reply {
    ($reply:expr, $pattern:pat => $value:expr) => {
        match $reply {
            $pattern => Ok($value),
            other => Err(Error::MalformedFrame(format!("unexpected reply {other:?}"))),
        }
    };
}

/// Client for a chain of BMS boards behind one serial link.
///
/// Every logical call is retried up to [`MAX_ATTEMPTS`] times on timeouts,
/// CRC errors and malformed replies. I/O errors end the call at once.
pub struct Bms {
    session: Session,
    sink: Arc<dyn TelemetrySink>,
    attempts: u8,
    delay: Duration,
    pending: AtomicBool,
    last_execution: Mutex<Instant>,
    cells: Mutex<HashMap<Device, u8>>,
}

impl std::fmt::Debug for Bms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bms")
            .field("session", &self.session)
            .field("attempts", &self.attempts)
            .field("delay", &self.delay)
            .finish()
    }
}

impl Default for Bms {
    fn default() -> Self {
        Self::new(Session::new())
    }
}

impl Bms {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            sink: Arc::new(LogSink),
            attempts: MAX_ATTEMPTS,
            delay: MINIMUM_DELAY,
            pending: AtomicBool::new(false),
            last_execution: Mutex::new(Instant::now()),
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    /// Attempts per call; at least one.
    pub fn set_attempts(&mut self, attempts: u8) {
        self.attempts = attempts.max(1);
    }

    pub fn set_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sink = sink;
    }

    /// Opens `port` and checks that a BMS answers the start of communication.
    #[cfg(feature = "serialport")]
    pub fn connect(&self, port: &str) -> Result<()> {
        self.session.open(port)?;
        self.handshake()
    }

    /// Like [`Bms::connect`] over an already opened link.
    pub fn connect_link(&self, name: &str, link: Box<dyn crate::transport::Link>) -> Result<()> {
        self.session.attach(name, link)?;
        self.handshake()
    }

    fn handshake(&self) -> Result<()> {
        if let Err(err) = self.start_communication(Device::MASTER) {
            log::error!("No BMS answered on '{}': {err}", self.port_label());
            self.session.close();
            return Err(err);
        }
        Ok(())
    }

    /// Stops communication if possible, then closes the link.
    pub fn disconnect(&self) {
        if self.session.is_connected() {
            if let Err(err) = self.stop_communication(Device::MASTER) {
                log::warn!("Cannot stop communication: {err}");
            }
        }
        self.session.close();
    }

    fn port_label(&self) -> String {
        self.session
            .port_name()
            .unwrap_or_else(|| "<unknown>".into())
    }

    fn serial_await_delay(&self) {
        let last_execution = *self
            .last_execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let last_exec_diff = Instant::now().duration_since(last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn emit(&self, request: &Request, attempt: u8, tx: &[u8], outcome: Outcome) {
        self.sink.record(&ExchangeEvent {
            timestamp: chrono::Utc::now(),
            device: request.device().address(),
            command: request.command(),
            attempt,
            request: tx.to_vec(),
            outcome,
        });
    }

    fn settle(&self, command: Command, attempt: u8, err: Error) -> State {
        if !err.is_transient() {
            State::Failed(err)
        } else if attempt < self.attempts {
            State::Retrying {
                attempt,
                cause: err,
            }
        } else {
            State::Failed(Error::CommunicationFailed {
                command,
                attempts: attempt,
                last: Box::new(err),
            })
        }
    }

    /// Blocks calls as if one were outstanding.
    #[cfg(test)]
    pub(crate) fn claim_pending(&self) -> Result<ExchangeGuard<'_>> {
        ExchangeGuard::claim(&self.pending)
    }

    /// Runs one logical call and returns the first reply that validates.
    pub fn execute(&self, request: &Request) -> Result<Exchange> {
        let _pending = ExchangeGuard::claim(&self.pending)?;
        let tx = request.encode()?;
        let reply_size = request.reply_size();
        let command = request.command();

        let mut state = State::Sending { attempt: 1 };
        loop {
            state = match state {
                State::Sending { attempt } => {
                    self.serial_await_delay();
                    let result = self.session.write_then_read(&tx, reply_size);
                    *self
                        .last_execution
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Instant::now();
                    match result {
                        Ok(raw) => State::AwaitingResponse { attempt, raw },
                        Err(err) => {
                            self.emit(request, attempt, &tx, Outcome::Error(err.to_string()));
                            self.settle(command, attempt, err)
                        }
                    }
                }
                State::AwaitingResponse { attempt, raw } => match request.validate(&raw) {
                    Ok(frame) => {
                        self.emit(request, attempt, &tx, Outcome::Response(raw.clone()));
                        State::Validated(Exchange {
                            frame,
                            raw,
                            attempts: attempt,
                        })
                    }
                    Err(err) => {
                        let outcome = Outcome::Rejected {
                            response: raw,
                            error: err.to_string(),
                        };
                        self.emit(request, attempt, &tx, outcome);
                        self.settle(command, attempt, err)
                    }
                },
                State::Retrying { attempt, cause } => {
                    log::warn!(
                        "Failed try {} of {} for {}, repeating ({cause})",
                        attempt,
                        self.attempts,
                        command
                    );
                    State::Sending {
                        attempt: attempt + 1,
                    }
                }
                State::Validated(exchange) => {
                    log::trace!("{} done after {} attempt(s)", command, exchange.attempts);
                    return Ok(exchange);
                }
                State::Failed(err) => return Err(err),
            };
        }
    }

    /// Runs `request` and converts the reply.
    pub fn call(&self, request: &Request) -> Result<Reply> {
        let exchange = self.execute(request)?;
        request.decode(&exchange.frame, &exchange.raw)
    }

    pub fn read(&self, device: Device, command: Command) -> Result<Reply> {
        self.call(&Request::read(device, command)?)
    }

    pub fn write(&self, device: Device, command: Command, value: u16) -> Result<Reply> {
        self.call(&Request::write(device, command, value)?)
    }

    fn register(&self, device: Device, command: Command) -> Result<u16> {
        expect_reply!(self.read(device, command)?, Reply::Register { value, .. } => value)
    }

    fn set_register(&self, device: Device, command: Command, value: u16) -> Result<()> {
        self.write(device, command, value).map(|_| ())
    }

    pub fn start_communication(&self, device: Device) -> Result<()> {
        self.set_register(device, Command::CommunicationControl, COMMUNICATION_START)
    }

    pub fn stop_communication(&self, device: Device) -> Result<()> {
        self.set_register(device, Command::CommunicationControl, COMMUNICATION_STOP)
    }

    /// Raw value of the communication control register.
    pub fn communication_status(&self, device: Device) -> Result<u16> {
        self.register(device, Command::CommunicationControl)
    }

    pub fn set_slave_count(&self, n_slaves: u8) -> Result<()> {
        self.set_register(Device::MASTER, Command::SlaveCount, u16::from(n_slaves))
    }

    pub fn slave_count(&self) -> Result<u8> {
        let value = self.register(Device::MASTER, Command::SlaveCount)?;
        u8::try_from(value)
            .map_err(|_| Error::MalformedFrame(format!("slave count {value} out of range")))
    }

    fn remember_cells(&self, device: Device, n_cells: u8) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device, n_cells);
    }

    fn known_cells(&self, device: Device) -> Option<u8> {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .copied()
    }

    pub fn set_cell_count(&self, device: Device, n_cells: u8) -> Result<()> {
        self.set_register(device, Command::CellCount, u16::from(n_cells))?;
        self.remember_cells(device, n_cells);
        Ok(())
    }

    pub fn cell_count(&self, device: Device) -> Result<u8> {
        let value = self.register(device, Command::CellCount)?;
        let n_cells = u8::try_from(value)
            .ok()
            .filter(|n| *n <= MAX_CELLS)
            .ok_or_else(|| Error::MalformedFrame(format!("cell count {value} out of range")))?;
        self.remember_cells(device, n_cells);
        Ok(n_cells)
    }

    pub fn pack_voltage(&self, device: Device) -> Result<f64> {
        expect_reply!(self.read(device, Command::PackVoltage)?, Reply::PackVoltage(v) => v)
    }

    pub fn pack_current(&self, device: Device) -> Result<f64> {
        expect_reply!(self.read(device, Command::PackCurrent)?, Reply::PackCurrent(a) => a)
    }

    /// All cell voltages the register holds, configured or not.
    pub fn cell_voltages(&self, device: Device) -> Result<Vec<f64>> {
        expect_reply!(self.read(device, Command::CellVoltage)?, Reply::CellVoltages(v) => v)
    }

    pub fn temperatures(&self, device: Device) -> Result<Vec<f64>> {
        expect_reply!(self.read(device, Command::Temperature)?, Reply::Temperatures(t) => t)
    }

    pub fn set_balancing(&self, device: Device, enable: bool) -> Result<()> {
        self.set_register(device, Command::Balancing, convert::balancing_flag(enable))
    }

    pub fn balancing(&self, device: Device) -> Result<bool> {
        Ok(self.register(device, Command::Balancing)? != 0)
    }

    pub fn set_balancing_sequence(&self, device: Device, pattern: u16) -> Result<()> {
        self.set_register(device, Command::BalancingSequence, pattern)
    }

    /// Balances the cells flagged `true`, cell 1 first.
    pub fn set_balancing_cells(&self, device: Device, cells: &[bool]) -> Result<()> {
        self.set_balancing_sequence(device, convert::balancing_pattern(cells))
    }

    pub fn balancing_state(&self, device: Device) -> Result<u16> {
        expect_reply!(self.read(device, Command::BalancingState)?, Reply::BalancingState(s) => s)
    }

    /// Sends `payload` with the debug function code and returns the raw exchange.
    pub fn debug(&self, device: Device, payload: &[u8]) -> Result<DebugReply> {
        expect_reply!(
            self.call(&Request::debug(device, payload.to_vec()))?,
            Reply::Debug(reply) => reply
        )
    }

    /// Pack voltage, current, cell voltages and temperatures in one exchange.
    ///
    /// Cell voltages are cut to the cell count of `device` once it is known
    /// from [`Bms::cell_count`] or [`Bms::set_cell_count`].
    pub fn read_all(&self, device: Device) -> Result<Telemetry> {
        let mut telemetry = expect_reply!(
            self.call(&Request::read_all(device))?,
            Reply::Telemetry(telemetry) => telemetry
        )?;
        if let Some(n_cells) = self.known_cells(device) {
            telemetry.cell_voltages.truncate(usize::from(n_cells));
        }
        Ok(telemetry)
    }

    /// [`Bms::read_all`] plus the balancing state.
    pub fn telemetry(&self, device: Device) -> Result<Telemetry> {
        let mut telemetry = self.read_all(device)?;
        telemetry.balancing = Some(self.balancing_state(device)?);
        Ok(telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Fault, SimulatedBms};
    use crate::transport::ConnectionState;

    fn connected(sim: &SimulatedBms) -> Bms {
        let bms = Bms::new(Session::with_timeout(Duration::from_millis(40)));
        bms.connect_link("sim", sim.link()).unwrap();
        bms
    }

    fn recorded(bms: &mut Bms) -> Arc<Mutex<Vec<ExchangeEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bms.set_sink(Arc::new(move |event: &ExchangeEvent| {
            sink.lock().unwrap().push(event.clone())
        }));
        events
    }

    #[test]
    fn connect_starts_communication() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        assert_eq!(sim.board(Device::MASTER).communication, COMMUNICATION_START);
        assert_eq!(bms.communication_status(Device::MASTER).unwrap(), COMMUNICATION_START);

        bms.disconnect();
        assert_eq!(sim.board(Device::MASTER).communication, COMMUNICATION_STOP);
        assert_eq!(bms.session().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_without_answer_closes_link() {
        let sim = SimulatedBms::new();
        for _ in 0..MAX_ATTEMPTS {
            sim.inject(Fault::Drop);
        }
        let bms = Bms::new(Session::with_timeout(Duration::from_millis(30)));
        let err = bms.connect_link("sim", sim.link()).unwrap_err();
        assert!(matches!(err, Error::CommunicationFailed { .. }), "{err}");
        assert_eq!(bms.session().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn retries_are_exhausted_after_three_attempts() {
        let sim = SimulatedBms::new();
        let mut bms = connected(&sim);
        let events = recorded(&mut bms);
        for _ in 0..MAX_ATTEMPTS {
            sim.inject(Fault::Drop);
        }
        let before = sim.request_count();

        let err = bms.pack_voltage(Device::MASTER).unwrap_err();
        match err {
            Error::CommunicationFailed {
                command,
                attempts,
                last,
            } => {
                assert_eq!(command, Command::PackVoltage);
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::Timeout(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sim.request_count() - before, 3);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| matches!(e.outcome, Outcome::Error(_))));
        assert_eq!(
            events.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn corrupt_reply_is_retried() {
        let sim = SimulatedBms::new();
        sim.update_board(Device::MASTER, |b| b.pack_voltage = 1000);
        let mut bms = connected(&sim);
        let events = recorded(&mut bms);
        sim.inject(Fault::CorruptCrc);

        let request = Request::read(Device::MASTER, Command::PackVoltage).unwrap();
        let exchange = bms.execute(&request).unwrap();
        assert_eq!(exchange.attempts, 2);
        assert_eq!(
            request.decode(&exchange.frame, &exchange.raw).unwrap(),
            Reply::PackVoltage(convert::pack_voltage(1000))
        );

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].outcome, Outcome::Rejected { .. }));
        assert!(matches!(events[1].outcome, Outcome::Response(_)));
        assert_eq!(events[1].device, 0x01);
    }

    #[test]
    fn foreign_reply_is_retried() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        sim.inject(Fault::WrongDevice);
        sim.inject(Fault::WrongDevice);
        let request = Request::read(Device::slave(2).unwrap(), Command::Temperature).unwrap();
        assert_eq!(bms.execute(&request).unwrap().attempts, 3);
    }

    #[test]
    fn io_errors_are_not_retried() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        sim.unplug();
        let before = sim.request_count();

        let err = bms.pack_current(Device::MASTER).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
        assert_eq!(sim.request_count(), before);
        assert_eq!(bms.session().state(), ConnectionState::Faulted);
    }

    #[test]
    fn invalid_requests_never_reach_the_wire() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        let before = sim.request_count();

        let err = bms.write(Device::MASTER, Command::PackVoltage, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)), "{err}");
        let err = bms.debug(Device::MASTER, &[]).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)), "{err}");
        assert!(bms.set_cell_count(Device::MASTER, 17).is_err());
        assert_eq!(sim.request_count(), before);
    }

    #[test]
    fn concurrent_call_is_busy() {
        let sim = SimulatedBms::new();
        let bms = Arc::new(Bms::new(Session::with_timeout(Duration::from_millis(400))));
        bms.connect_link("sim", sim.link()).unwrap();
        sim.inject(Fault::Delay(Duration::from_millis(150)));

        let first = {
            let bms = Arc::clone(&bms);
            std::thread::spawn(move || bms.pack_voltage(Device::MASTER))
        };
        std::thread::sleep(Duration::from_millis(50));
        let err = bms.pack_voltage(Device::MASTER).unwrap_err();
        assert!(matches!(err, Error::Busy), "{err}");
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn telemetry_uses_configured_cell_count() {
        let sim = SimulatedBms::new();
        let slave = Device::slave(1).unwrap();
        sim.update_board(slave, |b| {
            b.pack_current = 0xFFFF_FFFF;
            b.balancing = 1;
            b.balancing_sequence = 0b101;
        });
        let bms = connected(&sim);

        assert_eq!(bms.telemetry(slave).unwrap().cell_voltages.len(), 16);
        bms.set_cell_count(slave, 12).unwrap();
        assert_eq!(sim.board(slave).cell_count, 12);

        let telemetry = bms.telemetry(slave).unwrap();
        assert_eq!(telemetry.cell_voltages.len(), 12);
        assert_eq!(telemetry.temperatures.len(), 4);
        assert!((telemetry.pack_current + convert::PACK_CURRENT_SCALE).abs() < 1e-12);
        assert_eq!(
            &telemetry.balancing_cells().unwrap()[..3],
            &[true, false, true]
        );
    }

    #[test]
    fn cell_count_applies_to_its_own_board() {
        let sim = SimulatedBms::new();
        let slave = Device::slave(3).unwrap();
        let bms = connected(&sim);

        bms.set_cell_count(Device::MASTER, 12).unwrap();
        assert_eq!(sim.board(Device::MASTER).cell_count, 12);
        assert_eq!(sim.board(slave).cell_count, 16);

        assert_eq!(bms.read_all(Device::MASTER).unwrap().cell_voltages.len(), 12);
        assert_eq!(bms.read_all(slave).unwrap().cell_voltages.len(), 16);
        assert_eq!(bms.cell_count(slave).unwrap(), 16);
        assert_eq!(bms.telemetry(slave).unwrap().cell_voltages.len(), 16);
    }

    #[test]
    fn read_all_is_one_exchange() {
        let sim = SimulatedBms::new();
        let slave = Device::slave(5).unwrap();
        sim.update_board(slave, |b| {
            b.pack_voltage = 2000;
            b.pack_current = 1_000_000;
            b.cell_voltages[15] = 10_000;
            b.temperatures = [0, 1, 2, 3];
        });
        let bms = connected(&sim);
        let before = sim.request_count();

        let telemetry = bms.read_all(slave).unwrap();
        assert_eq!(sim.request_count() - before, 1);
        assert_eq!(telemetry.pack_voltage, bms.pack_voltage(slave).unwrap());
        assert_eq!(telemetry.pack_current, bms.pack_current(slave).unwrap());
        assert_eq!(telemetry.cell_voltages, bms.cell_voltages(slave).unwrap());
        assert_eq!(telemetry.temperatures, bms.temperatures(slave).unwrap());
        assert_eq!(telemetry.balancing, None);
    }

    #[test]
    fn balancing_writes() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        let slave = Device::slave(7).unwrap();
        bms.set_balancing(slave, true).unwrap();
        bms.set_balancing_cells(slave, &[false, true, true]).unwrap();
        assert!(bms.balancing(slave).unwrap());
        assert_eq!(bms.balancing_state(slave).unwrap(), 0b110);
        assert_eq!(sim.board(slave).balancing_sequence, 0b110);
    }

    #[test]
    fn slave_count_roundtrip() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        bms.set_slave_count(4).unwrap();
        assert_eq!(bms.slave_count().unwrap(), 4);
        assert!(bms.set_slave_count(36).is_err());
    }

    #[test]
    fn debug_passthrough() {
        let sim = SimulatedBms::new();
        let bms = connected(&sim);
        let reply = bms.debug(Device::MASTER, &[0x0C, 0x00, 0x01]).unwrap();
        assert_eq!(reply.payload, vec![0x0C, 0x00, 0x01]);
        assert_eq!(&reply.response[..2], &[0x01, 0x0B]);
        assert_eq!(reply.crc, crate::crc::received(&reply.request).unwrap());
    }
}
