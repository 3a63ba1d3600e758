//! In-memory BMS that answers frames the way the firmware does.
//!
//! [`SimulatedBms`] is a [`Link`], so it can be attached to a
//! [`Session`](crate::transport::Session) in place of a serial port. Clones
//! share the same boards, which lets a test change register values or inject
//! faults while a client is talking to it.

use crate::frame::{self, Frame, PayloadLength, MAX_PAYLOAD_LENGTH};
use crate::protocol::{Command, Device, FunctionCode, MAX_CELLS, MAX_SLAVES};
use crate::transport::Link;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Request frames kept for [`SimulatedBms::requests`].
pub const REQUEST_HISTORY: usize = 64;

/// Register content of one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardModel {
    pub communication: u16,
    pub slave_count: u16,
    pub cell_count: u16,
    pub pack_voltage: u16,
    pub pack_current: u32,
    pub cell_voltages: [u16; MAX_CELLS as usize],
    pub temperatures: [u16; 4],
    pub balancing: u16,
    pub balancing_sequence: u16,
}

impl Default for BoardModel {
    fn default() -> Self {
        Self {
            communication: crate::protocol::COMMUNICATION_STOP,
            slave_count: 0,
            cell_count: u16::from(MAX_CELLS),
            pack_voltage: 16_000,
            pack_current: 0,
            cell_voltages: [20_000; MAX_CELLS as usize],
            temperatures: [2; 4],
            balancing: 0,
            balancing_sequence: 0,
        }
    }
}

impl BoardModel {
    fn read(&self, command: Command) -> Option<Vec<u16>> {
        Some(match command {
            Command::CommunicationControl => vec![self.communication],
            Command::SlaveCount => vec![self.slave_count],
            Command::CellCount => vec![self.cell_count],
            Command::PackVoltage => vec![self.pack_voltage],
            Command::PackCurrent => {
                vec![(self.pack_current >> 16) as u16, self.pack_current as u16]
            }
            Command::CellVoltage => self.cell_voltages.to_vec(),
            Command::Temperature => self.temperatures.to_vec(),
            Command::Balancing => vec![self.balancing],
            Command::BalancingState => {
                vec![if self.balancing != 0 { self.balancing_sequence } else { 0 }]
            }
            Command::BalancingSequence | Command::Debug => return None,
        })
    }

    /// `words` registers from `start` on, spanning the following commands.
    fn read_span(&self, start: Command, words: usize) -> Option<Vec<u16>> {
        let mut registers = self.read(start)?;
        let mut next = start.code();
        while registers.len() < words {
            next += 1;
            match Command::try_from(next).ok().and_then(|command| self.read(command)) {
                Some(block) => registers.extend(block),
                None => break,
            }
        }
        registers.resize(words, 0);
        Some(registers)
    }

    fn write(&mut self, command: Command, value: u16) -> bool {
        match command {
            Command::CommunicationControl => self.communication = value,
            Command::SlaveCount => self.slave_count = value,
            Command::CellCount => self.cell_count = value,
            Command::Balancing => self.balancing = value,
            Command::BalancingSequence => self.balancing_sequence = value,
            _ => return false,
        }
        true
    }
}

/// Disturbance applied to the reply of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No reply at all.
    Drop,
    /// Reply with a damaged CRC.
    CorruptCrc,
    /// Reply as if sent by another board.
    WrongDevice,
    /// Reply only after the given time.
    Delay(Duration),
}

#[derive(Debug)]
struct State {
    boards: BTreeMap<u8, BoardModel>,
    faults: VecDeque<Fault>,
    requests: VecDeque<Vec<u8>>,
    request_count: u64,
    outbox: VecDeque<u8>,
    ready_at: Instant,
    unplugged: bool,
}

#[derive(Debug, Clone)]
pub struct SimulatedBms {
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedBms {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBms {
    /// Master and all slave boards with default register values.
    pub fn new() -> Self {
        let boards = Device::chain(MAX_SLAVES)
            .into_iter()
            .map(|device| (device.address(), BoardModel::default()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                boards,
                faults: VecDeque::new(),
                requests: VecDeque::with_capacity(REQUEST_HISTORY),
                request_count: 0,
                outbox: VecDeque::new(),
                ready_at: Instant::now(),
                unplugged: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle for [`Session::attach`](crate::transport::Session::attach).
    pub fn link(&self) -> Box<dyn Link> {
        Box::new(self.clone())
    }

    pub fn board(&self, device: Device) -> BoardModel {
        self.lock()
            .boards
            .get(&device.address())
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_board<F: FnOnce(&mut BoardModel)>(&self, device: Device, update: F) {
        if let Some(board) = self.lock().boards.get_mut(&device.address()) {
            update(board);
        }
    }

    /// Queues a fault for the reply to the next valid request; faults apply in order.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Every further read or write fails like a removed USB adapter.
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// The last [`REQUEST_HISTORY`] request frames, oldest first.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.iter().cloned().collect()
    }

    /// Request frames received since creation.
    pub fn request_count(&self) -> u64 {
        self.lock().request_count
    }

    fn respond(state: &mut State, request: &[u8]) -> Option<Vec<u8>> {
        // The firmware ignores frames it cannot check.
        let frame = frame::decode(request, PayloadLength::Between(0, MAX_PAYLOAD_LENGTH)).ok()?;
        let board = state.boards.get_mut(&frame.device)?;
        let payload = match frame.function {
            f if f == FunctionCode::Read as u8 && frame.payload.len() == 3 => {
                let command = Command::try_from(frame.payload[0]).ok()?;
                let words = usize::from(u16::from_be_bytes([frame.payload[1], frame.payload[2]]));
                let registers = board.read_span(command, words)?;
                let mut payload = ((words * 2) as u16).to_be_bytes().to_vec();
                for register in registers {
                    payload.extend_from_slice(&register.to_be_bytes());
                }
                payload
            }
            f if f == FunctionCode::Write as u8 && frame.payload.len() == 3 => {
                let command = Command::try_from(frame.payload[0]).ok()?;
                let value = u16::from_be_bytes([frame.payload[1], frame.payload[2]]);
                if !board.write(command, value) {
                    return None;
                }
                frame.payload.clone()
            }
            f if f == FunctionCode::Debug as u8 => frame.payload.clone(),
            _ => return None,
        };
        Some(Frame::new(frame.device, frame.function, payload).to_bytes())
    }
}

impl Read for SimulatedBms {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if state.outbox.is_empty() || Instant::now() < state.ready_at {
            drop(state);
            std::thread::sleep(Duration::from_millis(2));
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let n = buf.len().min(state.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedBms {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if state.requests.len() == REQUEST_HISTORY {
            state.requests.pop_front();
        }
        state.requests.push_back(buf.to_vec());
        state.request_count += 1;
        let Some(mut reply) = Self::respond(&mut state, buf) else {
            return Ok(buf.len());
        };
        state.ready_at = Instant::now();
        match state.faults.pop_front() {
            None => {}
            Some(Fault::Drop) => return Ok(buf.len()),
            Some(Fault::CorruptCrc) => {
                if let Some(last) = reply.last_mut() {
                    *last ^= 0xFF;
                }
            }
            Some(Fault::WrongDevice) => {
                reply = Frame::new(
                    reply[0].wrapping_add(1),
                    reply[1],
                    reply[2..reply.len() - 2].to_vec(),
                )
                .to_bytes();
            }
            Some(Fault::Delay(delay)) => state.ready_at = Instant::now() + delay,
        }
        state.outbox.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for SimulatedBms {
    fn clear_input(&mut self) -> io::Result<()> {
        self.lock().outbox.clear();
        Ok(())
    }
}
