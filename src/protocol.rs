use crate::convert;
use crate::frame::{self, Frame, PayloadLength, MAX_PAYLOAD_LENGTH};
use crate::Error;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const BAUD_RATE: u32 = 115_200;

/// Highest number of slave boards behind the master.
pub const MAX_SLAVES: u8 = 35;
/// Highest number of cells per board.
pub const MAX_CELLS: u8 = 16;

/// Words read from [`Command::PackVoltage`] on by [`Request::read_all`]: pack voltage,
/// current, cell voltages and zone temperatures.
pub const COMMON_READ_WORDS: u16 = 1 + 2 + MAX_CELLS as u16 + 4;

/// Value written to [`Command::CommunicationControl`] to start communication.
pub const COMMUNICATION_START: u16 = 0xAAAA;
/// Value written to [`Command::CommunicationControl`] to stop communication.
pub const COMMUNICATION_STOP: u16 = 0xA5A5;

/// Bus address of a board: the master is `0x01`, slave `n` is `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Device(u8);

impl Device {
    pub const MASTER: Device = Device(0x01);

    pub fn slave(number: u8) -> Result<Self, Error> {
        if !(1..=MAX_SLAVES).contains(&number) {
            return Err(Error::InvalidOperation(format!(
                "slave number {number} out of range 1..={MAX_SLAVES}"
            )));
        }
        Ok(Device(number + 1))
    }

    pub fn from_address(address: u8) -> Result<Self, Error> {
        match address {
            0x01 => Ok(Self::MASTER),
            _ => Self::slave(address.wrapping_sub(1)),
        }
    }

    pub fn address(self) -> u8 {
        self.0
    }

    pub fn slave_number(self) -> Option<u8> {
        (self.0 > 0x01).then(|| self.0 - 1)
    }

    /// Master followed by the first `n_slaves` slaves.
    pub fn chain(n_slaves: u8) -> Vec<Device> {
        std::iter::once(Self::MASTER)
            .chain((1..=n_slaves.min(MAX_SLAVES)).map(|n| Device(n + 1)))
            .collect()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::MASTER
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.slave_number() {
            None => write!(f, "master"),
            Some(n) => write!(f, "slave {n}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    Read = 0x03,
    Write = 0x06,
    Debug = 0x0B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        !matches!(self, Access::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, Access::ReadOnly)
    }
}

/// Commands understood by the BMS firmware, keyed by register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Command {
    CommunicationControl = 0x01,
    SlaveCount = 0x02,
    CellCount = 0x03,
    PackVoltage = 0x04,
    PackCurrent = 0x05,
    CellVoltage = 0x06,
    Temperature = 0x07,
    Balancing = 0x08,
    BalancingSequence = 0x09,
    BalancingState = 0x0A,
    Debug = 0x0B,
}

/// Static properties of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub name: &'static str,
    pub access: Access,
    /// Register width in 16 bit words; zero for the raw debug passthrough.
    pub words: u16,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::CommunicationControl,
        Command::SlaveCount,
        Command::CellCount,
        Command::PackVoltage,
        Command::PackCurrent,
        Command::CellVoltage,
        Command::Temperature,
        Command::Balancing,
        Command::BalancingSequence,
        Command::BalancingState,
        Command::Debug,
    ];

    pub const fn descriptor(self) -> Descriptor {
        use Access::*;
        let (name, access, words) = match self {
            Command::CommunicationControl => ("Communication Start/Stop", ReadWrite, 1),
            Command::SlaveCount => ("Number of Slaves", ReadWrite, 1),
            Command::CellCount => ("Number of Cells", ReadWrite, 1),
            Command::PackVoltage => ("Pack Voltage", ReadOnly, 1),
            Command::PackCurrent => ("Pack Current", ReadOnly, 2),
            Command::CellVoltage => ("Cell Voltage", ReadOnly, MAX_CELLS as u16),
            Command::Temperature => ("Battery Temperature", ReadOnly, 4),
            Command::Balancing => ("Cell Balancing", ReadWrite, 1),
            Command::BalancingSequence => ("Set Balancing Sequence", WriteOnly, 1),
            Command::BalancingState => ("Read Balancing State", ReadOnly, 1),
            Command::Debug => ("Debug Command", ReadWrite, 0),
        };
        Descriptor {
            name,
            access,
            words,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .into_iter()
            .find(|c| c.code() == code)
            .ok_or_else(|| Error::InvalidOperation(format!("unknown command code {code:#04X}")))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04X} ({})", self.code(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read,
    /// Registers 0x04 to 0x07 in one exchange.
    ReadAll,
    Write(u16),
    Raw(Vec<u8>),
}

/// One logical call, validated against the command table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    device: Device,
    command: Command,
    operation: Operation,
}

impl Request {
    pub fn read(device: Device, command: Command) -> Result<Self, Error> {
        if command == Command::Debug {
            return Err(Error::InvalidOperation(format!(
                "{command} only accepts raw payloads"
            )));
        }
        if !command.descriptor().access.readable() {
            return Err(Error::InvalidOperation(format!("{command} is write-only")));
        }
        Ok(Self {
            device,
            command,
            operation: Operation::Read,
        })
    }

    pub fn write(device: Device, command: Command, value: u16) -> Result<Self, Error> {
        if command == Command::Debug {
            return Err(Error::InvalidOperation(format!(
                "{command} only accepts raw payloads"
            )));
        }
        if !command.descriptor().access.writable() {
            return Err(Error::InvalidOperation(format!("{command} is read-only")));
        }
        let valid = match command {
            Command::CommunicationControl => {
                value == COMMUNICATION_START || value == COMMUNICATION_STOP
            }
            Command::SlaveCount => value <= u16::from(MAX_SLAVES),
            Command::CellCount => value <= u16::from(MAX_CELLS),
            Command::Balancing => value <= 1,
            _ => true,
        };
        if !valid {
            return Err(Error::InvalidOperation(format!(
                "value {value:#06X} out of range for {command}"
            )));
        }
        Ok(Self {
            device,
            command,
            operation: Operation::Write(value),
        })
    }

    /// Pack voltage, current, cell voltages and temperatures of `device` at once.
    pub fn read_all(device: Device) -> Self {
        Self {
            device,
            command: Command::PackVoltage,
            operation: Operation::ReadAll,
        }
    }

    /// Raw passthrough; the payload shape is checked when encoding.
    pub fn debug(device: Device, payload: Vec<u8>) -> Self {
        Self {
            device,
            command: Command::Debug,
            operation: Operation::Raw(payload),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn function(&self) -> FunctionCode {
        match self.operation {
            Operation::Read | Operation::ReadAll => FunctionCode::Read,
            Operation::Write(_) => FunctionCode::Write,
            Operation::Raw(_) => FunctionCode::Debug,
        }
    }

    /// Register words a read covers.
    fn words(&self) -> u16 {
        match self.operation {
            Operation::ReadAll => COMMON_READ_WORDS,
            _ => self.command.descriptor().words,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let register = self.command.code();
        match &self.operation {
            Operation::Read | Operation::ReadAll => {
                let [hi, lo] = self.words().to_be_bytes();
                vec![register, hi, lo]
            }
            Operation::Write(value) => {
                let [hi, lo] = value.to_be_bytes();
                vec![register, hi, lo]
            }
            Operation::Raw(bytes) => bytes.clone(),
        }
    }

    fn request_rule(&self) -> PayloadLength {
        match self.operation {
            Operation::Raw(_) => PayloadLength::Between(1, MAX_PAYLOAD_LENGTH),
            _ => PayloadLength::Exact(3),
        }
    }

    pub fn response_rule(&self) -> PayloadLength {
        match self.operation {
            Operation::Read | Operation::ReadAll => {
                PayloadLength::Exact(2 + 2 * usize::from(self.words()))
            }
            Operation::Write(_) => PayloadLength::Exact(3),
            Operation::Raw(_) => PayloadLength::Between(0, MAX_PAYLOAD_LENGTH),
        }
    }

    /// Wire bytes of the request, CRC included.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        frame::encode(
            self.device.address(),
            self.function() as u8,
            &self.payload(),
            self.request_rule(),
        )
    }

    /// Length of a complete reply, unless it is only known once the line goes idle.
    pub fn reply_size(&self) -> Option<usize> {
        self.response_rule().frame_length()
    }

    /// Checks that `bytes` is an intact reply to this request.
    pub fn validate(&self, bytes: &[u8]) -> Result<Frame, Error> {
        let frame = frame::decode(bytes, self.response_rule())?;
        self.check(&frame)?;
        Ok(frame)
    }

    /// Structural checks of a reply frame against this request.
    fn check(&self, frame: &Frame) -> Result<(), Error> {
        let rule = self.response_rule();
        if !rule.admits(frame.payload.len()) {
            return Err(Error::MalformedFrame(format!(
                "payload of {} bytes, expected {rule}",
                frame.payload.len()
            )));
        }
        if frame.device != self.device.address() {
            return Err(Error::MalformedFrame(format!(
                "reply from device {:#04X}, expected {:#04X}",
                frame.device,
                self.device.address()
            )));
        }
        if frame.function != self.function() as u8 {
            return Err(Error::MalformedFrame(format!(
                "reply with function {:#04X}, expected {:#04X}",
                frame.function,
                self.function() as u8
            )));
        }
        match &self.operation {
            Operation::Read | Operation::ReadAll => {
                let byte_count = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                let expected = 2 * self.words();
                if byte_count != expected {
                    return Err(Error::MalformedFrame(format!(
                        "byte count {byte_count}, expected {expected}"
                    )));
                }
            }
            Operation::Write(_) => {
                if frame.payload != self.payload() {
                    return Err(Error::MalformedFrame(format!(
                        "write echo {:02X?} does not match request",
                        frame.payload
                    )));
                }
            }
            Operation::Raw(_) => {}
        }
        Ok(())
    }

    /// Converts a reply into physical values; frames that do not fit this
    /// request fail with [`Error::MalformedFrame`].
    pub fn decode(&self, frame: &Frame, raw: &[u8]) -> Result<Reply, Error> {
        self.check(frame)?;
        let command = self.command;
        let words = match &self.operation {
            Operation::Write(value) => {
                return Ok(Reply::Acknowledged {
                    command,
                    value: *value,
                })
            }
            Operation::Raw(_) => {
                let request = self.encode()?;
                let crc = crate::crc::received(&request).unwrap_or_default();
                return Ok(Reply::Debug(DebugReply {
                    request,
                    crc,
                    response: raw.to_vec(),
                    payload: frame.payload.clone(),
                }));
            }
            Operation::ReadAll => {
                let words = registers(&frame.payload);
                log::trace!("common read registers={words:04X?}");
                return Ok(Reply::Telemetry(common_read(&words)));
            }
            Operation::Read => registers(&frame.payload),
        };
        log::trace!("{command} registers={words:04X?}");
        Ok(match command {
            Command::PackVoltage => Reply::PackVoltage(convert::pack_voltage(words[0])),
            Command::PackCurrent => {
                let raw = (u32::from(words[0]) << 16) | u32::from(words[1]);
                Reply::PackCurrent(convert::pack_current(raw, 32))
            }
            Command::CellVoltage => Reply::CellVoltages(
                words.iter().copied().map(convert::cell_voltage).collect(),
            ),
            Command::Temperature => Reply::Temperatures(
                words.iter().copied().map(convert::zone_temperature).collect(),
            ),
            Command::BalancingState => Reply::BalancingState(words[0]),
            Command::CommunicationControl
            | Command::SlaveCount
            | Command::CellCount
            | Command::Balancing
            | Command::BalancingSequence
            | Command::Debug => Reply::Register {
                command,
                value: words[0],
            },
        })
    }
}

/// Data words of a read reply, after the two byte count bytes.
fn registers(payload: &[u8]) -> Vec<u16> {
    payload[2..]
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect()
}

/// Splits the words of [`Request::read_all`]; `words` holds [`COMMON_READ_WORDS`] entries.
fn common_read(words: &[u16]) -> Telemetry {
    let cells = 3 + usize::from(MAX_CELLS);
    let current = (u32::from(words[1]) << 16) | u32::from(words[2]);
    Telemetry {
        pack_voltage: convert::pack_voltage(words[0]),
        pack_current: convert::pack_current(current, 32),
        cell_voltages: words[3..cells]
            .iter()
            .copied()
            .map(convert::cell_voltage)
            .collect(),
        temperatures: words[cells..]
            .iter()
            .copied()
            .map(convert::zone_temperature)
            .collect(),
        balancing: None,
    }
}

/// Raw exchange of the debug passthrough, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DebugReply {
    /// Request frame as sent.
    pub request: Vec<u8>,
    /// CRC appended to the request.
    pub crc: u16,
    /// Reply frame as received.
    pub response: Vec<u8>,
    /// Reply payload without address, function code and CRC.
    pub payload: Vec<u8>,
}

/// Decoded outcome of a logical call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Reply {
    /// Echo of an accepted write.
    Acknowledged { command: Command, value: u16 },
    /// Configuration register without unit.
    Register { command: Command, value: u16 },
    PackVoltage(f64),
    PackCurrent(f64),
    CellVoltages(Vec<f64>),
    Temperatures(Vec<f64>),
    BalancingState(u16),
    /// Result of [`Request::read_all`].
    Telemetry(Telemetry),
    Debug(DebugReply),
}

/// Physical reading of one board.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Telemetry {
    pub pack_voltage: f64,
    pub pack_current: f64, // negative=charging, positive=discharging
    pub cell_voltages: Vec<f64>,
    pub temperatures: Vec<f64>,
    /// Balancing state register, absent when only the common read was done.
    pub balancing: Option<u16>,
}

impl Telemetry {
    /// Balancing state per cell, as many cells as voltages were reported.
    pub fn balancing_cells(&self) -> Option<Vec<bool>> {
        self.balancing
            .map(|pattern| convert::balancing_cells(pattern, self.cell_voltages.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_reply(request: &Request, words: &[u16]) -> Vec<u8> {
        let mut payload = ((words.len() * 2) as u16).to_be_bytes().to_vec();
        for w in words {
            payload.extend_from_slice(&w.to_be_bytes());
        }
        Frame::new(
            request.device().address(),
            FunctionCode::Read as u8,
            payload,
        )
        .to_bytes()
    }

    #[test]
    fn table_is_complete_and_ordered() {
        for (i, command) in Command::ALL.into_iter().enumerate() {
            assert_eq!(usize::from(command.code()), i + 1);
            assert_eq!(Command::try_from(command.code()).unwrap(), command);
        }
        assert!(Command::try_from(0x0C).is_err());
        assert!(Command::try_from(0x00).is_err());
        assert_eq!(Command::PackCurrent.descriptor().words, 2);
        assert_eq!(
            Command::BalancingSequence.descriptor().access,
            Access::WriteOnly
        );
        assert_eq!(Command::PackVoltage.to_string(), "0x04 (Pack Voltage)");
    }

    #[test]
    fn device_addresses() {
        assert_eq!(Device::MASTER.address(), 0x01);
        assert_eq!(Device::slave(1).unwrap().address(), 0x02);
        assert_eq!(Device::slave(35).unwrap().address(), 0x24);
        assert!(Device::slave(0).is_err());
        assert!(Device::slave(36).is_err());
        assert_eq!(Device::from_address(0x24).unwrap().slave_number(), Some(35));
        assert!(Device::from_address(0x25).is_err());
        assert!(Device::from_address(0x00).is_err());
        assert_eq!(Device::chain(2).len(), 3);
        assert_eq!(Device::chain(200).len(), 36);
        assert_eq!(Device::slave(3).unwrap().to_string(), "slave 3");
    }

    #[test]
    fn read_request_layout() {
        let request = Request::read(Device::MASTER, Command::CellVoltage).unwrap();
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..5], &[0x01, 0x03, 0x06, 0x00, 0x10]);
        assert_eq!(bytes.len(), 7);
        assert!(crate::crc::validate(&bytes));
        assert_eq!(request.reply_size(), Some(4 + 2 + 32));
    }

    #[test]
    fn write_request_layout() {
        let request =
            Request::write(Device::MASTER, Command::CommunicationControl, COMMUNICATION_START)
                .unwrap();
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..5], &[0x01, 0x06, 0x01, 0xAA, 0xAA]);
        assert_eq!(request.reply_size(), Some(7));
    }

    #[test]
    fn write_on_read_only_is_rejected() {
        for command in [
            Command::PackVoltage,
            Command::PackCurrent,
            Command::CellVoltage,
            Command::Temperature,
            Command::BalancingState,
        ] {
            let err = Request::write(Device::MASTER, command, 1).unwrap_err();
            assert!(matches!(err, Error::InvalidOperation(_)), "{err}");
        }
        let err = Request::read(Device::MASTER, Command::BalancingSequence).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(Request::read(Device::MASTER, Command::Debug).is_err());
        assert!(Request::write(Device::MASTER, Command::Debug, 0).is_err());
    }

    #[test]
    fn write_values_are_range_checked() {
        let master = Device::MASTER;
        assert!(Request::write(master, Command::SlaveCount, 35).is_ok());
        assert!(Request::write(master, Command::SlaveCount, 36).is_err());
        assert!(Request::write(master, Command::CellCount, 16).is_ok());
        assert!(Request::write(master, Command::CellCount, 17).is_err());
        assert!(Request::write(master, Command::Balancing, 2).is_err());
        assert!(Request::write(master, Command::CommunicationControl, COMMUNICATION_STOP).is_ok());
        assert!(Request::write(master, Command::CommunicationControl, 0x0001).is_err());
        assert!(Request::write(master, Command::BalancingSequence, 0xFFFF).is_ok());
    }

    #[test]
    fn empty_debug_payload_fails_to_encode() {
        let err = Request::debug(Device::MASTER, vec![]).encode().unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(Request::debug(Device::MASTER, vec![0x55]).encode().is_ok());
    }

    #[test]
    fn decode_pack_current_reply() {
        let request = Request::read(Device::MASTER, Command::PackCurrent).unwrap();
        let raw = read_reply(&request, &[0xFFFF, 0xFFFF]);
        let frame = request.validate(&raw).unwrap();
        match request.decode(&frame, &raw).unwrap() {
            Reply::PackCurrent(amps) => assert!((amps + 14.9e-6).abs() < 1e-12),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn decode_temperature_reply() {
        let request = Request::read(Device::slave(2).unwrap(), Command::Temperature).unwrap();
        let raw = read_reply(&request, &[0, 1, 2, 3]);
        let frame = request.validate(&raw).unwrap();
        let Reply::Temperatures(zones) = request.decode(&frame, &raw).unwrap() else {
            panic!("expected temperatures");
        };
        assert_eq!(zones.len(), 4);
        assert!((zones[0] - 119.824).abs() < 1e-9);
        assert!((zones[3] - convert::zone_temperature(3)).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_foreign_device_and_bad_count() {
        let request = Request::read(Device::MASTER, Command::PackVoltage).unwrap();
        let foreign = Frame::new(0x02, 0x03, vec![0x00, 0x02, 0x03, 0xE8]).to_bytes();
        assert!(matches!(
            request.validate(&foreign),
            Err(Error::MalformedFrame(_))
        ));
        let bad_count = Frame::new(0x01, 0x03, vec![0x00, 0x04, 0x03, 0xE8]).to_bytes();
        assert!(matches!(
            request.validate(&bad_count),
            Err(Error::MalformedFrame(_))
        ));
        let wrong_function = Frame::new(0x01, 0x06, vec![0x00, 0x02, 0x03, 0xE8]).to_bytes();
        assert!(matches!(
            request.validate(&wrong_function),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn write_echo_must_match() {
        let request = Request::write(Device::MASTER, Command::CellCount, 12).unwrap();
        let echo = Frame::new(0x01, 0x06, vec![0x03, 0x00, 0x0C]).to_bytes();
        let frame = request.validate(&echo).unwrap();
        assert_eq!(
            request.decode(&frame, &echo).unwrap(),
            Reply::Acknowledged {
                command: Command::CellCount,
                value: 12
            }
        );
        let wrong = Frame::new(0x01, 0x06, vec![0x03, 0x00, 0x0D]).to_bytes();
        assert!(matches!(
            request.validate(&wrong),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_frames_that_do_not_fit() {
        let request = Request::read(Device::MASTER, Command::PackVoltage).unwrap();
        let empty = Frame::new(0x01, 0x03, vec![]);
        assert!(matches!(
            request.decode(&empty, &empty.to_bytes()),
            Err(Error::MalformedFrame(_))
        ));
        let count_only = Frame::new(0x01, 0x03, vec![0x00, 0x02]);
        assert!(matches!(
            request.decode(&count_only, &count_only.to_bytes()),
            Err(Error::MalformedFrame(_))
        ));

        let request = Request::read(Device::MASTER, Command::PackCurrent).unwrap();
        let half = Frame::new(0x01, 0x03, vec![0x00, 0x02, 0xFF, 0xFF]);
        assert!(matches!(
            request.decode(&half, &half.to_bytes()),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn common_read_covers_four_registers() {
        let request = Request::read_all(Device::slave(1).unwrap());
        let bytes = request.encode().unwrap();
        assert_eq!(&bytes[..5], &[0x02, 0x03, 0x04, 0x00, 0x17]);
        assert_eq!(request.reply_size(), Some(4 + 2 + 2 * 23));

        let mut words = vec![1000, 0xFFFF, 0xFFFF];
        words.extend((0..16).map(|i| 20_000 + i));
        words.extend([0, 1, 2, 3]);
        let raw = read_reply(&request, &words);
        let frame = request.validate(&raw).unwrap();
        let Reply::Telemetry(telemetry) = request.decode(&frame, &raw).unwrap() else {
            panic!("expected telemetry");
        };
        assert_eq!(telemetry.pack_voltage, convert::pack_voltage(1000));
        assert!((telemetry.pack_current + 14.9e-6).abs() < 1e-12);
        assert_eq!(telemetry.cell_voltages.len(), 16);
        assert_eq!(telemetry.cell_voltages[15], convert::cell_voltage(20_015));
        assert_eq!(telemetry.temperatures[3], convert::zone_temperature(3));
        assert_eq!(telemetry.balancing, None);
        assert_eq!(telemetry.balancing_cells(), None);

        let short = read_reply(&request, &words[..19]);
        assert!(matches!(
            request.validate(&short),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn debug_reply_carries_request_crc() {
        let request = Request::debug(Device::MASTER, vec![0x10, 0x20]);
        let raw = Frame::new(0x01, 0x0B, vec![0x99]).to_bytes();
        let frame = request.validate(&raw).unwrap();
        let Reply::Debug(reply) = request.decode(&frame, &raw).unwrap() else {
            panic!("expected debug reply");
        };
        assert_eq!(reply.crc, crate::crc::compute(&[0x01, 0x0B, 0x10, 0x20]));
        assert_eq!(reply.response, raw);
        assert_eq!(reply.payload, vec![0x99]);
        assert_eq!(request.reply_size(), None);
    }
}
