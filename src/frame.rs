//! Wire frames: `device, function, payload.., crc_lo, crc_hi`.

use crate::{crc, Error};
use std::fmt;

/// Device address, function code and CRC.
pub const OVERHEAD: usize = 4;
/// Smallest frame that can be valid.
pub const MIN_FRAME_LENGTH: usize = OVERHEAD;
/// Largest payload of a Modbus-RTU frame (256 byte ADU).
pub const MAX_PAYLOAD_LENGTH: usize = 252;

/// Admissible payload length for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLength {
    Exact(usize),
    Between(usize, usize),
}

impl PayloadLength {
    pub fn admits(&self, len: usize) -> bool {
        match *self {
            PayloadLength::Exact(n) => len == n,
            PayloadLength::Between(min, max) => (min..=max).contains(&len),
        }
    }

    /// Total frame length, when the rule pins it down.
    pub fn frame_length(&self) -> Option<usize> {
        match *self {
            PayloadLength::Exact(n) => Some(n + OVERHEAD),
            PayloadLength::Between(..) => None,
        }
    }
}

impl fmt::Display for PayloadLength {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayloadLength::Exact(n) => write!(f, "{n} bytes"),
            PayloadLength::Between(min, max) => write!(f, "{min}..={max} bytes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(device: u8, function: u8, payload: Vec<u8>) -> Self {
        Self {
            device,
            function,
            payload,
        }
    }

    /// Serializes the frame and appends its CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.payload.len() + OVERHEAD);
        buffer.push(self.device);
        buffer.push(self.function);
        buffer.extend_from_slice(&self.payload);
        crc::append(&mut buffer);
        buffer
    }
}

/// Builds the wire bytes of a request whose payload must satisfy `rule`.
pub fn encode(
    device: u8,
    function: u8,
    payload: &[u8],
    rule: PayloadLength,
) -> Result<Vec<u8>, Error> {
    if !rule.admits(payload.len()) || payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(Error::Encoding(format!(
            "payload of {} bytes for function {function:#04X}, expected {rule}",
            payload.len()
        )));
    }
    Ok(Frame::new(device, function, payload.to_vec()).to_bytes())
}

/// Validates and splits a received frame whose payload must satisfy `rule`.
pub fn decode(bytes: &[u8], rule: PayloadLength) -> Result<Frame, Error> {
    if bytes.len() < MIN_FRAME_LENGTH {
        return Err(Error::MalformedFrame(format!(
            "{} bytes received, at least {MIN_FRAME_LENGTH} required",
            bytes.len()
        )));
    }
    let body = &bytes[..bytes.len() - 2];
    let calculated = crc::compute(body);
    let received = crc::received(bytes).unwrap_or_default();
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} buffer={bytes:02X?}"
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    let payload = &body[2..];
    if !rule.admits(payload.len()) {
        return Err(Error::MalformedFrame(format!(
            "payload of {} bytes, expected {rule}",
            payload.len()
        )));
    }
    Ok(Frame::new(body[0], body[1], payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_little_endian_crc() {
        let bytes = encode(0x01, 0x03, &[0x04, 0x00, 0x01], PayloadLength::Exact(3)).unwrap();
        assert_eq!(&bytes[..5], &[0x01, 0x03, 0x04, 0x00, 0x01]);
        let crc = crc::compute(&bytes[..5]);
        assert_eq!(bytes[5], (crc & 0xFF) as u8);
        assert_eq!(bytes[6], (crc >> 8) as u8);
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let rule = PayloadLength::Between(0, MAX_PAYLOAD_LENGTH);
        for payload in [vec![], vec![0x0A, 0x00, 0x01], (0..=251).collect::<Vec<u8>>()] {
            let bytes = encode(0x24, 0x0B, &payload, rule).unwrap();
            let frame = decode(&bytes, rule).unwrap();
            assert_eq!(frame, Frame::new(0x24, 0x0B, payload));
        }
    }

    #[test]
    fn encode_rejects_wrong_payload_length() {
        let err = encode(0x01, 0x06, &[0x02, 0x00], PayloadLength::Exact(3)).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)), "{err}");
        let oversized = vec![0u8; MAX_PAYLOAD_LENGTH + 1];
        let err = encode(0x01, 0x0B, &oversized, PayloadLength::Between(1, 1024)).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)), "{err}");
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = decode(&[0x01, 0x03, 0x00], PayloadLength::Exact(0)).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_corrupted_crc() {
        let mut bytes = Frame::new(0x01, 0x03, vec![0x00, 0x02, 0x12, 0x34]).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let err = decode(&bytes, PayloadLength::Exact(4)).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
    }

    #[test]
    fn decode_rejects_unexpected_length() {
        let bytes = Frame::new(0x01, 0x03, vec![0x00, 0x02, 0x12, 0x34]).to_bytes();
        let err = decode(&bytes, PayloadLength::Exact(6)).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn frame_length_is_known_for_exact_rules() {
        assert_eq!(PayloadLength::Exact(3).frame_length(), Some(7));
        assert_eq!(PayloadLength::Between(0, 10).frame_length(), None);
    }
}
