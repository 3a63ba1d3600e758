//! CRC16 over the polynomial x¹⁶+x¹⁵+x²+1, as used by the BMS firmware.
//!
//! The firmware runs a reflected table implementation (0xA001) starting from
//! [`INITIAL`] without final XOR. The CRC is appended low byte first.

/// 0x8005 in reflected bit order.
const POLYNOMIAL: u16 = 0xA001;

/// Initial register value, shared by the encode and decode paths.
pub const INITIAL: u16 = 0xFFFF;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// Computes the CRC of `bytes`.
pub fn compute(bytes: &[u8]) -> u16 {
    bytes.iter().fold(INITIAL, |crc, &b| {
        (crc >> 8) ^ TABLE[usize::from((crc ^ u16::from(b)) as u8)]
    })
}

/// Checks the trailing little-endian CRC of `frame` against the preceding bytes.
pub fn validate(frame: &[u8]) -> bool {
    match received(frame) {
        Some(crc) => crc == compute(&frame[..frame.len() - 2]),
        None => false,
    }
}

/// The trailing little-endian CRC field, if the buffer holds one.
pub fn received(frame: &[u8]) -> Option<u16> {
    let len = frame.len();
    if len < 2 {
        return None;
    }
    Some(u16::from_le_bytes([frame[len - 2], frame[len - 1]]))
}

/// Appends the CRC of the current buffer content.
pub fn append(buffer: &mut Vec<u8>) {
    let crc = compute(buffer);
    buffer.extend_from_slice(&crc.to_le_bytes());
}
