//! Raw register values to physical units and back.

/// Volts per pack voltage count.
pub const PACK_VOLTAGE_SCALE: f64 = 3.05 / 1000.0;
/// Volts per cell voltage count.
pub const CELL_VOLTAGE_SCALE: f64 = 0.19073 / 1000.0;
/// Amperes per pack current count.
pub const PACK_CURRENT_SCALE: f64 = 14.9 / 1e6;

/// Number of cells addressable by a balancing pattern.
pub const PATTERN_CELLS: usize = 16;

macro_rules! read_bit {
    ($word:expr,$position:expr) => {
        ($word >> $position) & 1 != 0
    };
}

pub fn pack_voltage(raw: u16) -> f64 {
    f64::from(raw) * PACK_VOLTAGE_SCALE
}

pub fn cell_voltage(raw: u16) -> f64 {
    f64::from(raw) * CELL_VOLTAGE_SCALE
}

/// Interprets the low `width` bits of `raw` as a two's complement number.
pub fn signed(raw: u32, width: u32) -> i64 {
    debug_assert!((1..=32).contains(&width));
    let mask = if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    };
    let value = i64::from(raw & mask);
    if read_bit!(value, width - 1) {
        value - (1i64 << width)
    } else {
        value
    }
}

/// Pack current of a register `width` bits wide; positive while discharging.
pub fn pack_current(raw: u32, width: u32) -> f64 {
    signed(raw, width) as f64 * PACK_CURRENT_SCALE
}

/// Zone temperature in °C for the raw zone code.
pub fn zone_temperature(raw: u16) -> f64 {
    let z = f64::from(raw);
    -2.082 * z.powi(3) + 17.434 * z.powi(2) - 68.588 * z + 119.824
}

pub fn balancing_flag(enable: bool) -> u16 {
    u16::from(enable)
}

/// Cell `n` (1-based) is balanced when bit `n - 1` is set.
pub fn balancing_pattern(cells: &[bool]) -> u16 {
    cells
        .iter()
        .take(PATTERN_CELLS)
        .enumerate()
        .filter(|&(_, &on)| on)
        .fold(0u16, |pattern, (i, _)| pattern | (1u16 << i))
}

pub fn balancing_cells(pattern: u16, n_cells: usize) -> Vec<bool> {
    (0..n_cells.min(PATTERN_CELLS))
        .map(|i| read_bit!(pattern, i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn voltage_scales() {
        assert_close(pack_voltage(1000), 3.05);
        assert_close(cell_voltage(1000), 0.19073);
        assert_close(pack_voltage(0), 0.0);
        assert_close(pack_voltage(u16::MAX), 65535.0 * PACK_VOLTAGE_SCALE);
        assert_close(cell_voltage(20000), 20000.0 * CELL_VOLTAGE_SCALE);
    }

    #[test]
    fn twos_complement_current() {
        assert_eq!(signed(0xFFFF, 16), -1);
        assert_eq!(signed(0x7FFF, 16), 32767);
        assert_eq!(signed(0x8000, 16), -32768);
        assert_eq!(signed(0xFFFF_FFFF, 32), -1);
        assert_eq!(signed(0x8000_0000, 32), -2_147_483_648);
        // Bits above the register width are ignored.
        assert_eq!(signed(0x0001_FFFF, 16), -1);

        assert_close(pack_current(0xFFFF, 16), -14.9 / 1e6);
        assert_close(pack_current(0xFFFF_FFFF, 32), -PACK_CURRENT_SCALE);
        assert_close(pack_current(1_000_000, 32), 14.9);
        assert_close(pack_current(0xFFF0_BDC0, 32), -14.9);
    }

    #[test]
    fn zone_polynomial() {
        assert_close(zone_temperature(0), 119.824);
        assert_close(zone_temperature(1), -2.082 + 17.434 - 68.588 + 119.824);
        assert_close(
            zone_temperature(3),
            -2.082 * 27.0 + 17.434 * 9.0 - 68.588 * 3.0 + 119.824,
        );
    }

    #[test]
    fn balancing_pattern_roundtrip() {
        let cells = [true, false, false, true, false, false, false, false, true];
        let pattern = balancing_pattern(&cells);
        assert_eq!(pattern, 0b1_0000_1001);
        assert_eq!(balancing_cells(pattern, cells.len()), cells);
        assert_eq!(balancing_cells(0xFFFF, 40).len(), PATTERN_CELLS);
        assert_eq!(balancing_flag(true), 1);
        assert_eq!(balancing_flag(false), 0);
    }
}
