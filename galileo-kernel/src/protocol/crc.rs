//! CRC-16 (Modbus variant) used by Galileosky frames.
//!
//! Polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF, LSB first,
//! computed over `type..end-of-data`. The result is appended little-endian.

const POLY: u16 = 0xA001;
const INIT: u16 = 0xFFFF;

pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = INIT;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_check_value() {
        // Valeur de contrôle publiée pour CRC-16/MODBUS
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_empty_input_is_init() {
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[test]
    fn test_matches_devkit_encoder() {
        let frame = galileo_devkit::FrameBuilder::main(vec![0x01, 0x82]).build();
        let body_len = frame.len() - 2;
        let expected = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
        assert_eq!(crc16_modbus(&frame[..body_len]), expected);
    }
}
