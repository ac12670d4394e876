use uuid::Uuid;

use super::error::TransportError;

/// Idasen BLE Service and Characteristic UUIDs
/// Based on reverse engineering of the Linak DPG (Desk Panel Gateway) protocol

// Main control service UUID
pub const CONTROL_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x99fa0001_338a_1024_8a49_009c0215f78a);

// Characteristic for reading the current height
pub const HEIGHT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0021_338a_1024_8a49_009c0215f78a);

// Characteristic for sending movement commands
pub const COMMAND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x99fa0002_338a_1024_8a49_009c0215f78a);

// Characteristic for the position reference input
pub const REFERENCE_INPUT_UUID: Uuid =
    Uuid::from_u128(0x99fa0031_338a_1024_8a49_009c0215f78a);

/// Payload written to the reference input as part of every logical stop.
pub const REFERENCE_INPUT_STOP: [u8; 2] = [0x01, 0x80];

/// Minimum desk height in meters, assumed to be the same for all desks.
pub const MIN_HEIGHT_M: f64 = 0.62;

/// Maximum desk height in meters.
pub const MAX_HEIGHT_M: f64 = 1.27;

/// Expected length of the height characteristic payload.
const HEIGHT_PAYLOAD_LEN: usize = 4;

/// Movement opcodes accepted by the command characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Move desk up (the desk keeps moving for roughly a second per write)
    Up,
    /// Move desk down
    Down,
    /// Stop all movement
    Stop,
}

impl Opcode {
    /// Convert the opcode to its 2-byte wire form
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            Self::Up => [0x47, 0x00],
            Self::Down => [0x46, 0x00],
            Self::Stop => [0xFF, 0x00],
        }
    }
}

/// Desk height in meters, decoded from the height characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Height(f64);

impl Height {
    pub fn meters(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for Height {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}m", self.0)
    }
}

/// Decode a height characteristic payload.
///
/// The desk reports its position as a 16-bit little-endian offset from the
/// physical minimum, in 0.1mm units. Anything other than a 4-byte payload is
/// a protocol error, not a value to clamp.
pub fn decode_height(raw: &[u8]) -> Result<Height, TransportError> {
    if raw.len() != HEIGHT_PAYLOAD_LEN {
        return Err(TransportError::Protocol {
            expected: HEIGHT_PAYLOAD_LEN,
            got: raw.len(),
        });
    }
    let offset = u16::from_le_bytes([raw[0], raw[1]]);
    Ok(Height(f64::from(offset) / 10000.0 + MIN_HEIGHT_M))
}

/// Encode a height in meters into the desk's 2-byte offset form.
pub fn encode_height(meters: f64) -> [u8; 2] {
    let offset = ((meters - MIN_HEIGHT_M) * 10000.0).round() as u16;
    offset.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcodes() {
        assert_eq!(Opcode::Up.to_bytes(), [0x47, 0x00]);
        assert_eq!(Opcode::Down.to_bytes(), [0x46, 0x00]);
        assert_eq!(Opcode::Stop.to_bytes(), [0xFF, 0x00]);
        assert_eq!(REFERENCE_INPUT_STOP, [0x01, 0x80]);
    }

    #[test]
    fn test_decode_height() {
        // zero offset is the physical minimum
        let h = decode_height(&[0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(h.meters(), MIN_HEIGHT_M);

        // 0x1388 = 5000 -> 0.5m above minimum
        let h = decode_height(&[0x88, 0x13, 0x00, 0x00]).unwrap();
        assert!((h.meters() - 1.12).abs() < 1e-9);
    }

    #[test]
    fn test_decode_rejects_bad_payload_length() {
        assert!(matches!(
            decode_height(&[0x00, 0x00]),
            Err(TransportError::Protocol { expected: 4, got: 2 })
        ));
        assert!(matches!(
            decode_height(&[]),
            Err(TransportError::Protocol { got: 0, .. })
        ));
        assert!(decode_height(&[0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_height_round_trip() {
        for target in [0.62, 0.70, 1.10, 1.27] {
            let [lo, hi] = encode_height(target);
            let decoded = decode_height(&[lo, hi, 0x00, 0x00]).unwrap();
            assert!(
                (decoded.meters() - target).abs() < 0.0001,
                "round trip drifted for {target}"
            );
        }
    }
}
