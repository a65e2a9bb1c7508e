/**
 * DÉCODEUR TAG-VALEUR - Consomme un tag et sa valeur à un offset donné
 *
 * RÔLE :
 * Lit exactement un élément du flux TLV Galileosky et retourne la valeur
 * décodée avec le nouvel offset. Aucun état : l'appelant pilote la boucle.
 *
 * FONCTIONNEMENT :
 * - 0x00 = terminateur d'enregistrement (jamais un tag)
 * - 0xFE = bloc de tags étendus : longueur u16 LE puis ([tag u16 LE][valeur])*
 * - Tag court inconnu : avance d'un octet (resynchronisation best-effort)
 * - Tag étendu inconnu : avance de 4 octets
 * - Valeur tronquée : erreur, l'enregistrement entier est abandonné
 */

use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use super::tags::{self, TagDef, TagId, WireType, EXTENDED_BLOCK, TERMINATOR, UNKNOWN_EXTENDED_SKIP};

const COORDINATE_SCALE: f64 = 1_000_000.0;
const MODBUS_SCALE: f64 = 100.0;
const SPEED_DIRECTION_SCALE: f64 = 10.0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("tag {tag} truncated at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        tag: TagId,
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("extended block declares {declared} bytes but only {available} remain")]
    ExtendedBlockOverrun { declared: usize, available: usize },
    #[error("invalid datetime {0}")]
    InvalidDateTime(u32),
}

/// Coordonnées GPS (tag 0x30)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub satellites: u8,
    /// 0 = position correcte
    pub correctness: u8,
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn is_valid(&self) -> bool {
        self.correctness == 0
    }
}

/// Champ de bits du statut appareil (tag 0x40)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub raw: u16,
    pub power: bool,
    pub gps_valid: bool,
    pub gsm_valid: bool,
    pub alarm: bool,
    pub ignition: bool,
    pub movement: bool,
    pub charging: bool,
    pub low_battery: bool,
    pub gsm_signal: u8,
    pub gps_signal: u8,
    pub gsm_antenna: bool,
    pub gps_antenna: bool,
    pub output1: bool,
    pub output2: bool,
}

impl StatusFlags {
    pub fn from_bits(raw: u16) -> Self {
        let bit = |n: u16| raw & (1 << n) != 0;
        Self {
            raw,
            power: bit(0),
            gps_valid: bit(1),
            gsm_valid: bit(2),
            alarm: bit(3),
            ignition: bit(4),
            movement: bit(5),
            charging: bit(6),
            low_battery: bit(7),
            gsm_signal: ((raw >> 8) & 0x03) as u8,
            gps_signal: ((raw >> 10) & 0x03) as u8,
            gsm_antenna: bit(12),
            gps_antenna: bit(13),
            output1: bit(14),
            output2: bit(15),
        }
    }
}

/// Masque d'entrées ou de sorties : bit i → `input{i}` / `output{i}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitStates {
    pub prefix: &'static str,
    pub mask: u16,
}

impl BitStates {
    pub fn get(&self, index: u8) -> bool {
        index < 16 && self.mask & (1 << index) != 0
    }

    pub fn to_json(&self) -> Value {
        let mut states = Map::new();
        for i in 0..16u8 {
            states.insert(format!("{}{}", self.prefix, i), Value::Bool(self.get(i)));
        }
        Value::Object(states)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Unsigned(u32),
    Signed(i32),
    Decimal(f64),
    Text(String),
    DateTime(OffsetDateTime),
    Coordinates(Coordinates),
    Status(StatusFlags),
    Bits(BitStates),
    SpeedDirection { speed: f64, direction: f64 },
}

impl DecodedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DecodedValue::Unsigned(v) => Some(*v as f64),
            DecodedValue::Signed(v) => Some(*v as f64),
            DecodedValue::Decimal(v) => Some(*v),
            DecodedValue::Status(s) => Some(s.raw as f64),
            DecodedValue::Bits(b) => Some(b.mask as f64),
            DecodedValue::DateTime(t) => Some(t.unix_timestamp() as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DecodedValue::Unsigned(v) => json!(v),
            DecodedValue::Signed(v) => json!(v),
            DecodedValue::Decimal(v) => json!(v),
            DecodedValue::Text(s) => json!(s),
            DecodedValue::DateTime(t) => t
                .format(&time::format_description::well_known::Rfc3339)
                .map(Value::String)
                .unwrap_or(Value::Null),
            DecodedValue::Coordinates(c) => json!(c),
            DecodedValue::Status(s) => json!(s),
            DecodedValue::Bits(b) => b.to_json(),
            DecodedValue::SpeedDirection { speed, direction } => {
                json!({ "speed": speed, "direction": direction })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagValue {
    pub tag: TagId,
    pub wire: WireType,
    pub value: DecodedValue,
}

/// Un pas de décodage : ce qu'on a trouvé à l'offset courant
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Value(TagValue),
    Extended {
        values: Vec<TagValue>,
        unknown: Vec<u16>,
    },
    Unknown(u8),
    Terminator,
}

/// Décode l'élément situé à `offset`. Retourne le token et l'offset suivant.
///
/// Pour `offset < buf.len()`, l'offset retourné est strictement supérieur à
/// `offset` et ne dépasse jamais `buf.len()`. Au-delà de la fin du buffer on
/// obtient `Terminator`.
pub fn next_token(buf: &[u8], offset: usize) -> Result<(Token, usize), DecodeError> {
    let Some(&tag) = buf.get(offset) else {
        return Ok((Token::Terminator, offset));
    };
    match tag {
        TERMINATOR => Ok((Token::Terminator, offset + 1)),
        EXTENDED_BLOCK => decode_extended_block(buf, offset),
        _ => match tags::lookup(tag) {
            Some(def) => {
                let (value, next) = decode_value(def, buf, offset + 1)?;
                Ok((Token::Value(value), next))
            }
            None => {
                tracing::debug!(tag = %TagId::Short(tag), offset, "unknown tag, skipping 1 byte");
                Ok((Token::Unknown(tag), offset + 1))
            }
        },
    }
}

/// Décode la valeur d'un tag déjà identifié, `offset` pointant juste après l'identifiant.
pub fn decode_value(def: &TagDef, buf: &[u8], offset: usize) -> Result<(TagValue, usize), DecodeError> {
    let available = buf.len().saturating_sub(offset);
    let truncated = |needed: usize| DecodeError::Truncated {
        tag: def.id,
        offset,
        needed,
        available,
    };

    let len = match def.wire.value_len() {
        Some(len) => len,
        None => {
            let prefix = *buf.get(offset).ok_or_else(|| truncated(1))? as usize;
            prefix + 1
        }
    };
    if available < len {
        return Err(truncated(len));
    }
    let bytes = &buf[offset..offset + len];

    let value = match def.wire {
        WireType::U8 => DecodedValue::Unsigned(bytes[0] as u32),
        WireType::I8 => DecodedValue::Signed(bytes[0] as i8 as i32),
        WireType::U16 => DecodedValue::Unsigned(le_u16(bytes, 0) as u32),
        WireType::I16 => DecodedValue::Signed(le_u16(bytes, 0) as i16 as i32),
        WireType::U32 => DecodedValue::Unsigned(le_u32(bytes, 0)),
        WireType::I32 => DecodedValue::Signed(le_u32(bytes, 0) as i32),
        WireType::U32Modbus => DecodedValue::Decimal(le_u32(bytes, 0) as f64 / MODBUS_SCALE),
        WireType::Text(_) => DecodedValue::Text(ascii(bytes)),
        WireType::VarText => DecodedValue::Text(ascii(&bytes[1..])),
        WireType::DateTime => {
            let secs = le_u32(bytes, 0);
            let at = OffsetDateTime::from_unix_timestamp(secs as i64)
                .map_err(|_| DecodeError::InvalidDateTime(secs))?;
            DecodedValue::DateTime(at)
        }
        WireType::Coordinates => DecodedValue::Coordinates(Coordinates {
            satellites: bytes[0] & 0x0F,
            correctness: bytes[0] >> 4,
            latitude: le_u32(bytes, 1) as i32 as f64 / COORDINATE_SCALE,
            longitude: le_u32(bytes, 5) as i32 as f64 / COORDINATE_SCALE,
        }),
        WireType::Status => DecodedValue::Status(StatusFlags::from_bits(le_u16(bytes, 0))),
        WireType::Outputs => DecodedValue::Bits(BitStates {
            prefix: "output",
            mask: le_u16(bytes, 0),
        }),
        WireType::Inputs => DecodedValue::Bits(BitStates {
            prefix: "input",
            mask: le_u16(bytes, 0),
        }),
        WireType::SpeedDirection => DecodedValue::SpeedDirection {
            speed: le_u16(bytes, 0) as f64 / SPEED_DIRECTION_SCALE,
            direction: le_u16(bytes, 2) as f64 / SPEED_DIRECTION_SCALE,
        },
    };

    Ok((
        TagValue {
            tag: def.id,
            wire: def.wire,
            value,
        },
        offset + len,
    ))
}

fn decode_extended_block(buf: &[u8], offset: usize) -> Result<(Token, usize), DecodeError> {
    let header_end = offset + 3;
    if buf.len() < header_end {
        return Err(DecodeError::Truncated {
            tag: TagId::Short(EXTENDED_BLOCK),
            offset: offset + 1,
            needed: 2,
            available: buf.len() - offset - 1,
        });
    }
    let declared = le_u16(buf, offset + 1) as usize;
    let block_end = header_end + declared;
    if block_end > buf.len() {
        return Err(DecodeError::ExtendedBlockOverrun {
            declared,
            available: buf.len() - header_end,
        });
    }

    // La lecture des valeurs est bornée au bloc déclaré
    let block = &buf[..block_end];
    let mut values = Vec::new();
    let mut unknown = Vec::new();
    let mut pos = header_end;

    while pos + 2 <= block_end {
        let id = le_u16(block, pos);
        pos += 2;
        match tags::lookup_extended(id) {
            Some(def) => {
                let (value, next) = decode_value(def, block, pos)?;
                values.push(value);
                pos = next;
            }
            None => {
                tracing::debug!(tag = %TagId::Extended(id), offset = pos, "unknown extended tag");
                unknown.push(id);
                pos = (pos + UNKNOWN_EXTENDED_SKIP).min(block_end);
            }
        }
    }

    Ok((Token::Extended { values, unknown }, block_end))
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(buf: &[u8]) -> (Token, usize) {
        next_token(buf, 0).unwrap()
    }

    fn value_of(buf: &[u8]) -> DecodedValue {
        match decode_one(buf) {
            (Token::Value(v), next) => {
                assert_eq!(next, buf.len());
                v.value
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn test_imei_fixed_string() {
        let mut buf = vec![0x03];
        buf.extend_from_slice(b"123456789012345");
        assert_eq!(value_of(&buf), DecodedValue::Text("123456789012345".into()));
    }

    #[test]
    fn test_integer_types_little_endian() {
        assert_eq!(value_of(&[0x04, 0x34, 0x12]), DecodedValue::Unsigned(0x1234));
        assert_eq!(value_of(&[0x43, 0xF6]), DecodedValue::Signed(-10));
        assert_eq!(value_of(&[0x34, 0xFF, 0xFF]), DecodedValue::Signed(-1));
        assert_eq!(
            value_of(&[0xd4, 0x78, 0x56, 0x34, 0x12]),
            DecodedValue::Unsigned(0x1234_5678)
        );
    }

    #[test]
    fn test_datetime() {
        let value = value_of(&[0x20, 0x00, 0x00, 0x00, 0x60]);
        let expected = OffsetDateTime::from_unix_timestamp(0x6000_0000).unwrap();
        assert_eq!(value, DecodedValue::DateTime(expected));
    }

    #[test]
    fn test_coordinates() {
        // 7 satellites, correctness 0, lat 55.123456, lon -37.5
        let mut buf = vec![0x30, 0x07];
        buf.extend_from_slice(&55_123_456i32.to_le_bytes());
        buf.extend_from_slice(&(-37_500_000i32).to_le_bytes());
        match value_of(&buf) {
            DecodedValue::Coordinates(c) => {
                assert_eq!(c.satellites, 7);
                assert_eq!(c.correctness, 0);
                assert!(c.is_valid());
                assert!((c.latitude - 55.123456).abs() < 1e-9);
                assert!((c.longitude + 37.5).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_speed_direction() {
        // 62.5 km/h, 270.3°
        let mut buf = vec![0x33];
        buf.extend_from_slice(&625u16.to_le_bytes());
        buf.extend_from_slice(&2703u16.to_le_bytes());
        assert_eq!(
            value_of(&buf),
            DecodedValue::SpeedDirection {
                speed: 62.5,
                direction: 270.3
            }
        );
    }

    #[test]
    fn test_status_bits() {
        // power, ignition, gsm signal 3, gps antenna
        let raw: u16 = 0b0010_0011_0001_0001;
        let mut buf = vec![0x40];
        buf.extend_from_slice(&raw.to_le_bytes());
        match value_of(&buf) {
            DecodedValue::Status(s) => {
                assert!(s.power);
                assert!(s.ignition);
                assert!(!s.alarm);
                assert_eq!(s.gsm_signal, 3);
                assert_eq!(s.gps_signal, 0);
                assert!(s.gps_antenna);
                assert!(!s.output2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inputs_bitmask() {
        match value_of(&[0x46, 0x05, 0x00]) {
            DecodedValue::Bits(bits) => {
                assert!(bits.get(0));
                assert!(!bits.get(1));
                assert!(bits.get(2));
                for i in 3..16 {
                    assert!(!bits.get(i), "input{} should be false", i);
                }
                let json = bits.to_json();
                assert_eq!(json["input0"], true);
                assert_eq!(json["input1"], false);
                assert_eq!(json["input2"], true);
                assert_eq!(json["input15"], false);
                assert_eq!(json.as_object().unwrap().len(), 16);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outputs_use_output_prefix() {
        match value_of(&[0x45, 0x00, 0x80]) {
            DecodedValue::Bits(bits) => {
                let json = bits.to_json();
                assert_eq!(json["output15"], true);
                assert_eq!(json["output0"], false);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_variable_string() {
        let def = TagDef {
            id: TagId::Short(0xAA),
            name: "Label",
            wire: WireType::VarText,
        };
        let buf = [0x03, b'a', b'b', b'c', 0x99];
        let (value, next) = decode_value(&def, &buf, 0).unwrap();
        assert_eq!(value.value, DecodedValue::Text("abc".into()));
        assert_eq!(next, 4);

        let short = [0x05, b'a'];
        assert!(matches!(
            decode_value(&def, &short, 0),
            Err(DecodeError::Truncated { needed: 6, .. })
        ));
    }

    #[test]
    fn test_terminator_and_unknown_tag() {
        assert_eq!(decode_one(&[0x00, 0x10]), (Token::Terminator, 1));
        assert_eq!(decode_one(&[0x99, 0x10]), (Token::Unknown(0x99), 1));
    }

    #[test]
    fn test_truncated_value() {
        let err = next_token(&[0x41, 0x01], 0).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                tag: TagId::Short(0x41),
                offset: 1,
                needed: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_extended_block() {
        // Modbus 0 = 12345 / 100, Modbus 6 = 7, puis un tag inconnu 0x0bad
        let mut body = Vec::new();
        body.extend_from_slice(&0x0001u16.to_le_bytes());
        body.extend_from_slice(&12345u32.to_le_bytes());
        body.extend_from_slice(&0x0007u16.to_le_bytes());
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&0x0badu16.to_le_bytes());
        body.extend_from_slice(&[1, 2, 3, 4]);

        let mut buf = vec![0xFE];
        buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
        buf.extend_from_slice(&body);
        buf.push(0x00);

        let (token, next) = next_token(&buf, 0).unwrap();
        assert_eq!(next, buf.len() - 1);
        match token {
            Token::Extended { values, unknown } => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0].tag, TagId::Extended(0x0001));
                assert_eq!(values[0].value, DecodedValue::Decimal(123.45));
                assert_eq!(values[1].value, DecodedValue::Unsigned(7));
                assert_eq!(unknown, vec![0x0bad]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_extended_block_overrun() {
        let buf = [0xFE, 0x10, 0x00, 0x01, 0x00];
        assert_eq!(
            next_token(&buf, 0).unwrap_err(),
            DecodeError::ExtendedBlockOverrun {
                declared: 16,
                available: 2
            }
        );
    }

    #[test]
    fn test_sequential_decode_partitions_the_buffer() {
        // hw, imei, archive, time, coordinates, unknown, inputs, then padding
        let mut buf = vec![0x01, 0x82, 0x03];
        buf.extend_from_slice(b"868204005647838");
        buf.extend_from_slice(&[0x10, 0x2A, 0x00]);
        buf.extend_from_slice(&[0x20, 0x01, 0x02, 0x03, 0x04]);
        buf.extend_from_slice(&[0x30, 0x09, 1, 2, 3, 4, 5, 6, 7, 8]);
        buf.push(0x99);
        buf.extend_from_slice(&[0x46, 0x05, 0x00]);
        let len = buf.len();
        buf.extend_from_slice(&[0x00, 0xAB, 0xCD]);

        let mut pos = 0;
        let mut consumed = 0;
        while pos < buf.len() {
            let (token, next) = next_token(&buf, pos).unwrap();
            assert!(next > pos && next <= buf.len());
            if token == Token::Terminator {
                break;
            }
            consumed += next - pos;
            pos = next;
        }
        assert_eq!(consumed, len);
        assert_eq!(pos, len);
    }
}
