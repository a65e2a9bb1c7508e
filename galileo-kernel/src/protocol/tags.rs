/**
 * REGISTRE DES TAGS - Table statique tag → {nom, type filaire, longueur}
 *
 * RÔLE :
 * Le protocole Galileosky n'a pas d'octet de longueur par valeur : c'est
 * l'identifiant du tag qui détermine le type et donc la taille à consommer.
 * Ce module est la seule source de vérité pour cette correspondance.
 *
 * FONCTIONNEMENT :
 * - Tags courts (1 octet) : 0x01..0xE9
 * - Tags étendus (2 octets LE) dans un bloc 0xFE : 0x0001..0x0010 (Modbus)
 * - Index O(1) construit une seule fois (LazyLock)
 *
 * Données pures, aucun état mutable.
 */

use std::fmt;
use std::sync::LazyLock;

/// Octet de fin d'enregistrement / remplissage, jamais un tag.
pub const TERMINATOR: u8 = 0x00;
pub const TAG_IMEI: u8 = 0x03;
pub const TAG_ARCHIVE_NUMBER: u8 = 0x10;
/// Introduit un bloc de tags étendus : `0xFE [len:2 LE] ([tag:2 LE][value])*`.
pub const EXTENDED_BLOCK: u8 = 0xFE;
/// Saut appliqué à un tag étendu inconnu (heuristique, pas de longueur dans le flux).
pub const UNKNOWN_EXTENDED_SKIP: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
    Short(u8),
    Extended(u16),
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagId::Short(id) => write!(f, "0x{id:02x}"),
            TagId::Extended(id) => write!(f, "0x{id:04x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    /// u32 LE / 100 (virgule fixe à 2 décimales)
    U32Modbus,
    /// ASCII de longueur fixe (IMEI = 15)
    Text(usize),
    /// 1 octet de longueur puis ASCII
    VarText,
    /// u32 LE, secondes Unix
    DateTime,
    /// 1 octet (sats | correctness << 4) + lat i32 + lon i32
    Coordinates,
    Status,
    Outputs,
    Inputs,
    /// vitesse u16 / 10 puis direction u16 / 10
    SpeedDirection,
}

impl WireType {
    /// Number of value bytes, `None` when the length is carried in the stream.
    pub const fn value_len(self) -> Option<usize> {
        match self {
            WireType::U8 | WireType::I8 => Some(1),
            WireType::U16 | WireType::I16 => Some(2),
            WireType::Status | WireType::Outputs | WireType::Inputs => Some(2),
            WireType::U32 | WireType::I32 | WireType::U32Modbus => Some(4),
            WireType::DateTime | WireType::SpeedDirection => Some(4),
            WireType::Coordinates => Some(9),
            WireType::Text(len) => Some(len),
            WireType::VarText => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagDef {
    pub id: TagId,
    pub name: &'static str,
    pub wire: WireType,
}

const fn short(id: u8, name: &'static str, wire: WireType) -> TagDef {
    TagDef { id: TagId::Short(id), name, wire }
}

const fn ext(id: u16, name: &'static str, wire: WireType) -> TagDef {
    TagDef { id: TagId::Extended(id), name, wire }
}

use WireType::*;

static SHORT_TAGS: &[TagDef] = &[
    // Identification
    short(0x01, "Hardware Version", U8),
    short(0x02, "Firmware Version", U8),
    short(TAG_IMEI, "IMEI", Text(15)),
    short(0x04, "Device Identifier", U16),
    // Archive et temps
    short(TAG_ARCHIVE_NUMBER, "Archive Record Number", U16),
    short(0x20, "Date Time", DateTime),
    short(0x21, "Milliseconds", U16),
    // Navigation
    short(0x30, "Coordinates", Coordinates),
    short(0x33, "Speed and Direction", SpeedDirection),
    short(0x34, "Height", I16),
    short(0x35, "HDOP", U8),
    // Statut, alimentation, entrées/sorties
    short(0x40, "Status", Status),
    short(0x41, "Supply Voltage", U16),
    short(0x42, "Battery Voltage", U16),
    short(0x43, "Inside Temperature", I8),
    short(0x44, "Acceleration", U32),
    short(0x45, "Status of outputs", Outputs),
    short(0x46, "Status of inputs", Inputs),
    short(0x47, "ECO and driving style", U32),
    short(0x48, "Expanded status of the device", U16),
    short(0x49, "Transmission channel", U8),
    short(0x50, "Input voltage 0", U16),
    short(0x51, "Input voltage 1", U16),
    short(0x52, "Input voltage 2", U16),
    short(0x53, "Input voltage 3", U16),
    short(0x54, "Input 4 Values", U16),
    short(0x55, "Input 5 Values", U16),
    short(0x56, "Input 6 Values", U16),
    short(0x57, "Input 7 Values", U16),
    short(0x58, "RS232 0", U16),
    short(0x59, "RS232 1", U16),
    // GSM
    short(0x60, "GSM Network Code", U32),
    short(0x61, "GSM Location Area Code", U32),
    short(0x62, "GSM Signal Level", U8),
    short(0x63, "GSM Cell ID", U16),
    short(0x64, "GSM Area Code", U16),
    short(0x65, "GSM Operator Code", U16),
    short(0x66, "GSM Base Station", U16),
    short(0x67, "GSM Country Code", U16),
    short(0x68, "GSM Network Code (short)", U16),
    short(0x69, "GSM Location Area Code (short)", U16),
    short(0x70, "GSM Location Area Code (extended)", U32),
    short(0x71, "GSM Signal Level (secondary)", U8),
    short(0x72, "GSM Cell ID (secondary)", U16),
    // Capteurs
    short(0x73, "Temperature Sensor", I16),
    short(0x74, "Humidity Sensor", U8),
    short(0x75, "Pressure Sensor", U16),
    short(0x76, "Light Sensor", U16),
    short(0x77, "Accelerometer", I16),
    short(0x78, "Input 8 Value", I16),
    short(0x79, "Input 9 Value", I16),
    short(0x7a, "Input 10 Value", U16),
    short(0x7b, "Input 11 Value", U16),
    short(0x7c, "Input 12 Value", U16),
    short(0x7d, "Input 13 Value", U16),
    short(0x7e, "Input 14 Value", U16),
    short(0x7f, "Input 15 Value", U16),
    short(0xd4, "Total Mileage GPS", U32),
    // Données utilisateur
    short(0xe2, "User data 0", U32),
    short(0xe3, "User data 1", U32),
    short(0xe4, "User data 2", U32),
    short(0xe5, "User data 3", U32),
    short(0xe6, "User data 4", U32),
    short(0xe7, "User data 5", U32),
    short(0xe8, "User data 6", U32),
    short(0xe9, "User data 7", U32),
];

static EXTENDED_TAGS: &[TagDef] = &[
    ext(0x0001, "Modbus 0", U32Modbus),
    ext(0x0002, "Modbus 1", U32Modbus),
    ext(0x0003, "Modbus 2", U32Modbus),
    ext(0x0004, "Modbus 3", U32Modbus),
    ext(0x0005, "Modbus 4", U32Modbus),
    ext(0x0006, "Modbus 5", U32Modbus),
    ext(0x0007, "Modbus 6", U32),
    ext(0x0008, "Modbus 7", U32),
    ext(0x0009, "Modbus 8", U32),
    ext(0x000a, "Modbus 9", U32),
    ext(0x000b, "Modbus 10", U32),
    ext(0x000c, "Modbus 11", U32),
    ext(0x000d, "Modbus 12", U32),
    ext(0x000e, "Modbus 13", U32),
    ext(0x000f, "Modbus 14", U32),
    ext(0x0010, "Modbus 15", U32),
];

static SHORT_INDEX: LazyLock<[Option<&'static TagDef>; 256]> = LazyLock::new(|| {
    let mut index = [None; 256];
    for def in SHORT_TAGS {
        if let TagId::Short(id) = def.id {
            index[id as usize] = Some(def);
        }
    }
    index
});

pub fn lookup(tag: u8) -> Option<&'static TagDef> {
    SHORT_INDEX[tag as usize]
}

pub fn lookup_extended(tag: u16) -> Option<&'static TagDef> {
    EXTENDED_TAGS.iter().find(|def| def.id == TagId::Extended(tag))
}

/// Nombre total d'encodages connus (courts + étendus)
#[cfg(test)]
fn registry_size() -> usize {
    SHORT_TAGS.len() + EXTENDED_TAGS.len()
}
