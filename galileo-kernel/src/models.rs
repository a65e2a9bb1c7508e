use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

// Appareils

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Inactive,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
            DeviceStatus::Inactive => "inactive",
            DeviceStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub imei: String,
    pub display_name: String,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_seen_at: Option<OffsetDateTime>,
}

impl Device {
    /// Appareil vu pour la première fois
    pub fn new(imei: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            imei: imei.to_string(),
            display_name: format!("Device {}", imei),
            status: DeviceStatus::Active,
            last_seen_at: Some(OffsetDateTime::now_utc()),
        }
    }
}

// Mappings de champs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
    Coordinates,
    Status,
    Temperature,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: Uuid,
    pub device_id: Uuid,
    /// Identifiant de tag tel qu'il apparaît dans `raw_data` ("0x41")
    pub original_field: String,
    pub custom_name: String,
    #[serde(default)]
    pub data_type: MappingType,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Alertes

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    /// `None` = règle globale, appliquée à tous les appareils
    #[serde(default)]
    pub device_id: Option<Uuid>,
    pub name: String,
    /// Expression opaque, interprétée par un `ConditionEvaluator`
    pub condition: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub device_id: Uuid,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub triggered_at: OffsetDateTime,
    pub data: Value,
}

// Enregistrements projetés

pub const INPUT_VOLTAGE_SLOTS: usize = 7;
pub const USER_DATA_SLOTS: usize = 8;
pub const MODBUS_SLOTS: usize = 16;

/// Forme à plat d'un enregistrement, prête pour la persistance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub imei: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,

    pub record_number: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub device_time: Option<OffsetDateTime>,
    pub milliseconds: Option<u32>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub satellites: Option<u8>,
    pub coordinate_correctness: Option<u8>,
    pub speed: Option<f64>,
    pub direction: Option<f64>,
    pub height: Option<i32>,
    pub hdop: Option<u32>,

    pub status: Option<u16>,
    pub supply_voltage: Option<u32>,
    pub battery_voltage: Option<u32>,
    pub temperature: Option<i32>,
    pub acceleration: Option<u32>,
    pub outputs: Option<u16>,
    pub inputs: Option<u16>,
    pub input0: Option<bool>,
    pub input1: Option<bool>,
    pub input2: Option<bool>,
    pub input3: Option<bool>,
    pub eco_driving: Option<u32>,
    pub expanded_status: Option<u32>,
    pub transmission_channel: Option<u32>,

    pub input_voltage: [Option<u32>; INPUT_VOLTAGE_SLOTS],
    pub total_mileage: Option<u32>,
    pub user_data: [Option<u32>; USER_DATA_SLOTS],
    pub modbus: [Option<f64>; MODBUS_SLOTS],

    /// Champs renommés par les mappings de l'appareil
    pub mapped: Map<String, Value>,
    /// Sac complet tag → valeur décodée
    pub raw_data: Map<String, Value>,
}

impl ProjectedRecord {
    pub fn empty(device_id: Uuid, imei: &str, received_at: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            imei: imei.to_string(),
            received_at,
            record_number: None,
            device_time: None,
            milliseconds: None,
            latitude: None,
            longitude: None,
            satellites: None,
            coordinate_correctness: None,
            speed: None,
            direction: None,
            height: None,
            hdop: None,
            status: None,
            supply_voltage: None,
            battery_voltage: None,
            temperature: None,
            acceleration: None,
            outputs: None,
            inputs: None,
            input0: None,
            input1: None,
            input2: None,
            input3: None,
            eco_driving: None,
            expanded_status: None,
            transmission_channel: None,
            input_voltage: [None; INPUT_VOLTAGE_SLOTS],
            total_mileage: None,
            user_data: [None; USER_DATA_SLOTS],
            modbus: [None; MODBUS_SLOTS],
            mapped: Map::new(),
            raw_data: Map::new(),
        }
    }
}
