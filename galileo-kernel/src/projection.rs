/**
 * PROJECTION - Sac de tags → enregistrement à plat
 *
 * RÔLE : Traduit un `Record` décodé en `ProjectedRecord` prêt à persister.
 *
 * FONCTIONNEMENT : table statique tag → `FieldSlot`. Chaque slot sait quelle
 * colonne remplir ; ajouter un tag projeté = ajouter une ligne à la table.
 * Le sac complet est conservé dans `raw_data`, la vue renommée par les
 * mappings de l'appareil dans `mapped`.
 */

use std::collections::HashMap;
use std::sync::LazyLock;
use time::OffsetDateTime;

use crate::mapping::apply_mappings;
use crate::models::{Device, FieldMapping, ProjectedRecord};
use crate::protocol::decoder::DecodedValue;
use crate::protocol::{Record, TagId};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProjectionError {
    #[error("record carries no IMEI")]
    MissingImei,
}

/// Colonne cible d'un tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    RecordNumber,
    DeviceTime,
    Milliseconds,
    Coordinates,
    SpeedDirection,
    Height,
    Hdop,
    Status,
    SupplyVoltage,
    BatteryVoltage,
    Temperature,
    Acceleration,
    Outputs,
    Inputs,
    EcoDriving,
    ExpandedStatus,
    TransmissionChannel,
    InputVoltage(usize),
    TotalMileage,
    UserData(usize),
    Modbus(usize),
}

static SLOTS: LazyLock<HashMap<TagId, FieldSlot>> = LazyLock::new(|| {
    use FieldSlot::*;

    let mut table: HashMap<TagId, FieldSlot> = [
        (0x10, RecordNumber),
        (0x20, DeviceTime),
        (0x21, Milliseconds),
        (0x30, Coordinates),
        (0x33, SpeedDirection),
        (0x34, Height),
        (0x35, Hdop),
        (0x40, Status),
        (0x41, SupplyVoltage),
        (0x42, BatteryVoltage),
        (0x43, Temperature),
        (0x44, Acceleration),
        (0x45, Outputs),
        (0x46, Inputs),
        (0x47, EcoDriving),
        (0x48, ExpandedStatus),
        (0x49, TransmissionChannel),
        (0xd4, TotalMileage),
    ]
    .into_iter()
    .map(|(tag, slot)| (TagId::Short(tag), slot))
    .collect();

    for i in 0..crate::models::INPUT_VOLTAGE_SLOTS {
        table.insert(TagId::Short(0x50 + i as u8), InputVoltage(i));
    }
    for i in 0..crate::models::USER_DATA_SLOTS {
        table.insert(TagId::Short(0xe2 + i as u8), UserData(i));
    }
    for i in 0..crate::models::MODBUS_SLOTS {
        table.insert(TagId::Extended(0x0001 + i as u16), Modbus(i));
    }
    table
});

pub fn slot_for(tag: TagId) -> Option<FieldSlot> {
    SLOTS.get(&tag).copied()
}

pub fn project(
    record: &Record,
    device: &Device,
    mappings: &[FieldMapping],
    received_at: OffsetDateTime,
) -> Result<ProjectedRecord, ProjectionError> {
    let imei = record.imei.as_deref().ok_or(ProjectionError::MissingImei)?;

    let mut out = ProjectedRecord::empty(device.id, imei, received_at);
    for (tag, value) in &record.tags {
        if let Some(slot) = slot_for(*tag) {
            fill(&mut out, slot, &value.value);
        }
    }

    out.raw_data = record.tag_map();
    out.mapped = apply_mappings(&out.raw_data, mappings);
    Ok(out)
}

fn unsigned(value: &DecodedValue) -> Option<u32> {
    match value {
        DecodedValue::Unsigned(v) => Some(*v),
        _ => None,
    }
}

fn signed(value: &DecodedValue) -> Option<i32> {
    match value {
        DecodedValue::Signed(v) => Some(*v),
        _ => None,
    }
}

fn fill(out: &mut ProjectedRecord, slot: FieldSlot, value: &DecodedValue) {
    match slot {
        FieldSlot::RecordNumber => out.record_number = unsigned(value),
        FieldSlot::DeviceTime => {
            if let DecodedValue::DateTime(at) = value {
                out.device_time = Some(*at);
            }
        }
        FieldSlot::Milliseconds => out.milliseconds = unsigned(value),
        FieldSlot::Coordinates => {
            if let DecodedValue::Coordinates(c) = value {
                out.latitude = Some(c.latitude);
                out.longitude = Some(c.longitude);
                out.satellites = Some(c.satellites);
                out.coordinate_correctness = Some(c.correctness);
            }
        }
        FieldSlot::SpeedDirection => {
            if let DecodedValue::SpeedDirection { speed, direction } = value {
                out.speed = Some(*speed);
                out.direction = Some(*direction);
            }
        }
        FieldSlot::Height => out.height = signed(value),
        FieldSlot::Hdop => out.hdop = unsigned(value),
        FieldSlot::Status => {
            if let DecodedValue::Status(flags) = value {
                out.status = Some(flags.raw);
            }
        }
        FieldSlot::SupplyVoltage => out.supply_voltage = unsigned(value),
        FieldSlot::BatteryVoltage => out.battery_voltage = unsigned(value),
        FieldSlot::Temperature => out.temperature = signed(value),
        FieldSlot::Acceleration => out.acceleration = unsigned(value),
        FieldSlot::Outputs => {
            if let DecodedValue::Bits(bits) = value {
                out.outputs = Some(bits.mask);
            }
        }
        FieldSlot::Inputs => {
            if let DecodedValue::Bits(bits) = value {
                out.inputs = Some(bits.mask);
                out.input0 = Some(bits.get(0));
                out.input1 = Some(bits.get(1));
                out.input2 = Some(bits.get(2));
                out.input3 = Some(bits.get(3));
            }
        }
        FieldSlot::EcoDriving => out.eco_driving = unsigned(value),
        FieldSlot::ExpandedStatus => out.expanded_status = unsigned(value),
        FieldSlot::TransmissionChannel => out.transmission_channel = unsigned(value),
        FieldSlot::InputVoltage(i) => out.input_voltage[i] = unsigned(value),
        FieldSlot::TotalMileage => out.total_mileage = unsigned(value),
        FieldSlot::UserData(i) => out.user_data[i] = unsigned(value),
        FieldSlot::Modbus(i) => out.modbus[i] = value.as_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MappingType;
    use crate::protocol::{Assembler, Session, SplitMode};
    use galileo_devkit::TagWriter;
    use serde_json::json;
    use uuid::Uuid;

    const IMEI: &str = "868204005647838";

    fn decode(data: &[u8]) -> Record {
        let assembler = Assembler::new(SplitMode::TagAligned, 32);
        let mut session = Session::default();
        let mut assembly = assembler.assemble(data, &mut session);
        assert!(assembly.failures.is_empty(), "{:?}", assembly.failures);
        assert_eq!(assembly.records.len(), 1);
        assembly.records.remove(0)
    }

    #[test]
    fn test_table_covers_slots() {
        assert_eq!(slot_for(TagId::Short(0x30)), Some(FieldSlot::Coordinates));
        assert_eq!(slot_for(TagId::Short(0x56)), Some(FieldSlot::InputVoltage(6)));
        assert_eq!(slot_for(TagId::Short(0x57)), None);
        assert_eq!(slot_for(TagId::Short(0xe9)), Some(FieldSlot::UserData(7)));
        assert_eq!(slot_for(TagId::Extended(0x0010)), Some(FieldSlot::Modbus(15)));
        assert_eq!(slot_for(TagId::Short(0x03)), None);
    }

    #[test]
    fn test_project_fix() {
        let mut w = TagWriter::new();
        w.imei(IMEI)
            .archive_number(7)
            .datetime(1_700_000_000)
            .coordinates(9, 0, 55.751244, 37.618423)
            .speed_direction(45.2, 180.0)
            .status(0x0013)
            .u16_tag(0x41, 12400)
            .inputs(0x0005)
            .u16_tag(0x50, 3300)
            .u32_tag(0xe2, 77)
            .extended_u32(&[(0x0001, 1234), (0x0008, 9)]);
        let record = decode(&w.finish());

        let device = Device::new(IMEI);
        let received_at = OffsetDateTime::now_utc();
        let projected = project(&record, &device, &[], received_at).unwrap();

        assert_eq!(projected.device_id, device.id);
        assert_eq!(projected.imei, IMEI);
        assert_eq!(projected.record_number, Some(7));
        assert_eq!(projected.device_time.map(|t| t.unix_timestamp()), Some(1_700_000_000));
        assert_eq!(projected.latitude, Some(55.751244));
        assert_eq!(projected.longitude, Some(37.618423));
        assert_eq!(projected.satellites, Some(9));
        assert_eq!(projected.coordinate_correctness, Some(0));
        assert_eq!(projected.speed, Some(45.2));
        assert_eq!(projected.direction, Some(180.0));
        assert_eq!(projected.status, Some(0x0013));
        assert_eq!(projected.supply_voltage, Some(12400));
        assert_eq!(projected.inputs, Some(0x0005));
        assert_eq!(
            (projected.input0, projected.input1, projected.input2, projected.input3),
            (Some(true), Some(false), Some(true), Some(false))
        );
        assert_eq!(projected.input_voltage[0], Some(3300));
        assert_eq!(projected.user_data[0], Some(77));
        assert_eq!(projected.modbus[0], Some(12.34));
        assert_eq!(projected.modbus[7], Some(9.0));
        assert_eq!(projected.raw_data["0x41"], json!(12400));
        assert_eq!(projected.mapped, projected.raw_data);
    }

    #[test]
    fn test_project_applies_mappings() {
        let mut w = TagWriter::new();
        w.imei(IMEI).u16_tag(0x41, 12400);
        let record = decode(&w.finish());
        let device = Device::new(IMEI);

        let mapping = FieldMapping {
            id: Uuid::new_v4(),
            device_id: device.id,
            original_field: "0x41".into(),
            custom_name: "supply".into(),
            data_type: MappingType::Number,
            unit: Some("mV".into()),
            enabled: true,
        };
        let projected = project(&record, &device, &[mapping], OffsetDateTime::now_utc()).unwrap();
        assert_eq!(projected.mapped["supply"]["unit"], json!("mV"));
        assert!(projected.raw_data.contains_key("0x41"));
    }

    #[test]
    fn test_mismatched_mapping_keeps_fix() {
        let mut w = TagWriter::new();
        w.imei(IMEI)
            .coordinates(9, 0, 55.751244, 37.618423)
            .u16_tag(0x41, 12400);
        let record = decode(&w.finish());
        let device = Device::new(IMEI);

        let mapping = FieldMapping {
            id: Uuid::new_v4(),
            device_id: device.id,
            original_field: "0x41".into(),
            custom_name: "position".into(),
            data_type: MappingType::Coordinates,
            unit: None,
            enabled: true,
        };
        let projected = project(&record, &device, &[mapping], OffsetDateTime::now_utc()).unwrap();
        assert_eq!(projected.latitude, Some(55.751244));
        assert_eq!(projected.supply_voltage, Some(12400));
        assert_eq!(projected.mapped["0x41"], json!(12400));
        assert!(!projected.mapped.contains_key("position"));
    }

    #[test]
    fn test_missing_imei() {
        let mut w = TagWriter::new();
        w.u16_tag(0x41, 12400);
        let record = decode(&w.finish());
        let err = project(&record, &Device::new(IMEI), &[], OffsetDateTime::now_utc()).unwrap_err();
        assert_eq!(err, ProjectionError::MissingImei);
    }
}
