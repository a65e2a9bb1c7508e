/**
 * JSON STORE - Persistance fichier pour le pipeline Galileosky
 *
 * RÔLE :
 * Implémentation de référence du port `Persistence`, sans base de données.
 *
 * FICHIERS (dans `data_dir`) :
 * - devices.json      : appareils connus (document JSON, cache mémoire)
 * - mappings.json     : mappings de champs par appareil
 * - alert_rules.json  : règles d'alerte
 * - records.jsonl     : enregistrements projetés (append-only, une ligne par record)
 * - alerts.jsonl      : alertes levées (append-only)
 *
 * Un insert groupé = une seule écriture sur records.jsonl.
 */

use super::{Persistence, StoreError};
use crate::models::{Alert, AlertRule, Device, DeviceStatus, FieldMapping, ProjectedRecord};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use uuid::Uuid;

const DEVICES_FILE: &str = "devices.json";
const MAPPINGS_FILE: &str = "mappings.json";
const ALERT_RULES_FILE: &str = "alert_rules.json";
const RECORDS_FILE: &str = "records.jsonl";
const ALERTS_FILE: &str = "alerts.jsonl";

pub struct JsonStore {
    dir: PathBuf,
    /// IMEI → appareil
    devices: RwLock<HashMap<String, Device>>,
    mappings: RwLock<Vec<FieldMapping>>,
    rules: RwLock<Vec<AlertRule>>,
    /// Sérialise les écritures disque
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Ouvre (ou initialise) le répertoire de données
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let devices: Vec<Device> = load_document(&dir.join(DEVICES_FILE))?;
        let mappings: Vec<FieldMapping> = load_document(&dir.join(MAPPINGS_FILE))?;
        let rules: Vec<AlertRule> = load_document(&dir.join(ALERT_RULES_FILE))?;

        tracing::info!(
            dir = %dir.display(),
            devices = devices.len(),
            mappings = mappings.len(),
            rules = rules.len(),
            "json store opened"
        );

        Ok(Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.imei.clone(), d)).collect()),
            mappings: RwLock::new(mappings),
            rules: RwLock::new(rules),
            write_lock: Mutex::new(()),
            dir,
        })
    }

    fn save_devices(&self) -> Result<(), StoreError> {
        let snapshot: Vec<Device> = self.devices.read().values().cloned().collect();
        self.save_document(DEVICES_FILE, &snapshot)
    }

    fn save_document<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(value)?;
        let _guard = self.write_lock.lock();
        fs::write(self.dir.join(file), json)?;
        Ok(())
    }

    /// Ajoute des lignes JSON en une seule écriture
    fn append_lines<T: Serialize>(&self, file: &str, items: &[T]) -> Result<(), StoreError> {
        let mut out = String::new();
        for item in items {
            out.push_str(&serde_json::to_string(item)?);
            out.push('\n');
        }
        let _guard = self.write_lock.lock();
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        handle.write_all(out.as_bytes())?;
        Ok(())
    }
}

fn load_document<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        fs::write(path, "[]")?;
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Outils de préparation des jeux de données (tests)
#[cfg(test)]
impl JsonStore {
    pub fn records_path(&self) -> PathBuf {
        self.dir.join(RECORDS_FILE)
    }

    /// Ajoute ou remplace un mapping (même appareil + même champ d'origine)
    pub fn upsert_mapping(&self, mapping: FieldMapping) -> Result<(), StoreError> {
        {
            let mut mappings = self.mappings.write();
            mappings.retain(|m| {
                !(m.device_id == mapping.device_id && m.original_field == mapping.original_field)
            });
            mappings.push(mapping);
        }
        let snapshot = self.mappings.read().clone();
        self.save_document(MAPPINGS_FILE, &snapshot)
    }

    pub fn upsert_alert_rule(&self, rule: AlertRule) -> Result<(), StoreError> {
        {
            let mut rules = self.rules.write();
            rules.retain(|r| r.id != rule.id);
            rules.push(rule);
        }
        let snapshot = self.rules.read().clone();
        self.save_document(ALERT_RULES_FILE, &snapshot)
    }

    pub fn device(&self, imei: &str) -> Option<Device> {
        self.devices.read().get(imei).cloned()
    }
}

#[async_trait]
impl Persistence for JsonStore {
    async fn find_or_create_device(&self, imei: &str) -> Result<Device, StoreError> {
        if let Some(device) = self.devices.read().get(imei) {
            return Ok(device.clone());
        }

        let device = {
            let mut devices = self.devices.write();
            devices
                .entry(imei.to_string())
                .or_insert_with(|| Device::new(imei))
                .clone()
        };
        self.save_devices()?;
        tracing::info!(imei, device_id = %device.id, "device registered");
        Ok(device)
    }

    async fn update_device_status(&self, imei: &str, status: DeviceStatus) -> Result<(), StoreError> {
        {
            let mut devices = self.devices.write();
            let device = devices
                .get_mut(imei)
                .ok_or_else(|| StoreError::NotFound(format!("device {}", imei)))?;
            device.status = status;
            if status == DeviceStatus::Active {
                device.last_seen_at = Some(OffsetDateTime::now_utc());
            }
        }
        self.save_devices()
    }

    async fn get_field_mappings(&self, device_id: Uuid) -> Result<Vec<FieldMapping>, StoreError> {
        Ok(self
            .mappings
            .read()
            .iter()
            .filter(|m| m.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn bulk_insert_records(&self, records: &[ProjectedRecord]) -> Result<usize, StoreError> {
        self.append_lines(RECORDS_FILE, records)?;
        Ok(records.len())
    }

    async fn insert_record(&self, record: &ProjectedRecord) -> Result<(), StoreError> {
        self.append_lines(RECORDS_FILE, std::slice::from_ref(record))
    }

    async fn get_enabled_alert_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>, StoreError> {
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.device_id.map_or(true, |id| id == device_id))
            .cloned()
            .collect())
    }

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError> {
        self.append_lines(ALERTS_FILE, alerts)
    }
}
