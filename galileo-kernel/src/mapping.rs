/**
 * MAPPING - Renommage et typage des tags par appareil
 *
 * RÔLE : Un opérateur associe un tag ("0x41") à un nom métier ("supply_mv"),
 * un type et une unité. Les mappings sont lus via le port `Persistence` et
 * gardés en cache par appareil.
 *
 * FONCTIONNEMENT :
 * - Cache DashMap device_id → mappings, TTL configurable (300s par défaut)
 * - Entrée expirée = relecture synchrone depuis le store
 * - Invalidation ciblée ou globale (topic MQTT mappings/changed@v1)
 * - `apply_mappings` : les tags mappés sortent sous `custom_name`,
 *   les autres (et les conversions impossibles) passent tels quels
 */

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{FieldMapping, MappingType};
use crate::ports::{Persistence, StoreError};
use crate::protocol::decoder::StatusFlags;

#[derive(Debug, Clone)]
struct CachedMappings {
    mappings: Arc<Vec<FieldMapping>>,
    fetched_at: Instant,
}

pub struct MappingCache {
    entries: DashMap<Uuid, CachedMappings>,
    store: Arc<dyn Persistence>,
    ttl: Duration,
}

impl MappingCache {
    pub fn new(store: Arc<dyn Persistence>, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            ttl,
        }
    }

    pub async fn get(&self, device_id: Uuid) -> Result<Arc<Vec<FieldMapping>>, StoreError> {
        if let Some(cached) = self.entries.get(&device_id) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.mappings.clone());
            }
        }

        let mappings = Arc::new(self.store.get_field_mappings(device_id).await?);
        tracing::debug!(%device_id, count = mappings.len(), "field mappings refreshed");
        self.entries.insert(
            device_id,
            CachedMappings {
                mappings: mappings.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(mappings)
    }

    /// `None` vide tout le cache
    pub fn invalidate(&self, device_id: Option<Uuid>) {
        match device_id {
            Some(id) => {
                self.entries.remove(&id);
            }
            None => self.entries.clear(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Applique les mappings actifs au sac brut d'un enregistrement.
/// Conversion impossible : le tag reste sous sa clé d'origine, valeur brute.
pub fn apply_mappings(raw: &Map<String, Value>, mappings: &[FieldMapping]) -> Map<String, Value> {
    let mut out = raw.clone();

    for mapping in mappings.iter().filter(|m| m.enabled) {
        let Some(value) = raw.get(&mapping.original_field) else {
            continue;
        };
        let converted = match convert_value(value, mapping.data_type) {
            Ok(converted) => converted,
            Err(reason) => {
                tracing::warn!(
                    device_id = %mapping.device_id,
                    field = %mapping.original_field,
                    custom_name = %mapping.custom_name,
                    data_type = ?mapping.data_type,
                    reason = %reason,
                    "mapping conversion failed, raw value kept"
                );
                continue;
            }
        };

        out.remove(&mapping.original_field);
        out.insert(
            mapping.custom_name.clone(),
            json!({
                "value": converted,
                "unit": mapping.unit,
                "original_field": mapping.original_field,
            }),
        );
    }

    out
}

pub fn convert_value(value: &Value, data_type: MappingType) -> Result<Value, String> {
    match data_type {
        MappingType::String => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        MappingType::Number | MappingType::Temperature => to_number(value).map(|n| json!(n)),
        MappingType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|v| v != 0.0))),
            Value::String(s) => match s.trim() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" | "" => Ok(Value::Bool(false)),
                other => Err(format!("not a boolean: {}", other)),
            },
            other => Err(format!("not a boolean: {}", other)),
        },
        MappingType::Date => match value {
            Value::String(s) => OffsetDateTime::parse(s, &Rfc3339)
                .map(|_| Value::String(s.clone()))
                .map_err(|e| format!("invalid date {}: {}", s, e)),
            Value::Number(n) => {
                let secs = n.as_i64().ok_or_else(|| format!("invalid timestamp: {}", n))?;
                OffsetDateTime::from_unix_timestamp(secs)
                    .map_err(|e| e.to_string())
                    .and_then(|t| t.format(&Rfc3339).map_err(|e| e.to_string()))
                    .map(Value::String)
            }
            other => Err(format!("not a date: {}", other)),
        },
        MappingType::Coordinates => {
            let lat = value.get("latitude").and_then(Value::as_f64);
            let lng = value.get("longitude").and_then(Value::as_f64);
            match (lat, lng) {
                (Some(lat), Some(lng)) => {
                    let valid = value
                        .get("correctness")
                        .and_then(Value::as_u64)
                        .map_or(true, |c| c == 0);
                    Ok(json!({ "lat": lat, "lng": lng, "valid": valid }))
                }
                _ => Err("coordinates need latitude and longitude".to_string()),
            }
        }
        MappingType::Status => match value {
            Value::Number(n) => {
                let raw = n
                    .as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| format!("status out of range: {}", n))?;
                serde_json::to_value(StatusFlags::from_bits(raw)).map_err(|e| e.to_string())
            }
            Value::Object(_) => Ok(value.clone()),
            other => Err(format!("not a status word: {}", other)),
        },
    }
}

fn to_number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("not a number: {}", n)),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| format!("not a number: {}", s)),
        other => Err(format!("not a number: {}", other)),
    }
}
