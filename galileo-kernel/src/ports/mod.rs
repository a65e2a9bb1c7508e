/**
 * PORT DE PERSISTANCE - Interface entre le pipeline d'ingestion et le stockage
 *
 * RÔLE :
 * Le kernel ne connaît pas le schéma de stockage : il parle à un collaborateur
 * `Persistence` qui résout les appareils, fournit mappings et règles d'alerte,
 * et absorbe les enregistrements projetés.
 *
 * FONCTIONNEMENT :
 * - Persistence trait = opérations async consommées par le pipeline
 * - JsonStore = implémentation fichier (JSON + JSON lines) pour déploiement simple
 * - MockPersistence (tests) = généré par mockall pour compter les appels
 *
 * Contrat : `bulk_insert_records` est tout-ou-rien ; en cas d'échec le
 * pipeline retente chaque enregistrement via `insert_record`.
 */

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Alert, AlertRule, Device, DeviceStatus, FieldMapping, ProjectedRecord};

pub mod json_store;

pub use json_store::JsonStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Retourne l'appareil de cet IMEI, créé au besoin
    async fn find_or_create_device(&self, imei: &str) -> Result<Device, StoreError>;

    async fn update_device_status(&self, imei: &str, status: DeviceStatus) -> Result<(), StoreError>;

    async fn get_field_mappings(&self, device_id: Uuid) -> Result<Vec<FieldMapping>, StoreError>;

    /// Écriture groupée, tout-ou-rien
    async fn bulk_insert_records(&self, records: &[ProjectedRecord]) -> Result<usize, StoreError>;

    async fn insert_record(&self, record: &ProjectedRecord) -> Result<(), StoreError>;

    /// Règles actives qui concernent cet appareil (globales incluses)
    async fn get_enabled_alert_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>, StoreError>;

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<(), StoreError>;
}
