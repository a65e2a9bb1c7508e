/**
 * DEVICES - Registre en mémoire des traceurs connus
 *
 * RÔLE : Résolution IMEI → appareil pour chaque paquet, suivi de l'activité,
 * bascule en `offline` des appareils silencieux par un balayage périodique.
 *
 * ARCHITECTURE : DashMap (verrous par shard, pas de verrou global) adossée au
 * port `Persistence`. Seules les transitions de statut sont persistées et
 * publiées en notification `status`.
 */

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::models::{Device, DeviceStatus};
use crate::mqtt::{Notification, Notifier};
use crate::ports::{Persistence, StoreError};

#[derive(Debug, Clone)]
struct DeviceEntry {
    device: Device,
    last_seen: Instant,
}

pub struct DeviceRegistry {
    devices: DashMap<String, DeviceEntry>,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    offline_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Persistence>, notifier: Arc<dyn Notifier>, offline_timeout: Duration) -> Self {
        Self {
            devices: DashMap::new(),
            store,
            notifier,
            offline_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, imei: &str) -> Option<Device> {
        self.devices.get(imei).map(|e| e.device.clone())
    }

    /// Résout l'appareil d'un IMEI et le marque actif
    pub async fn resolve(&self, imei: &str) -> Result<Device, StoreError> {
        let hit = self.devices.get_mut(imei).map(|mut entry| {
            let previous = entry.device.status;
            entry.last_seen = Instant::now();
            entry.device.status = DeviceStatus::Active;
            entry.device.last_seen_at = Some(OffsetDateTime::now_utc());
            (entry.device.clone(), previous)
        });

        let (device, previous) = match hit {
            Some(found) => found,
            None => {
                let mut device = self.store.find_or_create_device(imei).await?;
                let previous = device.status;
                device.status = DeviceStatus::Active;
                device.last_seen_at = Some(OffsetDateTime::now_utc());
                self.devices.insert(
                    imei.to_string(),
                    DeviceEntry {
                        device: device.clone(),
                        last_seen: Instant::now(),
                    },
                );
                tracing::debug!(imei, device_id = %device.id, "device resolved from store");
                (device, previous)
            }
        };

        if previous != DeviceStatus::Active {
            self.transition(&device, DeviceStatus::Active).await;
        }
        Ok(device)
    }

    /// Passe en `offline` les appareils actifs silencieux depuis plus que le timeout
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut went_offline = Vec::new();

        for mut entry in self.devices.iter_mut() {
            if entry.device.status == DeviceStatus::Active
                && now.duration_since(entry.last_seen) > self.offline_timeout
            {
                entry.device.status = DeviceStatus::Offline;
                went_offline.push(entry.device.clone());
            }
        }

        for device in &went_offline {
            self.transition(device, DeviceStatus::Offline).await;
        }
        went_offline.len()
    }

    async fn transition(&self, device: &Device, status: DeviceStatus) {
        if let Err(e) = self.store.update_device_status(&device.imei, status).await {
            tracing::error!(imei = %device.imei, status = status.as_str(), error = %e, "failed to persist device status");
        }
        tracing::info!(imei = %device.imei, status = status.as_str(), "device status changed");
        self.notifier.publish(
            device.id,
            &Notification::Status {
                imei: device.imei.clone(),
                status,
            },
        );
    }

    /// Balayage périodique des appareils silencieux
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tracing::info!(
            interval_secs = every.as_secs(),
            timeout_secs = self.offline_timeout.as_secs(),
            "starting offline device sweep"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let count = self.sweep().await;
                if count > 0 {
                    tracing::info!(count, "devices marked offline");
                }
            }
        })
    }
}
