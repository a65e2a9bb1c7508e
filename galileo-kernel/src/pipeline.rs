/**
 * PIPELINE D'INGESTION - Des enregistrements décodés à l'état durable
 *
 * RÔLE : Consomme les paquets déjà acquittés par les connexions (file mpsc
 * bornée) et les transforme en enregistrements persistés, notifications et
 * alertes.
 *
 * FONCTIONNEMENT (par paquet) :
 * 1. Regroupement des enregistrements par IMEI
 * 2. Résolution de l'appareil (registre) et de ses mappings (cache TTL)
 * 3. Projection répartie sur `fanout` tâches bloquantes (spawn_blocking)
 * 4. Insert groupé par tranches de `batch_chunk_size`, repli unitaire en cas d'échec
 * 5. Notification `records`, puis évaluation des alertes une fois par appareil
 *
 * CONCURRENCE : au plus `max_in_flight_packets` paquets traités en même temps
 * (Semaphore). Un échec sur un enregistrement n'interrompt jamais le paquet.
 */

use futures::future;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;

use crate::alerts::AlertEngine;
use crate::devices::DeviceRegistry;
use crate::health::HealthTracker;
use crate::mapping::MappingCache;
use crate::models::{Device, FieldMapping, ProjectedRecord};
use crate::mqtt::{Notification, Notifier};
use crate::ports::Persistence;
use crate::projection::{project, ProjectionError};
use crate::protocol::Record;

/// Paquet extrait et acquitté, en attente de traitement
#[derive(Debug, Clone)]
pub struct PacketJob {
    pub peer: SocketAddr,
    pub packet_hex: String,
    pub records: Vec<Record>,
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_in_flight_packets: usize,
    pub fanout: usize,
    pub batch_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_packets: 10,
            fanout: 4,
            batch_chunk_size: 100,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketOutcome {
    pub persisted: usize,
    pub dropped: usize,
    pub alerts: usize,
}

pub struct Pipeline {
    devices: Arc<DeviceRegistry>,
    mappings: Arc<MappingCache>,
    alerts: Arc<AlertEngine>,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
    health: HealthTracker,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        devices: Arc<DeviceRegistry>,
        mappings: Arc<MappingCache>,
        alerts: Arc<AlertEngine>,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
        health: HealthTracker,
        config: PipelineConfig,
    ) -> Self {
        Self {
            devices,
            mappings,
            alerts,
            store,
            notifier,
            health,
            config,
        }
    }

    pub async fn process_packet(&self, job: PacketJob) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        let mut by_imei: BTreeMap<String, Vec<Record>> = BTreeMap::new();

        for record in job.records {
            match record.imei.clone() {
                Some(imei) => by_imei.entry(imei).or_default().push(record),
                None => {
                    tracing::warn!(
                        peer = %job.peer,
                        packet = %job.packet_hex,
                        tags = ?record.tag_ids(),
                        "record without IMEI skipped"
                    );
                    outcome.dropped += 1;
                }
            }
        }

        for (imei, records) in by_imei {
            let device_outcome = self
                .process_device(&imei, records, &job.packet_hex, job.received_at)
                .await;
            outcome.persisted += device_outcome.persisted;
            outcome.dropped += device_outcome.dropped;
            outcome.alerts += device_outcome.alerts;
        }

        self.health.records_persisted(outcome.persisted);
        self.health.records_dropped(outcome.dropped);
        self.health.alerts_raised(outcome.alerts);
        outcome
    }

    async fn process_device(
        &self,
        imei: &str,
        records: Vec<Record>,
        packet_hex: &str,
        received_at: OffsetDateTime,
    ) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();

        let device = match self.devices.resolve(imei).await {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(imei, packet = %packet_hex, error = %e, "device resolution failed, records dropped");
                outcome.dropped = records.len();
                return outcome;
            }
        };

        let mappings = match self.mappings.get(device.id).await {
            Ok(mappings) => mappings,
            Err(e) => {
                tracing::warn!(imei, error = %e, "field mappings unavailable, records stored unmapped");
                Arc::new(Vec::new())
            }
        };

        let mut ready = Vec::with_capacity(records.len());
        for (chunk_len, result) in self.project_all(records, &device, mappings, received_at).await {
            match result {
                Ok(projected) => {
                    for result in projected {
                        match result {
                            Ok(record) => ready.push(record),
                            Err((tags, e)) => {
                                tracing::error!(imei, packet = %packet_hex, tags = ?tags, error = %e, "record projection failed");
                                outcome.dropped += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(imei, packet = %packet_hex, records = chunk_len, error = %e, "projection task failed");
                    outcome.dropped += chunk_len;
                }
            }
        }

        let persisted = self.persist(imei, ready, packet_hex).await;
        outcome.persisted = persisted.stored.len();
        outcome.dropped += persisted.dropped;

        if persisted.stored.is_empty() {
            return outcome;
        }

        self.notifier.publish(
            device.id,
            &Notification::Records {
                imei: imei.to_string(),
                records: persisted.stored.clone(),
            },
        );

        outcome.alerts = self.raise_alerts(&device, &persisted.stored).await;
        outcome
    }

    /// Projection répartie sur au plus `fanout` tâches bloquantes, ordre conservé
    async fn project_all(
        &self,
        records: Vec<Record>,
        device: &Device,
        mappings: Arc<Vec<FieldMapping>>,
        received_at: OffsetDateTime,
    ) -> Vec<(usize, Result<Vec<Projected>, JoinError>)> {
        let fanout = self.config.fanout.max(1);
        let per_task = records.len().div_ceil(fanout).max(1);

        let mut chunks = Vec::with_capacity(fanout);
        let mut rest = records.into_iter().peekable();
        while rest.peek().is_some() {
            chunks.push(rest.by_ref().take(per_task).collect::<Vec<_>>());
        }

        let tasks = chunks.into_iter().map(|chunk| {
            let chunk_len = chunk.len();
            let device = device.clone();
            let mappings = mappings.clone();
            let handle = tokio::task::spawn_blocking(move || {
                chunk
                    .into_iter()
                    .map(|record| project(&record, &device, &mappings, received_at).map_err(|e| (record.tag_ids(), e)))
                    .collect::<Vec<_>>()
            });
            async move { (chunk_len, handle.await) }
        });
        future::join_all(tasks).await
    }

    /// Insert groupé par tranche, repli unitaire sur échec d'une tranche
    async fn persist(&self, imei: &str, records: Vec<ProjectedRecord>, packet_hex: &str) -> Persisted {
        let mut persisted = Persisted::default();

        for chunk in records.chunks(self.config.batch_chunk_size.max(1)) {
            match self.store.bulk_insert_records(chunk).await {
                Ok(_) => persisted.stored.extend_from_slice(chunk),
                Err(e) => {
                    tracing::warn!(imei, batch = chunk.len(), error = %e, "bulk insert failed, falling back to single inserts");
                    for record in chunk {
                        match self.store.insert_record(record).await {
                            Ok(()) => persisted.stored.push(record.clone()),
                            Err(e) => {
                                tracing::error!(
                                    imei,
                                    packet = %packet_hex,
                                    record_number = ?record.record_number,
                                    tags = ?record.raw_data.keys().collect::<Vec<_>>(),
                                    error = %e,
                                    "record insert failed, dropped"
                                );
                                persisted.dropped += 1;
                            }
                        }
                    }
                }
            }
        }

        persisted
    }

    async fn raise_alerts(&self, device: &Device, records: &[ProjectedRecord]) -> usize {
        let rules = match self.alerts.rules_for(device.id).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!(imei = %device.imei, error = %e, "alert rules unavailable");
                return 0;
            }
        };
        if rules.is_empty() {
            return 0;
        }

        let alerts = self.alerts.evaluate(device.id, &rules, records);
        if alerts.is_empty() {
            return 0;
        }

        if let Err(e) = self.store.insert_alerts(&alerts).await {
            tracing::error!(imei = %device.imei, alerts = alerts.len(), error = %e, "failed to store alerts");
        }
        self.notifier.publish(device.id, &Notification::Alerts { alerts: alerts.clone() });
        alerts.len()
    }

    /// Consomme la file jusqu'à sa fermeture, puis attend la fin des paquets en cours
    pub fn spawn(self: Arc<Self>, mut jobs: mpsc::Receiver<PacketJob>) -> tokio::task::JoinHandle<()> {
        let limit = self.config.max_in_flight_packets.max(1);
        let permits = Arc::new(Semaphore::new(limit));

        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let pipeline = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let peer = job.peer;
                    let outcome = pipeline.process_packet(job).await;
                    tracing::debug!(
                        peer = %peer,
                        persisted = outcome.persisted,
                        dropped = outcome.dropped,
                        alerts = outcome.alerts,
                        "packet processed"
                    );
                });
            }

            let _ = permits.acquire_many(limit as u32).await;
            tracing::info!("ingestion pipeline drained");
        })
    }
}

type Projected = Result<ProjectedRecord, (Vec<String>, ProjectionError)>;

#[derive(Default)]
struct Persisted {
    stored: Vec<ProjectedRecord>,
    dropped: usize,
}
