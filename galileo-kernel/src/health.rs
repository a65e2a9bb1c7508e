use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

use crate::devices::DeviceRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub devices_tracked: u64,
    pub connections_open: i64,
    pub frames_received: u64,
    pub acks_sent: u64,
    pub checksum_failures: u64,
    pub unknown_tags: u64,
    pub packets_shed: u64,
    pub records_persisted: u64,
    pub records_dropped: u64,
    pub alerts_raised: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Debug, Default)]
struct Counters {
    connections_open: AtomicI64,
    frames_received: AtomicU64,
    acks_sent: AtomicU64,
    checksum_failures: AtomicU64,
    unknown_tags: AtomicU64,
    packets_shed: AtomicU64,
    records_persisted: AtomicU64,
    records_dropped: AtomicU64,
    alerts_raised: AtomicU64,
    mqtt_reconnects: AtomicU32,
}

/// Compteurs partagés entre connexions, pipeline et boucle MQTT
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn connection_opened(&self) {
        self.counters.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.counters.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.counters.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checksum_failure(&self) {
        self.counters.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_tags(&self, count: usize) {
        self.counters.unknown_tags.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn packet_shed(&self) {
        self.counters.packets_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_persisted(&self, count: usize) {
        self.counters.records_persisted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn records_dropped(&self, count: usize) {
        self.counters.records_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn alerts_raised(&self, count: usize) {
        self.counters.alerts_raised.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.counters.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn snapshot(&self, devices_tracked: usize) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            devices_tracked: devices_tracked as u64,
            connections_open: c.connections_open.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            acks_sent: c.acks_sent.load(Ordering::Relaxed),
            checksum_failures: c.checksum_failures.load(Ordering::Relaxed),
            unknown_tags: c.unknown_tags.load(Ordering::Relaxed),
            packets_shed: c.packets_shed.load(Ordering::Relaxed),
            records_persisted: c.records_persisted.load(Ordering::Relaxed),
            records_dropped: c.records_dropped.load(Ordering::Relaxed),
            alerts_raised: c.alerts_raised.load(Ordering::Relaxed),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: c.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publication périodique de la santé du kernel (MQTT si disponible, sinon log)
    pub fn spawn_health_publisher(
        &self,
        client: Option<AsyncClient>,
        topic: String,
        every: Duration,
        devices: Arc<DeviceRegistry>,
    ) -> task::JoinHandle<()> {
        let tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // Le premier tick est immédiat
            interval.tick().await;

            loop {
                interval.tick().await;
                let health = tracker.snapshot(devices.len());

                match (&client, serde_json::to_string(&health)) {
                    (Some(client), Ok(payload)) => {
                        if let Err(e) = client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
                            tracing::warn!(error = %e, "failed to publish kernel health");
                        }
                    }
                    (None, Ok(_)) => {}
                    (_, Err(e)) => tracing::warn!(error = %e, "failed to serialize kernel health"),
                }

                tracing::info!(
                    uptime = health.uptime_seconds,
                    devices = health.devices_tracked,
                    connections = health.connections_open,
                    frames = health.frames_received,
                    persisted = health.records_persisted,
                    shed = health.packets_shed,
                    "kernel health"
                );
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }

    0.0
}
