/**
 * MQTT - Notifications sortantes et topics de contrôle
 *
 * SORTANT (fire-and-forget, jamais d'attente du broker) :
 * - <prefix>/devices/<device_id>/data@v1 : records | alerts | status
 * - <prefix>/kernel/health@v1            : voir health.rs
 *
 * ENTRANT (boucle d'événements) :
 * - <prefix>/mappings/changed@v1     : {"device_id": ...} → invalide le cache de mappings
 * - <prefix>/alerts/rules-changed@v1 : rechargement complet des règles d'alerte
 *
 * Sans section `mqtt` dans la config, `LogNotifier` remplace le broker.
 */

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::mapping::MappingCache;
use crate::models::{Alert, DeviceStatus, ProjectedRecord};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Notification {
    Records {
        imei: String,
        records: Vec<ProjectedRecord>,
    },
    Alerts {
        alerts: Vec<Alert>,
    },
    Status {
        imei: String,
        status: DeviceStatus,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Records { .. } => "records",
            Notification::Alerts { .. } => "alerts",
            Notification::Status { .. } => "status",
        }
    }
}

/// Canal de diffusion vers les consommateurs (dashboards, alerting)
pub trait Notifier: Send + Sync {
    fn publish(&self, device_id: Uuid, notification: &Notification);
}

pub struct MqttNotifier {
    client: AsyncClient,
    prefix: String,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }
}

pub fn device_topic(prefix: &str, device_id: Uuid) -> String {
    format!("{}/devices/{}/data@v1", prefix, device_id)
}

impl Notifier for MqttNotifier {
    fn publish(&self, device_id: Uuid, notification: &Notification) {
        let payload = match serde_json::to_vec(notification) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(%device_id, error = %e, "notification serialization failed");
                return;
            }
        };
        let topic = device_topic(&self.prefix, device_id);
        if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            tracing::warn!(%device_id, kind = notification.kind(), error = %e, "notification dropped");
        }
    }
}

/// Utilisé quand aucun broker n'est configuré
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, device_id: Uuid, notification: &Notification) {
        match notification {
            Notification::Records { imei, records } => {
                tracing::debug!(%device_id, imei = %imei, records = records.len(), "records published")
            }
            Notification::Alerts { alerts } => {
                tracing::info!(%device_id, alerts = alerts.len(), "alerts raised")
            }
            Notification::Status { imei, status } => {
                tracing::info!(%device_id, imei = %imei, status = status.as_str(), "device status changed")
            }
        }
    }
}

// Topics de contrôle

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `None` = tous les appareils
    MappingsChanged(Option<Uuid>),
    AlertRulesChanged,
}

#[derive(Debug, Deserialize)]
struct MappingsChangedPayload {
    device_id: Option<Uuid>,
}

pub fn mappings_topic(prefix: &str) -> String {
    format!("{}/mappings/changed@v1", prefix)
}

pub fn rules_topic(prefix: &str) -> String {
    format!("{}/alerts/rules-changed@v1", prefix)
}

pub fn parse_control(prefix: &str, topic: &str, payload: &[u8]) -> Option<ControlMessage> {
    if topic == mappings_topic(prefix) {
        let device_id = serde_json::from_slice::<MappingsChangedPayload>(payload)
            .ok()
            .and_then(|p| p.device_id);
        Some(ControlMessage::MappingsChanged(device_id))
    } else if topic == rules_topic(prefix) {
        Some(ControlMessage::AlertRulesChanged)
    } else {
        None
    }
}

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 100)
}

/// Boucle d'événements MQTT : (ré)abonnement aux topics de contrôle et dispatch
pub fn spawn_mqtt_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    prefix: String,
    mappings: Arc<MappingCache>,
    alerts: Arc<AlertEngine>,
    health: HealthTracker,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    tracing::info!("mqtt connected");
                    for topic in [mappings_topic(&prefix), rules_topic(&prefix)] {
                        if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                            tracing::error!(topic = %topic, error = %e, "mqtt subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    match parse_control(&prefix, &p.topic, &p.payload) {
                        Some(ControlMessage::MappingsChanged(device_id)) => {
                            mappings.invalidate(device_id);
                            tracing::info!(device_id = ?device_id, "mapping cache invalidated");
                        }
                        Some(ControlMessage::AlertRulesChanged) => {
                            let alerts = alerts.clone();
                            task::spawn(async move {
                                match alerts.reload().await {
                                    Ok(n) => tracing::info!(devices = n, "alert rules reloaded"),
                                    Err(e) => tracing::error!(error = %e, "alert rules reload failed"),
                                }
                            });
                        }
                        None => tracing::debug!(topic = %p.topic, "unhandled mqtt message"),
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                    tracing::warn!("mqtt broker closed the session");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "mqtt connection error");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Notifier de test qui mémorise les publications
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub published: parking_lot::Mutex<Vec<(Uuid, Notification)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.published.lock().iter().map(|(_, n)| n.kind()).collect()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn publish(&self, device_id: Uuid, notification: &Notification) {
        self.published.lock().push((device_id, notification.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_topics() {
        let id = Uuid::new_v4();
        let payload = serde_json::to_vec(&serde_json::json!({ "device_id": id })).unwrap();
        assert_eq!(
            parse_control("galileo", "galileo/mappings/changed@v1", &payload),
            Some(ControlMessage::MappingsChanged(Some(id)))
        );
        assert_eq!(
            parse_control("galileo", "galileo/mappings/changed@v1", b"{}"),
            Some(ControlMessage::MappingsChanged(None))
        );
        assert_eq!(
            parse_control("galileo", "galileo/alerts/rules-changed@v1", b""),
            Some(ControlMessage::AlertRulesChanged)
        );
        assert_eq!(parse_control("galileo", "other/topic", b""), None);
    }

    #[test]
    fn test_notification_payload_shape() {
        let n = Notification::Status {
            imei: "868204005647838".into(),
            status: DeviceStatus::Offline,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["status"], "offline");
        assert_eq!(
            device_topic("galileo", Uuid::nil()),
            "galileo/devices/00000000-0000-0000-0000-000000000000/data@v1"
        );
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::default();
        notifier.publish(Uuid::nil(), &Notification::Alerts { alerts: vec![] });
        assert_eq!(notifier.kinds(), vec!["alerts"]);
    }
}
