/**
 * ALERTES - Règles par appareil et évaluation par paquet
 *
 * RÔLE : Pour chaque appareil d'un paquet, charge ses règles actives une
 * seule fois puis évalue chaque règle contre chaque enregistrement.
 *
 * CONCURRENCE :
 * - Lecture sans verrou : snapshot `ArcSwap` de device_id → règles
 * - Rechargement complet (mutation signalée par MQTT ou minuterie) sous
 *   un Mutex tokio, puis publication atomique du nouveau snapshot
 *
 * La grammaire des conditions n'est pas définie ici : un `ConditionEvaluator`
 * l'interprète. `NeverFires` est l'évaluateur par défaut.
 */

use arc_swap::ArcSwap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Alert, AlertRule, ProjectedRecord};
use crate::ports::{Persistence, StoreError};

pub trait ConditionEvaluator: Send + Sync {
    fn matches(&self, rule: &AlertRule, record: &ProjectedRecord) -> bool;
}

pub struct NeverFires;

impl ConditionEvaluator for NeverFires {
    fn matches(&self, _rule: &AlertRule, _record: &ProjectedRecord) -> bool {
        false
    }
}

type RuleBook = HashMap<Uuid, Arc<Vec<AlertRule>>>;

pub struct AlertEngine {
    rules: ArcSwap<RuleBook>,
    store: Arc<dyn Persistence>,
    evaluator: Arc<dyn ConditionEvaluator>,
    reload_lock: Mutex<()>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Persistence>, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self {
            rules: ArcSwap::from_pointee(HashMap::new()),
            store,
            evaluator,
            reload_lock: Mutex::new(()),
        }
    }

    /// Règles actives d'un appareil, chargées au premier besoin
    pub async fn rules_for(&self, device_id: Uuid) -> Result<Arc<Vec<AlertRule>>, StoreError> {
        if let Some(rules) = self.rules.load().get(&device_id) {
            return Ok(rules.clone());
        }

        let rules = Arc::new(self.store.get_enabled_alert_rules(device_id).await?);
        self.rules.rcu(|book| {
            let mut next = HashMap::clone(book);
            next.insert(device_id, rules.clone());
            next
        });
        Ok(rules)
    }

    /// Recharge les règles de tous les appareils déjà connus. Retourne le nombre d'appareils.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let _guard = self.reload_lock.lock().await;

        let devices: Vec<Uuid> = self.rules.load().keys().copied().collect();
        let mut next = HashMap::with_capacity(devices.len());
        for device_id in devices {
            let rules = self.store.get_enabled_alert_rules(device_id).await?;
            next.insert(device_id, Arc::new(rules));
        }

        let count = next.len();
        self.rules.store(Arc::new(next));
        Ok(count)
    }

    pub fn evaluate(&self, device_id: Uuid, rules: &[AlertRule], records: &[ProjectedRecord]) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            for record in records {
                if self.evaluator.matches(rule, record) {
                    alerts.push(Alert {
                        id: Uuid::new_v4(),
                        rule_id: rule.id,
                        device_id,
                        severity: rule.severity,
                        triggered_at: OffsetDateTime::now_utc(),
                        data: json!({
                            "rule": rule.name,
                            "condition": rule.condition,
                            "record_id": record.id,
                            "record_number": record.record_number,
                            "latitude": record.latitude,
                            "longitude": record.longitude,
                            "speed": record.speed,
                        }),
                    });
                }
            }
        }
        alerts
    }

    pub fn spawn_reloader(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match self.reload().await {
                    Ok(devices) => tracing::debug!(devices, "alert rules reloaded"),
                    Err(e) => tracing::error!(error = %e, "periodic alert rule reload failed"),
                }
            }
        })
    }
}
