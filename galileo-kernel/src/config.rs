use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::pipeline::PipelineConfig;
use crate::protocol::SplitMode;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub tcp: TcpConf,
    pub protocol: ProtocolConf,
    pub pipeline: PipelineConf,
    pub devices: DevicesConf,
    pub alerts: AlertsConf,
    pub storage: StorageConf,
    pub mqtt: Option<MqttConf>,
    pub health: HealthConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TcpConf {
    pub bind: String,
    pub port: u16,
    pub idle_timeout_ms: u64,
    pub read_buffer: usize,
}

impl Default for TcpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 3003,
            idle_timeout_ms: 30_000,
            read_buffer: 4096,
        }
    }
}

impl TcpConf {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProtocolConf {
    pub validate_checksum: bool,
    pub split_mode: SplitMode,
    pub multi_record_threshold: usize,
}

impl Default for ProtocolConf {
    fn default() -> Self {
        Self {
            validate_checksum: true,
            split_mode: SplitMode::Heuristic,
            multi_record_threshold: crate::protocol::record::DEFAULT_MULTI_RECORD_THRESHOLD,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConf {
    pub queue_capacity: usize,
    pub max_in_flight_packets: usize,
    pub fanout: usize,
    pub batch_chunk_size: usize,
    pub mapping_cache_ttl_secs: u64,
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_in_flight_packets: 10,
            fanout: 4,
            batch_chunk_size: 100,
            mapping_cache_ttl_secs: 300,
        }
    }
}

impl PipelineConf {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_in_flight_packets: self.max_in_flight_packets,
            fanout: self.fanout,
            batch_chunk_size: self.batch_chunk_size,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DevicesConf {
    pub offline_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DevicesConf {
    fn default() -> Self {
        Self {
            offline_timeout_secs: 30,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertsConf {
    pub reload_interval_secs: u64,
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { reload_interval_secs: 300 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConf {
    pub data_dir: String,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { data_dir: "./data".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_client_id() -> String {
    "galileo-kernel".into()
}

fn default_topic_prefix() -> String {
    "galileo".into()
}

impl MqttConf {
    fn with_host(host: String) -> Self {
        Self {
            host,
            port: 1883,
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HealthConf {
    pub publish_interval_secs: u64,
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { publish_interval_secs: 30 }
    }
}

impl KernelConfig {
    /// Périodes des tâches de fond : zéro remplacé par la valeur par défaut
    fn normalize_periods(&mut self) {
        fn non_zero(name: &str, value: &mut u64, default: u64) {
            if *value == 0 {
                tracing::warn!(setting = name, default, "zero period rejected, using default");
                *value = default;
            }
        }

        non_zero(
            "devices.sweep_interval_secs",
            &mut self.devices.sweep_interval_secs,
            DevicesConf::default().sweep_interval_secs,
        );
        non_zero(
            "alerts.reload_interval_secs",
            &mut self.alerts.reload_interval_secs,
            AlertsConf::default().reload_interval_secs,
        );
        non_zero(
            "health.publish_interval_secs",
            &mut self.health.publish_interval_secs,
            HealthConf::default().publish_interval_secs,
        );
    }
}

/// Texte YAML → config ; vide ou invalide = défauts
pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    let mut cfg: KernelConfig = serde_yaml::from_str(txt).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid kernel config, using defaults");
        KernelConfig::default()
    });
    cfg.normalize_periods();
    cfg
}

/// Variables d'environnement prioritaires sur le fichier
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
        let raw = raw?;
        match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "ignoring unparsable override");
                None
            }
        }
    }

    if let Some(port) = parsed("TCP_PORT", lookup("TCP_PORT")) {
        cfg.tcp.port = port;
    }
    if let Some(ms) = parsed("TCP_TIMEOUT", lookup("TCP_TIMEOUT")) {
        cfg.tcp.idle_timeout_ms = ms;
    }
    if let Some(raw) = lookup("VALIDATE_CHECKSUM") {
        cfg.protocol.validate_checksum = !matches!(raw.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off");
    }
    if let Some(size) = parsed("BATCH_SIZE", lookup("BATCH_SIZE")) {
        cfg.pipeline.batch_chunk_size = size;
    }
    if let Some(n) = parsed("MAX_CONCURRENCY", lookup("MAX_CONCURRENCY")) {
        cfg.pipeline.max_in_flight_packets = n;
    }
    if let Some(host) = lookup("MQTT_HOST") {
        match cfg.mqtt.as_mut() {
            Some(mqtt) => mqtt.host = host,
            None => cfg.mqtt = Some(MqttConf::with_host(host)),
        }
    }
    if let Some(port) = parsed::<u16>("MQTT_PORT", lookup("MQTT_PORT")) {
        if let Some(mqtt) = cfg.mqtt.as_mut() {
            mqtt.port = port;
        }
    }
    if let Some(dir) = lookup("DATA_DIR") {
        cfg.storage.data_dir = dir;
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("GALILEO_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        tracing::warn!(path = %path, "no kernel config file, using defaults");
        KernelConfig::default()
    };
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg
}
