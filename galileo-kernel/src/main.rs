/**
 * GALILEO KERNEL - Point d'entrée du serveur d'ingestion Galileosky
 *
 * RÔLE : Orchestration de tous les modules : config, stockage, MQTT,
 * registre d'appareils, pipeline d'ingestion, listener TCP, health.
 *
 * ARCHITECTURE : connexions TCP (framing + ACK) → file mpsc bornée →
 * pipeline (projection, persistance groupée, alertes) → notifications MQTT.
 * Arrêt propre sur Ctrl-C : plus d'acceptation, vidage de la file, bilan health.
 */

mod alerts;
mod config;
mod devices;
mod health;
mod mapping;
mod models;
mod mqtt;
mod pipeline;
mod ports;
mod projection;
mod protocol;
mod server;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::alerts::{AlertEngine, NeverFires};
use crate::config::load_config;
use crate::devices::DeviceRegistry;
use crate::health::HealthTracker;
use crate::mapping::MappingCache;
use crate::mqtt::{LogNotifier, MqttNotifier, Notifier};
use crate::pipeline::Pipeline;
use crate::ports::{JsonStore, Persistence};
use crate::protocol::Assembler;
use crate::server::ConnectionContext;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("galileo_kernel=info")))
        .init();

    let cfg = load_config().await;
    tracing::info!(
        addr = %cfg.tcp.address(),
        split_mode = ?cfg.protocol.split_mode,
        validate_checksum = cfg.protocol.validate_checksum,
        data_dir = %cfg.storage.data_dir,
        "galileo kernel starting"
    );

    let health = HealthTracker::new();

    // stockage
    let store: Arc<dyn Persistence> = Arc::new(
        JsonStore::open(&cfg.storage.data_dir)
            .with_context(|| format!("failed to open data dir {}", cfg.storage.data_dir))?,
    );

    // MQTT (optionnel) : notifications sortantes + topics de contrôle
    let mqtt = cfg.mqtt.as_ref().map(|conf| {
        let (client, eventloop) = mqtt::create_mqtt_client(conf);
        (conf.topic_prefix.clone(), client, eventloop)
    });
    let notifier: Arc<dyn Notifier> = match &mqtt {
        Some((prefix, client, _)) => Arc::new(MqttNotifier::new(client.clone(), prefix)),
        None => {
            tracing::warn!("no mqtt section, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let devices = Arc::new(DeviceRegistry::new(
        store.clone(),
        notifier.clone(),
        Duration::from_secs(cfg.devices.offline_timeout_secs),
    ));
    let mappings = Arc::new(MappingCache::new(
        store.clone(),
        Duration::from_secs(cfg.pipeline.mapping_cache_ttl_secs),
    ));
    let alerts = Arc::new(AlertEngine::new(store.clone(), Arc::new(NeverFires)));

    // tâches de fond
    devices
        .clone()
        .spawn_sweeper(Duration::from_secs(cfg.devices.sweep_interval_secs));
    alerts
        .clone()
        .spawn_reloader(Duration::from_secs(cfg.alerts.reload_interval_secs));

    let health_client = match mqtt {
        Some((prefix, client, eventloop)) => {
            mqtt::spawn_mqtt_event_loop(
                client.clone(),
                eventloop,
                prefix.clone(),
                mappings.clone(),
                alerts.clone(),
                health.clone(),
            );
            Some((client, format!("{}/kernel/health@v1", prefix)))
        }
        None => None,
    };
    let (client, topic) = match health_client {
        Some((client, topic)) => (Some(client), topic),
        None => (None, String::new()),
    };
    health.spawn_health_publisher(
        client,
        topic,
        Duration::from_secs(cfg.health.publish_interval_secs),
        devices.clone(),
    );

    // pipeline d'ingestion
    let (jobs_tx, jobs_rx) = mpsc::channel(cfg.pipeline.queue_capacity.max(1));
    let pipeline = Arc::new(Pipeline::new(
        devices.clone(),
        mappings,
        alerts,
        store,
        notifier,
        health.clone(),
        cfg.pipeline.pipeline_config(),
    ));
    let pipeline_task = pipeline.spawn(jobs_rx);

    // listener TCP
    let ctx = Arc::new(ConnectionContext {
        assembler: Assembler::new(cfg.protocol.split_mode, cfg.protocol.multi_record_threshold),
        validate_checksum: cfg.protocol.validate_checksum,
        idle_timeout: cfg.tcp.idle_timeout(),
        read_buffer: cfg.tcp.read_buffer,
        jobs: jobs_tx,
        health: health.clone(),
    });
    let listener = server::bind(&cfg.tcp.address()).await?;

    server::serve(listener, ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    // Les connexions encore ouvertes gardent l'émetteur : drain borné
    match tokio::time::timeout(DRAIN_TIMEOUT, pipeline_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "pipeline task failed"),
        Err(_) => tracing::warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "pipeline drain timed out"),
    }

    let snapshot = health.snapshot(devices.len());
    tracing::info!(
        uptime = snapshot.uptime_seconds,
        frames = snapshot.frames_received,
        acks = snapshot.acks_sent,
        checksum_failures = snapshot.checksum_failures,
        persisted = snapshot.records_persisted,
        dropped = snapshot.records_dropped,
        shed = snapshot.packets_shed,
        alerts = snapshot.alerts_raised,
        "galileo kernel stopped"
    );
    Ok(())
}
