/**
 * SERVEUR TCP - Une tâche par traceur connecté
 *
 * RÔLE : Accepte les connexions des boîtiers, extrait les trames du flux,
 * acquitte chaque trame puis confie les enregistrements décodés au pipeline.
 *
 * FONCTIONNEMENT (par connexion) :
 * - Lecture `read_buf` directement dans le tampon du `Framer`, avec timeout d'inactivité
 * - Chaque trame complète est acquittée AVANT toute autre chose, même si le
 *   CRC est faux (un boîtier non acquitté renvoie la trame en boucle)
 * - Trame principale : vérification CRC optionnelle, découpage en
 *   enregistrements, puis `try_send` vers la file du pipeline
 * - File pleine : le paquet est abandonné et compté (l'ACK est déjà parti)
 *
 * Les erreurs de décodage restent locales : elles ne ferment jamais la connexion.
 */

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::health::HealthTracker;
use crate::pipeline::PacketJob;
use crate::protocol::frame::MAX_FRAME_LEN;
use crate::protocol::{Assembler, Framer, PacketKind, RawPacket, Session};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Partagé par toutes les connexions
pub struct ConnectionContext {
    pub assembler: Assembler,
    pub validate_checksum: bool,
    pub idle_timeout: Duration,
    pub read_buffer: usize,
    pub jobs: mpsc::Sender<PacketJob>,
    pub health: HealthTracker,
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    tracing::info!(addr, "galileosky listener bound");
    Ok(listener)
}

/// Boucle d'acceptation jusqu'à ce que `shutdown` se termine
pub async fn serve<F>(listener: TcpListener, ctx: Arc<ConnectionContext>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
                        }
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            ctx.health.connection_opened();
                            tracing::info!(peer = %peer, "device connected");
                            match handle_connection(stream, peer, &ctx).await {
                                Ok(()) => tracing::info!(peer = %peer, "device disconnected"),
                                Err(e) => tracing::warn!(peer = %peer, error = %e, "connection closed with error"),
                            }
                            ctx.health.connection_closed();
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    Ok(())
}

/// Sert un boîtier jusqu'à fermeture du flux ou inactivité
pub async fn handle_connection<S>(mut stream: S, peer: SocketAddr, ctx: &ConnectionContext) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = Framer::with_capacity(ctx.read_buffer.min(MAX_FRAME_LEN));
    let mut session = Session::default();

    loop {
        let read = tokio::time::timeout(ctx.idle_timeout, stream.read_buf(framer.buffer_mut())).await;
        match read {
            Err(_) => {
                tracing::info!(peer = %peer, idle_ms = ctx.idle_timeout.as_millis() as u64, "idle timeout");
                break;
            }
            Ok(Ok(0)) => {
                if framer.buffered() > 0 {
                    tracing::debug!(peer = %peer, pending = framer.buffered(), "peer closed with partial frame");
                }
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
        }

        while let Some(packet) = framer.next_packet() {
            ctx.health.frame_received();
            stream.write_all(&packet.confirmation()).await?;
            ctx.health.ack_sent();
            dispatch(ctx, peer, &packet, &mut session);
        }
    }

    Ok(())
}

fn dispatch(ctx: &ConnectionContext, peer: SocketAddr, packet: &RawPacket, session: &mut Session) {
    match packet.kind {
        PacketKind::Ignorable => {
            tracing::debug!(peer = %peer, "ignorable packet acknowledged");
            return;
        }
        PacketKind::Extension(packet_type) => {
            tracing::debug!(peer = %peer, packet_type, len = packet.declared_length, "extension packet acknowledged");
            return;
        }
        PacketKind::Main => {}
    }

    if ctx.validate_checksum {
        if let Err(e) = packet.verify_checksum() {
            ctx.health.checksum_failure();
            tracing::warn!(peer = %peer, packet = %packet.hex(), error = %e, "frame dropped");
            return;
        }
    }

    let assembly = ctx.assembler.assemble(&packet.body(), session);
    ctx.health.unknown_tags(assembly.unknown_tags);

    if !assembly.failures.is_empty() {
        ctx.health.records_dropped(assembly.failures.len());
        let packet_hex = packet.hex();
        for failure in &assembly.failures {
            tracing::warn!(
                peer = %peer,
                imei = ?session.imei(),
                packet = %packet_hex,
                error = %failure,
                "record decode failed"
            );
        }
    }

    if assembly.records.is_empty() {
        return;
    }

    tracing::debug!(
        peer = %peer,
        imei = ?session.imei(),
        records = assembly.records.len(),
        archive = packet.archive,
        "packet decoded"
    );

    let job = PacketJob {
        peer,
        packet_hex: packet.hex(),
        records: assembly.records,
        received_at: OffsetDateTime::now_utc(),
    };

    match ctx.jobs.try_send(job) {
        Ok(()) => {}
        Err(TrySendError::Full(job)) => {
            ctx.health.packet_shed();
            ctx.health.records_dropped(job.records.len());
            tracing::error!(
                peer = %peer,
                records = job.records.len(),
                packet = %job.packet_hex,
                "ingestion queue full, packet shed"
            );
        }
        Err(TrySendError::Closed(_)) => {
            tracing::warn!(peer = %peer, "ingestion pipeline stopped, packet discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertEngine, NeverFires};
    use crate::devices::DeviceRegistry;
    use crate::mapping::MappingCache;
    use crate::mqtt::LogNotifier;
    use crate::pipeline::{Pipeline, PipelineConfig};
    use crate::ports::{JsonStore, Persistence};
    use crate::protocol::{SplitMode, TagId};
    use galileo_devkit::{expected_ack, DeviceSimulator, FrameBuilder};
    use tokio::io::duplex;

    fn peer() -> SocketAddr {
        "10.0.0.7:51000".parse().unwrap()
    }

    fn context(capacity: usize, mode: SplitMode) -> (Arc<ConnectionContext>, mpsc::Receiver<PacketJob>) {
        context_with(capacity, mode, true)
    }

    fn context_with(
        capacity: usize,
        mode: SplitMode,
        validate_checksum: bool,
    ) -> (Arc<ConnectionContext>, mpsc::Receiver<PacketJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ctx = ConnectionContext {
            assembler: Assembler::new(mode, 32),
            validate_checksum,
            idle_timeout: Duration::from_secs(30),
            read_buffer: 4096,
            jobs: tx,
            health: HealthTracker::new(),
        };
        (Arc::new(ctx), rx)
    }

    fn imei_frame() -> Vec<u8> {
        let mut data = vec![0x03];
        data.extend_from_slice(b"123456789012345");
        FrameBuilder::main(data).build()
    }

    #[tokio::test]
    async fn test_byte_by_byte_frame_acked_and_decoded() {
        let (ctx, mut rx) = context(8, SplitMode::Heuristic);
        let (client, server) = duplex(1024);
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_connection(server, peer(), &ctx).await })
        };

        let frame = imei_frame();
        let mut device = DeviceSimulator::from_stream(client, "123456789012345");
        device.send_frame(&frame, Some(1)).await.unwrap();
        assert_eq!(device.read_ack().await.unwrap(), expected_ack(&frame));
        drop(device);
        task.await.unwrap().unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.peer, peer());
        assert_eq!(job.records.len(), 1);
        assert_eq!(job.records[0].imei.as_deref(), Some("123456789012345"));
        assert_eq!(
            job.records[0].get(TagId::Short(0x03)).and_then(|v| v.as_text()),
            Some("123456789012345")
        );

        let health = ctx.health.snapshot(0);
        assert_eq!(health.frames_received, 1);
        assert_eq!(health.acks_sent, 1);
    }

    #[tokio::test]
    async fn test_bad_checksum_still_acknowledged() {
        let (ctx, mut rx) = context(8, SplitMode::Heuristic);
        let (client, server) = duplex(1024);
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_connection(server, peer(), &ctx).await })
        };

        let mut data = vec![0x03];
        data.extend_from_slice(b"123456789012345");
        let frame = FrameBuilder::main(data).corrupt_crc().build();

        let mut device = DeviceSimulator::from_stream(client, "123456789012345");
        device.send_frame(&frame, None).await.unwrap();
        assert_eq!(device.read_ack().await.unwrap(), expected_ack(&frame));
        drop(device);
        task.await.unwrap().unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.health.snapshot(0).checksum_failures, 1);
    }

    #[tokio::test]
    async fn test_bad_checksum_accepted_when_validation_disabled() {
        let (ctx, mut rx) = context_with(8, SplitMode::Heuristic, false);
        let (client, server) = duplex(1024);
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_connection(server, peer(), &ctx).await })
        };

        let mut data = vec![0x03];
        data.extend_from_slice(b"123456789012345");
        let frame = FrameBuilder::main(data).corrupt_crc().build();

        let mut device = DeviceSimulator::from_stream(client, "123456789012345");
        device.send_frame(&frame, None).await.unwrap();
        assert_eq!(device.read_ack().await.unwrap(), expected_ack(&frame));
        drop(device);
        task.await.unwrap().unwrap();

        let job = rx.recv().await.unwrap();
        assert_eq!(job.records.len(), 1);
        assert_eq!(job.records[0].imei.as_deref(), Some("123456789012345"));
        let health = ctx.health.snapshot(0);
        assert_eq!(health.checksum_failures, 0);
        assert_eq!(health.acks_sent, 1);
    }

    #[tokio::test]
    async fn test_ignorable_and_extension_packets_acked_not_decoded() {
        let (ctx, mut rx) = context(8, SplitMode::Heuristic);
        let (client, server) = duplex(1024);
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_connection(server, peer(), &ctx).await })
        };

        let ignorable = FrameBuilder::ignorable().build();
        let extension = FrameBuilder::new(0x08, vec![0x03, 0x31, 0x32]).build();
        let mut both = ignorable.clone();
        both.extend_from_slice(&extension);

        let mut device = DeviceSimulator::from_stream(client, "123456789012345");
        device.send_frame(&both, None).await.unwrap();
        assert_eq!(device.read_ack().await.unwrap(), expected_ack(&ignorable));
        assert_eq!(device.read_ack().await.unwrap(), expected_ack(&extension));
        drop(device);
        task.await.unwrap().unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.health.snapshot(0).acks_sent, 2);
    }

    #[tokio::test]
    async fn test_full_queue_sheds_packet() {
        let (ctx, mut rx) = context(1, SplitMode::Heuristic);
        let (client, server) = duplex(1024);
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_connection(server, peer(), &ctx).await })
        };

        let mut device = DeviceSimulator::from_stream(client, "123456789012345");
        device.send_and_confirm(&imei_frame(), None).await.unwrap();
        device.send_and_confirm(&imei_frame(), None).await.unwrap();
        drop(device);
        task.await.unwrap().unwrap();

        assert!(rx.recv().await.is_some());
        let health = ctx.health.snapshot(0);
        assert_eq!(health.acks_sent, 2);
        assert_eq!(health.packets_shed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_closed() {
        let (ctx, _rx) = context(1, SplitMode::Heuristic);
        let (_client, server) = duplex(64);
        let result = handle_connection(server, peer(), &ctx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_device_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::open(dir.path()).unwrap());
        let persistence: Arc<dyn Persistence> = store.clone();
        let health = HealthTracker::new();

        let devices = Arc::new(DeviceRegistry::new(
            persistence.clone(),
            Arc::new(LogNotifier),
            Duration::from_secs(30),
        ));
        let pipeline = Arc::new(Pipeline::new(
            devices.clone(),
            Arc::new(MappingCache::new(persistence.clone(), Duration::from_secs(300))),
            Arc::new(AlertEngine::new(persistence.clone(), Arc::new(NeverFires))),
            persistence,
            Arc::new(LogNotifier),
            health.clone(),
            PipelineConfig::default(),
        ));

        let (tx, rx) = mpsc::channel(16);
        let pipeline_task = pipeline.spawn(rx);
        let ctx = Arc::new(ConnectionContext {
            assembler: Assembler::new(SplitMode::TagAligned, 32),
            validate_checksum: true,
            idle_timeout: Duration::from_secs(5),
            read_buffer: 4096,
            jobs: tx,
            health: health.clone(),
        });

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(serve(listener, ctx, async {
            let _ = stop_rx.await;
        }));

        let mut device = DeviceSimulator::connect(&addr, "868204005647838").await.unwrap();
        device.send_head().await.unwrap();
        device.send_archive(5, 1_700_000_000, Some(7)).await.unwrap();
        assert_eq!(device.acks_received(), 2);
        drop(device);

        let _ = stop_tx.send(());
        server_task.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), pipeline_task)
            .await
            .unwrap()
            .unwrap();

        // Paquet de tête (1 enregistrement) + 5 positions d'archive
        let content = std::fs::read_to_string(store.records_path()).unwrap();
        assert_eq!(content.lines().count(), 6);
        assert!(store.device("868204005647838").is_some());
        assert_eq!(devices.len(), 1);
        assert_eq!(health.snapshot(devices.len()).records_persisted, 6);
    }
}
