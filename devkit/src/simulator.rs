/*!
Simulateur de traceur GPS

Joue le rôle d'un boîtier Galileosky face au kernel :
- écrit des trames entières ou découpées en morceaux arbitraires
- lit la confirmation 3 octets et vérifie l'écho du CRC
- fonctionne sur TCP réel ou sur n'importe quel flux async (duplex en tests)
*/

use crate::frame_builder::{archive_packet, expected_ack, head_packet, synthetic_track};
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeviceSimulator<S> {
    stream: S,
    imei: String,
    acks_received: usize,
}

impl DeviceSimulator<TcpStream> {
    pub async fn connect(addr: &str, imei: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connexion à {} impossible", addr))?;
        log::info!("📡 Simulated device {} connected to {}", imei, addr);
        Ok(Self::from_stream(stream, imei))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeviceSimulator<S> {
    pub fn from_stream(stream: S, imei: &str) -> Self {
        Self {
            stream,
            imei: imei.to_string(),
            acks_received: 0,
        }
    }

    pub fn imei(&self) -> &str {
        &self.imei
    }

    pub fn acks_received(&self) -> usize {
        self.acks_received
    }

    /// Écrit une trame, d'un bloc ou en morceaux de `chunk` octets
    pub async fn send_frame(&mut self, frame: &[u8], chunk: Option<usize>) -> Result<()> {
        match chunk {
            Some(size) if size > 0 => {
                for piece in frame.chunks(size) {
                    self.stream.write_all(piece).await?;
                    self.stream.flush().await?;
                    tokio::task::yield_now().await;
                }
            }
            _ => self.stream.write_all(frame).await?,
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_ack(&mut self) -> Result<[u8; 3]> {
        let mut ack = [0u8; 3];
        tokio::time::timeout(ACK_TIMEOUT, self.stream.read_exact(&mut ack))
            .await
            .context("pas de confirmation reçue")??;
        self.acks_received += 1;
        Ok(ack)
    }

    /// Envoie une trame puis vérifie que la confirmation reprend son CRC
    pub async fn send_and_confirm(&mut self, frame: &[u8], chunk: Option<usize>) -> Result<()> {
        self.send_frame(frame, chunk).await?;
        let ack = self.read_ack().await?;
        let expected = expected_ack(frame);
        if ack != expected {
            bail!("confirmation inattendue {:02x?}, attendu {:02x?}", ack, expected);
        }
        log::debug!("✅ ack {:02x?} for {} byte frame", ack, frame.len());
        Ok(())
    }

    pub async fn send_head(&mut self) -> Result<()> {
        let frame = head_packet(&self.imei);
        self.send_and_confirm(&frame, None).await
    }

    /// Paquet d'archive de `count` positions sans IMEI (hérité du paquet de tête)
    pub async fn send_archive(&mut self, count: usize, start_time: u32, chunk: Option<usize>) -> Result<()> {
        let track = synthetic_track(count, start_time, 48.8566, 2.3522);
        let frame = archive_packet(None, &track);
        self.send_and_confirm(&frame, chunk).await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
