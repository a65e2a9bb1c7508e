//! Galileo Sim - rejoue du trafic Galileosky synthétique contre un kernel
//!
//! Usage : galileo-sim [addr] [--imei N] [--records N] [--chunk N] [--archive] [--interval S] [--packets N]
//!
//! Séquence : paquet de tête (IMEI) puis paquet(s) de positions, chaque
//! confirmation étant vérifiée contre le CRC de la trame envoyée.

use anyhow::{bail, Result};
use clap::Parser;
use galileo_devkit::{archive_packet, synthetic_track, DeviceSimulator, FrameBuilder, TagWriter};
use std::time::Duration;

/// Simulateur de balise Galileosky
#[derive(Parser, Debug)]
#[command(name = "galileo-sim", about = "Galileosky traffic replay")]
struct SimArgs {
    /// Adresse du kernel
    #[arg(default_value = "127.0.0.1:3003")]
    addr: String,

    /// IMEI annoncé dans le paquet de tête (15 chiffres)
    #[arg(long, default_value = "868204005647838")]
    imei: String,

    /// Positions par paquet d'archive
    #[arg(long, default_value_t = 5)]
    records: usize,

    /// Taille des écritures TCP (trame entière si absent)
    #[arg(long)]
    chunk: Option<usize>,

    /// Envoie des paquets d'archive plutôt que des positions live
    #[arg(long)]
    archive: bool,

    /// Nombre de paquets après la tête
    #[arg(long, default_value_t = 1)]
    packets: usize,

    /// Pause entre paquets, en secondes
    #[arg(long, default_value_t = 1)]
    interval: u64,
}

impl SimArgs {
    fn validate(self) -> Result<Self> {
        if self.imei.len() != 15 || !self.imei.bytes().all(|b| b.is_ascii_digit()) {
            bail!("IMEI invalide (15 chiffres attendus): {}", self.imei);
        }
        if self.chunk == Some(0) {
            bail!("--chunk doit être positif");
        }
        Ok(self)
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// Paquet live : une seule position, IMEI inclus
fn live_packet(imei: &str, time: u32, number: u16) -> Vec<u8> {
    let mut w = TagWriter::new();
    w.imei(imei);
    for fix in synthetic_track(1, time, 48.8566, 2.3522) {
        let fix = galileo_devkit::SyntheticFix { number, ..fix };
        fix.write(&mut w);
    }
    FrameBuilder::main(w.finish()).build()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = SimArgs::parse().validate()?;
    log::info!("🛰️ galileo-sim → {} (imei {})", args.addr, args.imei);

    let mut sim = DeviceSimulator::connect(&args.addr, &args.imei).await?;
    sim.send_head().await?;
    log::info!("📨 head packet confirmed");

    for i in 0..args.packets {
        let now = chrono::Utc::now().timestamp() as u32;
        let frame = if args.archive {
            let track = synthetic_track(args.records, now, 48.8566, 2.3522);
            archive_packet(None, &track)
        } else {
            live_packet(&args.imei, now, (i + 1) as u16)
        };

        sim.send_and_confirm(&frame, args.chunk).await?;
        log::info!(
            "📨 packet {}/{} confirmed ({} bytes{})",
            i + 1,
            args.packets,
            frame.len(),
            args.chunk.map(|c| format!(", {}-byte writes", c)).unwrap_or_default()
        );

        if i + 1 < args.packets {
            tokio::time::sleep(args.interval()).await;
        }
    }

    log::info!("✅ {} acknowledgements received", sim.acks_received());
    Ok(())
}
