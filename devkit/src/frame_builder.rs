/*!
Encodeur de trames Galileosky pour tests et simulation

- `TagWriter` : construit une section data tag par tag
- `FrameBuilder` : ajoute en-tête (type + longueur + flag archive) et CRC
- `crc16` : implémentation par table, indépendante de celle du kernel
*/

pub const PACKET_MAIN: u8 = 0x01;
pub const PACKET_IGNORABLE: u8 = 0x15;

const ARCHIVE_FLAG: u16 = 0x8000;

const CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-16/MODBUS (init 0xFFFF, poly réfléchi 0xA001)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &b| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ b as u16) & 0xFF) as usize]
    })
}

/// Réponse attendue du serveur pour une trame donnée
pub fn expected_ack(frame: &[u8]) -> [u8; 3] {
    let n = frame.len();
    [0x02, frame[n - 2], frame[n - 1]]
}

#[derive(Debug, Clone)]
pub struct FrameBuilder {
    packet_type: u8,
    data: Vec<u8>,
    archive: bool,
    corrupt_crc: bool,
}

impl FrameBuilder {
    pub fn new(packet_type: u8, data: Vec<u8>) -> Self {
        Self {
            packet_type,
            data,
            archive: false,
            corrupt_crc: false,
        }
    }

    pub fn main(data: Vec<u8>) -> Self {
        Self::new(PACKET_MAIN, data)
    }

    pub fn ignorable() -> Self {
        Self::new(PACKET_IGNORABLE, Vec::new())
    }

    pub fn archive(mut self) -> Self {
        self.archive = true;
        self
    }

    /// Inverse le CRC final (trame invalide mais bien délimitée)
    pub fn corrupt_crc(mut self) -> Self {
        self.corrupt_crc = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut raw_length = (self.data.len() as u16) & 0x7FFF;
        if self.archive {
            raw_length |= ARCHIVE_FLAG;
        }

        let mut frame = Vec::with_capacity(self.data.len() + 5);
        frame.push(self.packet_type);
        frame.extend_from_slice(&raw_length.to_le_bytes());
        frame.extend_from_slice(&self.data);

        let mut crc = crc16(&frame);
        if self.corrupt_crc {
            crc = !crc;
        }
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }
}

/// Construit une section data tag par tag
#[derive(Debug, Default, Clone)]
pub struct TagWriter {
    buf: Vec<u8>,
}

impl TagWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8_tag(&mut self, tag: u8, value: u8) -> &mut Self {
        self.buf.extend_from_slice(&[tag, value]);
        self
    }

    pub fn u16_tag(&mut self, tag: u8, value: u16) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i16_tag(&mut self, tag: u8, value: i16) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32_tag(&mut self, tag: u8, value: u32) -> &mut Self {
        self.buf.push(tag);
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn imei(&mut self, imei: &str) -> &mut Self {
        let mut digits = [b'0'; 15];
        for (slot, b) in digits.iter_mut().zip(imei.bytes()) {
            *slot = b;
        }
        self.buf.push(0x03);
        self.buf.extend_from_slice(&digits);
        self
    }

    pub fn archive_number(&mut self, number: u16) -> &mut Self {
        self.u16_tag(0x10, number)
    }

    pub fn datetime(&mut self, unix_secs: u32) -> &mut Self {
        self.u32_tag(0x20, unix_secs)
    }

    pub fn coordinates(&mut self, satellites: u8, correctness: u8, lat: f64, lon: f64) -> &mut Self {
        self.buf.push(0x30);
        self.buf.push((correctness << 4) | (satellites & 0x0F));
        self.buf.extend_from_slice(&((lat * 1_000_000.0).round() as i32).to_le_bytes());
        self.buf.extend_from_slice(&((lon * 1_000_000.0).round() as i32).to_le_bytes());
        self
    }

    pub fn speed_direction(&mut self, speed_kmh: f64, direction_deg: f64) -> &mut Self {
        self.buf.push(0x33);
        self.buf.extend_from_slice(&((speed_kmh * 10.0).round() as u16).to_le_bytes());
        self.buf.extend_from_slice(&((direction_deg * 10.0).round() as u16).to_le_bytes());
        self
    }

    pub fn status(&mut self, bits: u16) -> &mut Self {
        self.u16_tag(0x40, bits)
    }

    pub fn outputs(&mut self, mask: u16) -> &mut Self {
        self.u16_tag(0x45, mask)
    }

    pub fn inputs(&mut self, mask: u16) -> &mut Self {
        self.u16_tag(0x46, mask)
    }

    /// Bloc 0xFE de tags étendus à valeur u32
    pub fn extended_u32(&mut self, entries: &[(u16, u32)]) -> &mut Self {
        let len = (entries.len() * 6) as u16;
        self.buf.push(0xFE);
        self.buf.extend_from_slice(&len.to_le_bytes());
        for (tag, value) in entries {
            self.buf.extend_from_slice(&tag.to_le_bytes());
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

/// Position synthétique rejouée par le simulateur
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticFix {
    pub number: u16,
    pub time: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub direction: f64,
    pub status: u16,
    pub inputs: u16,
}

impl SyntheticFix {
    pub fn write(&self, w: &mut TagWriter) {
        w.archive_number(self.number)
            .datetime(self.time)
            .coordinates(9, 0, self.latitude, self.longitude)
            .speed_direction(self.speed, self.direction)
            .status(self.status)
            .inputs(self.inputs);
    }
}

/// Trajet en ligne droite à partir d'un point, une position toutes les 10 s
pub fn synthetic_track(count: usize, start_time: u32, lat: f64, lon: f64) -> Vec<SyntheticFix> {
    (0..count)
        .map(|i| SyntheticFix {
            number: (i + 1) as u16,
            time: start_time + (i as u32) * 10,
            latitude: lat + i as f64 * 0.0005,
            longitude: lon + i as f64 * 0.0003,
            speed: 40.0 + (i % 5) as f64,
            direction: 45.0,
            // power + gps valide + gsm valide + ignition
            status: 0x0017,
            inputs: (i % 2) as u16,
        })
        .collect()
}

/// Paquet de tête : identification de l'appareil
pub fn head_packet(imei: &str) -> Vec<u8> {
    let mut w = TagWriter::new();
    w.u8_tag(0x01, 0x82).u8_tag(0x02, 0x1E).imei(imei).u16_tag(0x04, 1);
    FrameBuilder::main(w.finish()).build()
}

/// Paquet d'archive : en-tête optionnel (IMEI) suivi de N positions
pub fn archive_packet(imei: Option<&str>, fixes: &[SyntheticFix]) -> Vec<u8> {
    let mut w = TagWriter::new();
    if let Some(imei) = imei {
        w.imei(imei);
    }
    for fix in fixes {
        fix.write(&mut w);
    }
    FrameBuilder::main(w.finish()).archive().build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_imei_frame_layout() {
        let mut w = TagWriter::new();
        w.imei("123456789012345");
        let frame = FrameBuilder::main(w.finish()).build();
        assert_eq!(frame.len(), 21);
        assert_eq!(&frame[..4], &[0x01, 0x10, 0x00, 0x03]);
        let crc = crc16(&frame[..19]);
        assert_eq!(&frame[19..], &crc.to_le_bytes());
    }

    #[test]
    fn test_archive_flag_and_corruption() {
        let frame = FrameBuilder::main(vec![0x10, 0x01, 0x00]).archive().build();
        assert_eq!(&frame[..3], &[0x01, 0x03, 0x80]);

        let good = FrameBuilder::main(vec![0x01, 0x82]).build();
        let bad = FrameBuilder::main(vec![0x01, 0x82]).corrupt_crc().build();
        assert_eq!(good[..5], bad[..5]);
        assert_ne!(good[5..], bad[5..]);
    }

    #[test]
    fn test_expected_ack() {
        let frame = FrameBuilder::ignorable().build();
        assert_eq!(frame.len(), 5);
        assert_eq!(expected_ack(&frame), [0x02, frame[3], frame[4]]);
    }

    #[test]
    fn test_synthetic_track() {
        let track = synthetic_track(3, 1_700_000_000, 48.85, 2.35);
        assert_eq!(track.len(), 3);
        assert_eq!(track[2].number, 3);
        assert_eq!(track[2].time, 1_700_000_020);

        let packet = archive_packet(Some("868204005647838"), &track);
        // en-tête 3 + imei 16 + 3 positions * (3+5+10+5+3+3) + crc 2
        assert_eq!(packet.len(), 3 + 16 + 3 * 29 + 2);
    }
}
