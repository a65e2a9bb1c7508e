//! Stream framing for Galileosky connections.
//!
//! Frame layout: `[type:1][rawLength:2 LE][data:dataLength][crc16:2 LE]`
//! with `dataLength = rawLength & 0x7FFF` and the archive flag in bit 15.
//! The framer accumulates bytes from the socket and hands out complete
//! frames; a partial tail stays buffered until the next read.

use bytes::{Bytes, BytesMut};

use super::crc::crc16_modbus;

pub const PACKET_MAIN: u8 = 0x01;
pub const PACKET_IGNORABLE: u8 = 0x15;
pub const CONFIRMATION: u8 = 0x02;

const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;
const ARCHIVE_FLAG: u16 = 0x8000;
const LENGTH_MASK: u16 = 0x7FFF;

/// Largest frame the 15-bit length field can describe.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + LENGTH_MASK as usize + CRC_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: frame carries 0x{actual:04x}, computed 0x{expected:04x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Main,
    Ignorable,
    Extension(u8),
}

impl PacketKind {
    pub fn from_type(packet_type: u8) -> Self {
        match packet_type {
            PACKET_MAIN => PacketKind::Main,
            PACKET_IGNORABLE => PacketKind::Ignorable,
            other => PacketKind::Extension(other),
        }
    }
}

/// One complete frame sliced off a connection buffer.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub kind: PacketKind,
    pub declared_length: u16,
    pub archive: bool,
    pub trailing_checksum: u16,
    frame: Bytes,
}

impl RawPacket {
    fn from_frame(frame: Bytes) -> Self {
        let raw_length = u16::from_le_bytes([frame[1], frame[2]]);
        let tail = frame.len() - CRC_LEN;
        Self {
            kind: PacketKind::from_type(frame[0]),
            declared_length: raw_length & LENGTH_MASK,
            archive: raw_length & ARCHIVE_FLAG != 0,
            trailing_checksum: u16::from_le_bytes([frame[tail], frame[tail + 1]]),
            frame,
        }
    }

    pub fn packet_type(&self) -> u8 {
        self.frame[0]
    }

    /// Data section, without header and checksum.
    pub fn body(&self) -> Bytes {
        self.frame
            .slice(HEADER_LEN..HEADER_LEN + self.declared_length as usize)
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// `0x02` followed by the frame's own last two bytes, unmodified.
    pub fn confirmation(&self) -> [u8; 3] {
        let tail = self.frame.len() - CRC_LEN;
        [CONFIRMATION, self.frame[tail], self.frame[tail + 1]]
    }

    pub fn computed_checksum(&self) -> u16 {
        crc16_modbus(&self.frame[..self.frame.len() - CRC_LEN])
    }

    pub fn verify_checksum(&self) -> Result<(), FrameError> {
        let expected = self.computed_checksum();
        if expected == self.trailing_checksum {
            Ok(())
        } else {
            Err(FrameError::ChecksumMismatch {
                expected,
                actual: self.trailing_checksum,
            })
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.frame)
    }
}

/// Per-connection byte accumulator.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
}

impl Default for Framer {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

impl Framer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Buffer handed to `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total size of the frame at the head of the buffer, once the header is in.
    fn peek_frame_len(&self) -> Option<usize> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let raw_length = u16::from_le_bytes([self.buf[1], self.buf[2]]);
        Some(HEADER_LEN + (raw_length & LENGTH_MASK) as usize + CRC_LEN)
    }

    /// Slices off the next complete frame, `None` while more bytes are needed.
    pub fn next_packet(&mut self) -> Option<RawPacket> {
        let total = self.peek_frame_len()?;
        if self.buf.len() < total {
            return None;
        }
        let frame = self.buf.split_to(total).freeze();
        Some(RawPacket::from_frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use galileo_devkit::FrameBuilder;

    fn imei_frame() -> Vec<u8> {
        let mut data = vec![0x03];
        data.extend_from_slice(b"123456789012345");
        FrameBuilder::main(data).build()
    }

    fn drain(framer: &mut Framer) -> Vec<RawPacket> {
        let mut packets = Vec::new();
        while let Some(p) = framer.next_packet() {
            packets.push(p);
        }
        packets
    }

    #[test]
    fn test_whole_frame() {
        let frame = imei_frame();
        assert_eq!(frame.len(), 21);
        assert_eq!(&frame[..3], &[0x01, 0x10, 0x00]);

        let mut framer = Framer::default();
        framer.extend_from_slice(&frame);
        let packet = framer.next_packet().unwrap();
        assert_eq!(packet.kind, PacketKind::Main);
        assert_eq!(packet.declared_length, 16);
        assert!(!packet.archive);
        assert_eq!(&packet.body()[1..], b"123456789012345");
        assert!(packet.verify_checksum().is_ok());
        assert_eq!(framer.buffered(), 0);
        assert!(framer.next_packet().is_none());
    }

    #[test]
    fn test_byte_by_byte_matches_whole() {
        let mut stream = imei_frame();
        stream.extend_from_slice(&FrameBuilder::ignorable().build());
        stream.extend_from_slice(&FrameBuilder::main(vec![0x10, 0x01, 0x00]).archive().build());

        let mut whole = Framer::default();
        whole.extend_from_slice(&stream);
        let expected: Vec<Vec<u8>> = drain(&mut whole).iter().map(|p| p.frame().to_vec()).collect();
        assert_eq!(expected.len(), 3);

        for chunk in [1, 2, 5, 7, 20] {
            let mut framer = Framer::default();
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                framer.extend_from_slice(piece);
                got.extend(drain(&mut framer).iter().map(|p| p.frame().to_vec()));
            }
            assert_eq!(got, expected, "chunk size {}", chunk);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_partial_header_waits() {
        let mut framer = Framer::default();
        framer.extend_from_slice(&[0x01, 0x10]);
        assert!(framer.next_packet().is_none());
        assert_eq!(framer.buffered(), 2);
    }

    #[test]
    fn test_confirmation_echoes_trailing_bytes() {
        let frame = imei_frame();
        let mut framer = Framer::default();
        framer.extend_from_slice(&frame);
        let packet = framer.next_packet().unwrap();
        let n = frame.len();
        assert_eq!(packet.confirmation(), [0x02, frame[n - 2], frame[n - 1]]);
    }

    #[test]
    fn test_confirmation_on_bad_checksum() {
        let frame = FrameBuilder::main(vec![0x01, 0x82]).corrupt_crc().build();
        let mut framer = Framer::default();
        framer.extend_from_slice(&frame);
        let packet = framer.next_packet().unwrap();

        let err = packet.verify_checksum().unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        let n = frame.len();
        assert_eq!(packet.confirmation(), [0x02, frame[n - 2], frame[n - 1]]);
    }

    #[test]
    fn test_archive_flag_and_kinds() {
        let mut framer = Framer::default();
        framer.extend_from_slice(&FrameBuilder::main(vec![0x10, 0x01, 0x00]).archive().build());
        framer.extend_from_slice(&FrameBuilder::ignorable().build());
        framer.extend_from_slice(&FrameBuilder::new(0x08, vec![0xAA; 4]).build());

        let packets = drain(&mut framer);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].archive);
        assert_eq!(packets[0].declared_length, 3);
        assert_eq!(packets[1].kind, PacketKind::Ignorable);
        assert_eq!(packets[2].kind, PacketKind::Extension(0x08));
        assert_eq!(packets[2].packet_type(), 0x08);
    }
}
