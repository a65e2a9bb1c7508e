/**
 * PROTOCOLE GALILEOSKY - Couche filaire du kernel
 *
 * COMPOSANTS (des feuilles vers le haut) :
 * - crc     : CRC-16 Modbus des trames
 * - tags    : registre statique tag → type filaire
 * - decoder : consommation d'un tag + valeur
 * - record  : découpage d'une section data en enregistrements
 * - frame   : extraction des trames d'un flux TCP + confirmation
 *
 * Aucune I/O ici : tout est testable sur des buffers en mémoire.
 */

pub mod crc;
pub mod decoder;
pub mod frame;
pub mod record;
pub mod tags;

pub use decoder::{DecodeError, DecodedValue, TagValue};
pub use frame::{FrameError, Framer, PacketKind, RawPacket};
pub use record::{Assembler, Assembly, Record, RecordError, Session, SplitMode};
pub use tags::TagId;
