/*!
# Galileo DevKit - Outils de développement pour le kernel Galileosky

Bibliothèque utilisée par les tests du kernel et par `galileo-sim` :
- Encodeur de trames et de tags (CRC indépendant de celui du kernel)
- Simulateur de traceur GPS (TCP réel ou flux en mémoire)
- Génération de trajets synthétiques
*/

pub mod frame_builder;
pub mod simulator;

pub use frame_builder::{
    archive_packet, crc16, expected_ack, head_packet, synthetic_track, FrameBuilder,
    SyntheticFix, TagWriter,
};
pub use simulator::DeviceSimulator;
