/**
 * ASSEMBLEUR D'ENREGISTREMENTS - Découpe la section data d'un paquet en records
 *
 * RÔLE :
 * Un paquet principal transporte soit une position live, soit une archive
 * de positions historiques concaténées. Ce module trouve les frontières
 * d'enregistrements puis décode chaque tranche indépendamment.
 *
 * FONCTIONNEMENT :
 * 1. dataLength < seuil (32) → un seul enregistrement
 * 2. Sinon, scan en deux passes des octets 0x10 (numéro d'archive) :
 *    - passe 1 : positions candidates
 *    - passe 2 : filtre (pas dans la valeur du 0x10 précédent, 3 octets dispo)
 * 3. Octets avant le premier 0x10 = en-tête de paquet (IMEI), pas un record
 * 4. IMEI hérité de la session quand le record n'en porte pas
 *
 * Mode `tag_aligned` : frontières uniquement sur des 0x10 rencontrés à une
 * position de tag lors d'un décodage séquentiel.
 */

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::decoder::{self, DecodeError, DecodedValue, TagValue, Token};
use super::tags::{TagId, TAG_ARCHIVE_NUMBER, TAG_IMEI};

pub const DEFAULT_MULTI_RECORD_THRESHOLD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    #[default]
    Heuristic,
    TagAligned,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("packet header [0, {end}): {source}")]
    Header {
        end: usize,
        #[source]
        source: DecodeError,
    },
    #[error("record {index} [{}, {}): {source}", .span.start, .span.end)]
    Decode {
        index: usize,
        span: Range<usize>,
        #[source]
        source: DecodeError,
    },
}

/// Un enregistrement décodé : sac tag → valeur + IMEI résolu
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub imei: Option<String>,
    pub tags: BTreeMap<TagId, TagValue>,
    /// Position dans la section data du paquet
    pub span: Range<usize>,
}

impl Record {
    pub fn get(&self, tag: TagId) -> Option<&DecodedValue> {
        self.tags.get(&tag).map(|v| &v.value)
    }

    pub fn archive_number(&self) -> Option<u32> {
        match self.get(TagId::Short(TAG_ARCHIVE_NUMBER)) {
            Some(DecodedValue::Unsigned(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn tag_ids(&self) -> Vec<String> {
        self.tags.keys().map(|t| t.to_string()).collect()
    }

    /// Sac JSON indexé par identifiant hexadécimal ("0x41", "0x0001")
    pub fn tag_map(&self) -> Map<String, Value> {
        self.tags
            .iter()
            .map(|(id, v)| (id.to_string(), v.value.to_json()))
            .collect()
    }
}

/// État propre à une connexion : dernier IMEI vu
#[derive(Debug, Default, Clone)]
pub struct Session {
    imei: Option<String>,
}

impl Session {
    pub fn imei(&self) -> Option<&str> {
        self.imei.as_deref()
    }

    fn observe(&mut self, tags: &BTreeMap<TagId, TagValue>) {
        if let Some(imei) = tags
            .get(&TagId::Short(TAG_IMEI))
            .and_then(|v| v.value.as_text())
            .filter(|s| !s.is_empty())
        {
            self.imei = Some(imei.to_string());
        }
    }
}

#[derive(Debug, Default)]
pub struct Assembly {
    pub records: Vec<Record>,
    pub failures: Vec<RecordError>,
    pub unknown_tags: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Assembler {
    mode: SplitMode,
    threshold: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(SplitMode::Heuristic, DEFAULT_MULTI_RECORD_THRESHOLD)
    }
}

impl Assembler {
    pub fn new(mode: SplitMode, threshold: usize) -> Self {
        Self { mode, threshold }
    }

    pub fn assemble(&self, data: &[u8], session: &mut Session) -> Assembly {
        let mut assembly = Assembly::default();

        let starts = if data.len() < self.threshold {
            Vec::new()
        } else {
            record_boundaries(data, self.mode)
        };

        let spans: Vec<Range<usize>> = if starts.is_empty() {
            vec![0..data.len()]
        } else {
            if starts[0] > 0 {
                self.decode_header(&data[..starts[0]], session, &mut assembly);
            }
            starts
                .iter()
                .enumerate()
                .map(|(i, &start)| start..starts.get(i + 1).copied().unwrap_or(data.len()))
                .collect()
        };

        for (index, span) in spans.into_iter().enumerate() {
            match decode_body(&data[span.clone()]) {
                Ok(body) => {
                    assembly.unknown_tags += body.unknown;
                    if body.tags.is_empty() {
                        tracing::debug!(index, start = span.start, "empty record discarded");
                        continue;
                    }
                    session.observe(&body.tags);
                    assembly.records.push(Record {
                        imei: session.imei.clone(),
                        tags: body.tags,
                        span,
                    });
                }
                Err(PartialBody { source, .. }) => {
                    assembly.failures.push(RecordError::Decode { index, span, source })
                }
            }
        }

        assembly
    }

    fn decode_header(&self, header: &[u8], session: &mut Session, assembly: &mut Assembly) {
        match decode_body(header) {
            Ok(body) => {
                assembly.unknown_tags += body.unknown;
                session.observe(&body.tags);
            }
            // En-tête coupé par une frontière : l'IMEI déjà décodé reste valable
            Err(PartialBody { decoded, source }) => {
                assembly.unknown_tags += decoded.unknown;
                session.observe(&decoded.tags);
                tracing::debug!(end = header.len(), imei = ?session.imei(), error = %source, "packet header cut short");
                assembly.failures.push(RecordError::Header {
                    end: header.len(),
                    source,
                });
            }
        }
    }
}

/// Positions de début d'enregistrement dans une section data.
/// Vide quand aucun 0x10 exploitable n'est trouvé.
pub fn record_boundaries(data: &[u8], mode: SplitMode) -> Vec<usize> {
    match mode {
        SplitMode::Heuristic => heuristic_boundaries(data),
        SplitMode::TagAligned => tag_aligned_boundaries(data),
    }
}

fn heuristic_boundaries(data: &[u8]) -> Vec<usize> {
    // Passe 1 : tous les octets 0x10 suivis d'une valeur complète
    let candidates = data
        .iter()
        .enumerate()
        .filter(|&(pos, &b)| b == TAG_ARCHIVE_NUMBER && pos + 3 <= data.len())
        .map(|(pos, _)| pos);

    // Passe 2 : un 0x10 dans la valeur du numéro précédent n'est pas une frontière
    let mut starts: Vec<usize> = Vec::new();
    for pos in candidates {
        match starts.last() {
            Some(&prev) if pos <= prev + 2 => continue,
            _ => starts.push(pos),
        }
    }
    starts
}

fn tag_aligned_boundaries(data: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match decoder::next_token(data, pos) {
            Ok((token, next)) => {
                if let Token::Value(v) = &token {
                    if v.tag == TagId::Short(TAG_ARCHIVE_NUMBER) {
                        starts.push(pos);
                    }
                }
                pos = next;
            }
            Err(_) => break,
        }
    }
    starts
}

struct Body {
    tags: BTreeMap<TagId, TagValue>,
    unknown: usize,
}

/// Échec de décodage : tags lus avant l'erreur + l'erreur
struct PartialBody {
    decoded: Body,
    source: DecodeError,
}

fn decode_body(slice: &[u8]) -> Result<Body, PartialBody> {
    let mut tags = BTreeMap::new();
    let mut unknown = 0;
    let mut pos = 0;

    while pos < slice.len() {
        let (token, next) = match decoder::next_token(slice, pos) {
            Ok(step) => step,
            Err(source) => {
                return Err(PartialBody {
                    decoded: Body { tags, unknown },
                    source,
                })
            }
        };
        match token {
            Token::Terminator => break,
            Token::Value(v) => {
                tags.insert(v.tag, v);
            }
            Token::Extended { values, unknown: skipped } => {
                unknown += skipped.len();
                for v in values {
                    tags.insert(v.tag, v);
                }
            }
            Token::Unknown(_) => unknown += 1,
        }
        pos = next;
    }

    Ok(Body { tags, unknown })
}
