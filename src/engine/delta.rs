//! Delta blob wire model.
//!
//! A blob is one peer's contribution for one tick; the receiver applies
//! its sections as object spawns, then the sparse positionally-indexed
//! property/event entries for the objects that peer owns, then despawns,
//! then ownership answers. Answers come last so that a transfer takes
//! effect only after the granting owner's final writes.
//!
//! Decoding never touches the state graph; a blob is parsed completely
//! into a [`DeltaPayload`] (and validated against the graph separately)
//! before any of it is applied, so a malformed delta is discarded whole.

use thiserror::Error;

use crate::{
    codec::{ByteReader, ByteWriter, CodecError},
    types::{ChannelIndex, DeltaIndex, NetworkId, ObjectKind, PeerId, SlotIndex},
};

/// Errors that can occur while decoding a delta blob
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    /// The blob's bytes do not parse
    #[error("malformed delta: {0}")]
    Codec(#[from] CodecError),

    /// The leading kind byte is not a known delta kind
    #[error("unknown delta kind {value}")]
    UnknownKind { value: u8 },

    /// The blob carries bytes past the last section
    #[error("{remaining} trailing byte(s) after final delta section")]
    TrailingBytes { remaining: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeltaKind {
    /// Dirty properties and pending events only.
    Incremental,
    /// Complete state of every record the sender owns; serves late joiners.
    Full,
    /// Ownership requests only; carries no state and no sequencing.
    Control,
}

impl DeltaKind {
    fn to_byte(self) -> u8 {
        match self {
            DeltaKind::Incremental => 0,
            DeltaKind::Full => 1,
            DeltaKind::Control => 2,
        }
    }

    fn from_byte(value: u8) -> Result<Self, DeltaError> {
        match value {
            0 => Ok(DeltaKind::Incremental),
            1 => Ok(DeltaKind::Full),
            2 => Ok(DeltaKind::Control),
            _ => Err(DeltaError::UnknownKind { value }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SpawnEntry {
    pub id: NetworkId,
    pub kind: ObjectKind,
    pub owner: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ObjectEntry {
    pub id: NetworkId,
    pub owner: PeerId,
    /// Sparse, ordered (slot index, opaque value bytes) pairs.
    pub properties: Vec<(SlotIndex, Vec<u8>)>,
    /// Ordered (channel index, opaque value bytes) pairs, one per event.
    pub events: Vec<(ChannelIndex, Vec<u8>)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OwnershipAnswer {
    pub object: NetworkId,
    pub requester: PeerId,
    pub granted: bool,
    pub new_owner: PeerId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct OwnershipRequest {
    pub object: NetworkId,
    pub requester: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DeltaPayload {
    pub kind: DeltaKind,
    pub seq: DeltaIndex,
    pub spawns: Vec<SpawnEntry>,
    pub despawns: Vec<NetworkId>,
    pub objects: Vec<ObjectEntry>,
    pub answers: Vec<OwnershipAnswer>,
    pub requests: Vec<OwnershipRequest>,
}

impl DeltaPayload {
    pub fn new(kind: DeltaKind, seq: DeltaIndex) -> Self {
        Self {
            kind,
            seq,
            spawns: Vec::new(),
            despawns: Vec::new(),
            objects: Vec::new(),
            answers: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spawns.is_empty()
            && self.despawns.is_empty()
            && self.objects.is_empty()
            && self.answers.is_empty()
            && self.requests.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u8(self.kind.to_byte());
        writer.write_u16_le(self.seq);

        writer.write_var_u64(self.spawns.len() as u64);
        for spawn in &self.spawns {
            writer.write_var_u64(spawn.id.to_raw());
            writer.write_var_u64(spawn.kind.0 as u64);
            writer.write_var_u64(spawn.owner.0);
        }

        writer.write_var_u64(self.despawns.len() as u64);
        for id in &self.despawns {
            writer.write_var_u64(id.to_raw());
        }

        writer.write_var_u64(self.objects.len() as u64);
        for object in &self.objects {
            writer.write_var_u64(object.id.to_raw());
            writer.write_var_u64(object.owner.0);
            writer.write_var_u64(object.properties.len() as u64);
            for (slot, bytes) in &object.properties {
                writer.write_var_u64(*slot as u64);
                writer.write_blob(bytes);
            }
            writer.write_var_u64(object.events.len() as u64);
            for (channel, bytes) in &object.events {
                writer.write_var_u64(*channel as u64);
                writer.write_blob(bytes);
            }
        }

        writer.write_var_u64(self.answers.len() as u64);
        for answer in &self.answers {
            writer.write_var_u64(answer.object.to_raw());
            writer.write_var_u64(answer.requester.0);
            writer.write_u8(answer.granted as u8);
            writer.write_var_u64(answer.new_owner.0);
        }

        writer.write_var_u64(self.requests.len() as u64);
        for request in &self.requests {
            writer.write_var_u64(request.object.to_raw());
            writer.write_var_u64(request.requester.0);
        }

        writer.into_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DeltaError> {
        let mut reader = ByteReader::new(payload);
        let kind = DeltaKind::from_byte(reader.read_u8()?)?;
        let seq = reader.read_u16_le()?;
        let mut delta = DeltaPayload::new(kind, seq);

        let spawn_count = reader.read_var_u64()?;
        for _ in 0..spawn_count {
            let id = NetworkId::from_raw(reader.read_var_u64()?);
            let kind_raw = reader.read_var_u64()?;
            let kind = u16::try_from(kind_raw).map_err(|_| {
                DeltaError::Codec(CodecError::InvalidValue {
                    value_type: "object kind",
                })
            })?;
            let owner = PeerId(reader.read_var_u64()?);
            delta.spawns.push(SpawnEntry {
                id,
                kind: ObjectKind(kind),
                owner,
            });
        }

        let despawn_count = reader.read_var_u64()?;
        for _ in 0..despawn_count {
            delta
                .despawns
                .push(NetworkId::from_raw(reader.read_var_u64()?));
        }

        let object_count = reader.read_var_u64()?;
        for _ in 0..object_count {
            let id = NetworkId::from_raw(reader.read_var_u64()?);
            let owner = PeerId(reader.read_var_u64()?);
            let mut entry = ObjectEntry {
                id,
                owner,
                properties: Vec::new(),
                events: Vec::new(),
            };

            let property_count = reader.read_var_u64()?;
            for _ in 0..property_count {
                let slot = read_index(&mut reader, "property slot index")?;
                let bytes = reader.read_blob()?.to_vec();
                entry.properties.push((slot, bytes));
            }

            let event_count = reader.read_var_u64()?;
            for _ in 0..event_count {
                let channel = read_index(&mut reader, "event channel index")?;
                let bytes = reader.read_blob()?.to_vec();
                entry.events.push((channel, bytes));
            }

            delta.objects.push(entry);
        }

        let answer_count = reader.read_var_u64()?;
        for _ in 0..answer_count {
            let object = NetworkId::from_raw(reader.read_var_u64()?);
            let requester = PeerId(reader.read_var_u64()?);
            let granted = match reader.read_u8()? {
                0 => false,
                1 => true,
                _ => {
                    return Err(DeltaError::Codec(CodecError::InvalidValue {
                        value_type: "ownership answer flag",
                    }))
                }
            };
            let new_owner = PeerId(reader.read_var_u64()?);
            delta.answers.push(OwnershipAnswer {
                object,
                requester,
                granted,
                new_owner,
            });
        }

        let request_count = reader.read_var_u64()?;
        for _ in 0..request_count {
            let object = NetworkId::from_raw(reader.read_var_u64()?);
            let requester = PeerId(reader.read_var_u64()?);
            delta.requests.push(OwnershipRequest { object, requester });
        }

        if reader.remaining() != 0 {
            return Err(DeltaError::TrailingBytes {
                remaining: reader.remaining(),
            });
        }
        Ok(delta)
    }
}

fn read_index(reader: &mut ByteReader, value_type: &'static str) -> Result<u8, DeltaError> {
    let raw = reader.read_var_u64()?;
    u8::try_from(raw).map_err(|_| DeltaError::Codec(CodecError::InvalidValue { value_type }))
}
