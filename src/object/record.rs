use log::warn;
use thiserror::Error;

use crate::{
    codec::{ByteWriter, CodecError, NetValue},
    event_channel::{EventChannel, EventSlot},
    object::mutator::MutatorChannel,
    object::dirty_mask::DirtyMask,
    property::{Property, PropertySlot},
    types::{ChannelIndex, EntityHandle, NetworkId, ObjectKind, PeerId, SlotIndex},
};

/// Errors that can occur while registering replicated state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Property/event registered after the record was first synchronized
    #[error("record {id} is already synchronized; register properties and events before first sync")]
    RecordSealed { id: NetworkId },

    /// A record cannot carry more slots than the wire index can address
    #[error("record {id} exceeds the {limit}-slot limit")]
    SlotLimitExceeded { id: NetworkId, limit: usize },

    /// Two replicated types claimed the same registry kind
    #[error("object kind {kind:?} is already registered")]
    DuplicateKind { kind: ObjectKind },

    /// A spawn referenced a kind no registered type claims
    #[error("object kind {kind:?} is not registered")]
    UnknownKind { kind: ObjectKind },

    /// The object is not present in the local state graph
    #[error("object {id} is not present in the state graph")]
    UnknownObject { id: NetworkId },
}

const SLOT_LIMIT: usize = SlotIndex::MAX as usize + 1;

/// One replicated object known to the local peer: its identity, current
/// owner, and the fixed, positionally-indexed sequences of property slots
/// and event channels that make up its wire shape.
///
/// The slot lists never reorder or shrink after the record seals; only
/// values mutate. Insertion order is the implicit wire-format index and
/// must be identical on every peer, which the registry blueprint
/// guarantees.
pub struct ObjectRecord {
    id: NetworkId,
    kind: ObjectKind,
    owner: PeerId,
    handle: Option<EntityHandle>,
    sealed: bool,
    excluded: bool,
    dirty: MutatorChannel,
    properties: Vec<Box<dyn PropertySlot>>,
    events: Vec<Box<dyn EventSlot>>,
}

impl ObjectRecord {
    pub(crate) fn new(id: NetworkId, kind: ObjectKind, owner: PeerId) -> Self {
        Self {
            id,
            kind,
            owner,
            handle: None,
            sealed: false,
            excluded: false,
            dirty: MutatorChannel::new(0),
            properties: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> NetworkId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// The peer whose writes to this record's properties are authoritative.
    pub fn owner(&self) -> PeerId {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: PeerId) {
        self.owner = owner;
    }

    /// The application entity this record is bound to, if the local
    /// application has materialized one.
    pub fn handle(&self) -> Option<EntityHandle> {
        self.handle
    }

    pub(crate) fn bind_handle(&mut self, handle: EntityHandle) {
        self.handle = Some(handle);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether the record was excluded from replication by a registration
    /// error.
    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    pub(crate) fn exclude(&mut self) {
        self.excluded = true;
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn channel_count(&self) -> usize {
        self.events.len()
    }

    // Delta plumbing, driven by the replication engine.

    pub(crate) fn take_dirty(&mut self) -> DirtyMask {
        match self.dirty.take() {
            Ok(mask) => mask,
            Err(error) => {
                warn!("record {}: {}", self.id, error);
                DirtyMask::new(0)
            }
        }
    }

    pub(crate) fn clear_dirty(&mut self) {
        if let Err(error) = self.dirty.clear() {
            warn!("record {}: {}", self.id, error);
        }
    }

    /// Mark every property slot dirty so the next delta carries the full
    /// value set.
    pub(crate) fn mark_all_dirty(&mut self) {
        if let Err(error) = self.dirty.mark_all(self.properties.len() as SlotIndex) {
            warn!("record {}: {}", self.id, error);
        }
    }

    pub(crate) fn encode_property(&self, slot: SlotIndex, writer: &mut ByteWriter) -> bool {
        let Some(property) = self.properties.get(slot as usize) else {
            return false;
        };
        match property.encode_value(writer) {
            Ok(()) => true,
            Err(error) => {
                warn!("record {} slot {}: {}", self.id, slot, error);
                false
            }
        }
    }

    pub(crate) fn check_property(&self, slot: SlotIndex, bytes: &[u8]) -> Result<(), CodecError> {
        match self.properties.get(slot as usize) {
            Some(property) => property.check_value(bytes),
            None => Err(CodecError::InvalidValue {
                value_type: "property slot index",
            }),
        }
    }

    pub(crate) fn apply_property(&self, slot: SlotIndex, bytes: &[u8]) -> Result<bool, CodecError> {
        match self.properties.get(slot as usize) {
            Some(property) => property.apply_remote(bytes),
            None => Err(CodecError::InvalidValue {
                value_type: "property slot index",
            }),
        }
    }

    pub(crate) fn drain_channel(&self, channel: ChannelIndex) -> Vec<Vec<u8>> {
        match self.events.get(channel as usize) {
            Some(slot) => slot.drain_pending(),
            None => Vec::new(),
        }
    }

    pub(crate) fn check_event(&self, channel: ChannelIndex, bytes: &[u8]) -> Result<(), CodecError> {
        match self.events.get(channel as usize) {
            Some(slot) => slot.check_value(bytes),
            None => Err(CodecError::InvalidValue {
                value_type: "event channel index",
            }),
        }
    }

    pub(crate) fn deliver_event(
        &self,
        channel: ChannelIndex,
        source: PeerId,
        bytes: &[u8],
    ) -> Result<(), CodecError> {
        match self.events.get(channel as usize) {
            Some(slot) => slot.deliver_remote(source, bytes),
            None => Err(CodecError::InvalidValue {
                value_type: "event channel index",
            }),
        }
    }
}

/// Declares the replicated shape of a record, in a fixed order that doubles
/// as the wire index. Handed to [`Replicated::build`] when a record is
/// instantiated, and to extension closures before a record first syncs.
///
/// [`Replicated::build`]: crate::object::registry::Replicated::build
pub struct RecordBuilder<'a> {
    record: &'a mut ObjectRecord,
    local_peer: PeerId,
}

impl<'a> RecordBuilder<'a> {
    pub(crate) fn new(record: &'a mut ObjectRecord, local_peer: PeerId) -> Self {
        Self { record, local_peer }
    }

    /// Declare the next property slot with its initial value. Declaration
    /// order is the wire index and must match on every peer.
    pub fn add_property<T: NetValue>(&mut self, initial: T) -> Property<T> {
        let property = Property::new(initial);
        if self.record.properties.len() >= SLOT_LIMIT {
            warn!(
                "{}",
                RegistrationError::SlotLimitExceeded {
                    id: self.record.id,
                    limit: SLOT_LIMIT,
                }
            );
            self.record.exclude();
            return property;
        }
        let slot = self.record.properties.len() as SlotIndex;
        property.bind(self.record.dirty.mutator(), slot);
        self.record.properties.push(Box::new(property.clone()));
        property
    }

    /// Declare the next event channel with its queue bound.
    pub fn add_event<T: NetValue>(&mut self, max_queue_len: usize) -> EventChannel<T> {
        let channel = EventChannel::new(self.local_peer, max_queue_len);
        if self.record.events.len() >= SLOT_LIMIT {
            warn!(
                "{}",
                RegistrationError::SlotLimitExceeded {
                    id: self.record.id,
                    limit: SLOT_LIMIT,
                }
            );
            self.record.exclude();
            return channel;
        }
        self.record.events.push(Box::new(channel.clone()));
        channel
    }
}
