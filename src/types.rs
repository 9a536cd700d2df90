use std::fmt;

/// Monotonically increasing, wrapping sequence number attached to every
/// delta blob a peer sends. Receivers use it to restore send order.
pub type DeltaIndex = u16;

/// Positional index of a property slot within one record.
pub type SlotIndex = u8;

/// Positional index of an event channel within one record.
pub type ChannelIndex = u8;

/// Identity of a peer within the session, assigned by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer({})", self.0)
    }
}

/// Session-unique identity of a replicated object. The high 32 bits carry
/// the spawning peer's tag, the low 32 bits a per-peer counter, so ids are
/// unique without any coordination and are never reused within a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(u64);

impl NetworkId {
    pub fn new(spawner: PeerId, counter: u32) -> Self {
        Self(((spawner.0 as u32) as u64) << 32 | counter as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Low 32 bits of the spawning peer's id.
    pub fn spawner_tag(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NetworkId({}:{})", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Key into the object registry, identifying a record shape. Each
/// replicated component type picks one at registration time; the value
/// must agree across all peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKind(pub u16);

/// Opaque reference to the application entity a record has been bound to.
/// Produced by the transport's spawn call; absent on records the local
/// application has not materialized yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityHandle(pub u64);

/// Reference to a spawnable application prefab, opaque to the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrefabRef(pub u32);
