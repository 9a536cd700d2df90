use crate::{
    transport::DisconnectReason,
    types::{NetworkId, ObjectKind, PeerId},
};

/// Everything the replication engine surfaces to the application, drained
/// once per tick from [`ReplicationEngine::tick`].
///
/// [`ReplicationEngine::tick`]: crate::engine::ReplicationEngine::tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationEvent {
    SessionConnected,
    SessionDisconnected(DisconnectReason),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// The named peer's full state has been applied; the pair is caught up.
    CaughtUp(PeerId),
    ObjectSpawned {
        id: NetworkId,
        kind: ObjectKind,
        owner: PeerId,
    },
    ObjectDespawned {
        id: NetworkId,
    },
    OwnershipChanged {
        id: NetworkId,
        previous: PeerId,
        current: PeerId,
    },
    /// A recovered runtime error; developer-visible, never fatal.
    Diagnostic(Diagnostic),
}

/// Recovered errors from delta processing. These never interrupt the tick
/// loop; they exist so a host application can log or assert on them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// A whole delta was discarded before application.
    MalformedDelta { source: PeerId, detail: String },
    /// A delta entry referenced an id not present locally (likely a
    /// concurrently destroyed object); the entry was skipped.
    UnknownObject { source: PeerId, id: NetworkId },
    /// A property write arrived from a peer that no longer owns the
    /// record; the entry was skipped.
    StaleOwnerWrite { source: PeerId, id: NetworkId },
}
