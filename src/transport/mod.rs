//! Transport provider contract. The replication core drives a backend
//! through this narrow, poll-based surface and stays agnostic to whether
//! the realization is a custom relay, a third-party SDK, or the in-memory
//! mesh used by the test suite.

use thiserror::Error;

use crate::types::{EntityHandle, PeerId, PrefabRef};

cfg_if! {
    if #[cfg(any(test, feature = "local_transport"))] {
        pub mod local;
    }
}

/// Errors surfaced by a transport backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Operation requires a connected session
    #[error("transport is not connected; cannot {operation}")]
    NotConnected { operation: &'static str },

    /// The backend refused to open the session
    #[error("session rejected: {reason}")]
    SessionRejected { reason: String },

    /// A payload could not be handed to the backend
    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    /// The handle does not reference a live spawned entity
    #[error("unknown entity handle {handle:?}")]
    UnknownHandle { handle: EntityHandle },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application asked for the session to stop
    LocalRequest,
    /// The backend timed out
    Timeout,
    /// The underlying connection dropped
    ConnectionLost,
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub name: String,
}

/// Session-membership and delta-delivery events, drained once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    SessionConnected,
    SessionDisconnected(DisconnectReason),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// One opaque delta blob from one peer. Delivery is reliable and
    /// ordered per source; blobs from different sources interleave freely.
    Delta { source: PeerId, payload: Vec<u8> },
}

/// The contract a transport backend fulfils for the replication core.
///
/// Delivery guarantee required of implementations: every payload passed to
/// `send_delta` reaches every other subscribed peer, and payloads from one
/// sender arrive in send order. The core reorders on top of this with its
/// own sequence numbers only as a safety net.
pub trait Transport {
    fn start_session(&mut self, info: &SessionInfo) -> Result<(), TransportError>;
    fn stop_session(&mut self) -> Result<(), TransportError>;

    /// Best-effort broadcast of one delta blob to all subscribed peers.
    fn send_delta(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Drain every pending event. Called exactly once per tick.
    fn drain_events(&mut self) -> Vec<TransportEvent>;

    /// Materialize an application entity from a prefab.
    fn spawn(
        &mut self,
        prefab: PrefabRef,
        position: [f32; 3],
        rotation: [f32; 4],
    ) -> Result<EntityHandle, TransportError>;

    fn despawn(&mut self, handle: EntityHandle) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Whether the local peer arbitrates ownership disputes when an
    /// object's owner is unreachable. Exactly one peer per session.
    fn is_graph_authority(&self) -> bool;

    fn local_peer(&self) -> Option<PeerId>;
}
