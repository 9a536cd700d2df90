//! # peersync
//! Transport-agnostic object and property replication for small sessions.
//!
//! Applications declare replicated components as [`Replicated`] types
//! whose blueprints lay out [`Property`] slots and [`EventChannel`]s, hand
//! a [`Transport`] backend to a [`ReplicationEngine`], and drive
//! everything with one [`tick`] per simulation step. The engine tracks
//! ownership, serializes dirty state into sparse delta blobs, catches
//! late joiners up with full-state snapshots, and arbitrates ownership
//! transfer.
//!
//! [`tick`]: ReplicationEngine::tick

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

pub mod codec;
pub mod engine;
pub mod event_channel;
pub mod object;
pub mod property;
pub mod transport;
pub mod types;

mod wrapping_number;

pub use codec::{ByteReader, ByteWriter, CodecError, NetValue};
pub use engine::{
    event::{Diagnostic, ReplicationEvent},
    ownership::{OwnershipError, OwnershipStatus, OwnershipTicket},
    subscription::{CatchUpGate, GateResolution, SubscriptionState},
    EngineConfig, ReplicationEngine, ReplicationError,
};
pub use event_channel::{EventChannel, EventChannelError, ListenerKey, DEFAULT_MAX_QUEUE_LEN};
pub use object::{
    graph::{GraphCallbackKey, GraphChange, StateGraph},
    record::{ObjectRecord, RecordBuilder, RegistrationError},
    registry::{ObjectRegistry, Replicated},
};
pub use property::{CallbackKey, Property, PropertyError};
pub use transport::{
    DisconnectReason, SessionInfo, Transport, TransportError, TransportEvent,
};
pub use types::{
    ChannelIndex, DeltaIndex, EntityHandle, NetworkId, ObjectKind, PeerId, PrefabRef, SlotIndex,
};
pub use wrapping_number::{sequence_greater_than, sequence_less_than, wrapping_diff};

cfg_if! {
    if #[cfg(any(test, feature = "local_transport"))] {
        pub use transport::local::{LocalMesh, LocalTransport};
    }
}
