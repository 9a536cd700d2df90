#![allow(dead_code)]

use peersync::{
    EventChannel, LocalMesh, LocalTransport, ObjectKind, ObjectRegistry, Property, RecordBuilder,
    Replicated, ReplicationEngine, ReplicationEvent, SessionInfo,
};

pub type Engine = ReplicationEngine<LocalTransport>;

/// A small player-avatar-shaped component used across the integration
/// suites: a couple of property slots plus one bounded event channel.
pub struct Pawn {
    pub position: Property<[f32; 3]>,
    pub label: Property<String>,
    pub pings: EventChannel<u32>,
}

pub const PING_QUEUE_LEN: usize = 15;

impl Replicated for Pawn {
    fn kind() -> ObjectKind {
        ObjectKind(1)
    }

    fn build(builder: &mut RecordBuilder) -> Self {
        Self {
            position: builder.add_property([0.0; 3]),
            label: builder.add_property(String::new()),
            pings: builder.add_event(PING_QUEUE_LEN),
        }
    }
}

pub fn registry() -> ObjectRegistry {
    let mut registry = ObjectRegistry::new();
    registry.register::<Pawn>().unwrap();
    registry
}

/// A fresh engine joined to the mesh, not yet ticked.
pub fn join(mesh: &LocalMesh) -> Engine {
    let mut engine = ReplicationEngine::new(mesh.endpoint(), registry());
    engine
        .start_session(&SessionInfo {
            name: "it".to_string(),
        })
        .unwrap();
    engine
}

/// Tick every engine, in order, enough rounds for join waves and full
/// states to propagate everywhere. Returns all events in tick order.
pub fn settle(engines: &mut [&mut Engine]) -> Vec<ReplicationEvent> {
    let mut all = Vec::new();
    for _ in 0..4 {
        for engine in engines.iter_mut() {
            all.extend(engine.tick());
        }
    }
    all
}
