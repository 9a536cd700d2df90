//! The replication engine: the single entry/exit point between the
//! application's replicated state and the transport's opaque delta blobs.
//!
//! One `tick()` per host simulation step drives everything: transport
//! events are drained, in-order deltas are applied to the state graph,
//! dirty state is serialized sparsely and broadcast, and the tick's
//! lifecycle events are handed back to the caller. All graph mutation is
//! confined to the tick.

pub(crate) mod delta;
pub(crate) mod delta_buffer;

pub mod event;
pub mod ownership;
pub mod subscription;

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    mem,
};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    codec::ByteWriter,
    engine::{
        delta::{
            DeltaKind, DeltaPayload, ObjectEntry, OwnershipAnswer, OwnershipRequest, SpawnEntry,
        },
        delta_buffer::DeltaBuffer,
        event::{Diagnostic, ReplicationEvent},
        ownership::{OwnershipError, OwnershipStatus, OwnershipTicket},
        subscription::{CatchUpGate, SubscriptionState},
    },
    object::{
        graph::StateGraph,
        record::{ObjectRecord, RecordBuilder, RegistrationError},
        registry::{ObjectRegistry, Replicated},
    },
    transport::{DisconnectReason, SessionInfo, Transport, TransportEvent},
    types::{ChannelIndex, DeltaIndex, EntityHandle, NetworkId, PeerId, SlotIndex},
};

/// Errors surfaced by the engine's public API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Operation requires a connected session
    #[error("not connected to a session; cannot {operation}")]
    NotConnected { operation: &'static str },

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),
}

/// Tunables for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How many out-of-order deltas to park per source before skipping
    /// the stream forward.
    pub delta_buffer_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delta_buffer_capacity: 64,
        }
    }
}

struct PeerChannel {
    subscription: SubscriptionState,
    buffer: DeltaBuffer,
}

/// Orchestrates replication for one peer: owns the state graph, the
/// per-peer subscription machinery, and the ownership protocol, and
/// drives the injected [`Transport`].
pub struct ReplicationEngine<T: Transport> {
    transport: T,
    config: EngineConfig,
    registry: ObjectRegistry,
    graph: StateGraph,
    local_peer: Option<PeerId>,
    next_seq: DeltaIndex,
    peers: HashMap<PeerId, PeerChannel>,
    gates: Vec<CatchUpGate>,
    tickets: HashMap<NetworkId, OwnershipTicket>,
    incoming_requests: Vec<OwnershipRequest>,
    /// Transfers observed on the wire but not yet answered, keyed by
    /// (object, requester).
    transfer_candidates: HashSet<(NetworkId, PeerId)>,
    /// Writes from a prospective owner that raced ahead of its grant,
    /// held until the transfer resolves.
    parked_writes: HashMap<(NetworkId, PeerId), Vec<ObjectEntry>>,
    pending_spawns: Vec<SpawnEntry>,
    pending_despawns: Vec<NetworkId>,
    pending_answers: Vec<OwnershipAnswer>,
    pending_requests: Vec<OwnershipRequest>,
    needs_full_broadcast: bool,
    spawned_components: HashMap<NetworkId, Box<dyn Any + Send + Sync>>,
    events: Vec<ReplicationEvent>,
}

impl<T: Transport> ReplicationEngine<T> {
    pub fn new(transport: T, registry: ObjectRegistry) -> Self {
        Self::with_config(transport, registry, EngineConfig::default())
    }

    pub fn with_config(transport: T, registry: ObjectRegistry, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            registry,
            graph: StateGraph::new(),
            local_peer: None,
            next_seq: 0,
            peers: HashMap::new(),
            gates: Vec::new(),
            tickets: HashMap::new(),
            incoming_requests: Vec::new(),
            transfer_candidates: HashSet::new(),
            parked_writes: HashMap::new(),
            pending_spawns: Vec::new(),
            pending_despawns: Vec::new(),
            pending_answers: Vec::new(),
            pending_requests: Vec::new(),
            needs_full_broadcast: false,
            spawned_components: HashMap::new(),
            events: Vec::new(),
        }
    }

    // Session control

    pub fn start_session(&mut self, info: &SessionInfo) -> Result<(), ReplicationError> {
        self.transport.start_session(info)?;
        Ok(())
    }

    pub fn stop_session(&mut self) -> Result<(), ReplicationError> {
        self.transport.stop_session()?;
        self.teardown(DisconnectReason::LocalRequest);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_graph_authority(&self) -> bool {
        self.transport.is_graph_authority()
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.local_peer
    }

    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut StateGraph {
        &mut self.graph
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // Object lifecycle

    /// Spawn a replicated object locally: mints a fresh [`NetworkId`],
    /// builds the record from the type's blueprint, and announces it to
    /// the session on the next tick. The local peer becomes owner.
    pub fn spawn_object<R: Replicated>(&mut self) -> Result<(NetworkId, R), ReplicationError> {
        let local = self.local_peer.ok_or(ReplicationError::NotConnected {
            operation: "spawn an object",
        })?;
        let kind = R::kind();
        if !self.registry.contains(kind) {
            return Err(RegistrationError::UnknownKind { kind }.into());
        }
        let id = self.graph.allocate_id(local);
        let mut record = ObjectRecord::new(id, kind, local);
        let component = {
            let mut builder = RecordBuilder::new(&mut record, local);
            R::build(&mut builder)
        };
        self.graph.insert(record);
        self.pending_spawns.push(SpawnEntry {
            id,
            kind,
            owner: local,
        });
        debug!("spawned object {} of kind {:?}", id, kind);
        Ok((id, component))
    }

    /// Destroy a replicated object everywhere. Only the current owner may
    /// despawn.
    pub fn despawn_object(&mut self, id: NetworkId) -> Result<(), ReplicationError> {
        let local = self.local_peer.ok_or(ReplicationError::NotConnected {
            operation: "despawn an object",
        })?;
        let record = self
            .graph
            .get(id)
            .ok_or(RegistrationError::UnknownObject { id })?;
        if record.owner() != local {
            return Err(OwnershipError::NotOwner { id }.into());
        }
        self.graph.remove(id);
        self.drop_object_state(id);
        self.pending_despawns.push(id);
        Ok(())
    }

    /// Add properties or event channels to a record that has not yet been
    /// synchronized. Once a record's shape has been on the wire this is a
    /// usage error: the record is excluded from replication and the call
    /// fails.
    pub fn extend_object(
        &mut self,
        id: NetworkId,
        build: impl FnOnce(&mut RecordBuilder),
    ) -> Result<(), ReplicationError> {
        let local = self.local_peer.ok_or(ReplicationError::NotConnected {
            operation: "extend an object",
        })?;
        let record = self
            .graph
            .get_mut(id)
            .ok_or(RegistrationError::UnknownObject { id })?;
        if record.is_sealed() {
            record.exclude();
            let error = RegistrationError::RecordSealed { id };
            warn!("{}; excluding object from replication", error);
            return Err(error.into());
        }
        let mut builder = RecordBuilder::new(record, local);
        build(&mut builder);
        Ok(())
    }

    /// Bind the application entity a record is materialized as.
    pub fn bind_handle(
        &mut self,
        id: NetworkId,
        handle: EntityHandle,
    ) -> Result<(), ReplicationError> {
        let record = self
            .graph
            .get_mut(id)
            .ok_or(RegistrationError::UnknownObject { id })?;
        record.bind_handle(handle);
        Ok(())
    }

    /// Retrieve the typed handles of a remotely spawned object, announced
    /// by a previous `ObjectSpawned` event. Returns `None` if the id is
    /// unknown or the type does not match the record's kind.
    pub fn take_spawned<R: Replicated>(&mut self, id: NetworkId) -> Option<R> {
        let boxed = self.spawned_components.remove(&id)?;
        match boxed.downcast::<R>() {
            Ok(component) => Some(*component),
            Err(boxed) => {
                self.spawned_components.insert(id, boxed);
                None
            }
        }
    }

    // Ownership

    /// Ask the current owner (or the graph authority, if the owner is
    /// unreachable) to transfer ownership of `id` to the local peer. The
    /// returned ticket resolves when the answer arrives in the owner's
    /// delta stream.
    pub fn request_ownership(
        &mut self,
        id: NetworkId,
    ) -> Result<OwnershipTicket, ReplicationError> {
        let local = self.local_peer.ok_or(ReplicationError::NotConnected {
            operation: "request ownership",
        })?;
        let record = self
            .graph
            .get(id)
            .ok_or(OwnershipError::UnknownObject { id })?;
        if record.owner() == local {
            return Err(OwnershipError::AlreadyOwned { id }.into());
        }
        if let Some(existing) = self.tickets.get(&id) {
            if existing.is_pending() {
                return Err(OwnershipError::RequestInFlight { id }.into());
            }
        }
        let ticket = OwnershipTicket::new(id);
        self.tickets.insert(id, ticket.clone());
        self.pending_requests.push(OwnershipRequest {
            object: id,
            requester: local,
        });
        Ok(ticket)
    }

    // Subscription

    pub fn subscription_state(&self, peer: PeerId) -> SubscriptionState {
        match self.peers.get(&peer) {
            Some(channel) => channel.subscription,
            None => SubscriptionState::Unsubscribed,
        }
    }

    /// A gate that resolves once the full state of every currently-awaited
    /// peer has been applied. Created before the session connects, it
    /// waits for the initial join wave; created later, it waits for
    /// whatever pairs are still subscribing at that moment.
    pub fn catch_up_gate(&mut self) -> CatchUpGate {
        let gate = if self.local_peer.is_some() {
            let waiting: HashSet<PeerId> = self
                .peers
                .iter()
                .filter(|(_, channel)| channel.subscription == SubscriptionState::Subscribing)
                .map(|(peer, _)| *peer)
                .collect();
            CatchUpGate::new(waiting, false)
        } else {
            CatchUpGate::new(HashSet::new(), true)
        };
        self.gates.push(gate.clone());
        gate
    }

    // The tick

    /// Run one replication step: drain and apply transport traffic, answer
    /// ownership requests, serialize and broadcast local changes, and
    /// return the tick's events.
    pub fn tick(&mut self) -> Vec<ReplicationEvent> {
        for event in self.transport.drain_events() {
            self.process_transport_event(event);
        }
        self.answer_ownership_requests();
        self.flush_outgoing();
        self.finalize_gates();
        mem::take(&mut self.events)
    }

    fn process_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::SessionConnected => {
                self.local_peer = self.transport.local_peer();
                self.events.push(ReplicationEvent::SessionConnected);
            }
            TransportEvent::SessionDisconnected(reason) => {
                self.teardown(reason);
            }
            TransportEvent::PeerJoined(peer) => {
                self.peers.insert(
                    peer,
                    PeerChannel {
                        subscription: SubscriptionState::Subscribing,
                        buffer: DeltaBuffer::new(self.config.delta_buffer_capacity),
                    },
                );
                for gate in &self.gates {
                    gate.add_waiting(peer);
                }
                self.needs_full_broadcast = true;
                self.events.push(ReplicationEvent::PeerJoined(peer));
            }
            TransportEvent::PeerLeft(peer) => {
                self.handle_peer_left(peer);
            }
            TransportEvent::Delta { source, payload } => {
                self.handle_incoming_blob(source, &payload);
            }
        }
    }

    fn handle_incoming_blob(&mut self, source: PeerId, payload: &[u8]) {
        let payload = match DeltaPayload::decode(payload) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("discarding malformed delta from {}: {}", source, error);
                self.events.push(ReplicationEvent::Diagnostic(
                    Diagnostic::MalformedDelta {
                        source,
                        detail: error.to_string(),
                    },
                ));
                return;
            }
        };

        if payload.kind == DeltaKind::Control {
            self.note_requests(&payload.requests);
            self.incoming_requests.extend(payload.requests);
            return;
        }

        let Some(channel) = self.peers.get_mut(&source) else {
            debug!("dropping delta from unknown peer {}", source);
            return;
        };
        let ready = channel.buffer.push(payload);
        for payload in ready {
            self.apply_payload(source, payload);
        }
    }

    /// Apply one in-order state blob. Validation happens up front: if any
    /// applicable entry fails to decode against the local graph, the
    /// entire blob is discarded before it mutates anything.
    fn apply_payload(&mut self, source: PeerId, payload: DeltaPayload) {
        // Requests occasionally piggy-back on state blobs; honor them.
        self.note_requests(&payload.requests);
        self.incoming_requests.extend(payload.requests.iter().copied());

        // Instantiate records for unseen spawns without inserting yet.
        let mut new_records: Vec<(SpawnEntry, ObjectRecord, Box<dyn Any + Send + Sync>)> =
            Vec::new();
        for spawn in &payload.spawns {
            if self.graph.contains(spawn.id)
                || new_records.iter().any(|(entry, _, _)| entry.id == spawn.id)
            {
                continue;
            }
            let local = self.local_peer.unwrap_or(source);
            let mut record = ObjectRecord::new(spawn.id, spawn.kind, spawn.owner);
            let component = {
                let mut builder = RecordBuilder::new(&mut record, local);
                match self.registry.instantiate(spawn.kind, &mut builder) {
                    Ok(component) => component,
                    Err(error) => {
                        warn!("cannot instantiate remote spawn {}: {}", spawn.id, error);
                        continue;
                    }
                }
            };
            // Remote shapes are fixed by the wire from the start.
            record.seal();
            record.clear_dirty();
            new_records.push((spawn.clone(), record, component));
        }

        if let Err(detail) = self.validate_payload(&payload, &new_records) {
            warn!("discarding undecodable delta from {}: {}", source, detail);
            self.events.push(ReplicationEvent::Diagnostic(
                Diagnostic::MalformedDelta { source, detail },
            ));
            return;
        }

        for (entry, record, component) in new_records {
            self.graph.insert(record);
            self.spawned_components.insert(entry.id, component);
            self.events.push(ReplicationEvent::ObjectSpawned {
                id: entry.id,
                kind: entry.kind,
                owner: entry.owner,
            });
        }

        for entry in &payload.objects {
            self.apply_object_entry(source, entry);
        }

        for id in &payload.despawns {
            if self.graph.remove(*id).is_some() {
                self.drop_object_state(*id);
                self.events.push(ReplicationEvent::ObjectDespawned { id: *id });
            }
        }

        for answer in &payload.answers {
            self.apply_ownership_answer(answer);
        }

        if payload.kind == DeltaKind::Full {
            if let Some(channel) = self.peers.get_mut(&source) {
                if channel.subscription == SubscriptionState::Subscribing {
                    channel.subscription = SubscriptionState::CaughtUp;
                    for gate in &self.gates {
                        gate.settle_peer(source);
                    }
                    self.events.push(ReplicationEvent::CaughtUp(source));
                }
            }
        }
    }

    /// Decode-check every property and event value that would be applied.
    /// Entries for unknown objects or stale owners are skipped at apply
    /// time and do not count as malformation.
    fn validate_payload(
        &self,
        payload: &DeltaPayload,
        new_records: &[(SpawnEntry, ObjectRecord, Box<dyn Any + Send + Sync>)],
    ) -> Result<(), String> {
        for entry in &payload.objects {
            let record = match self.graph.get(entry.id) {
                Some(record) => record,
                None => match new_records
                    .iter()
                    .find(|(spawn, _, _)| spawn.id == entry.id)
                {
                    Some((_, record, _)) => record,
                    None => continue,
                },
            };
            for (slot, bytes) in &entry.properties {
                // Slots past the local shape come from a sender-side
                // extension this peer never saw; they are skipped, not
                // treated as malformation.
                if (*slot as usize) >= record.property_count() {
                    continue;
                }
                record
                    .check_property(*slot, bytes)
                    .map_err(|error| format!("object {} slot {}: {}", entry.id, slot, error))?;
            }
            for (channel, bytes) in &entry.events {
                if (*channel as usize) >= record.channel_count() {
                    continue;
                }
                record
                    .check_event(*channel, bytes)
                    .map_err(|error| format!("object {} channel {}: {}", entry.id, channel, error))?;
            }
        }
        Ok(())
    }

    fn apply_object_entry(&mut self, source: PeerId, entry: &ObjectEntry) {
        let Some(record) = self.graph.get(entry.id) else {
            debug!(
                "dropping delta entry for unknown object {} from {}",
                entry.id, source
            );
            self.events.push(ReplicationEvent::Diagnostic(
                Diagnostic::UnknownObject {
                    source,
                    id: entry.id,
                },
            ));
            return;
        };
        // Only the current owner's writes are authoritative. The transport
        // orders blobs per source only, so a new owner's first writes may
        // overtake the grant that travels in the old owner's stream: every
        // request precedes its requester's first authoritative write, so a
        // write from a known requester is parked until the transfer
        // resolves. Anything else from a non-owner is dropped.
        if record.owner() != source {
            if self.transfer_candidates.contains(&(entry.id, source)) {
                debug!(
                    "parking write for {} from prospective owner {}",
                    entry.id, source
                );
                self.parked_writes
                    .entry((entry.id, source))
                    .or_default()
                    .push(entry.clone());
            } else {
                debug!(
                    "dropping delta entry for {} from stale owner {}",
                    entry.id, source
                );
                self.events.push(ReplicationEvent::Diagnostic(
                    Diagnostic::StaleOwnerWrite {
                        source,
                        id: entry.id,
                    },
                ));
            }
            return;
        }
        apply_entry_values(record, source, entry);
    }

    fn apply_ownership_answer(&mut self, answer: &OwnershipAnswer) {
        // An answer consumes its request on every peer. Without this, a
        // queued copy of a request the old owner already denied would be
        // re-answered, and granted, by the newly granted owner.
        self.incoming_requests.retain(|request| {
            request.object != answer.object || request.requester != answer.requester
        });
        self.transfer_candidates
            .remove(&(answer.object, answer.requester));
        let parked = self.parked_writes.remove(&(answer.object, answer.requester));
        let local = self.local_peer;
        if answer.granted {
            if let Some(record) = self.graph.get_mut(answer.object) {
                let previous = record.owner();
                if previous != answer.new_owner {
                    record.set_owner(answer.new_owner);
                    if local == Some(answer.new_owner) {
                        // The first writes sent under the new ownership may
                        // have been shed somewhere before this grant landed;
                        // resend the whole value set once.
                        record.mark_all_dirty();
                    }
                    self.events.push(ReplicationEvent::OwnershipChanged {
                        id: answer.object,
                        previous,
                        current: answer.new_owner,
                    });
                }
                // Writes that raced ahead of this grant are the new
                // owner's; apply them now, in arrival order.
                if let Some(entries) = parked {
                    for entry in &entries {
                        apply_entry_values(record, answer.new_owner, entry);
                    }
                }
            }
        }
        let resolution = if answer.granted && local == Some(answer.new_owner) {
            Some(OwnershipStatus::Granted)
        } else if answer.granted {
            // Someone else won the object.
            Some(OwnershipStatus::Denied)
        } else if local == Some(answer.requester) {
            Some(OwnershipStatus::Denied)
        } else {
            None
        };
        if let Some(status) = resolution {
            if let Some(ticket) = self.tickets.remove(&answer.object) {
                ticket.resolve(status);
            }
        }
    }

    /// Remember which (object, requester) transfers are in flight, so a
    /// requester's writes overtaking its grant can be told apart from
    /// genuinely stale ones.
    fn note_requests(&mut self, requests: &[OwnershipRequest]) {
        for request in requests {
            self.transfer_candidates
                .insert((request.object, request.requester));
        }
    }

    /// Answer queued transfer requests that the local peer is responsible
    /// for: it is the current owner, or it is the graph authority and the
    /// owner has left the session. First request per object per tick wins;
    /// the rest are denied.
    fn answer_ownership_requests(&mut self) {
        let requests = mem::take(&mut self.incoming_requests);
        let Some(local) = self.local_peer else {
            return;
        };
        for request in requests {
            let Some(record) = self.graph.get(request.object) else {
                continue;
            };
            let owner = record.owner();
            if request.requester == owner {
                continue;
            }
            let owner_reachable = owner == local || self.peers.contains_key(&owner);
            let acting = owner == local
                || (self.transport.is_graph_authority() && !owner_reachable);
            if !acting {
                continue;
            }
            let already_answered = self
                .pending_answers
                .iter()
                .any(|answer| answer.object == request.object);
            if already_answered {
                self.pending_answers.push(OwnershipAnswer {
                    object: request.object,
                    requester: request.requester,
                    granted: false,
                    new_owner: owner,
                });
                continue;
            }
            self.pending_answers.push(OwnershipAnswer {
                object: request.object,
                requester: request.requester,
                granted: true,
                new_owner: request.requester,
            });
        }
    }

    /// Serialize and broadcast this tick's outgoing state. Property
    /// entries are written before ownership answers take effect locally,
    /// so the final writes of an outgoing owner precede the transfer in
    /// its own ordered stream.
    fn flush_outgoing(&mut self) {
        let Some(local) = self.local_peer else {
            return;
        };
        if !self.transport.is_connected() {
            return;
        }

        // Control traffic first; requests carry no state and no ordering.
        let requests = mem::take(&mut self.pending_requests);
        if !requests.is_empty() {
            let mut control = DeltaPayload::new(DeltaKind::Control, 0);
            control.requests = requests;
            if let Err(error) = self.transport.send_delta(&control.encode()) {
                warn!("failed to send ownership requests: {}", error);
            }
        }

        let kind = if self.needs_full_broadcast {
            DeltaKind::Full
        } else {
            DeltaKind::Incremental
        };
        let mut payload = DeltaPayload::new(kind, 0);
        payload.despawns = mem::take(&mut self.pending_despawns);
        payload.answers = mem::take(&mut self.pending_answers);

        let owned = self.graph.ids_owned_by(local);
        if kind == DeltaKind::Full {
            // A full re-announces every owned object so a late joiner can
            // instantiate shapes before values arrive.
            self.pending_spawns.clear();
            for id in &owned {
                if let Some(record) = self.graph.get(*id) {
                    if record.is_excluded() {
                        continue;
                    }
                    payload.spawns.push(SpawnEntry {
                        id: *id,
                        kind: record.kind(),
                        owner: record.owner(),
                    });
                }
            }
        } else {
            payload.spawns = mem::take(&mut self.pending_spawns);
        }

        for id in &owned {
            let Some(record) = self.graph.get_mut(*id) else {
                continue;
            };
            if record.is_excluded() {
                continue;
            }
            if let Some(entry) = build_object_entry(record, kind == DeltaKind::Full) {
                payload.objects.push(entry);
            }
            record.seal();
        }
        for spawn in &payload.spawns {
            if let Some(record) = self.graph.get_mut(spawn.id) {
                record.seal();
            }
        }

        let should_send = kind == DeltaKind::Full || !payload.is_empty();
        if should_send {
            payload.seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            if let Err(error) = self.transport.send_delta(&payload.encode()) {
                warn!("failed to send delta: {}", error);
            }
        }
        self.needs_full_broadcast = false;

        // Grants we just emitted take effect locally only now, after this
        // tick's writes went out under the old ownership.
        let answers = payload.answers.clone();
        for answer in &answers {
            self.apply_ownership_answer(answer);
        }
    }

    fn finalize_gates(&mut self) {
        if self.local_peer.is_some() {
            for gate in &self.gates {
                gate.close();
            }
        }
        self.gates.retain(|gate| !gate.is_resolved());
    }

    fn handle_peer_left(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        for gate in &self.gates {
            gate.settle_peer(peer);
        }
        self.transfer_candidates
            .retain(|(_, requester)| *requester != peer);
        self.parked_writes.retain(|(_, requester), _| *requester != peer);
        // The departed peer's records are torn down as if destroyed.
        for id in self.graph.ids_owned_by(peer) {
            self.graph.remove(id);
            self.drop_object_state(id);
            self.events.push(ReplicationEvent::ObjectDespawned { id });
        }
        self.events.push(ReplicationEvent::PeerLeft(peer));
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        for id in self.graph.ids() {
            self.graph.remove(id);
            self.events.push(ReplicationEvent::ObjectDespawned { id });
        }
        for (_, ticket) in self.tickets.drain() {
            ticket.resolve(OwnershipStatus::Cancelled);
        }
        for gate in self.gates.drain(..) {
            gate.cancel();
        }
        self.peers.clear();
        self.spawned_components.clear();
        self.incoming_requests.clear();
        self.transfer_candidates.clear();
        self.parked_writes.clear();
        self.pending_spawns.clear();
        self.pending_despawns.clear();
        self.pending_answers.clear();
        self.pending_requests.clear();
        self.needs_full_broadcast = false;
        self.local_peer = None;
        self.events
            .push(ReplicationEvent::SessionDisconnected(reason));
    }

    /// Forget ticket, transfer, and pending-component state for a removed
    /// object.
    fn drop_object_state(&mut self, id: NetworkId) {
        self.spawned_components.remove(&id);
        self.transfer_candidates.retain(|(object, _)| *object != id);
        self.parked_writes.retain(|(object, _), _| *object != id);
        if let Some(ticket) = self.tickets.remove(&id) {
            ticket.resolve(OwnershipStatus::Cancelled);
        }
    }
}

/// Apply one validated entry's property and event pairs to a record.
/// Pairs indexed past the record's local shape come from a sender-side
/// extension this peer never saw and are skipped.
fn apply_entry_values(record: &ObjectRecord, source: PeerId, entry: &ObjectEntry) {
    for (slot, bytes) in &entry.properties {
        if (*slot as usize) >= record.property_count() {
            debug!("object {}: skipping unknown slot {}", entry.id, slot);
            continue;
        }
        if let Err(error) = record.apply_property(*slot, bytes) {
            // Validated up front; only a poisoned cell lands here.
            warn!("object {} slot {}: {}", entry.id, slot, error);
        }
    }
    for (channel, bytes) in &entry.events {
        if (*channel as usize) >= record.channel_count() {
            debug!("object {}: skipping unknown channel {}", entry.id, channel);
            continue;
        }
        if let Err(error) = record.deliver_event(*channel, source, bytes) {
            warn!("object {} channel {}: {}", entry.id, channel, error);
        }
    }
}

/// Serialize one record into a sparse object entry: every slot for a full,
/// dirty slots only otherwise, plus the drained event backlog. Returns
/// `None` when the record contributes nothing this tick.
fn build_object_entry(record: &mut ObjectRecord, full: bool) -> Option<ObjectEntry> {
    let mut properties = Vec::new();
    if full {
        record.clear_dirty();
        for slot in 0..record.property_count() {
            let slot = slot as SlotIndex;
            let mut writer = ByteWriter::new();
            if record.encode_property(slot, &mut writer) {
                properties.push((slot, writer.into_vec()));
            }
        }
    } else {
        for slot in record.take_dirty().set_slots() {
            if (slot as usize) >= record.property_count() {
                continue;
            }
            let mut writer = ByteWriter::new();
            if record.encode_property(slot, &mut writer) {
                properties.push((slot, writer.into_vec()));
            }
        }
    }

    let mut events = Vec::new();
    for channel in 0..record.channel_count() {
        let channel = channel as ChannelIndex;
        for bytes in record.drain_channel(channel) {
            events.push((channel, bytes));
        }
    }

    if properties.is_empty() && events.is_empty() {
        return None;
    }
    Some(ObjectEntry {
        id: record.id(),
        owner: record.owner(),
        properties,
        events,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        codec::NetValue,
        property::Property,
        transport::TransportError,
        types::{ObjectKind, PrefabRef},
    };

    /// Transport whose deliveries the test scripts event by event, to
    /// exercise cross-source interleavings the in-memory mesh never
    /// produces.
    struct ScriptedTransport {
        local: PeerId,
        connected: bool,
        queue: VecDeque<TransportEvent>,
    }

    impl ScriptedTransport {
        fn new(local: PeerId) -> Self {
            Self {
                local,
                connected: false,
                queue: VecDeque::new(),
            }
        }

        fn push(&mut self, event: TransportEvent) {
            self.queue.push_back(event);
        }
    }

    impl Transport for ScriptedTransport {
        fn start_session(&mut self, _info: &SessionInfo) -> Result<(), TransportError> {
            self.connected = true;
            Ok(())
        }

        fn stop_session(&mut self) -> Result<(), TransportError> {
            self.connected = false;
            Ok(())
        }

        fn send_delta(&mut self, _payload: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn drain_events(&mut self) -> Vec<TransportEvent> {
            self.queue.drain(..).collect()
        }

        fn spawn(
            &mut self,
            _prefab: PrefabRef,
            _position: [f32; 3],
            _rotation: [f32; 4],
        ) -> Result<EntityHandle, TransportError> {
            Ok(EntityHandle(1))
        }

        fn despawn(&mut self, _handle: EntityHandle) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn is_graph_authority(&self) -> bool {
            false
        }

        fn local_peer(&self) -> Option<PeerId> {
            self.connected.then_some(self.local)
        }
    }

    struct Beacon {
        level: Property<u32>,
    }

    impl Replicated for Beacon {
        fn kind() -> ObjectKind {
            ObjectKind(7)
        }

        fn build(builder: &mut RecordBuilder) -> Self {
            Self {
                level: builder.add_property(0u32),
            }
        }
    }

    fn value(raw: u32) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        raw.encode(&mut writer);
        writer.into_vec()
    }

    /// Engine connected as an observer of `owner` and `claimant`, with one
    /// Beacon owned by `owner` at level 7 already applied.
    fn observer_with_beacon(
        owner: PeerId,
        claimant: PeerId,
    ) -> (ReplicationEngine<ScriptedTransport>, NetworkId, Beacon) {
        let mut registry = ObjectRegistry::new();
        registry.register::<Beacon>().unwrap();
        let mut engine = ReplicationEngine::new(ScriptedTransport::new(PeerId(9)), registry);
        engine.start_session(&SessionInfo::default()).unwrap();

        let id = NetworkId::new(owner, 1);
        let mut full = DeltaPayload::new(DeltaKind::Full, 0);
        full.spawns.push(SpawnEntry {
            id,
            kind: ObjectKind(7),
            owner,
        });
        full.objects.push(ObjectEntry {
            id,
            owner,
            properties: vec![(0, value(7))],
            events: Vec::new(),
        });

        let transport = engine.transport_mut();
        transport.push(TransportEvent::SessionConnected);
        transport.push(TransportEvent::PeerJoined(owner));
        transport.push(TransportEvent::PeerJoined(claimant));
        transport.push(TransportEvent::Delta {
            source: owner,
            payload: full.encode(),
        });
        transport.push(TransportEvent::Delta {
            source: claimant,
            payload: DeltaPayload::new(DeltaKind::Full, 0).encode(),
        });
        engine.tick();

        let beacon: Beacon = engine.take_spawned(id).unwrap();
        assert_eq!(beacon.level.get(), 7);
        (engine, id, beacon)
    }

    #[test]
    fn write_overtaking_its_grant_applies_when_the_grant_lands() {
        let owner = PeerId(1);
        let claimant = PeerId(2);
        let (mut engine, id, beacon) = observer_with_beacon(owner, claimant);

        // The claimant's request, then its first authoritative write,
        // arrive before the owner's grant.
        let mut control = DeltaPayload::new(DeltaKind::Control, 0);
        control.requests.push(OwnershipRequest {
            object: id,
            requester: claimant,
        });
        let mut write = DeltaPayload::new(DeltaKind::Incremental, 1);
        write.objects.push(ObjectEntry {
            id,
            owner: claimant,
            properties: vec![(0, value(42))],
            events: Vec::new(),
        });
        let transport = engine.transport_mut();
        transport.push(TransportEvent::Delta {
            source: claimant,
            payload: control.encode(),
        });
        transport.push(TransportEvent::Delta {
            source: claimant,
            payload: write.encode(),
        });
        let events = engine.tick();
        assert!(!events
            .iter()
            .any(|event| matches!(event, ReplicationEvent::Diagnostic(_))));
        assert_eq!(beacon.level.get(), 7);
        assert_eq!(engine.graph().get(id).unwrap().owner(), owner);

        // The grant arrives in the old owner's stream; the parked write
        // takes effect with it.
        let mut grant = DeltaPayload::new(DeltaKind::Incremental, 1);
        grant.answers.push(OwnershipAnswer {
            object: id,
            requester: claimant,
            granted: true,
            new_owner: claimant,
        });
        engine.transport_mut().push(TransportEvent::Delta {
            source: owner,
            payload: grant.encode(),
        });
        let events = engine.tick();
        assert!(events.contains(&ReplicationEvent::OwnershipChanged {
            id,
            previous: owner,
            current: claimant,
        }));
        assert_eq!(beacon.level.get(), 42);
        assert_eq!(engine.graph().get(id).unwrap().owner(), claimant);
    }

    #[test]
    fn non_owner_write_without_a_request_is_dropped() {
        let owner = PeerId(1);
        let claimant = PeerId(2);
        let (mut engine, id, beacon) = observer_with_beacon(owner, claimant);

        let mut write = DeltaPayload::new(DeltaKind::Incremental, 1);
        write.objects.push(ObjectEntry {
            id,
            owner: claimant,
            properties: vec![(0, value(42))],
            events: Vec::new(),
        });
        engine.transport_mut().push(TransportEvent::Delta {
            source: claimant,
            payload: write.encode(),
        });
        let events = engine.tick();
        assert!(events.contains(&ReplicationEvent::Diagnostic(
            Diagnostic::StaleOwnerWrite {
                source: claimant,
                id,
            }
        )));
        assert_eq!(beacon.level.get(), 7);
    }

    #[test]
    fn denied_claimants_parked_write_is_discarded() {
        let owner = PeerId(1);
        let claimant = PeerId(2);
        let (mut engine, id, beacon) = observer_with_beacon(owner, claimant);

        let mut control = DeltaPayload::new(DeltaKind::Control, 0);
        control.requests.push(OwnershipRequest {
            object: id,
            requester: claimant,
        });
        let mut write = DeltaPayload::new(DeltaKind::Incremental, 1);
        write.objects.push(ObjectEntry {
            id,
            owner: claimant,
            properties: vec![(0, value(42))],
            events: Vec::new(),
        });
        let mut denial = DeltaPayload::new(DeltaKind::Incremental, 1);
        denial.answers.push(OwnershipAnswer {
            object: id,
            requester: claimant,
            granted: false,
            new_owner: owner,
        });
        let transport = engine.transport_mut();
        transport.push(TransportEvent::Delta {
            source: claimant,
            payload: control.encode(),
        });
        transport.push(TransportEvent::Delta {
            source: claimant,
            payload: write.encode(),
        });
        transport.push(TransportEvent::Delta {
            source: owner,
            payload: denial.encode(),
        });
        engine.tick();
        assert_eq!(beacon.level.get(), 7);
        assert_eq!(engine.graph().get(id).unwrap().owner(), owner);
    }
}
