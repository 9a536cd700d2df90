//! In-memory mesh transport. Every `LocalTransport` attached to one
//! [`LocalMesh`] behaves as a peer in the same session: broadcasts reach
//! every other attached peer, reliably and in send order per source. The
//! longest-connected peer is the graph authority.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    transport::{SessionInfo, Transport, TransportError, TransportEvent},
    types::{EntityHandle, PeerId, PrefabRef},
};

struct MeshInner {
    next_peer: u64,
    next_handle: u64,
    // Join order; the front peer is the graph authority.
    roster: Vec<PeerId>,
    queues: HashMap<PeerId, VecDeque<TransportEvent>>,
}

impl MeshInner {
    fn broadcast_from(&mut self, source: PeerId, event: TransportEvent) {
        for peer in self.roster.clone() {
            if peer == source {
                continue;
            }
            if let Some(queue) = self.queues.get_mut(&peer) {
                queue.push_back(event.clone());
            }
        }
    }
}

/// Shared hub that `LocalTransport` peers attach to.
#[derive(Clone)]
pub struct LocalMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl LocalMesh {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MeshInner {
                next_peer: 1,
                next_handle: 1,
                roster: Vec::new(),
                queues: HashMap::new(),
            })),
        }
    }

    /// A new, unconnected peer endpoint on this mesh.
    pub fn endpoint(&self) -> LocalTransport {
        LocalTransport {
            mesh: self.clone(),
            local: None,
        }
    }
}

impl Default for LocalMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's endpoint on a [`LocalMesh`].
pub struct LocalTransport {
    mesh: LocalMesh,
    local: Option<PeerId>,
}

impl LocalTransport {
    fn lock_mesh(&self) -> std::sync::MutexGuard<'_, MeshInner> {
        self.mesh
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for LocalTransport {
    fn start_session(&mut self, info: &SessionInfo) -> Result<(), TransportError> {
        if self.local.is_some() {
            return Err(TransportError::SessionRejected {
                reason: "session already started".to_string(),
            });
        }
        let mut mesh = self.lock_mesh();
        let peer = PeerId(mesh.next_peer);
        mesh.next_peer += 1;

        let mut own_queue = VecDeque::new();
        own_queue.push_back(TransportEvent::SessionConnected);
        for existing in &mesh.roster {
            own_queue.push_back(TransportEvent::PeerJoined(*existing));
        }
        mesh.queues.insert(peer, own_queue);
        mesh.roster.push(peer);
        mesh.broadcast_from(peer, TransportEvent::PeerJoined(peer));
        drop(mesh);

        debug!("local mesh: {} joined session '{}'", peer, info.name);
        self.local = Some(peer);
        Ok(())
    }

    fn stop_session(&mut self) -> Result<(), TransportError> {
        let Some(peer) = self.local.take() else {
            return Err(TransportError::NotConnected {
                operation: "stop session",
            });
        };
        let mut mesh = self.lock_mesh();
        mesh.roster.retain(|p| *p != peer);
        mesh.queues.remove(&peer);
        mesh.broadcast_from(peer, TransportEvent::PeerLeft(peer));
        drop(mesh);

        debug!("local mesh: {} left the session", peer);
        Ok(())
    }

    fn send_delta(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let Some(peer) = self.local else {
            return Err(TransportError::NotConnected {
                operation: "send a delta",
            });
        };
        let mut mesh = self.lock_mesh();
        mesh.broadcast_from(
            peer,
            TransportEvent::Delta {
                source: peer,
                payload: payload.to_vec(),
            },
        );
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let Some(peer) = self.local else {
            return Vec::new();
        };
        let mut mesh = self.lock_mesh();
        match mesh.queues.get_mut(&peer) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn spawn(
        &mut self,
        prefab: PrefabRef,
        _position: [f32; 3],
        _rotation: [f32; 4],
    ) -> Result<EntityHandle, TransportError> {
        if self.local.is_none() {
            return Err(TransportError::NotConnected {
                operation: "spawn an entity",
            });
        }
        let mut mesh = self.lock_mesh();
        let handle = EntityHandle(mesh.next_handle);
        mesh.next_handle += 1;
        debug!("local mesh: spawned prefab {:?} as {:?}", prefab, handle);
        Ok(handle)
    }

    fn despawn(&mut self, _handle: EntityHandle) -> Result<(), TransportError> {
        if self.local.is_none() {
            return Err(TransportError::NotConnected {
                operation: "despawn an entity",
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.local.is_some()
    }

    fn is_graph_authority(&self) -> bool {
        let Some(peer) = self.local else {
            return false;
        };
        self.lock_mesh().roster.first() == Some(&peer)
    }

    fn local_peer(&self) -> Option<PeerId> {
        self.local
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if self.local.is_some() {
            let _ = self.stop_session();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LocalMesh;
    use crate::transport::{SessionInfo, Transport, TransportEvent};

    #[test]
    fn join_order_decides_authority() {
        let mesh = LocalMesh::new();
        let mut a = mesh.endpoint();
        let mut b = mesh.endpoint();

        a.start_session(&SessionInfo::default()).unwrap();
        b.start_session(&SessionInfo::default()).unwrap();
        assert!(a.is_graph_authority());
        assert!(!b.is_graph_authority());

        a.stop_session().unwrap();
        assert!(b.is_graph_authority());
    }

    #[test]
    fn broadcasts_reach_everyone_but_the_sender() {
        let mesh = LocalMesh::new();
        let mut a = mesh.endpoint();
        let mut b = mesh.endpoint();
        let mut c = mesh.endpoint();
        a.start_session(&SessionInfo::default()).unwrap();
        b.start_session(&SessionInfo::default()).unwrap();
        c.start_session(&SessionInfo::default()).unwrap();

        a.drain_events();
        b.drain_events();
        c.drain_events();

        a.send_delta(&[1, 2, 3]).unwrap();
        assert!(a.drain_events().is_empty());
        let source = a.local_peer().unwrap();
        for endpoint in [&mut b, &mut c] {
            let events = endpoint.drain_events();
            assert_eq!(
                events,
                vec![TransportEvent::Delta {
                    source,
                    payload: vec![1, 2, 3]
                }]
            );
        }
    }

    #[test]
    fn late_joiner_sees_existing_roster() {
        let mesh = LocalMesh::new();
        let mut a = mesh.endpoint();
        a.start_session(&SessionInfo::default()).unwrap();
        let a_id = a.local_peer().unwrap();

        let mut b = mesh.endpoint();
        b.start_session(&SessionInfo::default()).unwrap();
        let events = b.drain_events();
        assert_eq!(
            events,
            vec![
                TransportEvent::SessionConnected,
                TransportEvent::PeerJoined(a_id)
            ]
        );
    }
}
