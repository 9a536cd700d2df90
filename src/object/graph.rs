use std::collections::HashMap;

use log::warn;

use crate::{
    object::record::ObjectRecord,
    types::{NetworkId, PeerId},
};

/// Structural change to the state graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphChange {
    Added(NetworkId),
    Removed(NetworkId),
}

/// Removable registration for a structural-change callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphCallbackKey(u64);

type GraphCallback = Box<dyn FnMut(&GraphChange) + Send + Sync>;

/// Every [`ObjectRecord`] known to the local peer, plus structural change
/// notification when records appear or disappear.
pub struct StateGraph {
    objects: HashMap<NetworkId, ObjectRecord>,
    next_counter: u32,
    next_callback_key: u64,
    callbacks: Vec<(GraphCallbackKey, GraphCallback)>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            next_counter: 0,
            next_callback_key: 0,
            callbacks: Vec::new(),
        }
    }

    /// Mint a fresh session-unique id for a locally spawned object.
    /// Counters are monotonic; ids are never reused within a session.
    pub(crate) fn allocate_id(&mut self, spawner: PeerId) -> NetworkId {
        let id = NetworkId::new(spawner, self.next_counter);
        self.next_counter = self.next_counter.wrapping_add(1);
        id
    }

    pub(crate) fn insert(&mut self, record: ObjectRecord) {
        let id = record.id();
        if self.objects.insert(id, record).is_some() {
            warn!("state graph replaced an existing record for {}", id);
        }
        self.notify(GraphChange::Added(id));
    }

    pub(crate) fn remove(&mut self, id: NetworkId) -> Option<ObjectRecord> {
        let removed = self.objects.remove(&id);
        if removed.is_some() {
            self.notify(GraphChange::Removed(id));
        }
        removed
    }

    pub fn get(&self, id: NetworkId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NetworkId) -> Option<&mut ObjectRecord> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> Vec<NetworkId> {
        self.objects.keys().copied().collect()
    }

    pub fn ids_owned_by(&self, owner: PeerId) -> Vec<NetworkId> {
        let mut ids: Vec<NetworkId> = self
            .objects
            .values()
            .filter(|record| record.owner() == owner)
            .map(|record| record.id())
            .collect();
        // Deterministic emission order for deltas.
        ids.sort();
        ids
    }

    /// Register a structural-change callback, fired synchronously on every
    /// record insert/remove. Removal is explicit via the returned key.
    pub fn on_structural_change(
        &mut self,
        callback: impl FnMut(&GraphChange) + Send + Sync + 'static,
    ) -> GraphCallbackKey {
        let key = GraphCallbackKey(self.next_callback_key);
        self.next_callback_key += 1;
        self.callbacks.push((key, Box::new(callback)));
        key
    }

    /// Returns whether the callback was still registered.
    pub fn remove_structural_callback(&mut self, key: GraphCallbackKey) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(k, _)| *k != key);
        self.callbacks.len() != before
    }

    fn notify(&mut self, change: GraphChange) {
        for (_, callback) in self.callbacks.iter_mut() {
            callback(&change);
        }
    }
}

impl Default for StateGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{GraphChange, StateGraph};
    use crate::{
        object::record::ObjectRecord,
        types::{NetworkId, ObjectKind, PeerId},
    };

    const OWNER: PeerId = PeerId(3);

    fn record(graph: &mut StateGraph) -> ObjectRecord {
        let id = graph.allocate_id(OWNER);
        ObjectRecord::new(id, ObjectKind(1), OWNER)
    }

    #[test]
    fn allocated_ids_are_unique() {
        let mut graph = StateGraph::new();
        let a = graph.allocate_id(OWNER);
        let b = graph.allocate_id(OWNER);
        assert_ne!(a, b);
        assert_eq!(a.spawner_tag(), b.spawner_tag());
    }

    #[test]
    fn structural_callbacks_fire_on_insert_and_remove() {
        let mut graph = StateGraph::new();
        let changes: Arc<Mutex<Vec<GraphChange>>> = Arc::new(Mutex::new(Vec::new()));
        let changes_cb = changes.clone();
        let key = graph.on_structural_change(move |change| {
            changes_cb.lock().unwrap().push(*change);
        });

        let rec = record(&mut graph);
        let id = rec.id();
        graph.insert(rec);
        graph.remove(id);
        assert_eq!(
            *changes.lock().unwrap(),
            vec![GraphChange::Added(id), GraphChange::Removed(id)]
        );

        assert!(graph.remove_structural_callback(key));
        assert!(!graph.remove_structural_callback(key));
    }

    #[test]
    fn removing_unknown_id_is_silent() {
        let mut graph = StateGraph::new();
        assert!(graph.remove(NetworkId::new(OWNER, 99)).is_none());
    }

    #[test]
    fn ids_owned_by_filters_and_sorts() {
        let mut graph = StateGraph::new();
        let a = record(&mut graph);
        let mut b = record(&mut graph);
        b.set_owner(PeerId(9));
        let a_id = a.id();
        graph.insert(b);
        graph.insert(a);
        assert_eq!(graph.ids_owned_by(OWNER), vec![a_id]);
    }
}
