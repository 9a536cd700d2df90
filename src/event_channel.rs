//! Replicated event channel: a bounded, ordered, fire-and-forget
//! notification stream layered on the delta transport. Events are
//! best-effort; when the pending queue overflows, the oldest unsent event
//! is dropped so fresh events keep flowing instead of stalling on backlog.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
};

use log::warn;
use thiserror::Error;

use crate::{
    codec::{ByteReader, ByteWriter, CodecError, NetValue},
    types::PeerId,
};

/// Default bound on pending events per channel per tick.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 16;

/// Errors that can occur during EventChannel operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventChannelError {
    /// The channel cell lock was poisoned by a panicking listener
    #[error("event channel lock poisoned during {operation}")]
    LockPoisoned { operation: &'static str },
}

/// Removable registration for an event listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

type Listener<T> = Box<dyn FnMut(PeerId, &T) + Send + Sync>;

struct EventCell<T: NetValue> {
    local_peer: PeerId,
    max_queue_len: usize,
    pending: VecDeque<T>,
    next_key: u64,
    listeners: Vec<(ListenerKey, Listener<T>)>,
}

impl<T: NetValue> EventCell<T> {
    fn fire_listeners(&mut self, source: PeerId, value: &T) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(source, value);
        }
    }
}

/// A bounded fire-and-forget event stream belonging to one record.
///
/// Listener delivery order matches registration order. Listeners must not
/// touch the channel they are registered on; the cell lock is held while
/// they run.
#[derive(Clone)]
pub struct EventChannel<T: NetValue> {
    cell: Arc<RwLock<EventCell<T>>>,
}

impl<T: NetValue> EventChannel<T> {
    pub(crate) fn new(local_peer: PeerId, max_queue_len: usize) -> Self {
        Self {
            cell: Arc::new(RwLock::new(EventCell {
                local_peer,
                max_queue_len: max_queue_len.max(1),
                pending: VecDeque::new(),
                next_key: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Fire an event. Local listeners run synchronously; the value is also
    /// queued for remote peers. Only meaningful on the wire when the local
    /// peer owns the record — a non-owner's queue is never drained into a
    /// delta.
    ///
    /// # Panics
    ///
    /// Panics if the cell lock is poisoned. Consider `try_invoke`.
    pub fn invoke(&self, value: T) {
        self.try_invoke(value)
            .expect("event channel lock poisoned")
    }

    pub fn try_invoke(&self, value: T) -> Result<(), EventChannelError> {
        let mut cell = self
            .cell
            .as_ref()
            .write()
            .map_err(|_| EventChannelError::LockPoisoned { operation: "invoke" })?;
        let local_peer = cell.local_peer;
        cell.fire_listeners(local_peer, &value);
        if cell.pending.len() == cell.max_queue_len {
            // Best-effort stream: shed the oldest unsent event.
            cell.pending.pop_front();
        }
        cell.pending.push_back(value);
        Ok(())
    }

    /// Register a listener. Returns a key for explicit removal.
    pub fn add_listener(
        &self,
        listener: impl FnMut(PeerId, &T) + Send + Sync + 'static,
    ) -> Result<ListenerKey, EventChannelError> {
        let mut cell = self.cell.as_ref().write().map_err(|_| {
            EventChannelError::LockPoisoned {
                operation: "add_listener",
            }
        })?;
        let key = ListenerKey(cell.next_key);
        cell.next_key += 1;
        cell.listeners.push((key, Box::new(listener)));
        Ok(key)
    }

    /// Remove a previously registered listener. Returns whether it was
    /// still registered.
    pub fn remove_listener(&self, key: ListenerKey) -> Result<bool, EventChannelError> {
        let mut cell = self.cell.as_ref().write().map_err(|_| {
            EventChannelError::LockPoisoned {
                operation: "remove_listener",
            }
        })?;
        let before = cell.listeners.len();
        cell.listeners.retain(|(k, _)| *k != key);
        Ok(cell.listeners.len() != before)
    }

    pub fn pending_len(&self) -> usize {
        match self.cell.as_ref().read() {
            Ok(cell) => cell.pending.len(),
            Err(_) => 0,
        }
    }
}

/// Type-erased view of an event channel held by its record.
pub(crate) trait EventSlot: Send + Sync {
    /// Encode and clear every pending event, in invoke order.
    fn drain_pending(&self) -> Vec<Vec<u8>>;
    /// Decode without delivering; used to validate a whole delta before
    /// any of it is applied.
    fn check_value(&self, bytes: &[u8]) -> Result<(), CodecError>;
    /// Decode one remote event and fire listeners with its source peer.
    fn deliver_remote(&self, source: PeerId, bytes: &[u8]) -> Result<(), CodecError>;
}

impl<T: NetValue> EventSlot for EventChannel<T> {
    fn drain_pending(&self) -> Vec<Vec<u8>> {
        let Ok(mut cell) = self.cell.as_ref().write() else {
            warn!("event channel poisoned; dropping pending events");
            return Vec::new();
        };
        let mut out = Vec::with_capacity(cell.pending.len());
        while let Some(value) = cell.pending.pop_front() {
            let mut writer = ByteWriter::new();
            value.encode(&mut writer);
            out.push(writer.into_vec());
        }
        out
    }

    fn check_value(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let mut reader = ByteReader::new(bytes);
        T::decode(&mut reader)?;
        Ok(())
    }

    fn deliver_remote(&self, source: PeerId, bytes: &[u8]) -> Result<(), CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = T::decode(&mut reader)?;
        let Ok(mut cell) = self.cell.as_ref().write() else {
            warn!("event channel poisoned; dropping remote event");
            return Ok(());
        };
        cell.fire_listeners(source, &value);
        Ok(())
    }
}
