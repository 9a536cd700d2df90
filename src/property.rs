//! Replicated property cell: a single mutable value with change
//! notification and dirty signalling.
//!
//! `Property<T>` is a cloneable handle onto a shared cell; the application
//! keeps one clone, the owning record keeps another (type-erased) for
//! serialization. Writes mark the record's dirty mask through a
//! [`SlotMutator`] so that the per-tick scan is O(dirty slots).

use std::sync::{Arc, RwLock};

use log::warn;
use thiserror::Error;

use crate::{
    codec::{ByteReader, ByteWriter, CodecError, NetValue},
    object::mutator::SlotMutator,
    types::SlotIndex,
};

/// Errors that can occur during Property operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropertyError {
    /// The cell lock was poisoned by a panicking change callback
    #[error("property cell lock poisoned during {operation}")]
    LockPoisoned { operation: &'static str },
}

/// Removable registration for a change callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackKey(u64);

type ChangeCallback<T> = Box<dyn FnMut(&T) + Send + Sync>;

struct PropertyCell<T: NetValue> {
    value: T,
    mutator: Option<SlotMutator>,
    slot: SlotIndex,
    next_key: u64,
    callbacks: Vec<(CallbackKey, ChangeCallback<T>)>,
}

impl<T: NetValue> PropertyCell<T> {
    fn fire_callbacks(&mut self) {
        let PropertyCell {
            value, callbacks, ..
        } = self;
        for (_, callback) in callbacks.iter_mut() {
            callback(value);
        }
    }
}

/// A single replicated value cell.
///
/// Change callbacks fire synchronously for both local writes and applied
/// remote deltas, and cannot distinguish the two. A callback must not
/// touch the property it is registered on; the cell lock is held while
/// callbacks run.
#[derive(Clone)]
pub struct Property<T: NetValue> {
    cell: Arc<RwLock<PropertyCell<T>>>,
}

impl<T: NetValue> Property<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            cell: Arc::new(RwLock::new(PropertyCell {
                value,
                mutator: None,
                slot: 0,
                next_key: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub(crate) fn bind(&self, mutator: SlotMutator, slot: SlotIndex) {
        let Ok(mut cell) = self.cell.as_ref().write() else {
            warn!("property cell poisoned before a mutator could be bound");
            return;
        };
        cell.mutator = Some(mutator);
        cell.slot = slot;
    }

    /// Latest locally-known value: the local write or the last applied
    /// authoritative delta, whichever came later. Never blocks on I/O.
    ///
    /// # Panics
    ///
    /// Panics if the cell lock is poisoned. Consider `try_get`.
    pub fn get(&self) -> T {
        self.try_get()
            .expect("property cell lock poisoned")
    }

    pub fn try_get(&self) -> Result<T, PropertyError> {
        let cell = self
            .cell
            .as_ref()
            .read()
            .map_err(|_| PropertyError::LockPoisoned { operation: "get" })?;
        Ok(cell.value.clone())
    }

    /// Write a new value. Always legal locally; the write only reaches the
    /// wire when the local peer owns the record (a non-owner's write is a
    /// prediction that the next authoritative delta overwrites).
    ///
    /// Marks the slot dirty and fires change callbacks only when the value
    /// actually differs.
    ///
    /// # Panics
    ///
    /// Panics if the cell lock is poisoned. Consider `try_set`.
    pub fn set(&self, value: T) {
        self.try_set(value)
            .expect("property cell lock poisoned")
    }

    pub fn try_set(&self, value: T) -> Result<(), PropertyError> {
        let mut cell = self
            .cell
            .as_ref()
            .write()
            .map_err(|_| PropertyError::LockPoisoned { operation: "set" })?;
        if cell.value == value {
            return Ok(());
        }
        cell.value = value;
        if let Some(mutator) = &cell.mutator {
            let slot = cell.slot;
            mutator.mark(slot);
        }
        cell.fire_callbacks();
        Ok(())
    }

    /// Write a new value without change detection: the slot goes dirty and
    /// callbacks fire even if the value compares equal.
    pub fn force_set(&self, value: T) -> Result<(), PropertyError> {
        let mut cell = self
            .cell
            .as_ref()
            .write()
            .map_err(|_| PropertyError::LockPoisoned { operation: "force_set" })?;
        cell.value = value;
        if let Some(mutator) = &cell.mutator {
            let slot = cell.slot;
            mutator.mark(slot);
        }
        cell.fire_callbacks();
        Ok(())
    }

    /// Register a change callback. Callbacks fire in registration order.
    /// Removal is explicit via the returned key; nothing is dropped behind
    /// the caller's back.
    pub fn on_changed(
        &self,
        callback: impl FnMut(&T) + Send + Sync + 'static,
    ) -> Result<CallbackKey, PropertyError> {
        let mut cell = self
            .cell
            .as_ref()
            .write()
            .map_err(|_| PropertyError::LockPoisoned { operation: "on_changed" })?;
        let key = CallbackKey(cell.next_key);
        cell.next_key += 1;
        cell.callbacks.push((key, Box::new(callback)));
        Ok(key)
    }

    /// Remove a previously registered callback. Returns whether it was
    /// still registered.
    pub fn remove_on_changed(&self, key: CallbackKey) -> Result<bool, PropertyError> {
        let mut cell = self.cell.as_ref().write().map_err(|_| {
            PropertyError::LockPoisoned {
                operation: "remove_on_changed",
            }
        })?;
        let before = cell.callbacks.len();
        cell.callbacks.retain(|(k, _)| *k != key);
        Ok(cell.callbacks.len() != before)
    }

    pub(crate) fn encode_value(&self, writer: &mut ByteWriter) -> Result<(), PropertyError> {
        let cell = self
            .cell
            .as_ref()
            .read()
            .map_err(|_| PropertyError::LockPoisoned { operation: "encode" })?;
        cell.value.encode(writer);
        Ok(())
    }

    /// Decode without applying; used to validate a whole delta before any
    /// of it mutates the graph.
    pub(crate) fn check_value(&self, bytes: &[u8]) -> Result<(), CodecError> {
        let mut reader = ByteReader::new(bytes);
        T::decode(&mut reader)?;
        Ok(())
    }

    /// Apply an authoritative remote value. Fires callbacks only when the
    /// value differs from the current one, which keeps duplicate delta
    /// delivery idempotent. Does not mark the slot dirty; applied remote
    /// state must not echo back out.
    pub(crate) fn apply_remote(&self, bytes: &[u8]) -> Result<bool, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let value = T::decode(&mut reader)?;
        let Ok(mut cell) = self.cell.as_ref().write() else {
            warn!("property cell poisoned; dropping applied remote value");
            return Ok(false);
        };
        if cell.value == value {
            return Ok(false);
        }
        cell.value = value;
        cell.fire_callbacks();
        Ok(true)
    }
}

/// Type-erased view of a property slot held by its record.
pub(crate) trait PropertySlot: Send + Sync {
    fn encode_value(&self, writer: &mut ByteWriter) -> Result<(), PropertyError>;
    fn check_value(&self, bytes: &[u8]) -> Result<(), CodecError>;
    fn apply_remote(&self, bytes: &[u8]) -> Result<bool, CodecError>;
}

impl<T: NetValue> PropertySlot for Property<T> {
    fn encode_value(&self, writer: &mut ByteWriter) -> Result<(), PropertyError> {
        Property::encode_value(self, writer)
    }

    fn check_value(&self, bytes: &[u8]) -> Result<(), CodecError> {
        Property::check_value(self, bytes)
    }

    fn apply_remote(&self, bytes: &[u8]) -> Result<bool, CodecError> {
        Property::apply_remote(self, bytes)
    }
}
