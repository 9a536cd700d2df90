use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::{object::dirty_mask::DirtyMask, types::SlotIndex};

/// Errors that can occur on the dirty-signalling channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutatorError {
    /// The shared mask lock was poisoned by a panicking callback
    #[error("dirty mask lock poisoned during {operation}")]
    LockPoisoned { operation: &'static str },
}

// MutatorChannel
//
// Shared dirty-mask cell. The record holds the channel and drains it once
// per tick; each of the record's property cells holds a SlotMutator that
// fans changed-slot signals into it.
#[derive(Clone)]
pub struct MutatorChannel {
    mask: Arc<RwLock<DirtyMask>>,
}

impl MutatorChannel {
    pub fn new(slot_count: SlotIndex) -> Self {
        Self {
            mask: Arc::new(RwLock::new(DirtyMask::new(slot_count))),
        }
    }

    pub fn mutator(&self) -> SlotMutator {
        SlotMutator {
            channel: self.clone(),
        }
    }

    pub fn is_clear(&self) -> bool {
        match self.mask.as_ref().read() {
            Ok(mask) => mask.is_clear(),
            Err(_) => true,
        }
    }

    /// Swap the accumulated mask out, leaving a clear one behind.
    pub fn take(&self) -> Result<DirtyMask, MutatorError> {
        let mut mask = self
            .mask
            .as_ref()
            .write()
            .map_err(|_| MutatorError::LockPoisoned { operation: "take" })?;
        let slot_bits = mask.clone();
        mask.clear();
        Ok(slot_bits)
    }

    /// Mark every slot in `0..slot_count` changed at once.
    pub fn mark_all(&self, slot_count: SlotIndex) -> Result<(), MutatorError> {
        let mut mask = self
            .mask
            .as_ref()
            .write()
            .map_err(|_| MutatorError::LockPoisoned {
                operation: "mark_all",
            })?;
        for slot in 0..slot_count {
            mask.set_bit(slot, true);
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), MutatorError> {
        let mut mask = self
            .mask
            .as_ref()
            .write()
            .map_err(|_| MutatorError::LockPoisoned { operation: "clear" })?;
        mask.clear();
        Ok(())
    }

    fn mark(&self, slot: SlotIndex) -> bool {
        let Ok(mut mask) = self.mask.as_ref().write() else {
            return false;
        };
        mask.set_bit(slot, true);
        true
    }
}

// SlotMutator
//
// Cloneable sender half handed to each property cell at registration.
#[derive(Clone)]
pub struct SlotMutator {
    channel: MutatorChannel,
}

impl SlotMutator {
    /// Signal that the slot's value changed. Returns whether the signal
    /// landed.
    pub fn mark(&self, slot: SlotIndex) -> bool {
        self.channel.mark(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::MutatorChannel;

    #[test]
    fn marks_accumulate_until_taken() {
        let channel = MutatorChannel::new(4);
        let mutator = channel.mutator();
        assert!(channel.is_clear());

        assert!(mutator.mark(1));
        assert!(mutator.mark(3));
        assert!(!channel.is_clear());

        let mask = channel.take().unwrap();
        assert_eq!(mask.set_slots(), vec![1, 3]);
        assert!(channel.is_clear());
    }

    #[test]
    fn mutators_share_one_mask() {
        let channel = MutatorChannel::new(4);
        let a = channel.mutator();
        let b = channel.mutator();
        a.mark(0);
        b.mark(2);
        assert_eq!(channel.take().unwrap().set_slots(), vec![0, 2]);
    }
}
