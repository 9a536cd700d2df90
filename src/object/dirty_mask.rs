use crate::types::SlotIndex;

/// Bitset tracking which property slots of one record have changed since
/// the last delta was emitted for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyMask {
    bytes: Vec<u8>,
}

impl DirtyMask {
    pub fn new(slot_count: SlotIndex) -> Self {
        Self {
            bytes: vec![0; (slot_count as usize + 7) / 8],
        }
    }

    pub fn set_bit(&mut self, slot: SlotIndex, value: bool) {
        let byte = slot as usize / 8;
        if byte >= self.bytes.len() {
            // Slots may be registered after the mask was sized; grow lazily.
            self.bytes.resize(byte + 1, 0);
        }
        let bit = 1u8 << (slot % 8);
        if value {
            self.bytes[byte] |= bit;
        } else {
            self.bytes[byte] &= !bit;
        }
    }

    pub fn bit(&self, slot: SlotIndex) -> bool {
        let byte = slot as usize / 8;
        match self.bytes.get(byte) {
            Some(b) => b & (1u8 << (slot % 8)) != 0,
            None => false,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    pub fn clear(&mut self) {
        for byte in self.bytes.iter_mut() {
            *byte = 0;
        }
    }

    pub fn or(&mut self, other: &DirtyMask) {
        if other.bytes.len() > self.bytes.len() {
            self.bytes.resize(other.bytes.len(), 0);
        }
        for (index, byte) in other.bytes.iter().enumerate() {
            self.bytes[index] |= byte;
        }
    }

    /// Indices of all set bits, in slot order.
    pub fn set_slots(&self) -> Vec<SlotIndex> {
        let mut out = Vec::new();
        for (index, byte) in self.bytes.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8u8 {
                if byte & (1 << bit) != 0 {
                    out.push((index * 8) as SlotIndex + bit);
                }
            }
        }
        out
    }
}
