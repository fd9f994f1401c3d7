use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Number of key slots in the keyspace.
pub(crate) const SLOT_COUNT: u16 = 16384;

fn crc16_slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_COUNT
}

fn get_hashtag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|v| *v == b'{')?;
    let close = key[open..].iter().position(|v| *v == b'}')?;
    let tag = &key[open + 1..open + close];
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

/// Returns the slot that matches `key`, honoring `{hashtag}` grouping.
///
/// Matches the server's key-hashing function, so a slot-granularity
/// invalidation addresses exactly the keys the server would group.
pub fn key_slot(key: &[u8]) -> u16 {
    let key = match get_hashtag(key) {
        Some(tag) => tag,
        None => key,
    };
    crc16_slot(key)
}

/// Secondary index from slot to the keys currently cached locally.
///
/// Only maintained when the invalidation transport reports at slot
/// granularity; key-granularity tracking does not need it.
pub(crate) struct SlotIndex {
    slots: Mutex<HashMap<u16, HashSet<String>>>,
}

impl SlotIndex {
    pub(crate) fn new() -> SlotIndex {
        SlotIndex {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, key: &str) {
        let slot = key_slot(key.as_bytes());
        let mut slots = self.slots.lock().unwrap();
        slots.entry(slot).or_default().insert(key.to_string());
    }

    pub(crate) fn remove(&self, key: &str) {
        let slot = key_slot(key.as_bytes());
        let mut slots = self.slots.lock().unwrap();
        if let Some(entries) = slots.get_mut(&slot) {
            entries.remove(key);
            if entries.is_empty() {
                slots.remove(&slot);
            }
        }
    }

    /// Removes the whole slot, returning the keys that lived in it.
    pub(crate) fn remove_slot(&self, slot: u16) -> HashSet<String> {
        self.slots.lock().unwrap().remove(&slot).unwrap_or_default()
    }

    pub(crate) fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        let slot = key_slot(key.as_bytes());
        self.slots
            .lock()
            .unwrap()
            .get(&slot)
            .is_some_and(|entries| entries.contains(key))
    }
}
