//! Chunk table and LRU list
//!
//! Resident chunks live in an arena indexed by [`ChunkId`]. The LRU list is
//! threaded through the arena slots as prev/next indices, so linking,
//! unlinking and popping the coldest chunk are O(1) and no slot owns
//! another. Slots carry a generation so stale ids from dropped chunks are
//! detected instead of aliasing whatever reuses the slot.

use super::chunk::PersistentChunk;

/// Index of a chunk in the table
pub type ChunkId = usize;

struct Slot {
    chunk: PersistentChunk,
    generation: u64,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
    in_lru: bool,
}

/// Arena of chunks plus the intrusive LRU list (head = most recent)
#[derive(Default)]
pub struct ChunkTable {
    slots: Vec<Option<Slot>>,
    free: Vec<ChunkId>,
    next_generation: u64,
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
    lru_len: usize,
    clock: u64,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk; it starts outside the LRU list
    pub fn insert(&mut self, chunk: PersistentChunk) -> (ChunkId, u64) {
        self.next_generation += 1;
        let slot = Slot {
            chunk,
            generation: self.next_generation,
            prev: None,
            next: None,
            in_lru: false,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        (id, self.next_generation)
    }

    /// Remove a chunk, unlinking it first
    pub fn remove(&mut self, id: ChunkId) -> Option<PersistentChunk> {
        self.unlink(id);
        let slot = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        Some(slot.chunk)
    }

    pub fn get(&self, id: ChunkId) -> Option<&PersistentChunk> {
        self.slots.get(id)?.as_ref().map(|s| &s.chunk)
    }

    pub fn get_mut(&mut self, id: ChunkId) -> Option<&mut PersistentChunk> {
        self.slots.get_mut(id)?.as_mut().map(|s| &mut s.chunk)
    }

    /// Chunk `id`, only if it is still the same incarnation
    pub fn get_checked(&mut self, id: ChunkId, generation: u64) -> Option<&mut PersistentChunk> {
        match self.slots.get_mut(id)? {
            Some(slot) if slot.generation == generation => Some(&mut slot.chunk),
            _ => None,
        }
    }

    pub fn generation(&self, id: ChunkId) -> Option<u64> {
        self.slots.get(id)?.as_ref().map(|s| s.generation)
    }

    /// Make `id` the most recently used chunk and stamp it with the clock
    pub fn link_front(&mut self, id: ChunkId) {
        self.unlink(id);
        self.clock += 1;
        let clock = self.clock;
        let old_head = self.head;
        match self.slots.get_mut(id).and_then(|s| s.as_mut()) {
            Some(slot) => {
                slot.prev = None;
                slot.next = old_head;
                slot.in_lru = true;
                slot.chunk.timestamp = clock;
            }
            None => return,
        }
        if let Some(h) = old_head {
            if let Some(Some(slot)) = self.slots.get_mut(h) {
                slot.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
        self.lru_len += 1;
    }

    /// Take `id` off the LRU list if it is on it
    pub fn unlink(&mut self, id: ChunkId) {
        let (prev, next) = match self.slots.get_mut(id).and_then(|s| s.as_mut()) {
            Some(slot) if slot.in_lru => {
                slot.in_lru = false;
                (slot.prev.take(), slot.next.take())
            }
            _ => return,
        };

        match prev {
            Some(p) => {
                if let Some(Some(slot)) = self.slots.get_mut(p) {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(Some(slot)) = self.slots.get_mut(n) {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        self.lru_len -= 1;
    }

    /// Unlink and return the least recently used chunk
    pub fn pop_lru(&mut self) -> Option<ChunkId> {
        let tail = self.tail?;
        self.unlink(tail);
        Some(tail)
    }

    pub fn in_lru(&self, id: ChunkId) -> bool {
        self.slots
            .get(id)
            .and_then(|s| s.as_ref())
            .map_or(false, |s| s.in_lru)
    }

    pub fn lru_len(&self) -> usize {
        self.lru_len
    }

    /// LRU ids from most to least recent
    pub fn lru_order(&self) -> Vec<ChunkId> {
        let mut out = Vec::with_capacity(self.lru_len);
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.slots.get(id).and_then(|s| s.as_ref()).and_then(|s| s.next);
        }
        out
    }

    /// All live chunks
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &PersistentChunk)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| s.as_ref().map(|s| (id, &s.chunk)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChunkHeader, StorageAddress};

    fn chunk(x: i64) -> PersistentChunk {
        let addr = StorageAddress::new(1, 0, vec![x]);
        let header = ChunkHeader::new(&addr, 1, 0);
        PersistentChunk::new(addr, header)
    }

    #[test]
    fn test_lru_order_and_pop() {
        let mut table = ChunkTable::new();
        let (a, _) = table.insert(chunk(0));
        let (b, _) = table.insert(chunk(1));
        let (c, _) = table.insert(chunk(2));
        table.link_front(a);
        table.link_front(b);
        table.link_front(c);
        assert_eq!(table.lru_order(), vec![c, b, a]);

        // Touching a moves it to the front
        table.link_front(a);
        assert_eq!(table.lru_order(), vec![a, c, b]);
        assert!(table.get(a).unwrap().timestamp > table.get(c).unwrap().timestamp);

        assert_eq!(table.pop_lru(), Some(b));
        assert!(!table.in_lru(b));
        table.unlink(c);
        assert_eq!(table.lru_order(), vec![a]);
        assert_eq!(table.lru_len(), 1);
        assert_eq!(table.pop_lru(), Some(a));
        assert_eq!(table.pop_lru(), None);
    }

    #[test]
    fn test_remove_recycles_with_new_generation() {
        let mut table = ChunkTable::new();
        let (a, gen_a) = table.insert(chunk(0));
        table.link_front(a);
        assert!(table.remove(a).is_some());
        assert_eq!(table.lru_len(), 0);
        assert!(table.is_empty());

        let (b, gen_b) = table.insert(chunk(1));
        assert_eq!(a, b);
        assert_ne!(gen_a, gen_b);
        assert!(table.get_checked(a, gen_a).is_none());
        assert!(table.get_checked(b, gen_b).is_some());
        assert_eq!(table.len(), 1);
    }
}
