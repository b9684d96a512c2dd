//! Generation-checked slot storage.
//!
//! Threads refer to each other (queues, sleep list, notification waiters) by
//! [`Handle`]. A handle whose slot has been freed and reused no longer
//! resolves, so a stale reference is a lookup miss rather than a
//! use-after-free.

use alloc::vec::Vec;
use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next_free: Option<u32> },
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.insert_with(|_| value)
    }

    /// Inserts the value built by `f`, which receives the handle it will
    /// live under.
    pub fn insert_with(&mut self, f: impl FnOnce(Handle) -> T) -> Handle {
        self.len += 1;
        match self.free_head {
            Some(index) => {
                let Slot::Free { generation, next_free } = self.slots[index as usize] else {
                    panic!("arena free list points at an occupied slot");
                };
                let handle = Handle {
                    index,
                    generation: generation.wrapping_add(1),
                };
                self.free_head = next_free;
                self.slots[index as usize] = Slot::Occupied {
                    generation: handle.generation,
                    value: f(handle),
                };
                handle
            }
            None => {
                let handle = Handle {
                    index: u32::try_from(self.slots.len()).expect("arena index overflow"),
                    generation: 0,
                };
                self.slots.push(Slot::Occupied {
                    generation: 0,
                    value: f(handle),
                });
                handle
            }
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        match &*slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let old = core::mem::replace(
            slot,
            Slot::Free {
                generation: handle.generation,
                next_free: self.free_head,
            },
        );
        self.free_head = Some(handle.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index())? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index())? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                Handle {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Free { .. } => None,
        })
    }
}

impl<T> core::ops::Index<Handle> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

impl<T> core::ops::IndexMut<Handle> for Arena<T> {
    fn index_mut(&mut self, handle: Handle) -> &mut T {
        match self.get_mut(handle) {
            Some(value) => value,
            None => panic!("stale arena handle {handle:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[a], "a");
        assert_eq!(arena.remove(b), Some("b"));
        assert_eq!(arena.get(b), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut arena = Arena::new();
        let old = arena.insert(1);
        arena.remove(old);
        let new = arena.insert(2);
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena[new], 2);
    }

    #[test]
    fn insert_with_sees_its_handle() {
        let mut arena = Arena::new();
        let h = arena.insert_with(|h| h.index() * 10);
        let g = arena.insert_with(|h| h.index() * 10);
        assert_eq!(arena[h], 0);
        assert_eq!(arena[g], 10);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut arena = Arena::new();
        let handles: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(handles[1]);
        arena.remove(handles[3]);
        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, [0, 2, 4]);
    }

    #[test]
    #[should_panic(expected = "stale arena handle")]
    fn indexing_with_stale_handle_panics() {
        let mut arena = Arena::new();
        let h = arena.insert(());
        arena.remove(h);
        let _ = arena[h];
    }
}
