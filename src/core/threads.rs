/// Thread registry: a linked list of live target threads with a free-list
/// for node reuse. The OS handle type is generic over the platform layer
/// (an opaque `usize` on Windows is a raw `HANDLE`).
use crate::core::types::ThreadId;

struct ThreadNode {
    id: ThreadId,
    handle: Option<usize>,
    next: Option<usize>,
}

enum Slot {
    Occupied(ThreadNode),
    Free { next_free: Option<usize> },
}

/// What the caller must do in response to a registry mutation: emit the
/// corresponding wire reply. `ThreadAdd`/`ThreadRemove` must be emitted
/// before the node is linked/unlinked, per the ordering guarantee that a
/// `StackSamples(tid, ...)` is never seen before its `ThreadAdd(tid)`.
pub enum ThreadEvent {
    Added { id: ThreadId, handle: Option<usize> },
    Removed { id: ThreadId },
}

pub struct ThreadRegistry {
    slots: Vec<Slot>,
    head: Option<usize>,
    free_head: Option<usize>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry {
            slots: Vec::new(),
            head: None,
            free_head: None,
        }
    }

    /// Add a thread to the registry, returning the event the caller must
    /// relay to the frontend (emitted conceptually before linking, which
    /// this synchronous implementation also does in that order).
    pub fn add(&mut self, id: ThreadId, handle: Option<usize>) -> ThreadEvent {
        let node = ThreadNode {
            id,
            handle,
            next: self.head,
        };

        let index = if let Some(free) = self.free_head {
            let next_free = match &self.slots[free] {
                Slot::Free { next_free } => *next_free,
                Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
            };
            self.free_head = next_free;
            self.slots[free] = Slot::Occupied(node);
            free
        } else {
            let index = self.slots.len();
            self.slots.push(Slot::Occupied(node));
            index
        };

        self.head = Some(index);
        ThreadEvent::Added { id, handle }
    }

    /// Remove a thread by id, closing its handle is the caller's
    /// responsibility (the registry only tracks ownership bookkeeping).
    pub fn remove(&mut self, id: ThreadId) -> Option<(ThreadEvent, Option<usize>)> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let (matches, next, handle) = match &self.slots[index] {
                Slot::Occupied(node) => (node.id == id, node.next, node.handle),
                Slot::Free { .. } => unreachable!("list cursor landed on a free slot"),
            };

            if matches {
                match prev {
                    Some(prev_index) => {
                        if let Slot::Occupied(node) = &mut self.slots[prev_index] {
                            node.next = next;
                        }
                    }
                    None => self.head = next,
                }
                self.slots[index] = Slot::Free {
                    next_free: self.free_head,
                };
                self.free_head = Some(index);
                return Some((ThreadEvent::Removed { id }, handle));
            }

            prev = Some(index);
            cursor = next;
        }

        None
    }

    /// Iterate live thread ids and handles in registry order (most
    /// recently added first, matching the prepend-at-head discipline).
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, Option<usize>)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            match &self.slots[index] {
                Slot::Occupied(node) => {
                    cursor = node.next;
                    Some((node.id, node.handle))
                }
                Slot::Free { .. } => unreachable!("list cursor landed on a free slot"),
            }
        })
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.iter().any(|(tid, _)| tid == id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_iterate() {
        let mut reg = ThreadRegistry::new();
        reg.add(1, Some(100));
        reg.add(2, Some(200));
        let ids: Vec<ThreadId> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn remove_unlinks_and_returns_handle() {
        let mut reg = ThreadRegistry::new();
        reg.add(1, Some(100));
        reg.add(2, Some(200));
        let (event, handle) = reg.remove(1).unwrap();
        assert!(matches!(event, ThreadEvent::Removed { id: 1 }));
        assert_eq!(handle, Some(100));
        assert!(!reg.contains(1));
        assert!(reg.contains(2));
    }

    #[test]
    fn remove_unknown_id_returns_none() {
        let mut reg = ThreadRegistry::new();
        reg.add(1, Some(100));
        assert!(reg.remove(99).is_none());
    }

    #[test]
    fn removed_slot_is_recycled() {
        let mut reg = ThreadRegistry::new();
        reg.add(1, Some(100));
        reg.remove(1);
        reg.add(2, Some(200));
        assert_eq!(reg.len(), 1);
        assert!(reg.contains(2));
    }

    #[test]
    fn remove_from_middle_of_list() {
        let mut reg = ThreadRegistry::new();
        reg.add(1, None);
        reg.add(2, None);
        reg.add(3, None);
        reg.remove(2);
        let ids: Vec<ThreadId> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 1]);
    }
}
