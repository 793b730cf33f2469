//! The request arena and the parent/child links.
//!
//! Requests never own each other. They live in an arena and refer to each other by `Handle`; the
//! tree structure lives in each request's `Links`, separately locked from its I/O state, so a
//! child can notify its parent while the parent is executing a stage.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use pool::ConfigToken;
use zio::request::{Completed, Flags, Io, Priority};
use Error;

/// A request handle.
///
/// Handles are generational: a handle to a request which has been released never resolves to a
/// request created later in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    item: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Entry<T>>,
    /// Indices of vacant entries.
    vacant: Vec<u32>,
    /// The number of occupied entries.
    live: usize,
}

/// A slab of reference counted items addressed by generational handles.
pub struct Arena<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        Arena {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                vacant: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Insert an item constructed from its handle.
    pub fn insert_with<F: FnOnce(Handle) -> T>(&self, f: F) -> Arc<T> {
        let mut slots = self.slots.lock();

        let index = match slots.vacant.pop() {
            Some(index) => index,
            None => {
                slots.entries.push(Entry {
                    generation: 0,
                    item: None,
                });
                (slots.entries.len() - 1) as u32
            },
        };

        let handle = Handle {
            index: index,
            generation: slots.entries[index as usize].generation,
        };
        let item = Arc::new(f(handle));
        slots.entries[index as usize].item = Some(item.clone());
        slots.live += 1;

        item
    }

    /// Look up an item.
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        let slots = self.slots.lock();

        slots.entries.get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.item.clone())
    }

    /// Remove an item, invalidating its handle.
    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();

        let item = {
            let entry = match slots.entries.get_mut(handle.index as usize) {
                Some(entry) if entry.generation == handle.generation => entry,
                _ => return None,
            };
            let item = entry.item.take()?;
            entry.generation = entry.generation.wrapping_add(1);
            item
        };
        slots.vacant.push(handle.index);
        slots.live -= 1;

        Some(item)
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }
}

/// A point in a request's life its parent may wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// The block pointer is stable.
    Ready,
    /// The request has completed.
    Done,
}

/// The parent/child relations of a request.
#[derive(Default)]
pub struct Links {
    /// The parent, if any.
    pub parent: Option<Handle>,
    /// The children which have not completed yet.
    pub children: Vec<Handle>,
    /// The number of children which have not reached `Ready`.
    not_ready: usize,
    /// The number of children which have not reached `Done`.
    not_done: usize,
    /// The milestone the request is stalled on.
    stall: Option<Milestone>,
    /// The errors of the completed children, folded.
    child_error: Option<Error>,
    /// Does this request count towards its parent's `not_ready`?
    pub counted_ready: bool,
    /// Has the request passed its ready stage?
    pub reached_ready: bool,
    /// Has the request passed its done stage?
    pub reached_done: bool,
    /// Has the request been submitted?
    pub submitted: bool,
    /// Is a caller blocked on the request?
    pub waiter: bool,
    /// The result, for the waiter.
    pub result: Option<Result<Completed, Error>>,
}

impl Links {
    /// Register a new child.
    ///
    /// `count_ready` is false for children added after this request reached `Ready`.
    pub fn add_child(&mut self, child: Handle, count_ready: bool) {
        assert!(!self.reached_done, "adding a child to a completed request");

        self.children.push(child);
        if count_ready {
            self.not_ready += 1;
        }
        self.not_done += 1;
    }

    /// The number of children which have not reached `milestone`.
    pub fn pending(&self, milestone: Milestone) -> usize {
        match milestone {
            Milestone::Ready => self.not_ready,
            Milestone::Done => self.not_done,
        }
    }

    /// Record that a child reached `milestone`.
    ///
    /// `error` is folded into the child error. Returns true if this request was stalled on the
    /// milestone and should be resumed now.
    ///
    /// # Panics
    ///
    /// Panics if the counter would underflow, which means a child reported the same milestone
    /// twice.
    pub fn child_reached(&mut self, child: Handle, milestone: Milestone, counted_ready: bool,
                         error: Option<Error>) -> bool {
        match milestone {
            Milestone::Ready => {
                if !counted_ready {
                    return false;
                }
                self.not_ready = match self.not_ready.checked_sub(1) {
                    Some(n) => n,
                    None => panic!("ready counter underflow on child {}", child),
                };
            },
            Milestone::Done => {
                self.not_done = match self.not_done.checked_sub(1) {
                    Some(n) => n,
                    None => panic!("done counter underflow on child {}", child),
                };
                match self.children.iter().position(|&h| h == child) {
                    Some(n) => {
                        self.children.swap_remove(n);
                    },
                    None => panic!("completed child {} is not linked", child),
                }
            },
        }

        if let Some(err) = error {
            self.child_error = Some(match self.child_error.take() {
                Some(old) => old.worse(err),
                None => err,
            });
        }

        if self.pending(milestone) == 0 && self.stall == Some(milestone) {
            self.stall = None;
            true
        } else {
            false
        }
    }

    /// Stall on `milestone` if any child has not reached it yet.
    ///
    /// Returns true if stalled.
    pub fn stall_on(&mut self, milestone: Milestone) -> bool {
        if self.pending(milestone) > 0 {
            self.stall = Some(milestone);
            true
        } else {
            false
        }
    }

    /// Take the folded child error.
    pub fn take_child_error(&mut self) -> Option<Error> {
        self.child_error.take()
    }
}

/// A request.
pub struct Node {
    pub handle: Handle,
    /// The flags children inherit.
    pub inherit: Flags,
    pub priority: Priority,
    /// The I/O state. Only the request's own execution locks this.
    pub io: Mutex<Io>,
    pub links: Mutex<Links>,
    /// The configuration token of the tree, if this is its root.
    pub token: Mutex<Option<ConfigToken>>,
    /// Signaled when the result is available to a waiter.
    pub done_cv: Condvar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations() {
        let arena = Arena::new();
        let a = arena.insert_with(|h| (h, 1));
        let handle = a.0;

        assert_eq!(arena.get(handle).unwrap().1, 1);
        assert_eq!(arena.len(), 1);
        assert!(arena.remove(handle).is_some());
        assert!(arena.remove(handle).is_none());

        // The slot is reused, but the old handle stays dead.
        let b = arena.insert_with(|h| (h, 2));
        assert_ne!(b.0, handle);
        assert!(arena.get(handle).is_none());
        assert_eq!(arena.get(b.0).unwrap().1, 2);
        assert_eq!(arena.len(), 1);
    }

    fn handles() -> (Handle, Handle) {
        let arena = Arena::new();
        (*arena.insert_with(|h| h), *arena.insert_with(|h| h))
    }

    #[test]
    fn resume_when_last_child_done() {
        let (a, b) = handles();
        let mut links = Links::default();
        links.add_child(a, true);
        links.add_child(b, true);

        assert!(links.stall_on(Milestone::Done));
        assert!(!links.child_reached(a, Milestone::Done, true, Some(err!(Io, "a"))));
        assert!(links.child_reached(b, Milestone::Done, true, Some(err!(Corruption, "b"))));

        assert!(links.children.is_empty());
        assert_eq!(links.take_child_error().unwrap().kind, ::Kind::Corruption);
        assert!(!links.stall_on(Milestone::Done));
    }

    #[test]
    fn wrong_milestone_does_not_resume() {
        let (a, _) = handles();
        let mut links = Links::default();
        links.add_child(a, true);

        assert!(links.stall_on(Milestone::Done));
        assert!(!links.child_reached(a, Milestone::Ready, true, None));
        assert_eq!(links.pending(Milestone::Ready), 0);
        assert_eq!(links.pending(Milestone::Done), 1);
    }

    #[test]
    fn late_children_skip_ready() {
        let (a, _) = handles();
        let mut links = Links::default();
        links.add_child(a, false);

        assert_eq!(links.pending(Milestone::Ready), 0);
        assert!(!links.child_reached(a, Milestone::Ready, false, None));
        assert_eq!(links.pending(Milestone::Done), 1);
    }

    #[test]
    #[should_panic]
    fn double_completion() {
        let (a, _) = handles();
        let mut links = Links::default();
        links.add_child(a, true);

        links.child_reached(a, Milestone::Done, true, None);
        links.child_reached(a, Milestone::Done, true, None);
    }
}
