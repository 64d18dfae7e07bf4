//! Lock-free property publication from the API thread to the mixer
//!
//! Every mutable entity (context, listener, source/voice, effect slot)
//! owns a `PropsCell`: a single pending-update slot plus a free list of
//! recycled update nodes. The API thread is the only publisher and the
//! only consumer of the free list; the mixer is the only consumer of the
//! pending slot and only ever pushes to the free list. Neither side ever
//! blocks or allocates after the first few publishes of an entity.
//!
//! Ordering: the `Release` swap in [`PropsCell::publish`] pairs with the
//! `Acquire` swap in [`PropsCell::consume`], so a consumed snapshot is
//! always fully visible.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

struct Node<T> {
    next: *mut Node<T>,
    data: T,
}

/// Single-writer / single-reader update channel with node recycling
pub struct PropsCell<T> {
    /// Update published by the API thread, not yet applied by the mixer
    pending: AtomicPtr<Node<T>>,
    /// Recycled nodes; pushed by both sides, popped only by the writer
    free: AtomicPtr<Node<T>>,
    /// Test-and-set flag; cleared on every entity mutation
    clean: AtomicBool,
}

// The cell hands `T` across threads by pointer; that is safe exactly when
// `T` itself may move between threads.
unsafe impl<T: Send> Send for PropsCell<T> {}
unsafe impl<T: Send> Sync for PropsCell<T> {}

impl<T: Default> PropsCell<T> {
    pub fn new() -> Self {
        PropsCell {
            pending: AtomicPtr::new(ptr::null_mut()),
            free: AtomicPtr::new(ptr::null_mut()),
            clean: AtomicBool::new(true),
        }
    }

    /// Record that the entity was mutated and needs republishing
    pub fn mark_dirty(&self) {
        self.clean.store(false, Ordering::Release);
    }

    /// Test-and-set gate for publish sweeps
    ///
    /// Returns true when the entity was dirty; the caller is then
    /// responsible for publishing a fresh snapshot.
    pub fn try_set_clean(&self) -> bool {
        !self.clean.swap(true, Ordering::AcqRel)
    }

    /// Whether a mutation is awaiting publication
    pub fn is_dirty(&self) -> bool {
        !self.clean.load(Ordering::Acquire)
    }

    /// Publish a coherent snapshot (API thread only)
    ///
    /// Pops a recycled node (allocating only when the free list is
    /// empty), lets `fill` write the snapshot, and swaps it into the
    /// pending slot. An unconsumed previous update is recycled.
    pub fn publish(&self, fill: impl FnOnce(&mut T)) {
        let node = match self.pop_free() {
            Some(node) => node,
            None => Box::into_raw(Box::new(Node {
                next: ptr::null_mut(),
                data: T::default(),
            })),
        };
        // Safety: the node came off the free list or a fresh allocation;
        // no other thread can reach it until the swap below.
        unsafe {
            fill(&mut (*node).data);
            (*node).next = ptr::null_mut();
        }

        let old = self.pending.swap(node, Ordering::AcqRel);
        if !old.is_null() {
            self.push_free(old);
        }
    }

    /// Apply a pending snapshot if one exists (mixer thread only)
    ///
    /// `apply` receives the snapshot mutably so it can move resources
    /// (for example a replaced DSP state) *into* the node; whatever is
    /// left inside is dropped by the API thread when the node is reused
    /// or the cell is torn down, never on the mixer.
    pub fn consume(&self, apply: impl FnOnce(&mut T)) -> bool {
        let node = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
        if node.is_null() {
            return false;
        }
        // Safety: we own the node exclusively after the swap.
        unsafe {
            apply(&mut (*node).data);
        }
        self.push_free(node);
        true
    }

    /// Drop every recycled node, releasing whatever they still hold
    ///
    /// Called with the mixer stopped when recycled snapshots have gone
    /// stale (e.g. the send count changed and their arrays are the wrong
    /// size).
    pub fn purge_free(&self) {
        let mut head = self.free.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            // Safety: the chain was detached atomically; nodes on it are
            // unreachable from either thread.
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }

    fn push_free(&self, node: *mut Node<T>) {
        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            // Safety: we own `node` until the CAS succeeds.
            unsafe {
                (*node).next = head;
            }
            match self
                .free
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn pop_free(&self) -> Option<*mut Node<T>> {
        let mut head = self.free.load(Ordering::Acquire);
        while !head.is_null() {
            // Safety: nodes are only unlinked here, and only one thread
            // (the writer) pops, so `head` cannot be freed under us.
            let next = unsafe { (*head).next };
            match self
                .free
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(head),
                Err(actual) => head = actual,
            }
        }
        None
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        let mut count = 0;
        let mut head = self.free.load(Ordering::Acquire);
        while !head.is_null() {
            count += 1;
            head = unsafe { (*head).next };
        }
        count
    }
}

impl<T: Default> Default for PropsCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PropsCell<T> {
    fn drop(&mut self) {
        let pending = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
        if !pending.is_null() {
            // Safety: exclusive access in Drop.
            drop(unsafe { Box::from_raw(pending) });
        }
        let mut head = self.free.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_publish_then_consume() {
        let cell: PropsCell<i32> = PropsCell::new();
        cell.publish(|v| *v = 42);

        let mut seen = None;
        assert!(cell.consume(|v| seen = Some(*v)));
        assert_eq!(seen, Some(42));

        // Nothing pending afterwards.
        assert!(!cell.consume(|_| panic!("no update expected")));
    }

    #[test]
    fn test_unconsumed_update_is_replaced() {
        let cell: PropsCell<i32> = PropsCell::new();
        cell.publish(|v| *v = 1);
        cell.publish(|v| *v = 2);

        let mut seen = None;
        cell.consume(|v| seen = Some(*v));
        assert_eq!(seen, Some(2));
        // The displaced node went to the free list, not the mixer.
        assert!(!cell.consume(|_| unreachable!()));
    }

    #[test]
    fn test_nodes_are_recycled() {
        let cell: PropsCell<i32> = PropsCell::new();
        for i in 0..100 {
            cell.publish(|v| *v = i);
            cell.consume(|_| {});
        }
        // Steady-state publish/consume needs exactly one node.
        assert_eq!(cell.free_len(), 1);
    }

    #[test]
    fn test_clean_flag_gate() {
        let cell: PropsCell<i32> = PropsCell::new();
        assert!(!cell.try_set_clean());

        cell.mark_dirty();
        assert!(cell.is_dirty());
        assert!(cell.try_set_clean());
        assert!(!cell.try_set_clean());
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_purge_free_releases_nodes() {
        let cell: PropsCell<Vec<u8>> = PropsCell::new();
        cell.publish(|v| *v = vec![0; 16]);
        cell.consume(|_| {});
        assert_eq!(cell.free_len(), 1);
        cell.purge_free();
        assert_eq!(cell.free_len(), 0);
    }

    #[test]
    fn test_cross_thread_snapshot_visibility() {
        let cell: Arc<PropsCell<[u64; 4]>> = Arc::new(PropsCell::new());
        let reader = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                let mut last = [0u64; 4];
                for _ in 0..100_000 {
                    cell.consume(|v| last = *v);
                    // Every consumed snapshot must be internally coherent.
                    assert!(last.iter().all(|&x| x == last[0]));
                }
            })
        };

        for i in 0..50_000u64 {
            cell.publish(|v| *v = [i; 4]);
        }
        reader.join().unwrap();
    }
}
