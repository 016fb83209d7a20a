#![allow(unsafe_code)]
//! One wheel slot: an intrusive doubly-linked list of timeout records.
//!
//! Buckets are owned by the worker thread and are never touched from
//! anywhere else, so the list needs no synchronisation. A linked record is
//! kept alive by exactly one strong reference the bucket takes over in
//! [`push`](Bucket::push) (via `Arc::into_raw`) and gives back in
//! [`remove`](Bucket::remove).

use std::ptr::NonNull;
use std::sync::Arc;

use crate::timeout::{Placement, Timeout};

/// A FIFO of timeouts sharing one wheel position (modulo wheel length).
#[derive(Default)]
pub(crate) struct Bucket {
    head: Option<NonNull<Timeout>>,
    tail: Option<NonNull<Timeout>>,
}

// SAFETY: a bucket is only ever accessed by the worker thread; the raw
// pointers it stores refer to `Timeout`s, which are `Send`.
unsafe impl Send for Bucket {}

impl Bucket {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Appends a record at the tail, taking over its ownership.
    ///
    /// The record must not already be linked anywhere.
    pub(crate) fn push(&mut self, timeout: Arc<Timeout>, index: usize) {
        let node =
            NonNull::new(Arc::into_raw(timeout).cast_mut()).expect("Arc pointer is non-null");
        // SAFETY: the bucket now owns the record and only the worker
        // thread reaches this code.
        unsafe {
            let links = node.as_ref().links();
            debug_assert!(
                matches!(links.placement, Placement::Queued),
                "attempted to link an already-linked timeout"
            );
            links.placement = Placement::Linked(index);
            links.prev = self.tail;
            links.next = None;
        }
        match self.tail {
            // SAFETY: tail is a live linked record owned by this bucket.
            Some(tail) => unsafe { tail.as_ref().links().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    /// Unlinks `node`, returning its successor and the strong reference
    /// the bucket held. Decrements the owning timer's pending count.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked in this bucket.
    pub(crate) unsafe fn remove(
        &mut self,
        node: NonNull<Timeout>,
    ) -> (Option<NonNull<Timeout>>, Arc<Timeout>) {
        let (prev, next) = unsafe {
            let links = node.as_ref().links();
            (links.prev, links.next)
        };
        match prev {
            // SAFETY: neighbours of a linked node are linked nodes of the
            // same bucket.
            Some(prev) => unsafe { prev.as_ref().links().next = next },
            None => self.head = next,
        }
        match next {
            Some(next) => unsafe { next.as_ref().links().prev = prev },
            None => self.tail = prev,
        }
        unsafe {
            let links = node.as_ref().links();
            links.prev = None;
            links.next = None;
            links.placement = Placement::Gone;
        }
        // SAFETY: reclaims the strong reference taken in `push`.
        let timeout = unsafe { Arc::from_raw(node.as_ptr().cast_const()) };
        timeout.shared().decrement_pending();
        (next, timeout)
    }

    /// Walks the list for one tick.
    ///
    /// Records whose round count reached zero are unlinked and fired;
    /// cancelled records are unlinked and dropped; everything else has its
    /// round count decremented.
    ///
    /// # Panics
    ///
    /// Panics if a due record's deadline lies beyond `tick_deadline`,
    /// which would mean the transfer hashed it into the wrong slot. The
    /// worker treats that panic as fatal.
    pub(crate) fn expire(&mut self, tick_deadline: u64) {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: every node reachable from `head` is linked here and
            // kept alive by the bucket's reference.
            let record = unsafe { node.as_ref() };
            let (rounds, next) = unsafe {
                let links = record.links();
                (links.rounds, links.next)
            };
            if rounds <= 0 {
                // SAFETY: `node` is linked; we just read it off the list.
                let (successor, timeout) = unsafe { self.remove(node) };
                cursor = successor;
                assert!(
                    timeout.deadline() <= tick_deadline,
                    "timeout in wrong slot: deadline {} > tick deadline {}",
                    timeout.deadline(),
                    tick_deadline,
                );
                timeout.expire();
            } else if record.is_cancelled() {
                // SAFETY: as above.
                let (successor, _discarded) = unsafe { self.remove(node) };
                cursor = successor;
            } else {
                // SAFETY: worker-only link access.
                unsafe {
                    record.links().rounds -= 1;
                }
                cursor = next;
            }
        }
    }

    /// Drains the bucket, collecting records that neither fired nor were
    /// cancelled. Used during shutdown.
    pub(crate) fn clear_into(&mut self, unprocessed: &mut Vec<Arc<Timeout>>) {
        while let Some(node) = self.head {
            // SAFETY: the head of a non-empty bucket is linked here.
            let (_, timeout) = unsafe { self.remove(node) };
            if !timeout.is_expired() && !timeout.is_cancelled() {
                unprocessed.push(timeout);
            }
        }
    }
}
