//! A lock-free first-in-first-out queue.
use crate::error::Error;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Node<T> {
    /// The value of this node.
    ///
    /// The sentinel node (the one `head` points to) never has a value: either
    /// it's the initial node, or its value was taken by the thread that turned
    /// it into the sentinel.
    value: UnsafeCell<Option<T>>,

    /// The next node in the queue.
    ///
    /// This pointer is written once (by the thread that appended the next
    /// node), after the new node is already visible through the tail. Readers
    /// must use acquire loads so that they observe the node's value once they
    /// observe the link.
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> Self {
        Node { value: UnsafeCell::new(value), next: Atomic::null() }
    }
}

/// A multi-producer multi-consumer queue that doesn't use locks.
///
/// The queue is a linked list that starts with a sentinel node. Appending
/// swaps the tail with the new node and then links the old tail to it, while
/// removing moves the head forward using a compare-and-swap.
///
/// Because appending takes two steps, there's a brief window in which the
/// tail points to a node that isn't yet reachable from the head. A consumer
/// that runs into this window treats the queue as empty, which is fine as the
/// append hasn't finished yet.
pub struct Queue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,

    /// The (approximate) number of values in the queue.
    ///
    /// This counter is incremented before a value is appended, and decremented
    /// after it's removed, meaning it may temporarily report more values than
    /// can be removed, but it never drops below zero.
    size: AtomicUsize,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    pub fn new() -> Self {
        let queue = Queue {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            size: AtomicUsize::new(0),
        };

        // Safety: nobody else has access to the queue at this point.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::new(None)).into_shared(guard);

            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }

        queue
    }

    /// Adds a value to the end of the queue.
    ///
    /// `None` is used by the sentinel node to signal the lack of a value, and
    /// thus can't be added to the queue. Trying to do so produces an
    /// `Error::InvalidArgument` and leaves the queue as-is.
    pub fn add_last<V: Into<Option<T>>>(
        &self,
        value: V,
    ) -> Result<(), Error> {
        let value = value
            .into()
            .ok_or(Error::InvalidArgument("None can't be added to a queue"))?;

        let guard = epoch::pin();
        let node = Owned::new(Node::new(Some(value))).into_shared(&guard);

        self.size.fetch_add(1, Ordering::AcqRel);

        let prev = self.tail.swap(node, Ordering::AcqRel, &guard);

        // Safety: the previous tail can't have been released yet, as that
        // requires the head to move past it, which in turn requires the link
        // we're about to set.
        unsafe { prev.deref() }.next.store(node, Ordering::Release);
        Ok(())
    }

    /// Removes and returns the value at the front of the queue.
    ///
    /// If the queue is empty a `None` is returned. This method never blocks.
    pub fn remove_first(&self) -> Option<T> {
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);

            // Safety: the head is never NULL, and can't be released while
            // we're pinned.
            let next =
                unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);
            let next_ref = unsafe { next.as_ref() }?;

            if self
                .head
                .compare_exchange(
                    head,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                )
                .is_ok()
            {
                // Safety: the node we moved the head to is now the sentinel,
                // and we're the only thread that moved it there, so we're the
                // only one that touches its value.
                let value = unsafe { (*next_ref.value.get()).take() };

                unsafe { guard.defer_destroy(head) };
                self.size.fetch_sub(1, Ordering::AcqRel);
                return value;
            }
        }
    }

    /// Returns the approximate number of values in the queue.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Returns `true` if no value can be removed from the queue at this
    /// moment.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);

        unsafe { head.deref() }.next.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Safety: we have exclusive access to the queue, and removed nodes are
        // no longer reachable from the head.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);

            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);

                drop(current.into_owned());
                current = next;
            }
        }
    }
}
