//! A lock-free stack of values.
use crate::error::Error;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::fmt::{Display, Write};
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

struct Node<T> {
    /// The value stored in this node.
    ///
    /// This value is moved out of the node by whichever thread manages to pop
    /// it, after which the node itself is destroyed without dropping the
    /// value a second time.
    value: ManuallyDrop<T>,

    /// The node below this node, or NULL if this is the last node.
    next: Atomic<Node<T>>,
}

/// A last-in-first-out stack that can be shared between threads without the
/// use of locks.
///
/// Every mutation is a compare-and-swap of the head pointer. If another thread
/// changed the head in between us reading and swapping it, we just try again.
///
/// Popped nodes aren't released right away, as other threads may still be
/// reading them. Instead we defer releasing them until no thread can observe
/// them any more, using crossbeam's epoch based garbage collection. This also
/// means the address of a node can't be reused while a thread still holds on
/// to it, so comparing pointers can't produce false positives (the ABA
/// problem).
pub struct Stack<T> {
    head: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Stack { head: Atomic::null() }
    }

    pub fn push(&self, value: T) {
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        });
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);

            node.next.store(head, Ordering::Relaxed);

            match self.head.compare_exchange(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
                &guard,
            ) {
                Ok(_) => return,
                Err(err) => node = err.new,
            }
        }
    }

    /// Removes and returns the most recently pushed value.
    ///
    /// If the stack is empty at the time of the call, an `Error::Empty` is
    /// returned. This method never blocks.
    pub fn pop(&self) -> Result<T, Error> {
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Ordering::Acquire, &guard);

            // Safety: the node can't be released while we're pinned.
            let Some(node) = (unsafe { head.as_ref() }) else {
                return Err(Error::Empty);
            };

            let next = node.next.load(Ordering::Relaxed, &guard);

            if self
                .head
                .compare_exchange(
                    head,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                    &guard,
                )
                .is_ok()
            {
                // Safety: we won the race for this node, so no other thread
                // will read its value. The node is only released once all
                // threads pinned at this point are unpinned.
                unsafe {
                    let value =
                        ManuallyDrop::into_inner(ptr::read(&node.value));

                    guard.defer_destroy(head);
                    return Ok(value);
                }
            }
        }
    }

    /// Returns `true` if the stack is empty.
    ///
    /// The result may be outdated by the time this method returns.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();

        self.head.load(Ordering::Acquire, &guard).is_null()
    }

    /// Returns a description of the values in the stack, starting with the
    /// most recently pushed value (e.g. `3->2->1->null`).
    ///
    /// Values may be popped (and dropped) by other threads at any time, so
    /// describing them requires exclusive access to the stack.
    pub fn describe(&mut self) -> String
    where
        T: Display,
    {
        let mut buffer = String::new();

        // Safety: we have exclusive access, so no node can be popped or
        // released while we're iterating.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);

            while let Some(node) = current.as_ref() {
                let _ = write!(buffer, "{}->", *node.value);

                current = node.next.load(Ordering::Relaxed, guard);
            }
        }

        buffer.push_str("null");
        buffer
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        while self.pop().is_ok() {}
    }
}
