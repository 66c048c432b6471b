use lockstep::{BlockingQueue, Error, Queue, Stack};
use similar_asserts::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::scope;

const PRODUCERS: usize = 5;
const CONSUMERS: usize = 5;
const PER_THREAD: usize = 10;

#[test]
fn test_stack_concurrent_pop() {
    let stack = Stack::new();

    for value in 0..100 {
        stack.push(value);
    }

    let popped = AtomicUsize::new(0);

    scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while stack.pop().is_ok() {
                    popped.fetch_add(1, Ordering::AcqRel);
                }
            });
        }
    });

    assert_eq!(popped.load(Ordering::Acquire), 100);
    assert_eq!(stack.pop(), Err(Error::Empty));
}

#[test]
fn test_stack_concurrent_push_and_pop_interleaved() {
    let stack = Stack::new();
    let started = AtomicUsize::new(0);
    let popped = AtomicUsize::new(0);
    let removed = scope(|s| {
        for producer in 0..PRODUCERS {
            let (stack, started) = (&stack, &started);

            s.spawn(move || {
                for value in 0..1000 {
                    started.fetch_add(1, Ordering::AcqRel);
                    stack.push(producer * 1000 + value);
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                s.spawn(|| {
                    let mut seen = Vec::new();

                    for _ in 0..1000 {
                        if let Ok(value) = stack.pop() {
                            let total = popped.fetch_add(1, Ordering::AcqRel);

                            // A value can't be popped before its push started.
                            assert!(total < started.load(Ordering::Acquire));
                            seen.push(value);
                        }
                    }

                    seen
                })
            })
            .collect();

        consumers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let mut all: HashSet<usize> = removed.iter().copied().collect();

    assert_eq!(all.len(), removed.len());
    assert!(removed.len() <= PRODUCERS * 1000);

    while let Ok(value) = stack.pop() {
        assert!(all.insert(value));
    }

    assert_eq!(all, (0..PRODUCERS * 1000).collect::<HashSet<_>>());
}

#[test]
fn test_stack_describe() {
    let mut stack = Stack::new();

    stack.push("a");
    stack.push("b");

    assert_eq!(stack.describe(), "b->a->null");
}

#[test]
fn test_queue_producers_and_consumers() {
    let queue: Queue<String> = Queue::new();
    let removed = scope(|s| {
        for producer in 0..PRODUCERS {
            let queue = &queue;

            s.spawn(move || {
                for value in 0..PER_THREAD {
                    queue.add_last(format!("{}-{}", producer, value)).unwrap();
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                s.spawn(|| {
                    let mut seen = Vec::new();

                    // Consumers may start before the producers, so they keep
                    // trying until they removed their share.
                    while seen.len() < PER_THREAD {
                        if let Some(value) = queue.remove_first() {
                            seen.push(value);
                        }
                    }

                    seen
                })
            })
            .collect();

        consumers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let unique: HashSet<_> = removed.iter().cloned().collect();

    assert_eq!(removed.len(), PRODUCERS * PER_THREAD);
    assert_eq!(unique.len(), PRODUCERS * PER_THREAD);
    assert_eq!(queue.remove_first(), None);
    assert_eq!(queue.len(), 0);
}

#[test]
fn test_queue_rejects_none() {
    let queue: Queue<String> = Queue::new();

    assert_eq!(
        queue.add_last(None),
        Err(Error::InvalidArgument("None can't be added to a queue"))
    );
    assert!(queue.is_empty());
}

#[test]
fn test_blocking_queue_producers_and_consumers() {
    let queue = BlockingQueue::new(3).unwrap();
    let removed = scope(|s| {
        for producer in 0..PRODUCERS {
            let queue = &queue;

            s.spawn(move || {
                for value in 0..PER_THREAD {
                    queue.push(producer * PER_THREAD + value);
                }
            });
        }

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                s.spawn(|| {
                    (0..PER_THREAD).map(|_| queue.pop()).collect::<Vec<_>>()
                })
            })
            .collect();

        consumers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let mut sorted = removed;

    sorted.sort();

    assert_eq!(sorted, (0..PRODUCERS * PER_THREAD).collect::<Vec<_>>());
    assert_eq!(queue.try_pop(), Err(Error::Empty));
}
