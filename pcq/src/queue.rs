use std::{fmt, mem};

use tracing::{debug, error};

use crate::{sync::Mutex, Error, Result, Semaphore};

#[derive(Debug)]
struct Ring<T> {
    buffer: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    len: usize,
}

/// Fixed-capacity blocking FIFO shared between producer and consumer threads.
///
/// `free` counts empty slots and `filled` counts occupied ones; the mutex
/// only covers the ring indices and the buffer. Every operation takes its
/// semaphore permit before the mutex and posts the other semaphore after
/// releasing it.
#[derive(Debug)]
pub struct Queue<T> {
    slots: Mutex<Ring<T>>,
    free: Semaphore,
    filled: Semaphore,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        let permits = isize::try_from(capacity).map_err(|_| Error::CapacityOverflow(capacity))?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|source| Error::Alloc {
                slots: capacity,
                source,
            })?;
        buffer.resize_with(capacity, || None);

        let free = Semaphore::new(permits)?;
        let filled = Semaphore::new(0)?;
        let slots = Mutex::new(Ring {
            buffer: buffer.into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        })?;

        debug!(capacity, "created queue");
        Ok(Self {
            slots,
            free,
            filled,
            capacity,
        })
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// On a closed queue the item is handed back in the error.
    pub fn insert(&self, item: T) -> Result<(), InsertError<T>> {
        if self.free.wait().is_err() {
            return Err(InsertError(item));
        }

        {
            let mut ring = self.slots.lock();
            let tail = ring.tail;
            debug_assert!(ring.buffer[tail].is_none(), "slot {tail} overwritten");
            ring.buffer[tail] = Some(item);
            ring.tail = (tail + 1) % self.capacity;
            ring.len += 1;
        }

        if let Err(err) = self.filled.post() {
            debug!(%err, "queue closed during insert, item stays buffered");
        }
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty.
    pub fn retrieve(&self) -> Result<T> {
        self.filled.wait()?;
        Ok(self.take())
    }

    /// Removes the oldest item if there is one, without blocking.
    pub fn try_retrieve(&self) -> Result<Option<T>> {
        if !self.filled.try_wait()? {
            return Ok(None);
        }
        Ok(Some(self.take()))
    }

    fn take(&self) -> T {
        let item = {
            let mut ring = self.slots.lock();
            let head = ring.head;
            let item = ring.buffer[head]
                .take()
                .expect("filled permit without a buffered item");
            ring.head = (head + 1) % self.capacity;
            ring.len -= 1;
            item
        };

        if let Err(err) = self.free.post() {
            debug!(%err, "queue closed during retrieve");
        }
        item
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.free.is_closed() || self.filled.is_closed()
    }

    /// Wakes every thread blocked in `insert` or `retrieve` and waits until
    /// they have left. Both fail from now on; buffered items stay until the
    /// queue is destroyed.
    pub fn close(&self) {
        debug!(len = self.len(), "closing queue");
        self.free.close();
        self.filled.close();
    }

    /// Destroys both semaphores and the mutex, then frees the buffer along
    /// with any undelivered items.
    ///
    /// If a primitive cannot be destroyed, the error is returned and the
    /// buffer is leaked rather than freed.
    pub fn destroy(mut self) -> Result<()> {
        self.close();
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let res = self
            .free
            .teardown()
            .and_then(|()| self.filled.teardown())
            .and_then(|()| self.slots.release());

        if let Err(err) = &res {
            error!(%err, "queue destroy aborted, leaking its buffer");
            self.free.abandon();
            self.filled.abandon();
            self.slots.abandon();
            mem::forget(mem::take(&mut self.slots.get_mut().buffer));
        }
        res
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Returned by [`Queue::insert`] on a closed queue, carrying the rejected item.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct InsertError<T>(pub T);

impl<T> InsertError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for InsertError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InsertError { .. }")
    }
}

impl<T> fmt::Display for InsertError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("inserting into a closed queue")
    }
}

impl<T> std::error::Error for InsertError<T> {}

#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::Queue;
    use crate::Error;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(Queue::<u32>::new(0), Err(Error::ZeroCapacity)));
        assert!(matches!(
            Queue::<()>::new(usize::MAX),
            Err(Error::CapacityOverflow(usize::MAX))
        ));
    }

    #[test]
    fn rejects_unallocatable_capacity() {
        let res = Queue::<u64>::new(isize::MAX as usize);
        let Err(Error::Alloc { slots, .. }) = res else {
            panic!("reserving isize::MAX slots must fail");
        };
        assert_eq!(slots, isize::MAX as usize);
    }

    #[test]
    fn basic() {
        let q = Queue::new(4).unwrap();
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 4);

        q.insert("hello").unwrap();
        q.insert("world").unwrap();
        assert_eq!(q.len(), 2);

        assert_eq!(q.retrieve().unwrap(), "hello");
        assert_eq!(q.try_retrieve().unwrap(), Some("world"));
        assert_eq!(q.try_retrieve().unwrap(), None);

        q.destroy().unwrap();
    }

    #[test]
    fn wraps_around() {
        let q = Queue::new(3).unwrap();
        for round in 0..10 {
            q.insert(round * 2).unwrap();
            q.insert(round * 2 + 1).unwrap();
            assert_eq!(q.retrieve().unwrap(), round * 2);
            assert_eq!(q.retrieve().unwrap(), round * 2 + 1);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn insert_blocks_when_full() {
        let q = Queue::new(2).unwrap();
        let inserted = AtomicBool::new(false);

        q.insert('A').unwrap();
        q.insert('B').unwrap();

        thread::scope(|s| {
            let producer = s.spawn(|| {
                q.insert('C').unwrap();
                inserted.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!inserted.load(Ordering::SeqCst));
            assert_eq!(q.len(), 2);

            assert_eq!(q.retrieve().unwrap(), 'A');
            producer.join().unwrap();
        });

        assert!(inserted.load(Ordering::SeqCst));
        assert_eq!(q.retrieve().unwrap(), 'B');
        assert_eq!(q.retrieve().unwrap(), 'C');
    }

    #[test]
    fn retrieve_blocks_when_empty() {
        let q = Queue::new(1).unwrap();
        let retrieved = AtomicBool::new(false);

        thread::scope(|s| {
            let consumer = s.spawn(|| {
                let item = q.retrieve().unwrap();
                retrieved.store(true, Ordering::SeqCst);
                item
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!retrieved.load(Ordering::SeqCst));

            q.insert(42).unwrap();
            assert_eq!(consumer.join().unwrap(), 42);
        });
    }

    #[test]
    fn fifo_single_producer_single_consumer() {
        const ITEMS: usize = 10_000;
        let q = Queue::new(8).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..ITEMS {
                    q.insert(Box::new(i)).unwrap();
                }
            });

            for expected in 0..ITEMS {
                assert_eq!(*q.retrieve().unwrap(), expected);
            }
        });
    }

    #[test]
    fn many_producers_many_consumers() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 3;
        const ITEMS: usize = 2_000;

        let q = Queue::new(5).unwrap();

        let received = thread::scope(|s| {
            for p in 0..PRODUCERS {
                let q = &q;
                s.spawn(move || {
                    for i in 0..ITEMS {
                        q.insert((p, i)).unwrap();
                    }
                });
            }

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|c| {
                    let q = &q;
                    s.spawn(move || {
                        let share = PRODUCERS * ITEMS / CONSUMERS
                            + usize::from(c < PRODUCERS * ITEMS % CONSUMERS);
                        (0..share).map(|_| q.retrieve().unwrap()).collect::<Vec<_>>()
                    })
                })
                .collect();

            consumers
                .into_iter()
                .map(|c| c.join().unwrap())
                .collect::<Vec<_>>()
        });

        let mut seen = HashMap::new();
        for items in &received {
            // a single consumer still sees each producer in order
            let mut last: HashMap<usize, usize> = HashMap::new();
            for &(p, i) in items {
                if let Some(prev) = last.insert(p, i) {
                    assert!(prev < i, "producer {p} reordered: {prev} before {i}");
                }
                *seen.entry((p, i)).or_insert(0) += 1;
            }
        }

        assert_eq!(seen.len(), PRODUCERS * ITEMS);
        assert!(seen.values().all(|&n| n == 1));
        assert!(q.is_empty());
    }

    #[test]
    fn close_releases_blocked_threads() {
        let q = Arc::new(Queue::new(1).unwrap());
        q.insert(0u8).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.insert(1))
        };
        let empty = Arc::new(Queue::<u8>::new(1).unwrap());
        let consumer = {
            let empty = empty.clone();
            thread::spawn(move || empty.retrieve())
        };

        thread::sleep(Duration::from_millis(50));
        q.close();
        empty.close();
        assert!(q.is_closed());

        assert_eq!(producer.join().unwrap().unwrap_err().into_inner(), 1);
        assert!(matches!(consumer.join().unwrap(), Err(Error::Closed)));
        assert!(matches!(q.insert(2), Err(e) if e.0 == 2));
        assert!(matches!(q.retrieve(), Err(Error::Closed)));

        Arc::try_unwrap(q).unwrap().destroy().unwrap();
        Arc::try_unwrap(empty).unwrap().destroy().unwrap();
    }

    struct Tracked<'a>(&'a AtomicUsize);

    impl Drop for Tracked<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn destroy_drops_undelivered_items() {
        let dropped = AtomicUsize::new(0);
        let q = Queue::new(4).unwrap();

        q.insert(Tracked(&dropped)).unwrap();
        q.insert(Tracked(&dropped)).unwrap();
        q.insert(Tracked(&dropped)).unwrap();
        drop(q.retrieve().unwrap());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        q.destroy().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }
}
