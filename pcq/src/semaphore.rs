use tracing::{debug, error};

use crate::{
    sync::{Condvar, Mutex},
    Error, Result,
};

#[derive(Debug)]
struct State {
    count: usize,
    /// Threads currently parked in [`Semaphore::wait`].
    waiters: usize,
    closed: bool,
}

/// Counting semaphore built from a pthread mutex and condition variables.
///
/// Destruction is split in two phases. [`Semaphore::close`] rejects further
/// `post`/`wait` calls, wakes every parked waiter and blocks until all of them
/// have left. [`Semaphore::destroy`] (or dropping the semaphore) then tears
/// down the primitives; it consumes the semaphore, so no thread can still be
/// holding a reference into it.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
    drained: Condvar,
}

impl Semaphore {
    pub fn new(count: isize) -> Result<Self> {
        let count = usize::try_from(count).map_err(|_| Error::NegativeCount(count))?;

        Ok(Self {
            state: Mutex::new(State {
                count,
                waiters: 0,
                closed: false,
            })?,
            available: Condvar::new()?,
            drained: Condvar::new()?,
        })
    }

    /// Adds a permit and wakes one waiter. Never blocks.
    pub fn post(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        state.count = state.count.checked_add(1).ok_or(Error::Overflow)?;
        self.available.signal();
        Ok(())
    }

    /// Blocks until a permit is available and takes it.
    ///
    /// Returns [`Error::Closed`] when the semaphore is closed before or while
    /// waiting.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.waiters += 1;

        while state.count == 0 && !state.closed {
            state = self.available.wait(state);
        }

        state.waiters -= 1;
        if state.closed {
            if state.waiters == 0 {
                self.drained.broadcast();
            }
            return Err(Error::Closed);
        }

        state.count -= 1;
        Ok(())
    }

    /// Takes a permit if one is available, without blocking.
    pub fn try_wait(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        if state.count == 0 {
            return Ok(false);
        }

        state.count -= 1;
        Ok(true)
    }

    /// Snapshot of the number of available permits.
    pub fn value(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closes the semaphore and waits until no thread is parked in `wait`.
    ///
    /// Every waiter is woken and returns [`Error::Closed`]; later `post`,
    /// `wait` and `try_wait` calls fail the same way. Calling it again is a
    /// no-op apart from waiting for stragglers.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(
                waiters = state.waiters,
                count = state.count,
                "closing semaphore"
            );
            self.available.broadcast();
        }

        while state.waiters > 0 {
            state = self.drained.wait(state);
        }
    }

    /// Closes the semaphore, then destroys the condition variables, then
    /// the mutex.
    ///
    /// On failure nothing else is destroyed and the remaining storage is
    /// leaked instead of freed.
    pub fn destroy(mut self) -> Result<()> {
        self.close();
        self.teardown()
    }

    pub(crate) fn teardown(&mut self) -> Result<()> {
        let state = self.state.get_mut();
        debug_assert_eq!(state.waiters, 0);
        state.closed = true;

        let res = self
            .available
            .release()
            .and_then(|()| self.drained.release())
            .and_then(|()| self.state.release());

        if let Err(err) = &res {
            error!(%err, "semaphore destroy aborted, leaking its primitives");
            self.abandon();
        }
        res
    }

    pub(crate) fn abandon(&mut self) {
        self.available.abandon();
        self.drained.abandon();
        self.state.abandon();
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
