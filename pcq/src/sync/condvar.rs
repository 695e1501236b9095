use std::{
    cell::UnsafeCell,
    mem::{ManuallyDrop, MaybeUninit},
    ptr::null,
};

use libc::{
    pthread_cond_broadcast, pthread_cond_destroy, pthread_cond_init, pthread_cond_signal,
    pthread_cond_t, pthread_cond_wait,
};
use tracing::error;

use crate::{CheckOk, Error, Result};

use super::MutexGuard;

type RawCondvar = UnsafeCell<MaybeUninit<pthread_cond_t>>;

#[derive(Debug)]
pub struct Condvar {
    inner: ManuallyDrop<Box<RawCondvar>>,
    live: bool,
}

impl Condvar {
    pub fn new() -> Result<Self> {
        let inner: Box<RawCondvar> = Box::new(UnsafeCell::new(MaybeUninit::uninit()));
        unsafe {
            pthread_cond_init((*inner.get()).as_mut_ptr(), null()).r("cond_init")?;
        }

        Ok(Self {
            inner: ManuallyDrop::new(inner),
            live: true,
        })
    }

    pub fn signal(&self) {
        unsafe {
            let code = pthread_cond_signal(self.raw());
            if code != 0 {
                panic!("failed to signal condvar: code {code}");
            }
        }
    }

    pub fn broadcast(&self) {
        unsafe {
            let code = pthread_cond_broadcast(self.raw());
            if code != 0 {
                panic!("failed to broadcast condvar: code {code}");
            }
        }
    }

    /// Atomically unlocks `guard` and sleeps. May return spuriously, so
    /// callers re-check their predicate.
    pub fn wait<'m, T>(&self, guard: MutexGuard<'m, T>) -> MutexGuard<'m, T> {
        unsafe {
            let code = pthread_cond_wait(self.raw(), guard.get_inner_lock());
            if code != 0 {
                panic!("failed to wait on condvar: code {code}");
            }
        }
        guard
    }

    /// See [`super::Mutex::release`].
    pub(crate) fn release(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        let code = unsafe { pthread_cond_destroy(self.raw()) };
        self.live = false;
        if code != 0 {
            return Err(Error::Teardown {
                primitive: "condvar",
                code,
            });
        }

        unsafe { ManuallyDrop::drop(&mut self.inner) };
        Ok(())
    }

    pub(crate) fn abandon(&mut self) {
        self.live = false;
    }

    fn raw(&self) -> *mut pthread_cond_t {
        assert!(self.live, "condvar used after destroy");
        unsafe { (*self.inner.get()).as_mut_ptr() }
    }
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Drop for Condvar {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(%err, "leaking condvar storage");
        }
    }
}
