use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::{ManuallyDrop, MaybeUninit},
    ops::{Deref, DerefMut},
};

use libc::{
    pthread_mutex_destroy, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
    pthread_mutex_unlock, pthread_mutexattr_destroy, pthread_mutexattr_init,
    pthread_mutexattr_settype, PTHREAD_MUTEX_ERRORCHECK,
};
use tracing::error;

use crate::{CheckOk, Error, Result};

type RawMutex = UnsafeCell<MaybeUninit<pthread_mutex_t>>;

/// Error-checking pthread mutex guarding a value of type `T`.
///
/// The pthread object lives in its own heap allocation so moving the `Mutex`
/// never moves an initialized `pthread_mutex_t`.
#[derive(Debug)]
pub struct Mutex<T> {
    inner: ManuallyDrop<Box<RawMutex>>,
    live: bool,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Result<Self> {
        let inner: Box<RawMutex> = Box::new(UnsafeCell::new(MaybeUninit::uninit()));
        let mut attr = MaybeUninit::uninit();
        unsafe {
            pthread_mutexattr_init(attr.as_mut_ptr()).r("attr_init")?;

            let res = pthread_mutexattr_settype(attr.as_mut_ptr(), PTHREAD_MUTEX_ERRORCHECK)
                .r("attr_settype")
                .and_then(|()| {
                    pthread_mutex_init((*inner.get()).as_mut_ptr(), attr.as_ptr()).r("mutex_init")
                });

            pthread_mutexattr_destroy(attr.as_mut_ptr());
            res?;
        }

        Ok(Self {
            inner: ManuallyDrop::new(inner),
            live: true,
            data: UnsafeCell::new(data),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        assert!(self.live, "mutex used after destroy");
        unsafe {
            let code = pthread_mutex_lock(self.raw());
            if code != 0 {
                panic!("failed to lock mutex: code {code}");
            }
            MutexGuard {
                lock: self,
                data: &mut *self.data.get(),
                _not_send: PhantomData,
            }
        }
    }

    /// Access without locking; exclusive borrow rules out other holders.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Destroys the pthread mutex and frees its storage.
    ///
    /// When pthread reports the mutex as still referenced the storage is
    /// left allocated and the error is returned. Later calls are no-ops.
    pub(crate) fn release(&mut self) -> Result<()> {
        if !self.live {
            return Ok(());
        }
        self.live = false;

        let code = unsafe { pthread_mutex_destroy(self.raw()) };
        if code != 0 {
            return Err(Error::Teardown {
                primitive: "mutex",
                code,
            });
        }

        unsafe { ManuallyDrop::drop(&mut self.inner) };
        Ok(())
    }

    /// Gives up on the pthread mutex without destroying it. The storage leaks.
    pub(crate) fn abandon(&mut self) {
        self.live = false;
    }

    fn raw(&self) -> *mut pthread_mutex_t {
        unsafe { (*self.inner.get()).as_mut_ptr() }
    }
}

/// Must be dropped on the thread that locked: an error-checking mutex refuses
/// an unlock from any other thread, so the guard is `!Send`.
pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
    data: &'a mut T,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: 'a> MutexGuard<'a, T> {
    pub(crate) fn get_inner_lock(&self) -> *mut pthread_mutex_t {
        self.lock.raw()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        unsafe {
            let code = pthread_mutex_unlock(self.lock.raw());
            if code != 0 {
                panic!("failed to unlock mutex: code {code}");
            }
        }
    }
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(%err, "leaking mutex storage");
        }
    }
}
