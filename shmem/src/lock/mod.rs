//! Write-preferring reader/writer lock whose whole state lives in shared memory.
//!
//! The lock is one process-shared pthread mutex, two process-shared condition
//! variables and four counters. Every process that maps the segment observes and
//! mutates the same counters, so the protocol works across address spaces:
//!
//! * `read_lock` waits while a writer is active *or waiting*; readers that show up
//!   after a writer started waiting never overtake it.
//! * `read_unlock` wakes all waiting writers.
//! * `write_lock` waits while any reader or writer is active.
//! * `write_unlock` hands the lock to one waiting writer, or else to every waiting
//!   reader.
//!
//! A process that dies while holding the lock leaves it held forever. There is no
//! owner tracking and no forced recovery.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

use raw_sync::Timeout;
use tracing::{error, trace, warn};

use crate::errors::{Result, ShmemLibError};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const LOCK_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const LOCK_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Counters of the lock protocol. Only read or written with the inner mutex held.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    pub active_readers: u32,
    pub waiting_readers: u32,
    pub active_writers: u32,
    pub waiting_writers: u32,
}

/// The lock as laid out inside the segment. Never moved once initialized.
#[repr(C)]
pub struct RwLockState {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    readers: UnsafeCell<libc::pthread_cond_t>,
    writers: UnsafeCell<libc::pthread_cond_t>,
    counters: UnsafeCell<LockStats>,
}

// All interior state is guarded by the process-shared mutex.
unsafe impl Send for RwLockState {}
unsafe impl Sync for RwLockState {}

impl RwLockState {
    /// Initializes the primitives with `PTHREAD_PROCESS_SHARED` and zeroes the counters.
    ///
    /// # Safety
    ///
    /// `state` must point to writable memory of `size_of::<RwLockState>()` bytes that
    /// stays at the same address for as long as anyone uses the lock. It must be called
    /// exactly once, before any other process or thread can reach the lock.
    pub unsafe fn init(state: *mut RwLockState) -> Result<()> {
        let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        ShmemLibError::check(
            "pthread_mutexattr_init",
            libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr()),
        )?;
        let mutex_res = ShmemLibError::check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(mutex_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
        )
        .and_then(|_| {
            ShmemLibError::check(
                "pthread_mutex_init",
                libc::pthread_mutex_init((*state).mutex.get(), mutex_attr.as_ptr()),
            )
        });
        with_attr_destroyed(
            mutex_res,
            "pthread_mutexattr_destroy",
            libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr()),
        )?;

        init_cond((*state).readers.get())?;
        init_cond((*state).writers.get())?;
        (*state).counters.get().write(LockStats::default());
        Ok(())
    }

    /// Blocks until the lock is held in shared mode.
    pub fn read_lock(&self) -> Result<()> {
        self.acquire_read(&Timeout::Infinite)
    }

    /// Like [`read_lock`](Self::read_lock) but gives up with `Timeout` after `wait`.
    pub fn read_lock_timeout(&self, wait: Duration) -> Result<()> {
        self.acquire_read(&Timeout::Val(wait))
    }

    pub fn read_unlock(&self) -> Result<()> {
        self.locked(|c| unsafe {
            if (*c).active_readers == 0 {
                return Err(ShmemLibError::ProtocolMisuse(
                    "read_unlock without a held read lock".to_string(),
                ));
            }
            (*c).active_readers -= 1;
            if (*c).waiting_writers > 0 {
                self.broadcast(self.writers.get())?;
            }
            Ok(())
        })
    }

    /// Blocks until the lock is held exclusively.
    pub fn write_lock(&self) -> Result<()> {
        self.acquire_write(&Timeout::Infinite)
    }

    /// Like [`write_lock`](Self::write_lock) but gives up with `Timeout` after `wait`.
    pub fn write_lock_timeout(&self, wait: Duration) -> Result<()> {
        self.acquire_write(&Timeout::Val(wait))
    }

    pub fn write_unlock(&self) -> Result<()> {
        self.locked(|c| unsafe {
            if (*c).active_writers == 0 {
                return Err(ShmemLibError::ProtocolMisuse(
                    "write_unlock without a held write lock".to_string(),
                ));
            }
            (*c).active_writers -= 1;
            if (*c).waiting_writers > 0 {
                self.signal(self.writers.get())?;
            } else if (*c).waiting_readers > 0 {
                self.broadcast(self.readers.get())?;
            }
            Ok(())
        })
    }

    /// Acquires in shared mode and returns a guard that releases on `release` or drop.
    pub fn read(&self, timeout: &Timeout) -> Result<ReadGuard<'_>> {
        self.acquire_read(timeout)?;
        Ok(ReadGuard {
            lock: self,
            released: false,
        })
    }

    /// Acquires exclusively and returns a guard that releases on `release` or drop.
    pub fn write(&self, timeout: &Timeout) -> Result<WriteGuard<'_>> {
        self.acquire_write(timeout)?;
        Ok(WriteGuard {
            lock: self,
            released: false,
        })
    }

    /// A consistent copy of the four counters.
    pub fn stats(&self) -> Result<LockStats> {
        self.locked(|c| Ok(unsafe { *c }))
    }

    fn acquire_read(&self, timeout: &Timeout) -> Result<()> {
        let deadline = deadline_for(timeout)?;
        self.locked(|c| unsafe {
            let blocked = |c: *mut LockStats| (*c).active_writers > 0 || (*c).waiting_writers > 0;
            if blocked(c) {
                (*c).waiting_readers += 1;
                while blocked(c) {
                    let woke = match self.wait(self.readers.get(), deadline.as_ref()) {
                        Ok(woke) => woke,
                        Err(e) => {
                            (*c).waiting_readers -= 1;
                            return Err(e);
                        }
                    };
                    if !woke && blocked(c) {
                        (*c).waiting_readers -= 1;
                        return Err(timed_out(timeout));
                    }
                }
                (*c).waiting_readers -= 1;
            }
            (*c).active_readers += 1;
            trace!(active_readers = (*c).active_readers, "read lock acquired");
            Ok(())
        })
    }

    fn acquire_write(&self, timeout: &Timeout) -> Result<()> {
        let deadline = deadline_for(timeout)?;
        self.locked(|c| unsafe {
            let blocked = |c: *mut LockStats| (*c).active_readers > 0 || (*c).active_writers > 0;
            if blocked(c) {
                (*c).waiting_writers += 1;
                while blocked(c) {
                    let woke = match self.wait(self.writers.get(), deadline.as_ref()) {
                        Ok(woke) => woke,
                        Err(e) => {
                            (*c).waiting_writers -= 1;
                            self.after_writer_gave_up(c)?;
                            return Err(e);
                        }
                    };
                    if !woke && blocked(c) {
                        (*c).waiting_writers -= 1;
                        self.after_writer_gave_up(c)?;
                        return Err(timed_out(timeout));
                    }
                }
                (*c).waiting_writers -= 1;
            }
            (*c).active_writers += 1;
            trace!("write lock acquired");
            Ok(())
        })
    }

    /// A writer stopped waiting without taking the lock. Readers held back only by it
    /// must run again, and a wakeup it may have swallowed is passed on.
    unsafe fn after_writer_gave_up(&self, c: *mut LockStats) -> Result<()> {
        if (*c).active_writers > 0 {
            return Ok(());
        }
        if (*c).waiting_writers > 0 {
            if (*c).active_readers == 0 {
                self.signal(self.writers.get())?;
            }
        } else if (*c).waiting_readers > 0 {
            self.broadcast(self.readers.get())?;
        }
        Ok(())
    }

    /// Runs `f` with the inner mutex held. `f` may wait on either condition variable.
    fn locked<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(*mut LockStats) -> Result<R>,
    {
        unsafe {
            ShmemLibError::check("pthread_mutex_lock", libc::pthread_mutex_lock(self.mutex.get()))?;
            let result = f(self.counters.get());
            let unlocked = ShmemLibError::check(
                "pthread_mutex_unlock",
                libc::pthread_mutex_unlock(self.mutex.get()),
            );
            match (result, unlocked) {
                (Ok(v), Ok(())) => Ok(v),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), Ok(())) => Err(e),
                (Err(e), Err(unlock_err)) => {
                    error!(error = %unlock_err, "failed to release the lock mutex");
                    Err(e)
                }
            }
        }
    }

    /// Waits on `cond`. Returns `false` if the deadline passed first.
    unsafe fn wait(
        &self,
        cond: *mut libc::pthread_cond_t,
        deadline: Option<&libc::timespec>,
    ) -> Result<bool> {
        match deadline {
            None => {
                ShmemLibError::check(
                    "pthread_cond_wait",
                    libc::pthread_cond_wait(cond, self.mutex.get()),
                )?;
                Ok(true)
            }
            Some(at) => {
                let code = libc::pthread_cond_timedwait(cond, self.mutex.get(), at);
                if code == libc::ETIMEDOUT {
                    return Ok(false);
                }
                ShmemLibError::check("pthread_cond_timedwait", code)?;
                Ok(true)
            }
        }
    }

    unsafe fn signal(&self, cond: *mut libc::pthread_cond_t) -> Result<()> {
        ShmemLibError::check("pthread_cond_signal", libc::pthread_cond_signal(cond))
    }

    unsafe fn broadcast(&self, cond: *mut libc::pthread_cond_t) -> Result<()> {
        ShmemLibError::check("pthread_cond_broadcast", libc::pthread_cond_broadcast(cond))
    }
}

unsafe fn init_cond(cond: *mut libc::pthread_cond_t) -> Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    ShmemLibError::check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
    let res = ShmemLibError::check(
        "pthread_condattr_setpshared",
        libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
    )
    .and_then(|_| set_clock(attr.as_mut_ptr()))
    .and_then(|_| {
        ShmemLibError::check("pthread_cond_init", libc::pthread_cond_init(cond, attr.as_ptr()))
    });
    with_attr_destroyed(
        res,
        "pthread_condattr_destroy",
        libc::pthread_condattr_destroy(attr.as_mut_ptr()),
    )
}

/// Combines an init result with the return code of destroying its attribute object.
/// The init error wins; a destroy failure after it is only logged.
fn with_attr_destroyed(init: Result<()>, op: &'static str, code: libc::c_int) -> Result<()> {
    let destroyed = ShmemLibError::check(op, code);
    match (init, destroyed) {
        (Err(e), Err(d)) => {
            warn!(error = %d, "attribute cleanup failed after init error");
            Err(e)
        }
        (init, destroyed) => init.and(destroyed),
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
unsafe fn set_clock(attr: *mut libc::pthread_condattr_t) -> Result<()> {
    ShmemLibError::check(
        "pthread_condattr_setclock",
        libc::pthread_condattr_setclock(attr, LOCK_CLOCK),
    )
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
unsafe fn set_clock(_attr: *mut libc::pthread_condattr_t) -> Result<()> {
    Ok(())
}

/// Absolute deadline on the condition variables' clock, `None` for `Infinite`.
fn deadline_for(timeout: &Timeout) -> Result<Option<libc::timespec>> {
    let wait = match timeout {
        Timeout::Infinite => return Ok(None),
        Timeout::Val(wait) => *wait,
    };
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(LOCK_CLOCK, now.as_mut_ptr()) } != 0 {
        return Err(ShmemLibError::Lock {
            op: "clock_gettime",
            source: io::Error::last_os_error(),
        });
    }
    let mut at = unsafe { now.assume_init() };
    let nanos = at.tv_nsec as u64 + u64::from(wait.subsec_nanos());
    let secs = (at.tv_sec as u64)
        .saturating_add(wait.as_secs())
        .saturating_add(nanos / NANOS_PER_SEC)
        .min(libc::time_t::MAX as u64);
    at.tv_sec = secs as libc::time_t;
    at.tv_nsec = (nanos % NANOS_PER_SEC) as _;
    Ok(Some(at))
}

fn timed_out(timeout: &Timeout) -> ShmemLibError {
    let wait = match timeout {
        Timeout::Val(wait) => *wait,
        Timeout::Infinite => Duration::MAX,
    };
    warn!(?wait, "gave up waiting for the ring lock");
    ShmemLibError::Timeout(wait)
}

/// Shared hold on a [`RwLockState`].
#[must_use = "dropping the guard releases the lock immediately"]
pub struct ReadGuard<'a> {
    lock: &'a RwLockState,
    released: bool,
}

impl ReadGuard<'_> {
    /// Releases the lock, reporting a failed unlock instead of swallowing it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.read_unlock()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.read_unlock() {
                error!(error = %e, "failed to release read lock");
            }
        }
    }
}

/// Exclusive hold on a [`RwLockState`].
#[must_use = "dropping the guard releases the lock immediately"]
pub struct WriteGuard<'a> {
    lock: &'a RwLockState,
    released: bool,
}

impl WriteGuard<'_> {
    /// Releases the lock, reporting a failed unlock instead of swallowing it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.write_unlock()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.write_unlock() {
                error!(error = %e, "failed to release write lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn new_lock() -> Result<Arc<RwLockState>> {
        // Pthread objects must not move after init, so initialize in the final allocation.
        let mut lock = Arc::new(unsafe { std::mem::zeroed::<RwLockState>() });
        let state = Arc::get_mut(&mut lock).expect("fresh Arc is unique");
        unsafe { RwLockState::init(state)? };
        Ok(lock)
    }

    fn wait_for<F: Fn(&LockStats) -> bool>(lock: &RwLockState, f: F) -> Result<()> {
        let start = Instant::now();
        loop {
            if f(&lock.stats()?) {
                return Ok(());
            }
            assert!(start.elapsed() < Duration::from_secs(10), "lock never reached the state");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn attr_destroy_failure_is_reported() {
        assert!(with_attr_destroyed(Ok(()), "pthread_condattr_destroy", 0).is_ok());
        match with_attr_destroyed(Ok(()), "pthread_condattr_destroy", libc::EINVAL) {
            Err(ShmemLibError::Lock { op, source }) => {
                assert_eq!(op, "pthread_condattr_destroy");
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("unexpected {:?}", other),
        }
        let init = Err(ShmemLibError::ProtocolMisuse("init".to_string()));
        assert!(matches!(
            with_attr_destroyed(init, "pthread_mutexattr_destroy", libc::EINVAL),
            Err(ShmemLibError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn readers_share_the_lock() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        lock.read_lock()?;
        lock.read_lock_timeout(Duration::from_millis(50))?;
        assert_eq!(lock.stats()?.active_readers, 2);
        lock.read_unlock()?;
        lock.read_unlock()?;
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }

    #[test]
    fn writer_excludes_readers_and_writers() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        lock.write_lock()?;
        assert!(matches!(
            lock.read_lock_timeout(Duration::from_millis(20)),
            Err(ShmemLibError::Timeout(_))
        ));
        assert!(matches!(
            lock.write_lock_timeout(Duration::from_millis(20)),
            Err(ShmemLibError::Timeout(_))
        ));
        let stats = lock.stats()?;
        assert_eq!(stats.active_writers, 1);
        assert_eq!(stats.waiting_readers, 0);
        assert_eq!(stats.waiting_writers, 0);
        lock.write_unlock()?;
        lock.read_lock()?;
        lock.read_unlock()?;
        Ok(())
    }

    #[test]
    fn unlock_without_lock_is_misuse() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        assert!(matches!(lock.read_unlock(), Err(ShmemLibError::ProtocolMisuse(_))));
        assert!(matches!(lock.write_unlock(), Err(ShmemLibError::ProtocolMisuse(_))));
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }

    #[test]
    fn waiting_writer_blocks_new_readers() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        lock.read_lock()?;

        let writer_done = Arc::new(AtomicBool::new(false));
        let writer = thread::spawn({
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            move || -> Result<()> {
                lock.write_lock()?;
                writer_done.store(true, Ordering::SeqCst);
                lock.write_unlock()
            }
        });
        wait_for(&lock, |s| s.waiting_writers == 1)?;

        // A reader arriving after the writer queued must not overtake it.
        assert!(matches!(
            lock.read_lock_timeout(Duration::from_millis(50)),
            Err(ShmemLibError::Timeout(_))
        ));
        assert!(!writer_done.load(Ordering::SeqCst));

        let late_reader = thread::spawn({
            let lock = Arc::clone(&lock);
            let writer_done = Arc::clone(&writer_done);
            move || -> Result<bool> {
                lock.read_lock()?;
                let saw_writer = writer_done.load(Ordering::SeqCst);
                lock.read_unlock()?;
                Ok(saw_writer)
            }
        });
        wait_for(&lock, |s| s.waiting_readers == 1)?;

        lock.read_unlock()?;
        writer.join().expect("writer panicked")?;
        assert!(late_reader.join().expect("reader panicked")?);
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }

    #[test]
    fn timed_out_writer_releases_held_back_readers() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        lock.read_lock()?;

        let writer = thread::spawn({
            let lock = Arc::clone(&lock);
            move || lock.write_lock_timeout(Duration::from_secs(2))
        });
        wait_for(&lock, |s| s.waiting_writers == 1)?;

        let reader = thread::spawn({
            let lock = Arc::clone(&lock);
            move || -> Result<()> {
                lock.read_lock()?;
                lock.read_unlock()
            }
        });
        wait_for(&lock, |s| s.waiting_readers == 1)?;

        assert!(matches!(
            writer.join().expect("writer panicked"),
            Err(ShmemLibError::Timeout(_))
        ));
        reader.join().expect("reader panicked")?;
        lock.read_unlock()?;
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }

    #[test]
    fn guards_release_on_drop() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        {
            let _guard = lock.write(&Timeout::Infinite)?;
            assert_eq!(lock.stats()?.active_writers, 1);
        }
        let guard = lock.read(&Timeout::Val(Duration::from_millis(10)))?;
        assert_eq!(lock.stats()?.active_readers, 1);
        guard.release()?;
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }

    #[test]
    fn writers_serialize() -> std::result::Result<(), Box<dyn Error>> {
        let lock = new_lock()?;
        let inside = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || -> Result<()> {
                    for _ in 0..200 {
                        let guard = lock.write(&Timeout::Infinite)?;
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        inside.store(false, Ordering::SeqCst);
                        guard.release()?;
                    }
                    Ok(())
                })
            })
            .collect();
        for h in handles {
            h.join().expect("writer panicked")?;
        }
        assert_eq!(lock.stats()?, LockStats::default());
        Ok(())
    }
}
