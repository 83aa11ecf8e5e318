use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ::shared_memory::{Shmem, ShmemConf};
use once_cell::sync::OnceCell;
use raw_sync::Timeout;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::debug;

use crate::errors::{Result, ShmemLibError};
use crate::lock::{LockStats, RwLockState};

pub static DEFAULT_SHMEM_NAME: &str = "/shm_ring_buffer";
pub const DEFAULT_CAPACITY: usize = 100;

/// A value that can be moved between processes by copying its bytes.
///
/// # Safety
///
/// Implementors must be plain data: no pointers, references or handles into
/// per-process memory, and every bit pattern (all zeroes included) must be a valid
/// value. Every process attached to a segment must use the same type with the same
/// layout, so structs should be `#[repr(C)]`.
pub unsafe trait Record: Copy + Send + 'static {}

macro_rules! impl_record {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Record for $t {})*
    };
}

impl_record!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Record, const N: usize> Record for [T; N] {}

/// Control block at the start of the segment.
///
/// `begin == end` means empty, so at most `capacity - 1` records are live at once.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    // Zero until the owner finished initializing the segment.
    capacity: AtomicU64,
    begin: u64,
    end: u64,
}

impl Header {
    #[cfg(test)]
    pub(crate) fn new(capacity: usize) -> Header {
        Header {
            capacity: AtomicU64::new(capacity as u64),
            begin: 0,
            end: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        let capacity = self.capacity();
        (self.end() + capacity - self.begin()) % capacity
    }

    /// The slot after `index`, wrapping at capacity.
    #[inline]
    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    #[inline]
    pub(crate) fn set_begin(&mut self, index: usize) {
        self.begin = index as u64;
    }

    #[inline]
    pub(crate) fn set_end(&mut self, index: usize) {
        self.end = index as u64;
    }
}

#[inline]
const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Byte layout `[Header][RwLockState][capacity x T]` of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub lock_offset: usize,
    pub records_offset: usize,
    pub size: usize,
}

impl SegmentLayout {
    pub fn for_capacity<T: Record>(capacity: usize) -> Result<SegmentLayout> {
        if capacity == 0 {
            return Err(ShmemLibError::Capacity(capacity));
        }
        let lock_offset = align_up(size_of::<Header>(), align_of::<RwLockState>());
        let records_offset = align_up(lock_offset + size_of::<RwLockState>(), align_of::<T>());
        let size = size_of::<T>()
            .checked_mul(capacity)
            .and_then(|bytes| bytes.checked_add(records_offset))
            .filter(|size| *size <= isize::MAX as usize)
            .ok_or(ShmemLibError::Capacity(capacity))?;
        Ok(SegmentLayout {
            lock_offset,
            records_offset,
            size,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    /// Name cooperating processes use to find the segment.
    pub name: String,
    /// Number of record slots.
    pub capacity: usize,
    /// The owner creates and initializes the segment; everyone else attaches.
    pub owner: bool,
    /// Refuse new lock acquisitions once SIGHUP, SIGINT, SIGQUIT or SIGTERM arrives.
    pub handle_signals: bool,
}

impl Default for ShmemConfig {
    fn default() -> ShmemConfig {
        ShmemConfig {
            name: DEFAULT_SHMEM_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            owner: false,
            handle_signals: false,
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder::default()
    }

    pub fn from_toml_str(s: &str) -> Result<ShmemConfig> {
        let cfg: ShmemConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ShmemConfig> {
        ShmemConfig::from_toml_str(&fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<()> {
        let bare = self.name.strip_prefix('/').unwrap_or(&self.name);
        if bare.is_empty() {
            return Err(ShmemLibError::Config("segment name must not be empty".to_string()));
        }
        if bare.contains('/') {
            return Err(ShmemLibError::Config(format!(
                "segment name {:?} may only contain a leading '/'",
                self.name
            )));
        }
        if self.capacity == 0 {
            return Err(ShmemLibError::Capacity(self.capacity));
        }
        Ok(())
    }

    /// The identifier handed to `shm_open`, always with one leading '/'.
    fn os_id(&self) -> String {
        os_id(&self.name)
    }
}

#[derive(Default)]
pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.name = name.into();
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.cfg.capacity = capacity;
        self
    }

    pub fn owner(mut self, owner: bool) -> Self {
        self.cfg.owner = owner;
        self
    }

    pub fn handle_signals(mut self, handle_signals: bool) -> Self {
        self.cfg.handle_signals = handle_signals;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

fn os_id(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

static CLOSING: OnceCell<Arc<AtomicBool>> = OnceCell::new();

/// The process-wide closing flag. Signal handlers are installed on first request.
fn closing_flag(handle_signals: bool) -> Result<Arc<AtomicBool>> {
    if !handle_signals {
        return Ok(Arc::new(AtomicBool::new(false)));
    }
    CLOSING
        .get_or_try_init(|| {
            let flag = Arc::new(AtomicBool::new(false));
            for sig in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
                // A second signal terminates even if the caller never checks the flag.
                signal_hook::flag::register_conditional_shutdown(sig, 1, Arc::clone(&flag))?;
                signal_hook::flag::register(sig, Arc::clone(&flag))?;
            }
            debug!("termination signal handlers installed");
            Ok::<_, ShmemLibError>(flag)
        })
        .map(Arc::clone)
}

/// Creates the segment. The returned mapping still owns the OS object, so dropping
/// it before initialization completes unlinks the half-made segment.
pub fn owner_context(cfg: &ShmemConfig, layout: &SegmentLayout) -> Result<Shmem> {
    let shmem = ShmemConf::new().os_id(cfg.os_id()).size(layout.size).create()?;
    debug!(name = %cfg.name, size = layout.size, "created shared ring segment");
    Ok(shmem)
}

/// Opens an existing segment and checks that it is large enough for `layout`.
pub fn attacher_context(cfg: &ShmemConfig, layout: &SegmentLayout) -> Result<Shmem> {
    let shmem = ShmemConf::new().os_id(cfg.os_id()).open()?;
    if shmem.len() < layout.size {
        return Err(ShmemLibError::Segment(format!(
            "segment {} maps {} bytes, expected at least {}",
            cfg.name,
            shmem.len(),
            layout.size
        )));
    }
    debug!(name = %cfg.name, size = shmem.len(), "attached shared ring segment");
    Ok(shmem)
}

/// Removes the named segment from the system. Processes that still map it keep
/// their mapping; later attach attempts fail.
pub fn unlink(name: &str) -> Result<()> {
    let mut shmem = ShmemConf::new().os_id(os_id(name)).open()?;
    shmem.set_owner(true);
    drop(shmem);
    debug!(name, "unlinked shared ring segment");
    Ok(())
}

/// A process-local, non-owning view of a mapped segment.
///
/// All access to the header and records goes through [`read`](Self::read) or
/// [`write`](Self::write), which hold the shared lock for the duration of the closure.
pub struct ShmemService<T: Record> {
    shmem: Shmem,
    header: NonNull<Header>,
    lock: NonNull<RwLockState>,
    records: NonNull<T>,
    capacity: usize,
    name: String,
    owner: bool,
    closing: Arc<AtomicBool>,
    _marker: PhantomData<T>,
}

// Every dereference of the pointers happens under the process-shared lock.
unsafe impl<T: Record> Send for ShmemService<T> {}
unsafe impl<T: Record> Sync for ShmemService<T> {}

impl<T: Record> ShmemService<T> {
    pub fn new(cfg: &ShmemConfig) -> Result<ShmemService<T>> {
        cfg.validate()?;
        let layout = SegmentLayout::for_capacity::<T>(cfg.capacity)?;
        let closing = closing_flag(cfg.handle_signals)?;
        let mut shmem = if cfg.owner {
            owner_context(cfg, &layout)?
        } else {
            attacher_context(cfg, &layout)?
        };

        let base = NonNull::new(shmem.as_ptr()).ok_or_else(|| {
            ShmemLibError::Segment(format!("segment {} mapped at a null address", cfg.name))
        })?;
        let header = base.cast::<Header>();
        let lock = unsafe { NonNull::new_unchecked(base.as_ptr().add(layout.lock_offset)) }
            .cast::<RwLockState>();
        let records = unsafe { NonNull::new_unchecked(base.as_ptr().add(layout.records_offset)) }
            .cast::<T>();

        if cfg.owner {
            unsafe { initialize(header.as_ptr(), lock.as_ptr(), cfg.capacity)? };
            // Detaching must never destroy the segment.
            shmem.set_owner(false);
        } else {
            let found = unsafe { header.as_ref() }.capacity.load(Ordering::Acquire) as usize;
            if found == 0 {
                return Err(ShmemLibError::ProtocolMisuse(format!(
                    "segment {} has not been initialized by its owner",
                    cfg.name
                )));
            }
            if found != cfg.capacity {
                return Err(ShmemLibError::Segment(format!(
                    "segment {} holds {} slots, expected {}",
                    cfg.name, found, cfg.capacity
                )));
            }
        }

        Ok(ShmemService {
            shmem,
            header,
            lock,
            records,
            capacity: cfg.capacity,
            name: cfg.name.clone(),
            owner: cfg.owner,
            closing,
            _marker: PhantomData,
        })
    }

    #[inline]
    fn ensure_not_closing(&self) -> Result<()> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(ShmemLibError::Closing);
        }
        Ok(())
    }

    pub fn lock(&self) -> &RwLockState {
        unsafe { self.lock.as_ref() }
    }

    /// Runs `f` on the header and record slots with the lock held in shared mode.
    pub fn read<R, F>(&self, timeout: Timeout, f: F) -> Result<R>
    where
        F: FnOnce(&Header, &[T]) -> R,
    {
        self.ensure_not_closing()?;
        let guard = self.lock().read(&timeout)?;
        let result = unsafe {
            let header = self.header.as_ref();
            let records = slice::from_raw_parts(self.records.as_ptr(), self.capacity);
            f(header, records)
        };
        guard.release()?;
        Ok(result)
    }

    /// Runs `f` on the header and record slots with the lock held exclusively.
    pub fn write<R, F>(&self, timeout: Timeout, f: F) -> Result<R>
    where
        F: FnOnce(&mut Header, &mut [T]) -> R,
    {
        self.ensure_not_closing()?;
        let guard = self.lock().write(&timeout)?;
        let result = unsafe {
            let header = &mut *self.header.as_ptr();
            let records = slice::from_raw_parts_mut(self.records.as_ptr(), self.capacity);
            f(header, records)
        };
        guard.release()?;
        Ok(result)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn segment_len(&self) -> usize {
        self.shmem.len()
    }
}

impl<T: Record> Drop for ShmemService<T> {
    fn drop(&mut self) {
        debug!(name = %self.name, owner = self.owner, "detaching shared ring segment");
    }
}

impl<T: Record> fmt::Debug for ShmemService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemService")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("capacity", &self.capacity)
            .field("segment_len", &self.shmem.len())
            .finish()
    }
}

/// Writes the header and lock of a freshly created segment. Capacity is stored
/// last so an attacher seeing a non-zero capacity also sees the initialized lock.
unsafe fn initialize(header: *mut Header, lock: *mut RwLockState, capacity: usize) -> Result<()> {
    ptr::addr_of_mut!((*header).begin).write(0);
    ptr::addr_of_mut!((*header).end).write(0);
    RwLockState::init(lock)?;
    (*header).capacity.store(capacity as u64, Ordering::Release);
    Ok(())
}

/// A fixed-capacity circular queue of `T` shared between processes.
///
/// Full pushes overwrite the oldest record. Operations block on the segment's
/// write-preferring lock; see [`crate::lock`].
#[derive(Debug)]
pub struct ShmRingBuffer<T: Record> {
    pub(crate) service: ShmemService<T>,
}

impl<T: Record> ShmRingBuffer<T> {
    pub fn new(cfg: &ShmemConfig) -> Result<ShmRingBuffer<T>> {
        Ok(ShmRingBuffer {
            service: ShmemService::new(cfg)?,
        })
    }

    /// Creates (`owner`) or opens the segment called `name` with `capacity` slots.
    pub fn attach(name: &str, capacity: usize, owner: bool) -> Result<ShmRingBuffer<T>> {
        let cfg = ShmemConfig::builder()
            .name(name)
            .capacity(capacity)
            .owner(owner)
            .build()?;
        ShmRingBuffer::new(&cfg)
    }

    /// Unmaps the local view. The segment and its records stay in place.
    pub fn detach(self) {
        drop(self)
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn is_owner(&self) -> bool {
        self.service.is_owner()
    }

    pub fn is_closing(&self) -> bool {
        self.service.is_closing()
    }

    pub fn segment_len(&self) -> usize {
        self.service.segment_len()
    }

    /// The segment's lock. Holding it across ring calls on the same thread deadlocks.
    pub fn lock(&self) -> &RwLockState {
        self.service.lock()
    }

    pub fn lock_stats(&self) -> Result<LockStats> {
        self.service.lock().stats()
    }
}
