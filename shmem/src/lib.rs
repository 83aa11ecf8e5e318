//! A fixed-capacity ring buffer of plain records living in named shared memory.
//!
//! One process owns the segment: it creates it and initializes the header and the
//! lock. Any number of other processes attach to it by name with the same record
//! type and capacity. Every operation takes the segment's write-preferring
//! reader/writer lock (see [`lock`]), so readers never observe a half-applied push,
//! pop or clear.
//!
//! Dropping a handle only unmaps it. The segment outlives every attached process
//! until [`unlink`] removes it.

#[cfg(not(unix))]
compile_error!("shmring needs process-shared pthread primitives and POSIX shared memory");

mod core;
pub mod errors;
pub mod lock;
pub mod reader;
pub mod writer;


pub use crate::core::{
    attacher_context, owner_context, unlink, Header, Record, SegmentLayout, ShmRingBuffer,
    ShmemConfig, ShmemConfigBuilder, ShmemService, DEFAULT_CAPACITY, DEFAULT_SHMEM_NAME,
};
pub use errors::{Result, ShmemLibError};
pub use lock::{LockStats, ReadGuard, RwLockState, WriteGuard};
pub use raw_sync::Timeout;
pub use reader::Records;
