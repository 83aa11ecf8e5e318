use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    /// Creating, opening or mapping the named segment failed.
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    /// The mapped segment does not match the layout this handle expects.
    #[error("segment error: {0}")]
    Segment(String),
    /// A process-shared pthread call returned a non-zero code.
    #[error("lock error in {op}: {source}")]
    Lock {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("invalid capacity {0}: must be a positive slot count whose segment size fits in memory")]
    Capacity(usize),
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
    #[error("lock not acquired within {0:?}")]
    Timeout(Duration),
    #[error("the process is shutting down")]
    Closing,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ShmemLibError {
    /// Maps a pthread return code to a lock error. Zero is success.
    pub(crate) fn check(op: &'static str, code: libc::c_int) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(ShmemLibError::Lock {
                op,
                source: io::Error::from_raw_os_error(code),
            })
        }
    }
}

impl From<toml::de::Error> for ShmemLibError {
    fn from(err: toml::de::Error) -> Self {
        ShmemLibError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShmemLibError>;
