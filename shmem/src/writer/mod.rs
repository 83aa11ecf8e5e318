use std::time::Duration;

use raw_sync::Timeout;
use tracing::trace;

use super::core::{Header, Record, ShmRingBuffer};
use crate::errors::Result;

impl<T: Record> ShmRingBuffer<T> {
    /// Empties the ring. Record bytes are left as they are.
    pub fn clear(&self) -> Result<()> {
        self.service.write(Timeout::Infinite, |header, _| {
            header.set_begin(0);
            header.set_end(0);
        })?;
        trace!(name = self.name(), "ring cleared");
        Ok(())
    }

    /// Appends `record`. A full ring drops its oldest record to make room.
    pub fn push_back(&self, record: &T) -> Result<()> {
        self.push_back_with(Timeout::Infinite, record)
    }

    /// [`push_back`](Self::push_back) that fails with `Timeout` if the lock is not
    /// acquired within `wait`.
    pub fn push_back_timeout(&self, record: &T, wait: Duration) -> Result<()> {
        self.push_back_with(Timeout::Val(wait), record)
    }

    /// Removes and returns the oldest record, or `None` when the ring is empty.
    pub fn pop_front(&self) -> Result<Option<T>> {
        self.service.write(Timeout::Infinite, |header, records| pop(header, records))
    }

    pub fn pop_front_timeout(&self, wait: Duration) -> Result<Option<T>> {
        self.service.write(Timeout::Val(wait), |header, records| pop(header, records))
    }

    fn push_back_with(&self, timeout: Timeout, record: &T) -> Result<()> {
        let overwrote = self
            .service
            .write(timeout, |header, records| push(header, records, record))?;
        if overwrote {
            trace!(name = self.name(), "ring full, oldest record overwritten");
        }
        Ok(())
    }
}

/// Stores `record` at `end` and advances it. Returns true if `begin` had to move,
/// i.e. the oldest record was dropped.
#[inline]
fn push<T: Copy>(header: &mut Header, records: &mut [T], record: &T) -> bool {
    let end = header.end();
    records[end] = *record;
    let end = header.next(end);
    header.set_end(end);
    if end == header.begin() {
        let begin = header.next(header.begin());
        header.set_begin(begin);
        return true;
    }
    false
}

#[inline]
fn pop<T: Copy>(header: &mut Header, records: &[T]) -> Option<T> {
    if header.is_empty() {
        return None;
    }
    let begin = header.begin();
    let record = records[begin];
    header.set_begin(header.next(begin));
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::error::Error;

    #[test]
    fn push_then_pop_restores_empty() -> std::result::Result<(), Box<dyn Error>> {
        let header = &mut Header::new(4);
        let records = &mut [0u32; 4];
        assert!(!push(header, records, &7));
        assert_eq!((header.begin(), header.end()), (0, 1));
        assert_eq!(pop(header, records), Some(7));
        assert!(header.is_empty());
        assert_eq!(pop(header, records), None);
        assert_eq!((header.begin(), header.end()), (1, 1));
        Ok(())
    }

    #[test]
    fn full_push_advances_begin() -> std::result::Result<(), Box<dyn Error>> {
        let header = &mut Header::new(4);
        let records = &mut [0u32; 4];
        for x in 1..=3 {
            assert!(!push(header, records, &x));
        }
        assert_eq!(header.len(), 3);
        assert!(push(header, records, &4));
        assert_eq!((header.begin(), header.end()), (1, 0));
        assert_eq!(header.len(), 3);
        assert_eq!(pop(header, records), Some(2));
        Ok(())
    }

    #[test]
    fn capacity_one_never_holds_a_record() -> std::result::Result<(), Box<dyn Error>> {
        let header = &mut Header::new(1);
        let records = &mut [0u32; 1];
        assert!(push(header, records, &9));
        assert!(header.is_empty());
        assert_eq!(pop(header, records), None);
        Ok(())
    }

    #[test]
    fn indices_wrap_around() -> std::result::Result<(), Box<dyn Error>> {
        let header = &mut Header::new(3);
        let records = &mut [0u64; 3];
        let mut popped = Vec::new();
        for x in 0..10u64 {
            push(header, records, &x);
            if x % 2 == 1 {
                popped.extend(pop(header, records));
            }
            assert!(header.begin() < 3 && header.end() < 3);
        }
        while let Some(x) = pop(header, records) {
            popped.push(x);
        }
        let mut sorted = popped.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, popped);
        assert_eq!(popped.last(), Some(&9));
        Ok(())
    }
}
