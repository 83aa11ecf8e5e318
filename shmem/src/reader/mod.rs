use std::fmt;
use std::iter::FusedIterator;

use raw_sync::Timeout;

use super::core::{Header, Record, ShmRingBuffer};
use crate::errors::Result;

impl<T: Record> ShmRingBuffer<T> {
    pub fn capacity(&self) -> Result<usize> {
        self.service.read(Timeout::Infinite, |header, _| header.capacity())
    }

    /// Slot index of the oldest record.
    pub fn begin(&self) -> Result<usize> {
        self.service.read(Timeout::Infinite, |header, _| header.begin())
    }

    /// Slot index the next push writes to.
    pub fn end(&self) -> Result<usize> {
        self.service.read(Timeout::Infinite, |header, _| header.end())
    }

    pub fn len(&self) -> Result<usize> {
        self.service.read(Timeout::Infinite, |header, _| header.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.service.read(Timeout::Infinite, |header, _| header.is_empty())
    }

    /// Copies the live records, oldest first, without removing them.
    ///
    /// The copy is taken under one read lock, so it reflects a single state of the
    /// ring; the lock is released before the iterator is returned.
    pub fn iter(&self) -> Result<Records<T>> {
        let items = self.service.read(Timeout::Infinite, |header, records| snapshot(header, records))?;
        Ok(Records { items, next: 0 })
    }

    /// One line per live record, oldest first, each terminated by `'\n'`.
    pub fn dump(&self) -> Result<String>
    where
        T: fmt::Display,
    {
        Ok(self.iter()?.map(|record| format!("{}\n", record)).collect())
    }
}

fn snapshot<T: Copy>(header: &Header, records: &[T]) -> Vec<T> {
    let mut items = Vec::with_capacity(header.len());
    let mut index = header.begin();
    while index != header.end() {
        items.push(records[index]);
        index = header.next(index);
    }
    items
}

/// Records copied out of the ring by [`ShmRingBuffer::iter`].
#[derive(Clone, Debug)]
pub struct Records<T> {
    items: Vec<T>,
    next: usize,
}

impl<T: Copy> Records<T> {
    /// Starts over from the oldest record.
    pub fn rewind(&mut self) {
        self.next = 0;
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T: Copy> Iterator for Records<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.items.get(self.next).copied()?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.items.len() - self.next;
        (left, Some(left))
    }
}

impl<T: Copy> ExactSizeIterator for Records<T> {}

impl<T: Copy> FusedIterator for Records<T> {}
