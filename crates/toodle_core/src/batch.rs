//! Counted record batches handed across the boundary in one call.
//!
//! # Invariants
//! - `count()` always equals the number of contained records.
//! - Releasing a batch releases each record exactly once, in order, before
//!   the container itself.
//! - Record order is whatever the producing query defined; batches never sort.

use crate::model::item::{Identifier, Item};

/// Ordered, owned sequence of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch<T> {
    records: Vec<T>,
}

pub type ItemSet = RecordBatch<Item>;
pub type IdentifierSet = RecordBatch<Identifier>;

impl<T> RecordBatch<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self { records }
    }

    /// A valid batch with no records; still has to be released.
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    /// Moves records out, transferring release responsibility to the caller.
    pub fn into_records(self) -> Vec<T> {
        self.records
    }

    /// Releases every record front to back, then the container.
    ///
    /// Returns how many records were released.
    pub fn release(mut self) -> usize {
        let mut released = 0;
        for record in self.records.drain(..) {
            drop(record);
            released += 1;
        }
        released
    }
}

impl<T> Default for RecordBatch<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> From<Vec<T>> for RecordBatch<T> {
    fn from(records: Vec<T>) -> Self {
        Self::new(records)
    }
}

impl<T> IntoIterator for RecordBatch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a RecordBatch<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::RecordBatch;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracked {
        id: usize,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.id);
        }
    }

    fn tracked_batch(len: usize, log: &Rc<RefCell<Vec<usize>>>) -> RecordBatch<Tracked> {
        RecordBatch::new(
            (0..len)
                .map(|id| Tracked {
                    id,
                    log: Rc::clone(log),
                })
                .collect(),
        )
    }

    #[test]
    fn release_releases_each_record_once_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let batch = tracked_batch(5, &log);
        assert_eq!(batch.count(), 5);

        assert_eq!(batch.release(), 5);
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_batch_is_valid_and_releases_nothing() {
        let batch: RecordBatch<Tracked> = RecordBatch::empty();
        assert_eq!(batch.count(), 0);
        assert!(batch.is_empty());
        assert_eq!(batch.release(), 0);
    }

    #[test]
    fn dropping_batch_on_early_exit_still_releases_every_record() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let early_exit = |batch: RecordBatch<Tracked>| -> Result<(), &'static str> {
            if batch.count() > 2 {
                return Err("too many");
            }
            batch.release();
            Ok(())
        };

        assert!(early_exit(tracked_batch(3, &log)).is_err());
        let mut released = log.borrow().clone();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1, 2]);
    }
}
