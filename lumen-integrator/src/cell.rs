//! Interior-mutable state columns.
//!
//! The path-state store is structure-of-arrays: every field is one flat
//! column indexed by path id. Stage kernels run as parallel sweeps over
//! queue entries and write fields of the paths they own, so the columns
//! must admit concurrent writes to *distinct* ids through a shared
//! reference.
//!
//! The soundness argument is the queue-ownership invariant: a live path
//! id is a member of exactly one stage queue at any point between
//! dispatches, and a kernel sweep hands each queue entry to exactly one
//! worker. Relocation passes (compaction, ordering) reserve destination
//! slots through an atomic cursor before touching them, so their writes
//! are disjoint as well.

use std::cell::UnsafeCell;

/// One SoA column of `len` slots.
pub struct Column<T> {
    slots: Vec<UnsafeCell<T>>,
}

// SAFETY: access is partitioned by path id; see the module docs.
unsafe impl<T: Send> Sync for Column<T> {}

impl<T: Copy + Default> Column<T> {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reads slot `index`. The caller must be the sole owner of the
    /// path id per the queue-ownership invariant.
    #[inline]
    pub fn get(&self, index: u32) -> T {
        unsafe { *self.slots[index as usize].get() }
    }

    /// Writes slot `index` under the same ownership rule as [`get`].
    ///
    /// [`get`]: Column::get
    #[inline]
    pub fn set(&self, index: u32, value: T) {
        unsafe { *self.slots[index as usize].get() = value };
    }

    /// Exclusive fill; used between dispatches.
    pub fn fill(&mut self, value: T) {
        for slot in &mut self.slots {
            *slot.get_mut() = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_parallel_writes_land() {
        use rayon::prelude::*;
        let column: Column<u32> = Column::new(1024);
        (0..1024u32).into_par_iter().for_each(|i| {
            column.set(i, i * 3);
        });
        for i in 0..1024u32 {
            assert_eq!(column.get(i), i * 3);
        }
    }
}
