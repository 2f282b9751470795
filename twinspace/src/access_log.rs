//! Per-index record of which workers touched a buffer during a region.
//!
//! Every worker that accesses an instrumented buffer inserts its id here, so
//! insertion has to tolerate concurrent writers on different indices and on the
//! same index. The log is split into cache-padded shards, each a small map from
//! index to a sorted worker set; index `i` always lands in shard
//! `i % shards`.

use core::fmt;
use crossbeam_utils::CachePadded;
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::config::ACCESS_LOG_SHARDS;
use crate::region::worker::WorkerId;
use crate::sync::lock::Mutex;
use crate::sync::lock_unpoisoned;

/// Sorted, duplicate-free set of workers that touched one index.
pub type WorkerSet = SmallVec<[WorkerId; 4]>;

type Shard = CachePadded<Mutex<HashMap<usize, WorkerSet>>>;

/// Index -> worker set map shared by every worker touching one buffer.
///
/// # Example
///
/// ```rust
/// use twinspace::{AccessLog, WorkerId};
///
/// let log = AccessLog::new(3);
/// assert!(log.record(1, WorkerId(0)));
/// assert!(!log.record(1, WorkerId(0))); // set semantics
/// assert!(log.record(1, WorkerId(4)));
///
/// assert_eq!(log.workers(1).as_slice(), &[WorkerId(0), WorkerId(4)]);
/// assert!(log.workers(0).is_empty());
/// ```
pub struct AccessLog {
    len: usize,
    shards: Box<[Shard]>,
}

impl AccessLog {
    /// Creates an empty log for a buffer of `len` elements.
    pub fn new(len: usize) -> Self {
        Self::with_shards(len, ACCESS_LOG_SHARDS)
    }

    /// Creates an empty log with an explicit shard count (at least one).
    pub fn with_shards(len: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            len,
            shards: (0..shards)
                .map(|_| CachePadded::new(Mutex::new(HashMap::new())))
                .collect(),
        }
    }

    /// Number of elements in the logged buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the logged buffer has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn shard(&self, index: usize) -> &Shard {
        &self.shards[index % self.shards.len()]
    }

    /// Records that `worker` touched `index`.
    ///
    /// Returns `true` if the worker was not yet in the index's set. Indices
    /// past the end of the buffer are ignored.
    pub fn record(&self, index: usize, worker: WorkerId) -> bool {
        if index >= self.len {
            tracing::trace!(index, len = self.len, "access outside logged range ignored");
            return false;
        }

        let mut shard = lock_unpoisoned(self.shard(index));
        let set = shard.entry(index).or_default();
        match set.binary_search(&worker) {
            Ok(_) => false,
            Err(pos) => {
                set.insert(pos, worker);
                true
            }
        }
    }

    /// Workers that touched `index`, in ascending id order.
    pub fn workers(&self, index: usize) -> WorkerSet {
        lock_unpoisoned(self.shard(index))
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct workers that touched `index`.
    pub fn touch_count(&self, index: usize) -> usize {
        lock_unpoisoned(self.shard(index))
            .get(&index)
            .map_or(0, |set| set.len())
    }

    /// Number of indices touched by at least one worker.
    pub fn touched_indices(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| lock_unpoisoned(shard).len())
            .sum()
    }
}

impl fmt::Debug for AccessLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLog")
            .field("len", &self.len)
            .field("shards", &self.shards.len())
            .field("touched", &self.touched_indices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_record_is_idempotent() {
        let log = AccessLog::new(4);
        for _ in 0..100 {
            log.record(2, WorkerId(9));
        }
        assert_eq!(log.touch_count(2), 1);
        assert_eq!(log.touched_indices(), 1);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let log = AccessLog::new(2);
        assert!(!log.record(2, WorkerId(0)));
        assert_eq!(log.touched_indices(), 0);
    }

    #[test]
    fn test_indices_sharing_a_shard_stay_separate() {
        let log = AccessLog::with_shards(16, 2);
        log.record(0, WorkerId(0));
        log.record(2, WorkerId(1));
        assert_eq!(log.workers(0).as_slice(), &[WorkerId(0)]);
        assert_eq!(log.workers(2).as_slice(), &[WorkerId(1)]);
    }

    #[test]
    fn test_concurrent_same_index() {
        let log = Arc::new(AccessLog::with_shards(1, 1));
        let handles: Vec<_> = (0..8u32)
            .map(|w| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        log.record(0, WorkerId(w % 4));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let expected: Vec<_> = (0..4).map(WorkerId).collect();
        assert_eq!(log.workers(0).as_slice(), expected.as_slice());
    }
}
