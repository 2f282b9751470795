//! Post-Region Conflict Detection
//!
//! After a region completes, each registered buffer is compared against the
//! snapshot taken when it was captured:
//!
//! ```text
//! ∀ i ∈ 0..len:  current[i] != snapshot[i]  ∧  |log[i]| > 1  ⟹  report(i)
//! ```
//!
//! # Limitations
//!
//! This is a heuristic over two observations, not a happens-before analysis:
//!
//! - A value written and then restored by another worker (a cancelling write)
//!   compares equal to the snapshot and is not reported.
//! - Accesses confined to one worker form a set of size one and are never
//!   reported, whatever their order.
//! - The log carries no ordering, so read-then-write and write-then-read by two
//!   workers look the same.
//!
//! These are kept as-is; tightening them needs per-access clocks.

use core::fmt;
use std::sync::Arc;

use crate::access_log::AccessLog;
use crate::array::BufferId;
use crate::region::worker::WorkerId;
use crate::region::RegionSite;
use crate::{Error, Result};

/// One index that changed while being touched by several workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceReport {
    /// Buffer the index belongs to
    pub buffer: BufferId,
    /// Human-readable buffer name, if one was given
    pub name: Option<Arc<str>>,
    /// Conflicting element index
    pub index: usize,
    /// Workers that touched the index, ascending
    pub workers: Vec<WorkerId>,
    /// Region the conflict happened in
    pub site: RegionSite,
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "race on ")?;
        match &self.name {
            Some(name) => write!(f, "`{name}` ({})", self.buffer)?,
            None => write!(f, "{}", self.buffer)?,
        }
        write!(f, " at index {} in {}; workers ", self.index, self.site)?;
        for (n, worker) in self.workers.iter().enumerate() {
            if n > 0 {
                f.write_str(",")?;
            }
            write!(f, "{worker}")?;
        }
        Ok(())
    }
}

/// Indices that satisfy the detection predicate, with their worker sets.
///
/// Fails with [`Error::MalformedLog`] if the three inputs do not describe the
/// same number of elements.
pub fn conflicting_indices<T: PartialEq>(
    current: &[T],
    snapshot: &[T],
    log: &AccessLog,
) -> Result<Vec<(usize, Vec<WorkerId>)>> {
    if snapshot.len() != current.len() {
        return Err(Error::MalformedLog {
            expected: current.len(),
            found: snapshot.len(),
        });
    }
    if log.len() != current.len() {
        return Err(Error::MalformedLog {
            expected: current.len(),
            found: log.len(),
        });
    }

    let mut conflicts = Vec::new();
    for (index, (now, before)) in current.iter().zip(snapshot).enumerate() {
        if now == before {
            continue;
        }
        let workers = log.workers(index);
        if workers.len() > 1 {
            conflicts.push((index, workers.into_vec()));
        }
    }
    Ok(conflicts)
}

/// Everything the detector needs about one buffer.
pub struct BufferCheck<'a, T> {
    /// Buffer identity
    pub buffer: BufferId,
    /// Optional display name
    pub name: Option<&'a Arc<str>>,
    /// Contents after the region
    pub current: &'a [T],
    /// Contents at capture time
    pub snapshot: &'a [T],
    /// Workers per index
    pub log: &'a AccessLog,
}

/// Builds the conflict reports for one buffer.
///
/// Reports are ordered by index and capped at `limit`; the return value's
/// second element is the number of conflicts left out by the cap.
pub fn detect_races<T: PartialEq>(
    check: &BufferCheck<'_, T>,
    site: &RegionSite,
    limit: usize,
) -> Result<(Vec<RaceReport>, usize)> {
    let conflicts = conflicting_indices(check.current, check.snapshot, check.log)?;
    let omitted = conflicts.len().saturating_sub(limit);

    let reports = conflicts
        .into_iter()
        .take(limit)
        .map(|(index, workers)| RaceReport {
            buffer: check.buffer,
            name: check.name.cloned(),
            index,
            workers,
            site: *site,
        })
        .collect();

    Ok((reports, omitted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ExecutionSpace;

    const A: WorkerId = WorkerId(0);
    const B: WorkerId = WorkerId(1);

    fn log_with(len: usize, touches: &[(usize, WorkerId)]) -> AccessLog {
        let log = AccessLog::new(len);
        for &(index, worker) in touches {
            log.record(index, worker);
        }
        log
    }

    #[test]
    fn test_write_seen_by_two_workers_is_reported() {
        let log = log_with(3, &[(1, A), (1, B)]);
        let conflicts = conflicting_indices(&[0, 5, 0], &[0, 0, 0], &log).unwrap();
        assert_eq!(conflicts, vec![(1, vec![A, B])]);
    }

    #[test]
    fn test_single_worker_write_is_not_reported() {
        let log = log_with(3, &[(0, A), (0, A)]);
        let conflicts = conflicting_indices(&[7, 0, 0], &[0, 0, 0], &log).unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_cancelling_write_is_a_known_false_negative() {
        let log = log_with(3, &[(2, A), (2, B)]);
        let conflicts = conflicting_indices(&[0, 0, 0], &[0, 0, 0], &log).unwrap();
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_shared_read_without_change_is_not_reported() {
        let log = log_with(2, &[(0, A), (0, B)]);
        assert!(conflicting_indices(&[1, 2], &[1, 2], &log)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let log = AccessLog::new(2);
        let err = conflicting_indices(&[0, 0, 0], &[0, 0, 0], &log).unwrap_err();
        assert_eq!(
            err,
            Error::MalformedLog {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn test_reports_are_capped() {
        let log = log_with(4, &[(0, A), (0, B), (1, A), (1, B), (3, A), (3, B)]);
        let check = BufferCheck {
            buffer: BufferId::from_raw(0x40, 4, 4),
            name: None,
            current: &[1, 1, 0, 1],
            snapshot: &[0, 0, 0, 0],
            log: &log,
        };
        let site = RegionSite::here(ExecutionSpace::Host);
        let (reports, omitted) = detect_races(&check, &site, 2).unwrap();

        assert_eq!(reports.iter().map(|r| r.index).collect::<Vec<_>>(), [0, 1]);
        assert_eq!(omitted, 1);
    }

    #[test]
    fn test_report_display_names_buffer_and_workers() {
        let report = RaceReport {
            buffer: BufferId::from_raw(0x1000, 4, 3),
            name: Some(Arc::from("density")),
            index: 1,
            workers: vec![A, B],
            site: RegionSite::here(ExecutionSpace::Device),
        };
        let text = report.to_string();
        assert!(text.contains("`density`"));
        assert!(text.contains("index 1"));
        assert!(text.ends_with("workers 0,1"));
    }
}
