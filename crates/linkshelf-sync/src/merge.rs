//! Identity-keyed merge shared by the gateway-completion and feed paths.
//!
//! Both channels may observe the same logical mutation, in either order, or
//! only one of them may observe it at all. Every function here is idempotent
//! by [`RecordId`] so the result does not depend on arrival order.

use std::cmp::Reverse;
use std::collections::HashSet;

use crate::feed::Change;
use crate::record::{Record, RecordId};

/// Effect of merging one change into the ordered rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Removed,
    /// Insert for an identity that is already present.
    DuplicateSuppressed,
    /// Update or delete for an identity that is not present.
    Absent,
    /// Insert or update for an identity already deleted in this session.
    /// Produced by the mirror, never by [`merge`] itself.
    Deleted,
}

impl MergeOutcome {
    /// Whether the rows changed.
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

/// Applies `change` to `rows` (newest first).
pub fn merge(rows: &mut Vec<Record>, change: Change) -> MergeOutcome {
    match change {
        Change::Insert(record) => {
            if position(rows, record.id).is_some() {
                return MergeOutcome::DuplicateSuppressed;
            }
            rows.insert(0, record);
            MergeOutcome::Inserted
        }
        Change::Update(record) => match position(rows, record.id) {
            Some(index) => {
                rows[index] = record;
                MergeOutcome::Updated
            }
            None => MergeOutcome::Absent,
        },
        Change::Delete(id) => match position(rows, id) {
            Some(index) => {
                rows.remove(index);
                MergeOutcome::Removed
            }
            None => MergeOutcome::Absent,
        },
    }
}

/// Orders a bulk fetch newest first and drops repeated identities.
///
/// The sort is stable: rows with equal (or missing) `created_at` keep the
/// order the store returned them in, and rows without a timestamp go last.
#[must_use]
pub fn seed(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut rows = records
        .into_iter()
        .filter(|record| seen.insert(record.id))
        .collect::<Vec<_>>();
    rows.sort_by_key(|record| Reverse(record.created_at));
    rows
}

fn position(rows: &[Record], id: RecordId) -> Option<usize> {
    rows.iter().position(|record| record.id == id)
}

#[cfg(test)]
mod tests {
    use super::{MergeOutcome, merge, seed};
    use crate::feed::Change;
    use crate::record::{OwnerId, Record, RecordId};
    use chrono::{TimeZone, Utc};
    use quickcheck::{QuickCheck, TestResult};

    fn record(id: i64, created_at_secs: Option<i64>) -> Record {
        Record {
            id: RecordId(id),
            title: format!("title-{id}"),
            url: format!("https://example.com/{id}"),
            owner: OwnerId::new("user-a"),
            created_at: created_at_secs.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }

    fn rows_from_ids(ids: &[u8]) -> Vec<Record> {
        seed(
            ids.iter()
                .map(|id| record(i64::from(*id % 16), None))
                .collect(),
        )
    }

    fn ids(rows: &[Record]) -> Vec<i64> {
        rows.iter().map(|record| record.id.0).collect()
    }

    #[test]
    fn insert_prepends_and_suppresses_duplicates() {
        let mut rows = vec![record(1, Some(1))];
        assert_eq!(
            merge(&mut rows, Change::Insert(record(2, Some(2)))),
            MergeOutcome::Inserted
        );
        assert_eq!(
            merge(&mut rows, Change::Insert(record(2, Some(2)))),
            MergeOutcome::DuplicateSuppressed
        );
        assert_eq!(ids(&rows), vec![2, 1]);
    }

    #[test]
    fn update_replaces_in_place() {
        let mut rows = vec![record(3, None), record(2, None), record(1, None)];
        let mut edited = record(2, None);
        edited.title = "edited".to_string();
        assert_eq!(merge(&mut rows, Change::Update(edited)), MergeOutcome::Updated);
        assert_eq!(ids(&rows), vec![3, 2, 1]);
        assert_eq!(rows[1].title, "edited");

        assert_eq!(
            merge(&mut rows, Change::Update(record(9, None))),
            MergeOutcome::Absent
        );
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn delete_removes_exactly_one_row() {
        let mut rows = vec![record(3, None), record(2, None), record(1, None)];
        assert_eq!(
            merge(&mut rows, Change::Delete(RecordId(2))),
            MergeOutcome::Removed
        );
        assert_eq!(ids(&rows), vec![3, 1]);
        assert_eq!(
            merge(&mut rows, Change::Delete(RecordId(2))),
            MergeOutcome::Absent
        );
        assert_eq!(ids(&rows), vec![3, 1]);
    }

    #[test]
    fn seed_orders_newest_first_and_dedups() {
        let rows = seed(vec![
            record(2, Some(2)),
            record(3, Some(3)),
            record(2, Some(2)),
            record(9, None),
            record(1, Some(1)),
        ]);
        assert_eq!(ids(&rows), vec![3, 2, 1, 9]);
    }

    #[test]
    fn load_then_feed_insert_prepends() {
        let mut rows = seed(vec![record(1, Some(3)), record(2, Some(2)), record(3, Some(1))]);
        merge(&mut rows, Change::Insert(record(4, Some(4))));
        assert_eq!(ids(&rows), vec![4, 1, 2, 3]);
    }

    #[test]
    fn insert_is_idempotent() {
        fn property(initial: Vec<u8>, id: u8) -> TestResult {
            let mut once = rows_from_ids(&initial);
            merge(&mut once, Change::Insert(record(i64::from(id % 16), None)));
            let mut twice = once.clone();
            merge(&mut twice, Change::Insert(record(i64::from(id % 16), None)));
            TestResult::from_bool(once == twice)
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(Vec<u8>, u8) -> TestResult);
    }

    #[test]
    fn delete_is_idempotent_and_removes_at_most_one() {
        fn property(initial: Vec<u8>, id: u8) -> TestResult {
            let target = RecordId(i64::from(id % 16));
            let before = rows_from_ids(&initial);
            let was_present = before.iter().any(|record| record.id == target);

            let mut once = before.clone();
            merge(&mut once, Change::Delete(target));
            let mut twice = once.clone();
            let second = merge(&mut twice, Change::Delete(target));

            let expected_len = before.len() - usize::from(was_present);
            TestResult::from_bool(
                once == twice
                    && second == MergeOutcome::Absent
                    && once.len() == expected_len
                    && once.iter().all(|record| record.id != target),
            )
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(Vec<u8>, u8) -> TestResult);
    }

    #[test]
    fn identities_stay_unique_under_any_change_sequence() {
        fn property(initial: Vec<u8>, ops: Vec<(u8, u8)>) -> TestResult {
            let mut rows = rows_from_ids(&initial);
            for (op, id) in ops {
                let id = i64::from(id % 16);
                let change = match op % 3 {
                    0 => Change::Insert(record(id, None)),
                    1 => Change::Update(record(id, None)),
                    _ => Change::Delete(RecordId(id)),
                };
                merge(&mut rows, change);
            }
            let mut seen = std::collections::HashSet::new();
            TestResult::from_bool(rows.iter().all(|record| seen.insert(record.id)))
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(property as fn(Vec<u8>, Vec<(u8, u8)>) -> TestResult);
    }
}
