use serde::Serialize;
use tengine_transfer::Transfer;

/// Records that can be matched across two snapshots of a list.
pub trait SyncItem: Clone {
    /// Identity match; the only criterion used for alignment.
    fn same_identity(&self, other: &Self) -> bool;

    /// Whether an aligned pair differs enough to warrant an update.
    fn content_changed(&self, other: &Self) -> bool;
}

impl SyncItem for Transfer {
    fn same_identity(&self, other: &Self) -> bool {
        self.transfer_id == other.transfer_id
    }

    fn content_changed(&self, other: &Self) -> bool {
        self.progress != other.progress || self.status != other.status
    }
}

/// One edit, expressed against the cache as it stands after every earlier
/// edit in the same batch has been applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ListChange<T> {
    Insert { index: usize, items: Vec<T> },
    Update { index: usize, items: Vec<T> },
    Remove { index: usize, count: usize },
}

/// Rewrites `cache` into `reference` and returns the edits performed.
///
/// Both lists are walked in lockstep. At a mismatch the search looks ahead
/// with a growing window for the nearest point where the lists realign,
/// removing skipped cache items and inserting skipped reference items.
/// Whatever cannot be realigned is replaced wholesale at the end.
pub fn synchronize<T: SyncItem>(cache: &mut Vec<T>, reference: &[T]) -> Vec<ListChange<T>> {
    let mut sync = Synchronizer {
        cache,
        reference,
        c: 0,
        r: 0,
        changes: Vec::new(),
    };
    sync.align();
    sync.complete();
    sync.changes
}

struct Synchronizer<'a, T> {
    cache: &'a mut Vec<T>,
    reference: &'a [T],
    c: usize,
    r: usize,
    changes: Vec<ListChange<T>>,
}

impl<T: SyncItem> Synchronizer<'_, T> {
    fn align(&mut self) {
        let mut last_equal_c = self.c;
        let mut last_equal_r = self.r;

        while self.c < self.cache.len() && self.r < self.reference.len() {
            if self.cache[self.c].same_identity(&self.reference[self.r]) {
                self.c += 1;
                self.r += 1;
                continue;
            }

            if self.c > last_equal_c {
                self.update_range(last_equal_c, self.c - last_equal_c, last_equal_r);
            }

            if !self.realign() {
                return;
            }

            // the realigned pair opens the next update run
            last_equal_c = self.c;
            last_equal_r = self.r;
            self.c += 1;
            self.r += 1;
        }

        if self.c > last_equal_c {
            self.update_range(last_equal_c, self.c - last_equal_c, last_equal_r);
        }
    }

    /// Searches for the nearest common item past the mismatch at (c, r) and
    /// edits the cache so that `cache[c]` and `reference[r]` align on it.
    fn realign(&mut self) -> bool {
        let mut count = 1;
        while self.c + count < self.cache.len() && self.r + count < self.reference.len() {
            let reference_at = self.r + count;
            let cache_at = self.c + count;
            for i in 0..=count {
                if self.cache_match(i, count, reference_at) || self.reference_match(i, count, cache_at) {
                    return true;
                }
            }
            count += 1;
        }

        // cache exhausted: keep scanning the reference
        for re in self.r + count..self.reference.len() {
            for i in 0..count {
                if self.cache_match(i, re - self.r, re) {
                    return true;
                }
            }
        }

        // reference exhausted: keep scanning the cache
        for ce in self.c + count..self.cache.len() {
            for i in 0..count {
                if self.reference_match(i, ce - self.c, ce) {
                    return true;
                }
            }
        }

        false
    }

    /// `cache[c + i]` equals `reference[reference_at]`: drop the `i` cache
    /// items before it and insert the `count` reference items it skipped.
    fn cache_match(&mut self, i: usize, count: usize, reference_at: usize) -> bool {
        if !self.cache[self.c + i].same_identity(&self.reference[reference_at]) {
            return false;
        }
        if i > 0 {
            self.remove_range(self.c, i);
        }
        self.insert_range(self.c, count, self.r);
        self.c += count;
        self.r += count;
        true
    }

    /// `reference[r + i]` equals `cache[cache_at]`: drop the `count` cache
    /// items before it and insert the `i` reference items that precede it.
    fn reference_match(&mut self, i: usize, count: usize, cache_at: usize) -> bool {
        if !self.reference[self.r + i].same_identity(&self.cache[cache_at]) {
            return false;
        }
        self.remove_range(self.c, count);
        if i > 0 {
            self.insert_range(self.c, i, self.r);
            self.c += i;
        }
        self.r += i;
        true
    }

    fn complete(&mut self) {
        if self.c < self.cache.len() {
            let count = self.cache.len() - self.c;
            self.remove_range(self.c, count);
        }
        if self.r < self.reference.len() {
            let index = self.cache.len();
            self.insert_range(index, self.reference.len() - self.r, self.r);
        }
        self.c = self.cache.len();
        self.r = self.reference.len();
    }

    fn insert_range(&mut self, index: usize, count: usize, source_index: usize) {
        let items = self.reference[source_index..source_index + count].to_vec();
        self.cache.splice(index..index, items.iter().cloned());
        self.changes.push(ListChange::Insert { index, items });
    }

    fn remove_range(&mut self, index: usize, count: usize) {
        self.cache.drain(index..index + count);
        self.changes.push(ListChange::Remove { index, count });
    }

    /// Replaces aligned items whose content changed. Runs of changed items
    /// are reported together; an unchanged item ends a run.
    fn update_range(&mut self, index: usize, count: usize, source_index: usize) {
        let mut i = 0;
        while i < count {
            let begin = i;
            while i < count {
                let source = &self.reference[source_index + i];
                let row = &self.cache[index + i];
                if !row.same_identity(source) || !row.content_changed(source) {
                    break;
                }
                self.cache[index + i] = source.clone();
                i += 1;
            }

            if i > begin {
                self.changes.push(ListChange::Update {
                    index: index + begin,
                    items: self.reference[source_index + begin..source_index + i].to_vec(),
                });
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        progress: f64,
    }

    impl SyncItem for Row {
        fn same_identity(&self, other: &Self) -> bool {
            self.id == other.id
        }

        fn content_changed(&self, other: &Self) -> bool {
            self.progress != other.progress
        }
    }

    fn rows(ids: &[i64]) -> Vec<Row> {
        ids.iter().map(|&id| Row { id, progress: 0.0 }).collect()
    }

    fn replay(mut cache: Vec<Row>, changes: &[ListChange<Row>]) -> Vec<Row> {
        for change in changes {
            match change {
                ListChange::Insert { index, items } => {
                    cache.splice(*index..*index, items.iter().cloned());
                }
                ListChange::Update { index, items } => {
                    cache[*index..*index + items.len()].clone_from_slice(items);
                }
                ListChange::Remove { index, count } => {
                    cache.drain(*index..*index + *count);
                }
            }
        }
        cache
    }

    #[test]
    fn identical_lists_produce_no_changes() {
        let mut cache = rows(&[5, 4, 3]);
        let reference = cache.clone();
        assert!(synchronize(&mut cache, &reference).is_empty());
    }

    #[test]
    fn disjoint_lists_are_replaced_wholesale() {
        let mut cache = rows(&[3, 2, 1]);
        let reference = rows(&[9, 8]);
        let changes = synchronize(&mut cache, &reference);
        assert_eq!(
            changes,
            vec![
                ListChange::Remove { index: 0, count: 3 },
                ListChange::Insert {
                    index: 0,
                    items: reference.clone()
                },
            ]
        );
        assert_eq!(cache, reference);
    }

    #[test]
    fn reorder_moves_without_touching_the_unchanged_row() {
        let a = Row { id: 1, progress: 0.1 };
        let b = Row { id: 2, progress: 0.2 };
        let b_moved = Row { id: 2, progress: 0.5 };
        let mut cache = vec![a.clone(), b];
        let reference = vec![b_moved.clone(), a.clone()];

        let changes = synchronize(&mut cache, &reference);
        assert_eq!(
            changes,
            vec![
                ListChange::Insert {
                    index: 0,
                    items: vec![b_moved]
                },
                ListChange::Remove { index: 2, count: 1 },
            ]
        );
        assert!(!changes.iter().any(|c| matches!(c, ListChange::Update { .. })));
        assert_eq!(cache, reference);
    }

    #[test]
    fn new_head_is_a_single_insert() {
        let mut cache = rows(&[2, 1]);
        let reference = rows(&[3, 2, 1]);
        assert_eq!(
            synchronize(&mut cache, &reference),
            vec![ListChange::Insert {
                index: 0,
                items: rows(&[3])
            }]
        );
    }

    #[test]
    fn removed_middle_is_a_single_remove() {
        let mut cache = rows(&[3, 2, 1]);
        let reference = rows(&[3, 1]);
        assert_eq!(
            synchronize(&mut cache, &reference),
            vec![ListChange::Remove { index: 1, count: 1 }]
        );
    }

    #[test]
    fn update_runs_break_at_unchanged_rows() {
        let mut cache = rows(&[5, 4, 3, 2, 1]);
        let mut reference = cache.clone();
        reference[0].progress = 0.5;
        reference[1].progress = 0.6;
        reference[3].progress = 0.9;

        let changes = synchronize(&mut cache, &reference);
        assert_eq!(
            changes,
            vec![
                ListChange::Update {
                    index: 0,
                    items: reference[0..2].to_vec()
                },
                ListChange::Update {
                    index: 3,
                    items: reference[3..4].to_vec()
                },
            ]
        );
        assert_eq!(cache, reference);
    }

    #[test]
    fn changed_row_after_realignment_is_updated() {
        let mut cache = rows(&[4, 3, 2, 1]);
        let mut reference = rows(&[4, 2, 1]);
        reference[1].progress = 1.0;

        let changes = synchronize(&mut cache, &reference);
        assert_eq!(
            changes,
            vec![
                ListChange::Remove { index: 1, count: 1 },
                ListChange::Update {
                    index: 1,
                    items: vec![reference[1].clone()]
                },
            ]
        );
        assert_eq!(cache, reference);
    }

    #[test]
    fn empty_sides() {
        let mut cache = Vec::new();
        let reference = rows(&[2, 1]);
        assert_eq!(
            synchronize(&mut cache, &reference),
            vec![ListChange::Insert {
                index: 0,
                items: reference.clone()
            }]
        );

        let mut cache = rows(&[2, 1]);
        assert_eq!(
            synchronize(&mut cache, &[]),
            vec![ListChange::Remove { index: 0, count: 2 }]
        );
    }

    #[test]
    fn changes_replay_to_the_reference_for_mixed_edits() {
        // small deterministic generator so failures are reproducible
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };

        let mut fresh_id = 1000;
        for _ in 0..200 {
            let cache: Vec<Row> = (0..next(12))
                .map(|i| Row {
                    id: 100 - 2 * i as i64 - next(2) as i64,
                    progress: next(3) as f64 / 2.0,
                })
                .collect();
            let mut reference = Vec::new();
            for row in &cache {
                if next(4) == 0 {
                    continue;
                }
                let progress = if next(3) == 0 { 1.0 } else { row.progress };
                reference.push(Row { id: row.id, progress });
            }
            for _ in 0..next(3) {
                let at = next(reference.len() as u64 + 1) as usize;
                reference.insert(
                    at,
                    Row {
                        id: fresh_id,
                        progress: 0.0,
                    },
                );
                fresh_id += 1;
            }

            let mut working = cache.clone();
            let changes = synchronize(&mut working, &reference);
            assert_eq!(working, reference);
            assert_eq!(replay(cache, &changes), reference);
        }
    }
}
