//! List-update algebra for windowed queries.
//!
//! A [`ListUpdate`] is a normalised patch to an ordered list: removals are
//! indexed against the list *before* the update, additions against the list
//! *after* it. Applying an update means removing the removal indexes from
//! high to low, then inserting the additions from low to high.
//!
//! Three operations make preemptive reconciliation possible:
//!
//! - [`ListUpdate::compose`] folds two consecutive updates into one,
//!   re-basing the second update's indexes onto the first update's
//!   pre-list. Composition is not commutative.
//! - [`ListUpdate::invert`] swaps removals and additions, producing the
//!   update that undoes this one.
//! - [`ListUpdate::same_effect`] compares two updates by outcome: equal
//!   removed store keys and identical additions.
//!
//! Index re-basing: a removal index from the second update is mapped to the
//! first update's pre-list by subtracting the number of first-update
//! additions at lower indexes, then adding one for each first-update
//! removal at or below the running value. A removal that lands exactly on a
//! first-update addition of the same store key cancels against it and
//! contributes nothing to the composition.

use crate::{RecordId, StoreKey};

/// A normalised update to an ordered list of store keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListUpdate {
    /// Indexes to remove, ascending, relative to the pre-update list.
    pub removed_indexes: Vec<usize>,
    /// Store keys at those indexes, parallel to `removed_indexes`.
    pub removed_store_keys: Vec<StoreKey>,
    /// Indexes to insert at, ascending, relative to the post-update list.
    pub added_indexes: Vec<usize>,
    /// Store keys to insert, parallel to `added_indexes`.
    pub added_store_keys: Vec<StoreKey>,
    /// Some removal could not be located; the applier must truncate at the
    /// first unknown slot.
    pub truncate_at_first_gap: bool,
    /// Authoritative list length after the update, when known.
    pub total: Option<usize>,
    /// The list is only vouched for up to this id; the applier truncates
    /// after it.
    pub up_to_id: Option<RecordId>,
}

impl ListUpdate {
    /// An update that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.removed_indexes.is_empty() && self.added_indexes.is_empty()
    }

    /// Build an update from unsorted (index, key) pairs.
    pub fn from_pairs(
        removed: Vec<(usize, StoreKey)>,
        added: Vec<(usize, StoreKey)>,
    ) -> Self {
        let mut removed = removed;
        let mut added = added;
        removed.sort_by_key(|&(index, _)| index);
        added.sort_by_key(|&(index, _)| index);
        Self {
            removed_indexes: removed.iter().map(|&(i, _)| i).collect(),
            removed_store_keys: removed.iter().map(|&(_, k)| k).collect(),
            added_indexes: added.iter().map(|&(i, _)| i).collect(),
            added_store_keys: added.iter().map(|&(_, k)| k).collect(),
            ..Self::default()
        }
    }

    /// The update that undoes this one.
    ///
    /// Additions become removals and vice versa: an addition's post-list
    /// index is exactly the inverse update's pre-list index, and likewise
    /// for removals.
    pub fn invert(&self) -> Self {
        Self {
            removed_indexes: self.added_indexes.clone(),
            removed_store_keys: self.added_store_keys.clone(),
            added_indexes: self.removed_indexes.clone(),
            added_store_keys: self.removed_store_keys.clone(),
            truncate_at_first_gap: false,
            total: None,
            up_to_id: None,
        }
    }

    /// Fold `self` then `next` into a single update relative to `self`'s
    /// pre-list.
    pub fn compose(&self, next: &ListUpdate) -> ListUpdate {
        // Which of self's additions survive: next may remove an added
        // element at its exact post-index, which cancels the pair.
        let mut cancelled = vec![false; self.added_indexes.len()];

        let mut mapped_removed: Vec<(usize, StoreKey)> = Vec::new();
        'removals: for (&index, &key) in next
            .removed_indexes
            .iter()
            .zip(&next.removed_store_keys)
        {
            for (i, (&add_index, &add_key)) in self
                .added_indexes
                .iter()
                .zip(&self.added_store_keys)
                .enumerate()
            {
                if !cancelled[i] && add_index == index && add_key == key {
                    cancelled[i] = true;
                    continue 'removals;
                }
            }
            mapped_removed.push((self.map_index_to_pre(index), key));
        }

        let mut removed: Vec<(usize, StoreKey)> = self
            .removed_indexes
            .iter()
            .copied()
            .zip(self.removed_store_keys.iter().copied())
            .chain(mapped_removed)
            .collect();
        removed.sort_by_key(|&(index, _)| index);

        // Surviving additions of self, re-based onto next's post-list.
        let mut added: Vec<(usize, StoreKey)> = Vec::new();
        for (i, (&index, &key)) in self
            .added_indexes
            .iter()
            .zip(&self.added_store_keys)
            .enumerate()
        {
            if cancelled[i] {
                continue;
            }
            let removed_below = next.removed_indexes.partition_point(|&r| r < index);
            let mut final_index = index - removed_below;
            for &add in &next.added_indexes {
                if add <= final_index {
                    final_index += 1;
                }
            }
            added.push((final_index, key));
        }
        added.extend(
            next.added_indexes
                .iter()
                .copied()
                .zip(next.added_store_keys.iter().copied()),
        );
        added.sort_by_key(|&(index, _)| index);

        ListUpdate {
            removed_indexes: removed.iter().map(|&(i, _)| i).collect(),
            removed_store_keys: removed.iter().map(|&(_, k)| k).collect(),
            added_indexes: added.iter().map(|&(i, _)| i).collect(),
            added_store_keys: added.iter().map(|&(_, k)| k).collect(),
            truncate_at_first_gap: self.truncate_at_first_gap || next.truncate_at_first_gap,
            total: next.total.or(self.total),
            up_to_id: next.up_to_id.clone().or_else(|| self.up_to_id.clone()),
        }
    }

    /// Map a post-update index back to the pre-update list: drop the slots
    /// this update's additions occupied below it, then walk the removals
    /// back in.
    pub fn map_index_to_pre(&self, index: usize) -> usize {
        let below = self.added_indexes.partition_point(|&a| a < index);
        let mut original = index - below;
        for &removed in &self.removed_indexes {
            if removed <= original {
                original += 1;
            }
        }
        original
    }

    /// Outcome equality: same removed store keys (order-insensitive) and
    /// identical additions.
    pub fn same_effect(&self, other: &ListUpdate) -> bool {
        if self.added_indexes != other.added_indexes
            || self.added_store_keys != other.added_store_keys
        {
            return false;
        }
        let mut a = self.removed_store_keys.clone();
        let mut b = other.removed_store_keys.clone();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

#[cfg(test)]
pub(crate) fn apply_to_dense(list: &[StoreKey], update: &ListUpdate) -> Vec<StoreKey> {
    let mut out = list.to_vec();
    for &index in update.removed_indexes.iter().rev() {
        if index < out.len() {
            out.remove(index);
        }
    }
    for (&index, &key) in update.added_indexes.iter().zip(&update.added_store_keys) {
        if index >= out.len() {
            out.push(key);
        } else {
            out.insert(index, key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sk(n: u64) -> StoreKey {
        StoreKey(n)
    }

    fn update(removed: &[(usize, u64)], added: &[(usize, u64)]) -> ListUpdate {
        ListUpdate::from_pairs(
            removed.iter().map(|&(i, k)| (i, sk(k))).collect(),
            added.iter().map(|&(i, k)| (i, sk(k))).collect(),
        )
    }

    #[test]
    fn invert_swaps_sides() {
        let u = update(&[(1, 2)], &[(0, 9)]);
        let inv = u.invert();
        assert_eq!(inv.removed_indexes, vec![0]);
        assert_eq!(inv.removed_store_keys, vec![sk(9)]);
        assert_eq!(inv.added_indexes, vec![1]);
        assert_eq!(inv.added_store_keys, vec![sk(2)]);
    }

    #[test]
    fn invert_undoes_apply() {
        let list = vec![sk(1), sk(2), sk(3), sk(4)];
        let u = update(&[(1, 2), (3, 4)], &[(0, 9), (2, 8)]);
        let applied = apply_to_dense(&list, &u);
        let restored = apply_to_dense(&applied, &u.invert());
        assert_eq!(restored, list);
    }

    #[test]
    fn compose_plain_removals() {
        // [1,2,3,4] --remove idx1(2)--> [1,3,4] --remove idx1(3)--> [1,4]
        let u1 = update(&[(1, 2)], &[]);
        let u2 = update(&[(1, 3)], &[]);
        let composed = u1.compose(&u2);
        assert_eq!(composed.removed_indexes, vec![1, 2]);
        assert_eq!(composed.removed_store_keys, vec![sk(2), sk(3)]);
        assert!(composed.added_indexes.is_empty());
    }

    #[test]
    fn compose_cancels_add_remove_pair() {
        // u1 inserts 9 at index 1; u2 removes it again.
        let u1 = update(&[], &[(1, 9)]);
        let u2 = update(&[(1, 9)], &[]);
        let composed = u1.compose(&u2);
        assert!(composed.is_empty());
    }

    #[test]
    fn compose_removal_behind_earlier_addition() {
        // [1,2,3] --add 9 at 0--> [9,1,2,3] --remove idx2(2)--> [9,1,3]
        // Relative to the original list, element 2 sat at index 1.
        let u1 = update(&[], &[(0, 9)]);
        let u2 = update(&[(2, 2)], &[]);
        let composed = u1.compose(&u2);
        assert_eq!(composed.removed_indexes, vec![1]);
        assert_eq!(composed.removed_store_keys, vec![sk(2)]);
        assert_eq!(composed.added_indexes, vec![0]);
        assert_eq!(composed.added_store_keys, vec![sk(9)]);
    }

    #[test]
    fn compose_removal_walks_back_over_earlier_removals() {
        // [1,2,3,4] --remove idx0(1)--> [2,3,4] --remove idx2(4)-->
        // element 4 sat at original index 3.
        let u1 = update(&[(0, 1)], &[]);
        let u2 = update(&[(2, 4)], &[]);
        let composed = u1.compose(&u2);
        assert_eq!(composed.removed_indexes, vec![0, 3]);
        assert_eq!(composed.removed_store_keys, vec![sk(1), sk(4)]);
    }

    #[test]
    fn compose_shifts_surviving_additions() {
        // [1,2] --add 9 at 2--> [1,2,9] --remove idx0(1), add 8 at 0-->
        // [8,2,9]: the 9 addition ends at final index 2.
        let u1 = update(&[], &[(2, 9)]);
        let u2 = update(&[(0, 1)], &[(0, 8)]);
        let composed = u1.compose(&u2);
        let list = vec![sk(1), sk(2)];
        assert_eq!(
            apply_to_dense(&list, &composed),
            apply_to_dense(&apply_to_dense(&list, &u1), &u2)
        );
    }

    #[test]
    fn same_effect_ignores_removal_order() {
        let a = update(&[(0, 1), (2, 3)], &[(1, 9)]);
        let b = update(&[(2, 3), (0, 1)], &[(1, 9)]);
        assert!(a.same_effect(&b));
        let c = update(&[(0, 1)], &[(1, 9)]);
        assert!(!a.same_effect(&c));
    }

    // Strategy: a list, a valid update generated against it, and a second
    // update generated against the intermediate result. Removal keys are
    // taken from the list itself so key-identity paths (cancellation) are
    // exercised honestly.
    fn arb_list() -> impl Strategy<Value = Vec<StoreKey>> {
        (1usize..12).prop_map(|len| (1..=len as u64).map(StoreKey).collect())
    }

    fn arb_update_for(list: Vec<StoreKey>, seed: u64) -> impl Strategy<Value = ListUpdate> {
        let len = list.len();
        let removals = proptest::sample::subsequence((0..len).collect::<Vec<_>>(), 0..=len.min(4));
        (removals, proptest::collection::vec(0usize..=len + 2, 0..4)).prop_map(
            move |(removed, add_positions)| {
                let remaining = len - removed.len();
                let removed_pairs: Vec<(usize, StoreKey)> =
                    removed.iter().map(|&i| (i, list[i])).collect();
                let mut added_pairs = Vec::new();
                for (n, pos) in add_positions.into_iter().enumerate() {
                    let index = pos.min(remaining + n);
                    added_pairs.push((index, StoreKey(seed + n as u64)));
                }
                // Keep add indexes unique by nudging duplicates up.
                added_pairs.sort_by_key(|&(i, _)| i);
                let mut last: Option<usize> = None;
                for pair in &mut added_pairs {
                    if let Some(prev) = last {
                        if pair.0 <= prev {
                            pair.0 = prev + 1;
                        }
                    }
                    last = Some(pair.0);
                }
                ListUpdate::from_pairs(removed_pairs, added_pairs)
            },
        )
    }

    fn arb_list_and_update() -> impl Strategy<Value = (Vec<StoreKey>, ListUpdate)> {
        arb_list().prop_flat_map(|list| {
            let update = arb_update_for(list.clone(), 100);
            (Just(list), update)
        })
    }

    proptest! {
        #[test]
        fn prop_invert_roundtrips((list, u) in arb_list_and_update()) {
            let applied = apply_to_dense(&list, &u);
            prop_assert_eq!(apply_to_dense(&applied, &u.invert()), list);
        }

        #[test]
        fn prop_compose_matches_sequential_apply(
            (list, u1, u2) in arb_list_and_update().prop_flat_map(|(list, u1)| {
                let mid = apply_to_dense(&list, &u1);
                let u2 = arb_update_for(mid, 200);
                (Just(list), Just(u1), u2)
            })
        ) {
            let sequential = apply_to_dense(&apply_to_dense(&list, &u1), &u2);
            let composed = apply_to_dense(&list, &u1.compose(&u2));
            prop_assert_eq!(sequential, composed);
        }
    }
}
