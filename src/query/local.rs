//! In-process filter/sort queries over loaded records.
//!
//! A local query is a live array of store keys. It observes its types
//! through the store's change events: any change flips it OBSOLETE, and the
//! next read recomputes by scanning the loaded records. The filter and
//! sort run over record data only, so a recompute never re-enters the
//! store.

use super::QueryBase;
use crate::{JsonMap, Status, Store, StoreKey, TypeName};
use std::cmp::Ordering;

/// Predicate over record data.
pub type Filter = Box<dyn Fn(&JsonMap) -> bool>;
/// Comparator over record data.
pub type SortCmp = Box<dyn Fn(&JsonMap, &JsonMap) -> Ordering>;

/// A client-side query: filter and sort over records already in memory.
pub struct LocalQuery {
    pub(crate) base: QueryBase,
    type_name: TypeName,
    depends_on: Vec<TypeName>,
    filter: Option<Filter>,
    sort: Option<SortCmp>,
    store_keys: Vec<StoreKey>,
}

impl LocalQuery {
    pub fn new(type_name: impl Into<TypeName>) -> Self {
        let type_name = type_name.into();
        Self {
            base: QueryBase::new(),
            depends_on: vec![type_name.clone()],
            type_name,
            filter: None,
            sort: None,
            store_keys: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: impl Fn(&JsonMap) -> bool + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn with_sort(mut self, sort: impl Fn(&JsonMap, &JsonMap) -> Ordering + 'static) -> Self {
        self.sort = Some(Box::new(sort));
        self
    }

    /// Also recompute when these types change (for filters that read
    /// through references).
    pub fn also_depends_on(
        mut self,
        types: impl IntoIterator<Item = impl Into<TypeName>>,
    ) -> Self {
        self.depends_on.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub(crate) fn matches_type(&self, type_name: &str) -> bool {
        self.depends_on.iter().any(|t| t == type_name)
    }

    /// The current result list. Stale while OBSOLETE; the store refreshes
    /// it on access.
    pub fn store_keys(&self) -> &[StoreKey] {
        &self.store_keys
    }

    pub fn len(&self) -> usize {
        self.store_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store_keys.is_empty()
    }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.store_keys.contains(&key)
    }

    pub fn index_of(&self, key: StoreKey) -> Option<usize> {
        self.store_keys.iter().position(|&k| k == key)
    }

    /// Rescan the store and rebuild the result list. Returns the changed
    /// index range, if anything moved.
    pub(crate) fn recompute(&mut self, store: &Store) -> Option<(usize, usize)> {
        let mut keys = store.find_all(
            &self.type_name,
            self.filter.as_ref().map(|f| {
                let f: &dyn Fn(&JsonMap) -> bool = f.as_ref();
                f
            }),
        );
        if let Some(sort) = &self.sort {
            keys.sort_by(|&a, &b| match (store.peek_data(a), store.peek_data(b)) {
                (Some(da), Some(db)) => sort(da, db),
                _ => Ordering::Equal,
            });
        }
        let changed = diff_range(&self.store_keys, &keys);
        self.store_keys = keys;
        self.base.status = Status::READY;
        changed
    }
}

/// The smallest `[start, end)` covering every position where the two lists
/// differ.
fn diff_range(old: &[StoreKey], new: &[StoreKey]) -> Option<(usize, usize)> {
    if old == new {
        return None;
    }
    let mut start = 0;
    let limit = old.len().min(new.len());
    while start < limit && old[start] == new[start] {
        start += 1;
    }
    let mut old_end = old.len();
    let mut new_end = new.len();
    while old_end > start && new_end > start && old[old_end - 1] == new[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }
    Some((start, old_end.max(new_end)))
}
