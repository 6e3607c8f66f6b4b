//! Live queries over the store: local filter/sort queries and windowed
//! remote queries.

pub mod algebra;
mod local;
mod windowed;

pub use algebra::ListUpdate;
pub use local::{Filter, LocalQuery, SortCmp};
pub use windowed::{
    ClientUpdate, IndexOfCallback, RangeCallback, RangeResult, WindowState, WindowedQuery,
};

use crate::Status;

/// Handle for deregistering a range observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// A half-open index range some consumer is watching.
#[derive(Debug, Clone, Copy)]
pub struct RangeObserver {
    pub(crate) id: ObserverId,
    pub start: usize,
    pub end: usize,
}

/// State shared by both query kinds: identity, status, range observers.
#[derive(Debug, Default)]
pub(crate) struct QueryBase {
    pub(crate) id: u64,
    pub(crate) status: Status,
    pub(crate) range_observers: Vec<RangeObserver>,
    pub(crate) next_observer_id: u64,
}

impl QueryBase {
    pub(crate) fn new() -> Self {
        Self {
            id: 0,
            status: Status::EMPTY,
            range_observers: Vec::new(),
            next_observer_id: 1,
        }
    }

    pub(crate) fn add_range_observer(&mut self, start: usize, end: usize) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.range_observers.push(RangeObserver { id, start, end });
        id
    }

    pub(crate) fn remove_range_observer(&mut self, id: ObserverId) {
        self.range_observers.retain(|observer| observer.id != id);
    }
}

/// A query registered with a store.
pub enum Query {
    Local(LocalQuery),
    Windowed(WindowedQuery),
}

impl Query {
    pub fn id(&self) -> u64 {
        self.base().id
    }

    pub fn status(&self) -> Status {
        self.base().status
    }

    pub(crate) fn base(&self) -> &QueryBase {
        match self {
            Query::Local(q) => &q.base,
            Query::Windowed(q) => &q.base,
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut QueryBase {
        match self {
            Query::Local(q) => &mut q.base,
            Query::Windowed(q) => &mut q.base,
        }
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Query::Local(q) => f
                .debug_struct("LocalQuery")
                .field("id", &q.base.id)
                .field("len", &q.store_keys().len())
                .finish(),
            Query::Windowed(q) => f
                .debug_struct("WindowedQuery")
                .field("id", &q.base.id)
                .field("len", &q.len())
                .finish(),
        }
    }
}
