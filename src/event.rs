//! Store events and the listener registry.
//!
//! Mutations never call listeners synchronously: the store accumulates
//! events and delivers them when the run loop drains, so observers only see
//! settled state. Listeners receive event payloads by reference and cannot
//! re-enter the store from inside a notification.

use crate::{AccountId, CommitError, StoreKey, TypeName};

/// Events emitted by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Records of this type changed in this account (any CRUD, local or
    /// remote).
    TypeChanged {
        account_id: AccountId,
        type_name: TypeName,
    },
    /// The server advertised a newer state for this (account, type); remote
    /// queries should refresh.
    ServerInvalidated {
        account_id: AccountId,
        type_name: TypeName,
    },
    /// A commit is about to be handed to the source.
    WillCommit,
    /// The source finished processing a commit.
    DidCommit,
    /// A record was created by application code.
    RecordCreated { key: StoreKey },
    /// A record's data was changed by application code.
    RecordUpdated { key: StoreKey },
    /// A record was destroyed by application code.
    RecordDestroyed { key: StoreKey },
    /// The source permanently rejected a commit for this record. Returning
    /// [`EventFlow::PreventDefault`] suppresses the store's revert.
    RecordCommitError {
        key: StoreKey,
        error: CommitError,
    },
    /// A windowed query applied an update; literal removed/added slices.
    QueryUpdated {
        query_id: u64,
        removed: Vec<StoreKey>,
        added: Vec<(usize, StoreKey)>,
    },
    /// A windowed query loaded ids for one or more windows.
    QueryIdsLoaded { query_id: u64 },
    /// A query's contents changed within `[start, end)`.
    QueryRangeChanged {
        query_id: u64,
        start: usize,
        end: usize,
    },
}

/// What a listener wants done after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFlow {
    /// Let the store's default handling proceed.
    #[default]
    Continue,
    /// Suppress default handling. Only meaningful for
    /// [`StoreEvent::RecordCommitError`].
    PreventDefault,
}

/// Opaque handle for deregistering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

type Listener = Box<dyn FnMut(&StoreEvent) -> EventFlow>;

/// Registry of event listeners, notified in registration order.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Notify every listener; true if any asked to prevent default handling.
    pub fn notify(&mut self, event: &StoreEvent) -> bool {
        let mut prevented = false;
        for (_, listener) in &mut self.entries {
            if listener(event) == EventFlow::PreventDefault {
                prevented = true;
            }
        }
        prevented
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn listeners_notified_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut listeners = Listeners::new();
        for tag in ["a", "b"] {
            let seen = Rc::clone(&seen);
            listeners.add(Box::new(move |_| {
                seen.borrow_mut().push(tag);
                EventFlow::Continue
            }));
        }
        listeners.notify(&StoreEvent::WillCommit);
        assert_eq!(*seen.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn remove_stops_notification() {
        let count = Rc::new(RefCell::new(0));
        let mut listeners = Listeners::new();
        let id = {
            let count = Rc::clone(&count);
            listeners.add(Box::new(move |_| {
                *count.borrow_mut() += 1;
                EventFlow::Continue
            }))
        };
        listeners.notify(&StoreEvent::WillCommit);
        listeners.remove(id);
        listeners.notify(&StoreEvent::WillCommit);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn prevent_default_propagates() {
        let mut listeners = Listeners::new();
        listeners.add(Box::new(|_| EventFlow::Continue));
        listeners.add(Box::new(|_| EventFlow::PreventDefault));
        assert!(listeners.notify(&StoreEvent::WillCommit));
    }
}
