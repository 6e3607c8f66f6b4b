//! Windowed remote queries: a server-ordered list displayed in fixed-size
//! windows, kept current through state-token delta updates, with
//! preemptive client edits reconciled against server responses.
//!
//! The list of store keys is sparse: a `None` slot is a position whose id
//! is not yet known. Each window carries its own little state machine for
//! id and record fetching. All index arithmetic against server packets
//! goes through the update algebra in [`super::algebra`].

use super::algebra::ListUpdate;
use super::QueryBase;
use crate::event::StoreEvent;
use crate::source::{FetchRange, IdsPacket, QueryFetchRequest, QueryUpdate};
use crate::{AccountId, RecordId, StateToken, Status, Store, StoreKey, TypeName};
use tracing::{debug, warn};

/// Per-window fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState(pub u8);

impl WindowState {
    pub const EMPTY: WindowState = WindowState(0);
    /// Ids wanted but not yet asked of the source.
    pub const REQUESTED: WindowState = WindowState(1);
    /// Ids in flight.
    pub const LOADING: WindowState = WindowState(1 << 1);
    /// Every id in the window is known.
    pub const READY: WindowState = WindowState(1 << 2);
    /// Full records wanted, not just ids.
    pub const RECORDS_REQUESTED: WindowState = WindowState(1 << 3);
    /// Records in flight.
    pub const RECORDS_LOADING: WindowState = WindowState(1 << 4);

    #[inline]
    pub fn is(self, mask: WindowState) -> bool {
        self.0 & mask.0 != 0
    }
}

impl std::ops::BitOr for WindowState {
    type Output = WindowState;
    fn bitor(self, rhs: WindowState) -> WindowState {
        WindowState(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for WindowState {
    fn bitor_assign(&mut self, rhs: WindowState) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for WindowState {
    type Output = WindowState;
    fn bitand(self, rhs: WindowState) -> WindowState {
        WindowState(self.0 & rhs.0)
    }
}

impl std::ops::Not for WindowState {
    type Output = WindowState;
    fn not(self) -> WindowState {
        WindowState(!self.0)
    }
}

/// An optimistic client-side edit to the query's list.
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub removed: Vec<StoreKey>,
    pub added: Vec<(usize, StoreKey)>,
}

/// Delivered to a range callback once the covering windows are ready.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeResult {
    pub start: usize,
    pub end: usize,
    pub store_keys: Vec<Option<StoreKey>>,
}

pub type RangeCallback = Box<dyn FnOnce(&mut Store, RangeResult)>;
pub type IndexOfCallback = Box<dyn FnOnce(&mut Store, Option<usize>)>;

struct IndexOfLookup {
    key: StoreKey,
    id: RecordId,
    from: usize,
    callback: IndexOfCallback,
}

struct RangeLookup {
    start: usize,
    end: usize,
    callback: RangeCallback,
}

const DEFAULT_WINDOW_SIZE: usize = 30;

/// A paged remote query with delta updates and preemptive reconciliation.
pub struct WindowedQuery {
    pub(crate) base: QueryBase,
    account_id: AccountId,
    type_name: TypeName,
    window_size: usize,
    /// Windows of slack around observed ranges kept eligible for fetching.
    prefetch: usize,
    optimise_fetching: bool,
    can_get_delta_updates: bool,

    store_keys: Vec<Option<StoreKey>>,
    windows: Vec<WindowState>,
    length: usize,
    query_state: Option<StateToken>,

    preemptive_updates: Vec<ListUpdate>,
    waiting_packets: Vec<IdsPacket>,
    index_of_requested: Vec<IndexOfLookup>,
    awaiting_id_fetch: Vec<RangeLookup>,
    explicit_id_fetch: bool,
}

impl WindowedQuery {
    pub fn new(account_id: impl Into<AccountId>, type_name: impl Into<TypeName>) -> Self {
        Self {
            base: QueryBase::new(),
            account_id: account_id.into(),
            type_name: type_name.into(),
            window_size: DEFAULT_WINDOW_SIZE,
            prefetch: 1,
            optimise_fetching: false,
            can_get_delta_updates: true,
            store_keys: Vec::new(),
            windows: Vec::new(),
            length: 0,
            query_state: None,
            preemptive_updates: Vec::new(),
            waiting_packets: Vec::new(),
            index_of_requested: Vec::new(),
            awaiting_id_fetch: Vec::new(),
            explicit_id_fetch: false,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Only fetch windows a live range observer can see (plus prefetch
    /// slack).
    pub fn optimise_fetching(mut self) -> Self {
        self.optimise_fetching = true;
        self
    }

    /// The source cannot compute deltas: any state advance resets the
    /// query instead of patching it.
    pub fn without_delta_updates(mut self) -> Self {
        self.can_get_delta_updates = false;
        self
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn query_state(&self) -> Option<&StateToken> {
        self.query_state.as_ref()
    }

    /// The sparse list; `None` slots are unknown positions.
    pub fn store_keys(&self) -> &[Option<StoreKey>] {
        &self.store_keys
    }

    pub fn window_state(&self, window_index: usize) -> WindowState {
        self.windows
            .get(window_index)
            .copied()
            .unwrap_or(WindowState::EMPTY)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn pending_preemptive_count(&self) -> usize {
        self.preemptive_updates.len()
    }

    /// True when every position below `len` has a known id.
    pub fn all_ids_loaded(&self) -> bool {
        self.query_state.is_some()
            && self.store_keys.len() >= self.length
            && self.store_keys[..self.length].iter().all(Option::is_some)
    }

    // ------------------------------------------------------------------
    // Window bookkeeping
    // ------------------------------------------------------------------

    fn natural_window_count(&self) -> usize {
        if self.length == 0 {
            0
        } else {
            (self.length - 1) / self.window_size + 1
        }
    }

    fn ensure_windows(&mut self) {
        let natural = self.natural_window_count();
        if self.windows.len() < natural {
            self.windows.resize(natural, WindowState::EMPTY);
        } else if self.length > 0 && self.windows.len() > natural {
            self.windows.truncate(natural);
        }
        // With no known length, windows grown for pending requests stay.
    }

    fn window_span(&self, start: usize, end: usize) -> std::ops::RangeInclusive<usize> {
        let last = end.saturating_sub(1).max(start);
        (start / self.window_size)..=(last / self.window_size)
    }

    fn grow_windows_to(&mut self, window_index: usize) {
        if self.windows.len() <= window_index {
            self.windows.resize(window_index + 1, WindowState::EMPTY);
        }
    }

    /// Recompute READY for every window from `from_index` on; any window
    /// touched by a mutation also loses its (implicit) records-ready state,
    /// which is recomputed lazily at fetch time.
    fn recompute_ready_from(&mut self, from_index: usize) {
        let first_window = from_index / self.window_size;
        for window_index in first_window..self.windows.len() {
            let start = window_index * self.window_size;
            let end = ((window_index + 1) * self.window_size).min(self.length);
            let ready = start < end
                && end <= self.store_keys.len()
                && self.store_keys[start..end].iter().all(Option::is_some);
            let state = self.windows[window_index];
            self.windows[window_index] = if ready {
                (state & !(WindowState::REQUESTED | WindowState::LOADING)) | WindowState::READY
            } else {
                state & !WindowState::READY
            };
        }
    }

    fn range_ready(&self, start: usize, end: usize) -> bool {
        if end <= start {
            return true;
        }
        self.window_span(start, end)
            .all(|w| self.window_state(w).is(WindowState::READY))
    }

    fn slice(&self, start: usize, end: usize) -> Vec<Option<StoreKey>> {
        (start..end)
            .map(|i| self.store_keys.get(i).copied().flatten())
            .collect()
    }

    fn is_window_observed(&self, window_index: usize) -> bool {
        self.base.range_observers.iter().any(|observer| {
            if observer.end <= observer.start {
                return false;
            }
            let mut span = self.window_span(observer.start, observer.end);
            let first = span.next().unwrap_or(0).saturating_sub(self.prefetch);
            let last = (observer.end.saturating_sub(1)) / self.window_size + self.prefetch;
            (first..=last).contains(&window_index)
        })
    }

    fn records_ready(&self, store: &Store, window_index: usize) -> bool {
        let start = window_index * self.window_size;
        let end = ((window_index + 1) * self.window_size).min(self.length);
        if start >= end {
            return true;
        }
        self.store_keys[start..end.min(self.store_keys.len())]
            .iter()
            .all(|slot| match slot {
                Some(key) => store.get_status(*key).is(Status::READY),
                None => false,
            })
            && end <= self.store_keys.len()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Ask for the ids (and records) around an index range.
    pub(crate) fn get_store_keys_for_range(
        &mut self,
        store: &mut Store,
        start: usize,
        end: usize,
        callback: RangeCallback,
    ) {
        let end = if self.query_state.is_some() {
            end.min(self.length)
        } else {
            end
        };
        if end <= start {
            store.defer(move |s| {
                callback(
                    s,
                    RangeResult {
                        start,
                        end,
                        store_keys: Vec::new(),
                    },
                );
            });
            return;
        }
        let mut all_ready = true;
        let span = self.window_span(start, end);
        for window_index in span {
            self.grow_windows_to(window_index);
            if !self.windows[window_index].is(WindowState::READY) {
                self.windows[window_index] |= WindowState::REQUESTED;
                self.explicit_id_fetch = true;
                all_ready = false;
            }
        }
        if all_ready {
            let store_keys = self.slice(start, end);
            store.defer(move |s| {
                callback(
                    s,
                    RangeResult {
                        start,
                        end,
                        store_keys,
                    },
                );
            });
        } else {
            self.awaiting_id_fetch.push(RangeLookup {
                start,
                end,
                callback,
            });
        }
    }

    /// Ask for full records (not just ids) over a range.
    pub(crate) fn request_records_in_range(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let span = self.window_span(start, end);
        for window_index in span {
            self.grow_windows_to(window_index);
            self.windows[window_index] |= WindowState::RECORDS_REQUESTED;
        }
    }

    /// Where does this key sit in the result set? Resolves immediately when
    /// the position is known or knowable; otherwise the lookup is parked
    /// and handed to the source.
    pub(crate) fn index_of_store_key(
        &mut self,
        store: &mut Store,
        key: StoreKey,
        from: usize,
        callback: IndexOfCallback,
    ) {
        let found = self
            .store_keys
            .iter()
            .skip(from)
            .position(|slot| *slot == Some(key))
            .map(|offset| offset + from);
        if let Some(index) = found {
            store.defer(move |s| callback(s, Some(index)));
            return;
        }
        if self.all_ids_loaded() {
            store.defer(move |s| callback(s, None));
            return;
        }
        let Some(id) = store.id_of(key).cloned() else {
            store.defer(move |s| callback(s, None));
            return;
        };
        self.index_of_requested.push(IndexOfLookup {
            key,
            id,
            from,
            callback,
        });
    }

    /// Build the next source request from the window states. Returns `None`
    /// when there is nothing to ask for.
    pub(crate) fn build_fetch_request(
        &mut self,
        store: &Store,
        force: bool,
    ) -> Option<QueryFetchRequest> {
        // A query that has never loaded anything bootstraps with its first
        // window.
        if self.query_state.is_none() && self.windows.is_empty() {
            self.windows.push(WindowState::REQUESTED);
        }

        let mut id_ranges: Vec<FetchRange> = Vec::new();
        let mut record_ranges: Vec<FetchRange> = Vec::new();
        for window_index in 0..self.windows.len() {
            let state = self.windows[window_index];
            let mut want_ids = state.is(WindowState::REQUESTED)
                && !state.is(WindowState::LOADING)
                && !state.is(WindowState::READY);
            let mut want_records = state.is(WindowState::RECORDS_REQUESTED)
                && !state.is(WindowState::RECORDS_LOADING)
                && !self.records_ready(store, window_index);
            if self.optimise_fetching
                && !self.explicit_id_fetch
                && !self.is_window_observed(window_index)
            {
                // Nobody is looking at this window any more.
                if want_ids || want_records {
                    self.windows[window_index] = state
                        & !(WindowState::REQUESTED | WindowState::RECORDS_REQUESTED);
                }
                want_ids = false;
                want_records = false;
            }
            if want_records && !state.is(WindowState::READY) {
                // Records need their ids first.
                want_ids = true;
            }
            if want_ids {
                self.windows[window_index] |= WindowState::LOADING;
                push_coalesced(&mut id_ranges, window_index, self.window_size);
            }
            if want_records {
                self.windows[window_index] |= WindowState::RECORDS_LOADING;
                push_coalesced(&mut record_ranges, window_index, self.window_size);
            }
        }

        let index_of: Vec<RecordId> = self
            .index_of_requested
            .iter()
            .map(|lookup| lookup.id.clone())
            .collect();
        let refresh = self.base.status.is(Status::OBSOLETE);

        self.explicit_id_fetch = false;
        if id_ranges.is_empty()
            && record_ranges.is_empty()
            && index_of.is_empty()
            && !refresh
            && !force
        {
            return None;
        }
        if refresh {
            // DIRTY tracks edits made after the refresh now going out; a
            // response already reflecting our preemptives can then be told
            // apart from one that raced them.
            self.base.status = self.base.status & !Status::DIRTY;
        }
        Some(QueryFetchRequest {
            query_id: self.base.id,
            account_id: self.account_id.clone(),
            type_name: self.type_name.clone(),
            query_state: self.query_state.clone(),
            id_ranges,
            record_ranges,
            index_of,
            refresh,
        })
    }

    // ------------------------------------------------------------------
    // Packets
    // ------------------------------------------------------------------

    /// Merge an id slice from the source.
    pub(crate) fn source_did_fetch_ids(&mut self, store: &mut Store, packet: IdsPacket) {
        if self.query_state.as_ref() != Some(&packet.query_state) {
            if self.query_state.is_none() {
                self.query_state = Some(packet.query_state.clone());
            } else if self.can_get_delta_updates {
                // Out of order: park it until the matching delta arrives.
                warn!(query = self.base.id, "id packet for stale state, deferring");
                self.waiting_packets.push(packet);
                self.base.status |= Status::OBSOLETE;
                return;
            } else {
                // No deltas possible: start over at the packet's state.
                debug!(query = self.base.id, "state advanced without deltas, resetting");
                let old_length = self.length;
                self.store_keys.clear();
                self.windows.clear();
                self.preemptive_updates.clear();
                self.length = 0;
                self.query_state = Some(packet.query_state.clone());
                self.base.status = self.base.status & !Status::DIRTY;
                store.queue_event(StoreEvent::QueryRangeChanged {
                    query_id: self.base.id,
                    start: 0,
                    end: old_length,
                });
            }
        }

        let mut position = packet.position;
        let mut keys: Vec<StoreKey> = packet
            .ids
            .iter()
            .filter_map(|id| {
                store
                    .get_store_key(Some(self.account_id.clone()), &self.type_name, id)
                    .ok()
            })
            .collect();
        let mut total = packet.total;

        // The packet describes the server's list; preemptive edits applied
        // locally shift everything under it.
        if !self.preemptive_updates.is_empty() {
            let cumulative = compose_all(&self.preemptive_updates);
            for &removed in cumulative.removed_indexes.iter().rev() {
                if removed < position {
                    position -= 1;
                } else if removed < position + keys.len() {
                    keys.remove(removed - position);
                }
            }
            for (&added, &key) in cumulative
                .added_indexes
                .iter()
                .zip(&cumulative.added_store_keys)
            {
                if added < position {
                    position += 1;
                } else if added - position <= keys.len() {
                    keys.insert(added - position, key);
                }
            }
            total = (total + cumulative.added_indexes.len())
                .saturating_sub(cumulative.removed_indexes.len());
        }

        if self.store_keys.len() < position + keys.len() {
            self.store_keys.resize(position + keys.len(), None);
        }
        for (offset, key) in keys.iter().enumerate() {
            self.store_keys[position + offset] = Some(*key);
        }
        self.length = total;
        if self.store_keys.len() > self.length {
            self.store_keys.truncate(self.length);
        }
        self.ensure_windows();
        if !keys.is_empty() || self.length > 0 {
            let span = self.window_span(position, (position + keys.len()).max(position + 1));
            for window_index in span {
                if let Some(state) = self.windows.get_mut(window_index) {
                    *state = *state & !WindowState::LOADING;
                }
            }
        }
        self.recompute_ready_from(position);
        self.base.status = self.base.status.with_core(Status::READY);

        store.queue_event(StoreEvent::QueryIdsLoaded {
            query_id: self.base.id,
        });
        store.queue_event(StoreEvent::QueryRangeChanged {
            query_id: self.base.id,
            start: position,
            end: position + keys.len(),
        });
        self.resolve_pending(store);
    }

    /// Reconcile a server delta against the current list and any
    /// outstanding preemptive updates.
    pub(crate) fn source_did_fetch_update(&mut self, store: &mut Store, update: QueryUpdate) {
        if self.query_state.as_ref() == Some(&update.new_query_state) {
            // Already at this state (a fetch beat the delta here). Any
            // still-pending preemptives were folded into that fetch: take
            // them back out, unless new edits arrived since.
            if !self.preemptive_updates.is_empty() && !self.base.status.is(Status::DIRTY) {
                let cumulative = compose_all(&self.preemptive_updates);
                self.preemptive_updates.clear();
                self.apply_update(store, cumulative.invert());
            }
            return;
        }
        if self.query_state.is_some() && self.query_state.as_ref() != Some(&update.old_query_state)
        {
            warn!(query = self.base.id, "delta against unknown state");
            self.base.status |= Status::OBSOLETE;
            return;
        }

        self.query_state = Some(update.new_query_state.clone());
        self.base.status = self.base.status & !Status::OBSOLETE;

        let removed_keys: Vec<StoreKey> = update
            .removed
            .iter()
            .filter_map(|id| {
                store
                    .get_store_key(Some(self.account_id.clone()), &self.type_name, id)
                    .ok()
            })
            .collect();
        let added: Vec<(usize, StoreKey)> = update
            .added
            .iter()
            .filter_map(|added| {
                store
                    .get_store_key(Some(self.account_id.clone()), &self.type_name, &added.id)
                    .ok()
                    .map(|key| (added.index, key))
            })
            .collect();

        if self.preemptive_updates.is_empty() {
            let normalized = self.normalize_server_update(removed_keys, added, &update, None);
            self.apply_update(store, normalized);
            return;
        }

        // Cumulative compositions [p1, p1 then p2, ...].
        let mut cumulative: Vec<ListUpdate> = Vec::with_capacity(self.preemptive_updates.len());
        for update in &self.preemptive_updates {
            let next = match cumulative.last() {
                Some(prev) => prev.compose(update),
                None => update.clone(),
            };
            cumulative.push(next);
        }
        let full = cumulative.last().cloned().unwrap_or_default();
        let normalized =
            self.normalize_server_update(removed_keys, added, &update, Some(&full));

        if let Some(confirmed) = cumulative.iter().position(|c| normalized.same_effect(c)) {
            // The server confirmed a prefix of our preemptives verbatim.
            debug!(query = self.base.id, confirmed, "preemptives confirmed");
            self.preemptive_updates.drain(..=confirmed);
            if self.preemptive_updates.is_empty() {
                self.base.status = self.base.status & !Status::DIRTY;
                self.length = update.total;
                if self.store_keys.len() > self.length {
                    self.store_keys.truncate(self.length);
                }
                self.ensure_windows();
            }
            store.queue_event(StoreEvent::QueryUpdated {
                query_id: self.base.id,
                removed: normalized.removed_store_keys.clone(),
                added: normalized
                    .added_indexes
                    .iter()
                    .copied()
                    .zip(normalized.added_store_keys.iter().copied())
                    .collect(),
            });
            self.drain_waiting_packets(store);
        } else {
            // Contradiction: back the preemptives out, then apply the
            // server's truth.
            debug!(query = self.base.id, "preemptives contradicted, rebasing");
            let combined = full.invert().compose(&normalized);
            self.preemptive_updates.clear();
            self.base.status = self.base.status & !Status::DIRTY;
            self.apply_update(store, combined);
        }
    }

    /// Register and apply an optimistic client edit.
    pub(crate) fn client_did_generate_update(&mut self, store: &mut Store, update: ClientUpdate) {
        let mut removed_pairs: Vec<(usize, StoreKey)> = Vec::new();
        for key in update.removed {
            // Unknown removals are silently ignored.
            if let Some(index) = self.store_keys.iter().position(|slot| *slot == Some(key)) {
                removed_pairs.push((index, key));
            }
        }
        let normalized = ListUpdate::from_pairs(removed_pairs, update.added);
        if normalized.is_empty() {
            return;
        }
        self.apply_update(store, normalized.clone());
        self.preemptive_updates.push(normalized);
        self.base.status |= Status::DIRTY | Status::OBSOLETE;
    }

    // ------------------------------------------------------------------
    // Applying updates
    // ------------------------------------------------------------------

    fn normalize_server_update(
        &self,
        removed_keys: Vec<StoreKey>,
        added: Vec<(usize, StoreKey)>,
        update: &QueryUpdate,
        cumulative: Option<&ListUpdate>,
    ) -> ListUpdate {
        let mut truncate_at_first_gap = false;
        let mut removed_pairs: Vec<(usize, StoreKey)> = Vec::new();
        for key in removed_keys {
            let cumulative_index = cumulative.and_then(|c| {
                c.removed_store_keys
                    .iter()
                    .position(|&k| k == key)
                    .map(|i| c.removed_indexes[i])
            });
            if let Some(index) = cumulative_index {
                // The client already removed it; its original index is on
                // record.
                removed_pairs.push((index, key));
                continue;
            }
            match self.store_keys.iter().position(|slot| *slot == Some(key)) {
                Some(index) => {
                    // Current-list position; rebased through the preemptives
                    // when any are outstanding.
                    let index = match cumulative {
                        Some(c) => c.map_index_to_pre(index),
                        None => index,
                    };
                    removed_pairs.push((index, key));
                }
                None => {
                    truncate_at_first_gap = true;
                }
            }
        }

        let mut added_pairs = added;
        // An id removed and re-added at the same position is a no-op.
        added_pairs.retain(|&(index, key)| {
            if let Some(at) = removed_pairs
                .iter()
                .position(|&(r_index, r_key)| r_key == key && r_index == index)
            {
                removed_pairs.remove(at);
                false
            } else {
                true
            }
        });

        let mut normalized = ListUpdate::from_pairs(removed_pairs, added_pairs);
        normalized.truncate_at_first_gap = truncate_at_first_gap;
        normalized.total = Some(update.total);
        normalized.up_to_id = update.up_to_id.clone();
        normalized
    }

    /// The apply algorithm: truncation, removals high to low, gap
    /// truncation, sparse insertion, window recompute, events, deferred
    /// packet replay.
    fn apply_update(&mut self, store: &mut Store, update: ListUpdate) {
        let old_length = self.length;
        let mut first_change = usize::MAX;
        let mut removed_count = 0usize;
        let mut added_count = 0usize;

        if let Some(up_to) = &update.up_to_id {
            let up_key =
                store.lookup_store_key(&self.account_id, &self.type_name, up_to);
            let position =
                up_key.and_then(|key| self.store_keys.iter().rposition(|slot| *slot == Some(key)));
            match position {
                Some(p) if self.store_keys.len() > p + 1 => {
                    self.store_keys.truncate(p + 1);
                    first_change = first_change.min(p + 1);
                }
                Some(_) => {}
                None => {
                    self.reset(store);
                    return;
                }
            }
        }

        for &index in update.removed_indexes.iter().rev() {
            if index < self.store_keys.len() {
                self.store_keys.remove(index);
                removed_count += 1;
                first_change = first_change.min(index);
            } else if index < old_length {
                // A position past the loaded tail: the slot was never
                // loaded, the length shrinks regardless.
                removed_count += 1;
                first_change = first_change.min(self.store_keys.len());
            }
        }

        if update.truncate_at_first_gap {
            if let Some(gap) = self.store_keys.iter().position(Option::is_none) {
                self.store_keys.truncate(gap);
                first_change = first_change.min(gap);
            }
        }

        for (&index, &key) in update.added_indexes.iter().zip(&update.added_store_keys) {
            if index >= self.store_keys.len() {
                self.store_keys.resize(index, None);
                self.store_keys.push(Some(key));
            } else {
                self.store_keys.insert(index, Some(key));
            }
            added_count += 1;
            first_change = first_change.min(index);
        }

        self.length = update
            .total
            .unwrap_or_else(|| (old_length + added_count).saturating_sub(removed_count));
        if self.store_keys.len() > self.length {
            self.store_keys.truncate(self.length);
        }
        self.ensure_windows();
        if first_change == usize::MAX {
            if old_length != self.length {
                first_change = old_length.min(self.length);
            } else {
                first_change = self.length;
            }
        }
        self.recompute_ready_from(first_change);

        store.queue_event(StoreEvent::QueryUpdated {
            query_id: self.base.id,
            removed: update.removed_store_keys.clone(),
            added: update
                .added_indexes
                .iter()
                .copied()
                .zip(update.added_store_keys.iter().copied())
                .collect(),
        });
        let end = old_length.max(self.length);
        if first_change < end {
            store.queue_event(StoreEvent::QueryRangeChanged {
                query_id: self.base.id,
                start: first_change,
                end,
            });
        }
        self.resolve_pending(store);
        self.drain_waiting_packets(store);
    }

    /// Forget everything and start over: the server's list has diverged
    /// beyond patching.
    fn reset(&mut self, store: &mut Store) {
        let old_length = self.length;
        self.store_keys.clear();
        self.windows.clear();
        self.preemptive_updates.clear();
        self.waiting_packets.clear();
        self.length = 0;
        self.query_state = None;
        self.base.status = Status::EMPTY | Status::OBSOLETE;
        store.queue_event(StoreEvent::QueryRangeChanged {
            query_id: self.base.id,
            start: 0,
            end: old_length,
        });
    }

    fn drain_waiting_packets(&mut self, store: &mut Store) {
        if self.waiting_packets.is_empty() {
            return;
        }
        let packets = std::mem::take(&mut self.waiting_packets);
        let (matching, rest): (Vec<_>, Vec<_>) = packets
            .into_iter()
            .partition(|packet| Some(&packet.query_state) == self.query_state.as_ref());
        self.waiting_packets = rest;
        for packet in matching {
            self.source_did_fetch_ids(store, packet);
        }
    }

    fn resolve_pending(&mut self, store: &mut Store) {
        let lookups = std::mem::take(&mut self.awaiting_id_fetch);
        for lookup in lookups {
            let RangeLookup {
                start,
                end,
                callback,
            } = lookup;
            let end = end.min(self.length.max(start));
            if self.range_ready(start, end) {
                let store_keys = self.slice(start, end);
                store.defer(move |s| {
                    callback(
                        s,
                        RangeResult {
                            start,
                            end,
                            store_keys,
                        },
                    );
                });
            } else {
                self.awaiting_id_fetch.push(RangeLookup {
                    start,
                    end,
                    callback,
                });
            }
        }

        let lookups = std::mem::take(&mut self.index_of_requested);
        for lookup in lookups {
            let IndexOfLookup {
                key,
                id,
                from,
                callback,
            } = lookup;
            let found = self
                .store_keys
                .iter()
                .skip(from)
                .position(|slot| *slot == Some(key))
                .map(|offset| offset + from);
            if let Some(index) = found {
                store.defer(move |s| callback(s, Some(index)));
            } else if self.all_ids_loaded() {
                store.defer(move |s| callback(s, None));
            } else {
                self.index_of_requested.push(IndexOfLookup {
                    key,
                    id,
                    from,
                    callback,
                });
            }
        }
    }
}

fn compose_all(updates: &[ListUpdate]) -> ListUpdate {
    let mut iter = updates.iter();
    let Some(first) = iter.next() else {
        return ListUpdate::empty();
    };
    iter.fold(first.clone(), |acc, update| acc.compose(update))
}

fn push_coalesced(ranges: &mut Vec<FetchRange>, window_index: usize, window_size: usize) {
    let start = window_index * window_size;
    if let Some(last) = ranges.last_mut() {
        if last.start + last.count == start {
            last.count += window_size;
            return;
        }
    }
    ranges.push(FetchRange {
        start,
        count: window_size,
    });
}
