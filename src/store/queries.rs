//! Query registration and orchestration.
//!
//! The store owns its queries; applications address them by id. Methods
//! here take the query out of the registry for the duration of a call so
//! the query logic can borrow the store freely, then put it back.

use crate::error::{Result, StoreError};
use crate::event::StoreEvent;
use crate::query::{ClientUpdate, ObserverId, Query, RangeResult, WindowedQuery};
use crate::source::{IdsPacket, QueryUpdate};
use crate::{Status, Store, StoreKey};

impl Store {
    /// Register a query; returns the id used to address it.
    pub fn add_query(&mut self, mut query: Query) -> u64 {
        let id = self.next_query_id;
        self.next_query_id += 1;
        query.base_mut().id = id;
        self.queries.insert(id, query);
        id
    }

    /// Register and immediately fetch.
    pub fn add_and_fetch_query(&mut self, query: Query) -> u64 {
        let id = self.add_query(query);
        let _ = self.fetch_query(id, false);
        id
    }

    /// Deregister a query, releasing its callbacks and observers.
    pub fn remove_query(&mut self, id: u64) -> Option<Query> {
        self.queries.remove(&id)
    }

    pub fn get_query(&self, id: u64) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn get_all_queries(&self) -> impl Iterator<Item = &Query> {
        self.queries.values()
    }

    fn take_query(&mut self, id: u64) -> Result<Query> {
        self.queries.remove(&id).ok_or(StoreError::UnknownQuery(id))
    }

    fn with_windowed<R>(
        &mut self,
        id: u64,
        f: impl FnOnce(&mut WindowedQuery, &mut Store) -> R,
    ) -> Result<R> {
        let mut query = self.take_query(id)?;
        let result = match &mut query {
            Query::Windowed(windowed) => Ok(f(windowed, self)),
            Query::Local(_) => Err(StoreError::UnknownQuery(id)),
        };
        self.queries.insert(id, query);
        result
    }

    /// Recompute a local query or dispatch a windowed query's next source
    /// request. `force` refetches even when nothing looks stale.
    pub fn fetch_query(&mut self, id: u64, force: bool) -> Result<()> {
        let mut query = self.take_query(id)?;
        match &mut query {
            Query::Local(local) => {
                let status = local.base.status;
                if force || status.is(Status::OBSOLETE) || status.is(Status::EMPTY) {
                    let changed = local.recompute(self);
                    if let Some((start, end)) = changed {
                        self.queue_event(StoreEvent::QueryRangeChanged {
                            query_id: id,
                            start,
                            end,
                        });
                    }
                }
            }
            Query::Windowed(windowed) => {
                if let Some(request) = windowed.build_fetch_request(self, force) {
                    self.source.fetch_query(request);
                }
            }
        }
        self.queries.insert(id, query);
        Ok(())
    }

    /// A local query's live results, recomputing first if stale.
    pub fn local_query_keys(&mut self, id: u64) -> Result<Vec<StoreKey>> {
        self.fetch_query(id, false)?;
        match self.queries.get(&id) {
            Some(Query::Local(local)) => Ok(local.store_keys().to_vec()),
            _ => Err(StoreError::UnknownQuery(id)),
        }
    }

    /// A windowed query's current (sparse) list.
    pub fn windowed_query_keys(&self, id: u64) -> Result<Vec<Option<StoreKey>>> {
        match self.queries.get(&id) {
            Some(Query::Windowed(windowed)) => Ok(windowed.store_keys().to_vec()),
            _ => Err(StoreError::UnknownQuery(id)),
        }
    }

    pub fn query_length(&self, id: u64) -> Result<usize> {
        match self.queries.get(&id) {
            Some(Query::Local(local)) => Ok(local.len()),
            Some(Query::Windowed(windowed)) => Ok(windowed.len()),
            None => Err(StoreError::UnknownQuery(id)),
        }
    }

    pub fn query_status(&self, id: u64) -> Result<Status> {
        self.queries
            .get(&id)
            .map(Query::status)
            .ok_or(StoreError::UnknownQuery(id))
    }

    // ------------------------------------------------------------------
    // Windowed query entry points
    // ------------------------------------------------------------------

    /// Deliver an id slice from the source to a windowed query.
    pub fn source_did_fetch_query_ids(&mut self, id: u64, packet: IdsPacket) -> Result<()> {
        self.with_windowed(id, |windowed, store| {
            windowed.source_did_fetch_ids(store, packet)
        })?;
        // A parked stale packet means the query wants a refresh.
        if self.query_status(id)?.is(Status::OBSOLETE) {
            self.fetch_query(id, false)?;
        }
        Ok(())
    }

    /// Deliver a server delta to a windowed query.
    pub fn source_did_fetch_query_update(&mut self, id: u64, update: QueryUpdate) -> Result<()> {
        self.with_windowed(id, |windowed, store| {
            windowed.source_did_fetch_update(store, update)
        })
    }

    /// Apply an optimistic client edit to a windowed query and schedule the
    /// refresh that will confirm or contradict it.
    pub fn client_did_generate_query_update(
        &mut self,
        id: u64,
        update: ClientUpdate,
    ) -> Result<()> {
        self.with_windowed(id, |windowed, store| {
            windowed.client_did_generate_update(store, update)
        })?;
        self.fetch_query(id, false)
    }

    /// Resolve the store keys covering `[start, end)`, fetching any windows
    /// not yet loaded. The callback fires once all covering windows are
    /// ready.
    pub fn query_store_keys_in_range(
        &mut self,
        id: u64,
        start: usize,
        end: usize,
        callback: impl FnOnce(&mut Store, RangeResult) + 'static,
    ) -> Result<()> {
        self.with_windowed(id, |windowed, store| {
            windowed.get_store_keys_for_range(store, start, end, Box::new(callback))
        })?;
        self.fetch_query(id, false)
    }

    /// Resolve the position of a store key in a windowed query, fetching
    /// and asking the source when the position is not locally known.
    pub fn query_index_of_store_key(
        &mut self,
        id: u64,
        key: StoreKey,
        from: usize,
        callback: impl FnOnce(&mut Store, Option<usize>) + 'static,
    ) -> Result<()> {
        self.with_windowed(id, |windowed, store| {
            windowed.index_of_store_key(store, key, from, Box::new(callback))
        })?;
        self.fetch_query(id, false)
    }

    /// Ask a windowed query to load full records over a range.
    pub fn query_request_records(&mut self, id: u64, start: usize, end: usize) -> Result<()> {
        self.with_windowed(id, |windowed, _| {
            windowed.request_records_in_range(start, end)
        })?;
        self.fetch_query(id, false)
    }

    /// Watch `[start, end)`: range-change events fire for it and (for
    /// windowed queries with fetch optimisation) its windows stay eligible
    /// for fetching.
    pub fn add_query_range_observer(
        &mut self,
        id: u64,
        start: usize,
        end: usize,
    ) -> Result<ObserverId> {
        let query = self
            .queries
            .get_mut(&id)
            .ok_or(StoreError::UnknownQuery(id))?;
        let observer = query.base_mut().add_range_observer(start, end);
        Ok(observer)
    }

    pub fn remove_query_range_observer(&mut self, id: u64, observer: ObserverId) -> Result<()> {
        let query = self
            .queries
            .get_mut(&id)
            .ok_or(StoreError::UnknownQuery(id))?;
        query.base_mut().remove_range_observer(observer);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event-driven invalidation
    // ------------------------------------------------------------------

    /// Flip queries OBSOLETE when their underlying data changes; remote
    /// invalidations also schedule a refresh.
    pub(crate) fn invalidate_queries_for_event(&mut self, event: &StoreEvent) {
        match event {
            StoreEvent::TypeChanged { type_name, .. } => {
                for query in self.queries.values_mut() {
                    if let Query::Local(local) = query {
                        if local.matches_type(type_name) {
                            local.base.status |= Status::OBSOLETE;
                        }
                    }
                }
            }
            StoreEvent::ServerInvalidated {
                account_id,
                type_name,
            } => {
                let stale: Vec<u64> = self
                    .queries
                    .iter_mut()
                    .filter_map(|(&id, query)| match query {
                        Query::Windowed(windowed)
                            if windowed.account_id() == account_id
                                && windowed.type_name() == type_name =>
                        {
                            windowed.base.status |= Status::OBSOLETE;
                            Some(id)
                        }
                        _ => None,
                    })
                    .collect();
                for id in stale {
                    let _ = self.fetch_query(id, false);
                }
            }
            _ => {}
        }
    }
}
