//! The store: owner of all record identity, data and status.
//!
//! The store keeps parallel tables keyed by [`StoreKey`]: type, account,
//! status, the data/changed/committed/rollback trio, and liveness counters
//! for eviction. Identity mappings (id to store key and back) survive
//! unloading so late references resolve without minting fresh keys.
//!
//! Mutations are synchronous: they update tables, flip status bits and
//! enqueue notifications on the run loop. Commits coalesce on the `middle`
//! queue. The external [`Source`](crate::Source) performs all I/O and
//! reports back through the `source_did_*` methods in `remote.rs`.

mod commit;
mod queries;
mod remote;

use crate::error::{Result, StoreError};
use crate::event::{ListenerId, Listeners, StoreEvent};
use crate::query::Query;
use crate::record::{Record, RecordResult, SettleOptions};
use crate::runloop::{Queue, RunLoop};
use crate::schema::{AttrKind, RecordType, Schema};
use crate::source::Source;
use crate::{AccountId, JsonMap, RecordId, StateToken, Status, StoreKey, TypeName};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error, trace};

/// Store-wide behaviour switches.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Schedule a commit automatically after every mutation.
    pub auto_commit: bool,
    /// Replay server patches under local dirty edits instead of discarding
    /// the local edits.
    pub rebase_conflicts: bool,
    /// Account used when callers do not name one.
    pub default_account: AccountId,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            auto_commit: true,
            rebase_conflicts: false,
            default_account: "primary".into(),
        }
    }
}

impl StoreOptions {
    pub fn manual_commit(mut self) -> Self {
        self.auto_commit = false;
        self
    }

    pub fn with_rebase_conflicts(mut self) -> Self {
        self.rebase_conflicts = true;
        self
    }

    pub fn with_default_account(mut self, account_id: impl Into<AccountId>) -> Self {
        self.default_account = account_id.into();
        self
    }
}

/// Per-account identity and type-level sync state.
#[derive(Debug, Default)]
struct Account {
    id_to_key: HashMap<TypeName, HashMap<RecordId, StoreKey>>,
    type_status: HashMap<TypeName, Status>,
    client_state: HashMap<TypeName, StateToken>,
    server_state: HashMap<TypeName, StateToken>,
}

struct SettleWatcher {
    key: StoreKey,
    options: SettleOptions,
    callback: Box<dyn FnOnce(&mut Store, RecordResult)>,
}

struct TypeReadyWatcher {
    account_id: AccountId,
    type_names: Vec<TypeName>,
    callback: Box<dyn FnOnce(&mut Store)>,
}

/// The in-memory record cache.
pub struct Store {
    schema: Schema,
    pub(crate) source: Box<dyn Source>,
    options: StoreOptions,

    next_key: u64,
    access_counter: u64,

    // Parallel per-key tables.
    key_type: HashMap<StoreKey, TypeName>,
    key_account: HashMap<StoreKey, AccountId>,
    statuses: HashMap<StoreKey, Status>,
    last_access: HashMap<StoreKey, u64>,
    data: HashMap<StoreKey, JsonMap>,
    changed: HashMap<StoreKey, BTreeSet<String>>,
    committed: HashMap<StoreKey, JsonMap>,
    rollback: HashMap<StoreKey, JsonMap>,
    retain_counts: HashMap<StoreKey, usize>,

    key_to_id: HashMap<StoreKey, RecordId>,
    accounts: HashMap<AccountId, Account>,

    // Pending-commit bookkeeping. A created entry maps to the originating
    // key when the create is one half of a cross-account move; a destroyed
    // entry maps to the replacement key for the same reason.
    created: HashMap<StoreKey, Option<StoreKey>>,
    destroyed: HashMap<StoreKey, Option<StoreKey>>,
    changed_types: BTreeSet<(AccountId, TypeName)>,

    // In-flight commit bookkeeping, keyed the same way.
    committing: bool,
    commit_again: bool,
    commit_scheduled: bool,
    committing_creates: HashMap<StoreKey, Option<StoreKey>>,
    committing_destroys: HashMap<StoreKey, Option<StoreKey>>,
    committing_types: Vec<(AccountId, TypeName)>,
    refetch_after_commit: HashSet<StoreKey>,

    listeners: Listeners,
    pending_events: Vec<StoreEvent>,
    notify_scheduled: bool,
    run_loop: RunLoop<Store>,

    settle_watchers: Vec<SettleWatcher>,
    type_ready_watchers: Vec<TypeReadyWatcher>,

    pub(crate) queries: HashMap<u64, Query>,
    next_query_id: u64,

    diagnostics: Vec<StoreError>,
}

impl Store {
    pub fn new(schema: Schema, source: Box<dyn Source>, options: StoreOptions) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(options.default_account.clone(), Account::default());
        Self {
            schema,
            source,
            options,
            next_key: 1,
            access_counter: 0,
            key_type: HashMap::new(),
            key_account: HashMap::new(),
            statuses: HashMap::new(),
            last_access: HashMap::new(),
            data: HashMap::new(),
            changed: HashMap::new(),
            committed: HashMap::new(),
            rollback: HashMap::new(),
            retain_counts: HashMap::new(),
            key_to_id: HashMap::new(),
            accounts,
            created: HashMap::new(),
            destroyed: HashMap::new(),
            changed_types: BTreeSet::new(),
            committing: false,
            commit_again: false,
            commit_scheduled: false,
            committing_creates: HashMap::new(),
            committing_destroys: HashMap::new(),
            committing_types: Vec::new(),
            refetch_after_commit: HashSet::new(),
            listeners: Listeners::new(),
            pending_events: Vec::new(),
            notify_scheduled: false,
            run_loop: RunLoop::new(),
            settle_watchers: Vec::new(),
            type_ready_watchers: Vec::new(),
            queries: HashMap::new(),
            next_query_id: 1,
            diagnostics: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    fn resolve_account(&self, account_id: Option<AccountId>) -> AccountId {
        account_id.unwrap_or_else(|| self.options.default_account.clone())
    }

    fn account_entry(&mut self, account_id: &AccountId) -> &mut Account {
        self.accounts.entry(account_id.clone()).or_default()
    }

    /// The store key for (account, type, id), minted on first sight.
    ///
    /// Keys are process-unique and stable: the same triple always resolves
    /// to the same key, even after the record's data is unloaded.
    pub fn get_store_key(
        &mut self,
        account_id: Option<AccountId>,
        type_name: &str,
        id: &str,
    ) -> Result<StoreKey> {
        if self.schema.get(type_name).is_none() {
            return Err(StoreError::TypeNotRegistered(type_name.into()));
        }
        let account_id = self.resolve_account(account_id);
        let existing = self
            .accounts
            .get(&account_id)
            .and_then(|acct| acct.id_to_key.get(type_name))
            .and_then(|map| map.get(id))
            .copied();
        if let Some(key) = existing {
            return Ok(key);
        }
        let key = self.mint_key(&account_id, type_name);
        self.key_to_id.insert(key, id.to_string());
        self.account_entry(&account_id)
            .id_to_key
            .entry(type_name.to_string())
            .or_default()
            .insert(id.to_string(), key);
        Ok(key)
    }

    fn mint_key(&mut self, account_id: &AccountId, type_name: &str) -> StoreKey {
        let key = StoreKey(self.next_key);
        self.next_key += 1;
        self.key_type.insert(key, type_name.to_string());
        self.key_account.insert(key, account_id.clone());
        key
    }

    /// Bind a source-assigned id to a key that was created without one.
    pub(crate) fn set_id_for_key(&mut self, key: StoreKey, id: &str) {
        let (Some(type_name), Some(account_id)) = (
            self.key_type.get(&key).cloned(),
            self.key_account.get(&key).cloned(),
        ) else {
            return;
        };
        self.key_to_id.insert(key, id.to_string());
        self.account_entry(&account_id)
            .id_to_key
            .entry(type_name)
            .or_default()
            .insert(id.to_string(), key);
    }

    pub fn id_of(&self, key: StoreKey) -> Option<&RecordId> {
        self.key_to_id.get(&key)
    }

    pub fn account_of(&self, key: StoreKey) -> Option<&AccountId> {
        self.key_account.get(&key)
    }

    pub fn type_of(&self, key: StoreKey) -> Option<&TypeName> {
        self.key_type.get(&key)
    }

    /// The key currently bound to (account, type, id), without minting.
    pub fn lookup_store_key(
        &self,
        account_id: &AccountId,
        type_name: &str,
        id: &str,
    ) -> Option<StoreKey> {
        self.accounts
            .get(account_id)?
            .id_to_key
            .get(type_name)?
            .get(id)
            .copied()
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Current status; EMPTY for keys with no loaded state.
    pub fn get_status(&self, key: StoreKey) -> Status {
        self.statuses.get(&key).copied().unwrap_or(Status::EMPTY)
    }

    /// Force a status word onto a key. Source drivers use this for states
    /// the callbacks cannot infer; settle watchers resolve when the new
    /// status is not in flight.
    pub fn set_status(&mut self, key: StoreKey, status: Status) {
        let old = self.get_status(key);
        if old == status {
            return;
        }
        trace!(%key, %old, new = %status, "status");
        self.statuses.insert(key, status);
        if !status.in_flight() {
            self.resolve_watchers(key, None);
        }
    }

    /// Type-level status for (account, type): LOADING / COMMITTING flags
    /// over a READY base.
    pub fn get_type_status(&self, account_id: Option<&AccountId>, type_name: &str) -> Status {
        let account_id = account_id.unwrap_or(&self.options.default_account);
        self.accounts
            .get(account_id)
            .and_then(|acct| acct.type_status.get(type_name))
            .copied()
            .unwrap_or(Status::EMPTY)
    }

    pub(crate) fn set_type_status(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        status: Status,
    ) {
        self.account_entry(account_id)
            .type_status
            .insert(type_name.to_string(), status);
        self.check_type_ready_watchers();
    }

    /// The last fully assimilated state token for (account, type).
    pub fn get_type_state(&self, account_id: Option<&AccountId>, type_name: &str) -> Option<&StateToken> {
        let account_id = account_id.unwrap_or(&self.options.default_account);
        self.accounts
            .get(account_id)?
            .client_state
            .get(type_name)
    }

    pub(crate) fn client_state(&self, account_id: &AccountId, type_name: &str) -> Option<StateToken> {
        self.accounts
            .get(account_id)
            .and_then(|acct| acct.client_state.get(type_name))
            .cloned()
    }

    pub(crate) fn set_client_state(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        state: StateToken,
    ) {
        self.account_entry(account_id)
            .client_state
            .insert(type_name.to_string(), state);
    }

    pub(crate) fn server_state(&self, account_id: &AccountId, type_name: &str) -> Option<StateToken> {
        self.accounts
            .get(account_id)
            .and_then(|acct| acct.server_state.get(type_name))
            .cloned()
    }

    pub(crate) fn set_server_state(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        state: Option<StateToken>,
    ) {
        let acct = self.account_entry(account_id);
        match state {
            Some(state) => {
                acct.server_state.insert(type_name.to_string(), state);
            }
            None => {
                acct.server_state.remove(type_name);
            }
        }
    }

    /// Run `callback` once every named type is READY in the account.
    pub fn when_type_ready(
        &mut self,
        account_id: Option<AccountId>,
        type_names: impl IntoIterator<Item = impl Into<TypeName>>,
        callback: impl FnOnce(&mut Store) + 'static,
    ) {
        let watcher = TypeReadyWatcher {
            account_id: self.resolve_account(account_id),
            type_names: type_names.into_iter().map(Into::into).collect(),
            callback: Box::new(callback),
        };
        self.type_ready_watchers.push(watcher);
        self.check_type_ready_watchers();
    }

    fn check_type_ready_watchers(&mut self) {
        let mut ready = Vec::new();
        let mut remaining = Vec::new();
        let watchers = std::mem::take(&mut self.type_ready_watchers);
        for watcher in watchers {
            let all_ready = watcher.type_names.iter().all(|type_name| {
                self.accounts
                    .get(&watcher.account_id)
                    .and_then(|acct| acct.type_status.get(type_name))
                    .is_some_and(|s| s.is(Status::READY) && !s.is(Status::LOADING))
            });
            if all_ready {
                ready.push(watcher.callback);
            } else {
                remaining.push(watcher);
            }
        }
        self.type_ready_watchers = remaining;
        for callback in ready {
            self.run_loop.invoke_in(Queue::Middle, callback);
        }
    }

    // ------------------------------------------------------------------
    // Data access
    // ------------------------------------------------------------------

    /// Read record data, updating the liveness counter used for eviction.
    pub fn get_data(&mut self, key: StoreKey) -> Option<&JsonMap> {
        if self.data.contains_key(&key) {
            self.access_counter += 1;
            self.last_access.insert(key, self.access_counter);
        }
        self.data.get(&key)
    }

    /// Read record data without touching liveness.
    pub fn peek_data(&self, key: StoreKey) -> Option<&JsonMap> {
        self.data.get(&key)
    }

    pub(crate) fn committed_data(&self, key: StoreKey) -> Option<&JsonMap> {
        self.committed.get(&key)
    }

    /// The set of locally modified properties since the last commit.
    pub fn changed_properties(&self, key: StoreKey) -> Option<&BTreeSet<String>> {
        self.changed.get(&key)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Install a brand new record, READY|NEW|DIRTY, queued for creation at
    /// the source.
    pub fn create_record(
        &mut self,
        account_id: Option<AccountId>,
        type_name: &str,
        mut data: JsonMap,
    ) -> Result<StoreKey> {
        let Some(record_type) = self.schema.get(type_name) else {
            let err = StoreError::TypeNotRegistered(type_name.into());
            self.did_error(err.clone());
            return Err(err);
        };
        record_type.fill_defaults(&mut data);
        let account_id = self.resolve_account(account_id);
        let key = self.mint_key(&account_id, type_name);
        self.data.insert(key, data);
        self.set_status(key, Status::READY | Status::NEW | Status::DIRTY);
        self.created.insert(key, None);
        self.mark_type_changed(&account_id, type_name);
        self.queue_event(StoreEvent::RecordCreated { key });
        self.schedule_commit();
        debug!(%key, type_name, "created record");
        Ok(key)
    }

    /// Re-install a record at an existing key (undoing a failed create, or
    /// recreating after an in-flight destroy was undone).
    pub(crate) fn reinstall_created(&mut self, key: StoreKey, origin: Option<StoreKey>) {
        self.created.insert(key, origin);
        if let (Some(account_id), Some(type_name)) = (
            self.key_account.get(&key).cloned(),
            self.key_type.get(&key).cloned(),
        ) {
            self.mark_type_changed(&account_id, &type_name);
        }
    }

    /// Merge `patch` into the record's data.
    ///
    /// With `mark_dirty`, the pre-patch data is snapshotted into the
    /// committed table (first dirty write only) and the patched properties
    /// join the changed set. Without it, the patch lands silently, as for
    /// data arriving from the source.
    ///
    /// Returns false (and reports a programming error) if the record is not
    /// READY.
    pub fn update_data(&mut self, key: StoreKey, patch: JsonMap, mark_dirty: bool) -> bool {
        let status = self.get_status(key);
        if !status.is(Status::READY) {
            self.did_error(StoreError::WriteToUnready {
                key,
                status: status.to_string(),
            });
            return false;
        }
        if mark_dirty {
            if !status.is(Status::NEW) && !self.committed.contains_key(&key) {
                let snapshot = self.data.get(&key).cloned().unwrap_or_default();
                self.committed.insert(key, snapshot);
            }
            let changed = self.changed.entry(key).or_default();
            for property in patch.keys() {
                changed.insert(property.clone());
            }
        }
        let data = self.data.entry(key).or_default();
        for (property, value) in patch {
            data.insert(property, value);
        }
        if mark_dirty {
            self.set_status(key, status | Status::DIRTY);
            self.queue_event(StoreEvent::RecordUpdated { key });
            self.schedule_commit();
        }
        if let (Some(account_id), Some(type_name)) = (
            self.key_account.get(&key).cloned(),
            self.key_type.get(&key).cloned(),
        ) {
            self.mark_type_changed(&account_id, &type_name);
        }
        true
    }

    /// Destroy a record.
    ///
    /// A record that was never committed vanishes immediately with no
    /// commit attempt; otherwise it goes DESTROYED|DIRTY and the destroy is
    /// queued for the source.
    pub fn destroy_record(&mut self, key: StoreKey) -> Result<()> {
        let status = self.get_status(key);
        if status.contains(Status::READY | Status::NEW) && !status.is(Status::COMMITTING) {
            self.created.remove(&key);
            self.note_type_changed(key);
            self.queue_event(StoreEvent::RecordDestroyed { key });
            self.unload_now(key);
            return Ok(());
        }
        if !status.is(Status::READY) {
            let err = StoreError::DestroyUnloaded(key);
            self.did_error(err.clone());
            return Err(err);
        }
        self.destroyed.insert(key, None);
        self.set_status(
            key,
            (status & Status::COMMITTING).with_core(Status::DESTROYED) | Status::DIRTY,
        );
        self.note_type_changed(key);
        self.queue_event(StoreEvent::RecordDestroyed { key });
        self.schedule_commit();
        Ok(())
    }

    /// Undo an uncommitted destroy (or flag an in-flight one for
    /// recreation once the source acknowledges it).
    pub fn undestroy_record(&mut self, key: StoreKey) -> Result<()> {
        let status = self.get_status(key);
        if !status.is(Status::DESTROYED) {
            return Ok(());
        }
        if status.is(Status::COMMITTING) {
            // Destroy already in flight: the commit-destroy callback sees
            // this marker and schedules a recreate.
            self.set_status(key, Status::READY | Status::NEW | Status::COMMITTING);
        } else {
            self.destroyed.remove(&key);
            let dirty = self
                .changed
                .get(&key)
                .is_some_and(|changed| !changed.is_empty());
            let mut status = Status::READY;
            if dirty {
                status |= Status::DIRTY;
            }
            self.set_status(key, status);
        }
        self.note_type_changed(key);
        self.schedule_commit();
        Ok(())
    }

    /// Move a record to another account.
    ///
    /// Models the move as a new key in the target account plus a destroy of
    /// the original; the commit pipeline pairs the two into a single
    /// move entry.
    pub fn move_record(&mut self, key: StoreKey, to_account: AccountId) -> Result<StoreKey> {
        let status = self.get_status(key);
        if !status.is(Status::READY) || status.is(Status::NEW | Status::COMMITTING) {
            let err = StoreError::MoveUnready(key);
            self.did_error(err.clone());
            return Err(err);
        }
        let type_name = self
            .key_type
            .get(&key)
            .cloned()
            .ok_or(StoreError::MoveUnready(key))?;
        let data = self.data.get(&key).cloned().unwrap_or_default();

        let new_key = self.mint_key(&to_account, &type_name);
        self.data.insert(new_key, data);
        self.set_status(new_key, Status::READY | Status::NEW | Status::DIRTY);
        self.created.insert(new_key, Some(key));
        self.mark_type_changed(&to_account, &type_name);

        self.destroyed.insert(key, Some(new_key));
        self.set_status(key, Status::DESTROYED | Status::DIRTY);
        self.note_type_changed(key);

        self.queue_event(StoreEvent::RecordDestroyed { key });
        self.queue_event(StoreEvent::RecordCreated { key: new_key });
        self.schedule_commit();
        debug!(%key, %new_key, account = %to_account, "move record");
        Ok(new_key)
    }

    /// Revert uncommitted changes; a never-committed record is destroyed.
    pub fn discard_changes(&mut self, key: StoreKey) -> Result<()> {
        let status = self.get_status(key);
        if status.contains(Status::READY | Status::NEW | Status::DIRTY)
            && !status.is(Status::COMMITTING)
        {
            return self.destroy_record(key);
        }
        if status.is(Status::DIRTY) {
            if let Some(committed) = self.committed.remove(&key) {
                self.data.insert(key, committed);
            }
            self.changed.remove(&key);
            self.set_status(key, status & !Status::DIRTY);
            self.note_type_changed(key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Ask the source for this record's data (EMPTY) or a refresh
    /// (READY|OBSOLETE).
    pub fn fetch_record(&mut self, key: StoreKey) -> Result<()> {
        let status = self.get_status(key);
        let account_id = self
            .key_account
            .get(&key)
            .cloned()
            .ok_or(StoreError::NoId(key))?;
        let type_name = self
            .key_type
            .get(&key)
            .cloned()
            .ok_or(StoreError::NoId(key))?;
        let id = self.key_to_id.get(&key).cloned().ok_or(StoreError::NoId(key))?;
        if status.is(Status::EMPTY) && !status.is(Status::LOADING) {
            self.set_status(key, Status::EMPTY | Status::LOADING);
            self.source.fetch_record(&account_id, &type_name, &id);
        } else if status.contains(Status::READY | Status::OBSOLETE) && !status.in_flight() {
            self.set_status(key, status | Status::LOADING);
            self.source.refresh_record(&account_id, &type_name, &id);
        }
        Ok(())
    }

    /// Fetch every record of a type (or the delta since the assimilated
    /// state token).
    pub fn fetch_all(&mut self, account_id: Option<AccountId>, type_name: &str) -> Result<()> {
        if self.schema.get(type_name).is_none() {
            return Err(StoreError::TypeNotRegistered(type_name.into()));
        }
        let account_id = self.resolve_account(account_id);
        let type_status = self.get_type_status(Some(&account_id), type_name);
        if type_status.is(Status::LOADING) {
            return Ok(());
        }
        self.set_type_status(&account_id, type_name, type_status | Status::LOADING);
        let since = self.client_state(&account_id, type_name);
        self.source
            .fetch_all_records(&account_id, &type_name.to_string(), since.as_ref());
        Ok(())
    }

    /// A record handle for (account, type, id), fetching if nothing is
    /// known about it yet.
    pub fn get_record(
        &mut self,
        account_id: Option<AccountId>,
        type_name: &str,
        id: &str,
    ) -> Result<Record> {
        let key = self.get_store_key(account_id, type_name, id)?;
        if self.get_status(key).is(Status::EMPTY) {
            self.fetch_record(key)?;
        }
        Record::from_key(self, key)
    }

    /// A record handle for an existing key.
    pub fn get_record_from_store_key(&self, key: StoreKey) -> Result<Record> {
        Record::from_key(self, key)
    }

    // ------------------------------------------------------------------
    // Local lookup
    // ------------------------------------------------------------------

    /// Store keys of loaded records of `type_name`, optionally filtered.
    pub fn find_all(
        &self,
        type_name: &str,
        filter: Option<&dyn Fn(&JsonMap) -> bool>,
    ) -> Vec<StoreKey> {
        let mut keys: Vec<StoreKey> = Vec::new();
        for acct in self.accounts.values() {
            let Some(map) = acct.id_to_key.get(type_name) else {
                continue;
            };
            for &key in map.values() {
                if !self.get_status(key).is(Status::READY) {
                    continue;
                }
                if let Some(filter) = filter {
                    match self.data.get(&key) {
                        Some(data) if filter(data) => {}
                        _ => continue,
                    }
                }
                keys.push(key);
            }
        }
        keys.sort_unstable();
        keys
    }

    /// The first loaded record of `type_name` matching `filter`.
    pub fn find_one(
        &self,
        type_name: &str,
        filter: Option<&dyn Fn(&JsonMap) -> bool>,
    ) -> Option<StoreKey> {
        self.find_all(type_name, filter).into_iter().next()
    }

    /// Materialised handles for loaded records, optionally filtered and
    /// sorted by data.
    pub fn get_all(
        &self,
        type_name: &str,
        filter: Option<&dyn Fn(&JsonMap) -> bool>,
        sort: Option<&dyn Fn(&JsonMap, &JsonMap) -> std::cmp::Ordering>,
    ) -> Vec<Record> {
        let mut keys = self.find_all(type_name, filter);
        if let Some(sort) = sort {
            keys.sort_by(|&a, &b| {
                match (self.data.get(&a), self.data.get(&b)) {
                    (Some(da), Some(db)) => sort(da, db),
                    _ => std::cmp::Ordering::Equal,
                }
            });
        }
        keys.into_iter()
            .filter_map(|key| Record::from_key(self, key).ok())
            .collect()
    }

    pub fn get_one(
        &self,
        type_name: &str,
        filter: Option<&dyn Fn(&JsonMap) -> bool>,
    ) -> Option<Record> {
        let key = self.find_one(type_name, filter)?;
        Record::from_key(self, key).ok()
    }

    // ------------------------------------------------------------------
    // Pending-change queries
    // ------------------------------------------------------------------

    /// True if any mutation awaits commit.
    pub fn has_changes(&self) -> bool {
        !self.created.is_empty()
            || !self.destroyed.is_empty()
            || self
                .changed
                .iter()
                .any(|(key, properties)| {
                    !properties.is_empty() && self.get_status(*key).is(Status::DIRTY)
                })
    }

    /// True if any mutation awaits commit for (account, type).
    pub fn has_changes_for_type(&self, account_id: Option<&AccountId>, type_name: &str) -> bool {
        let account_id = account_id.unwrap_or(&self.options.default_account);
        let matches = |key: &StoreKey| {
            self.key_account.get(key) == Some(account_id)
                && self.key_type.get(key).map(String::as_str) == Some(type_name)
        };
        self.created.keys().any(matches)
            || self.destroyed.keys().any(matches)
            || self.changed.iter().any(|(key, properties)| {
                !properties.is_empty() && self.get_status(*key).is(Status::DIRTY) && matches(key)
            })
    }

    /// Schedule a commit if anything is pending.
    pub fn check_for_changes(&mut self) {
        if self.has_changes() {
            self.schedule_commit_always();
        }
    }

    // ------------------------------------------------------------------
    // Unloading / eviction
    // ------------------------------------------------------------------

    /// True if the record can be dropped from memory: not COMMITTING, NEW
    /// or DIRTY, not retained, and not awaited by a settle watcher.
    pub fn may_unload_record(&self, key: StoreKey) -> bool {
        let status = self.get_status(key);
        if status.is(Status::UNSAVED) {
            return false;
        }
        if self.retain_counts.get(&key).copied().unwrap_or(0) > 0 {
            return false;
        }
        !self.settle_watchers.iter().any(|w| w.key == key)
    }

    /// Drop the record's data and status, keeping the id mapping so late
    /// references still resolve to the same key. Returns false if the
    /// record is not unloadable.
    pub fn unload_record(&mut self, key: StoreKey) -> bool {
        if !self.may_unload_record(key) {
            return false;
        }
        self.unload_now(key);
        true
    }

    pub(crate) fn unload_now(&mut self, key: StoreKey) {
        self.data.remove(&key);
        self.changed.remove(&key);
        self.committed.remove(&key);
        self.rollback.remove(&key);
        self.statuses.remove(&key);
        self.last_access.remove(&key);
    }

    /// Evict least-recently-accessed records of a type until at most
    /// `budget` remain loaded. Returns how many were unloaded.
    pub fn prune_type(&mut self, type_name: &str, budget: usize) -> usize {
        let mut candidates: Vec<(u64, StoreKey)> = self
            .data
            .keys()
            .filter(|key| self.key_type.get(key).map(String::as_str) == Some(type_name))
            .map(|&key| (self.last_access.get(&key).copied().unwrap_or(0), key))
            .collect();
        if candidates.len() <= budget {
            return 0;
        }
        candidates.sort_unstable();
        let mut loaded = candidates.len();
        let mut unloaded = 0;
        for (_, key) in candidates {
            if loaded <= budget {
                break;
            }
            if self.unload_record(key) {
                loaded -= 1;
                unloaded += 1;
            }
        }
        unloaded
    }

    pub fn retain_record(&mut self, key: StoreKey) {
        *self.retain_counts.entry(key).or_insert(0) += 1;
    }

    pub fn release_record(&mut self, key: StoreKey) {
        if let Some(count) = self.retain_counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.retain_counts.remove(&key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Events & scheduling
    // ------------------------------------------------------------------

    pub fn on(
        &mut self,
        listener: impl FnMut(&StoreEvent) -> crate::EventFlow + 'static,
    ) -> ListenerId {
        self.listeners.add(Box::new(listener))
    }

    pub fn off(&mut self, id: ListenerId) {
        self.listeners.remove(id);
    }

    pub(crate) fn queue_event(&mut self, event: StoreEvent) {
        self.pending_events.push(event);
        if !self.notify_scheduled {
            self.notify_scheduled = true;
            self.run_loop
                .invoke_in(Queue::Middle, |store| store.deliver_events());
        }
    }

    fn deliver_events(&mut self) {
        self.notify_scheduled = false;
        let events = std::mem::take(&mut self.pending_events);
        for event in &events {
            self.invalidate_queries_for_event(event);
        }
        for event in &events {
            self.listeners.notify(event);
        }
    }

    /// Deliver a commit error synchronously: the revert decision depends on
    /// whether a listener or settle watcher claims the error type.
    pub(crate) fn notify_commit_error(&mut self, key: StoreKey, error: &crate::CommitError) -> bool {
        let claimed = self.settle_watchers.iter().any(|watcher| {
            watcher.key == key
                && watcher
                    .options
                    .handled_error_types
                    .contains(&error.error_type)
        });
        let prevented = self.listeners.notify(&StoreEvent::RecordCommitError {
            key,
            error: error.clone(),
        });
        claimed || prevented
    }

    fn mark_type_changed(&mut self, account_id: &AccountId, type_name: &str) {
        self.changed_types
            .insert((account_id.clone(), type_name.to_string()));
        self.queue_event(StoreEvent::TypeChanged {
            account_id: account_id.clone(),
            type_name: type_name.to_string(),
        });
    }

    pub(crate) fn note_type_changed(&mut self, key: StoreKey) {
        if let (Some(account_id), Some(type_name)) = (
            self.key_account.get(&key).cloned(),
            self.key_type.get(&key).cloned(),
        ) {
            self.mark_type_changed(&account_id, &type_name);
        }
    }

    pub(crate) fn schedule_commit(&mut self) {
        if self.options.auto_commit {
            self.schedule_commit_always();
        }
    }

    pub(crate) fn schedule_commit_always(&mut self) {
        if self.commit_scheduled {
            return;
        }
        self.commit_scheduled = true;
        self.run_loop.invoke_in(Queue::Middle, |store| {
            store.commit_scheduled = false;
            store.commit_changes();
        });
    }

    /// Run a task on the next drain, with full store access.
    pub(crate) fn defer(&mut self, task: impl FnOnce(&mut Store) + 'static) {
        self.run_loop.invoke_in(Queue::Middle, task);
    }

    /// Drain the run loop: scheduled commits, event fan-out, watcher
    /// callbacks. Call once per turn after a batch of mutations, or after
    /// driving source callbacks.
    pub fn flush(&mut self) {
        while let Some(task) = self.run_loop.next_task() {
            task(self);
        }
    }

    // ------------------------------------------------------------------
    // Settle watchers
    // ------------------------------------------------------------------

    pub(crate) fn when_settled(
        &mut self,
        key: StoreKey,
        options: SettleOptions,
        callback: Box<dyn FnOnce(&mut Store, RecordResult)>,
    ) {
        let status = self.get_status(key);
        if !status.in_flight() {
            let result = RecordResult {
                key,
                status,
                error: None,
            };
            self.run_loop
                .invoke_in(Queue::Middle, move |store| callback(store, result));
            return;
        }
        self.settle_watchers.push(SettleWatcher {
            key,
            options,
            callback,
        });
    }

    /// Install a settled status and resolve watchers with the outcome in
    /// one step, so the delivered result carries both the final status and
    /// the error.
    pub(crate) fn settle_status(
        &mut self,
        key: StoreKey,
        status: Status,
        error: Option<crate::CommitError>,
    ) {
        trace!(%key, new = %status, "settle");
        self.statuses.insert(key, status);
        self.resolve_watchers(key, error);
    }

    pub(crate) fn resolve_watchers(&mut self, key: StoreKey, error: Option<crate::CommitError>) {
        if self.settle_watchers.iter().all(|w| w.key != key) {
            return;
        }
        let status = self.get_status(key);
        let mut kept = Vec::new();
        let mut resolved = Vec::new();
        for watcher in self.settle_watchers.drain(..) {
            if watcher.key == key {
                resolved.push(watcher.callback);
            } else {
                kept.push(watcher);
            }
        }
        self.settle_watchers = kept;
        for callback in resolved {
            let result = RecordResult {
                key,
                status,
                error: error.clone(),
            };
            self.run_loop
                .invoke_in(Queue::Middle, move |store| callback(store, result));
        }
    }

    // ------------------------------------------------------------------
    // Doppelganger translation
    // ------------------------------------------------------------------

    /// Rewrite a record's data so its references resolve in this store:
    /// source store keys go out to ids, then back in to this store's keys.
    /// Non-syncable properties and the primary key are dropped.
    pub(crate) fn translate_doppelganger(
        &mut self,
        source_store: &Store,
        type_name: &str,
        data: JsonMap,
    ) -> Result<JsonMap> {
        let record_type: RecordType = self
            .schema
            .get(type_name)
            .ok_or_else(|| StoreError::TypeNotRegistered(type_name.into()))?
            .clone();
        let mut out = JsonMap::new();
        for (property, value) in data {
            if !record_type.is_syncable(&property) {
                continue;
            }
            let value = match record_type.attribute(&property).map(|a| &a.kind) {
                Some(AttrKind::Scalar) | None => value,
                Some(kind) => {
                    let kind = kind.clone();
                    self.translate_ref_value(source_store, &kind, value)?
                }
            };
            out.insert(property, value);
        }
        Ok(out)
    }

    fn translate_ref_value(
        &mut self,
        source_store: &Store,
        kind: &AttrKind,
        value: Value,
    ) -> Result<Value> {
        let target = kind.target().cloned().unwrap_or_default();
        let mut translate_one = |store: &mut Store, value: &Value| -> Value {
            let Some(raw) = value.as_u64() else {
                return value.clone();
            };
            let key = StoreKey(raw);
            let (Some(id), Some(account_id)) =
                (source_store.id_of(key), source_store.account_of(key))
            else {
                return Value::Null;
            };
            match store.get_store_key(Some(account_id.clone()), &target, id) {
                Ok(local) => Value::Number(local.0.into()),
                Err(_) => Value::Null,
            }
        };
        Ok(match kind {
            AttrKind::Scalar => value,
            AttrKind::ToOne(_) => translate_one(self, &value),
            AttrKind::ToManyList(_) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| translate_one(self, item))
                        .collect(),
                ),
                other => other,
            },
            AttrKind::ToManyMap(_) => match value {
                Value::Object(map) => Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), translate_one(self, v)))
                        .collect(),
                ),
                other => other,
            },
        })
    }

    /// Same-store record clone: a fresh NEW record with the syncable
    /// attributes of `key`.
    pub fn clone_record(&mut self, key: StoreKey) -> Result<StoreKey> {
        let type_name = self
            .key_type
            .get(&key)
            .cloned()
            .ok_or(StoreError::DestroyUnloaded(key))?;
        let account_id = self.key_account.get(&key).cloned();
        let data = self
            .data
            .get(&key)
            .cloned()
            .ok_or(StoreError::DestroyUnloaded(key))?;
        let record_type = self
            .schema
            .get(&type_name)
            .ok_or_else(|| StoreError::TypeNotRegistered(type_name.clone()))?;
        let mut out = JsonMap::new();
        for (property, value) in data {
            if record_type.is_syncable(&property) {
                out.insert(property, value);
            }
        }
        self.create_record(account_id, &type_name, out)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub(crate) fn did_error(&mut self, err: StoreError) {
        error!(%err, "store misuse");
        self.diagnostics.push(err);
    }

    /// Programming errors reported so far; mostly useful in tests.
    pub fn diagnostics(&self) -> &[StoreError] {
        &self.diagnostics
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("records", &self.statuses.len())
            .field("loaded", &self.data.len())
            .field("queries", &self.queries.len())
            .field("committing", &self.committing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use crate::source::NullSource;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new().with_type(
            RecordType::new("note")
                .with_attribute(Attribute::new("id"))
                .with_attribute(Attribute::new("body").with_default(json!(""))),
        )
    }

    fn store() -> Store {
        Store::new(schema(), Box::new(NullSource), StoreOptions::default())
    }

    fn map(pairs: &[(&str, Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn store_key_is_stable_per_identity() {
        let mut store = store();
        let a = store.get_store_key(None, "note", "n1").unwrap();
        let b = store.get_store_key(None, "note", "n1").unwrap();
        assert_eq!(a, b);
        let other_account = store
            .get_store_key(Some("work".into()), "note", "n1")
            .unwrap();
        assert_ne!(a, other_account);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut store = store();
        assert!(matches!(
            store.get_store_key(None, "missing", "x"),
            Err(StoreError::TypeNotRegistered(_))
        ));
    }

    #[test]
    fn update_data_snapshots_committed_once() {
        let mut store = store();
        let key = store.get_store_key(None, "note", "n1").unwrap();
        store.set_status(key, Status::READY);
        store.data.insert(key, map(&[("body", json!("v0"))]));

        store.update_data(key, map(&[("body", json!("v1"))]), true);
        store.update_data(key, map(&[("body", json!("v2"))]), true);

        assert_eq!(
            store.committed_data(key).unwrap().get("body"),
            Some(&json!("v0"))
        );
        assert!(store.get_status(key).is(Status::DIRTY));
        assert!(store.changed_properties(key).unwrap().contains("body"));
    }

    #[test]
    fn update_data_rejects_unready() {
        let mut store = store();
        let key = store.get_store_key(None, "note", "n1").unwrap();
        assert!(!store.update_data(key, map(&[("body", json!("x"))]), true));
        assert!(matches!(
            store.diagnostics()[0],
            StoreError::WriteToUnready { .. }
        ));
        assert!(store.peek_data(key).is_none());
    }

    #[test]
    fn discard_restores_data_changed_and_status() {
        let mut store = store();
        let key = store.get_store_key(None, "note", "n1").unwrap();
        store.set_status(key, Status::READY);
        store.data.insert(key, map(&[("body", json!("v0"))]));

        store.update_data(key, map(&[("body", json!("v1"))]), true);
        store.discard_changes(key).unwrap();

        assert_eq!(store.peek_data(key).unwrap().get("body"), Some(&json!("v0")));
        assert_eq!(store.get_status(key), Status::READY);
        assert!(store.changed_properties(key).is_none());
    }

    #[test]
    fn destroy_of_uncommitted_unloads_immediately() {
        let mut store = store();
        let key = store
            .create_record(None, "note", map(&[("body", json!("draft"))]))
            .unwrap();
        store.destroy_record(key).unwrap();
        assert_eq!(store.get_status(key), Status::EMPTY);
        assert!(store.peek_data(key).is_none());
        assert!(!store.has_changes());
    }

    #[test]
    fn destroy_then_undestroy_restores_ready() {
        let mut store = store();
        let key = store.get_store_key(None, "note", "n1").unwrap();
        store.set_status(key, Status::READY);
        store.data.insert(key, map(&[("body", json!("kept"))]));

        store.destroy_record(key).unwrap();
        assert!(store.get_status(key).contains(Status::DESTROYED | Status::DIRTY));

        store.undestroy_record(key).unwrap();
        assert_eq!(store.get_status(key), Status::READY);
        assert!(!store.has_changes());
    }

    #[test]
    fn unload_refuses_unsaved_and_retained() {
        let mut store = store();
        let key = store
            .create_record(None, "note", JsonMap::new())
            .unwrap();
        assert!(!store.may_unload_record(key));

        let clean = store.get_store_key(None, "note", "n2").unwrap();
        store.set_status(clean, Status::READY);
        store.data.insert(clean, JsonMap::new());
        store.retain_record(clean);
        assert!(!store.may_unload_record(clean));
        store.release_record(clean);
        assert!(store.unload_record(clean));
        assert_eq!(store.get_status(clean), Status::EMPTY);
        // The identity mapping survives unloading.
        assert_eq!(store.lookup_store_key(&"primary".into(), "note", "n2"), Some(clean));
    }

    #[test]
    fn prune_unloads_least_recently_accessed() {
        let mut store = store();
        let mut keys = Vec::new();
        for i in 0..4 {
            let key = store
                .get_store_key(None, "note", &format!("n{i}"))
                .unwrap();
            store.set_status(key, Status::READY);
            store.data.insert(key, JsonMap::new());
            keys.push(key);
        }
        // Touch all in order, then re-touch the first: n0 becomes the most
        // recently used.
        for &key in &keys {
            store.get_data(key);
        }
        store.get_data(keys[0]);

        let unloaded = store.prune_type("note", 2);
        assert_eq!(unloaded, 2);
        assert!(store.peek_data(keys[0]).is_some());
        assert!(store.peek_data(keys[1]).is_none());
        assert!(store.peek_data(keys[2]).is_none());
        assert!(store.peek_data(keys[3]).is_some());
    }

    #[test]
    fn events_are_deferred_until_flush() {
        let mut store = store();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(0));
        {
            let seen = std::rc::Rc::clone(&seen);
            store.on(move |event| {
                if matches!(event, StoreEvent::TypeChanged { .. }) {
                    *seen.borrow_mut() += 1;
                }
                crate::EventFlow::Continue
            });
        }
        store
            .create_record(None, "note", JsonMap::new())
            .unwrap();
        assert_eq!(*seen.borrow(), 0);
        store.flush();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn clone_record_copies_syncable_data_without_id() {
        let mut store = store();
        let key = store.get_store_key(None, "note", "n1").unwrap();
        store.set_status(key, Status::READY);
        store
            .data
            .insert(key, map(&[("id", json!("n1")), ("body", json!("text"))]));

        let copy = store.clone_record(key).unwrap();
        let data = store.peek_data(copy).unwrap();
        assert_eq!(data.get("body"), Some(&json!("text")));
        assert!(data.get("id").is_none());
        assert!(store
            .get_status(copy)
            .contains(Status::READY | Status::NEW | Status::DIRTY));
    }
}
