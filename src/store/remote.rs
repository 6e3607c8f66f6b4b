//! Source callbacks: the other half of the commit pipeline, plus record
//! fetch results and type-level state reconciliation.
//!
//! Everything here is invoked by the source (or by whatever drives it) on
//! the store's thread, after the matching request. Incoming data is in wire
//! form; it is translated on ingress so reference slots hold store keys
//! before touching the data tables.

use crate::error::CommitError;
use crate::event::StoreEvent;
use crate::schema::{AttrKind, RecordType};
use crate::{AccountId, JsonMap, RecordId, StateToken, Status, Store, StoreKey, TypeName};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

impl Store {
    // ------------------------------------------------------------------
    // Commit acknowledgements
    // ------------------------------------------------------------------

    /// The source created these records; each patch carries at least the
    /// new id, plus any server-computed attributes.
    pub fn source_did_commit_create(&mut self, results: HashMap<StoreKey, JsonMap>) {
        for (key, wire_patch) in results {
            let origin = self.committing_creates.remove(&key);
            let status = self.get_status(key);
            let Some(record_type) = self.type_record_type(key) else {
                continue;
            };
            let account_id = self.account_of(key).cloned().unwrap_or_default();

            // Install the server id before anything else so egress of any
            // reference to this record resolves.
            let pk_wire = record_type
                .attribute(record_type.primary_key())
                .map(|a| a.key.clone())
                .unwrap_or_else(|| record_type.primary_key().to_string());
            if let Some(Value::String(id)) = wire_patch.get(&pk_wire) {
                self.set_id_for_key(key, id);
            }

            // The create was the receiving half of a move: the original is
            // done for.
            if let Some(Some(from_key)) = origin {
                self.committing_destroys.remove(&from_key);
                self.set_status(from_key, Status::DESTROYED);
                self.unload_now(from_key);
                self.note_type_changed(from_key);
            }

            if status.is(Status::DESTROYED) {
                // Destroyed while the create was in flight; it exists now,
                // so the destroy goes out on the next commit.
                self.destroyed.insert(key, None);
                self.set_status(key, Status::DESTROYED | Status::DIRTY);
                self.note_type_changed(key);
                self.schedule_commit();
                continue;
            }

            let patch = self.ingress_record(&account_id, &record_type, &wire_patch);
            self.update_data(key, patch, false);
            self.set_status(key, Status::READY | (status & Status::DIRTY));
            self.note_type_changed(key);
        }
    }

    /// The source failed to create these records.
    ///
    /// Permanent, unhandled failures destroy the record; anything else goes
    /// back to READY|NEW|DIRTY for the next commit.
    pub fn source_did_not_create(
        &mut self,
        keys: &[StoreKey],
        is_permanent: bool,
        mut errors: HashMap<StoreKey, CommitError>,
    ) {
        for &key in keys {
            let origin = self.committing_creates.remove(&key);
            let error = errors.remove(&key);
            let handled = match &error {
                Some(error) => self.notify_commit_error(key, error),
                None => false,
            };
            if is_permanent && !handled {
                warn!(%key, "create permanently rejected");
                if let Some(Some(from_key)) = origin {
                    // Undo the move: the original comes back to life.
                    self.committing_destroys.remove(&from_key);
                    let from_status = self.get_status(from_key);
                    self.set_status(from_key, from_status.with_core(Status::READY) & !Status::COMMITTING);
                    self.note_type_changed(from_key);
                }
                self.settle_status(key, Status::DESTROYED, error);
                self.queue_event(StoreEvent::RecordDestroyed { key });
                self.note_type_changed(key);
                self.unload_now(key);
            } else {
                self.settle_status(key, Status::READY | Status::NEW | Status::DIRTY, error);
                if let Some(Some(from_key)) = origin {
                    self.committing_destroys.remove(&from_key);
                    self.destroyed.insert(from_key, Some(key));
                    let from_status = self.get_status(from_key);
                    self.set_status(from_key, (from_status & !Status::COMMITTING) | Status::DIRTY);
                }
                self.reinstall_created(key, origin.flatten());
                self.schedule_commit();
            }
        }
    }

    /// The source applied these updates.
    pub fn source_did_commit_update(&mut self, keys: &[StoreKey]) {
        for &key in keys {
            self.rollback.remove(&key);
            let status = self.get_status(key);
            self.set_status(key, status & !Status::COMMITTING);
        }
    }

    /// The source failed to update these records.
    ///
    /// The committed baseline is restored from rollback and the changed set
    /// recomputed against current data. Permanent, unhandled failures also
    /// revert the data itself.
    pub fn source_did_not_update(
        &mut self,
        keys: &[StoreKey],
        is_permanent: bool,
        mut errors: HashMap<StoreKey, CommitError>,
    ) {
        for &key in keys {
            let error = errors.remove(&key);
            let handled = match &error {
                Some(error) => self.notify_commit_error(key, error),
                None => false,
            };
            if let Some(baseline) = self.rollback.remove(&key) {
                // Newer local edits may have snapshotted a committed state
                // that was never accepted; the rollback data is the truth.
                self.committed.insert(key, baseline);
            }
            let status = self.get_status(key);
            let changed = self.recompute_changed(key);
            if is_permanent && !handled {
                warn!(%key, "update permanently rejected");
                if let Some(committed) = self.committed.remove(&key) {
                    self.data.insert(key, committed);
                }
                self.changed.remove(&key);
                self.settle_status(key, status & !(Status::COMMITTING | Status::DIRTY), error);
                self.note_type_changed(key);
            } else if changed {
                self.settle_status(key, (status & !Status::COMMITTING) | Status::DIRTY, error);
                self.note_type_changed(key);
                self.schedule_commit();
            } else {
                self.committed.remove(&key);
                self.changed.remove(&key);
                self.settle_status(key, status & !(Status::COMMITTING | Status::DIRTY), error);
            }
        }
    }

    /// The source destroyed these records.
    pub fn source_did_commit_destroy(&mut self, keys: &[StoreKey]) {
        for &key in keys {
            self.committing_destroys.remove(&key);
            let status = self.get_status(key);
            if status.contains(Status::READY | Status::NEW) {
                // Undestroyed while the destroy was in flight: it no longer
                // exists remotely, so recreate it.
                self.set_status(key, Status::READY | Status::NEW | Status::DIRTY);
                self.reinstall_created(key, None);
                self.schedule_commit();
            } else {
                self.set_status(key, Status::DESTROYED);
                self.unload_now(key);
            }
        }
    }

    /// The source failed to destroy these records.
    pub fn source_did_not_destroy(
        &mut self,
        keys: &[StoreKey],
        is_permanent: bool,
        mut errors: HashMap<StoreKey, CommitError>,
    ) {
        for &key in keys {
            self.committing_destroys.remove(&key);
            let error = errors.remove(&key);
            let handled = match &error {
                Some(error) => self.notify_commit_error(key, error),
                None => false,
            };
            let status = self.get_status(key);
            if is_permanent && !handled {
                warn!(%key, "destroy permanently rejected");
                // The record lives on: back to READY.
                self.settle_status(
                    key,
                    status.with_core(Status::READY) & !Status::COMMITTING,
                    error,
                );
                self.note_type_changed(key);
            } else {
                self.destroyed.insert(key, None);
                self.settle_status(
                    key,
                    (status & !Status::COMMITTING).with_core(Status::DESTROYED) | Status::DIRTY,
                    error,
                );
                self.schedule_commit();
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetch results
    // ------------------------------------------------------------------

    /// Records fetched from the source, in wire form.
    ///
    /// With `is_all`, loaded records of this (account, type) missing from
    /// the response are treated as remotely destroyed. Records in other
    /// accounts are untouched even if the type matches.
    pub fn source_did_fetch_records(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        records: Vec<JsonMap>,
        state: Option<StateToken>,
        is_all: bool,
    ) {
        let Some(record_type) = self.schema().get(type_name).cloned() else {
            return;
        };
        let pk_wire = record_type
            .attribute(record_type.primary_key())
            .map(|a| a.key.clone())
            .unwrap_or_else(|| record_type.primary_key().to_string());

        let mut seen: BTreeSet<StoreKey> = BTreeSet::new();
        for wire in records {
            let Some(id) = wire.get(&pk_wire).and_then(Value::as_str).map(String::from) else {
                continue;
            };
            let Ok(key) = self.get_store_key(Some(account_id.clone()), type_name, &id) else {
                continue;
            };
            seen.insert(key);
            let status = self.get_status(key);
            if status.is(Status::COMMITTING) {
                self.refetch_after_commit.insert(key);
                continue;
            }
            if status.is(Status::DESTROYED) {
                // A local destroy is pending; the server will hear about it
                // before this data matters again.
                continue;
            }
            let data = self.ingress_record(account_id, &record_type, &wire);
            if status.is(Status::READY) {
                if status.is(Status::DIRTY) {
                    self.apply_server_patch_to_dirty(key, data);
                } else {
                    self.data.insert(key, data);
                    self.set_status(key, Status::READY);
                }
            } else {
                self.data.insert(key, data);
                self.set_status(key, Status::READY);
            }
        }

        if is_all {
            let loaded: Vec<(RecordId, StoreKey)> = self
                .accounts
                .get(account_id)
                .and_then(|acct| acct.id_to_key.get(type_name))
                .map(|map| {
                    map.iter()
                        .filter(|(_, key)| {
                            !seen.contains(key) && self.get_status(**key).is(Status::READY)
                        })
                        .map(|(id, &key)| (id.clone(), key))
                        .collect()
                })
                .unwrap_or_default();
            if !loaded.is_empty() {
                let ids: Vec<RecordId> = loaded.into_iter().map(|(id, _)| id).collect();
                self.source_did_destroy_records(account_id, type_name, &ids);
            }
        }

        let type_status = self.get_type_status(Some(account_id), type_name);
        self.set_type_status(
            account_id,
            type_name,
            (type_status & !Status::LOADING).with_core(Status::READY),
        );
        self.queue_event(StoreEvent::TypeChanged {
            account_id: account_id.clone(),
            type_name: type_name.to_string(),
        });

        if let Some(state) = state {
            self.set_client_state(account_id, type_name, state);
        }
        self.check_server_state(account_id, type_name);
    }

    /// Per-record patches, keyed by id.
    ///
    /// COMMITTING records are flagged for a refetch once the commit lands;
    /// DIRTY records go through the rebase policy.
    pub fn source_did_fetch_partial_records(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        updates: HashMap<RecordId, JsonMap>,
    ) {
        let Some(record_type) = self.schema().get(type_name).cloned() else {
            return;
        };
        for (id, wire_patch) in updates {
            let Some(key) = self.lookup_store_key(account_id, type_name, &id) else {
                continue;
            };
            let status = self.get_status(key);
            if status.is(Status::COMMITTING) {
                self.refetch_after_commit.insert(key);
                continue;
            }
            if !status.is(Status::READY) {
                continue;
            }
            let patch = self.ingress_record(account_id, &record_type, &wire_patch);
            if status.is(Status::DIRTY) {
                self.apply_server_patch_to_dirty(key, patch);
            } else {
                self.update_data(key, patch, false);
                self.set_status(key, status & !Status::OBSOLETE);
            }
        }
        self.queue_event(StoreEvent::TypeChanged {
            account_id: account_id.clone(),
            type_name: type_name.to_string(),
        });
    }

    /// The source has no record of these ids.
    pub fn source_could_not_find_records(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        ids: &[RecordId],
    ) {
        for id in ids {
            let Ok(key) = self.get_store_key(Some(account_id.clone()), type_name, id) else {
                continue;
            };
            let status = self.get_status(key);
            if status.core().is(Status::EMPTY | Status::NON_EXISTENT) {
                self.set_status(key, Status::NON_EXISTENT);
            } else if status.is(Status::READY) {
                if status.is(Status::DIRTY) {
                    if let Some(committed) = self.committed.remove(&key) {
                        self.data.insert(key, committed);
                    }
                    self.changed.remove(&key);
                }
                self.set_status(key, Status::DESTROYED);
                self.unload_now(key);
            }
            self.note_type_changed(key);
        }
    }

    /// A delta fetched for (account, type): changed and destroyed ids
    /// between two state tokens.
    pub fn source_did_fetch_updates(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        changed: &[RecordId],
        destroyed: &[RecordId],
        old_state: &StateToken,
        new_state: &StateToken,
    ) {
        if self.client_state(account_id, type_name).as_ref() != Some(old_state) {
            // Can't assimilate a delta against a state we don't hold.
            warn!(%account_id, type_name, "delta against unknown state");
            self.source_state_did_change(account_id, type_name, new_state.clone());
            return;
        }
        for id in changed {
            if let Some(key) = self.lookup_store_key(account_id, type_name, id) {
                let status = self.get_status(key);
                if status.is(Status::READY) {
                    self.set_status(key, status | Status::OBSOLETE);
                }
            }
        }
        if !destroyed.is_empty() {
            self.source_did_destroy_records(account_id, type_name, destroyed);
        }
        self.set_client_state(account_id, type_name, new_state.clone());
        if self.server_state(account_id, type_name).as_ref() == Some(new_state) {
            self.set_server_state(account_id, type_name, None);
        }
        self.queue_event(StoreEvent::ServerInvalidated {
            account_id: account_id.clone(),
            type_name: type_name.to_string(),
        });
        self.check_server_state(account_id, type_name);
    }

    /// The source reports these records destroyed remotely.
    pub fn source_did_destroy_records(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        ids: &[RecordId],
    ) {
        for id in ids {
            let Some(key) = self.lookup_store_key(account_id, type_name, id) else {
                continue;
            };
            // If the id mapping was re-pointed (immutable-id replace), this
            // key no longer stands for that id: leave it alone.
            if self.id_of(key).map(String::as_str) != Some(id.as_str()) {
                continue;
            }
            let status = self.get_status(key);
            if status.is(Status::DIRTY) {
                if let Some(committed) = self.committed.remove(&key) {
                    self.data.insert(key, committed);
                }
                self.changed.remove(&key);
                self.destroyed.remove(&key);
            }
            self.set_status(key, Status::DESTROYED);
            self.unload_now(key);
            self.note_type_changed(key);
        }
    }

    // ------------------------------------------------------------------
    // Type-level state reconciliation
    // ------------------------------------------------------------------

    /// A commit advanced the server state for (account, type).
    pub fn source_commit_did_change_state(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        old_state: &StateToken,
        new_state: &StateToken,
    ) {
        if self.client_state(account_id, type_name).as_ref() == Some(old_state) {
            self.set_client_state(account_id, type_name, new_state.clone());
        } else {
            self.source_state_did_change(account_id, type_name, new_state.clone());
        }
    }

    /// The server reports a state we have not assimilated.
    ///
    /// While a fetch or commit is in flight the new state is parked and
    /// reconsidered when the flag clears; otherwise a delta fetch is issued
    /// and remote queries are told to refresh.
    pub fn source_state_did_change(
        &mut self,
        account_id: &AccountId,
        type_name: &str,
        new_state: StateToken,
    ) {
        let type_status = self.get_type_status(Some(account_id), type_name);
        if type_status.is(Status::LOADING | Status::COMMITTING) {
            self.set_server_state(account_id, type_name, Some(new_state));
            return;
        }
        if self.client_state(account_id, type_name).as_ref() == Some(&new_state) {
            self.set_server_state(account_id, type_name, None);
            return;
        }
        debug!(%account_id, type_name, %new_state, "server state advanced");
        self.set_server_state(account_id, type_name, Some(new_state));
        let _ = self.fetch_all(Some(account_id.clone()), type_name);
        self.queue_event(StoreEvent::ServerInvalidated {
            account_id: account_id.clone(),
            type_name: type_name.to_string(),
        });
    }

    /// Re-examine a parked server state once LOADING/COMMITTING clears.
    pub(crate) fn check_server_state(&mut self, account_id: &AccountId, type_name: &str) {
        let Some(server) = self.server_state(account_id, type_name) else {
            return;
        };
        let type_status = self.get_type_status(Some(account_id), type_name);
        if type_status.is(Status::LOADING | Status::COMMITTING) {
            return;
        }
        if self.client_state(account_id, type_name).as_ref() == Some(&server) {
            self.set_server_state(account_id, type_name, None);
        } else {
            self.source_state_did_change(account_id, type_name, server);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn type_record_type(&self, key: StoreKey) -> Option<RecordType> {
        let type_name = self.type_of(key)?;
        self.schema().get(type_name).cloned()
    }

    /// Recompute the changed set as the properties where data differs from
    /// committed. Returns whether anything differs.
    fn recompute_changed(&mut self, key: StoreKey) -> bool {
        let Some(committed) = self.committed.get(&key) else {
            self.changed.remove(&key);
            return false;
        };
        let empty = JsonMap::new();
        let data = self.data.get(&key).unwrap_or(&empty);
        let mut changed = BTreeSet::new();
        for (property, value) in data {
            if committed.get(property) != Some(value) {
                changed.insert(property.clone());
            }
        }
        for property in committed.keys() {
            if !data.contains_key(property) {
                changed.insert(property.clone());
            }
        }
        let any = !changed.is_empty();
        if any {
            self.changed.insert(key, changed);
        } else {
            self.changed.remove(&key);
        }
        any
    }

    /// Merge a server patch under local dirty edits.
    ///
    /// With rebase on, the patch becomes the new committed baseline, dirty
    /// properties keep their local values, and the changed set is
    /// recomputed; without it the server wins outright.
    fn apply_server_patch_to_dirty(&mut self, key: StoreKey, patch: JsonMap) {
        let status = self.get_status(key);
        let committed = self.committed.entry(key).or_default();
        for (property, value) in &patch {
            committed.insert(property.clone(), value.clone());
        }
        if self.options().rebase_conflicts {
            let dirty: BTreeSet<String> =
                self.changed.get(&key).cloned().unwrap_or_default();
            let data = self.data.entry(key).or_default();
            for (property, value) in patch {
                if !dirty.contains(&property) {
                    data.insert(property, value);
                }
            }
            if self.recompute_changed(key) {
                self.set_status(key, (status | Status::DIRTY) & !Status::OBSOLETE);
            } else {
                self.committed.remove(&key);
                self.set_status(key, status & !(Status::DIRTY | Status::OBSOLETE));
            }
        } else {
            let committed = self.committed.remove(&key).unwrap_or_default();
            self.data.insert(key, committed);
            self.changed.remove(&key);
            self.set_status(key, status & !(Status::DIRTY | Status::OBSOLETE));
        }
    }

    /// Translate one record from wire form: property names, reference ids
    /// replaced by store keys (minting keys for ids never seen before).
    pub(crate) fn ingress_record(
        &mut self,
        account_id: &AccountId,
        record_type: &RecordType,
        wire: &JsonMap,
    ) -> JsonMap {
        let mut out = JsonMap::new();
        for (wire_key, value) in wire {
            match record_type.attribute_by_key(wire_key) {
                Some(attr) => {
                    let kind = attr.kind.clone();
                    let property = attr.property.clone();
                    let value = self.ingress_value(account_id, &kind, value);
                    out.insert(property, value);
                }
                None => {
                    out.insert(wire_key.clone(), value.clone());
                }
            }
        }
        out
    }

    fn ingress_value(&mut self, account_id: &AccountId, kind: &AttrKind, value: &Value) -> Value {
        let target: Option<TypeName> = kind.target().cloned();
        let mut id_to_key = |store: &mut Store, value: &Value| -> Value {
            let (Some(id), Some(target)) = (value.as_str(), target.as_deref()) else {
                return value.clone();
            };
            match store.get_store_key(Some(account_id.clone()), target, id) {
                Ok(key) => Value::Number(key.0.into()),
                Err(_) => Value::Null,
            }
        };
        match kind {
            AttrKind::Scalar => value.clone(),
            AttrKind::ToOne(_) => id_to_key(self, value),
            AttrKind::ToManyList(_) => match value {
                Value::Array(items) => Value::Array(
                    items.iter().map(|item| id_to_key(self, item)).collect(),
                ),
                other => other.clone(),
            },
            AttrKind::ToManyMap(_) => match value {
                Value::Object(map) => {
                    let mut out = serde_json::Map::new();
                    for (k, v) in map {
                        let translated = id_to_key(self, v);
                        out.insert(k.clone(), translated);
                    }
                    Value::Object(out)
                }
                other => other.clone(),
            },
        }
    }
}
