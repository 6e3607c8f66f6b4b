//! The commit pipeline: partition pending work into per-(account, type)
//! change entries, flip statuses, and hand the bundle to the source.
//!
//! Commits are serialised: while one is in flight, further requests set a
//! flag and run when the source reports completion. Data leaves the store
//! in wire form (wire attribute names, record ids in reference slots).

use crate::event::StoreEvent;
use crate::schema::{AttrKind, RecordType};
use crate::source::{ChangeSet, TypeChanges};
use crate::{JsonMap, Status, Store, StoreKey};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

impl Store {
    /// Commit all pending changes to the source.
    ///
    /// Partitions creates, updates, moves and destroys per (account, type),
    /// snapshots rollback state, flips COMMITTING on and DIRTY off, and
    /// calls the source. Returns true if a commit was dispatched.
    pub fn commit_changes(&mut self) -> bool {
        if self.committing {
            self.commit_again = true;
            return false;
        }
        let created = std::mem::take(&mut self.created);
        let destroyed = std::mem::take(&mut self.destroyed);
        let changed_types = std::mem::take(&mut self.changed_types);

        let mut change_set = ChangeSet::default();
        for (account_id, type_name) in &changed_types {
            let Some(record_type) = self.schema().get(type_name).cloned() else {
                continue;
            };
            let mut entry = TypeChanges::new(
                account_id.clone(),
                type_name.clone(),
                self.client_state(account_id, type_name),
            );

            // Creates, including the receiving half of cross-account moves.
            let mut creates: Vec<(StoreKey, Option<StoreKey>)> = created
                .iter()
                .filter(|(key, _)| self.key_matches(**key, account_id, type_name))
                .map(|(&key, &origin)| (key, origin))
                .collect();
            creates.sort_unstable_by_key(|&(key, _)| key);
            for (key, origin) in creates {
                let status = self.get_status(key);
                match origin {
                    None => {
                        let data = self.data.get(&key).cloned().unwrap_or_default();
                        let mut wire = self.egress_record(&record_type, &data, None);
                        wire.insert("accountId".into(), Value::String(account_id.clone()));
                        entry.create.store_keys.push(key);
                        entry.create.records.push(wire);
                    }
                    Some(from_key) => {
                        let from_account = self
                            .account_of(from_key)
                            .cloned()
                            .unwrap_or_else(|| account_id.clone());
                        let diff_keys = self.diff_properties(&record_type, key, from_key);
                        let data = self.data.get(&key).cloned().unwrap_or_default();
                        let wire = self.egress_record(&record_type, &data, Some(&diff_keys));
                        let move_entry = entry.move_from_account.entry(from_account).or_default();
                        move_entry
                            .copy_from_ids
                            .push(self.id_of(from_key).cloned().unwrap_or_default());
                        move_entry.store_keys.push(key);
                        move_entry.records.push(wire);
                        move_entry
                            .changes
                            .push(self.wire_names(&record_type, &diff_keys));
                        // The originating record is carried by the move; it
                        // finalises when the create is acknowledged.
                        let from_status = self.get_status(from_key);
                        self.set_status(
                            from_key,
                            (from_status & !Status::DIRTY) | Status::COMMITTING,
                        );
                        self.committing_destroys.insert(from_key, Some(key));
                    }
                }
                self.changed.remove(&key);
                self.set_status(key, (status & !Status::DIRTY) | Status::COMMITTING);
                self.committing_creates.insert(key, origin);
            }

            // Updates: DIRTY records that are neither pending-create nor
            // pending-destroy.
            let mut updates: Vec<StoreKey> = self
                .changed
                .keys()
                .copied()
                .filter(|&key| {
                    self.key_matches(key, account_id, type_name)
                        && !created.contains_key(&key)
                        && !destroyed.contains_key(&key)
                        && self.get_status(key).contains(Status::READY | Status::DIRTY)
                        && !self.get_status(key).is(Status::NEW | Status::COMMITTING)
                })
                .collect();
            updates.sort_unstable();
            for key in updates {
                let properties = self.changed.remove(&key).unwrap_or_default();
                let syncable: BTreeSet<String> = properties
                    .into_iter()
                    .filter(|p| record_type.is_syncable(p))
                    .collect();
                let status = self.get_status(key);
                if syncable.is_empty() {
                    // Nothing the source needs to hear about.
                    self.committed.remove(&key);
                    self.set_status(key, status & !Status::DIRTY);
                    continue;
                }
                let committed = self.committed.remove(&key).unwrap_or_default();
                let data = self.data.get(&key).cloned().unwrap_or_default();
                entry.update.store_keys.push(key);
                entry
                    .update
                    .records
                    .push(self.egress_record(&record_type, &data, None));
                entry
                    .update
                    .committed
                    .push(self.egress_record(&record_type, &committed, None));
                entry
                    .update
                    .changes
                    .push(self.wire_names(&record_type, &syncable));
                self.rollback.insert(key, committed);
                self.set_status(key, (status & !Status::DIRTY) | Status::COMMITTING);
            }

            // Destroys, skipping originals already carried by a move.
            let mut destroys: Vec<(StoreKey, Option<StoreKey>)> = destroyed
                .iter()
                .filter(|(key, _)| self.key_matches(**key, account_id, type_name))
                .map(|(&key, &replacement)| (key, replacement))
                .collect();
            destroys.sort_unstable_by_key(|&(key, _)| key);
            for (key, replacement) in destroys {
                if replacement.is_some_and(|r| created.contains_key(&r)) {
                    continue;
                }
                let status = self.get_status(key);
                entry.destroy.store_keys.push(key);
                entry
                    .destroy
                    .ids
                    .push(self.id_of(key).cloned().unwrap_or_default());
                self.set_status(key, (status & !Status::DIRTY) | Status::COMMITTING);
                self.committing_destroys.insert(key, replacement);
            }

            if !entry.is_empty() {
                let type_status = self.get_type_status(Some(account_id), type_name);
                self.set_type_status(account_id, type_name, type_status | Status::COMMITTING);
                self.committing_types
                    .push((account_id.clone(), type_name.clone()));
                change_set.changes.push(entry);
            }
        }

        if change_set.is_empty() {
            return false;
        }
        debug!(entries = change_set.changes.len(), "commit");
        self.committing = true;
        self.queue_event(StoreEvent::WillCommit);
        self.source.commit_changes(&change_set);
        true
    }

    /// Source callback: a commit finished (all per-record callbacks have
    /// been delivered). Clears type-level COMMITTING, settles deferred
    /// server states, refetches records that changed under the commit, and
    /// recurses if more work accumulated.
    pub fn source_commit_did_finish(&mut self) {
        for (account_id, type_name) in std::mem::take(&mut self.committing_types) {
            let type_status = self.get_type_status(Some(&account_id), &type_name);
            self.set_type_status(&account_id, &type_name, type_status & !Status::COMMITTING);
            self.check_server_state(&account_id, &type_name);
        }
        self.committing = false;
        self.queue_event(StoreEvent::DidCommit);

        for key in std::mem::take(&mut self.refetch_after_commit) {
            let status = self.get_status(key);
            if status.is(Status::READY) {
                self.set_status(key, status | Status::OBSOLETE);
                let _ = self.fetch_record(key);
            }
        }

        let again = std::mem::replace(&mut self.commit_again, false);
        if (again || self.has_changes()) && self.options().auto_commit {
            self.schedule_commit_always();
        }
    }

    fn key_matches(&self, key: StoreKey, account_id: &str, type_name: &str) -> bool {
        self.account_of(key).map(String::as_str) == Some(account_id)
            && self.type_of(key).map(String::as_str) == Some(type_name)
    }

    /// Syncable properties whose values differ between two records.
    fn diff_properties(
        &self,
        record_type: &RecordType,
        key: StoreKey,
        against: StoreKey,
    ) -> BTreeSet<String> {
        let empty = JsonMap::new();
        let data = self.data.get(&key).unwrap_or(&empty);
        let base = self.data.get(&against).unwrap_or(&empty);
        let mut out = BTreeSet::new();
        for (property, value) in data {
            if record_type.is_syncable(property) && base.get(property) != Some(value) {
                out.insert(property.clone());
            }
        }
        for property in base.keys() {
            if record_type.is_syncable(property) && !data.contains_key(property) {
                out.insert(property.clone());
            }
        }
        out
    }

    fn wire_names(&self, record_type: &RecordType, properties: &BTreeSet<String>) -> Vec<String> {
        properties
            .iter()
            .filter_map(|p| record_type.attribute(p).map(|a| a.key.clone()))
            .collect()
    }

    /// Translate one record's data to wire form: wire attribute names,
    /// reference store keys replaced by ids. Restricted to `only` when
    /// given; always restricted to syncable attributes.
    pub(crate) fn egress_record(
        &self,
        record_type: &RecordType,
        data: &JsonMap,
        only: Option<&BTreeSet<String>>,
    ) -> JsonMap {
        let mut out = JsonMap::new();
        for (property, value) in data {
            if let Some(only) = only {
                if !only.contains(property) {
                    continue;
                }
            }
            if !record_type.is_syncable(property) {
                continue;
            }
            let Some(attr) = record_type.attribute(property) else {
                continue;
            };
            out.insert(attr.key.clone(), self.egress_value(&attr.kind, value));
        }
        out
    }

    fn egress_value(&self, kind: &AttrKind, value: &Value) -> Value {
        let key_to_id = |value: &Value| -> Value {
            match value.as_u64().map(StoreKey) {
                Some(key) => match self.id_of(key) {
                    Some(id) => Value::String(id.clone()),
                    None => Value::Null,
                },
                None => value.clone(),
            }
        };
        match kind {
            AttrKind::Scalar => value.clone(),
            AttrKind::ToOne(_) => key_to_id(value),
            AttrKind::ToManyList(_) => match value {
                Value::Array(items) => Value::Array(items.iter().map(key_to_id).collect()),
                other => other.clone(),
            },
            AttrKind::ToManyMap(_) => match value {
                Value::Object(map) => Value::Object(
                    map.iter().map(|(k, v)| (k.clone(), key_to_id(v))).collect(),
                ),
                other => other.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::schema::{Attribute, RecordType, Schema};
    use crate::source::Source;
    use crate::store::StoreOptions;
    use crate::{AccountId, RecordId, StateToken, TypeName};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    pub(crate) struct Log {
        pub commits: Vec<ChangeSet>,
    }

    pub(crate) struct RecordingSource {
        pub log: Rc<RefCell<Log>>,
    }

    impl Source for RecordingSource {
        fn fetch_record(&mut self, _: &AccountId, _: &TypeName, _: &RecordId) -> bool {
            true
        }
        fn fetch_all_records(
            &mut self,
            _: &AccountId,
            _: &TypeName,
            _: Option<&StateToken>,
        ) -> bool {
            true
        }
        fn fetch_query(&mut self, _: crate::source::QueryFetchRequest) -> bool {
            true
        }
        fn commit_changes(&mut self, changes: &ChangeSet) -> bool {
            self.log.borrow_mut().commits.push(changes.clone());
            true
        }
    }

    fn schema() -> Schema {
        Schema::new().with_type(
            RecordType::new("contact")
                .with_attribute(Attribute::new("id"))
                .with_attribute(Attribute::new("name").with_default(json!("")))
                .with_attribute(Attribute::new("scratch").no_sync()),
        )
    }

    fn recording_store() -> (Store, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let source = RecordingSource {
            log: Rc::clone(&log),
        };
        let store = Store::new(schema(), Box::new(source), StoreOptions::default());
        (store, log)
    }

    #[test]
    fn create_commit_carries_wire_data_and_account() {
        let (mut store, log) = recording_store();
        let mut record = Record::new("contact");
        record.set(&mut store, "name", json!("a"));
        let key = record.save_to_store(&mut store).unwrap();
        store.flush();

        let commits = log.borrow();
        assert_eq!(commits.commits.len(), 1);
        let entry = &commits.commits[0].changes[0];
        assert_eq!(entry.create.store_keys, vec![key]);
        let wire = &entry.create.records[0];
        assert_eq!(wire.get("name"), Some(&json!("a")));
        assert_eq!(wire.get("accountId"), Some(&json!("primary")));
        assert!(wire.get("id").is_none());
        assert_eq!(
            store.get_status(key),
            Status::READY | Status::NEW | Status::COMMITTING
        );
    }

    #[test]
    fn no_sync_only_changes_clean_silently() {
        let (mut store, log) = recording_store();
        let key = store.get_store_key(None, "contact", "c1").unwrap();
        store.set_status(key, Status::READY);
        store.data.insert(key, JsonMap::new());

        let mut patch = JsonMap::new();
        patch.insert("scratch".into(), json!("local only"));
        store.update_data(key, patch, true);
        store.flush();

        assert!(log.borrow().commits.is_empty());
        assert_eq!(store.get_status(key), Status::READY);
        assert!(store.committed_data(key).is_none());
    }

    #[test]
    fn update_commit_moves_committed_into_rollback() {
        let (mut store, log) = recording_store();
        let key = store.get_store_key(None, "contact", "c1").unwrap();
        store.set_status(key, Status::READY);
        let mut data = JsonMap::new();
        data.insert("name".into(), json!("before"));
        store.data.insert(key, data);

        let mut patch = JsonMap::new();
        patch.insert("name".into(), json!("after"));
        store.update_data(key, patch, true);
        store.flush();

        let commits = log.borrow();
        let entry = &commits.commits[0].changes[0];
        assert_eq!(entry.update.store_keys, vec![key]);
        assert_eq!(entry.update.records[0].get("name"), Some(&json!("after")));
        assert_eq!(
            entry.update.committed[0].get("name"),
            Some(&json!("before"))
        );
        assert_eq!(entry.update.changes[0], vec!["name".to_string()]);
        drop(commits);

        // COMMITTING implies rollback is populated.
        assert!(store.get_status(key).is(Status::COMMITTING));
        assert_eq!(
            store.rollback.get(&key).unwrap().get("name"),
            Some(&json!("before"))
        );
        assert!(store.committed_data(key).is_none());
    }

    #[test]
    fn commits_are_serialised() {
        let (mut store, log) = recording_store();
        let mut record = Record::new("contact");
        record.save_to_store(&mut store).unwrap();
        store.flush();
        assert_eq!(log.borrow().commits.len(), 1);

        // A second mutation while the first commit is in flight does not
        // dispatch another commit.
        let mut second = Record::new("contact");
        second.save_to_store(&mut store).unwrap();
        store.flush();
        assert_eq!(log.borrow().commits.len(), 1);

        // Completion releases the gate and picks up the pending work.
        store.source_commit_did_finish();
        store.flush();
        assert_eq!(log.borrow().commits.len(), 2);
    }

    #[test]
    fn move_pairs_create_and_destroy_into_move_entry() {
        let (mut store, log) = recording_store();
        let key = store.get_store_key(None, "contact", "c1").unwrap();
        store.set_status(key, Status::READY);
        let mut data = JsonMap::new();
        data.insert("name".into(), json!("mover"));
        store.data.insert(key, data);

        let new_key = store.move_record(key, "work".into()).unwrap();
        store.flush();

        let commits = log.borrow();
        assert_eq!(commits.commits.len(), 1);
        let changes = &commits.commits[0].changes;
        // One entry for the target (account, type); no bare destroy entry
        // for the original anywhere.
        let target = changes
            .iter()
            .find(|c| c.account_id == "work")
            .expect("move target entry");
        let moved = target.move_from_account.get("primary").unwrap();
        assert_eq!(moved.copy_from_ids, vec!["c1".to_string()]);
        assert_eq!(moved.store_keys, vec![new_key]);
        assert!(changes.iter().all(|c| c.destroy.store_keys.is_empty()));
        assert!(changes.iter().all(|c| c.create.store_keys.is_empty()));
    }
}
