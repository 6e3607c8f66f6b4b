//! The source contract and the wire-facing change structures.
//!
//! A [`Source`] performs all I/O on behalf of a store. The store hands it
//! requests (fetches, query pages, commits) and the source later reports
//! progress by invoking the matching `source_did_*` callbacks on the store,
//! on the same thread, in a later run-loop turn. Methods return whether the
//! source accepted the request; an unhandled request leaves the store's
//! state untouched.
//!
//! Everything in a [`ChangeSet`] is already in wire form: attribute keys are
//! wire names and reference slots hold record ids, never store keys.

use crate::{AccountId, JsonMap, RecordId, StateToken, StoreKey, TypeName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Records to create, with their client-settable data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntry {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<JsonMap>,
}

/// Records to update: current data, previous committed data, and the set of
/// changed wire keys per record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntry {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<JsonMap>,
    pub committed: Vec<JsonMap>,
    pub changes: Vec<Vec<String>>,
}

/// Records entering this account by a move from another account.
///
/// `records` holds the diff against the originating record, keyed like an
/// update; `copy_from_ids` names the records in the source account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveEntry {
    pub copy_from_ids: Vec<RecordId>,
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<JsonMap>,
    pub changes: Vec<Vec<String>>,
}

/// Records to destroy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyEntry {
    pub store_keys: Vec<StoreKey>,
    pub ids: Vec<RecordId>,
}

/// All pending changes for one (account, type) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChanges {
    pub account_id: AccountId,
    pub type_name: TypeName,
    pub create: CreateEntry,
    pub update: UpdateEntry,
    pub move_from_account: HashMap<AccountId, MoveEntry>,
    pub destroy: DestroyEntry,
    /// The client's assimilated state token for this (account, type) at
    /// commit time.
    pub state: Option<StateToken>,
}

impl TypeChanges {
    pub fn new(account_id: AccountId, type_name: TypeName, state: Option<StateToken>) -> Self {
        Self {
            account_id,
            type_name,
            create: CreateEntry::default(),
            update: UpdateEntry::default(),
            move_from_account: HashMap::new(),
            destroy: DestroyEntry::default(),
            state,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.create.store_keys.is_empty()
            && self.update.store_keys.is_empty()
            && self.move_from_account.is_empty()
            && self.destroy.store_keys.is_empty()
    }
}

/// One commit's worth of changes, partitioned per (account, type).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub changes: Vec<TypeChanges>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A contiguous index range requested from a windowed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRange {
    pub start: usize,
    pub count: usize,
}

/// The payload a windowed query builds for its next source request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFetchRequest {
    pub query_id: u64,
    pub account_id: AccountId,
    pub type_name: TypeName,
    /// Current result-set state token, if any ids have been loaded.
    pub query_state: Option<StateToken>,
    /// Ranges whose ids are wanted.
    pub id_ranges: Vec<FetchRange>,
    /// Ranges whose full records are wanted as well.
    pub record_ranges: Vec<FetchRange>,
    /// Ids whose position in the result set is wanted.
    pub index_of: Vec<RecordId>,
    /// The query is obsolete and wants a delta from `query_state`.
    pub refresh: bool,
}

/// An id slice for a windowed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdsPacket {
    /// State token of the result set this slice was taken from.
    pub query_state: StateToken,
    /// Index of the first id in the full result set.
    pub position: usize,
    pub ids: Vec<RecordId>,
    /// Length of the full result set.
    pub total: usize,
}

/// An id added to a windowed query result at an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedId {
    pub index: usize,
    pub id: RecordId,
}

/// A server-authored delta between two states of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryUpdate {
    pub old_query_state: StateToken,
    pub new_query_state: StateToken,
    pub removed: Vec<RecordId>,
    pub added: Vec<AddedId>,
    /// The server only vouches for the result set up to this id; anything
    /// after it must be refetched.
    pub up_to_id: Option<RecordId>,
    pub total: usize,
}

/// External collaborator that performs I/O for a store.
///
/// Each method returns `true` if this source handled the request. The
/// matching completion callbacks on the store (`source_did_fetch_records`,
/// `source_did_commit_create`, …) must be invoked on the store's thread in
/// a later turn.
pub trait Source {
    /// Fetch one record by id.
    fn fetch_record(&mut self, account_id: &AccountId, type_name: &TypeName, id: &RecordId)
        -> bool;

    /// Re-fetch a record the store already holds but believes obsolete.
    fn refresh_record(
        &mut self,
        account_id: &AccountId,
        type_name: &TypeName,
        id: &RecordId,
    ) -> bool {
        self.fetch_record(account_id, type_name, id)
    }

    /// Fetch every record of a type, or the delta since `since`.
    fn fetch_all_records(
        &mut self,
        account_id: &AccountId,
        type_name: &TypeName,
        since: Option<&StateToken>,
    ) -> bool;

    /// Fetch ids/records/lookups for a windowed query.
    fn fetch_query(&mut self, request: QueryFetchRequest) -> bool;

    /// Commit local changes. Completion is reported per entry through the
    /// store's commit callbacks, then `source_commit_did_finish`.
    fn commit_changes(&mut self, changes: &ChangeSet) -> bool;
}

/// A source that accepts nothing. Useful for purely local stores and tests
/// that drive callbacks by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSource;

impl Source for NullSource {
    fn fetch_record(&mut self, _: &AccountId, _: &TypeName, _: &RecordId) -> bool {
        false
    }

    fn fetch_all_records(&mut self, _: &AccountId, _: &TypeName, _: Option<&StateToken>) -> bool {
        false
    }

    fn fetch_query(&mut self, _: QueryFetchRequest) -> bool {
        false
    }

    fn commit_changes(&mut self, _: &ChangeSet) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_type_changes() {
        let changes = TypeChanges::new("acc".into(), "message".into(), None);
        assert!(changes.is_empty());
    }

    #[test]
    fn change_set_serializes_camel_case() {
        let mut changes = TypeChanges::new("acc".into(), "message".into(), Some("s1".into()));
        changes.destroy.store_keys.push(StoreKey(3));
        changes.destroy.ids.push("m3".into());
        let set = ChangeSet {
            changes: vec![changes],
        };
        let json = serde_json::to_string(&set).unwrap();
        assert!(json.contains("storeKeys"));
        assert!(json.contains("accountId"));
        assert!(json.contains("moveFromAccount"));
    }

    #[test]
    fn query_update_roundtrip() {
        let update = QueryUpdate {
            old_query_state: "s0".into(),
            new_query_state: "s1".into(),
            removed: vec!["id2".into()],
            added: vec![AddedId {
                index: 2,
                id: "id4".into(),
            }],
            up_to_id: None,
            total: 3,
        };
        let json = serde_json::to_string(&update).unwrap();
        let parsed: QueryUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(update, parsed);
    }
}
