//! End-to-end tests for the record lifecycle and the commit pipeline,
//! driving the store through a recording source and hand-delivered
//! source callbacks.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tidemark::{
    AccountId, Attribute, ChangeSet, CommitError, EventFlow, JsonMap, QueryFetchRequest, Record,
    RecordId, RecordType, Schema, SettleOptions, Source, StateToken, Status, Store, StoreEvent,
    StoreOptions, TypeName,
};

#[derive(Default)]
struct Requests {
    commits: Vec<ChangeSet>,
    fetches: Vec<(AccountId, TypeName, RecordId)>,
    fetch_alls: Vec<(AccountId, TypeName, Option<StateToken>)>,
}

struct RecordingSource {
    requests: Rc<RefCell<Requests>>,
}

impl Source for RecordingSource {
    fn fetch_record(&mut self, account_id: &AccountId, type_name: &TypeName, id: &RecordId) -> bool {
        self.requests
            .borrow_mut()
            .fetches
            .push((account_id.clone(), type_name.clone(), id.clone()));
        true
    }

    fn fetch_all_records(
        &mut self,
        account_id: &AccountId,
        type_name: &TypeName,
        since: Option<&StateToken>,
    ) -> bool {
        self.requests.borrow_mut().fetch_alls.push((
            account_id.clone(),
            type_name.clone(),
            since.cloned(),
        ));
        true
    }

    fn fetch_query(&mut self, _: QueryFetchRequest) -> bool {
        true
    }

    fn commit_changes(&mut self, changes: &ChangeSet) -> bool {
        self.requests.borrow_mut().commits.push(changes.clone());
        true
    }
}

fn schema() -> Schema {
    Schema::new().with_type(
        RecordType::new("task")
            .with_attribute(Attribute::new("id"))
            .with_attribute(Attribute::new("name").with_default(json!("")))
            .with_attribute(Attribute::new("priority").with_default(json!(0))),
    )
}

fn store_with(options: StoreOptions) -> (Store, Rc<RefCell<Requests>>) {
    let requests = Rc::new(RefCell::new(Requests::default()));
    let source = RecordingSource {
        requests: Rc::clone(&requests),
    };
    (Store::new(schema(), Box::new(source), options), requests)
}

fn wire(pairs: &[(&str, Value)]) -> JsonMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ============================================================================
// Create / commit round trip
// ============================================================================

#[test]
fn create_commit_round_trip() {
    let (mut store, requests) = store_with(StoreOptions::default());

    let mut task = Record::new("task");
    task.set(&mut store, "name", json!("a"));
    let key = task.save_to_store(&mut store).unwrap();
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::DIRTY
    );

    store.flush();
    {
        let requests = requests.borrow();
        assert_eq!(requests.commits.len(), 1);
        let entry = &requests.commits[0].changes[0];
        assert_eq!(entry.create.store_keys, vec![key]);
        let record = &entry.create.records[0];
        assert_eq!(record.get("accountId"), Some(&json!("primary")));
        assert_eq!(record.get("name"), Some(&json!("a")));
        assert!(record.get("id").is_none());
    }
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::COMMITTING
    );

    store.source_did_commit_create(HashMap::from([(key, wire(&[("id", json!("x1"))]))]));
    store.source_commit_did_finish();
    store.flush();

    assert_eq!(store.id_of(key), Some(&"x1".to_string()));
    assert_eq!(store.get_status(key), Status::READY);
    // The id now resolves back to the same store key.
    assert_eq!(store.get_store_key(None, "task", "x1").unwrap(), key);
}

#[test]
fn edits_during_commit_stay_dirty_after_ack() {
    let (mut store, _requests) = store_with(StoreOptions::default());

    let mut task = Record::new("task");
    let key = task.save_to_store(&mut store).unwrap();
    store.flush();

    // Edit while the create is in flight.
    task.set(&mut store, "name", json!("renamed"));
    store.source_did_commit_create(HashMap::from([(key, wire(&[("id", json!("x1"))]))]));
    store.source_commit_did_finish();

    assert_eq!(store.get_status(key), Status::READY | Status::DIRTY);
    // The next turn commits the edit as an update.
    store.flush();
    assert!(store.get_status(key).is(Status::COMMITTING));
}

// ============================================================================
// Not found
// ============================================================================

#[test]
fn missing_record_goes_non_existent() {
    let (mut store, requests) = store_with(StoreOptions::default());

    let record = store.get_record(None, "task", "zz").unwrap();
    let key = record.key().unwrap();
    assert_eq!(store.get_status(key), Status::EMPTY | Status::LOADING);
    assert_eq!(requests.borrow().fetches.len(), 1);

    store.source_could_not_find_records(&"primary".into(), "task", &["zz".into()]);
    assert_eq!(store.get_status(key), Status::NON_EXISTENT);
}

// ============================================================================
// Commit failures
// ============================================================================

#[test]
fn transient_create_failure_recommits() {
    let (mut store, requests) = store_with(StoreOptions::default());
    let mut task = Record::new("task");
    let key = task.save_to_store(&mut store).unwrap();
    store.flush();

    store.source_did_not_create(&[key], false, HashMap::new());
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::DIRTY
    );
    store.source_commit_did_finish();
    store.flush();
    assert_eq!(requests.borrow().commits.len(), 2);
}

#[test]
fn permanent_create_failure_destroys() {
    let (mut store, _requests) = store_with(StoreOptions::default());
    let mut task = Record::new("task");
    let key = task.save_to_store(&mut store).unwrap();
    store.flush();

    store.source_did_not_create(
        &[key],
        true,
        HashMap::from([(key, CommitError::new("invalidProperties", "bad name"))]),
    );
    assert_eq!(store.get_status(key), Status::EMPTY);
    assert!(store.peek_data(key).is_none());
}

#[test]
fn permanent_update_failure_reverts_data() {
    let (mut store, _requests) = store_with(StoreOptions::default());
    let key = store.get_store_key(None, "task", "t1").unwrap();
    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1")), ("name", json!("before"))])],
        None,
        false,
    );

    let mut record = store.get_record_from_store_key(key).unwrap();
    record.set(&mut store, "name", json!("after"));
    store.flush();
    assert!(store.get_status(key).is(Status::COMMITTING));

    store.source_did_not_update(
        &[key],
        true,
        HashMap::from([(key, CommitError::new("forbidden", "no"))]),
    );
    store.source_commit_did_finish();

    assert_eq!(store.get_status(key), Status::READY);
    assert_eq!(
        store.peek_data(key).unwrap().get("name"),
        Some(&json!("before"))
    );
}

#[test]
fn prevent_default_keeps_rejected_update() {
    let (mut store, _requests) = store_with(StoreOptions::default());
    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1")), ("name", json!("before"))])],
        None,
        false,
    );
    let key = store.get_store_key(None, "task", "t1").unwrap();

    // A listener claims the error.
    store.on(|event| match event {
        StoreEvent::RecordCommitError { .. } => EventFlow::PreventDefault,
        _ => EventFlow::Continue,
    });

    let mut record = store.get_record_from_store_key(key).unwrap();
    record.set(&mut store, "name", json!("after"));
    store.flush();
    store.source_did_not_update(
        &[key],
        true,
        HashMap::from([(key, CommitError::new("forbidden", "no"))]),
    );
    store.source_commit_did_finish();

    // Data kept, record re-flagged dirty for the caller to deal with.
    assert_eq!(
        store.peek_data(key).unwrap().get("name"),
        Some(&json!("after"))
    );
    assert!(store.get_status(key).is(Status::DIRTY));
}

#[test]
fn settle_watcher_receives_commit_error() {
    let (mut store, _requests) = store_with(StoreOptions::default());
    let mut task = Record::new("task");
    let key = task.save_to_store(&mut store).unwrap();
    store.flush();

    let outcome: Rc<RefCell<Option<Result<tidemark::StoreKey, CommitError>>>> =
        Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        task.if_success(
            &mut store,
            SettleOptions::handling(["overQuota"]),
            move |_, result| {
                *outcome.borrow_mut() = Some(result);
            },
        )
        .unwrap();
    }

    // The declared handled type suppresses the default destroy.
    store.source_did_not_create(
        &[key],
        true,
        HashMap::from([(key, CommitError::new("overQuota", "full"))]),
    );
    store.flush();

    let outcome = outcome.borrow();
    let error = outcome.as_ref().unwrap().as_ref().unwrap_err();
    assert_eq!(error.error_type, "overQuota");
    // Handled: the record is kept for recommit instead of destroyed.
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::DIRTY
    );
}

// ============================================================================
// Destroy / undestroy under a commit
// ============================================================================

#[test]
fn undestroy_during_commit_recreates() {
    let (mut store, requests) = store_with(StoreOptions::default());
    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1"))])],
        None,
        false,
    );
    let key = store.get_store_key(None, "task", "t1").unwrap();

    store.destroy_record(key).unwrap();
    store.flush();
    assert!(store.get_status(key).contains(Status::DESTROYED | Status::COMMITTING));

    store.undestroy_record(key).unwrap();
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::COMMITTING
    );

    // The destroy ack finds the marker and schedules a recreate.
    store.source_did_commit_destroy(&[key]);
    store.source_commit_did_finish();
    assert_eq!(
        store.get_status(key),
        Status::READY | Status::NEW | Status::DIRTY
    );
    store.flush();
    let requests = requests.borrow();
    let last = requests.commits.last().unwrap();
    assert_eq!(last.changes[0].create.store_keys, vec![key]);
}

// ============================================================================
// Moves
// ============================================================================

#[test]
fn move_commit_finalises_original_on_ack() {
    let (mut store, requests) = store_with(StoreOptions::default());
    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1")), ("name", json!("mover"))])],
        None,
        false,
    );
    let key = store.get_store_key(None, "task", "t1").unwrap();

    let new_key = store.move_record(key, "work".into()).unwrap();
    store.flush();
    {
        let requests = requests.borrow();
        let entry = requests.commits[0]
            .changes
            .iter()
            .find(|c| c.account_id == "work")
            .unwrap();
        let moved = entry.move_from_account.get("primary").unwrap();
        assert_eq!(moved.copy_from_ids, vec!["t1".to_string()]);
    }

    store.source_did_commit_create(HashMap::from([(new_key, wire(&[("id", json!("t9"))]))]));
    store.source_commit_did_finish();
    store.flush();

    assert_eq!(store.get_status(new_key), Status::READY);
    assert_eq!(store.id_of(new_key), Some(&"t9".to_string()));
    // The original is gone but its identity mapping survives.
    assert_eq!(store.get_status(key), Status::EMPTY);
    assert!(store.peek_data(key).is_none());
    assert_eq!(store.id_of(key), Some(&"t1".to_string()));
}

// ============================================================================
// Type state and fetch-all
// ============================================================================

#[test]
fn when_type_ready_fires_after_fetch_all() {
    let (mut store, requests) = store_with(StoreOptions::default());
    let fired = Rc::new(RefCell::new(false));
    {
        let fired = Rc::clone(&fired);
        store.when_type_ready(None, ["task"], move |_| {
            *fired.borrow_mut() = true;
        });
    }

    store.fetch_all(None, "task").unwrap();
    assert_eq!(requests.borrow().fetch_alls.len(), 1);
    store.flush();
    assert!(!*fired.borrow());

    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1"))])],
        Some("s1".into()),
        true,
    );
    store.flush();
    assert!(*fired.borrow());
    assert_eq!(store.get_type_state(None, "task"), Some(&"s1".to_string()));
}

#[test]
fn server_state_advance_triggers_delta_fetch() {
    let (mut store, requests) = store_with(StoreOptions::default());
    store.source_did_fetch_records(
        &"primary".into(),
        "task",
        vec![wire(&[("id", json!("t1"))])],
        Some("s1".into()),
        true,
    );

    store.source_state_did_change(&"primary".into(), "task", "s2".into());
    let fetch_alls = &requests.borrow().fetch_alls;
    assert_eq!(fetch_alls.len(), 1);
    // The delta fetch names the state we already hold.
    assert_eq!(fetch_alls[0].2, Some("s1".to_string()));
}

#[test]
fn commit_events_bracket_the_pipeline() {
    let (mut store, _requests) = store_with(StoreOptions::default());
    let events = Rc::new(RefCell::new(Vec::new()));
    {
        let events = Rc::clone(&events);
        store.on(move |event| {
            match event {
                StoreEvent::WillCommit => events.borrow_mut().push("will"),
                StoreEvent::DidCommit => events.borrow_mut().push("did"),
                _ => {}
            }
            EventFlow::Continue
        });
    }

    let mut task = Record::new("task");
    let key = task.save_to_store(&mut store).unwrap();
    store.flush();
    store.source_did_commit_create(HashMap::from([(key, wire(&[("id", json!("x1"))]))]));
    store.source_commit_did_finish();
    store.flush();

    assert_eq!(*events.borrow(), vec!["will", "did"]);
}
