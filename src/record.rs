//! The record facade: a lightweight handle over store data.
//!
//! A [`Record`] does not own attribute data. Before `save_to_store` it
//! buffers attributes locally; afterwards every read and write proxies to
//! the store under its store key. Handles are plain values: cloning one is
//! cheap and two handles to the same store key observe the same record.
//!
//! Holding a handle does not pin the record in memory; call
//! [`Record::retain`] to protect it from eviction while observed.

use crate::error::{Result, StoreError, ValidationError};
use crate::{AccountId, CommitError, JsonMap, RecordId, Status, Store, StoreKey, TypeName};
use serde_json::Value;

/// Options for settle watchers registered through
/// [`Record::get_result`] and friends.
#[derive(Debug, Clone, Default)]
pub struct SettleOptions {
    /// Commit error types the caller will handle itself. Matching permanent
    /// failures skip the store's default revert.
    pub handled_error_types: Vec<String>,
}

impl SettleOptions {
    pub fn handling(error_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            handled_error_types: error_types.into_iter().map(Into::into).collect(),
        }
    }
}

/// Delivered to a settle watcher on the first decisive status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResult {
    pub key: StoreKey,
    pub status: Status,
    /// The commit failure that settled the record, if any.
    pub error: Option<CommitError>,
}

impl RecordResult {
    /// True if the record settled loaded and clean of failure.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is(Status::READY)
    }
}

/// A handle to one record, saved or not yet saved.
#[derive(Debug, Clone)]
pub struct Record {
    type_name: TypeName,
    account_id: Option<AccountId>,
    key: Option<StoreKey>,
    buffer: JsonMap,
}

impl Record {
    /// A fresh, unsaved record of the given type.
    pub fn new(type_name: impl Into<TypeName>) -> Self {
        Self {
            type_name: type_name.into(),
            account_id: None,
            key: None,
            buffer: JsonMap::new(),
        }
    }

    /// Target a specific account instead of the store's default.
    pub fn with_account(mut self, account_id: impl Into<AccountId>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Bind a handle to an already-stored record.
    pub fn from_key(store: &Store, key: StoreKey) -> Result<Self> {
        let type_name = store
            .type_of(key)
            .ok_or(StoreError::DestroyUnloaded(key))?
            .clone();
        Ok(Self {
            account_id: store.account_of(key).cloned(),
            type_name,
            key: Some(key),
            buffer: JsonMap::new(),
        })
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn key(&self) -> Option<StoreKey> {
        self.key
    }

    pub fn is_saved(&self) -> bool {
        self.key.is_some()
    }

    /// The source-assigned id, absent while the record is NEW.
    pub fn id<'a>(&self, store: &'a Store) -> Option<&'a RecordId> {
        self.key.and_then(|key| store.id_of(key))
    }

    /// Current status; EMPTY until saved.
    pub fn status(&self, store: &Store) -> Status {
        match self.key {
            Some(key) => store.get_status(key),
            None => Status::EMPTY,
        }
    }

    /// Test any bit of the current status.
    pub fn is(&self, store: &Store, mask: Status) -> bool {
        self.status(store).is(mask)
    }

    /// Read one attribute by property name.
    pub fn get(&self, store: &mut Store, property: &str) -> Option<Value> {
        match self.key {
            Some(key) => store.get_data(key).and_then(|d| d.get(property)).cloned(),
            None => self.buffer.get(property).cloned(),
        }
    }

    /// Write one attribute by property name.
    ///
    /// Writes to an unready stored record are rejected by the store and
    /// reported through its diagnostic channel.
    pub fn set(&mut self, store: &mut Store, property: impl Into<String>, value: Value) {
        match self.key {
            Some(key) => {
                let mut patch = JsonMap::new();
                patch.insert(property.into(), value);
                store.update_data(key, patch, true);
            }
            None => {
                self.buffer.insert(property.into(), value);
            }
        }
    }

    /// Move the buffered attributes into the store.
    ///
    /// Fails if already saved. Missing attributes get their declared
    /// defaults; the record comes out READY|NEW|DIRTY and is picked up by
    /// the next commit.
    pub fn save_to_store(&mut self, store: &mut Store) -> Result<StoreKey> {
        if self.key.is_some() {
            return Err(StoreError::AlreadySaved);
        }
        let data = std::mem::take(&mut self.buffer);
        let key = store.create_record(self.account_id.clone(), &self.type_name, data)?;
        self.key = Some(key);
        Ok(key)
    }

    /// Throw away uncommitted changes.
    ///
    /// A record that was never committed is destroyed outright; otherwise
    /// its data reverts to the last committed state.
    pub fn discard_changes(&mut self, store: &mut Store) -> Result<()> {
        match self.key {
            Some(key) => store.discard_changes(key),
            None => {
                self.buffer.clear();
                Ok(())
            }
        }
    }

    /// Request a (re)fetch from the source. No-op on NEW, DESTROYED or
    /// NON_EXISTENT records.
    pub fn fetch(&self, store: &mut Store) -> Result<()> {
        let Some(key) = self.key else {
            return Err(StoreError::NotSaved);
        };
        let status = store.get_status(key);
        if status.is(Status::NEW | Status::DESTROYED | Status::NON_EXISTENT) {
            return Ok(());
        }
        store.fetch_record(key)
    }

    /// Destroy the record.
    pub fn destroy(&self, store: &mut Store) -> Result<()> {
        let Some(key) = self.key else {
            return Err(StoreError::NotSaved);
        };
        store.destroy_record(key)
    }

    /// Protect the record from eviction while observed.
    pub fn retain(&self, store: &mut Store) {
        if let Some(key) = self.key {
            store.retain_record(key);
        }
    }

    /// Release an earlier [`Record::retain`].
    pub fn release(&self, store: &mut Store) {
        if let Some(key) = self.key {
            store.release_record(key);
        }
    }

    /// The validation error for one attribute, if its validator rejects the
    /// current value.
    pub fn error_for_attribute(&self, store: &Store, property: &str) -> Option<ValidationError> {
        let record_type = store.schema().get(&self.type_name)?;
        let attr = record_type.attribute(property)?;
        let validate = attr.validator?;
        let value = self
            .current_data(store)
            .and_then(|d| d.get(property).cloned())
            .unwrap_or(Value::Null);
        validate(&value).map(|message| ValidationError {
            attribute: property.to_string(),
            message,
        })
    }

    /// True when every attribute validator passes.
    pub fn is_valid(&self, store: &Store) -> bool {
        let Some(record_type) = store.schema().get(&self.type_name) else {
            return false;
        };
        match self.current_data(store) {
            Some(data) => record_type.validate(&data).is_empty(),
            None => record_type.validate(&JsonMap::new()).is_empty(),
        }
    }

    fn current_data(&self, store: &Store) -> Option<JsonMap> {
        match self.key {
            Some(key) => store.peek_data(key).cloned(),
            None => Some(self.buffer.clone()),
        }
    }

    /// Invoke `callback` on the next non-LOADING, non-COMMITTING status
    /// transition, whatever the outcome.
    pub fn get_result(
        &self,
        store: &mut Store,
        options: SettleOptions,
        callback: impl FnOnce(&mut Store, RecordResult) + 'static,
    ) -> Result<()> {
        let key = self.key.ok_or(StoreError::NotSaved)?;
        store.when_settled(key, options, Box::new(callback));
        Ok(())
    }

    /// Like [`Record::get_result`], but the callback only fires on success;
    /// failures are delivered as the error side of the result.
    pub fn if_success(
        &self,
        store: &mut Store,
        options: SettleOptions,
        callback: impl FnOnce(&mut Store, std::result::Result<StoreKey, CommitError>) + 'static,
    ) -> Result<()> {
        self.get_result(store, options, move |store, result| {
            let outcome = match result.error {
                None => Ok(result.key),
                Some(error) => Err(error),
            };
            callback(store, outcome);
        })
    }

    /// Invoke `callback` once the record's data is loaded (or the record
    /// settles somewhere data can never arrive).
    pub fn if_loaded(
        &self,
        store: &mut Store,
        callback: impl FnOnce(&mut Store, RecordResult) + 'static,
    ) -> Result<()> {
        self.get_result(store, SettleOptions::default(), callback)
    }
}

/// Deep-copy the syncable attributes of `key` into a new record in `target`,
/// translating references through id equivalence so they resolve to the
/// target store's own store keys.
pub fn clone_record_into(
    source: &Store,
    target: &mut Store,
    key: StoreKey,
) -> Result<StoreKey> {
    let type_name = source
        .type_of(key)
        .ok_or(StoreError::DestroyUnloaded(key))?
        .clone();
    let account_id = source.account_of(key).cloned();
    let data = source
        .peek_data(key)
        .ok_or(StoreError::DestroyUnloaded(key))?
        .clone();
    let doppel = target.translate_doppelganger(source, &type_name, data)?;
    target.create_record(account_id, &type_name, doppel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, RecordType, Schema};
    use crate::source::NullSource;
    use crate::store::StoreOptions;
    use serde_json::json;

    fn test_store() -> Store {
        let schema = Schema::new().with_type(
            RecordType::new("todo")
                .with_attribute(Attribute::new("id"))
                .with_attribute(Attribute::new("title").with_default(json!("")))
                .with_attribute(Attribute::new("done").with_default(json!(false))),
        );
        Store::new(schema, Box::new(NullSource), StoreOptions::default())
    }

    #[test]
    fn unsaved_record_buffers_attributes() {
        let mut store = test_store();
        let mut record = Record::new("todo");
        record.set(&mut store, "title", json!("write tests"));
        assert_eq!(record.get(&mut store, "title"), Some(json!("write tests")));
        assert_eq!(record.status(&store), Status::EMPTY);
    }

    #[test]
    fn save_fills_defaults_and_goes_dirty_new() {
        let mut store = test_store();
        let mut record = Record::new("todo");
        record.set(&mut store, "title", json!("a"));
        let key = record.save_to_store(&mut store).unwrap();

        assert_eq!(
            store.get_status(key),
            Status::READY | Status::NEW | Status::DIRTY
        );
        assert_eq!(record.get(&mut store, "done"), Some(json!(false)));
        assert!(record.save_to_store(&mut store).is_err());
    }

    #[test]
    fn set_after_save_proxies_to_store() {
        let mut store = test_store();
        let mut record = Record::new("todo");
        let key = record.save_to_store(&mut store).unwrap();
        record.set(&mut store, "title", json!("later"));
        assert_eq!(
            store.peek_data(key).unwrap().get("title"),
            Some(&json!("later"))
        );
    }

    #[test]
    fn discard_on_never_committed_destroys() {
        let mut store = test_store();
        let mut record = Record::new("todo");
        let key = record.save_to_store(&mut store).unwrap();
        record.discard_changes(&mut store).unwrap();
        assert_eq!(store.get_status(key), Status::EMPTY);
        assert!(store.peek_data(key).is_none());
    }

    #[test]
    fn validation_surfaces_without_blocking_writes() {
        fn non_empty(value: &Value) -> Option<String> {
            match value.as_str() {
                Some(s) if !s.is_empty() => None,
                _ => Some("required".into()),
            }
        }
        let schema = Schema::new().with_type(
            RecordType::new("todo")
                .with_attribute(Attribute::new("id"))
                .with_attribute(Attribute::new("title").with_validator(non_empty)),
        );
        let mut store = Store::new(schema, Box::new(NullSource), StoreOptions::default());
        let mut record = Record::new("todo");
        record.save_to_store(&mut store).unwrap();

        record.set(&mut store, "title", json!(""));
        assert!(!record.is_valid(&store));
        let error = record.error_for_attribute(&store, "title").unwrap();
        assert_eq!(error.message, "required");

        record.set(&mut store, "title", json!("ok"));
        assert!(record.is_valid(&store));
        assert!(record.error_for_attribute(&store, "title").is_none());
    }
}
