//! # Tidemark
//!
//! An observable, in-memory record cache for client-side applications. It
//! sits between a remote data source (typically JSON over HTTP) and the
//! views, tracking every record's identity and lifecycle, keeping local
//! queries live as data changes, and maintaining very large server-side
//! lists through windowed fetches and delta reconciliation.
//!
//! ## Design Principles
//!
//! - **No IO**: the store never touches the network; a [`Source`] you
//!   provide performs all transport and reports back through callbacks.
//! - **Single-threaded**: mutations are synchronous, notifications are
//!   deferred through a cooperative run loop, and observers only ever see
//!   settled state.
//! - **Optimistic**: local edits apply immediately, commit in the
//!   background, and reconcile cleanly when the server confirms or
//!   contradicts them.
//!
//! ## Core Concepts
//!
//! ### Store keys
//!
//! Every (account, type, id) triple the store has ever seen gets an opaque,
//! process-unique [`StoreKey`]. Keys are stable for the life of the
//! process; records created locally have a key before they have an id.
//!
//! ### Status
//!
//! A [`Status`] bitmask tracks each record through its lifecycle: one core
//! state (EMPTY, READY, DESTROYED, NON_EXISTENT) plus transient flags
//! (LOADING, COMMITTING, NEW, DIRTY, OBSOLETE).
//!
//! ### The commit pipeline
//!
//! Mutations mark records DIRTY and coalesce into a single commit per run
//! loop turn. The [`Store`] partitions pending work into per-(account,
//! type) change entries, hands them to the [`Source`], and advances the
//! status machine as acknowledgements arrive.
//!
//! ### Queries
//!
//! A [`LocalQuery`] filters and sorts loaded records and stays live through
//! type change events. A [`WindowedQuery`] mirrors a long server-ordered
//! list in fixed-size windows, absorbing server deltas and preemptive
//! client edits through a small composition algebra.
//!
//! ## Quick Start
//!
//! ```rust
//! use tidemark::{
//!     Attribute, NullSource, Record, RecordType, Schema, Status, Store, StoreOptions,
//! };
//! use serde_json::json;
//!
//! // 1. Declare the record types.
//! let schema = Schema::new().with_type(
//!     RecordType::new("todo")
//!         .with_attribute(Attribute::new("id"))
//!         .with_attribute(Attribute::new("title").with_default(json!(""))),
//! );
//!
//! // 2. Create a store. NullSource keeps everything local.
//! let mut store = Store::new(schema, Box::new(NullSource), StoreOptions::default());
//!
//! // 3. Create and edit records through handles.
//! let mut todo = Record::new("todo");
//! todo.set(&mut store, "title", json!("learn the tides"));
//! let key = todo.save_to_store(&mut store).unwrap();
//! assert!(store.get_status(key).is(Status::NEW));
//!
//! // 4. Settle the turn: commits and notifications run here.
//! store.flush();
//! ```

pub mod error;
pub mod event;
pub mod query;
pub mod record;
pub mod runloop;
pub mod schema;
pub mod source;
pub mod status;
pub mod store;

pub use error::{CommitError, Result, StoreError, ValidationError};
pub use event::{EventFlow, ListenerId, StoreEvent};
pub use query::{
    ClientUpdate, ListUpdate, LocalQuery, ObserverId, Query, RangeResult, WindowState,
    WindowedQuery,
};
pub use record::{clone_record_into, Record, RecordResult, SettleOptions};
pub use runloop::{Queue, RunLoop};
pub use schema::{AttrKind, Attribute, RecordType, Schema, Validator};
pub use source::{
    AddedId, ChangeSet, CreateEntry, DestroyEntry, FetchRange, IdsPacket, MoveEntry, NullSource,
    QueryFetchRequest, QueryUpdate, Source, TypeChanges, UpdateEntry,
};
pub use status::Status;
pub use store::{Store, StoreOptions};

use serde::{Deserialize, Serialize};

/// Type aliases for clarity
pub type RecordId = String;
pub type AccountId = String;
pub type TypeName = String;
pub type StateToken = String;
pub type Timestamp = u64;

/// Record data: property names to JSON values.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// An opaque, process-unique handle for one record identity.
///
/// Minted once per (account, type, id) triple and never reassigned; a
/// cross-account move produces a new key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StoreKey(pub u64);

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sk{}", self.0)
    }
}
