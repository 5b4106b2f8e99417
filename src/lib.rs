//! An eventually-persistent, partitioned, concurrent key-value store.
//!
//! It is not:
//!
//! - a durable database: mutations acknowledge *before* they are persisted
//! - a standalone server
//! - a replication protocol: partition roles are modeled, the wire is not
//!
//! This crate exports a [`Store`]: a partitioned in-memory cache in front
//! of an abstract transactional [`KvStore`]. Clients get low-latency reads
//! and mutations against memory; a background flusher drains the dirty
//! queue into the backing store in batches, background fetchers page
//! ejected values back in on demand, and partition lifecycle (state
//! changes, asynchronous deletion, warm-up) runs on two small dispatcher
//! threads.
//!
//! ```
//! use ebb::{Config, Item, MemoryKvStore};
//! use std::sync::Arc;
//!
//! let store = Config::new().open(Arc::new(MemoryKvStore::default()));
//!
//! // Partition 0 starts active; every operation names its partition
//! store.set(Item::new(b"a".to_vec(), b"hello".to_vec(), 0, 0, 0), 0, false)?;
//!
//! let item = store.get(b"a", 0, 0)?;
//! assert_eq!(&*item.value, b"hello");
//!
//! // Persist the dirty queue now instead of waiting for the flusher
//! store.flush();
//!
//! store.del(b"a", 0, 0)?;
//! store.stop();
//! # Ok::<_, ebb::Error>(())
//! ```
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod dirty_queue;
mod dispatcher;
mod error;
mod fetcher;
mod flusher;
mod hash_table;
mod kvstore;
mod notify;
mod partition;
mod stats;
mod store;
mod stored_value;
mod time;
mod value;
mod warmup;

pub use {
    config::Config,
    dirty_queue::{QueueOp, QueuedItem},
    error::{Error, Result},
    kvstore::{GetResult, KvStore, LoadCallback, MemoryKvStore, SetResult},
    notify::{Cookie, NullCallbacks, ServerCallbacks},
    partition::PartitionState,
    stats::{Stats, StatsSnapshot},
    store::{KeyStats, Store},
    time::{Clock, ManualClock, RelTime, WallClock},
    value::{
        Cas, Item, PartitionId, RowId, UserKey, UserValue, LOCKED_CAS, UNASSIGNED_ROW_ID,
    },
};
