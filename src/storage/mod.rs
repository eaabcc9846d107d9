//! Storage Module
//!
//! The building blocks the databases are made of: a sharded concurrent map
//! with ordered multi-key locking, the value types it stores, and the time
//! wheel that fires expirations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ShardedMap<V>                            │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐            │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ ...2^n  │            │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │            │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘            │
//! │        ▲ FNV-1a(key) & (shards - 1)                         │
//! └────────┼────────────────────────────────────────────────────┘
//!          │ rw_locks(write_keys, read_keys) → ShardLocks
//!          │ (ascending acquire, descending release)
//!          │
//!   ┌──────┴──────────────┐        ┌───────────────────────────┐
//!   │ Entity              │        │ DelayScheduler            │
//!   │ String | List |     │        │ (time wheel, tokio task)  │
//!   │ Hash | Set | ZSet   │        │ schedule / cancel by name │
//!   └─────────────────────┘        └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use fluxkv::storage::{PutOutcome, ShardedMap};
//! use bytes::Bytes;
//!
//! let map: ShardedMap<u32> = ShardedMap::new(16);
//! assert_eq!(map.put(Bytes::from("a"), 1), PutOutcome::Inserted);
//! assert_eq!(map.put(Bytes::from("a"), 2), PutOutcome::Updated);
//! assert_eq!(map.get(b"a"), Some(2));
//!
//! let mut region = map.rw_locks(&[Bytes::from("a")], &[]);
//! region.remove(b"a");
//! drop(region);
//! assert!(map.is_empty());
//! ```

pub mod entity;
pub mod sharded;
pub mod timewheel;

// Re-export commonly used types
pub use entity::{Entity, SortedSet};
pub use sharded::{compute_capacity, fnv32, PutOutcome, ShardLocks, ShardedMap};
pub use timewheel::{DelayScheduler, TimeWheelConfig};
