//! Broadcast directory
//!
//! The directory tracks every live broadcast: its name, start time, listener
//! count and owning connection. The server hub owns it outright and mutates
//! it only from its own event loop.
//!
//! # Architecture
//!
//! ```text
//!                            Hub (single task)
//!                     ┌─────────────────────────┐
//!                     │ directory: Directory {  │
//!                     │   broadcasts: HashMap<  │
//!                     │     BroadcastId,        │
//!                     │     Broadcast>,         │
//!                     │   owners: HashMap<      │
//!                     │     ConnectionId, Id>   │
//!                     │ }                       │
//!                     └───────────┬─────────────┘
//!                                 │ snapshot()
//!         ┌───────────────────────┼───────────────────────┐
//!         ▼                       ▼                       ▼
//!    [Listener]              [Listener]              [Listener]
//!    broadcast-list          broadcast-list          broadcast-list
//! ```
//!
//! The owning connection is held by id only. The hub checks it against its
//! table of open connections, and `Directory::prune` drops any broadcast
//! whose owner has gone.

pub mod entry;
pub mod error;
pub mod store;

pub use entry::{Broadcast, ConnectionId};
pub use error::DirectoryError;
pub use store::Directory;
