//! Observer-side projection of the transfer list.
//!
//! [`synchronize`] turns a stale cached list and a fresh query result into
//! the smallest run of insert/update/remove operations that makes the cache
//! match. [`TransferListModel`] re-queries the store off the caller's task
//! and applies those operations to its rows.

mod list_sync;
mod refresh;

pub use list_sync::{synchronize, ListChange, SyncItem};
pub use refresh::{ModelStatus, ModelUpdate, TransferListModel, TransferSource};
