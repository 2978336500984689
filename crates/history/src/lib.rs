//! Configuration change tracking.
//!
//! Every write the agent performs against the downstream platform is
//! captured as an [`EntityChange`] (before/after snapshot pair). At the end
//! of a run the accumulated changes become a [`ConfigCommit`]: content-hashed,
//! chained to its parent, summarized by a short LLM call, and persisted with
//! per-entity snapshots for point-in-time restore.

pub mod models;
pub mod revert;
pub mod service;
pub mod store;

pub use models::{compute_commit_hash, deduplicate_changes, ConfigCommit, EntityChange, Operation};
pub use revert::{compute_revert_patch, revert_action, RevertAction};
pub use service::CommitService;
pub use store::{CommitStore, SnapshotStore};
