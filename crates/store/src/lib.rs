//! Persistence layer for Clerk.
//!
//! Everything is expressed against the [`KvStore`] trait (get/set with TTL,
//! delete, prefix scan, ordered list append/range). Production uses the
//! Redis backend; tests and degraded mode use the in-memory backend.
//!
//! Key namespace:
//! - `chat:{id}`                     chat metadata (TTL 30d)
//! - `chat:{id}:msgs`                serialized memory steps, append-only
//! - `chat:{id}:commits`             commit hashes recorded for the chat
//! - `commit:{hash}`                 commit blob (TTL 30d)
//! - `commits:{environment}`         recency-ordered commit hashes per env
//! - `commit_latest:{environment}`   parent pointer for the next commit
//! - `snap:{et}:{eid}:{hash}`        entity snapshot blob (TTL 7d)
//! - `cache:{chat}:{et}:{eid}`       per-chat entity read cache

pub mod chats;
pub mod keys;
pub mod kv;

pub use chats::{ChatMeta, ChatStore};
pub use kv::{KvStore, MemoryKv, RedisKv};
