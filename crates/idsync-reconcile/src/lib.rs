//! Reconciliation between staged working rows and persisted content.
//!
//! Provides:
//! - A stable SHA-256 digest over a kind's ordered fields ([`digest`])
//! - The content-kind table: fields, digest function and validity accessor per kind ([`kind`])
//! - The [`ReconcileEngine`], which partitions rows into additions, updates,
//!   unchanged rows and deletions, and finds rows whose enabled flag is stale
//!
//! Every stream is paged by the engine's chunk size, so memory stays bounded
//! regardless of how many rows a kind holds.

pub mod chunks;
pub mod digest;
pub mod engine;
pub mod error;
pub mod kind;

pub use chunks::{ContentChunks, Ids, Rows, WorkingChunks};
pub use digest::{digest_values, DigestBuilder};
pub use engine::{ReconcileEngine, ReconcilePlan};
pub use error::ReconcileError;
pub use kind::ContentKind;
