//! A normalized GraphQL result cache and optimistic mutation engine.
//!
//! [`Cache`] is the library's one entry point: it normalizes query-shaped result trees into a flat
//! keyed [`Store`], denormalizes them back out against any compatible selection set, reconciles
//! identity as objects gain real ids, and layers speculative (optimistic) writes above the base
//! store without losing the ability to roll any one of them back independently. See each module's
//! doc comment for the piece of that it owns; `DESIGN.md` at the repository root records where
//! each piece is grounded.
//!
//! This crate does not parse GraphQL documents, perform network I/O, or validate a schema — it
//! consumes a [`document`] AST an external collaborator already built and hands back data, never
//! the other way around.

pub mod cache;
pub mod document;
pub mod error;
pub mod field_key;
pub mod optimistic;
pub mod reader;
mod reconcile;
pub mod snapshot;
pub mod value;
pub mod watch;
pub mod writer;

pub use crate::cache::Cache;
pub use crate::cache::WatchCallback;
pub use crate::error::CacheError;
pub use crate::reader::ReadOutcome;
pub use crate::value::EntityId;
pub use crate::value::Store;
pub use crate::watch::WatchToken;
pub use crate::writer::Identify;
