//! `jobflow-core`: foundation building blocks shared by every engine crate.
//!
//! This crate contains **pure** primitives (no storage, no threads): identifiers,
//! the revisioned `Entity` contract and the domain error model.

pub mod entity;
pub mod error;
pub mod id;
pub mod revision;

pub use entity::{Entity, EntityKey};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, TenantId};
pub use revision::{ExpectedRevision, Revision};
