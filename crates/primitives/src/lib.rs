//! Core types for speculative overlays: identities, operations, and transform results.

/// Statically declared query and mutation endpoints.
pub mod endpoint;
/// Errors raised while building identities and endpoint tables.
pub mod error;
/// Canonical identity keys and identity filters.
pub mod identity;
/// Operation ids, lifecycle status, and state snapshots.
pub mod operation;
/// Transform results and reconciliation verdicts.
pub mod transform;

pub use endpoint::{EndpointKind, EndpointTable, EndpointTableBuilder};
pub use error::{KeyError, Result};
pub use identity::{IdentityFilter, IdentityKey, canonical_json};
pub use operation::{OperationError, OperationId, OperationKind, OperationState, OperationStatus};
pub use serde_json::Value;
pub use transform::{Reconciliation, Transform};
