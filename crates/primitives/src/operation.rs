//! In-flight write operations.
//!
//! The transport reports each write as a sequence of [`OperationState`] snapshots.
//! Status moves at most once from [`OperationStatus::Pending`] to a terminal
//! status and stays there.


use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque sequence number identifying one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
	/// Returns the underlying sequence number.
	#[inline]
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for OperationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "op#{}", self.0)
	}
}

/// Name of the mutation an operation invokes (e.g. `threads.create`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKind(Arc<str>);

impl OperationKind {
	/// Creates an operation kind from a mutation name.
	pub fn new(name: &str) -> Self {
		Self(Arc::from(name))
	}

	/// Returns the mutation name.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for OperationKind {
	fn from(name: &str) -> Self {
		Self::new(name)
	}
}

impl From<String> for OperationKind {
	fn from(name: String) -> Self {
		Self(Arc::from(name))
	}
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
	/// Issued, no response yet.
	Pending,
	/// Confirmed by the server.
	Success,
	/// Failed; the speculative effect must be reverted.
	Error,
}

impl OperationStatus {
	/// Returns true for `Success` and `Error`.
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Success | Self::Error)
	}

	/// Returns a lowercase label.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Success => "success",
			Self::Error => "error",
		}
	}
}

impl fmt::Display for OperationStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Failure reported by the transport for a tracked write.
///
/// Delivered as part of a terminal [`OperationState`], never raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct OperationError {
	message: String,
}

impl OperationError {
	/// Creates an error with a human-readable message.
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}

	/// Returns the message.
	pub fn message(&self) -> &str {
		&self.message
	}
}

/// Full snapshot of one operation at a point in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationState {
	/// Operation sequence number.
	pub id: OperationId,
	/// Mutation this operation invokes.
	pub kind: OperationKind,
	/// Current status.
	pub status: OperationStatus,
	/// Input parameters the write was issued with.
	pub input: Value,
	/// Confirmed output, present once the operation succeeded.
	pub output: Option<Value>,
	/// Failure, present once the operation errored.
	pub error: Option<OperationError>,
}

impl OperationState {
	/// Creates the initial pending snapshot.
	pub fn pending(id: OperationId, kind: impl Into<OperationKind>, input: Value) -> Self {
		Self {
			id,
			kind: kind.into(),
			status: OperationStatus::Pending,
			input,
			output: None,
			error: None,
		}
	}

	/// Returns the success snapshot carrying `output`.
	pub fn succeeded(self, output: Value) -> Self {
		Self {
			status: OperationStatus::Success,
			output: Some(output),
			error: None,
			..self
		}
	}

	/// Returns the error snapshot carrying `error`.
	pub fn failed(self, error: OperationError) -> Self {
		Self {
			status: OperationStatus::Error,
			output: None,
			error: Some(error),
			..self
		}
	}

	/// Returns true while the operation has not resolved.
	pub fn is_pending(&self) -> bool {
		self.status == OperationStatus::Pending
	}

	/// Returns true once the operation was confirmed.
	pub fn is_success(&self) -> bool {
		self.status == OperationStatus::Success
	}

	/// Returns true once the operation failed.
	pub fn is_error(&self) -> bool {
		self.status == OperationStatus::Error
	}

	/// Returns true once the status can no longer change.
	pub fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}
}
