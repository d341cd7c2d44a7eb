use thiserror::Error;

use crate::endpoint::EndpointKind;

/// A convenient type alias for `Result` with `E` = [`KeyError`].
pub type Result<T, E = KeyError> = std::result::Result<T, E>;

/// Errors that can occur while constructing identities or endpoint tables.
#[derive(Error, Debug)]
pub enum KeyError {
	/// Identity and endpoint names must contain at least one character.
	#[error("identity name must not be empty")]
	EmptyName,
	/// A dot-separated name contained an empty segment (e.g. `threads..all`).
	#[error("identity name has an empty path segment: {0}")]
	EmptySegment(String),
	/// Parameters could not be converted into a JSON value.
	#[error("failed to serialize parameters for `{name}`: {source}")]
	Params {
		/// Endpoint or identity name the parameters belong to.
		name: String,
		/// Underlying serializer error.
		#[source]
		source: serde_json::Error,
	},
	/// The name was never declared in the endpoint table.
	#[error("endpoint not declared: {0}")]
	UnknownEndpoint(String),
	/// The endpoint exists but is of another kind.
	#[error("endpoint `{name}` is a {actual}, expected a {expected}")]
	WrongKind {
		/// Endpoint name.
		name: String,
		/// Kind the caller asked for.
		expected: EndpointKind,
		/// Kind the endpoint was declared with.
		actual: EndpointKind,
	},
	/// The same endpoint name was declared twice.
	#[error("endpoint declared twice: {0}")]
	DuplicateEndpoint(String),
}
