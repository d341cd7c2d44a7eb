use mirage_primitives::KeyError;
use thiserror::Error;

/// A convenient type alias for `Result` with `E` = [`OverlayError`].
pub type Result<T, E = OverlayError> = std::result::Result<T, E>;

/// Configuration and registration errors.
///
/// These are programmer mistakes surfaced when a rule is built or registered.
/// Lifecycle calls (`on_operation_event`, `on_authoritative_value`, `evaluate`)
/// never fail.
#[derive(Error, Debug)]
pub enum OverlayError {
	/// The rule was built without a static or dynamic target.
	#[error("rule `{0}` has no target identity resolver")]
	MissingTarget(String),
	/// The rule was built without a transform or handler factory.
	#[error("rule `{0}` has no transform")]
	MissingTransform(String),
	/// Another registered rule already uses this name.
	#[error("a rule named `{0}` is already registered")]
	DuplicateRule(String),
	/// A policy was built without one of its required callbacks.
	#[error("rule `{rule}` is missing its {callback}")]
	MissingCallback {
		/// Rule label.
		rule: String,
		/// Which callback was not supplied.
		callback: &'static str,
	},
	/// The rule refers to an endpoint the endpoint table does not declare, or
	/// declares with another kind.
	#[error("rule `{rule}`: {source}")]
	Endpoint {
		/// Rule label.
		rule: String,
		/// Underlying endpoint lookup error.
		#[source]
		source: KeyError,
	},
	/// Identity construction failed.
	#[error(transparent)]
	Key(#[from] KeyError),
	/// The configuration text could not be parsed.
	#[error("invalid overlay config: {0}")]
	Config(#[from] toml::de::Error),
}
