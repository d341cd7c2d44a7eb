//! Canonical identity keys.
//!
//! An [`IdentityKey`] names one cached item: a dot-separated endpoint path plus an
//! optional parameter structure. Parameters are rendered as canonical JSON with
//! object keys sorted, so structurally equal parameters always produce the same
//! key no matter in which order their properties were inserted.


use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::{KeyError, Result};

/// Canonical, order-independent identity of a cached item.
///
/// Cheap to clone; both parts are reference counted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
	name: Arc<str>,
	params: Option<Arc<str>>,
}

impl IdentityKey {
	/// Creates a parameterless identity.
	pub fn named(name: &str) -> Result<Self> {
		validate_name(name)?;
		Ok(Self {
			name: Arc::from(name),
			params: None,
		})
	}

	/// Creates an identity from a name and an optional JSON parameter structure.
	///
	/// `null` parameters are treated the same as no parameters.
	pub fn new(name: &str, params: Option<&Value>) -> Result<Self> {
		validate_name(name)?;
		let params = params
			.filter(|params| !params.is_null())
			.map(|params| Arc::from(canonical_json(params)));
		Ok(Self {
			name: Arc::from(name),
			params,
		})
	}

	/// Creates an identity from any serializable parameter structure.
	pub fn with_params<P>(name: &str, params: &P) -> Result<Self>
	where
		P: Serialize + ?Sized,
	{
		let value = serde_json::to_value(params).map_err(|source| KeyError::Params {
			name: name.to_string(),
			source,
		})?;
		Self::new(name, Some(&value))
	}

	/// Returns the endpoint name (e.g. `posts.allInThread`).
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Returns the canonical JSON text of the parameters, if any.
	pub fn params(&self) -> Option<&str> {
		self.params.as_deref()
	}

	/// Iterates the dot-separated path segments of the name.
	pub fn segments(&self) -> impl Iterator<Item = &str> {
		self.name.split('.')
	}

	/// Returns true if the name starts with all segments of `prefix`.
	///
	/// Matching is per segment: `posts` matches `posts.all` but not `postsArchive`.
	/// An empty prefix matches everything.
	pub fn has_prefix(&self, prefix: &str) -> bool {
		if prefix.is_empty() {
			return true;
		}
		let mut own = self.segments();
		prefix.split('.').all(|segment| own.next() == Some(segment))
	}
}

impl fmt::Display for IdentityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.params {
			Some(params) => write!(f, "{}{}", self.name, params),
			None => f.write_str(&self.name),
		}
	}
}

impl fmt::Debug for IdentityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "IdentityKey({self})")
	}
}

fn validate_name(name: &str) -> Result<()> {
	if name.is_empty() {
		return Err(KeyError::EmptyName);
	}
	if name.split('.').any(str::is_empty) {
		return Err(KeyError::EmptySegment(name.to_string()));
	}
	Ok(())
}

/// Renders a JSON value with object keys in sorted order.
///
/// `serde_json::Map` iteration order depends on whether the `preserve_order`
/// feature is enabled anywhere in the dependency graph, so keys are sorted here
/// explicitly instead of relying on the map.
pub fn canonical_json(value: &Value) -> String {
	let mut out = String::new();
	write_canonical(&mut out, value);
	out
}

fn write_canonical(out: &mut String, value: &Value) {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(&String, &Value)> = map.iter().collect();
			entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
			out.push('{');
			for (index, (key, value)) in entries.into_iter().enumerate() {
				if index > 0 {
					out.push(',');
				}
				write_json_string(out, key);
				out.push(':');
				write_canonical(out, value);
			}
			out.push('}');
		}
		Value::Array(items) => {
			out.push('[');
			for (index, item) in items.iter().enumerate() {
				if index > 0 {
					out.push(',');
				}
				write_canonical(out, item);
			}
			out.push(']');
		}
		scalar => {
			let _ = write!(out, "{scalar}");
		}
	}
}

fn write_json_string(out: &mut String, text: &str) {
	// `Display` on a JSON string value emits the quoted, escaped form.
	let _ = write!(out, "{}", Value::from(text));
}

/// Selects cached identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityFilter {
	/// Matches exactly one identity.
	Exact(IdentityKey),
	/// Matches every identity with this name, regardless of parameters.
	Name(Arc<str>),
	/// Matches every identity whose name starts with these path segments.
	Prefix(Arc<str>),
	/// Matches every identity.
	All,
}

impl IdentityFilter {
	/// Filter matching exactly `key`.
	pub fn exact(key: IdentityKey) -> Self {
		Self::Exact(key)
	}

	/// Filter matching every identity named `name`.
	pub fn name(name: &str) -> Self {
		Self::Name(Arc::from(name))
	}

	/// Filter matching every identity under the `prefix` path.
	pub fn prefix(prefix: &str) -> Self {
		Self::Prefix(Arc::from(prefix))
	}

	/// Returns true if `key` is selected by this filter.
	pub fn matches(&self, key: &IdentityKey) -> bool {
		match self {
			Self::Exact(exact) => exact == key,
			Self::Name(name) => key.name() == &**name,
			Self::Prefix(prefix) => key.has_prefix(prefix),
			Self::All => true,
		}
	}

	/// Returns the single identity this filter selects, if it is exact.
	pub fn as_exact(&self) -> Option<&IdentityKey> {
		match self {
			Self::Exact(key) => Some(key),
			_ => None,
		}
	}
}

impl From<IdentityKey> for IdentityFilter {
	fn from(key: IdentityKey) -> Self {
		Self::Exact(key)
	}
}
