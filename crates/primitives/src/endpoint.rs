//! Statically declared endpoint table.
//!
//! Applications declare their query and mutation names once at startup. The table
//! then builds identities for queries and validates the names that overlay rules
//! refer to, so typos surface at registration instead of silently never matching.


use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{KeyError, Result};
use crate::identity::{IdentityFilter, IdentityKey};
use crate::operation::OperationKind;

/// Whether an endpoint reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
	/// Read endpoint whose results are cached under an identity.
	Query,
	/// Write endpoint whose in-flight calls are tracked as operations.
	Mutation,
}

impl EndpointKind {
	/// Returns a lowercase label.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Query => "query",
			Self::Mutation => "mutation",
		}
	}
}

impl fmt::Display for EndpointKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Immutable table mapping endpoint names to their kind.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
	endpoints: FxHashMap<Arc<str>, EndpointKind>,
}

impl EndpointTable {
	/// Starts declaring a table.
	pub fn builder() -> EndpointTableBuilder {
		EndpointTableBuilder::default()
	}

	/// Returns the declared kind of `name`.
	pub fn kind(&self, name: &str) -> Option<EndpointKind> {
		self.endpoints.get(name).copied()
	}

	/// Returns the number of declared endpoints.
	pub fn len(&self) -> usize {
		self.endpoints.len()
	}

	/// Returns true if nothing was declared.
	pub fn is_empty(&self) -> bool {
		self.endpoints.is_empty()
	}

	/// Fails unless `name` is declared with the `expected` kind.
	pub fn check(&self, name: &str, expected: EndpointKind) -> Result<()> {
		match self.kind(name) {
			Some(actual) if actual == expected => Ok(()),
			Some(actual) => Err(KeyError::WrongKind {
				name: name.to_string(),
				expected,
				actual,
			}),
			None => Err(KeyError::UnknownEndpoint(name.to_string())),
		}
	}

	/// Builds the identity of a declared query.
	pub fn query_key(&self, name: &str, params: Option<&Value>) -> Result<IdentityKey> {
		self.check(name, EndpointKind::Query)?;
		IdentityKey::new(name, params)
	}

	/// Builds the identity of a declared query from serializable parameters.
	pub fn query_key_for<P>(&self, name: &str, params: &P) -> Result<IdentityKey>
	where
		P: Serialize + ?Sized,
	{
		self.check(name, EndpointKind::Query)?;
		IdentityKey::with_params(name, params)
	}

	/// Builds a filter selecting every cached result of a declared query.
	pub fn query_filter(&self, name: &str) -> Result<IdentityFilter> {
		self.check(name, EndpointKind::Query)?;
		Ok(IdentityFilter::name(name))
	}

	/// Returns the operation kind of a declared mutation.
	pub fn mutation(&self, name: &str) -> Result<OperationKind> {
		self.check(name, EndpointKind::Mutation)?;
		Ok(OperationKind::new(name))
	}

	/// Validates every concrete name a filter refers to.
	///
	/// Prefix filters must cover at least one declared query.
	pub fn check_filter(&self, filter: &IdentityFilter) -> Result<()> {
		match filter {
			IdentityFilter::Exact(key) => self.check(key.name(), EndpointKind::Query),
			IdentityFilter::Name(name) => self.check(name, EndpointKind::Query),
			IdentityFilter::Prefix(prefix) => {
				let covered = self
					.endpoints
					.iter()
					.filter(|(_, kind)| **kind == EndpointKind::Query)
					.filter_map(|(name, _)| IdentityKey::named(name).ok())
					.any(|key| key.has_prefix(prefix));
				if covered {
					Ok(())
				} else {
					Err(KeyError::UnknownEndpoint(prefix.to_string()))
				}
			}
			IdentityFilter::All => Ok(()),
		}
	}
}

/// Builder for [`EndpointTable`].
#[derive(Debug, Default)]
pub struct EndpointTableBuilder {
	declared: Vec<(String, EndpointKind)>,
}

impl EndpointTableBuilder {
	/// Declares a query endpoint.
	pub fn query(mut self, name: impl Into<String>) -> Self {
		self.declared.push((name.into(), EndpointKind::Query));
		self
	}

	/// Declares a mutation endpoint.
	pub fn mutation(mut self, name: impl Into<String>) -> Self {
		self.declared.push((name.into(), EndpointKind::Mutation));
		self
	}

	/// Finishes the table, rejecting malformed or duplicate names.
	pub fn build(self) -> Result<EndpointTable> {
		let mut endpoints = FxHashMap::default();
		for (name, kind) in self.declared {
			IdentityKey::named(&name)?;
			if endpoints.insert(Arc::<str>::from(name.as_str()), kind).is_some() {
				return Err(KeyError::DuplicateEndpoint(name));
			}
		}
		Ok(EndpointTable { endpoints })
	}
}
