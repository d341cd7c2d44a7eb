//! Overlay rules and per-instance handlers.
//!
//! A rule says which operations it reacts to, which cached identities those
//! operations affect, and how to transform a cached value while the operation is
//! in flight. The registry instantiates one handler per (rule, operation, identity)
//! the first time the rule matches.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use mirage_primitives::{IdentityFilter, IdentityKey, KeyError, OperationKind, OperationState, Transform, Value};

use crate::error::{OverlayError, Result};

/// Stable id of a registered rule. Lower ids were registered earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub(crate) u64);

impl RuleId {
	/// Returns the underlying counter value.
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for RuleId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "rule#{}", self.0)
	}
}

/// Context handed to a handler factory when an instance is created.
#[derive(Debug)]
pub struct InstanceContext<'a> {
	/// Identity the instance transforms.
	pub identity: &'a IdentityKey,
	/// Operation state at creation time.
	pub operation: &'a OperationState,
	/// Locally unique negative number for placeholder rows. Shared by every
	/// instance of the same operation.
	pub local_id: i64,
}

/// Per-instance transform with private state.
pub trait OverlayHandler {
	/// Transforms `value` for the current state of the operation.
	///
	/// Called once per evaluation while the instance is active. Returning
	/// [`Transform::Stop`] retires the instance for good.
	fn apply(&mut self, value: &Value, operation: &OperationState) -> Transform<Value>;
}

impl<F> OverlayHandler for F
where
	F: FnMut(&Value, &OperationState) -> Transform<Value>,
{
	fn apply(&mut self, value: &Value, operation: &OperationState) -> Transform<Value> {
		self(value, operation)
	}
}

type HandlerFactory = Rc<dyn Fn(&InstanceContext<'_>) -> Box<dyn OverlayHandler>>;
type TargetResolver = Rc<dyn Fn(&Value) -> Option<IdentityFilter>>;
type OperationPredicate = Rc<dyn Fn(&OperationState) -> bool>;

/// A registered speculative transform.
pub struct OverlayRule {
	name: Option<Arc<str>>,
	kind: OperationKind,
	scope: Option<IdentityFilter>,
	resolver: Option<TargetResolver>,
	predicate: Option<OperationPredicate>,
	empty_default: Option<Value>,
	factory: HandlerFactory,
}

impl OverlayRule {
	/// Starts a rule reacting to operations of `kind`.
	pub fn builder(kind: impl Into<OperationKind>) -> OverlayRuleBuilder {
		OverlayRuleBuilder {
			name: None,
			kind: kind.into(),
			scope: None,
			resolver: None,
			predicate: None,
			empty_default: None,
			factory: None,
		}
	}

	/// Returns the explicit name, if one was given.
	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Returns the name, falling back to the operation kind.
	pub fn label(&self) -> &str {
		self.name.as_deref().unwrap_or(self.kind.as_str())
	}

	/// Returns the operation kind this rule reacts to.
	pub fn kind(&self) -> &OperationKind {
		&self.kind
	}

	/// Returns the static filter every targeted identity must pass.
	pub fn scope(&self) -> Option<&IdentityFilter> {
		self.scope.as_ref()
	}

	/// Returns the value folded over when a target has never been fetched.
	pub fn empty_default(&self) -> Option<&Value> {
		self.empty_default.as_ref()
	}

	/// Returns true if the rule reacts to `operation`.
	pub fn matches(&self, operation: &OperationState) -> bool {
		operation.kind == self.kind && self.predicate.as_ref().is_none_or(|predicate| predicate(operation))
	}

	/// Resolves the identities `operation` affects.
	///
	/// The per-operation resolver wins over the static scope. Identities selected
	/// by the resolver must still pass the scope.
	pub fn resolve_target(&self, operation: &OperationState) -> Option<IdentityFilter> {
		match &self.resolver {
			Some(resolver) => resolver(&operation.input),
			None => self.scope.clone(),
		}
	}

	/// Returns true if `identity` is inside the static scope.
	pub fn in_scope(&self, identity: &IdentityKey) -> bool {
		self.scope.as_ref().is_none_or(|scope| scope.matches(identity))
	}

	pub(crate) fn create_handler(&self, context: &InstanceContext<'_>) -> Box<dyn OverlayHandler> {
		(self.factory)(context)
	}
}

impl fmt::Debug for OverlayRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("OverlayRule")
			.field("name", &self.name)
			.field("kind", &self.kind)
			.field("scope", &self.scope)
			.field("dynamic_target", &self.resolver.is_some())
			.field("empty_default", &self.empty_default)
			.finish_non_exhaustive()
	}
}

/// Builder for [`OverlayRule`].
#[must_use]
pub struct OverlayRuleBuilder {
	name: Option<Arc<str>>,
	kind: OperationKind,
	scope: Option<IdentityFilter>,
	resolver: Option<TargetResolver>,
	predicate: Option<OperationPredicate>,
	empty_default: Option<Value>,
	factory: Option<HandlerFactory>,
}

impl OverlayRuleBuilder {
	/// Names the rule. Named rules must be unique per client.
	pub fn name(mut self, name: &str) -> Self {
		self.name = Some(Arc::from(name));
		self
	}

	/// Restricts the rule to identities selected by `filter`.
	///
	/// Without [`target_with`](Self::target_with) every matching operation
	/// targets the whole scope.
	pub fn target(mut self, filter: impl Into<IdentityFilter>) -> Self {
		self.scope = Some(filter.into());
		self
	}

	/// Computes the targeted identities from each operation's input.
	///
	/// Returning `None` means the operation affects nothing.
	pub fn target_with(mut self, resolve: impl Fn(&Value) -> Option<IdentityFilter> + 'static) -> Self {
		self.resolver = Some(Rc::new(resolve));
		self
	}

	/// Narrows the operations of this kind that the rule reacts to.
	pub fn matching(mut self, predicate: impl Fn(&OperationState) -> bool + 'static) -> Self {
		self.predicate = Some(Rc::new(predicate));
		self
	}

	/// Value to fold over when a targeted identity has never been fetched.
	pub fn empty_default(mut self, value: Value) -> Self {
		self.empty_default = Some(value);
		self
	}

	/// Stateless transform shared by every instance.
	pub fn transform(mut self, transform: impl Fn(&Value, &OperationState) -> Transform<Value> + 'static) -> Self {
		let transform = Rc::new(transform);
		self.factory = Some(Rc::new(move |_: &InstanceContext<'_>| {
			let transform = Rc::clone(&transform);
			Box::new(move |value: &Value, operation: &OperationState| transform(value, operation)) as Box<dyn OverlayHandler>
		}));
		self
	}

	/// Factory creating a fresh handler for every instance.
	pub fn handler(mut self, factory: impl Fn(&InstanceContext<'_>) -> Box<dyn OverlayHandler> + 'static) -> Self {
		self.factory = Some(Rc::new(factory));
		self
	}

	/// Returns the name, falling back to the operation kind.
	pub fn label(&self) -> String {
		self.name.as_deref().unwrap_or(self.kind.as_str()).to_string()
	}

	/// Finishes the rule.
	pub fn build(self) -> Result<OverlayRule> {
		let label = self.label();
		if self.kind.as_str().is_empty() {
			return Err(OverlayError::Key(KeyError::EmptyName));
		}
		if self.scope.is_none() && self.resolver.is_none() {
			return Err(OverlayError::MissingTarget(label));
		}
		let Some(factory) = self.factory else {
			return Err(OverlayError::MissingTransform(label));
		};
		Ok(OverlayRule {
			name: self.name,
			kind: self.kind,
			scope: self.scope,
			resolver: self.resolver,
			predicate: self.predicate,
			empty_default: self.empty_default,
			factory,
		})
	}
}
