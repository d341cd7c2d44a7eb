//! Ready-made rules for list-shaped query results.
//!
//! These are ordinary [`OverlayRule`]s built through the public builder; they
//! have no access to engine internals.

#[cfg(test)]
mod tests;

use std::rc::Rc;

use mirage_primitives::{IdentityFilter, OperationKind, OperationState, Reconciliation, Transform, Value};
use serde_json::json;
use tracing::warn;

use crate::error::{OverlayError, Result};
use crate::rule::{InstanceContext, OverlayHandler, OverlayRule, OverlayRuleBuilder};

type Placeholder = Rc<dyn Fn(&Value, i64) -> Value>;
type InsertMatcher = Rc<dyn Fn(&Value, &Value, Option<&Value>) -> Reconciliation>;
type RemoveMatcher = Rc<dyn Fn(&Value, &Value) -> bool>;

/// Starts a rule that shows a placeholder row in a list until the created row
/// arrives from the server.
pub fn array_insert(kind: impl Into<OperationKind>) -> ArrayInsert {
	ArrayInsert {
		rule: OverlayRule::builder(kind).empty_default(json!([])),
		placeholder: None,
		matcher: None,
	}
}

/// Starts a rule that hides a row from a list until the server confirms the
/// deletion.
pub fn array_remove(kind: impl Into<OperationKind>) -> ArrayRemove {
	ArrayRemove {
		rule: OverlayRule::builder(kind).empty_default(json!([])),
		matcher: None,
	}
}

/// Builds a rule applying `transform` to every identity `target` selects.
pub fn optimistic_data(
	kind: impl Into<OperationKind>,
	target: impl Into<IdentityFilter>,
	transform: impl Fn(&Value, &OperationState) -> Transform<Value> + 'static,
) -> Result<OverlayRule> {
	OverlayRule::builder(kind).target(target).transform(transform).build()
}

/// Placeholder constructor copying the operation input and setting `field` to
/// the local id, e.g. `{"title": "A"}` becomes `{"title": "A", "id": -1}`.
///
/// Non-object inputs are wrapped as `{"value": input, field: id}`.
pub fn placeholder_with_id(field: &str) -> impl Fn(&Value, i64) -> Value + 'static {
	let field = field.to_string();
	move |input, local_id| {
		let mut row = match input {
			Value::Object(map) => map.clone(),
			other => {
				let mut map = serde_json::Map::new();
				map.insert("value".to_string(), other.clone());
				map
			}
		};
		row.insert(field.clone(), Value::from(local_id));
		Value::Object(row)
	}
}

/// Builder returned by [`array_insert`].
#[must_use]
pub struct ArrayInsert {
	rule: OverlayRuleBuilder,
	placeholder: Option<Placeholder>,
	matcher: Option<InsertMatcher>,
}

impl ArrayInsert {
	pub fn name(mut self, name: &str) -> Self {
		self.rule = self.rule.name(name);
		self
	}

	/// Lists the insert appears in.
	pub fn target(mut self, filter: impl Into<IdentityFilter>) -> Self {
		self.rule = self.rule.target(filter);
		self
	}

	/// Computes the lists from the operation input.
	pub fn target_with(mut self, resolve: impl Fn(&Value) -> Option<IdentityFilter> + 'static) -> Self {
		self.rule = self.rule.target_with(resolve);
		self
	}

	pub fn matching(mut self, predicate: impl Fn(&OperationState) -> bool + 'static) -> Self {
		self.rule = self.rule.matching(predicate);
		self
	}

	/// Builds the placeholder row from the operation input and a local id.
	pub fn placeholder(mut self, build: impl Fn(&Value, i64) -> Value + 'static) -> Self {
		self.placeholder = Some(Rc::new(build));
		self
	}

	/// Compares a list element with the operation: `(input, element, output)`.
	///
	/// `output` is present once the operation succeeded. Return
	/// [`Reconciliation::Exact`] when the element is the created row.
	pub fn matcher(mut self, matcher: impl Fn(&Value, &Value, Option<&Value>) -> Reconciliation + 'static) -> Self {
		self.matcher = Some(Rc::new(matcher));
		self
	}

	pub fn build(self) -> Result<OverlayRule> {
		let Some(placeholder) = self.placeholder else {
			return Err(missing(self.rule, "placeholder"));
		};
		let Some(matcher) = self.matcher else {
			return Err(missing(self.rule, "matcher"));
		};
		self.rule
			.handler(move |context: &InstanceContext<'_>| {
				Box::new(InsertHandler {
					local_id: context.local_id,
					placeholder: Rc::clone(&placeholder),
					matcher: Rc::clone(&matcher),
				}) as Box<dyn OverlayHandler>
			})
			.build()
	}
}

struct InsertHandler {
	local_id: i64,
	placeholder: Placeholder,
	matcher: InsertMatcher,
}

impl OverlayHandler for InsertHandler {
	fn apply(&mut self, value: &Value, operation: &OperationState) -> Transform<Value> {
		let Some(items) = value.as_array() else {
			warn!(op = %operation.id, "insert target is not a list; overlay retired");
			return Transform::Stop;
		};
		let mut fuzzy = false;
		for item in items {
			match (self.matcher)(&operation.input, item, operation.output.as_ref()).resolve() {
				Reconciliation::Exact => return Transform::Stop,
				Reconciliation::Fuzzy => fuzzy = true,
				Reconciliation::No | Reconciliation::Undecided => {}
			}
		}
		if fuzzy {
			return Transform::Continue(value.clone());
		}
		let mut items = items.clone();
		items.push((self.placeholder)(&operation.input, self.local_id));
		Transform::Continue(Value::Array(items))
	}
}

/// Builder returned by [`array_remove`].
#[must_use]
pub struct ArrayRemove {
	rule: OverlayRuleBuilder,
	matcher: Option<RemoveMatcher>,
}

impl ArrayRemove {
	pub fn name(mut self, name: &str) -> Self {
		self.rule = self.rule.name(name);
		self
	}

	/// Lists the removal applies to.
	pub fn target(mut self, filter: impl Into<IdentityFilter>) -> Self {
		self.rule = self.rule.target(filter);
		self
	}

	/// Computes the lists from the operation input.
	pub fn target_with(mut self, resolve: impl Fn(&Value) -> Option<IdentityFilter> + 'static) -> Self {
		self.rule = self.rule.target_with(resolve);
		self
	}

	pub fn matching(mut self, predicate: impl Fn(&OperationState) -> bool + 'static) -> Self {
		self.rule = self.rule.matching(predicate);
		self
	}

	/// Returns true if a list element is the row being removed: `(input, element)`.
	pub fn matcher(mut self, matcher: impl Fn(&Value, &Value) -> bool + 'static) -> Self {
		self.matcher = Some(Rc::new(matcher));
		self
	}

	pub fn build(self) -> Result<OverlayRule> {
		let Some(matcher) = self.matcher else {
			return Err(missing(self.rule, "matcher"));
		};
		self.rule
			.transform(move |value, operation| remove_step(&*matcher, value, operation))
			.build()
	}
}

fn remove_step(matcher: &dyn Fn(&Value, &Value) -> bool, value: &Value, operation: &OperationState) -> Transform<Value> {
	let Some(items) = value.as_array() else {
		warn!(op = %operation.id, "remove target is not a list; overlay retired");
		return Transform::Stop;
	};
	let kept: Vec<Value> = items
		.iter()
		.filter(|item| !matcher(&operation.input, item))
		.cloned()
		.collect();
	if operation.is_success() && kept.len() == items.len() {
		return Transform::Stop;
	}
	Transform::Continue(Value::Array(kept))
}

fn missing(rule: OverlayRuleBuilder, callback: &'static str) -> OverlayError {
	OverlayError::MissingCallback {
		rule: rule.label(),
		callback,
	}
}
