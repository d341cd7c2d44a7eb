//! Fold and evaluate.
//!
//! The apparent value of an identity is its authoritative value with every
//! active instance applied in fold order. Instances that ask to stop, or whose
//! operation failed, are marked stopped during the fold and queued for removal
//! at the next cleanup checkpoint.

#[cfg(test)]
mod tests;

use std::cell::RefCell;

use mirage_primitives::{IdentityKey, Transform, Value};
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::registry::{FoldStep, InstanceKey, OverlayRegistry, Retirement};
use crate::store::CachedItemStore;

/// Result of folding a chain of instances over a source value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FoldOutcome {
	pub value: Value,
	/// True if at least one instance changed the value.
	pub altered: bool,
	/// Instances that asked to stop, in fold order.
	pub stopped: Vec<InstanceKey>,
}

/// Applies `steps` in order to `source`.
///
/// A failed operation stops its instance without calling the handler. A
/// handler that is already running further up the stack is skipped for this
/// fold.
pub(crate) fn fold(source: Value, steps: impl IntoIterator<Item = FoldStep>) -> FoldOutcome {
	let mut value = source;
	let mut altered = false;
	let mut stopped = Vec::new();
	for step in steps {
		if step.operation.is_error() {
			stopped.push(step.key);
			continue;
		}
		let Ok(mut handler) = step.handler.try_borrow_mut() else {
			warn!(rule = %step.key.rule, op = %step.key.op, "handler re-entered during its own fold; skipped");
			continue;
		};
		match handler.apply(&value, &step.operation) {
			Transform::Continue(next) => {
				if next != value {
					altered = true;
					value = next;
				}
			}
			Transform::Stop => stopped.push(step.key),
		}
	}
	FoldOutcome { value, altered, stopped }
}

/// Evaluates identities against the registry and publishes the result.
#[derive(Default)]
pub(crate) struct OverlayEngine {
	/// Fold sources of identities whose last fold altered the value.
	baselines: RefCell<FxHashMap<IdentityKey, Value>>,
}

impl OverlayEngine {
	pub fn new() -> Self {
		Self::default()
	}

	/// Re-folds `identity` and publishes the apparent value.
	///
	/// Must run inside a registry pass so that retirements are deferred.
	pub fn evaluate(&self, identity: &IdentityKey, store: &CachedItemStore, registry: &OverlayRegistry) -> Option<Value> {
		debug_assert!(registry.turnstile().in_pass(), "evaluate outside a registry pass");

		let keys = store.instances(identity);
		let source = store
			.authoritative(identity)
			.or_else(|| self.baselines.borrow().get(identity).cloned())
			.or_else(|| registry.empty_default(&keys));
		let Some(source) = source else {
			trace!(identity = %identity, "nothing to fold");
			return store.get(identity);
		};

		let steps: Vec<FoldStep> = keys.iter().filter_map(|key| registry.step(identity, *key)).collect();
		let active = steps.len();
		let FoldOutcome { value, altered, stopped } = fold(source.clone(), steps);
		trace!(identity = %identity, active, altered, stopped = stopped.len(), "folded");

		for key in stopped {
			if registry.stop(identity, key) {
				let retirement = Retirement {
					identity: identity.clone(),
					key,
				};
				if registry.turnstile().defer(retirement).is_err() {
					warn!(identity = %identity, rule = %key.rule, op = %key.op, "retirement raised outside a pass");
				}
			}
		}

		{
			let mut baselines = self.baselines.borrow_mut();
			if altered {
				baselines.insert(identity.clone(), source);
			} else {
				baselines.remove(identity);
			}
		}

		store.publish(identity, value.clone());
		Some(value)
	}

	/// Returns true if the last fold of `identity` changed its value.
	pub fn is_speculative(&self, identity: &IdentityKey) -> bool {
		self.baselines.borrow().contains_key(identity)
	}

	pub fn forget(&self, identity: &IdentityKey) {
		self.baselines.borrow_mut().remove(identity);
	}
}
