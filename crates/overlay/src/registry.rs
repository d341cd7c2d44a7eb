//! Layer registry and deferred cleanup.
//!
//! Every registered rule is a layer. A layer remembers the live operations it
//! matched and, per cached identity, the instances it created for them. Instances
//! are created lazily: when an operation event arrives for an identity that is
//! already cached, or when an identity becomes cached while a matching operation
//! is still pending.
//!
//! Structural removal of instances never happens while a fold may be iterating
//! them. Retirements raised inside a pass are queued in a [`Turnstile`] and
//! applied once the outermost pass completes.


use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use indexmap::IndexMap;
use mirage_primitives::{IdentityFilter, IdentityKey, OperationId, OperationState, OperationStatus, Value};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::rule::{InstanceContext, OverlayHandler, OverlayRule, RuleId};

/// Position of an instance in the fold.
///
/// Orders by first observation of the operation, then by rule registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct InstanceKey {
	pub seq: u64,
	pub rule: RuleId,
	pub op: OperationId,
}

/// Request to physically remove one stopped instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Retirement {
	pub identity: IdentityKey,
	pub key: InstanceKey,
}

pub(crate) type SharedHandler = Rc<RefCell<Box<dyn OverlayHandler>>>;

/// Everything the fold needs for one active instance.
pub(crate) struct FoldStep {
	pub key: InstanceKey,
	pub operation: Rc<OperationState>,
	pub handler: SharedHandler,
}

/// Outcome of [`OverlayRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
	/// A new instance was created.
	Created(InstanceKey),
	/// An existing instance saw a status change.
	Updated(InstanceKey),
	/// Nothing changed.
	Skipped,
}

/// A rule matched an operation.
#[derive(Debug, Clone)]
pub(crate) struct LayerMatch {
	pub rule: RuleId,
	pub target: IdentityFilter,
}

/// Diagnostic view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
	/// Owning rule.
	pub rule: RuleId,
	/// Owning operation.
	pub operation: OperationId,
	/// Operation status the instance last saw.
	pub status: OperationStatus,
	/// Whether the instance has retired.
	pub stopped: bool,
	/// Local placeholder id of the operation.
	pub local_id: i64,
}

struct Instance {
	seq: u64,
	operation: Rc<OperationState>,
	handler: SharedHandler,
	stopped: bool,
	local_id: i64,
}

struct LiveOperation {
	seq: u64,
	target: IdentityFilter,
	operation: Rc<OperationState>,
}

struct Layer {
	rule: Rc<OverlayRule>,
	/// Pending operations this layer matched, by first observation.
	live: IndexMap<OperationId, LiveOperation>,
	buckets: IndexMap<IdentityKey, IndexMap<OperationId, Instance>>,
}

impl Layer {
	fn is_drained(&self) -> bool {
		self.live.is_empty() && self.buckets.is_empty()
	}
}

#[derive(Default)]
struct RegistryState {
	layers: IndexMap<RuleId, Layer>,
	next_rule: u64,
	next_local_id: i64,
	local_ids: FxHashMap<OperationId, i64>,
	/// Instances removed while their operation was still pending. They must not
	/// be recreated by later events of the same operation.
	retired: FxHashSet<(RuleId, OperationId, IdentityKey)>,
}

/// Owns every layer and the cleanup turnstile.
pub(crate) struct OverlayRegistry {
	state: RefCell<RegistryState>,
	turnstile: Turnstile<Retirement>,
}

impl OverlayRegistry {
	pub fn new(placeholder_id_start: i64) -> Self {
		Self {
			state: RefCell::new(RegistryState {
				next_local_id: placeholder_id_start,
				..RegistryState::default()
			}),
			turnstile: Turnstile::new(),
		}
	}

	pub fn turnstile(&self) -> &Turnstile<Retirement> {
		&self.turnstile
	}

	pub fn add_layer(&self, rule: OverlayRule) -> RuleId {
		let mut state = self.state.borrow_mut();
		let id = RuleId(state.next_rule);
		state.next_rule += 1;
		debug!(rule = %id, label = rule.label(), kind = %rule.kind(), "layer registered");
		state.layers.insert(
			id,
			Layer {
				rule: Rc::new(rule),
				live: IndexMap::new(),
				buckets: IndexMap::new(),
			},
		);
		id
	}

	pub fn has_rule_named(&self, name: &str) -> bool {
		self.state.borrow().layers.values().any(|layer| layer.rule.name() == Some(name))
	}

	pub fn rules(&self) -> Vec<(RuleId, Rc<OverlayRule>)> {
		self.state
			.borrow()
			.layers
			.iter()
			.map(|(id, layer)| (*id, Rc::clone(&layer.rule)))
			.collect()
	}

	/// Per-rule counts of live operations and instances.
	pub fn layer_load(&self, id: RuleId) -> Option<(usize, usize)> {
		self.state
			.borrow()
			.layers
			.get(&id)
			.map(|layer| (layer.live.len(), layer.buckets.values().map(IndexMap::len).sum()))
	}

	/// Removes a layer and returns every instance it owned.
	pub fn remove_layer(&self, id: RuleId) -> Option<Vec<Retirement>> {
		let mut state = self.state.borrow_mut();
		let layer = state.layers.shift_remove(&id)?;
		state.retired.retain(|(rule, _, _)| *rule != id);
		let retirements: Vec<Retirement> = layer
			.buckets
			.into_iter()
			.flat_map(|(identity, bucket)| {
				bucket.into_iter().map(move |(op, instance)| Retirement {
					identity: identity.clone(),
					key: InstanceKey {
						seq: instance.seq,
						rule: id,
						op,
					},
				})
			})
			.collect();
		debug!(rule = %id, instances = retirements.len(), "layer unregistered");
		Some(retirements)
	}

	/// Offers an operation transition to every layer.
	///
	/// Returns the layers that matched and the identities they target. Pending
	/// operations are remembered per layer; terminal ones are forgotten. A layer
	/// only takes up an operation from its pending step, so rules registered
	/// while an operation is in flight ignore its resolution.
	pub fn observe(&self, seq: u64, operation: &Rc<OperationState>) -> Vec<LayerMatch> {
		let candidates: Vec<(RuleId, Rc<OverlayRule>, Option<IdentityFilter>)> = self
			.state
			.borrow()
			.layers
			.iter()
			.map(|(id, layer)| {
				let known = layer.live.get(&operation.id).map(|live| live.target.clone());
				(*id, Rc::clone(&layer.rule), known)
			})
			.collect();

		// Rule callbacks run without the registry borrowed.
		let mut matched = Vec::new();
		for (rule_id, rule, known) in candidates {
			let target = match known {
				Some(target) => Some(target),
				None if operation.is_terminal() => continue,
				None if rule.matches(operation) => rule.resolve_target(operation),
				None => continue,
			};
			let Some(target) = target else {
				debug!(rule = %rule_id, op = %operation.id, "operation resolved no target");
				continue;
			};
			matched.push(LayerMatch { rule: rule_id, target });
		}

		let mut state = self.state.borrow_mut();
		if !matched.is_empty() && !state.local_ids.contains_key(&operation.id) {
			let local_id = state.next_local_id;
			state.next_local_id -= 1;
			state.local_ids.insert(operation.id, local_id);
		}
		for found in &matched {
			let Some(layer) = state.layers.get_mut(&found.rule) else {
				continue;
			};
			if operation.is_terminal() {
				layer.live.shift_remove(&operation.id);
			} else {
				layer.live.insert(
					operation.id,
					LiveOperation {
						seq,
						target: found.target.clone(),
						operation: Rc::clone(operation),
					},
				);
			}
		}
		matched
	}

	/// Pending operations whose layer should cover a newly cached identity.
	pub fn adoptable(&self, identity: &IdentityKey) -> Vec<(RuleId, u64, Rc<OperationState>)> {
		let state = self.state.borrow();
		let mut found = Vec::new();
		for (rule_id, layer) in &state.layers {
			if !layer.rule.in_scope(identity) {
				continue;
			}
			for live in layer.live.values() {
				if live.target.matches(identity) {
					found.push((*rule_id, live.seq, Rc::clone(&live.operation)));
				}
			}
		}
		found
	}

	/// Creates the instance for (rule, operation, identity) or refreshes its
	/// operation state.
	pub fn upsert(&self, rule_id: RuleId, seq: u64, operation: &Rc<OperationState>, identity: &IdentityKey) -> Upsert {
		let key = InstanceKey {
			seq,
			rule: rule_id,
			op: operation.id,
		};
		let (rule, local_id) = {
			let mut state = self.state.borrow_mut();
			let state = &mut *state;
			let retired = state.retired.contains(&(rule_id, operation.id, identity.clone()));
			let Some(layer) = state.layers.get_mut(&rule_id) else {
				return Upsert::Skipped;
			};
			if !layer.rule.in_scope(identity) {
				return Upsert::Skipped;
			}
			if let Some(instance) = layer.buckets.get_mut(identity).and_then(|bucket| bucket.get_mut(&operation.id)) {
				if instance.stopped || instance.operation.status == operation.status {
					return Upsert::Skipped;
				}
				trace!(rule = %rule_id, op = %operation.id, identity = %identity, status = %operation.status, "instance status changed");
				instance.operation = Rc::clone(operation);
				return Upsert::Updated(key);
			}
			if retired || operation.is_error() {
				return Upsert::Skipped;
			}
			let rule = Rc::clone(&layer.rule);
			let local_id = match state.local_ids.get(&operation.id) {
				Some(local_id) => *local_id,
				None => {
					let local_id = state.next_local_id;
					state.next_local_id -= 1;
					state.local_ids.insert(operation.id, local_id);
					local_id
				}
			};
			(rule, local_id)
		};

		let handler = rule.create_handler(&InstanceContext {
			identity,
			operation,
			local_id,
		});

		let mut state = self.state.borrow_mut();
		let Some(layer) = state.layers.get_mut(&rule_id) else {
			return Upsert::Skipped;
		};
		let bucket = layer.buckets.entry(identity.clone()).or_default();
		if bucket.contains_key(&operation.id) {
			return Upsert::Skipped;
		}
		bucket.insert(
			operation.id,
			Instance {
				seq,
				operation: Rc::clone(operation),
				handler: Rc::new(RefCell::new(handler)),
				stopped: false,
				local_id,
			},
		);
		debug!(rule = %rule_id, op = %operation.id, identity = %identity, local_id, "instance created");
		Upsert::Created(key)
	}

	/// Returns the fold step for an active instance.
	pub fn step(&self, identity: &IdentityKey, key: InstanceKey) -> Option<FoldStep> {
		let state = self.state.borrow();
		let instance = state.layers.get(&key.rule)?.buckets.get(identity)?.get(&key.op)?;
		if instance.stopped {
			return None;
		}
		Some(FoldStep {
			key,
			operation: Rc::clone(&instance.operation),
			handler: Rc::clone(&instance.handler),
		})
	}

	/// Default fold source supplied by the first listed rule that has one.
	pub fn empty_default(&self, keys: &[InstanceKey]) -> Option<Value> {
		let state = self.state.borrow();
		keys.iter()
			.filter_map(|key| state.layers.get(&key.rule))
			.find_map(|layer| layer.rule.empty_default().cloned())
	}

	/// Marks an instance stopped. Returns true on the first call.
	pub fn stop(&self, identity: &IdentityKey, key: InstanceKey) -> bool {
		let mut state = self.state.borrow_mut();
		let Some(instance) = state
			.layers
			.get_mut(&key.rule)
			.and_then(|layer| layer.buckets.get_mut(identity))
			.and_then(|bucket| bucket.get_mut(&key.op))
		else {
			return false;
		};
		if instance.stopped {
			return false;
		}
		instance.stopped = true;
		debug!(rule = %key.rule, op = %key.op, identity = %identity, status = %instance.operation.status, "instance stopped");
		true
	}

	/// Physically removes an instance. Must only run at a cleanup checkpoint.
	pub fn remove_instance(&self, identity: &IdentityKey, key: InstanceKey) -> bool {
		let mut state = self.state.borrow_mut();
		let state = &mut *state;
		let Some(layer) = state.layers.get_mut(&key.rule) else {
			return false;
		};
		let Some(bucket) = layer.buckets.get_mut(identity) else {
			return false;
		};
		if bucket.shift_remove(&key.op).is_none() {
			return false;
		}
		if bucket.is_empty() {
			layer.buckets.shift_remove(identity);
		}
		if layer.live.contains_key(&key.op) {
			state.retired.insert((key.rule, key.op, identity.clone()));
		}
		if layer.is_drained() {
			debug!(rule = %key.rule, label = layer.rule.label(), "layer drained");
		}
		true
	}

	/// Forgets per-operation bookkeeping once an operation resolved.
	pub fn settle(&self, op: OperationId) {
		let mut state = self.state.borrow_mut();
		state.local_ids.remove(&op);
		state.retired.retain(|(_, retired, _)| *retired != op);
	}

	pub fn instance_info(&self, identity: &IdentityKey, key: InstanceKey) -> Option<InstanceInfo> {
		let state = self.state.borrow();
		let instance = state.layers.get(&key.rule)?.buckets.get(identity)?.get(&key.op)?;
		Some(InstanceInfo {
			rule: key.rule,
			operation: key.op,
			status: instance.operation.status,
			stopped: instance.stopped,
			local_id: instance.local_id,
		})
	}
}

/// Single-writer turnstile for reentrant passes.
///
/// [`run`](Self::run) brackets a pass. Work queued with [`defer`](Self::defer)
/// while any pass is active is applied after the outermost pass returns, in
/// queue order. Work queued by the apply callback itself is drained in the
/// same checkpoint.
pub(crate) struct Turnstile<C> {
	depth: Cell<usize>,
	deferred: RefCell<VecDeque<C>>,
}

impl<C> Turnstile<C> {
	pub fn new() -> Self {
		Self {
			depth: Cell::new(0),
			deferred: RefCell::new(VecDeque::new()),
		}
	}

	pub fn in_pass(&self) -> bool {
		self.depth.get() > 0
	}

	#[cfg(test)]
	pub fn pending(&self) -> usize {
		self.deferred.borrow().len()
	}

	/// Queues `work` for the next checkpoint.
	///
	/// Outside a pass nothing will drain the queue, so the work is handed back.
	pub fn defer(&self, work: C) -> Result<(), C> {
		if !self.in_pass() {
			return Err(work);
		}
		self.deferred.borrow_mut().push_back(work);
		Ok(())
	}

	/// Runs `pass`; if it is the outermost one, drains deferred work into `apply`.
	pub fn run<R>(&self, pass: impl FnOnce() -> R, mut apply: impl FnMut(C)) -> R {
		let guard = PassGuard::enter(self);
		let out = pass();
		if guard.outermost {
			loop {
				let next = self.deferred.borrow_mut().pop_front();
				let Some(work) = next else {
					break;
				};
				apply(work);
			}
		}
		out
	}
}

struct PassGuard<'a, C> {
	turnstile: &'a Turnstile<C>,
	outermost: bool,
}

impl<'a, C> PassGuard<'a, C> {
	fn enter(turnstile: &'a Turnstile<C>) -> Self {
		let depth = turnstile.depth.get();
		turnstile.depth.set(depth + 1);
		Self {
			turnstile,
			outermost: depth == 0,
		}
	}
}

impl<C> Drop for PassGuard<'_, C> {
	fn drop(&mut self) {
		self.turnstile.depth.set(self.turnstile.depth.get() - 1);
		if self.outermost && std::thread::panicking() {
			// Half-applied passes leave nothing queued for the next caller.
			self.turnstile.deferred.borrow_mut().clear();
		}
	}
}
