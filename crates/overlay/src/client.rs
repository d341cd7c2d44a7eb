//! The overlay client: one context object per application session.
//!
//! [`OverlayClient`] wires the tracker, store, registry and engine together and
//! is the only entry point for transport reports and application reads. It is
//! single-threaded and cheap to clone; clones share state.


use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use mirage_primitives::{EndpointKind, EndpointTable, IdentityKey, KeyError, OperationId, OperationKind, OperationState, Value};
use tracing::debug;

use crate::config::OverlayConfig;
use crate::engine::OverlayEngine;
use crate::error::{OverlayError, Result};
use crate::registry::{InstanceInfo, OverlayRegistry, Retirement, Upsert};
use crate::rule::{OverlayRule, RuleId};
use crate::store::CachedItemStore;
use crate::subscription::Subscription;
use crate::tracker::{OperationFilter, OperationTracker, Transition};

/// Control surface the engine needs from the transport.
pub trait TransportControl {
	/// Marks the cached result of `identity` stale and fetches it again. The new
	/// value is expected back through [`OverlayClient::on_authoritative_value`].
	fn invalidate_and_refetch(&self, identity: &IdentityKey);
}

pub(crate) struct ClientInner {
	config: OverlayConfig,
	endpoints: Option<EndpointTable>,
	transport: Option<Rc<dyn TransportControl>>,
	tracker: OperationTracker,
	store: CachedItemStore,
	registry: OverlayRegistry,
	engine: OverlayEngine,
}

/// Speculative overlay client.
#[derive(Clone)]
pub struct OverlayClient {
	inner: Rc<ClientInner>,
}

/// Non-owning reference to an [`OverlayClient`], for callbacks stored inside it.
#[derive(Clone)]
pub struct WeakOverlayClient {
	inner: Weak<ClientInner>,
}

impl WeakOverlayClient {
	/// Returns the client if it is still alive.
	pub fn upgrade(&self) -> Option<OverlayClient> {
		self.inner.upgrade().map(|inner| OverlayClient { inner })
	}
}

/// Builder for [`OverlayClient`].
#[derive(Default)]
#[must_use]
pub struct OverlayClientBuilder {
	config: OverlayConfig,
	endpoints: Option<EndpointTable>,
	transport: Option<Rc<dyn TransportControl>>,
}

impl OverlayClientBuilder {
	/// Replaces the default configuration.
	pub fn config(mut self, config: OverlayConfig) -> Self {
		self.config = config;
		self
	}

	/// Validates rules against a declared endpoint table at registration.
	pub fn endpoints(mut self, endpoints: EndpointTable) -> Self {
		self.endpoints = Some(endpoints);
		self
	}

	/// Transport asked to refetch identities after successful operations.
	pub fn transport(mut self, transport: Rc<dyn TransportControl>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Creates the client with empty caches and no rules.
	pub fn build(self) -> OverlayClient {
		let registry = OverlayRegistry::new(self.config.placeholder_id_start);
		let tracker = OperationTracker::new(self.config.terminal_history);
		OverlayClient {
			inner: Rc::new(ClientInner {
				config: self.config,
				endpoints: self.endpoints,
				transport: self.transport,
				tracker,
				store: CachedItemStore::new(),
				registry,
				engine: OverlayEngine::new(),
			}),
		}
	}
}

/// Registration of a rule. Dropping the handle keeps the rule registered.
#[derive(Debug, Clone)]
pub struct RuleHandle {
	id: RuleId,
	client: Weak<ClientInner>,
}

impl RuleHandle {
	/// Id of the registered rule.
	pub fn id(&self) -> RuleId {
		self.id
	}

	/// Unregisters the rule, retiring all of its instances immediately.
	///
	/// Returns false if the rule or the client is already gone.
	pub fn unregister(self) -> bool {
		match self.client.upgrade() {
			Some(inner) => inner.unregister(self.id),
			None => false,
		}
	}
}

impl Default for OverlayClient {
	fn default() -> Self {
		Self::builder().build()
	}
}

impl OverlayClient {
	/// Creates a client with `config`, no endpoint table and no transport.
	pub fn new(config: OverlayConfig) -> Self {
		Self::builder().config(config).build()
	}

	/// Starts an [`OverlayClientBuilder`].
	pub fn builder() -> OverlayClientBuilder {
		OverlayClientBuilder::default()
	}

	/// Returns a handle that does not keep the client alive.
	pub fn downgrade(&self) -> WeakOverlayClient {
		WeakOverlayClient {
			inner: Rc::downgrade(&self.inner),
		}
	}

	/// Active configuration.
	pub fn config(&self) -> &OverlayConfig {
		&self.inner.config
	}

	/// Endpoint table rules are validated against, if one was given.
	pub fn endpoints(&self) -> Option<&EndpointTable> {
		self.inner.endpoints.as_ref()
	}

	/// Registers a rule.
	///
	/// The rule applies to operations first observed after registration. Fails
	/// if the rule names an undeclared endpoint or reuses a rule name.
	pub fn register_rule(&self, rule: OverlayRule) -> Result<RuleHandle> {
		if let Some(endpoints) = &self.inner.endpoints {
			let wrap = |source: KeyError| OverlayError::Endpoint {
				rule: rule.label().to_string(),
				source,
			};
			endpoints.check(rule.kind().as_str(), EndpointKind::Mutation).map_err(wrap)?;
			if let Some(scope) = rule.scope() {
				endpoints.check_filter(scope).map_err(wrap)?;
			}
		}
		if let Some(name) = rule.name()
			&& self.inner.registry.has_rule_named(name)
		{
			return Err(OverlayError::DuplicateRule(name.to_string()));
		}
		let id = self.inner.registry.add_layer(rule);
		Ok(RuleHandle {
			id,
			client: Rc::downgrade(&self.inner),
		})
	}

	/// Unregisters a rule by id. See [`RuleHandle::unregister`].
	pub fn unregister_rule(&self, id: RuleId) -> bool {
		self.inner.unregister(id)
	}

	/// Transport push of a freshly fetched value.
	///
	/// Subscribers see the result of folding active overlays over `value`, never
	/// `value` on its own unless nothing overlays it.
	pub fn on_authoritative_value(&self, identity: &IdentityKey, value: Value) {
		let inner = &*self.inner;
		inner.pass(|| {
			let mut dirty = IndexSet::new();
			if inner.store.set(identity, value) {
				inner.adopt(identity, &mut dirty);
			}
			inner.engine.evaluate(identity, &inner.store, &inner.registry);
		});
	}

	/// Transport report of an operation's current state.
	///
	/// Overlays react first; operation subscribers are notified afterwards and
	/// see apparent values that already reflect the transition.
	///
	/// All steps caused by one report, including a synthesized pending step, are
	/// folded together, so subscribers see only the value after the last step.
	pub fn on_operation_event(&self, report: OperationState) {
		let inner = &*self.inner;
		let transitions = inner.tracker.record(report);
		if transitions.is_empty() {
			return;
		}
		inner.pass(|| inner.apply_transitions(&transitions));
		for transition in &transitions {
			inner.tracker.dispatch(&transition.state);
		}
	}

	/// Re-folds `identity` and returns its apparent value.
	pub fn evaluate(&self, identity: &IdentityKey) -> Option<Value> {
		let inner = &*self.inner;
		inner.pass(|| inner.engine.evaluate(identity, &inner.store, &inner.registry))
	}

	/// Value subscribers currently see for `identity`.
	pub fn apparent_value(&self, identity: &IdentityKey) -> Option<Value> {
		self.inner.store.get(identity)
	}

	/// Last value the transport pushed for `identity`.
	pub fn authoritative_value(&self, identity: &IdentityKey) -> Option<Value> {
		self.inner.store.authoritative(identity)
	}

	/// Sets the apparent value directly, leaving the authoritative value alone.
	///
	/// The next evaluation of `identity` replaces it.
	pub fn publish(&self, identity: &IdentityKey, value: Value) {
		self.inner.store.publish(identity, value);
	}

	/// Calls `on_change` whenever the apparent value of `identity` changes.
	///
	/// Subscribing to an uncached identity creates its entry, which picks up
	/// overlays of pending operations that target it.
	pub fn subscribe(&self, identity: &IdentityKey, on_change: impl Fn(&Value) + 'static) -> Subscription {
		let inner = &*self.inner;
		let (subscription, created) = inner.store.subscribe(identity, on_change);
		if created {
			inner.pass(|| {
				let mut dirty = IndexSet::new();
				inner.adopt(identity, &mut dirty);
				if !dirty.is_empty() {
					inner.engine.evaluate(identity, &inner.store, &inner.registry);
				}
			});
		}
		subscription
	}

	/// Calls `on_event` for every lifecycle step of operations passing `filter`.
	pub fn subscribe_operations(&self, filter: OperationFilter, on_event: impl Fn(&OperationState) + 'static) -> Subscription {
		self.inner.tracker.subscribe(filter, on_event)
	}

	/// Latest state of a live or recently resolved operation.
	pub fn operation(&self, id: OperationId) -> Option<OperationState> {
		self.inner.tracker.state(id)
	}

	/// Unresolved operations in the order they were first observed.
	pub fn live_operations(&self) -> Vec<OperationState> {
		self.inner.tracker.live()
	}

	/// True while active overlays change the apparent value of `identity`.
	pub fn is_speculative(&self, identity: &IdentityKey) -> bool {
		self.inner.engine.is_speculative(identity)
	}

	/// Instances attached to `identity`, in fold order, including stopped ones
	/// awaiting cleanup.
	pub fn instances(&self, identity: &IdentityKey) -> Vec<InstanceInfo> {
		let inner = &*self.inner;
		inner
			.store
			.instances(identity)
			.into_iter()
			.filter_map(|key| inner.registry.instance_info(identity, key))
			.collect()
	}

	/// Drops entries that have no subscribers and no overlays.
	pub fn collect_idle(&self) -> Vec<IdentityKey> {
		let inner = &*self.inner;
		let disposed = inner.store.dispose_idle();
		for identity in &disposed {
			inner.engine.forget(identity);
		}
		if !disposed.is_empty() {
			debug!(count = disposed.len(), "idle entries collected");
		}
		disposed
	}

	/// Diagnostic view of entries, live operations, and rules.
	pub fn snapshot(&self) -> ClientSnapshot {
		let inner = &*self.inner;
		let entries = inner
			.store
			.stats()
			.into_iter()
			.map(|(identity, stats)| {
				let stopped = self.instances(&identity).iter().filter(|info| info.stopped).count();
				EntrySnapshot {
					speculative: inner.engine.is_speculative(&identity),
					identity,
					has_authoritative: stats.has_authoritative,
					has_apparent: stats.has_apparent,
					subscribers: stats.subscribers,
					active_instances: stats.instances.saturating_sub(stopped),
					stopped_instances: stopped,
				}
			})
			.collect();
		let rules = inner
			.registry
			.rules()
			.into_iter()
			.map(|(id, rule)| {
				let (live_operations, instances) = inner.registry.layer_load(id).unwrap_or_default();
				RuleSnapshot {
					id,
					label: rule.label().to_string(),
					kind: rule.kind().clone(),
					live_operations,
					instances,
				}
			})
			.collect();
		ClientSnapshot {
			entries,
			operations: inner.tracker.live(),
			rules,
		}
	}
}

impl fmt::Debug for OverlayClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("OverlayClient")
			.field("config", &self.inner.config)
			.field("entries", &self.inner.store.len())
			.field("rules", &self.inner.registry.rules().len())
			.finish_non_exhaustive()
	}
}

impl ClientInner {
	/// Runs `pass` and applies queued retirements once the outermost pass ends.
	fn pass<R>(&self, pass: impl FnOnce() -> R) -> R {
		self.registry.turnstile().run(pass, |retirement| self.retire(retirement))
	}

	fn retire(&self, retirement: Retirement) {
		let Retirement { identity, key } = retirement;
		self.registry.remove_instance(&identity, key);
		self.store.detach(&identity, key);
		if self.config.dispose_idle_entries && self.store.dispose_if_idle(&identity) {
			self.engine.forget(&identity);
		}
	}

	/// Creates instances for pending operations whose layers cover `identity`.
	fn adopt(&self, identity: &IdentityKey, dirty: &mut IndexSet<IdentityKey>) {
		for (rule, seq, operation) in self.registry.adoptable(identity) {
			if let Upsert::Created(key) = self.registry.upsert(rule, seq, &operation, identity) {
				self.store.attach(identity, key);
				dirty.insert(identity.clone());
			}
		}
	}

	/// Applies the steps of one report and evaluates every touched identity once.
	fn apply_transitions(&self, transitions: &[Transition]) {
		let Some(last) = transitions.last() else {
			return;
		};
		let resolved = last.state.is_terminal();
		let mut dirty = IndexSet::new();
		let mut targets = IndexSet::new();

		for transition in transitions {
			self.apply_transition(transition, resolved, &mut dirty, &mut targets);
		}

		for identity in &dirty {
			self.engine.evaluate(identity, &self.store, &self.registry);
		}

		let operation = &last.state;
		if operation.is_success()
			&& self.config.refetch_on_success
			&& let Some(transport) = &self.transport
		{
			for identity in &targets {
				debug!(op = %operation.id, identity = %identity, "refetch requested");
				transport.invalidate_and_refetch(identity);
			}
		}

		if resolved {
			self.registry.settle(operation.id);
		}
	}

	/// Creates or updates the instances one step touches. An uncached exact
	/// target is only created when the report leaves the operation pending.
	fn apply_transition(
		&self,
		transition: &Transition,
		resolved: bool,
		dirty: &mut IndexSet<IdentityKey>,
		targets: &mut IndexSet<IdentityKey>,
	) {
		let operation = &transition.state;
		for found in self.registry.observe(transition.seq, operation) {
			let identities = match found.target.as_exact() {
				Some(identity) if self.store.contains(identity) => vec![identity.clone()],
				Some(identity) if operation.is_pending() && !resolved => {
					self.store.ensure(identity);
					self.adopt(identity, dirty);
					vec![identity.clone()]
				}
				Some(_) => Vec::new(),
				None => self.store.identities_matching(&found.target),
			};
			for identity in identities {
				match self.registry.upsert(found.rule, transition.seq, operation, &identity) {
					Upsert::Created(key) => {
						self.store.attach(&identity, key);
						dirty.insert(identity.clone());
					}
					Upsert::Updated(_) => {
						dirty.insert(identity.clone());
					}
					Upsert::Skipped => {}
				}
				targets.insert(identity);
			}
		}
	}

	fn unregister(&self, id: RuleId) -> bool {
		self.pass(|| {
			let Some(retirements) = self.registry.remove_layer(id) else {
				return false;
			};
			let mut dirty = IndexSet::new();
			for retirement in retirements {
				dirty.insert(retirement.identity.clone());
				if let Err(retirement) = self.registry.turnstile().defer(retirement) {
					self.retire(retirement);
				}
			}
			for identity in &dirty {
				self.engine.evaluate(identity, &self.store, &self.registry);
			}
			true
		})
	}
}

/// Diagnostic view returned by [`OverlayClient::snapshot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
	/// Cached identities in creation order.
	pub entries: Vec<EntrySnapshot>,
	/// Unresolved operations in observation order.
	pub operations: Vec<OperationState>,
	/// Registered rules in registration order.
	pub rules: Vec<RuleSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
	pub identity: IdentityKey,
	pub has_authoritative: bool,
	pub has_apparent: bool,
	/// Active overlays currently change the apparent value.
	pub speculative: bool,
	pub subscribers: usize,
	pub active_instances: usize,
	/// Stopped instances not yet removed by a cleanup checkpoint.
	pub stopped_instances: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSnapshot {
	pub id: RuleId,
	pub label: String,
	pub kind: OperationKind,
	/// Pending operations the rule matched.
	pub live_operations: usize,
	pub instances: usize,
}

impl fmt::Display for ClientSnapshot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "entries:")?;
		for entry in &self.entries {
			writeln!(
				f,
				"  {} active={} stopped={} subscribers={}{}",
				entry.identity,
				entry.active_instances,
				entry.stopped_instances,
				entry.subscribers,
				if entry.speculative { " (speculative)" } else { "" },
			)?;
		}
		writeln!(f, "operations:")?;
		for operation in &self.operations {
			writeln!(f, "  {} {} {}", operation.id, operation.kind, operation.status)?;
		}
		writeln!(f, "rules:")?;
		for rule in &self.rules {
			writeln!(
				f,
				"  {} {} live={} instances={}",
				rule.id, rule.label, rule.live_operations, rule.instances
			)?;
		}
		Ok(())
	}
}
