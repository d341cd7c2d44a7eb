//! Cached values per identity.
//!
//! Each entry keeps the last authoritative value from the transport and the
//! apparent value last published by the engine, next to the ordered list of
//! overlay instances that touch it. Only the transport path writes the
//! authoritative value; only the engine and explicit publishes write the
//! apparent one.


use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use mirage_primitives::{IdentityFilter, IdentityKey, Value};
use tracing::trace;

use crate::registry::InstanceKey;
use crate::subscription::Subscription;

type Listener = Rc<dyn Fn(&Value)>;

#[derive(Default)]
struct CachedEntry {
	authoritative: Option<Value>,
	apparent: Option<Value>,
	/// Bumped on every apparent change.
	version: u64,
	/// Sorted by fold order.
	instances: Vec<InstanceKey>,
	listeners: IndexMap<u64, Listener>,
}

impl CachedEntry {
	fn is_idle(&self) -> bool {
		self.listeners.is_empty() && self.instances.is_empty()
	}
}

#[derive(Default)]
struct StoreState {
	entries: IndexMap<IdentityKey, CachedEntry>,
	next_listener: u64,
}

/// Counters describing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryStats {
	pub has_authoritative: bool,
	pub has_apparent: bool,
	pub subscribers: usize,
	pub instances: usize,
}

pub(crate) struct CachedItemStore {
	state: Rc<RefCell<StoreState>>,
}

impl CachedItemStore {
	pub fn new() -> Self {
		Self {
			state: Rc::new(RefCell::new(StoreState::default())),
		}
	}

	/// Creates an empty entry. Returns true if it did not exist.
	pub fn ensure(&self, identity: &IdentityKey) -> bool {
		let mut state = self.state.borrow_mut();
		if state.entries.contains_key(identity) {
			return false;
		}
		trace!(identity = %identity, "entry created");
		state.entries.insert(identity.clone(), CachedEntry::default());
		true
	}

	pub fn contains(&self, identity: &IdentityKey) -> bool {
		self.state.borrow().entries.contains_key(identity)
	}

	/// Apparent value.
	pub fn get(&self, identity: &IdentityKey) -> Option<Value> {
		self.state.borrow().entries.get(identity)?.apparent.clone()
	}

	pub fn authoritative(&self, identity: &IdentityKey) -> Option<Value> {
		self.state.borrow().entries.get(identity)?.authoritative.clone()
	}

	/// Records an authoritative value without notifying anyone.
	///
	/// Returns true if the entry was created by this call.
	pub fn set(&self, identity: &IdentityKey, value: Value) -> bool {
		let created = self.ensure(identity);
		if let Some(entry) = self.state.borrow_mut().entries.get_mut(identity) {
			entry.authoritative = Some(value);
		}
		created
	}

	/// Replaces the apparent value and notifies subscribers.
	///
	/// Publishing an equal value is a no-op. If a subscriber publishes again from
	/// inside its callback, the remaining subscribers of the outer call are
	/// skipped; they already saw the newer value.
	pub fn publish(&self, identity: &IdentityKey, value: Value) -> bool {
		let (version, listeners) = {
			let mut state = self.state.borrow_mut();
			let entry = state.entries.entry(identity.clone()).or_default();
			if entry.apparent.as_ref() == Some(&value) {
				return false;
			}
			entry.apparent = Some(value.clone());
			entry.version += 1;
			let listeners: Vec<(u64, Listener)> =
				entry.listeners.iter().map(|(id, listener)| (*id, Rc::clone(listener))).collect();
			(entry.version, listeners)
		};
		trace!(identity = %identity, version, subscribers = listeners.len(), "apparent value published");
		for (id, listener) in listeners {
			let current = {
				let state = self.state.borrow();
				let Some(entry) = state.entries.get(identity) else {
					break;
				};
				if entry.version != version {
					break;
				}
				entry.listeners.contains_key(&id)
			};
			if current {
				listener(&value);
			}
		}
		true
	}

	/// Registers `on_change` for apparent changes of `identity`.
	///
	/// Returns the handle and whether the entry was created by this call.
	pub fn subscribe(&self, identity: &IdentityKey, on_change: impl Fn(&Value) + 'static) -> (Subscription, bool) {
		let created = self.ensure(identity);
		let id = {
			let mut state = self.state.borrow_mut();
			let id = state.next_listener;
			state.next_listener += 1;
			if let Some(entry) = state.entries.get_mut(identity) {
				entry.listeners.insert(id, Rc::new(on_change));
			}
			id
		};
		let weak: Weak<RefCell<StoreState>> = Rc::downgrade(&self.state);
		let identity = identity.clone();
		let subscription = Subscription::new(move || {
			if let Some(state) = weak.upgrade()
				&& let Some(entry) = state.borrow_mut().entries.get_mut(&identity)
			{
				entry.listeners.shift_remove(&id);
			}
		});
		(subscription, created)
	}

	/// Cached identities selected by `filter`, in creation order.
	pub fn identities_matching(&self, filter: &IdentityFilter) -> Vec<IdentityKey> {
		if let Some(exact) = filter.as_exact() {
			return if self.contains(exact) { vec![exact.clone()] } else { Vec::new() };
		}
		self.state
			.borrow()
			.entries
			.keys()
			.filter(|identity| filter.matches(identity))
			.cloned()
			.collect()
	}

	/// Adds an instance in fold order.
	pub fn attach(&self, identity: &IdentityKey, key: InstanceKey) {
		let mut state = self.state.borrow_mut();
		let entry = state.entries.entry(identity.clone()).or_default();
		if let Err(index) = entry.instances.binary_search(&key) {
			entry.instances.insert(index, key);
		}
	}

	/// Removes an instance. Only called at cleanup checkpoints.
	pub fn detach(&self, identity: &IdentityKey, key: InstanceKey) -> bool {
		let mut state = self.state.borrow_mut();
		let Some(entry) = state.entries.get_mut(identity) else {
			return false;
		};
		match entry.instances.binary_search(&key) {
			Ok(index) => {
				entry.instances.remove(index);
				true
			}
			Err(_) => false,
		}
	}

	/// Instances of `identity` in fold order.
	pub fn instances(&self, identity: &IdentityKey) -> Vec<InstanceKey> {
		self.state
			.borrow()
			.entries
			.get(identity)
			.map(|entry| entry.instances.clone())
			.unwrap_or_default()
	}

	/// Drops `identity` if nothing watches or overlays it.
	pub fn dispose_if_idle(&self, identity: &IdentityKey) -> bool {
		let mut state = self.state.borrow_mut();
		if state.entries.get(identity).is_some_and(CachedEntry::is_idle) {
			state.entries.shift_remove(identity);
			trace!(identity = %identity, "idle entry disposed");
			return true;
		}
		false
	}

	/// Drops every idle entry and returns their identities.
	pub fn dispose_idle(&self) -> Vec<IdentityKey> {
		let mut state = self.state.borrow_mut();
		let mut disposed = Vec::new();
		state.entries.retain(|identity, entry| {
			if entry.is_idle() {
				disposed.push(identity.clone());
				false
			} else {
				true
			}
		});
		disposed
	}

	pub fn stats(&self) -> Vec<(IdentityKey, EntryStats)> {
		self.state
			.borrow()
			.entries
			.iter()
			.map(|(identity, entry)| {
				(
					identity.clone(),
					EntryStats {
						has_authoritative: entry.authoritative.is_some(),
						has_apparent: entry.apparent.is_some(),
						subscribers: entry.listeners.len(),
						instances: entry.instances.len(),
					},
				)
			})
			.collect()
	}

	pub fn len(&self) -> usize {
		self.state.borrow().entries.len()
	}
}
