//! Operation lifecycle tracking.
//!
//! The transport reports raw snapshots of in-flight writes. The tracker turns
//! them into a clean lifecycle: every operation is announced as pending exactly
//! once, then resolves exactly once. Duplicate reports are dropped, and reports
//! arriving after resolution are ignored with a warning.


use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use indexmap::IndexMap;
use mirage_primitives::{OperationId, OperationKind, OperationState, OperationStatus};
use tracing::{trace, warn};

use crate::subscription::Subscription;

/// Selects the operations an observer is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationFilter {
	/// Every operation.
	All,
	/// Operations of exactly this kind.
	Kind(OperationKind),
	/// Operations whose kind starts with these dot-separated path segments.
	Prefix(Arc<str>),
}

impl OperationFilter {
	/// Filter for one mutation kind.
	pub fn kind(kind: impl Into<OperationKind>) -> Self {
		Self::Kind(kind.into())
	}

	/// Filter for every mutation under `prefix`.
	pub fn prefix(prefix: &str) -> Self {
		Self::Prefix(Arc::from(prefix))
	}

	/// Returns true if `kind` passes the filter.
	pub fn matches(&self, kind: &OperationKind) -> bool {
		match self {
			Self::All => true,
			Self::Kind(expected) => expected == kind,
			Self::Prefix(prefix) => {
				let mut segments = kind.as_str().split('.');
				prefix.is_empty() || prefix.split('.').all(|segment| segments.next() == Some(segment))
			}
		}
	}
}

/// One accepted lifecycle step.
#[derive(Debug, Clone)]
pub(crate) struct Transition {
	/// Order in which the operation was first observed.
	pub seq: u64,
	/// Full state after the step.
	pub state: Rc<OperationState>,
}

type Listener = Rc<dyn Fn(&OperationState)>;

struct LiveOperation {
	seq: u64,
	state: Rc<OperationState>,
}

struct TrackerState {
	live: IndexMap<OperationId, LiveOperation>,
	/// Recently resolved operations, oldest first.
	resolved: IndexMap<OperationId, Rc<OperationState>>,
	history: usize,
	listeners: IndexMap<u64, (OperationFilter, Listener)>,
	next_listener: u64,
	next_seq: u64,
}

/// Records in-flight operations and republishes their transitions.
pub struct OperationTracker {
	state: Rc<RefCell<TrackerState>>,
}

impl OperationTracker {
	/// Creates a tracker remembering up to `history` resolved operations.
	pub fn new(history: usize) -> Self {
		Self {
			state: Rc::new(RefCell::new(TrackerState {
				live: IndexMap::new(),
				resolved: IndexMap::new(),
				history,
				listeners: IndexMap::new(),
				next_listener: 0,
				next_seq: 0,
			})),
		}
	}

	/// Accepts a transport report and returns the transitions it causes.
	///
	/// A first report that is already terminal yields a synthesized pending step
	/// followed by the terminal one. Repeated or late reports yield nothing.
	pub(crate) fn record(&self, report: OperationState) -> Vec<Transition> {
		let mut state = self.state.borrow_mut();
		let id = report.id;

		if state.resolved.contains_key(&id) {
			warn!(op = %id, status = %report.status, "ignoring report for resolved operation");
			return Vec::new();
		}

		if let Some(live) = state.live.get(&id) {
			if live.state.status == report.status {
				trace!(op = %id, status = %report.status, "duplicate operation report");
				return Vec::new();
			}
			if live.state.kind != report.kind {
				warn!(op = %id, expected = %live.state.kind, actual = %report.kind, "operation changed kind");
				return Vec::new();
			}
			let seq = live.seq;
			let report = Rc::new(report);
			if report.is_terminal() {
				state.live.shift_remove(&id);
				state.remember(Rc::clone(&report));
			} else if let Some(live) = state.live.get_mut(&id) {
				live.state = Rc::clone(&report);
			}
			return vec![Transition { seq, state: report }];
		}

		let seq = state.next_seq;
		state.next_seq += 1;
		let mut transitions = Vec::with_capacity(2);
		if report.is_terminal() {
			trace!(op = %id, status = %report.status, "synthesizing pending step");
			let pending = Rc::new(OperationState::pending(id, report.kind.clone(), report.input.clone()));
			transitions.push(Transition { seq, state: pending });
			let report = Rc::new(report);
			state.remember(Rc::clone(&report));
			transitions.push(Transition { seq, state: report });
		} else {
			let report = Rc::new(report);
			state.live.insert(
				id,
				LiveOperation {
					seq,
					state: Rc::clone(&report),
				},
			);
			transitions.push(Transition { seq, state: report });
		}
		transitions
	}

	/// Notifies every matching listener of one transition.
	///
	/// Listeners may subscribe, unsubscribe, or report new operations from inside
	/// the callback.
	pub(crate) fn dispatch(&self, state: &OperationState) {
		let listeners: Vec<(u64, Listener)> = self
			.state
			.borrow()
			.listeners
			.iter()
			.filter(|(_, (filter, _))| filter.matches(&state.kind))
			.map(|(id, (_, listener))| (*id, Rc::clone(listener)))
			.collect();
		for (id, listener) in listeners {
			if !self.state.borrow().listeners.contains_key(&id) {
				continue;
			}
			listener(state);
		}
	}

	/// Calls `on_event` for every transition of operations selected by `filter`.
	pub fn subscribe(&self, filter: OperationFilter, on_event: impl Fn(&OperationState) + 'static) -> Subscription {
		let id = {
			let mut state = self.state.borrow_mut();
			let id = state.next_listener;
			state.next_listener += 1;
			state.listeners.insert(id, (filter, Rc::new(on_event)));
			id
		};
		let weak: Weak<RefCell<TrackerState>> = Rc::downgrade(&self.state);
		Subscription::new(move || {
			if let Some(state) = weak.upgrade() {
				state.borrow_mut().listeners.shift_remove(&id);
			}
		})
	}

	/// Returns the latest state of a live or recently resolved operation.
	pub fn state(&self, id: OperationId) -> Option<OperationState> {
		let state = self.state.borrow();
		state
			.live
			.get(&id)
			.map(|live| &live.state)
			.or_else(|| state.resolved.get(&id))
			.map(|state| OperationState::clone(state))
	}

	/// Returns the unresolved operations in the order they were first observed.
	pub fn live(&self) -> Vec<OperationState> {
		self.state
			.borrow()
			.live
			.values()
			.map(|live| OperationState::clone(&live.state))
			.collect()
	}

	/// Returns the status of an operation, if it is still known.
	pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
		let state = self.state.borrow();
		state
			.live
			.get(&id)
			.map(|live| live.state.status)
			.or_else(|| state.resolved.get(&id).map(|state| state.status))
	}

	/// Returns the number of active listeners.
	pub fn listener_count(&self) -> usize {
		self.state.borrow().listeners.len()
	}
}

impl TrackerState {
	fn remember(&mut self, state: Rc<OperationState>) {
		if self.history == 0 {
			return;
		}
		while self.resolved.len() >= self.history {
			self.resolved.shift_remove_index(0);
		}
		self.resolved.insert(state.id, state);
	}
}
