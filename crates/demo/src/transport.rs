//! Simulated network transport.
//!
//! Requests are carried by spawned tasks that sleep for a jittered latency and
//! then hand the request back to the dispatch loop over a channel. The loop
//! answers it from the [`Backend`](crate::server::Backend) and reports the
//! result to the overlay client, so all engine work stays on one thread.

use std::cell::{Cell, RefCell};
use std::time::Duration;

use mirage_overlay::{OverlayClient, TransportControl};
use mirage_primitives::{IdentityKey, OperationId, OperationKind, OperationState, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::LatencyConfig;

/// A request that has crossed the simulated network.
#[derive(Debug, Clone)]
pub enum Arrival {
	Query(IdentityKey),
	Mutation(OperationState),
}

pub struct SimTransport {
	outbound: mpsc::UnboundedSender<Arrival>,
	rng: RefCell<StdRng>,
	latency: (Duration, Duration),
	in_flight: Cell<usize>,
	next_op: Cell<u64>,
}

impl SimTransport {
	pub fn new(latency: LatencyConfig, seed: Option<u64>) -> (Self, mpsc::UnboundedReceiver<Arrival>) {
		let (outbound, inbound) = mpsc::unbounded_channel();
		let rng = match seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};
		let transport = Self {
			outbound,
			rng: RefCell::new(rng),
			latency: latency.bounds(),
			in_flight: Cell::new(0),
			next_op: Cell::new(1),
		};
		(transport, inbound)
	}

	/// Requests the current server value of `identity`.
	pub fn fetch(&self, identity: IdentityKey) {
		self.send(Arrival::Query(identity));
	}

	/// Issues a write and reports it to `client` as pending.
	pub fn mutate(&self, client: &OverlayClient, kind: impl Into<OperationKind>, input: Value) -> OperationId {
		let id = OperationId(self.next_op.get());
		self.next_op.set(id.0 + 1);
		let pending = OperationState::pending(id, kind, input);
		debug!(op = %id, kind = %pending.kind, "mutation issued");
		client.on_operation_event(pending.clone());
		self.send(Arrival::Mutation(pending));
		id
	}

	pub fn in_flight(&self) -> usize {
		self.in_flight.get()
	}

	/// Marks one arrival as delivered.
	pub fn delivered(&self) {
		self.in_flight.set(self.in_flight.get().saturating_sub(1));
	}

	fn send(&self, arrival: Arrival) {
		let delay = self.sample_delay();
		trace!(?delay, ?arrival, "request sent");
		self.in_flight.set(self.in_flight.get() + 1);
		let outbound = self.outbound.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			// The receiver is gone only when the session ended early.
			let _ = outbound.send(arrival);
		});
	}

	fn sample_delay(&self) -> Duration {
		let (min, max) = self.latency;
		if min == max {
			return min;
		}
		self.rng.borrow_mut().gen_range(min..=max)
	}
}

impl TransportControl for SimTransport {
	fn invalidate_and_refetch(&self, identity: &IdentityKey) {
		debug!(identity = %identity, "refetching");
		self.fetch(identity.clone());
	}
}
