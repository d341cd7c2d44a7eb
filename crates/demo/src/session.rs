//! Scripted session: the dispatch loop plus a fixed sequence of user actions.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use mirage_overlay::{ClientSnapshot, OperationFilter, OverlayClient, Subscription, TransportControl};
use mirage_primitives::{IdentityKey, OperationError, OperationId, Value};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api;
use crate::config::DemoConfig;
use crate::server::Backend;
use crate::transport::{Arrival, SimTransport};

/// Apparent values in the order subscribers saw them.
pub type Frames = Rc<RefCell<Vec<(IdentityKey, Value)>>>;

pub struct Session {
	pub client: OverlayClient,
	pub transport: Rc<SimTransport>,
	pub backend: Backend,
	pub frames: Frames,
	inbound: mpsc::UnboundedReceiver<Arrival>,
	subscriptions: Vec<Subscription>,
}

impl Session {
	pub fn new(config: &DemoConfig) -> anyhow::Result<Self> {
		let (transport, inbound) = SimTransport::new(config.latency, config.seed);
		let transport = Rc::new(transport);
		let client = OverlayClient::builder()
			.config(config.overlay.clone())
			.endpoints(api::endpoints()?)
			.transport(Rc::clone(&transport) as Rc<dyn TransportControl>)
			.build();
		api::install_rules(&client)?;

		let operations = client.subscribe_operations(OperationFilter::All, |op| {
			match &op.error {
				Some(error) => warn!(op = %op.id, kind = %op.kind, %error, "operation failed"),
				None => info!(op = %op.id, kind = %op.kind, status = %op.status, "operation"),
			}
		});

		Ok(Self {
			client,
			transport,
			backend: Backend::new(config.fail_operations.clone()),
			frames: Rc::default(),
			inbound,
			subscriptions: vec![operations],
		})
	}

	/// Subscribes to `identity`, recording and logging every apparent change,
	/// and fetches it.
	pub fn watch(&mut self, identity: IdentityKey) {
		let frames = Rc::clone(&self.frames);
		let key = identity.clone();
		let subscription = self.client.subscribe(&identity, move |value| {
			info!(identity = %key, value = %value, "render");
			frames.borrow_mut().push((key.clone(), value.clone()));
		});
		self.subscriptions.push(subscription);
		self.transport.fetch(identity);
	}

	/// Issues a write through the transport.
	pub fn mutate(&self, kind: &str, input: Value) -> OperationId {
		self.transport.mutate(&self.client, kind, input)
	}

	/// Delivers arrivals until no request is in flight.
	pub async fn settle(&mut self) {
		while self.transport.in_flight() > 0 {
			let Some(arrival) = self.inbound.recv().await else {
				break;
			};
			self.transport.delivered();
			self.deliver(arrival);
		}
	}

	fn deliver(&mut self, arrival: Arrival) {
		match arrival {
			Arrival::Query(identity) => match self.backend.query(&identity) {
				Ok(value) => self.client.on_authoritative_value(&identity, value),
				Err(error) => warn!(identity = %identity, %error, "query failed"),
			},
			Arrival::Mutation(pending) => {
				let report = match self.backend.mutate(&pending.kind, &pending.input) {
					Ok(output) => pending.succeeded(output),
					Err(error) => pending.failed(OperationError::new(error.to_string())),
				};
				self.client.on_operation_event(report);
			}
		}
	}

	pub fn snapshot(&self) -> ClientSnapshot {
		self.client.snapshot()
	}
}

/// Runs the scripted session and returns the final diagnostics.
pub async fn run(config: DemoConfig) -> anyhow::Result<ClientSnapshot> {
	let mut session = Session::new(&config)?;
	let threads = api::threads_key()?;

	session.watch(threads.clone());
	session.settle().await;

	info!("creating a thread");
	session.mutate(api::CREATE_THREAD, json!({ "title": "Hello" }));
	session.settle().await;
	let thread_id = session
		.backend
		.threads()
		.last()
		.map(|thread| thread.id)
		.context("thread was not created")?;

	let posts = api::posts_key(thread_id)?;
	session.watch(posts.clone());
	session.settle().await;

	info!("posting twice at once");
	session.mutate(api::CREATE_POST, json!({ "threadId": thread_id, "body": "first" }));
	session.mutate(api::CREATE_POST, json!({ "threadId": thread_id, "body": "second" }));
	session.settle().await;

	info!("deleting a post");
	if let Some(post) = session.backend.posts_in(thread_id).first() {
		session.mutate(api::DELETE_POST, json!({ "threadId": thread_id, "id": post.id }));
	}
	session.settle().await;

	info!("deleting a post that does not exist");
	session.mutate(api::DELETE_POST, json!({ "threadId": thread_id, "id": 9999 }));
	session.settle().await;

	info!(frames = session.frames.borrow().len(), "session finished");
	Ok(session.snapshot())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::LatencyConfig;

	fn instant() -> DemoConfig {
		DemoConfig {
			latency: LatencyConfig { min_ms: 0, max_ms: 0 },
			seed: Some(1),
			..DemoConfig::default()
		}
	}

	#[tokio::test]
	async fn scripted_session_converges() {
		let snapshot = run(instant()).await.unwrap();
		assert!(snapshot.operations.is_empty());
		assert!(snapshot.entries.iter().all(|entry| entry.active_instances == 0 && !entry.speculative));
		assert_eq!(snapshot.rules.len(), 4);
	}

	#[tokio::test]
	async fn placeholder_shows_before_the_server_answers() {
		let mut session = Session::new(&instant()).unwrap();
		let threads = api::threads_key().unwrap();
		session.watch(threads.clone());
		session.settle().await;

		session.mutate(api::CREATE_THREAD, json!({ "title": "Hello" }));
		assert_eq!(
			session.client.apparent_value(&threads),
			Some(json!([{ "title": "Hello", "id": -1 }]))
		);

		session.settle().await;
		assert_eq!(session.client.apparent_value(&threads), Some(json!([{ "id": 1, "title": "Hello" }])));
		assert_eq!(session.client.apparent_value(&threads), session.client.authoritative_value(&threads));
	}

	#[tokio::test]
	async fn rejected_delete_restores_the_row() {
		let config = DemoConfig {
			fail_operations: vec![api::DELETE_THREAD.to_string()],
			..instant()
		};
		let mut session = Session::new(&config).unwrap();
		let threads = api::threads_key().unwrap();
		session.watch(threads.clone());
		session.mutate(api::CREATE_THREAD, json!({ "title": "keep" }));
		session.settle().await;

		session.mutate(api::DELETE_THREAD, json!({ "id": 1 }));
		assert_eq!(session.client.apparent_value(&threads), Some(json!([])));
		session.settle().await;

		assert_eq!(session.client.apparent_value(&threads), Some(json!([{ "id": 1, "title": "keep" }])));
		let frames: Vec<Value> = session
			.frames
			.borrow()
			.iter()
			.filter(|(identity, _)| *identity == threads)
			.map(|(_, value)| value.clone())
			.collect();
		assert_eq!(frames.last(), Some(&json!([{ "id": 1, "title": "keep" }])));
	}
}
