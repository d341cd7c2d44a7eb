//! End-to-end overlay scenarios driven through the public client surface.

use std::cell::RefCell;
use std::rc::Rc;

use mirage_overlay::{OverlayClient, OverlayConfig, OverlayRule, policy};
use mirage_primitives::{IdentityKey, OperationError, OperationId, OperationState, Reconciliation, Value};
use pretty_assertions::assert_eq;
use serde_json::json;

fn list() -> IdentityKey {
	IdentityKey::named("threads.all").unwrap()
}

fn insert_rule() -> OverlayRule {
	policy::array_insert("threads.create")
		.target(list())
		.placeholder(policy::placeholder_with_id("id"))
		.matcher(|_, row, output| match output {
			Some(output) => Reconciliation::from(row["id"] == output["id"]),
			None => Reconciliation::No,
		})
		.build()
		.unwrap()
}

fn remove_rule() -> OverlayRule {
	policy::array_remove("threads.delete")
		.target(list())
		.matcher(|input, row| row["id"] == input["id"])
		.build()
		.unwrap()
}

fn create(id: u64, title: &str) -> OperationState {
	OperationState::pending(OperationId(id), "threads.create", json!({ "title": title }))
}

fn record_changes(client: &OverlayClient) -> (mirage_overlay::Subscription, Rc<RefCell<Vec<Value>>>) {
	let seen = Rc::new(RefCell::new(Vec::new()));
	let sub = {
		let seen = Rc::clone(&seen);
		client.subscribe(&list(), move |value| seen.borrow_mut().push(value.clone()))
	};
	(sub, seen)
}

#[test]
fn insert_success_converges_to_server_row() {
	let _ = tracing_subscriber::fmt::try_init();
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));

	client.on_operation_event(create(1, "A"));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "title": "A", "id": -1 }])));

	client.on_operation_event(create(1, "A").succeeded(json!({ "id": 5 })));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "title": "A", "id": -1 }])));

	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 5 }]));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "title": "A", "id": 5 }])));
	assert_eq!(client.apparent_value(&list()), client.authoritative_value(&list()));
	assert!(client.instances(&list()).is_empty());
	assert!(!client.is_speculative(&list()));
}

#[test]
fn insert_failure_reverts_on_next_evaluation() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));
	let (_sub, seen) = record_changes(&client);

	client.on_operation_event(create(1, "A"));
	client.on_operation_event(create(1, "A").failed(OperationError::new("rejected")));

	assert_eq!(client.apparent_value(&list()), Some(json!([])));
	assert_eq!(*seen.borrow(), vec![json!([{ "title": "A", "id": -1 }]), json!([])]);
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn remove_success_hides_row_without_double_removal() {
	let client = OverlayClient::default();
	client.register_rule(remove_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([{ "id": 1 }, { "id": 2 }]));

	let delete = OperationState::pending(OperationId(1), "threads.delete", json!({ "id": 1 }));
	client.on_operation_event(delete.clone());
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "id": 2 }])));

	client.on_operation_event(delete.succeeded(Value::Null));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "id": 2 }])));
	assert_eq!(client.instances(&list()).len(), 1);

	client.on_authoritative_value(&list(), json!([{ "id": 2 }]));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "id": 2 }])));
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn concurrent_duplicate_inserts_keep_fifo_order() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));

	client.on_operation_event(create(10, "A"));
	client.on_operation_event(create(11, "A"));
	assert_eq!(
		client.apparent_value(&list()),
		Some(json!([{ "title": "A", "id": -1 }, { "title": "A", "id": -2 }]))
	);

	// The second write resolves first; order on screen does not change.
	client.on_operation_event(create(11, "A").succeeded(json!({ "id": 8 })));
	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 8 }]));
	assert_eq!(
		client.apparent_value(&list()),
		Some(json!([{ "title": "A", "id": 8 }, { "title": "A", "id": -1 }]))
	);

	client.on_operation_event(create(10, "A").succeeded(json!({ "id": 9 })));
	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 8 }, { "title": "A", "id": 9 }]));
	assert_eq!(client.apparent_value(&list()), client.authoritative_value(&list()));
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn insert_and_remove_compose_in_observation_order() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.register_rule(remove_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([{ "title": "old", "id": 1 }]));

	client.on_operation_event(OperationState::pending(OperationId(1), "threads.delete", json!({ "id": 1 })));
	client.on_operation_event(create(2, "new"));
	assert_eq!(client.apparent_value(&list()), Some(json!([{ "title": "new", "id": -2 }])));
}

#[test]
fn late_reports_after_resolution_are_ignored() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));

	client.on_operation_event(create(1, "A").failed(OperationError::new("rejected")));
	client.on_operation_event(create(1, "A"));
	assert_eq!(client.apparent_value(&list()), Some(json!([])));
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn authoritative_pushes_never_bypass_the_fold() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));
	client.on_operation_event(create(1, "A"));
	let (_sub, seen) = record_changes(&client);

	client.on_authoritative_value(&list(), json!([{ "title": "B", "id": 3 }]));
	assert_eq!(
		*seen.borrow(),
		vec![json!([{ "title": "B", "id": 3 }, { "title": "A", "id": -1 }])]
	);
}

#[test]
fn failure_reported_first_renders_nothing() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));
	let (_sub, seen) = record_changes(&client);

	client.on_operation_event(create(1, "A").failed(OperationError::new("boom")));

	assert!(seen.borrow().is_empty());
	assert_eq!(client.apparent_value(&list()), Some(json!([])));
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn success_reported_first_renders_once_and_converges() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));
	let (_sub, seen) = record_changes(&client);

	client.on_operation_event(create(1, "A").succeeded(json!({ "id": 5 })));
	assert_eq!(*seen.borrow(), vec![json!([{ "title": "A", "id": -1 }])]);

	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 5 }]));
	assert_eq!(
		*seen.borrow(),
		vec![json!([{ "title": "A", "id": -1 }]), json!([{ "title": "A", "id": 5 }])]
	);
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn success_reported_first_for_a_visible_row_renders_nothing() {
	let client = OverlayClient::default();
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 5 }]));
	let (_sub, seen) = record_changes(&client);

	client.on_operation_event(create(1, "A").succeeded(json!({ "id": 5 })));

	assert!(seen.borrow().is_empty());
	assert!(client.instances(&list()).is_empty());
}

#[test]
fn redelivery_after_history_eviction_renders_nothing() {
	let client = OverlayClient::new(OverlayConfig {
		terminal_history: 1,
		..OverlayConfig::default()
	});
	client.register_rule(insert_rule()).unwrap();
	client.on_authoritative_value(&list(), json!([]));

	client.on_operation_event(create(1, "A"));
	client.on_operation_event(create(1, "A").succeeded(json!({ "id": 5 })));
	client.on_authoritative_value(&list(), json!([{ "title": "A", "id": 5 }]));
	client.on_operation_event(create(2, "B"));
	client.on_operation_event(create(2, "B").succeeded(json!({ "id": 6 })));
	let server = json!([{ "title": "A", "id": 5 }, { "title": "B", "id": 6 }]);
	client.on_authoritative_value(&list(), server.clone());
	assert!(client.operation(OperationId(1)).is_none());

	let (_sub, seen) = record_changes(&client);
	client.on_operation_event(create(1, "A").succeeded(json!({ "id": 5 })));

	assert!(seen.borrow().is_empty());
	assert_eq!(client.apparent_value(&list()), Some(server));
	assert!(client.instances(&list()).is_empty());
}
