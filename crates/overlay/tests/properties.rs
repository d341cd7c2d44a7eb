//! Property tests for fold idempotence, convergence and the absence of feedback
//! from speculative values into authoritative ones.

use mirage_overlay::{OverlayClient, OverlayRule, policy};
use mirage_primitives::{IdentityKey, OperationError, OperationId, OperationState, Reconciliation, Value};
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum Step {
	Create { op: u64, title: u8 },
	Delete { op: u64, id: i64 },
	Succeed { op: u64 },
	Fail { op: u64 },
	Push { ids: Vec<i64> },
	Evaluate,
}

fn step() -> impl Strategy<Value = Step> {
	prop_oneof![
		(0u64..6, 0u8..3).prop_map(|(op, title)| Step::Create { op, title }),
		(6u64..10, 1i64..5).prop_map(|(op, id)| Step::Delete { op, id }),
		(0u64..10).prop_map(|op| Step::Succeed { op }),
		(0u64..10).prop_map(|op| Step::Fail { op }),
		prop::collection::vec(1i64..5, 0..4).prop_map(|ids| Step::Push { ids }),
		Just(Step::Evaluate),
	]
}

fn list() -> IdentityKey {
	IdentityKey::named("threads.all").unwrap()
}

fn client() -> OverlayClient {
	let client = OverlayClient::default();
	let insert: OverlayRule = policy::array_insert("threads.create")
		.target(list())
		.placeholder(policy::placeholder_with_id("id"))
		.matcher(|_, row, output| match output {
			Some(output) => Reconciliation::from(row["id"] == output["id"]),
			None => Reconciliation::No,
		})
		.build()
		.unwrap();
	let remove = policy::array_remove("threads.delete")
		.target(list())
		.matcher(|input, row| row["id"] == input["id"])
		.build()
		.unwrap();
	client.register_rule(insert).unwrap();
	client.register_rule(remove).unwrap();
	client
}

fn rows(ids: &[i64]) -> Value {
	Value::Array(ids.iter().map(|id| json!({ "id": id, "title": "t" })).collect())
}

/// Applies one step and returns the authoritative value the transport pushed, if any.
fn apply(client: &OverlayClient, ops: &mut Vec<OperationState>, step: &Step) -> Option<Value> {
	match step {
		Step::Create { op, title } => {
			let state = OperationState::pending(OperationId(*op), "threads.create", json!({ "title": title.to_string() }));
			ops.push(state.clone());
			client.on_operation_event(state);
		}
		Step::Delete { op, id } => {
			let state = OperationState::pending(OperationId(*op), "threads.delete", json!({ "id": id }));
			ops.push(state.clone());
			client.on_operation_event(state);
		}
		Step::Succeed { op } => {
			if let Some(state) = ops.iter().find(|state| state.id == OperationId(*op)) {
				let output = json!({ "id": 100 + op });
				client.on_operation_event(state.clone().succeeded(output));
			}
		}
		Step::Fail { op } => {
			if let Some(state) = ops.iter().find(|state| state.id == OperationId(*op)) {
				client.on_operation_event(state.clone().failed(OperationError::new("rejected")));
			}
		}
		Step::Push { ids } => {
			let value = rows(ids);
			client.on_authoritative_value(&list(), value.clone());
			return Some(value);
		}
		Step::Evaluate => {
			client.evaluate(&list());
		}
	}
	None
}

proptest! {
	#[test]
	fn evaluate_is_idempotent(steps in prop::collection::vec(step(), 0..24)) {
		let client = client();
		client.on_authoritative_value(&list(), json!([]));
		let mut ops = Vec::new();
		for step in &steps {
			apply(&client, &mut ops, step);
		}
		let first = client.evaluate(&list());
		let second = client.evaluate(&list());
		prop_assert_eq!(first, second);
	}

	#[test]
	fn authoritative_value_only_changes_through_pushes(steps in prop::collection::vec(step(), 0..24)) {
		let client = client();
		client.on_authoritative_value(&list(), json!([]));
		let mut expected = json!([]);
		let mut ops = Vec::new();
		for step in &steps {
			if let Some(pushed) = apply(&client, &mut ops, step) {
				expected = pushed;
			}
			prop_assert_eq!(client.authoritative_value(&list()), Some(expected.clone()));
		}
	}

	#[test]
	fn reconciled_operations_leave_no_overlay(steps in prop::collection::vec(step(), 0..24)) {
		let client = client();
		client.on_authoritative_value(&list(), rows(&[1, 2, 3, 4]));
		let mut ops = Vec::new();
		for step in &steps {
			apply(&client, &mut ops, step);
		}
		// Fail whatever is still pending, then push a server view that reflects
		// every confirmed write.
		for state in &ops {
			client.on_operation_event(state.clone().failed(OperationError::new("rejected")));
		}
		let mut ids = vec![1, 2, 3, 4];
		let mut seen = Vec::new();
		for state in &ops {
			if seen.contains(&state.id) {
				continue;
			}
			seen.push(state.id);
			let confirmed = client.operation(state.id).is_some_and(|op| op.is_success());
			if !confirmed {
				continue;
			}
			match state.kind.as_str() {
				"threads.create" => ids.push(100 + state.id.as_u64() as i64),
				_ => ids.retain(|id| Some(*id) != state.input["id"].as_i64()),
			}
		}
		let server = rows(&ids);
		client.on_authoritative_value(&list(), server.clone());

		prop_assert!(client.instances(&list()).is_empty());
		prop_assert_eq!(client.apparent_value(&list()), Some(server));
		prop_assert!(client.live_operations().is_empty());
	}
}
