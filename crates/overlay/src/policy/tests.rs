use mirage_primitives::{IdentityKey, OperationError, OperationId, OperationState, Reconciliation, Transform};
use serde_json::{Value, json};

use super::*;
use crate::rule::InstanceContext;

fn threads() -> IdentityKey {
	IdentityKey::named("threads.all").unwrap()
}

fn by_id(_: &Value, row: &Value, output: Option<&Value>) -> Reconciliation {
	match output {
		Some(output) if row["id"] == output["id"] => Reconciliation::Exact,
		_ if row["id"].as_i64().is_some_and(|id| id > 0) => Reconciliation::No,
		_ => Reconciliation::Undecided,
	}
}

fn insert_handler(rule: &OverlayRule, local_id: i64, op: &OperationState) -> Box<dyn OverlayHandler> {
	rule.create_handler(&InstanceContext {
		identity: &threads(),
		operation: op,
		local_id,
	})
}

fn create(id: u64, title: &str) -> OperationState {
	OperationState::pending(OperationId(id), "threads.create", json!({ "title": title }))
}

#[test]
fn insert_appends_placeholder_while_pending() {
	let rule = array_insert("threads.create")
		.target(threads())
		.placeholder(placeholder_with_id("id"))
		.matcher(by_id)
		.build()
		.unwrap();
	let op = create(1, "A");
	let mut handler = insert_handler(&rule, -1, &op);

	assert_eq!(
		handler.apply(&json!([{ "id": 3, "title": "B" }]), &op),
		Transform::Continue(json!([{ "id": 3, "title": "B" }, { "id": -1, "title": "A" }]))
	);
	assert_eq!(rule.empty_default(), Some(&json!([])));
}

#[test]
fn insert_stops_on_exact_match() {
	let rule = array_insert("threads.create")
		.target(threads())
		.placeholder(placeholder_with_id("id"))
		.matcher(by_id)
		.build()
		.unwrap();
	let op = create(1, "A").succeeded(json!({ "id": 5 }));
	let mut handler = insert_handler(&rule, -1, &op);

	assert_eq!(handler.apply(&json!([{ "id": 5, "title": "A" }]), &op), Transform::Stop);
	assert_eq!(
		handler.apply(&json!([]), &op),
		Transform::Continue(json!([{ "id": -1, "title": "A" }]))
	);
}

#[test]
fn insert_fuzzy_match_keeps_list_unchanged() {
	let rule = array_insert("threads.create")
		.target(threads())
		.placeholder(placeholder_with_id("id"))
		.matcher(|input, row, _| {
			if row["title"] == input["title"] {
				Reconciliation::Fuzzy
			} else {
				Reconciliation::No
			}
		})
		.build()
		.unwrap();
	let op = create(1, "A");
	let mut handler = insert_handler(&rule, -1, &op);
	let list = json!([{ "id": 9, "title": "A" }]);
	assert_eq!(handler.apply(&list, &op), Transform::Continue(list.clone()));
}

#[test]
fn insert_retires_on_non_list_values() {
	let rule = array_insert("threads.create")
		.target(threads())
		.placeholder(placeholder_with_id("id"))
		.matcher(by_id)
		.build()
		.unwrap();
	let op = create(1, "A");
	assert_eq!(insert_handler(&rule, -1, &op).apply(&json!({ "rows": [] }), &op), Transform::Stop);
}

#[test]
fn insert_requires_placeholder_and_matcher() {
	let err = array_insert("threads.create").target(threads()).matcher(by_id).build().unwrap_err();
	assert!(matches!(err, OverlayError::MissingCallback { callback: "placeholder", .. }));

	let err = array_insert("threads.create")
		.target(threads())
		.placeholder(placeholder_with_id("id"))
		.build()
		.unwrap_err();
	assert!(matches!(err, OverlayError::MissingCallback { callback: "matcher", .. }));

	let err = array_insert("threads.create")
		.placeholder(placeholder_with_id("id"))
		.matcher(by_id)
		.build()
		.unwrap_err();
	assert!(matches!(err, OverlayError::MissingTarget(_)));
}

#[test]
fn remove_filters_until_success_confirms_absence() {
	let rule = array_remove("threads.delete")
		.target(threads())
		.matcher(|input, row| row["id"] == input["id"])
		.build()
		.unwrap();
	let op = OperationState::pending(OperationId(4), "threads.delete", json!({ "id": 1 }));
	let mut handler = rule.create_handler(&InstanceContext {
		identity: &threads(),
		operation: &op,
		local_id: -1,
	});
	let both = json!([{ "id": 1 }, { "id": 2 }]);

	assert_eq!(handler.apply(&both, &op), Transform::Continue(json!([{ "id": 2 }])));
	assert_eq!(handler.apply(&json!([{ "id": 2 }]), &op), Transform::Continue(json!([{ "id": 2 }])));

	let done = op.clone().succeeded(Value::Null);
	assert_eq!(handler.apply(&both, &done), Transform::Continue(json!([{ "id": 2 }])));
	assert_eq!(handler.apply(&json!([{ "id": 2 }]), &done), Transform::Stop);

	let failed = op.failed(OperationError::new("gone"));
	assert_eq!(handler.apply(&both, &failed), Transform::Continue(json!([{ "id": 2 }])));
}

#[test]
fn placeholder_wraps_scalar_inputs() {
	let build = placeholder_with_id("id");
	assert_eq!(build(&json!("A"), -3), json!({ "value": "A", "id": -3 }));
	assert_eq!(build(&json!({ "id": 1, "x": 2 }), -1), json!({ "id": -1, "x": 2 }));
}

#[test]
fn optimistic_data_wraps_a_plain_transform() {
	let rule = optimistic_data("counter.add", IdentityKey::named("counter.get").unwrap(), |value, op| {
		Transform::Continue(json!(value.as_i64().unwrap_or(0) + op.input.as_i64().unwrap_or(0)))
	})
	.unwrap();
	let op = OperationState::pending(OperationId(1), "counter.add", json!(2));
	let mut handler = rule.create_handler(&InstanceContext {
		identity: &IdentityKey::named("counter.get").unwrap(),
		operation: &op,
		local_id: -1,
	});
	assert_eq!(handler.apply(&json!(40), &op), Transform::Continue(json!(42)));
	assert!(rule.empty_default().is_none());
}
