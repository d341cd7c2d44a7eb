use std::cell::RefCell;
use std::rc::Rc;

use mirage_primitives::{OperationError, OperationId, OperationState, Transform, Value};
use serde_json::json;

use super::*;
use crate::rule::{OverlayHandler, RuleId};

fn step(seq: u64, operation: OperationState, handler: impl OverlayHandler + 'static) -> FoldStep {
	FoldStep {
		key: InstanceKey {
			seq,
			rule: RuleId(0),
			op: operation.id,
		},
		operation: Rc::new(operation),
		handler: Rc::new(RefCell::new(Box::new(handler))),
	}
}

fn pending(id: u64) -> OperationState {
	OperationState::pending(OperationId(id), "counter.add", json!(1))
}

fn push(n: i64) -> impl FnMut(&Value, &OperationState) -> Transform<Value> {
	move |value, _| {
		let mut items = value.as_array().cloned().unwrap_or_default();
		items.push(json!(n));
		Transform::Continue(Value::Array(items))
	}
}

#[test]
fn fold_applies_steps_in_order() {
	let outcome = fold(json!([]), vec![step(0, pending(1), push(1)), step(1, pending(2), push(2))]);
	assert_eq!(outcome.value, json!([1, 2]));
	assert!(outcome.altered);
	assert!(outcome.stopped.is_empty());
}

#[test]
fn stop_keeps_the_value_and_continues() {
	let steps = vec![
		step(0, pending(1), push(1)),
		step(1, pending(2), |_: &Value, _: &OperationState| -> Transform<Value> { Transform::Stop }),
		step(2, pending(3), push(3)),
	];
	let outcome = fold(json!([]), steps);
	assert_eq!(outcome.value, json!([1, 3]));
	assert_eq!(outcome.stopped.len(), 1);
	assert_eq!(outcome.stopped[0].op, OperationId(2));
}

#[test]
fn failed_operations_stop_without_calling_the_handler() {
	let called = Rc::new(RefCell::new(false));
	let handler = {
		let called = Rc::clone(&called);
		move |value: &Value, _: &OperationState| {
			*called.borrow_mut() = true;
			Transform::Continue(value.clone())
		}
	};
	let outcome = fold(json!([]), vec![step(0, pending(1).failed(OperationError::new("nope")), handler)]);
	assert!(!*called.borrow());
	assert_eq!(outcome.value, json!([]));
	assert_eq!(outcome.stopped.len(), 1);
	assert!(!outcome.altered);
}

#[test]
fn unchanged_continue_does_not_count_as_altered() {
	let outcome = fold(json!([1]), vec![step(0, pending(1), |value: &Value, _: &OperationState| {
		Transform::Continue(value.clone())
	})]);
	assert!(!outcome.altered);
	assert_eq!(outcome.value, json!([1]));
}

#[test]
fn busy_handlers_are_skipped() {
	let busy = step(0, pending(1), push(1));
	let _guard = busy.handler.borrow_mut();
	let handler = Rc::clone(&busy.handler);
	let outcome = fold(
		json!([]),
		vec![
			FoldStep {
				key: busy.key,
				operation: Rc::clone(&busy.operation),
				handler,
			},
			step(1, pending(2), push(2)),
		],
	);
	assert_eq!(outcome.value, json!([2]));
}
