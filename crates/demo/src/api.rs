//! Endpoint table and overlay rules of the threads/posts app.

use mirage_overlay::{OverlayClient, OverlayRule, policy};
use mirage_primitives::{EndpointTable, IdentityFilter, IdentityKey, Reconciliation, Value};
use serde_json::json;

pub const THREADS_ALL: &str = "threads.all";
pub const POSTS_IN_THREAD: &str = "posts.allInThread";
pub const CREATE_THREAD: &str = "threads.create";
pub const DELETE_THREAD: &str = "threads.delete";
pub const CREATE_POST: &str = "posts.create";
pub const DELETE_POST: &str = "posts.delete";

pub fn endpoints() -> anyhow::Result<EndpointTable> {
	Ok(EndpointTable::builder()
		.query(THREADS_ALL)
		.query(POSTS_IN_THREAD)
		.mutation(CREATE_THREAD)
		.mutation(DELETE_THREAD)
		.mutation(CREATE_POST)
		.mutation(DELETE_POST)
		.build()?)
}

pub fn threads_key() -> anyhow::Result<IdentityKey> {
	Ok(IdentityKey::named(THREADS_ALL)?)
}

pub fn posts_key(thread_id: i64) -> anyhow::Result<IdentityKey> {
	Ok(IdentityKey::new(POSTS_IN_THREAD, Some(&json!({ "threadId": thread_id })))?)
}

fn posts_target(input: &Value) -> Option<IdentityFilter> {
	let thread_id = input.get("threadId")?.as_i64()?;
	posts_key(thread_id).ok().map(IdentityFilter::from)
}

/// A row is the created one once its server id equals the confirmed output id.
fn same_id(_: &Value, row: &Value, output: Option<&Value>) -> Reconciliation {
	match output.and_then(|output| output.get("id")) {
		Some(id) => Reconciliation::from(row.get("id") == Some(id)),
		None => Reconciliation::Undecided,
	}
}

fn removes_row(input: &Value, row: &Value) -> bool {
	row.get("id").is_some() && row.get("id") == input.get("id")
}

/// Registers the optimistic insert and remove rules for both collections.
pub fn install_rules(client: &OverlayClient) -> anyhow::Result<()> {
	let rules: [OverlayRule; 4] = [
		policy::array_insert(CREATE_THREAD)
			.name("thread placeholder")
			.target(threads_key()?)
			.placeholder(policy::placeholder_with_id("id"))
			.matcher(same_id)
			.build()?,
		policy::array_remove(DELETE_THREAD)
			.name("hide deleted thread")
			.target(threads_key()?)
			.matcher(removes_row)
			.build()?,
		policy::array_insert(CREATE_POST)
			.name("post placeholder")
			.target(IdentityFilter::name(POSTS_IN_THREAD))
			.target_with(posts_target)
			.placeholder(policy::placeholder_with_id("id"))
			.matcher(same_id)
			.build()?,
		policy::array_remove(DELETE_POST)
			.name("hide deleted post")
			.target(IdentityFilter::name(POSTS_IN_THREAD))
			.target_with(posts_target)
			.matcher(removes_row)
			.build()?,
	];
	for rule in rules {
		client.register_rule(rule)?;
	}
	Ok(())
}
