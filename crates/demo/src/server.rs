//! In-memory threads/posts backend answering simulated requests.

use anyhow::{Context, bail};
use mirage_primitives::{IdentityKey, OperationKind, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
	pub id: i64,
	pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
	pub id: i64,
	pub thread_id: i64,
	pub body: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadParams {
	thread_id: i64,
}

#[derive(Deserialize)]
struct CreateThread {
	title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePost {
	thread_id: i64,
	body: String,
}

#[derive(Deserialize)]
struct ById {
	id: i64,
}

/// Server-side state. Ids start at 1 and are never reused.
#[derive(Debug, Default)]
pub struct Backend {
	threads: Vec<Thread>,
	posts: Vec<Post>,
	last_id: i64,
	rejected: Vec<String>,
}

impl Backend {
	/// Creates a backend that fails every mutation named in `rejected`.
	pub fn new(rejected: Vec<String>) -> Self {
		Self {
			rejected,
			..Self::default()
		}
	}

	pub fn threads(&self) -> &[Thread] {
		&self.threads
	}

	pub fn posts_in(&self, thread_id: i64) -> Vec<Post> {
		self.posts.iter().filter(|post| post.thread_id == thread_id).cloned().collect()
	}

	/// Answers a read.
	pub fn query(&self, identity: &IdentityKey) -> anyhow::Result<Value> {
		match identity.name() {
			"threads.all" => Ok(serde_json::to_value(&self.threads)?),
			"posts.allInThread" => {
				let params = identity.params().context("posts.allInThread needs a threadId")?;
				let ThreadParams { thread_id } = serde_json::from_str(params)?;
				Ok(serde_json::to_value(self.posts_in(thread_id))?)
			}
			other => bail!("unknown query `{other}`"),
		}
	}

	/// Applies a write and returns its output.
	pub fn mutate(&mut self, kind: &OperationKind, input: &Value) -> anyhow::Result<Value> {
		if self.rejected.iter().any(|name| name == kind.as_str()) {
			bail!("{kind} is rejected by configuration");
		}
		match kind.as_str() {
			"threads.create" => {
				let CreateThread { title } = CreateThread::deserialize(input)?;
				let id = self.next_id();
				self.threads.push(Thread { id, title });
				Ok(json!({ "id": id }))
			}
			"threads.delete" => {
				let ById { id } = ById::deserialize(input)?;
				let Some(index) = self.threads.iter().position(|thread| thread.id == id) else {
					bail!("thread {id} does not exist");
				};
				self.threads.remove(index);
				self.posts.retain(|post| post.thread_id != id);
				Ok(Value::Null)
			}
			"posts.create" => {
				let CreatePost { thread_id, body } = CreatePost::deserialize(input)?;
				if !self.threads.iter().any(|thread| thread.id == thread_id) {
					bail!("thread {thread_id} does not exist");
				}
				let id = self.next_id();
				self.posts.push(Post { id, thread_id, body });
				Ok(json!({ "id": id }))
			}
			"posts.delete" => {
				let ById { id } = ById::deserialize(input)?;
				let Some(index) = self.posts.iter().position(|post| post.id == id) else {
					bail!("post {id} does not exist");
				};
				self.posts.remove(index);
				Ok(Value::Null)
			}
			other => bail!("unknown mutation `{other}`"),
		}
	}

	fn next_id(&mut self) -> i64 {
		self.last_id += 1;
		self.last_id
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn kind(name: &str) -> OperationKind {
		OperationKind::new(name)
	}

	#[test]
	fn create_returns_new_id_and_lists_it() {
		let mut backend = Backend::default();
		let out = backend.mutate(&kind("threads.create"), &json!({ "title": "Hello" })).unwrap();
		assert_eq!(out, json!({ "id": 1 }));
		let threads = backend.query(&IdentityKey::named("threads.all").unwrap()).unwrap();
		assert_eq!(threads, json!([{ "id": 1, "title": "Hello" }]));
	}

	#[test]
	fn posts_are_scoped_to_their_thread() {
		let mut backend = Backend::default();
		backend.mutate(&kind("threads.create"), &json!({ "title": "a" })).unwrap();
		backend.mutate(&kind("posts.create"), &json!({ "threadId": 1, "body": "x" })).unwrap();
		let key = IdentityKey::new("posts.allInThread", Some(&json!({ "threadId": 1 }))).unwrap();
		assert_eq!(backend.query(&key).unwrap(), json!([{ "id": 2, "threadId": 1, "body": "x" }]));

		let other = IdentityKey::new("posts.allInThread", Some(&json!({ "threadId": 9 }))).unwrap();
		assert_eq!(backend.query(&other).unwrap(), json!([]));
	}

	#[test]
	fn deleting_missing_rows_fails() {
		let mut backend = Backend::default();
		let err = backend.mutate(&kind("posts.delete"), &json!({ "id": 4 })).unwrap_err();
		assert!(err.to_string().contains("post 4 does not exist"));
		assert!(backend.mutate(&kind("posts.create"), &json!({ "threadId": 1, "body": "x" })).is_err());
	}

	#[test]
	fn configured_rejections_fail_before_touching_state() {
		let mut backend = Backend::new(vec!["threads.create".to_string()]);
		assert!(backend.mutate(&kind("threads.create"), &json!({ "title": "a" })).is_err());
		assert!(backend.threads().is_empty());
	}
}
