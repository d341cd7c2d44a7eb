//! Speculative overlay engine.
//!
//! Shows the effect of in-flight writes on cached query results before the
//! server confirms them. Each cached identity keeps its last authoritative value;
//! the value shown to subscribers is that value with the transforms of every
//! active overlay folded over it, in the order their operations were first
//! observed. Overlays retire themselves once the authoritative value already
//! reflects their operation, and immediately when the operation fails.
//!
//! Everything here is single-threaded and reentrant: subscriber callbacks may
//! call back into the [`OverlayClient`] synchronously.
//!
//! ```
//! use mirage_overlay::{OverlayClient, policy};
//! use mirage_primitives::{IdentityKey, OperationId, OperationState, Reconciliation};
//! use serde_json::json;
//!
//! let client = OverlayClient::default();
//! let threads = IdentityKey::named("threads.all").unwrap();
//! let rule = policy::array_insert("threads.create")
//! 	.target(threads.clone())
//! 	.placeholder(policy::placeholder_with_id("id"))
//! 	.matcher(|_, row, output| match output {
//! 		Some(output) => Reconciliation::from(row["id"] == output["id"]),
//! 		None => Reconciliation::No,
//! 	})
//! 	.build()
//! 	.unwrap();
//! client.register_rule(rule).unwrap();
//!
//! client.on_authoritative_value(&threads, json!([]));
//! client.on_operation_event(OperationState::pending(OperationId(1), "threads.create", json!({ "title": "A" })));
//! assert_eq!(client.apparent_value(&threads), Some(json!([{ "title": "A", "id": -1 }])));
//! ```

/// Overlay client configuration.
pub mod config;
/// Configuration and registration errors.
pub mod error;
/// Ready-made list policies.
pub mod policy;
/// Rules and handlers.
pub mod rule;

mod client;
mod engine;
mod registry;
mod store;
mod subscription;
mod tracker;

pub use client::{
	ClientSnapshot, EntrySnapshot, OverlayClient, OverlayClientBuilder, RuleHandle, RuleSnapshot, TransportControl,
	WeakOverlayClient,
};
pub use config::OverlayConfig;
pub use error::{OverlayError, Result};
pub use registry::InstanceInfo;
pub use rule::{InstanceContext, OverlayHandler, OverlayRule, OverlayRuleBuilder, RuleId};
pub use subscription::Subscription;
pub use tracker::{OperationFilter, OperationTracker};
