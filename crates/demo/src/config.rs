//! Demo configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use mirage_overlay::OverlayConfig;
use serde::Deserialize;

/// Top-level demo settings. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemoConfig {
	/// Simulated network latency per request.
	pub latency: LatencyConfig,
	/// Seed for latency jitter. Random when unset.
	pub seed: Option<u64>,
	/// Mutation names the simulated server always rejects.
	pub fail_operations: Vec<String>,
	/// Overlay engine settings.
	pub overlay: OverlayConfig,
}

impl Default for DemoConfig {
	fn default() -> Self {
		Self {
			latency: LatencyConfig::default(),
			seed: None,
			fail_operations: Vec::new(),
			overlay: OverlayConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LatencyConfig {
	pub min_ms: u64,
	pub max_ms: u64,
}

impl Default for LatencyConfig {
	fn default() -> Self {
		Self { min_ms: 300, max_ms: 500 }
	}
}

impl LatencyConfig {
	/// Inclusive delay bounds, with a reversed range collapsed onto `min_ms`.
	pub fn bounds(&self) -> (Duration, Duration) {
		let min = Duration::from_millis(self.min_ms);
		let max = Duration::from_millis(self.max_ms.max(self.min_ms));
		(min, max)
	}
}

impl DemoConfig {
	pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
		toml::from_str(text).context("invalid demo config")
	}

	/// Loads `path`, or returns the defaults when no path is given.
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};
		let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
		Self::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
	}
}
