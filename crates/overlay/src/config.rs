//! Client configuration.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for an [`OverlayClient`](crate::OverlayClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverlayConfig {
	/// Ask the transport to refetch every target identity once an operation succeeds.
	pub refetch_on_success: bool,
	/// Number of resolved operation ids remembered so that late or duplicate
	/// transport reports for them are ignored. A resolution re-delivered after
	/// its id was evicted counts as an operation that resolved immediately: it is
	/// folded once and retires at once if the authoritative value reconciles it.
	pub terminal_history: usize,
	/// Drop cache entries with no subscribers and no overlays whenever a cleanup
	/// checkpoint retires an overlay.
	pub dispose_idle_entries: bool,
	/// First local id handed to overlay instances for placeholder rows. Each new
	/// instance receives the next lower number.
	pub placeholder_id_start: i64,
}

impl Default for OverlayConfig {
	fn default() -> Self {
		Self {
			refetch_on_success: true,
			terminal_history: 256,
			dispose_idle_entries: false,
			placeholder_id_start: -1,
		}
	}
}

impl OverlayConfig {
	/// Parses a TOML document. Missing fields keep their defaults.
	pub fn from_toml_str(text: &str) -> Result<Self> {
		Ok(toml::from_str(text)?)
	}
}
