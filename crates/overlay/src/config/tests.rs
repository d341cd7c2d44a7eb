use super::*;
use crate::OverlayError;

#[test]
fn empty_document_yields_defaults() {
	assert_eq!(OverlayConfig::from_toml_str("").unwrap(), OverlayConfig::default());
}

#[test]
fn partial_document_overrides_fields() {
	let config = OverlayConfig::from_toml_str("refetch_on_success = false\nplaceholder_id_start = -100\n").unwrap();
	assert!(!config.refetch_on_success);
	assert_eq!(config.placeholder_id_start, -100);
	assert_eq!(config.terminal_history, 256);
}

#[test]
fn unknown_fields_are_rejected() {
	let err = OverlayConfig::from_toml_str("refetch = true").unwrap_err();
	assert!(matches!(err, OverlayError::Config(_)));
}
