//! Dispatcher configuration.

use crate::wire::{MAX_PAYLOAD_V1, MAX_PAYLOAD_V2, VERSION_SKIP_CHECKSUM};

/// Wire-compatibility knobs for one dispatcher.
///
/// The values depend on what the connection banner negotiated and on the
/// age of the remote daemon; they are fixed for the dispatcher's lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compute and emit payload checksums, and verify inbound ones.
    /// Required by pre-v2 transports; v2+ negotiates checksum skipping.
    pub calculate_checksum: bool,

    /// Append a trailing NUL to outbound service strings. Daemons before
    /// Android 9 parse the service string with C string semantics and
    /// need the terminator.
    pub append_null_to_service_string: bool,

    /// Hard upper bound for any outbound payload, as negotiated in the
    /// connection banner.
    pub max_payload_size: usize,
}

impl Default for Config {
    /// Conservative legacy profile: checksums on, NUL-terminated service
    /// strings, 4 KiB payloads. Compatible with every daemon version.
    fn default() -> Self {
        Self {
            calculate_checksum: true,
            append_null_to_service_string: true,
            max_payload_size: MAX_PAYLOAD_V1,
        }
    }
}

impl Config {
    /// Derive wire settings from a negotiated banner version and payload
    /// limit.
    pub fn for_version(version: u32, max_payload_size: usize) -> Self {
        Self {
            calculate_checksum: version < VERSION_SKIP_CHECKSUM,
            append_null_to_service_string: version < VERSION_SKIP_CHECKSUM,
            max_payload_size,
        }
    }

    /// Validate the configuration, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_payload_size == 0 {
            errors.push("max_payload_size must be nonzero".to_string());
        }
        if self.max_payload_size > MAX_PAYLOAD_V2 * 4 {
            errors.push(format!(
                "max_payload_size {} exceeds any negotiable limit",
                self.max_payload_size
            ));
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_legacy_safe() {
        let config = Config::default();
        assert!(config.calculate_checksum);
        assert!(config.append_null_to_service_string);
        assert_eq!(config.max_payload_size, MAX_PAYLOAD_V1);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_for_version_drops_checksum_on_v2() {
        let config = Config::for_version(VERSION_SKIP_CHECKSUM, MAX_PAYLOAD_V2);
        assert!(!config.calculate_checksum);
        assert_eq!(config.max_payload_size, MAX_PAYLOAD_V2);
    }

    #[test]
    fn test_zero_payload_size_rejected() {
        let config = Config {
            max_payload_size: 0,
            ..Config::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("nonzero"));
    }
}
