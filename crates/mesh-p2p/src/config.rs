//! Mesh configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{P2pError, P2pResult};
use crate::protocol::NodeId;

/// Default hop budget for broadcasts.
pub const DEFAULT_BROADCAST_TTL: u32 = 1000;

/// Default hop budget for direct messages.
pub const DEFAULT_DIRECT_TTL: u32 = 10;

/// Default maximum length of one wire frame: 1MB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Configuration for a mesh participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Fixed node id. A random one is generated when unset.
    pub node_id: Option<NodeId>,
    /// Initial ttl of locally originated broadcasts.
    pub broadcast_ttl: u32,
    /// Initial ttl of locally originated direct messages.
    pub direct_ttl: u32,
    /// Maximum number of message ids remembered for deduplication.
    pub seen_cache_capacity: usize,
    /// How long a message id is remembered, in seconds.
    pub seen_cache_ttl_secs: u64,
    /// Longest accepted line on the wire, in bytes.
    /// A longer line is dropped.
    pub max_frame_length: usize,
    /// Frames queued per connection before sends fail with backpressure.
    pub outbound_buffer: usize,
    /// Application events buffered per subscriber.
    pub event_buffer: usize,
    /// Pending commands to the event loop.
    pub command_buffer: usize,
    /// Timeout for outbound connects, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            broadcast_ttl: DEFAULT_BROADCAST_TTL,
            direct_ttl: DEFAULT_DIRECT_TTL,
            seen_cache_capacity: 10_000,
            seen_cache_ttl_secs: 300,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            outbound_buffer: 256,
            event_buffer: 1024,
            command_buffer: 64,
            connect_timeout_ms: 10_000,
        }
    }
}

impl MeshConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> P2pResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            P2pError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> P2pResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| P2pError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> P2pResult<String> {
        toml::to_string_pretty(self).map_err(|e| P2pError::Config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> P2pResult<()> {
        if let Some(id) = &self.node_id {
            if id.as_str().is_empty() {
                return Err(P2pError::Config("node_id cannot be empty".to_string()));
            }
        }
        if self.broadcast_ttl == 0 {
            return Err(P2pError::Config(
                "broadcast_ttl must be greater than 0".to_string(),
            ));
        }
        if self.direct_ttl == 0 {
            return Err(P2pError::Config("direct_ttl must be greater than 0".to_string()));
        }
        if self.seen_cache_capacity == 0 {
            return Err(P2pError::Config(
                "seen_cache_capacity must be greater than 0".to_string(),
            ));
        }
        if self.seen_cache_ttl_secs == 0 {
            return Err(P2pError::Config(
                "seen_cache_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(P2pError::Config(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_length < 64 {
            return Err(P2pError::Config(
                "max_frame_length must be at least 64 bytes".to_string(),
            ));
        }
        for (name, value) in [
            ("outbound_buffer", self.outbound_buffer),
            ("event_buffer", self.event_buffer),
            ("command_buffer", self.command_buffer),
        ] {
            if value == 0 {
                return Err(P2pError::Config(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Sets a fixed node id.
    #[must_use]
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Sets the default broadcast ttl.
    #[must_use]
    pub const fn with_broadcast_ttl(mut self, ttl: u32) -> Self {
        self.broadcast_ttl = ttl;
        self
    }

    /// Sets the default direct-message ttl.
    #[must_use]
    pub const fn with_direct_ttl(mut self, ttl: u32) -> Self {
        self.direct_ttl = ttl;
        self
    }

    /// Sets the seen-cache capacity.
    #[must_use]
    pub const fn with_seen_cache_capacity(mut self, capacity: usize) -> Self {
        self.seen_cache_capacity = capacity;
        self
    }

    /// Sets the maximum frame length.
    #[must_use]
    pub const fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }

    /// Sets the per-connection outbound buffer.
    #[must_use]
    pub const fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }

    /// Sets the seen-cache entry lifetime, in whole seconds.
    #[must_use]
    pub const fn with_seen_cache_ttl(mut self, ttl: Duration) -> Self {
        self.seen_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Sets the connect timeout, in whole milliseconds.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Returns the seen-cache entry lifetime.
    #[must_use]
    pub const fn seen_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_cache_ttl_secs)
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use test_case::test_case;

    #[test]
    fn defaults_match_protocol() {
        let config = MeshConfig::default();
        assert_eq!(config.broadcast_ttl, 1000);
        assert_eq!(config.direct_ttl, 10);
        assert!(config.node_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_is_default() {
        let config = MeshConfig::from_toml("").unwrap();
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn parses_partial_toml() {
        let toml = r#"
            node_id = "oracle-1"
            broadcast_ttl = 8
            seen_cache_capacity = 500
        "#;

        let config = MeshConfig::from_toml(toml).unwrap();
        assert_eq!(config.node_id, Some(NodeId::from("oracle-1")));
        assert_eq!(config.broadcast_ttl, 8);
        assert_eq!(config.seen_cache_capacity, 500);
        assert_eq!(config.direct_ttl, DEFAULT_DIRECT_TTL);
    }

    #[test]
    fn rejects_zero_ttl() {
        let err = MeshConfig::from_toml("broadcast_ttl = 0").unwrap_err();
        assert!(err.to_string().contains("broadcast_ttl"));
    }

    #[test]
    fn rejects_empty_node_id() {
        let err = MeshConfig::from_toml(r#"node_id = """#).unwrap_err();
        assert!(err.to_string().contains("node_id"));
    }

    #[test_case("broadcast_ttl = 0", "broadcast_ttl" ; "zero broadcast ttl")]
    #[test_case("direct_ttl = 0", "direct_ttl" ; "zero direct ttl")]
    #[test_case("seen_cache_capacity = 0", "seen_cache_capacity" ; "zero seen cache capacity")]
    #[test_case("seen_cache_ttl_secs = 0", "seen_cache_ttl_secs" ; "zero seen cache ttl")]
    #[test_case("connect_timeout_ms = 0", "connect_timeout_ms" ; "zero connect timeout")]
    #[test_case("max_frame_length = 10", "max_frame_length" ; "tiny frame length")]
    #[test_case("outbound_buffer = 0", "outbound_buffer" ; "zero outbound buffer")]
    fn rejects_out_of_range(toml: &str, field: &str) {
        let err = MeshConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, P2pError::Config(_)));
        assert!(err.to_string().contains(field));
    }

    #[test]
    fn rejects_zero_buffers() {
        let config = MeshConfig::default().with_outbound_buffer(0);
        assert!(matches!(config.validate(), Err(P2pError::Config(_))));
    }

    #[test]
    fn zero_seen_cache_ttl_from_builder_is_rejected() {
        let config = MeshConfig::default().with_seen_cache_ttl(Duration::from_millis(500));
        assert!(matches!(config.validate(), Err(P2pError::Config(_))));
    }

    #[test]
    fn rejects_invalid_toml() {
        let err = MeshConfig::from_toml("broadcast_ttl = \"lots\"").unwrap_err();
        assert!(err.to_string().contains("invalid TOML"));
    }

    #[test]
    fn toml_output_parses_back() {
        let config = MeshConfig::default().with_node_id("n1").with_direct_ttl(4);
        let parsed = MeshConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(b"direct_ttl = 3\n").expect("failed to write temp file");

        let config = MeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.direct_ttl, 3);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = MeshConfig::from_file("/nonexistent/mesh.toml").unwrap_err();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[test_case(Duration::from_secs(3) ; "whole seconds")]
    #[test_case(Duration::from_millis(500) ; "sub second")]
    fn connect_timeout_builder_keeps_millis(timeout: Duration) {
        let config = MeshConfig::default().with_connect_timeout(timeout);
        assert_eq!(config.connect_timeout(), timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sub_millisecond_connect_timeout_is_rejected() {
        let config = MeshConfig::default().with_connect_timeout(Duration::from_micros(200));
        assert!(matches!(config.validate(), Err(P2pError::Config(_))));
    }
}
