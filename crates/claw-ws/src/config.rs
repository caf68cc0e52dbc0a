//! Endpoint configuration.
//!
//! Everything here is consumed by the engine (codec and socket setup); the
//! connection registry and endpoint orchestration never interpret it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::{WsError, WsResult};

/// Default write buffer size: 128KB.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 128 * 1024;

/// Default number of queued outbound messages per connection.
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 64;

/// Default accept backlog.
pub const DEFAULT_BACKLOG: u32 = 256;

/// Default dial timeout: 10 seconds.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 10_000;

/// Default server handshake timeout: 10 seconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default bound on close-frame delivery during shutdown: 1 second.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1_000;

/// Opcode used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Text frames; payloads must be valid UTF-8.
    #[default]
    Text,
    /// Binary frames.
    Binary,
}

/// Message compression settings.
///
/// Carried through to the codec unchanged; messages below `threshold` bytes
/// are never compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether permessage-deflate is requested.
    pub enabled: bool,
    /// Compression level.
    pub level: u32,
    /// Minimum message size in bytes before compressing.
    pub threshold: usize,
}

/// Configuration for a WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Opcode for outbound messages.
    pub message_type: MessageType,
    /// Reject outbound text payloads that are not valid UTF-8 instead of
    /// replacing invalid sequences. Inbound text is always validated by the codec.
    pub check_utf8: bool,
    /// Disable Nagle's algorithm on TCP sockets.
    pub no_delay: bool,
    /// Maximum inbound frame size in bytes (`None` uses the codec default).
    pub max_frame_size: Option<usize>,
    /// Maximum inbound message size in bytes (`None` uses the codec default).
    pub max_message_size: Option<usize>,
    /// Read buffer size in bytes (0 uses the codec default).
    pub read_buffer_size: usize,
    /// Write buffer size in bytes (0 uses the codec default).
    pub write_buffer_size: usize,
    /// Outbound messages queued per connection before `send` reports backpressure.
    pub write_queue_size: usize,
    /// Compression settings.
    pub compression: CompressionConfig,
    /// Accept backlog for listeners.
    pub backlog: u32,
    /// Dial plus client handshake timeout in milliseconds.
    pub dial_timeout_ms: u64,
    /// Server handshake timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Bound on close-frame delivery during shutdown, in milliseconds.
    pub close_timeout_ms: u64,
    /// Extra headers sent with the client handshake request.
    pub client_headers: BTreeMap<String, String>,
    /// Extra headers sent with the server handshake response.
    pub server_headers: BTreeMap<String, String>,
}

impl EndpointConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            message_type: MessageType::Text,
            check_utf8: false,
            no_delay: true,
            max_frame_size: None,
            max_message_size: None,
            read_buffer_size: 0,
            write_buffer_size: 0,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
            compression: CompressionConfig {
                enabled: false,
                level: 0,
                threshold: 0,
            },
            backlog: DEFAULT_BACKLOG,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            client_headers: BTreeMap::new(),
            server_headers: BTreeMap::new(),
        }
    }

    /// Switch outbound messages to binary frames.
    #[must_use]
    pub const fn with_binary(mut self) -> Self {
        self.message_type = MessageType::Binary;
        self
    }

    /// Set the outbound message type.
    #[must_use]
    pub const fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Enable UTF-8 validation of text payloads.
    #[must_use]
    pub const fn with_valid_utf8(mut self) -> Self {
        self.check_utf8 = true;
        self
    }

    /// Control Nagle's algorithm (`true` sends data as soon as possible).
    #[must_use]
    pub const fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Set the read and write buffer sizes.
    #[must_use]
    pub const fn with_buffer_size(mut self, read: usize, write: usize) -> Self {
        self.read_buffer_size = read;
        self.write_buffer_size = write;
        self
    }

    /// Set the per-connection write queue size.
    #[must_use]
    pub const fn with_write_queue_size(mut self, size: usize) -> Self {
        self.write_queue_size = size;
        self
    }

    /// Enable compression with a level and a size threshold.
    #[must_use]
    pub const fn with_compress(mut self, level: u32, threshold: usize) -> Self {
        self.compression = CompressionConfig {
            enabled: true,
            level,
            threshold,
        };
        self
    }

    /// Set the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the server handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the close-frame delivery bound used during shutdown.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = duration_ms(timeout);
        self
    }

    /// Add a header to the client handshake request.
    #[must_use]
    pub fn with_client_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_headers.insert(name.into(), value.into());
        self
    }

    /// Add a header to the server handshake response.
    #[must_use]
    pub fn with_server_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_headers.insert(name.into(), value.into());
        self
    }

    /// Dial timeout as a [`Duration`].
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Close timeout as a [`Duration`].
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Codec configuration derived from these settings.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.write_buffer_size > 0 {
            config.write_buffer_size = self.write_buffer_size;
        }
        if self.max_frame_size.is_some() {
            config.max_frame_size = self.max_frame_size;
        }
        if self.max_message_size.is_some() {
            config.max_message_size = self.max_message_size;
        }
        config
    }

    /// Client handshake headers as a [`HeaderMap`].
    ///
    /// # Errors
    ///
    /// Returns `WsError::Config` if a name or value is not a valid header.
    pub fn client_header_map(&self) -> WsResult<HeaderMap> {
        header_map(&self.client_headers)
    }

    /// Server handshake headers as a [`HeaderMap`].
    ///
    /// # Errors
    ///
    /// Returns `WsError::Config` if a name or value is not a valid header.
    pub fn server_header_map(&self) -> WsResult<HeaderMap> {
        header_map(&self.server_headers)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> WsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WsError::Config(format!(
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
    pub fn from_toml(content: &str) -> WsResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| WsError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> WsResult<()> {
        if self.write_queue_size == 0 {
            return Err(WsError::Config(
                "write_queue_size must be greater than 0".to_string(),
            ));
        }

        if self.max_frame_size == Some(0) {
            return Err(WsError::Config(
                "max_frame_size must be greater than 0".to_string(),
            ));
        }

        if let (Some(frame), Some(message)) = (self.max_frame_size, self.max_message_size) {
            if frame > message {
                return Err(WsError::Config(format!(
                    "max_frame_size ({frame}) cannot exceed max_message_size ({message})"
                )));
            }
        }

        if self.compression.enabled && self.compression.level > 9 {
            return Err(WsError::Config(format!(
                "compression.level must be between 0 and 9, got {}",
                self.compression.level
            )));
        }

        if self.dial_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(WsError::Config(
                "dial and handshake timeouts must be greater than 0".to_string(),
            ));
        }

        self.client_header_map()?;
        self.server_header_map()?;
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new()
    }
}

const fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    if ms > u64::MAX as u128 {
        u64::MAX
    } else {
        ms as u64
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> WsResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| WsError::Config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WsError::Config(format!("invalid header value for '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    // ==================== Builder Tests ====================

    #[test]
    fn test_endpoint_config_default() {
        let config = EndpointConfig::default();

        assert_eq!(config.message_type, MessageType::Text);
        assert!(config.no_delay);
        assert!(!config.check_utf8);
        assert_eq!(config.write_queue_size, DEFAULT_WRITE_QUEUE_SIZE);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.close_timeout(), Duration::from_secs(1));
        assert!(!config.compression.enabled);
    }

    #[test]
    fn test_endpoint_config_builder() {
        let config = EndpointConfig::new()
            .with_binary()
            .with_valid_utf8()
            .with_no_delay(false)
            .with_max_frame_size(64 * 1024)
            .with_max_message_size(1024 * 1024)
            .with_buffer_size(4096, 8192)
            .with_compress(6, 512)
            .with_dial_timeout(Duration::from_secs(3));

        assert_eq!(config.message_type, MessageType::Binary);
        assert!(config.check_utf8);
        assert!(!config.no_delay);
        assert_eq!(config.max_frame_size, Some(64 * 1024));
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.write_buffer_size, 8192);
        assert!(config.compression.enabled);
        assert_eq!(config.compression.threshold, 512);
        assert_eq!(config.dial_timeout(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_websocket_config_passes_limits() {
        let config = EndpointConfig::new()
            .with_max_frame_size(1000)
            .with_max_message_size(2000)
            .with_buffer_size(0, 4096);
        let ws = config.websocket_config();

        assert_eq!(ws.max_frame_size, Some(1000));
        assert_eq!(ws.max_message_size, Some(2000));
        assert_eq!(ws.write_buffer_size, 4096);
    }

    #[test]
    fn test_websocket_config_keeps_codec_defaults() {
        let ws = EndpointConfig::new().websocket_config();
        let defaults = WebSocketConfig::default();

        assert_eq!(ws.max_frame_size, defaults.max_frame_size);
        assert_eq!(ws.write_buffer_size, defaults.write_buffer_size);
    }

    #[test]
    fn test_header_maps() {
        let config = EndpointConfig::new()
            .with_client_header("x-client", "a")
            .with_server_header("x-server", "b");

        let client = config.client_header_map().unwrap();
        let server = config.server_header_map().unwrap();
        assert_eq!(client.get("x-client").unwrap(), "a");
        assert_eq!(server.get("x-server").unwrap(), "b");
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = EndpointConfig::new().with_write_queue_size(0);
        assert!(matches!(config.validate(), Err(WsError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_frame_larger_than_message() {
        let config = EndpointConfig::new()
            .with_max_frame_size(2048)
            .with_max_message_size(1024);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_frame_size"));
    }

    #[test]
    fn test_validate_rejects_bad_header() {
        let config = EndpointConfig::new().with_client_header("bad header", "x");
        assert!(matches!(config.validate(), Err(WsError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_compression_level() {
        let config = EndpointConfig::new().with_compress(12, 0);
        assert!(config.validate().is_err());
    }

    // ==================== TOML Tests ====================

    #[test]
    fn test_parse_minimal_toml() {
        let config = EndpointConfig::from_toml("").expect("empty config uses defaults");
        assert_eq!(config, EndpointConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            message_type = "binary"
            check_utf8 = true
            max_frame_size = 65536
            write_queue_size = 16
            close_timeout_ms = 250

            [compression]
            enabled = true
            level = 3
            threshold = 1024

            [server_headers]
            x-powered-by = "claw-ws"
        "#;

        let config = EndpointConfig::from_toml(toml).expect("should parse full config");

        assert_eq!(config.message_type, MessageType::Binary);
        assert!(config.check_utf8);
        assert_eq!(config.max_frame_size, Some(65536));
        assert_eq!(config.write_queue_size, 16);
        assert_eq!(config.close_timeout(), Duration::from_millis(250));
        assert_eq!(config.compression.level, 3);
        assert_eq!(
            config.server_headers.get("x-powered-by").map(String::as_str),
            Some("claw-ws")
        );
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = EndpointConfig::from_toml("message_type = 42");
        assert!(matches!(result, Err(WsError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(b"message_type = \"binary\"\n")
            .expect("failed to write temp file");

        let config = EndpointConfig::from_file(file.path()).expect("should load config");
        assert_eq!(config.message_type, MessageType::Binary);
    }

    #[test]
    fn test_from_missing_file() {
        let result = EndpointConfig::from_file("/nonexistent/claw-ws.toml");
        assert!(matches!(result, Err(WsError::Config(_))));
    }
}
