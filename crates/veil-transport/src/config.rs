/// Configuration for transport connectors.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use veil_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_frame_size(256 * 1024)
///     .channel_buffer(64);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum frame size accepted in either direction.
    pub(crate) max_frame_size: usize,
    /// Channel buffer size for inbound and outbound frames.
    pub(crate) channel_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            max_frame_size: 1024 * 1024, // 1 MB
            channel_buffer: 256,
        }
    }

    /// Set maximum frame size (default: 1 MB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the channel buffer size (default: 256).
    pub fn channel_buffer(mut self, capacity: usize) -> Self {
        self.channel_buffer = capacity.max(1);
        self
    }
}
