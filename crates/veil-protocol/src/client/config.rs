use std::time::Duration;

/// Largest application payload accepted by `send_through_circuit` (64 KiB).
pub const MAX_RELAY_PAYLOAD: usize = 64 * 1024;

/// Configuration for a [`RelayClient`](crate::RelayClient).
///
/// ```rust
/// use std::time::Duration;
/// use veil_protocol::ClientConfig;
///
/// let config = ClientConfig::new()
///     .connect_timeout(Duration::from_secs(5))
///     .heartbeat_interval(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_timeout: Duration,
    pub(crate) max_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            max_payload: MAX_RELAY_PAYLOAD,
        }
    }

    /// Deadline for opening a relay connection (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Deadline for one request/reply exchange (default: 5 s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Period between heartbeats; zero disables them (default: 30 s).
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Deadline for a heartbeat ack (default: 5 s).
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(config.request_timeout < config.connect_timeout);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.max_payload, 65_536);
    }
}
