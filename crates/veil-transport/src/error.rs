/// Errors returned by the Veil transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("connection to {endpoint} timed out after {timeout_ms} ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("send failed: connection closed")]
    Closed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connect_timeout() {
        let err = TransportError::ConnectTimeout {
            endpoint: "wss://relay.example:443".into(),
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "connection to wss://relay.example:443 timed out after 10000 ms"
        );
    }

    #[test]
    fn display_frame_too_large() {
        let err = TransportError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes (max 4)");
    }
}
