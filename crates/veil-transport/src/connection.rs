use crate::TransportError;

use std::time::Duration;
use tokio::sync::mpsc;

/// Outbound half of a duplex connection.
///
/// Cloneable. The underlying connection is closed once every sender
/// clone has been dropped.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
    max_frame_size: usize,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<Vec<u8>>, max_frame_size: usize) -> Self {
        Self { tx, max_frame_size }
    }

    /// Queue one binary frame for transmission.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Whether the remote side (or the pump task) has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound half of a duplex connection.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl FrameReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next inbound frame. `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// One message-oriented, binary-safe connection to a relay.
#[derive(Debug)]
pub struct Duplex {
    pub endpoint: String,
    pub sender: FrameSender,
    pub receiver: FrameReceiver,
}

impl Duplex {
    /// Split into the outbound and inbound halves.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

/// Opens duplex connections to relay endpoints.
///
/// In production: [`WsConnector`](crate::WsConnector).
/// In tests: `MemoryConnector` (feature `test-utils`).
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Duplex, TransportError>;
}

/// Connect with a hard deadline.
pub async fn connect_with_timeout(
    connector: &dyn Connector,
    endpoint: &str,
    timeout: Duration,
) -> Result<Duplex, TransportError> {
    match tokio::time::timeout(timeout, connector.connect(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Build a linked pair of duplex halves (local, remote).
///
/// Frames sent on one side arrive on the other.
pub fn duplex_pair(endpoint: &str, buffer: usize, max_frame_size: usize) -> (Duplex, Duplex) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    let local = Duplex {
        endpoint: endpoint.to_string(),
        sender: FrameSender::new(a_tx, max_frame_size),
        receiver: FrameReceiver::new(b_rx),
    };
    let remote = Duplex {
        endpoint: endpoint.to_string(),
        sender: FrameSender::new(b_tx, max_frame_size),
        receiver: FrameReceiver::new(a_rx),
    };
    (local, remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_directions() {
        let (local, remote) = duplex_pair("mem://a", 8, 1024);
        let (local_tx, mut local_rx) = local.split();
        let (remote_tx, mut remote_rx) = remote.split();

        local_tx.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(remote_rx.recv().await.unwrap(), b"ping");

        remote_tx.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(local_rx.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (local, _remote) = duplex_pair("mem://a", 8, 4);
        let err = local.sender.send(vec![0u8; 5]).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 5, max: 4 }));
    }

    #[tokio::test]
    async fn dropping_sender_closes_remote_receiver() {
        let (local, remote) = duplex_pair("mem://a", 8, 1024);
        let (local_tx, _local_rx) = local.split();
        let (_remote_tx, mut remote_rx) = remote.split();

        drop(local_tx);
        assert!(remote_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_remote_drop_is_closed() {
        let (local, remote) = duplex_pair("mem://a", 8, 1024);
        drop(remote);
        let err = local.sender.send(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(local.sender.is_closed());
    }

    struct NeverConnects;

    #[async_trait::async_trait]
    impl Connector for NeverConnects {
        async fn connect(&self, _endpoint: &str) -> Result<Duplex, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_timeout_fires() {
        let err = connect_with_timeout(&NeverConnects, "mem://slow", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectTimeout { timeout_ms: 10_000, .. }
        ));
    }
}
