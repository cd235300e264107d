//! Sync session transport.
//!
//! A [`Conduit`] is one end of a bidirectional frame channel between a
//! consumer and a provider. The [`Connector`] trait opens sessions; the
//! in-process [`LoopbackConnector`] pairs two conduits over tokio mpsc channels
//! and hands the far end to a [`SessionAcceptor`] (normally the provider).

use crate::error::{ReplError, Result};
use crate::protocol;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct ConduitStatsInner {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
}

/// Statistics for one conduit end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConduitStats {
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Failed sends.
    pub send_errors: u64,
}

/// State of a conduit end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConduitState {
    /// Usable.
    #[default]
    Open,
    /// Closed locally or by the peer.
    Closed,
}

/// One end of a sync session.
#[derive(Clone)]
pub struct Conduit {
    label: Arc<str>,
    state: Arc<StdMutex<ConduitState>>,
    stats: Arc<ConduitStatsInner>,
    sender: mpsc::Sender<Bytes>,
    receiver: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Conduit {
    /// Create a connected pair. Returns (consumer end, provider end).
    pub fn new_pair(label: &str, capacity: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel::<Bytes>(capacity.max(1));
        let (tx_b, rx_b) = mpsc::channel::<Bytes>(capacity.max(1));
        // Closing either end closes the session.
        let closed = CancellationToken::new();
        let label: Arc<str> = Arc::from(label);
        let state = Arc::new(StdMutex::new(ConduitState::Open));
        let a = Self {
            label: Arc::clone(&label),
            state: Arc::clone(&state),
            stats: Arc::new(ConduitStatsInner::default()),
            sender: tx_a,
            receiver: Arc::new(Mutex::new(rx_b)),
            closed: closed.clone(),
        };
        let b = Self {
            label,
            state,
            stats: Arc::new(ConduitStatsInner::default()),
            sender: tx_b,
            receiver: Arc::new(Mutex::new(rx_a)),
            closed,
        };
        (a, b)
    }

    /// Session label (for logs).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Encode and send one message.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<()> {
        if self.is_closed() {
            return Err(ReplError::network(format!("{}: session closed", self.label)));
        }
        let frame = protocol::encode(msg)?;
        let len = frame.len() as u64;
        tokio::select! {
            _ = self.closed.cancelled() => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(ReplError::network(format!("{}: session closed", self.label)))
            }
            sent = self.sender.send(frame) => {
                sent.map_err(|_| {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    ReplError::network(format!("{}: peer went away", self.label))
                })?;
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn account(&self, frame: &Bytes) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` once the session is closed, a timeout error when
    /// nothing arrived in time and a protocol error for a malformed frame.
    pub async fn recv<T: for<'de> Deserialize<'de>>(&self, timeout: Duration) -> Result<Option<T>> {
        let mut receiver = self.receiver.lock().await;
        // Frames already queued are still delivered after a close.
        if let Ok(frame) = receiver.try_recv() {
            self.account(&frame);
            return protocol::decode(&frame).map(Some);
        }
        let frame = tokio::select! {
            biased;
            r = tokio::time::timeout(timeout, receiver.recv()) => match r {
                Err(_) => return Err(ReplError::Timeout { ms: timeout.as_millis() as u64 }),
                Ok(None) => return Ok(None),
                Ok(Some(frame)) => frame,
            },
            _ = self.closed.cancelled() => return Ok(None),
        };
        self.account(&frame);
        protocol::decode(&frame).map(Some)
    }

    /// Take the next message if one is already queued.
    pub async fn try_recv<T: for<'de> Deserialize<'de>>(&self) -> Result<Option<T>> {
        let mut receiver = self.receiver.lock().await;
        match receiver.try_recv() {
            Ok(frame) => {
                self.account(&frame);
                protocol::decode(&frame).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    /// Close both ends; pending reads on either side return `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == ConduitState::Open {
            *state = ConduitState::Closed;
            debug!(session = %self.label, "session closed");
        }
        self.closed.cancel();
    }

    /// True once either end closed the session.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Current state.
    pub fn state(&self) -> ConduitState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Snapshot of this end's counters.
    pub fn stats(&self) -> ConduitStats {
        ConduitStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Opens sync sessions to one provider.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Provider address, for logs and status.
    fn endpoint(&self) -> String;

    /// Open a new session and return the consumer end.
    async fn connect(&self) -> Result<Conduit>;
}

/// Accepts the provider end of a newly opened session.
pub trait SessionAcceptor: Send + Sync {
    /// Take ownership of the session and start serving it.
    fn accept(self: Arc<Self>, conduit: Conduit);
}

/// In-process connector wired straight to an acceptor.
pub struct LoopbackConnector {
    endpoint: String,
    acceptor: Arc<dyn SessionAcceptor>,
    capacity: usize,
    reachable: AtomicBool,
    connects: AtomicU64,
}

impl LoopbackConnector {
    /// Connect to `acceptor`, buffering up to `capacity` frames per direction.
    pub fn new(endpoint: &str, acceptor: Arc<dyn SessionAcceptor>, capacity: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            acceptor,
            capacity,
            reachable: AtomicBool::new(true),
            connects: AtomicU64::new(0),
        }
    }

    /// Simulate the provider becoming unreachable (or reachable again).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self) -> Result<Conduit> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(ReplError::network(format!("{}: connection refused", self.endpoint)));
        }
        let n = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("{}#{}", self.endpoint, n);
        let (consumer_end, provider_end) = Conduit::new_pair(&label, self.capacity);
        Arc::clone(&self.acceptor).accept(provider_end);
        Ok(consumer_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConsumerMessage, ProviderMessage, SyncDone};

    fn done() -> ProviderMessage {
        ProviderMessage::Done(SyncDone {
            cookie: Some("rid=001".into()),
            refresh_deletes: true,
        })
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let (a, b) = Conduit::new_pair("t", 8);
        b.send(&done()).await.unwrap();
        let got: ProviderMessage = a.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got, done());
        assert_eq!(b.stats().frames_sent, 1);
        assert_eq!(a.stats().frames_received, 1);
        assert!(a.stats().bytes_received > 0);
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (a, _b) = Conduit::new_pair("t", 8);
        let err = a.recv::<ProviderMessage>(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ReplError::Timeout { ms: 10 }));
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (a, b) = Conduit::new_pair("t", 8);
        let reader = tokio::spawn(async move { a.recv::<ProviderMessage>(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.close();
        assert!(reader.await.unwrap().unwrap().is_none());
        assert_eq!(b.state(), ConduitState::Closed);
        assert!(b.send(&ConsumerMessage::Abandon).await.is_err());
    }

    #[tokio::test]
    async fn test_try_recv() {
        let (a, b) = Conduit::new_pair("t", 8);
        assert!(a.try_recv::<ConsumerMessage>().await.unwrap().is_none());
        b.send(&ConsumerMessage::Abandon).await.unwrap();
        assert_eq!(
            a.try_recv::<ConsumerMessage>().await.unwrap(),
            Some(ConsumerMessage::Abandon)
        );
    }

    #[tokio::test]
    async fn test_garbage_frame_rejected() {
        let (a, b) = Conduit::new_pair("t", 8);
        b.sender.send(Bytes::from_static(&[9, 9, 9])).await.unwrap();
        let err = a.recv::<ProviderMessage>(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Protocol);
    }

    struct Echo;

    impl SessionAcceptor for Echo {
        fn accept(self: Arc<Self>, conduit: Conduit) {
            tokio::spawn(async move {
                while let Ok(Some(msg)) = conduit.recv::<ConsumerMessage>(Duration::from_secs(5)).await {
                    if conduit.send(&msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_loopback_connector() {
        let connector = LoopbackConnector::new("mem://p1", Arc::new(Echo), 4);
        let session = connector.connect().await.unwrap();
        session.send(&ConsumerMessage::Abandon).await.unwrap();
        let back: ConsumerMessage = session.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(back, ConsumerMessage::Abandon);
        assert_eq!(connector.connects(), 1);

        connector.set_reachable(false);
        let err = connector.connect().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
    }
}
