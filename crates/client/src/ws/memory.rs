//! In-process connector.
//!
//! Each admitted connection hands a [`MemoryPeer`] (the server end) to the
//! owner of the connector. Attempts can be admitted, held open in the
//! `Connecting` phase, or refused, and every attempt is timestamped with the
//! tokio clock so reconnect timing can be checked under a paused clock.

use std::sync::Arc;

use async_trait::async_trait;
use cms_admin_shared::{ClientAction, InboundFrame};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use super::connector::{CloseFrame, Connector, Link, TransportError, WireFrame};

/// What the connector does with the next connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Complete attempts immediately.
    Accept,
    /// Keep attempts pending until the admission changes.
    Hold,
    /// Fail attempts.
    Refuse,
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub url: Url,
    pub at: Instant,
}

#[derive(Clone)]
pub struct MemoryConnector {
    admission: Arc<watch::Sender<Admission>>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
    attempt_tx: Arc<watch::Sender<usize>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Receives the server end of every admitted connection.
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    attempts: watch::Receiver<usize>,
    log: Arc<Mutex<Vec<Attempt>>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (admission, _) = watch::channel(Admission::Accept);
        let (attempt_tx, attempt_rx) = watch::channel(0usize);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let connector = Self {
            admission: Arc::new(admission),
            attempts: attempts.clone(),
            attempt_tx: Arc::new(attempt_tx),
            peers: peer_tx,
        };
        let server = MemoryServer {
            peers: peer_rx,
            attempts: attempt_rx,
            log: attempts,
        };
        (connector, server)
    }

    pub fn set_admission(&self, admission: Admission) {
        self.admission.send_replace(admission);
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        let count = {
            let mut attempts = self.attempts.lock();
            attempts.push(Attempt {
                url: url.clone(),
                at: Instant::now(),
            });
            attempts.len()
        };
        self.attempt_tx.send_replace(count);

        let mut admission = self.admission.subscribe();
        let decision = match admission.wait_for(|a| *a != Admission::Hold).await {
            Ok(a) => *a,
            Err(_) => Admission::Refuse,
        };
        if decision == Admission::Refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_peer, from_client) = unbounded();
        let (to_client, from_peer) = unbounded();
        let peer = MemoryPeer {
            url: url.clone(),
            outgoing: to_client,
            incoming: from_client,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("memory server dropped".into()))?;

        let sink = to_peer.sink_map_err(|e| TransportError::Send(e.to_string()));
        let stream = from_peer.map(Ok::<WireFrame, TransportError>);
        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

impl MemoryServer {
    /// Next admitted connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Wait until at least `n` connection attempts were made.
    pub async fn wait_for_attempts(&mut self, n: usize) {
        let _ = self.attempts.wait_for(|count| *count >= n).await;
    }

    pub fn attempt_count(&self) -> usize {
        self.log.lock().len()
    }

    /// Gaps between consecutive attempts.
    pub fn attempt_gaps(&self) -> Vec<std::time::Duration> {
        let log = self.log.lock();
        log.windows(2).map(|w| w[1].at - w[0].at).collect()
    }
}

/// Server end of one in-memory connection. Dropping it ends the client's
/// stream without a close frame, like a network failure.
pub struct MemoryPeer {
    pub url: Url,
    outgoing: UnboundedSender<WireFrame>,
    incoming: UnboundedReceiver<WireFrame>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing
            .unbounded_send(WireFrame::Text(text.into()))
            .is_ok()
    }

    pub fn send_frame(&self, frame: &InboundFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Send a close frame and hang up.
    pub async fn close(mut self, code: u16) {
        let _ = self
            .outgoing
            .send(WireFrame::Close(Some(CloseFrame {
                code,
                reason: String::new(),
            })))
            .await;
    }

    /// Next frame from the client; `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.incoming.next().await
    }

    /// Next client action, skipping anything that is not one.
    pub async fn recv_action(&mut self) -> Option<ClientAction> {
        loop {
            match self.recv().await? {
                WireFrame::Text(text) => {
                    if let Ok(action) = serde_json::from_str(&text) {
                        return Some(action);
                    }
                }
                WireFrame::Close(_) => return None,
            }
        }
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.incoming.try_next().ok().flatten()
    }
}
