//! Arbiter Server
//!
//! Accepts connections from peer nodes and feeds their arbiter messages into
//! the local message hub. A peer's stream is attached while at least its
//! latest connection is alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use super::{ArbiterCodec, Frame};
use crate::channel::MessageHub;
use crate::error::{Error, Result};
use crate::state::{NodeId, NodeMask};

/// Peer link change seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(NodeId),
    Disconnected(NodeId),
}

/// Latest connection id per peer
type ConnectionTable = Arc<Mutex<HashMap<NodeId, u64>>>;

/// Arbiter server for cluster communication
pub struct ArbiterServer {
    /// This node's ID
    node_id: NodeId,
    /// Bind address
    bind_address: String,
    /// Destination of incoming messages
    hub: MessageHub,
    /// Peer connect/disconnect notifications
    events: mpsc::Sender<PeerEvent>,
    /// Live connections
    connections: ConnectionTable,
    /// Connection id source
    next_connection: Arc<AtomicU64>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl ArbiterServer {
    /// Create a new arbiter server
    pub fn new(
        node_id: NodeId,
        bind_address: String,
        hub: MessageHub,
        events: mpsc::Sender<PeerEvent>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            node_id,
            bind_address,
            hub,
            events,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(0)),
            shutdown: shutdown_tx,
        }
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Arbiter server for node {} listening on {}",
            self.node_id,
            listener.local_addr()?
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let connection = Connection {
                                id: self.next_connection.fetch_add(1, Ordering::Relaxed),
                                node_id: self.node_id,
                                hub: self.hub.clone(),
                                events: self.events.clone(),
                                connections: self.connections.clone(),
                                shutdown: self.shutdown.subscribe(),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = connection.run(socket, &peer_addr).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Arbiter server stopped");
        Ok(())
    }

    /// Stop the server and every connection it accepted
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Peers with a live inbound connection
    pub fn connected_peers(&self) -> NodeMask {
        lock(&self.connections).keys().copied().collect()
    }
}

fn lock(table: &ConnectionTable) -> std::sync::MutexGuard<'_, HashMap<NodeId, u64>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One accepted peer connection
struct Connection {
    id: u64,
    node_id: NodeId,
    hub: MessageHub,
    events: mpsc::Sender<PeerEvent>,
    connections: ConnectionTable,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, socket: TcpStream, peer_addr: &str) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, ArbiterCodec::default());

        let peer = match framed.next().await {
            Some(Ok(Frame::Hello { node })) if NodeMask::is_valid_id(node) && node != self.node_id => node,
            Some(Ok(frame)) => {
                return Err(Error::ProtocolViolation(format!(
                    "{} opened with {:?} instead of a valid hello",
                    peer_addr, frame
                )));
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        };

        lock(&self.connections).insert(peer, self.id);
        self.hub.attach(peer);
        tracing::debug!("Node {} connected from {}", peer, peer_addr);
        let _ = self.events.send(PeerEvent::Connected(peer)).await;

        let result = self.pump(&mut framed, peer).await;

        // A newer connection from the same peer keeps the stream attached
        let latest = {
            let mut table = lock(&self.connections);
            if table.get(&peer) == Some(&self.id) {
                table.remove(&peer);
                true
            } else {
                false
            }
        };
        if latest {
            self.hub.detach(peer);
            tracing::debug!("Node {} disconnected", peer);
            let _ = self.events.send(PeerEvent::Disconnected(peer)).await;
        }

        result
    }

    async fn pump(&mut self, framed: &mut Framed<TcpStream, ArbiterCodec>, peer: NodeId) -> Result<()> {
        loop {
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(Frame::Arbiter(message))) => {
                        tracing::trace!("Received {} for {} from node {}", message.code, message.gid, peer);
                        self.hub.deliver(peer, message);
                    }
                    Some(Ok(Frame::Hello { node })) => {
                        return Err(Error::ProtocolViolation(format!(
                            "node {} sent a second hello as {}",
                            peer, node
                        )));
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
