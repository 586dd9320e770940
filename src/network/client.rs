//! Arbiter Client
//!
//! Keeps one outbound connection per peer and sends arbiter messages on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use super::{ArbiterCodec, Frame};
use crate::commit::ArbiterMessage;
use crate::error::{Error, Result};
use crate::state::{NodeId, NodeMask};

type Link = Arc<Mutex<Framed<TcpStream, ArbiterCodec>>>;

/// Client for sending arbiter messages to peer nodes
pub struct ArbiterClient {
    /// This node's ID, announced on every new connection
    node_id: NodeId,
    /// Peer addresses
    peers: HashMap<NodeId, String>,
    /// Connection pool: node -> connection
    pool: RwLock<HashMap<NodeId, Link>>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl ArbiterClient {
    /// Create a new arbiter client
    pub fn new(
        node_id: NodeId,
        peers: impl IntoIterator<Item = (NodeId, String)>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            peers: peers.into_iter().filter(|(id, _)| *id != node_id).collect(),
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Send a message to `to`, reconnecting once if the pooled link is dead
    pub async fn send(&self, to: NodeId, message: ArbiterMessage) -> Result<()> {
        if let Some(link) = self.get_connection(to).await {
            let mut framed = link.lock().await;
            match framed.send(Frame::Arbiter(message.clone())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!("Link to node {} failed, reconnecting: {}", to, e);
                    drop(framed);
                    self.remove_connection(to).await;
                }
            }
        }

        let link = self.link(to).await?;
        let mut framed = link.lock().await;
        if let Err(e) = framed.send(Frame::Arbiter(message)).await {
            drop(framed);
            self.remove_connection(to).await;
            return Err(e);
        }
        Ok(())
    }

    /// Make sure a link to `to` exists
    pub async fn connect(&self, to: NodeId) -> Result<()> {
        self.link(to).await.map(|_| ())
    }

    async fn link(&self, to: NodeId) -> Result<Link> {
        if let Some(link) = self.get_connection(to).await {
            return Ok(link);
        }

        let address = self.peers.get(&to).ok_or(Error::NodeNotFound(to))?;
        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.clone())),
        };
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, ArbiterCodec::default());
        framed.send(Frame::Hello { node: self.node_id }).await?;
        tracing::debug!("Connected to node {} at {}", to, address);

        let link = Arc::new(Mutex::new(framed));
        let mut pool = self.pool.write().await;
        // Another task may have connected meanwhile; keep the first link
        let link = pool.entry(to).or_insert(link).clone();
        Ok(link)
    }

    /// Drop the link to `to`
    pub async fn disconnect(&self, to: NodeId) {
        self.remove_connection(to).await;
    }

    /// Check whether a link to `to` is pooled
    pub async fn is_connected(&self, to: NodeId) -> bool {
        self.pool.read().await.contains_key(&to)
    }

    /// Peers with a pooled link
    pub async fn connected_peers(&self) -> NodeMask {
        self.pool.read().await.keys().copied().collect()
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    async fn get_connection(&self, to: NodeId) -> Option<Link> {
        self.pool.read().await.get(&to).cloned()
    }

    async fn remove_connection(&self, to: NodeId) {
        self.pool.write().await.remove(&to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use crate::channel::{Delivery, MessageChannel, MessageHub, Subscription};
    use crate::commit::{Gid, MessageCode};
    use crate::network::{ArbiterServer, PeerEvent};

    #[tokio::test]
    async fn test_send_through_server() {
        let hub = MessageHub::new(1);
        let (events_tx, mut events) = mpsc::channel(16);
        let server = Arc::new(ArbiterServer::new(1, "127.0.0.1:0".into(), hub.clone(), events_tx));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let gid = Gid::new(1, 42);
        let mut sub = hub.subscribe(&gid.stream_name()).unwrap();

        let client = ArbiterClient::new(2, vec![(1, address), (2, "unused:1".into())], Duration::from_secs(1));
        client
            .send(1, ArbiterMessage::new(gid, 2, MessageCode::Prepared))
            .await
            .unwrap();
        client
            .send(1, ArbiterMessage::new(gid, 2, MessageCode::Precommitted))
            .await
            .unwrap();
        assert!(client.is_connected(1).await);
        assert_eq!(client.connected_peers().await, NodeMask::single(1));

        let first = sub.pop(NodeMask::single(2), NodeMask::EMPTY).await.unwrap();
        let second = sub.pop(NodeMask::single(2), NodeMask::EMPTY).await.unwrap();
        assert_eq!(
            first,
            Delivery::Message { from: 2, message: ArbiterMessage::new(gid, 2, MessageCode::Prepared) }
        );
        assert_eq!(
            second,
            Delivery::Message { from: 2, message: ArbiterMessage::new(gid, 2, MessageCode::Precommitted) }
        );
        assert_eq!(events.recv().await, Some(PeerEvent::Connected(2)));

        client.close_all().await;
        assert_eq!(events.recv().await, Some(PeerEvent::Disconnected(2)));
        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let client = ArbiterClient::new(1, vec![(1, "localhost:1".into())], Duration::from_millis(100));
        let err = client
            .send(5, ArbiterMessage::new(Gid::new(5, 1), 1, MessageCode::Committed))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(5)));
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = ArbiterClient::new(1, vec![(2, address)], Duration::from_millis(500));
        let result = client
            .send(2, ArbiterMessage::new(Gid::new(1, 1), 1, MessageCode::Prepared))
            .await;
        assert!(result.is_err());
        assert!(!client.is_connected(2).await);
    }
}
