//! Cluster membership: the registration dependency of a broker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::channel::{Connection, Connector, TcpConnector};
use crate::error::BrokerError;
use crate::types::NodeId;

/// What a broker announces about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: NodeId,
    pub control_addr: String,
}

#[async_trait]
pub trait MembershipService: Send + Sync + 'static {
    /// Establish the session used by later calls.
    async fn connect(&self, timeout: Duration) -> Result<(), BrokerError>;
    async fn register(&self, registration: &Registration, timeout: Duration) -> Result<(), BrokerError>;
    async fn deregister(&self, node: NodeId, timeout: Duration) -> Result<(), BrokerError>;
    /// Drop the session opened by `connect` without leaving the cluster.
    async fn disconnect(&self);
}

/// In-process membership whose availability can be toggled.
pub struct StaticMembership {
    reachable: AtomicBool,
    accepting: AtomicBool,
    members: Mutex<BTreeMap<NodeId, String>>,
}

impl Default for StaticMembership {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            members: Mutex::new(BTreeMap::new()),
        }
    }
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` makes `connect` and `deregister` hang until their timeout.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// `false` makes `register` hang until its timeout.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn members(&self) -> BTreeMap<NodeId, String> {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn unavailable(timeout: Duration) -> BrokerError {
    time::sleep(timeout).await;
    BrokerError::DependencyTimeout {
        service: "membership".to_string(),
        timeout,
    }
}

#[async_trait]
impl MembershipService for StaticMembership {
    async fn connect(&self, timeout: Duration) -> Result<(), BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(unavailable(timeout).await);
        }
        Ok(())
    }

    async fn register(&self, registration: &Registration, timeout: Duration) -> Result<(), BrokerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(unavailable(timeout).await);
        }
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(registration.node_id, registration.control_addr.clone());
        Ok(())
    }

    async fn deregister(&self, node: NodeId, timeout: Duration) -> Result<(), BrokerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(unavailable(timeout).await);
        }
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node);
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MembershipMessage {
    Register(Registration),
    Deregister { node_id: NodeId },
}

/// Membership service reached over the framed control protocol.
///
/// Each message is one frame acknowledged by the service; an unreachable or
/// unresponsive service surfaces as `DependencyTimeout`.
pub struct TcpMembership {
    addr: String,
    session: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
}

impl TcpMembership {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    fn timed_out(&self, timeout: Duration) -> BrokerError {
        BrokerError::DependencyTimeout {
            service: format!("membership at {}", self.addr),
            timeout,
        }
    }

    async fn send(&self, message: &MembershipMessage, timeout: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(message).map_err(anyhow::Error::from)?;
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.open(timeout).await?);
        }
        let Some(conn) = session.as_mut() else {
            return Err(self.timed_out(timeout));
        };
        if let Err(err) = conn.send(&payload, timeout).await {
            tracing::warn!(addr = %self.addr, error = %err, "membership request failed");
            *session = None;
            return Err(self.timed_out(timeout));
        }
        Ok(())
    }

    async fn open(&self, timeout: Duration) -> Result<Box<dyn Connection>, BrokerError> {
        TcpConnector.connect(&self.addr, timeout).await.map_err(|err| {
            tracing::warn!(addr = %self.addr, error = %err, "membership service unreachable");
            self.timed_out(timeout)
        })
    }
}

#[async_trait]
impl MembershipService for TcpMembership {
    async fn connect(&self, timeout: Duration) -> Result<(), BrokerError> {
        let conn = self.open(timeout).await?;
        *self.session.lock().await = Some(conn);
        Ok(())
    }

    async fn register(&self, registration: &Registration, timeout: Duration) -> Result<(), BrokerError> {
        self.send(&MembershipMessage::Register(registration.clone()), timeout)
            .await
    }

    async fn deregister(&self, node: NodeId, timeout: Duration) -> Result<(), BrokerError> {
        let result = self
            .send(&MembershipMessage::Deregister { node_id: node }, timeout)
            .await;
        self.disconnect().await;
        result
    }

    async fn disconnect(&self) {
        if let Some(mut conn) = self.session.lock().await.take() {
            conn.close().await;
            tracing::debug!(addr = %self.addr, "membership session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::frame::{self, ACK};
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn registration() -> Registration {
        Registration {
            node_id: 4,
            control_addr: "127.0.0.1:9093".to_string(),
        }
    }

    #[tokio::test]
    async fn static_membership_tracks_registered_nodes() {
        let membership = StaticMembership::new();
        membership.connect(Duration::from_millis(10)).await.unwrap();
        membership
            .register(&registration(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(membership.members().get(&4).map(String::as_str), Some("127.0.0.1:9093"));
        membership.deregister(4, Duration::from_millis(10)).await.unwrap();
        assert!(membership.members().is_empty());
    }

    #[tokio::test]
    async fn static_membership_times_out_when_not_accepting() {
        let membership = StaticMembership::new();
        membership.set_accepting(false);
        let err = membership
            .register(&registration(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DependencyTimeout);
    }

    #[tokio::test]
    async fn static_membership_deregister_times_out_when_unreachable() {
        let membership = StaticMembership::new();
        membership
            .register(&registration(), Duration::from_millis(10))
            .await
            .unwrap();
        membership.set_reachable(false);
        let started = std::time::Instant::now();
        let err = membership.deregister(4, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::DependencyTimeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(membership.members().contains_key(&4));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_membership_disconnect_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            frame::read_frame(&mut stream).await.unwrap()
        });

        let membership = TcpMembership::new(addr);
        membership.connect(Duration::from_secs(5)).await.unwrap();
        membership.disconnect().await;
        let eof = time::timeout(Duration::from_secs(2), peer).await.unwrap().unwrap();
        assert!(eof.is_none());
        membership.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_membership_round_trips_through_acking_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(payload)) = frame::read_frame(&mut stream).await {
                let message: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                sink.lock().unwrap().push(message["type"].as_str().unwrap().to_string());
                stream.write_all(&[ACK]).await.unwrap();
            }
        });

        let membership = TcpMembership::new(addr);
        membership.connect(Duration::from_secs(5)).await.unwrap();
        membership
            .register(&registration(), Duration::from_secs(5))
            .await
            .unwrap();
        membership.deregister(4, Duration::from_secs(5)).await.unwrap();
        assert_eq!(*received.lock().unwrap(), vec!["register", "deregister"]);
    }

    #[tokio::test]
    async fn tcp_membership_unreachable_is_dependency_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpMembership::new(addr)
            .connect(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::DependencyTimeout);
    }
}
