//! In-process network for simulation and tests.
//!
//! Supports removing nodes, isolating them (both directions), and random
//! message loss. A lost message never answers, so the caller's timeout fires
//! exactly as it would on a real lossy link.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use super::{MessageHandler, Transport, TransportError};
use crate::consensus::{Message, Reply};
use crate::types::NodeId;

#[derive(Default)]
struct LinkState {
    isolated: HashSet<NodeId>,
    drop_rate: f64,
}

pub struct LocalNetwork {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    links: RwLock<LinkState>,
    rng: Mutex<StdRng>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Arc<Self> {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            links: RwLock::new(LinkState::default()),
            rng: Mutex::new(rng),
        })
    }

    /// Sending half for `node_id`.
    pub fn endpoint(self: &Arc<Self>, node_id: &str) -> LocalEndpoint {
        LocalEndpoint {
            network: Arc::clone(self),
            from: node_id.to_string(),
        }
    }

    /// Install the receive handler for `node_id`, replacing any previous one.
    pub fn on_receive(&self, node_id: &str, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(node_id.to_string(), handler);
        }
    }

    /// Take a node off the network entirely.
    pub fn remove(&self, node_id: &str) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.remove(node_id);
        }
        info!(node = %node_id, "Node removed from network");
    }

    /// Cut every link to and from `node_id`.
    pub fn isolate(&self, node_id: &str) {
        if let Ok(mut links) = self.links.write() {
            links.isolated.insert(node_id.to_string());
        }
        info!(node = %node_id, "Node isolated");
    }

    pub fn heal(&self, node_id: &str) {
        if let Ok(mut links) = self.links.write() {
            links.isolated.remove(node_id);
        }
        info!(node = %node_id, "Node reconnected");
    }

    /// Probability in [0, 1] that any single message is lost.
    pub fn set_drop_rate(&self, rate: f64) {
        if let Ok(mut links) = self.links.write() {
            links.drop_rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn is_cut(&self, from: &str, to: &str) -> bool {
        self.links
            .read()
            .map(|l| l.isolated.contains(from) || l.isolated.contains(to))
            .unwrap_or(true)
    }

    fn should_drop(&self) -> bool {
        let rate = self.links.read().map(|l| l.drop_rate).unwrap_or(0.0);
        if rate <= 0.0 {
            return false;
        }
        self.rng.lock().map(|mut r| r.gen_bool(rate)).unwrap_or(false)
    }

    async fn deliver(&self, from: &str, to: &str, message: Message) -> Result<Reply, TransportError> {
        if self.is_cut(from, to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        let handler = self
            .handlers
            .read()
            .map_err(|_| TransportError::Closed)?
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))?;

        if self.should_drop() {
            debug!(from = %from, to = %to, kind = message.kind(), "Message dropped");
            std::future::pending::<()>().await;
        }
        let reply = handler.handle(from, message).await;

        // the reply travels the same link back
        if self.is_cut(from, to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        if self.should_drop() {
            std::future::pending::<()>().await;
        }
        Ok(reply)
    }
}

/// A node's view of the `LocalNetwork`.
#[derive(Clone)]
pub struct LocalEndpoint {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

#[async_trait]
impl Transport for LocalEndpoint {
    async fn send(&self, target: &str, message: Message) -> Result<Reply, TransportError> {
        self.network.deliver(&self.from, target, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{RequestVote, VoteReply};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, _from: &str, message: Message) -> Reply {
            match message {
                Message::RequestVote(rv) => Reply::Vote(VoteReply { term: rv.term, granted: true }),
                _ => Reply::Vote(VoteReply { term: 0, granted: false }),
            }
        }
    }

    fn vote() -> Message {
        Message::RequestVote(RequestVote {
            term: 3,
            candidate_id: "a".into(),
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    #[tokio::test]
    async fn test_delivery_and_isolation() {
        let net = LocalNetwork::seeded(1);
        net.on_receive("b", Arc::new(Echo));
        let a = net.endpoint("a");

        let reply = a.send("b", vote()).await.unwrap();
        assert_eq!(reply, Reply::Vote(VoteReply { term: 3, granted: true }));

        net.isolate("a");
        assert!(matches!(a.send("b", vote()).await, Err(TransportError::Unreachable(_))));
        net.heal("a");
        assert!(a.send("b", vote()).await.is_ok());

        net.remove("b");
        assert!(matches!(a.send("b", vote()).await, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_dropped_message_never_answers() {
        let net = LocalNetwork::seeded(7);
        net.on_receive("b", Arc::new(Echo));
        net.set_drop_rate(1.0);
        let a = net.endpoint("a");
        let r = tokio::time::timeout(Duration::from_millis(30), a.send("b", vote())).await;
        assert!(r.is_err());
    }
}
