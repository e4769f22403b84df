//! Node-to-node message passing
//!
//! `Transport::send` is request/response with no delivery guarantee: a call
//! either returns the peer's reply or fails (unreachable, dropped, timed out).
//! Receivers register a `MessageHandler`; handlers must tolerate redelivery.

mod local;

pub use local::{LocalEndpoint, LocalNetwork};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ConsensusConfig;
use crate::consensus::{Message, Reply};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Request to {peer} timed out after {attempts} attempt(s)")]
    Timeout { peer: String, attempts: u32 },

    #[error("Transport closed")]
    Closed,
}

/// Outbound half, one per sending node.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &str, message: Message) -> Result<Reply, TransportError>;
}

/// Inbound half, installed with `on_receive`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: &str, message: Message) -> Reply;
}

/// Per-call timeout plus exponential backoff between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ConsensusConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.rpc_timeout_ms),
            max_retries: config.rpc_max_retries,
            backoff_base: Duration::from_millis(config.rpc_backoff_ms),
        }
    }

    /// Single attempt, used for heartbeats where the next tick is the retry.
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(10))
    }
}

/// Send with a per-attempt timeout, retrying timeouts and unreachable peers
/// with backoff. The request is cloned per attempt, so the receiver may see
/// it more than once.
pub async fn send_with_retry(
    transport: &Arc<dyn Transport>,
    target: &str,
    message: Message,
    policy: RetryPolicy,
) -> Result<Reply, TransportError> {
    let attempts = policy.max_retries + 1;
    let mut last_err = TransportError::Closed;
    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff(attempt - 1)).await;
        }
        match tokio::time::timeout(policy.timeout, transport.send(target, message.clone())).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(TransportError::Closed)) => return Err(TransportError::Closed),
            Ok(Err(e)) => last_err = e,
            Err(_) => {
                last_err = TransportError::Timeout {
                    peer: target.to_string(),
                    attempts: attempt + 1,
                }
            }
        }
        debug!(peer = %target, kind = message.kind(), attempt, error = %last_err, "RPC attempt failed");
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{RequestVote, VoteReply};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, target: &str, _message: Message) -> Result<Reply, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                // never answers; the caller's timeout fires
                std::future::pending::<()>().await;
            }
            let _ = target;
            Ok(Reply::Vote(VoteReply { term: 1, granted: true }))
        }
    }

    fn vote() -> Message {
        Message::RequestVote(RequestVote {
            term: 1,
            candidate_id: "n1".into(),
            last_log_index: 0,
            last_log_term: 0,
        })
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(20),
            max_retries,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let flaky = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 2 });
        let transport: Arc<dyn Transport> = flaky.clone();
        let reply = send_with_retry(&transport, "n2", vote(), policy(2)).await.unwrap();
        assert!(matches!(reply, Reply::Vote(VoteReply { granted: true, .. })));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_timeout() {
        let transport: Arc<dyn Transport> = Arc::new(Flaky { calls: AtomicU32::new(0), fail_first: 10 });
        let err = send_with_retry(&transport, "n2", vote(), policy(1)).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout { peer: "n2".into(), attempts: 2 });
    }
}
