//! Replication: the coupling between the dispatcher and the consensus log.
//!
//! A mutating command on a clustered node does not touch the keyspace
//! directly. The coupler wraps it in an [`ApplyRecord`] — originating server,
//! originating connection, the raw command vector, and the leader's clock —
//! marshals it as JSON, and submits it to the log with a bounded proposal
//! timeout. The apply path on every node decodes the record and executes the
//! command against local state; the leader forwards the apply result (bytes
//! or error, verbatim) back to the client.
//!
//! A non-leader answers with an explicit redirect error instead of
//! forwarding; clients retry against the leader.

pub mod raft;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MurexError, MurexResult};

pub use raft::{spawn_node, RaftHandle, Role};

/// Upper bound on one proposal, submission through application.
pub const PROPOSAL_TIMEOUT: Duration = Duration::from_millis(500);

/// The replication payload. Also the append-only-file entry shape at the
/// persistence seam.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyRecord {
    pub server_id: String,
    pub connection_id: String,
    pub cmd: Vec<String>,
    /// Leader clock at submission. Handlers evaluate TTLs against this so
    /// every replica makes the same decision.
    pub timestamp_ms: u64,
}

/// What applying one record produced: response bytes or an error, exactly
/// one of which reaches the client.
#[derive(Debug, Clone, Default)]
pub struct ApplyResponse {
    pub response: Vec<u8>,
    pub error: Option<String>,
}

/// Executes one decoded record against local state.
pub type Applier =
    Arc<dyn Fn(ApplyRecord) -> Pin<Box<dyn Future<Output = ApplyResponse> + Send>> + Send + Sync>;

/// Converts authorized mutating commands into totally ordered log entries
/// and waits for their application.
pub struct Replicator {
    raft: RaftHandle,
    server_id: String,
}

impl Replicator {
    pub fn new(raft: RaftHandle, server_id: impl Into<String>) -> Self {
        Replicator {
            raft,
            server_id: server_id.into(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// The underlying consensus handle, for peer wiring.
    pub fn handle(&self) -> &RaftHandle {
        &self.raft
    }

    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }

    /// Replicate one command and return the bytes the client should see.
    pub async fn execute(
        &self,
        connection_id: &str,
        cmd: &[String],
        now_ms: u64,
    ) -> MurexResult<Vec<u8>> {
        if !self.raft.is_leader() {
            return Err(MurexError::NotLeader);
        }

        let record = ApplyRecord {
            server_id: self.server_id.clone(),
            connection_id: connection_id.to_string(),
            cmd: cmd.to_vec(),
            timestamp_ms: now_ms,
        };
        let data = serde_json::to_vec(&record).map_err(|_| MurexError::ApplyEncode)?;

        let response = self.raft.propose(data, PROPOSAL_TIMEOUT).await?;
        match response.error {
            // Already rendered on the applying node; surfaced verbatim.
            Some(err) => Err(MurexError::Remote(err)),
            None => Ok(response.response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_applier() -> Applier {
        Arc::new(|record: ApplyRecord| {
            Box::pin(async move {
                ApplyResponse {
                    response: format!("+{}@{}\r\n", record.cmd.join(" "), record.connection_id)
                        .into_bytes(),
                    error: None,
                }
            })
        })
    }

    #[test]
    fn record_round_trips_as_json() {
        let record = ApplyRecord {
            server_id: "s1".to_string(),
            connection_id: "s1-7".to_string(),
            cmd: vec!["SET".to_string(), "k".to_string(), "v".to_string()],
            timestamp_ms: 12345,
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: ApplyRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn leader_coupler_returns_apply_bytes() {
        let raft = spawn_node("s1", Role::Leader, echo_applier());
        let coupler = Replicator::new(raft, "s1");

        let cmd = vec!["SET".to_string(), "k".to_string(), "v".to_string()];
        let bytes = coupler.execute("s1-7", &cmd, 1).await.unwrap();
        assert_eq!(bytes, b"+SET k v@s1-7\r\n");
        coupler.shutdown().await;
    }

    #[tokio::test]
    async fn follower_coupler_redirects() {
        let raft = spawn_node("s2", Role::Follower, echo_applier());
        let coupler = Replicator::new(raft, "s2");

        let cmd = vec!["SET".to_string(), "k".to_string(), "v".to_string()];
        let err = coupler.execute("s2-1", &cmd, 1).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error not cluster leader, cannot carry out command"
        );
        coupler.shutdown().await;
    }

    #[tokio::test]
    async fn apply_errors_surface_verbatim() {
        let applier: Applier = Arc::new(|_record| {
            Box::pin(async {
                ApplyResponse {
                    response: Vec::new(),
                    error: Some("Error no such key".to_string()),
                }
            })
        });
        let raft = spawn_node("s1", Role::Leader, applier);
        let coupler = Replicator::new(raft, "s1");

        let cmd = vec!["DEL".to_string(), "k".to_string()];
        let err = coupler.execute("s1-1", &cmd, 1).await.unwrap_err();
        assert_eq!(err.to_string(), "Error no such key");
        coupler.shutdown().await;
    }
}
