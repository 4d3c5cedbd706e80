//! The consensus node: a single-writer worker task owning the replicated log.
//!
//! Each node runs one worker that serializes every log interaction, so the
//! log needs no locks. The leader appends, fans committed entries out to the
//! registered peers over in-process channels, applies, and answers the
//! proposer; followers append and apply in log order. Leadership is fixed at
//! spawn (a bootstrapped node leads, a joined node follows) — elections and
//! the networked transport live outside this crate, behind the same handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Applier, ApplyRecord, ApplyResponse};
use crate::error::{MurexError, MurexResult};

const NODE_MAILBOX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

enum NodeMsg {
    Propose {
        data: Vec<u8>,
        respond: oneshot::Sender<MurexResult<ApplyResponse>>,
    },
    Replicate {
        prev_index: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AddPeer {
        tx: mpsc::Sender<NodeMsg>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running consensus node.
#[derive(Clone)]
pub struct RaftHandle {
    pub node_id: String,
    tx: mpsc::Sender<NodeMsg>,
    leader: Arc<AtomicBool>,
}

impl RaftHandle {
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Submit an entry and wait for its application, bounded by `timeout`.
    pub async fn propose(&self, data: Vec<u8>, timeout: Duration) -> MurexResult<ApplyResponse> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(NodeMsg::Propose { data, respond })
            .await
            .map_err(|_| MurexError::generic("consensus node is shut down"))?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(MurexError::ProposalTimeout),
            Ok(Err(_)) => Err(MurexError::generic("consensus node dropped the proposal")),
            Ok(Ok(result)) => result,
        }
    }

    /// Register another node to receive this node's committed entries.
    pub async fn add_peer(&self, peer: &RaftHandle) {
        let _ = self
            .tx
            .send(NodeMsg::AddPeer {
                tx: peer.tx.clone(),
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(NodeMsg::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start a consensus node. The applier executes each committed record
/// against this node's local state.
pub fn spawn_node(node_id: impl Into<String>, role: Role, applier: Applier) -> RaftHandle {
    let node_id = node_id.into();
    let (tx, rx) = mpsc::channel(NODE_MAILBOX);
    let leader = Arc::new(AtomicBool::new(role == Role::Leader));

    let worker = Worker {
        node_id: node_id.clone(),
        term: 1,
        log: Vec::new(),
        commit_index: 0,
        last_applied: 0,
        peers: Vec::new(),
        leader: Arc::clone(&leader),
        applier,
        rx,
    };
    info!(node_id, ?role, "consensus node started");
    tokio::spawn(worker.run());

    RaftHandle {
        node_id,
        tx,
        leader,
    }
}

struct Worker {
    node_id: String,
    term: u64,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    peers: Vec<mpsc::Sender<NodeMsg>>,
    leader: Arc<AtomicBool>,
    applier: Applier,
    rx: mpsc::Receiver<NodeMsg>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                NodeMsg::Propose { data, respond } => {
                    let result = self.propose(data).await;
                    let _ = respond.send(result);
                }
                NodeMsg::Replicate {
                    prev_index,
                    entries,
                    leader_commit,
                } => {
                    self.replicate(prev_index, entries, leader_commit).await;
                }
                NodeMsg::AddPeer { tx } => self.peers.push(tx),
                NodeMsg::Shutdown { done } => {
                    info!(node_id = self.node_id, "consensus node stopping");
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    async fn propose(&mut self, data: Vec<u8>) -> MurexResult<ApplyResponse> {
        if !self.leader.load(Ordering::Acquire) {
            return Err(MurexError::NotLeader);
        }

        let entry = LogEntry {
            term: self.term,
            index: self.log.len() as u64 + 1,
            data,
        };
        self.log.push(entry.clone());

        // In-process channels neither drop nor reorder, so an entry is
        // committed once every peer has it queued.
        for peer in &self.peers {
            let _ = peer
                .send(NodeMsg::Replicate {
                    prev_index: entry.index - 1,
                    entries: vec![entry.clone()],
                    leader_commit: entry.index,
                })
                .await;
        }
        self.commit_index = entry.index;
        debug!(
            node_id = self.node_id,
            index = entry.index,
            "entry committed"
        );

        Ok(self.apply_committed().await)
    }

    async fn replicate(&mut self, prev_index: u64, entries: Vec<LogEntry>, leader_commit: u64) {
        if prev_index != self.log.len() as u64 {
            warn!(
                node_id = self.node_id,
                prev_index,
                local = self.log.len(),
                "log mismatch, dropping replicated entries"
            );
            return;
        }
        self.log.extend(entries);
        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(self.log.len() as u64);
        }
        self.apply_committed().await;
    }

    /// Apply every committed-but-unapplied entry in order; the last entry's
    /// response answers the proposer.
    async fn apply_committed(&mut self) -> ApplyResponse {
        let mut last = ApplyResponse::default();
        while self.last_applied < self.commit_index {
            let entry = &self.log[self.last_applied as usize];
            last = match serde_json::from_slice::<ApplyRecord>(&entry.data) {
                Ok(record) => (self.applier)(record).await,
                Err(e) => ApplyResponse {
                    response: Vec::new(),
                    error: Some(format!("could not decode log entry: {e}")),
                },
            };
            self.last_applied += 1;
        }
        last
    }
}
