use std::sync::atomic::{AtomicU64, Ordering};

use crate::pubsub::PubSubSender;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one client session: a monotonically assigned numeric id, the
/// `serverID-N` name that travels in replication records, and the handle to
/// the connection's pub/sub delivery queue (absent on the apply path).
#[derive(Clone)]
pub struct ConnInfo {
    pub id: u64,
    pub name: String,
    pub pubsub_tx: Option<PubSubSender>,
}

impl ConnInfo {
    pub fn next(server_id: &str, pubsub_tx: Option<PubSubSender>) -> Self {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        ConnInfo {
            id,
            name: format!("{server_id}-{id}"),
            pubsub_tx,
        }
    }

    /// An identity reconstructed from a replication record: the originating
    /// connection's name, no local delivery queue.
    pub fn replayed(name: &str) -> Self {
        ConnInfo {
            id: 0,
            name: name.to_string(),
            pubsub_tx: None,
        }
    }
}
