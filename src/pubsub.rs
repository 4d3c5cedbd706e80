//! The pub/sub fan-out engine.
//!
//! Two inverted indexes (channel and glob pattern, each keeping subscribers
//! in subscription order) plus a bounded delivery queue per connection.
//! Internally everything is a structured [`PubSubMessage`]; the legacy wire
//! shape — a JSON triple null-padded to the frame boundary — is produced only
//! by [`PubSubMessage::to_wire`].
//!
//! Delivery is FIFO per subscriber. Publishers never block: when a
//! subscriber's queue is full the newest message is dropped for that
//! subscriber alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::glob::glob_match;
use crate::linked_list::{LinkedList, Topology};

/// Depth of each subscriber's outbound queue.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 128;

/// Wire frame granularity: messages are padded with null bytes up to the
/// next boundary, and readers trim trailing nulls before decoding.
pub const MESSAGE_FRAME: usize = 1024;

pub type PubSubSender = mpsc::Sender<PubSubMessage>;
pub type PubSubReceiver = mpsc::Receiver<PubSubMessage>;
pub type SharedPubSub = Arc<RwLock<PubSub>>;

pub fn subscriber_queue() -> (PubSubSender, PubSubReceiver) {
    mpsc::channel(SUBSCRIBER_QUEUE_DEPTH)
}

/// One message on a subscriber's queue: a subscription confirmation or a
/// published payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// `subscribe`, `unsubscribe`, `psubscribe`, `punsubscribe`, `message`,
    /// or `pmessage`.
    pub event: String,
    /// The channel (or, for pattern events, the pattern).
    pub target: String,
    /// Confirmation index or message payload.
    pub body: String,
}

impl PubSubMessage {
    pub fn new(event: &str, target: &str, body: impl Into<String>) -> Self {
        PubSubMessage {
            event: event.to_string(),
            target: target.to_string(),
            body: body.into(),
        }
    }

    /// The legacy wire form: `["event","target","body"]` padded with null
    /// bytes to the next [`MESSAGE_FRAME`] boundary.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = serde_json::to_vec(&[&self.event, &self.target, &self.body])
            .expect("message triple serializes");
        let mut pad = MESSAGE_FRAME - out.len() % MESSAGE_FRAME;
        if pad == 0 {
            pad = MESSAGE_FRAME;
        }
        out.resize(out.len() + pad, 0);
        out
    }
}

#[derive(Default)]
pub struct PubSub {
    channels: HashMap<String, LinkedList<u64>>,
    patterns: HashMap<String, LinkedList<u64>>,
    senders: HashMap<u64, PubSubSender>,
    conn_channels: HashMap<u64, HashSet<String>>,
    conn_patterns: HashMap<u64, HashSet<String>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    /// Subscribe `conn_id` to each channel, confirming each in argument
    /// order with its 1-based index.
    pub fn subscribe(&mut self, conn_id: u64, channels: &[String], sender: PubSubSender) {
        self.senders.entry(conn_id).or_insert_with(|| sender.clone());
        for (i, channel) in channels.iter().enumerate() {
            let subs = self
                .channels
                .entry(channel.clone())
                .or_insert_with(|| LinkedList::new(Topology::Linear));
            if !subs.contains(&conn_id) {
                subs.add(conn_id);
            }
            self.conn_channels
                .entry(conn_id)
                .or_default()
                .insert(channel.clone());
            self.push(conn_id, PubSubMessage::new("subscribe", channel, (i + 1).to_string()));
        }
    }

    pub fn psubscribe(&mut self, conn_id: u64, patterns: &[String], sender: PubSubSender) {
        self.senders.entry(conn_id).or_insert_with(|| sender.clone());
        for (i, pattern) in patterns.iter().enumerate() {
            let subs = self
                .patterns
                .entry(pattern.clone())
                .or_insert_with(|| LinkedList::new(Topology::Linear));
            if !subs.contains(&conn_id) {
                subs.add(conn_id);
            }
            self.conn_patterns
                .entry(conn_id)
                .or_default()
                .insert(pattern.clone());
            self.push(conn_id, PubSubMessage::new("psubscribe", pattern, (i + 1).to_string()));
        }
    }

    /// Unsubscribe from the given channels, or from all of them when
    /// `channels` is empty.
    pub fn unsubscribe(&mut self, conn_id: u64, channels: &[String]) {
        let targets: Vec<String> = if channels.is_empty() {
            self.conn_channels
                .get(&conn_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            channels.to_vec()
        };

        for (i, channel) in targets.iter().enumerate() {
            self.drop_channel_link(conn_id, channel);
            self.push(conn_id, PubSubMessage::new("unsubscribe", channel, (i + 1).to_string()));
        }
        self.forget_if_idle(conn_id);
    }

    pub fn punsubscribe(&mut self, conn_id: u64, patterns: &[String]) {
        let targets: Vec<String> = if patterns.is_empty() {
            self.conn_patterns
                .get(&conn_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            patterns.to_vec()
        };

        for (i, pattern) in targets.iter().enumerate() {
            self.drop_pattern_link(conn_id, pattern);
            self.push(conn_id, PubSubMessage::new("punsubscribe", pattern, (i + 1).to_string()));
        }
        self.forget_if_idle(conn_id);
    }

    /// Fan a payload out to the channel's literal subscribers and to every
    /// connection whose pattern matches. Returns the number of deliveries
    /// attempted.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut delivered = 0;

        if let Some(subs) = self.channels.get(channel) {
            for &conn_id in subs.iter() {
                self.push(conn_id, PubSubMessage::new("message", channel, payload));
                delivered += 1;
            }
        }

        for (pattern, subs) in &self.patterns {
            if glob_match(pattern, channel) {
                for &conn_id in subs.iter() {
                    self.push(conn_id, PubSubMessage::new("pmessage", pattern, payload));
                    delivered += 1;
                }
            }
        }

        delivered
    }

    /// Remove every subscription for a disconnecting connection and drop its
    /// queue.
    pub fn remove_connection(&mut self, conn_id: u64) {
        if let Some(channels) = self.conn_channels.remove(&conn_id) {
            for channel in channels {
                if let Some(subs) = self.channels.get_mut(&channel) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        self.channels.remove(&channel);
                    }
                }
            }
        }
        if let Some(patterns) = self.conn_patterns.remove(&conn_id) {
            for pattern in patterns {
                if let Some(subs) = self.patterns.get_mut(&pattern) {
                    subs.remove(&conn_id);
                    if subs.is_empty() {
                        self.patterns.remove(&pattern);
                    }
                }
            }
        }
        self.senders.remove(&conn_id);
    }

    /// Channel names with at least one subscriber, optionally filtered.
    pub fn channels_matching(&self, pattern: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .keys()
            .filter(|ch| pattern.is_none_or(|p| glob_match(p, ch)))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.values().map(|s| s.len()).sum()
    }

    fn push(&self, conn_id: u64, msg: PubSubMessage) {
        if let Some(sender) = self.senders.get(&conn_id) {
            if sender.try_send(msg).is_err() {
                // Queue full or receiver gone: drop for this subscriber only.
                debug!(conn_id, "subscriber queue full, dropping message");
            }
        }
    }

    fn drop_channel_link(&mut self, conn_id: u64, channel: &str) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                self.channels.remove(channel);
            }
        }
        if let Some(set) = self.conn_channels.get_mut(&conn_id) {
            set.remove(channel);
        }
    }

    fn drop_pattern_link(&mut self, conn_id: u64, pattern: &str) {
        if let Some(subs) = self.patterns.get_mut(pattern) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                self.patterns.remove(pattern);
            }
        }
        if let Some(set) = self.conn_patterns.get_mut(&conn_id) {
            set.remove(pattern);
        }
    }

    fn forget_if_idle(&mut self, conn_id: u64) {
        let idle = self.conn_channels.get(&conn_id).is_none_or(|s| s.is_empty())
            && self.conn_patterns.get(&conn_id).is_none_or(|s| s.is_empty());
        if idle {
            self.conn_channels.remove(&conn_id);
            self.conn_patterns.remove(&conn_id);
            self.senders.remove(&conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut PubSubReceiver) -> Vec<PubSubMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn subscribe_confirms_in_order() {
        let mut ps = PubSub::new();
        let (tx, mut rx) = subscriber_queue();
        ps.subscribe(1, &["a".into(), "b".into(), "c".into()], tx);

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], PubSubMessage::new("subscribe", "a", "1"));
        assert_eq!(msgs[1], PubSubMessage::new("subscribe", "b", "2"));
        assert_eq!(msgs[2], PubSubMessage::new("subscribe", "c", "3"));
    }

    #[test]
    fn publish_reaches_channel_and_pattern_subscribers() {
        let mut ps = PubSub::new();
        let (tx1, mut rx1) = subscriber_queue();
        let (tx2, mut rx2) = subscriber_queue();
        ps.subscribe(1, &["news.sports".into()], tx1);
        ps.psubscribe(2, &["news.*".into()], tx2);
        drain(&mut rx1);
        drain(&mut rx2);

        assert_eq!(ps.publish("news.sports", "goal"), 2);
        assert_eq!(
            drain(&mut rx1),
            vec![PubSubMessage::new("message", "news.sports", "goal")]
        );
        assert_eq!(
            drain(&mut rx2),
            vec![PubSubMessage::new("pmessage", "news.*", "goal")]
        );
    }

    #[test]
    fn per_subscriber_fifo() {
        let mut ps = PubSub::new();
        let (tx, mut rx) = subscriber_queue();
        ps.subscribe(1, &["c".into()], tx);
        drain(&mut rx);

        for i in 0..10 {
            ps.publish("c", &i.to_string());
        }
        let bodies: Vec<String> = drain(&mut rx).into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_drops_newest_for_slow_subscriber() {
        let mut ps = PubSub::new();
        let (slow_tx, mut slow_rx) = subscriber_queue();
        let (fast_tx, mut fast_rx) = subscriber_queue();
        ps.subscribe(1, &["c".into()], slow_tx);
        ps.subscribe(2, &["c".into()], fast_tx);
        drain(&mut slow_rx);

        // The slow subscriber never drains while publishes exceed its queue.
        // The fast one drains as it goes and misses nothing.
        for i in 0..SUBSCRIBER_QUEUE_DEPTH + 10 {
            ps.publish("c", &i.to_string());
            let _ = fast_rx.try_recv();
        }

        let slow: Vec<String> = drain(&mut slow_rx).into_iter().map(|m| m.body).collect();
        assert_eq!(slow.len(), SUBSCRIBER_QUEUE_DEPTH);
        // Drop-newest: what survives is the oldest prefix, in order.
        let expected: Vec<String> = (0..SUBSCRIBER_QUEUE_DEPTH).map(|i| i.to_string()).collect();
        assert_eq!(slow, expected);
        // Anything still queued for the fast subscriber is only the tail it
        // had not yet drained; nothing was dropped for it.
        assert!(drain(&mut fast_rx).len() <= SUBSCRIBER_QUEUE_DEPTH);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut ps = PubSub::new();
        let (tx, mut rx) = subscriber_queue();
        ps.subscribe(7, &["a".into(), "b".into()], tx);
        drain(&mut rx);

        ps.unsubscribe(7, &["a".into()]);
        assert_eq!(
            drain(&mut rx),
            vec![PubSubMessage::new("unsubscribe", "a", "1")]
        );
        assert_eq!(ps.publish("a", "x"), 0);
        assert_eq!(ps.publish("b", "y"), 1);
    }

    #[test]
    fn disconnect_cleans_every_index() {
        let mut ps = PubSub::new();
        let (tx, _rx) = subscriber_queue();
        ps.subscribe(3, &["a".into()], tx.clone());
        ps.psubscribe(3, &["b.*".into()], tx);

        ps.remove_connection(3);
        assert_eq!(ps.publish("a", "x"), 0);
        assert_eq!(ps.publish("b.1", "y"), 0);
        assert!(ps.channels_matching(None).is_empty());
        assert_eq!(ps.pattern_count(), 0);
    }

    #[test]
    fn wire_form_is_null_padded_json() {
        let msg = PubSubMessage::new("message", "a", "hello");
        let wire = msg.to_wire();
        assert_eq!(wire.len(), MESSAGE_FRAME);

        let trimmed: Vec<u8> = wire.into_iter().take_while(|&b| b != 0).collect();
        let decoded: Vec<String> = serde_json::from_slice(&trimmed).unwrap();
        assert_eq!(decoded, vec!["message", "a", "hello"]);
    }
}
