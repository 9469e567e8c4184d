//! Subscription registry and publish-time fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::Event;
use crate::filter::MatcherSet;
use crate::message::ServerMsg;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// A subscription with the same id existed and was replaced.
    Replaced,
}

struct ConnState {
    sender: mpsc::Sender<ServerMsg>,
    subs: HashMap<String, MatcherSet>,
}

/// Maps connections to their live subscriptions and delivery channels.
///
/// `publish` serializes the whole fan-out under one lock, which is what
/// gives subscribers a single global order of live deliveries.
pub struct Router {
    conns: Mutex<HashMap<String, ConnState>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a connection's delivery channel. Called once per connection
    /// before any subscribe.
    pub fn register(&self, conn_id: &str, sender: mpsc::Sender<ServerMsg>) {
        let mut conns = self.conns.lock().expect("router lock");
        conns.insert(
            conn_id.to_string(),
            ConnState {
                sender,
                subs: HashMap::new(),
            },
        );
    }

    /// Insert or replace the named subscription.
    ///
    /// The matcher set is taken as-is: counters already advanced by a
    /// historical replay keep counting toward the subscription's limits.
    pub fn subscribe(
        &self,
        conn_id: &str,
        sub_id: &str,
        matchers: MatcherSet,
    ) -> Result<SubscribeOutcome, RouterError> {
        let mut conns = self.conns.lock().expect("router lock");
        let conn = conns
            .get_mut(conn_id)
            .ok_or_else(|| RouterError::UnknownConnection(conn_id.to_string()))?;
        let replaced = conn.subs.insert(sub_id.to_string(), matchers);
        Ok(if replaced.is_some() {
            SubscribeOutcome::Replaced
        } else {
            SubscribeOutcome::Subscribed
        })
    }

    pub fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> Result<(), RouterError> {
        let mut conns = self.conns.lock().expect("router lock");
        let conn = conns
            .get_mut(conn_id)
            .ok_or_else(|| RouterError::UnknownConnection(conn_id.to_string()))?;
        conn.subs
            .remove(sub_id)
            .map(|_| ())
            .ok_or_else(|| RouterError::UnknownSubscription(sub_id.to_string()))
    }

    /// Drop a connection and all of its subscriptions. Idempotent.
    pub fn delete(&self, conn_id: &str) {
        let mut conns = self.conns.lock().expect("router lock");
        conns.remove(conn_id);
    }

    /// Fan `event` out to every matching subscription.
    ///
    /// Deliveries are non-blocking: a full or closed channel drops the
    /// delivery for that subscription. A subscription whose matcher set
    /// completes is sent a final EOSE and removed.
    pub fn publish(&self, event: &Arc<Event>) {
        let mut conns = self.conns.lock().expect("router lock");
        for (conn_id, conn) in conns.iter_mut() {
            let ConnState { sender, subs } = conn;
            subs.retain(|sub_id, set| {
                if !set.count_match(event) {
                    return true;
                }
                let msg = ServerMsg::event(sub_id.clone(), event.clone());
                if sender.try_send(msg).is_err() {
                    debug!(%conn_id, %sub_id, event_id = %event.id, "dropped delivery");
                }
                if set.done() {
                    let _ = sender.try_send(ServerMsg::eose(sub_id.clone()));
                    debug!(%conn_id, %sub_id, "subscription exhausted its limits");
                    return false;
                }
                true
            });
        }
    }

    #[cfg(test)]
    fn subscription_count(&self, conn_id: &str) -> usize {
        let conns = self.conns.lock().expect("router lock");
        conns.get(conn_id).map_or(0, |c| c.subs.len())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use tokio::sync::mpsc::error::TryRecvError;

    fn event(id: &str, kind: u16, created_at: i64) -> Arc<Event> {
        Arc::new(Event {
            id: id.into(),
            pubkey: "pub1".into(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        })
    }

    fn kind_filter(kind: u16) -> Filter {
        Filter::from_value(&serde_json::json!({ "kinds": [kind] })).unwrap()
    }

    fn recv_event_ids(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<String> {
        let mut ids = vec![];
        while let Ok(msg) = rx.try_recv() {
            if let ServerMsg::Event { event, .. } = msg {
                ids.push(event.id.clone());
            }
        }
        ids
    }

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriptions() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(3);
        router.register("c1", tx);
        router
            .subscribe("c1", "s1", MatcherSet::new(vec![kind_filter(1)]))
            .unwrap();
        router.publish(&event("aa11", 1, 1));
        router.publish(&event("bb22", 2, 2));
        assert_eq!(recv_event_ids(&mut rx), vec!["aa11"]);
    }

    #[tokio::test]
    async fn subscribe_requires_registered_connection() {
        let router = Router::new();
        assert_eq!(
            router.subscribe("nope", "s1", MatcherSet::new(vec![])),
            Err(RouterError::UnknownConnection("nope".into()))
        );
    }

    #[tokio::test]
    async fn resubscribe_replaces_and_resets_counters() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(8);
        router.register("c1", tx);
        let limited = Filter::from_value(&serde_json::json!({"kinds":[1],"limit":10})).unwrap();
        router.subscribe("c1", "s1", MatcherSet::new(vec![limited.clone()])).unwrap();
        router.publish(&event("aa11", 1, 1));
        assert_eq!(
            router.subscribe("c1", "s1", MatcherSet::new(vec![limited])),
            Ok(SubscribeOutcome::Replaced)
        );
        router.publish(&event("bb22", 1, 2));
        assert_eq!(recv_event_ids(&mut rx), vec!["aa11", "bb22"]);
        assert_eq!(router.subscription_count("c1"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_missing_is_an_error() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(3);
        router.register("c1", tx);
        router.subscribe("c1", "s1", MatcherSet::new(vec![kind_filter(1)])).unwrap();
        assert!(router.unsubscribe("c1", "s1").is_ok());
        assert_eq!(
            router.unsubscribe("c1", "s1"),
            Err(RouterError::UnknownSubscription("s1".into()))
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let router = Router::new();
        let (tx, _rx) = mpsc::channel(3);
        router.register("c1", tx);
        router.subscribe("c1", "s1", MatcherSet::new(vec![kind_filter(1)])).unwrap();
        router.delete("c1");
        router.delete("c1");
        assert_eq!(
            router.subscribe("c1", "s2", MatcherSet::new(vec![])),
            Err(RouterError::UnknownConnection("c1".into()))
        );
    }

    #[tokio::test]
    async fn full_channel_drops_delivery_without_blocking() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(3);
        router.register("stalled", tx);
        let (tx2, mut rx2) = mpsc::channel(3);
        router.register("healthy", tx2);
        router.subscribe("stalled", "s", MatcherSet::new(vec![kind_filter(1)])).unwrap();
        router.subscribe("healthy", "s", MatcherSet::new(vec![kind_filter(1)])).unwrap();

        for i in 0..10 {
            router.publish(&event(&format!("id{i:02}"), 1, i));
            // healthy consumer keeps draining; stalled one never reads
            let _ = rx2.try_recv();
        }
        // the stalled channel holds only its first three deliveries
        assert_eq!(recv_event_ids(&mut rx), vec!["id00", "id01", "id02"]);
    }

    #[tokio::test]
    async fn exhausted_subscription_gets_eose_and_is_removed() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(8);
        router.register("c1", tx);
        let f = Filter::from_value(&serde_json::json!({"ids":["ab"],"limit":2})).unwrap();
        router.subscribe("c1", "s", MatcherSet::new(vec![f])).unwrap();

        router.publish(&event("ab01", 1, 1));
        router.publish(&event("ab02", 1, 2));
        router.publish(&event("ac03", 1, 3));
        router.publish(&event("ab04", 1, 4));

        let mut msgs = vec![];
        while let Ok(msg) = rx.try_recv() {
            msgs.push(serde_json::to_string(&msg).unwrap());
        }
        assert!(msgs[0].contains("ab01"));
        assert!(msgs[1].contains("ab02"));
        assert_eq!(msgs[2], r#"["EOSE","s"]"#);
        assert_eq!(msgs.len(), 3, "ab04 must not be delivered");
        assert_eq!(router.subscription_count("c1"), 0);
    }

    #[tokio::test]
    async fn closed_receiver_does_not_panic_publish() {
        let router = Router::new();
        let (tx, rx) = mpsc::channel(3);
        router.register("c1", tx);
        router.subscribe("c1", "s", MatcherSet::new(vec![kind_filter(1)])).unwrap();
        drop(rx);
        router.publish(&event("aa11", 1, 1));
    }

    #[tokio::test]
    async fn publish_preserves_order_per_subscription() {
        let router = Router::new();
        let (tx, mut rx) = mpsc::channel(8);
        router.register("c1", tx);
        router.subscribe("c1", "s", MatcherSet::new(vec![kind_filter(1)])).unwrap();
        for i in 0..5 {
            router.publish(&event(&format!("id{i}"), 1, i));
        }
        assert_eq!(
            recv_event_ids(&mut rx),
            vec!["id0", "id1", "id2", "id3", "id4"]
        );
        assert_eq!(rx.try_recv().err(), Some(TryRecvError::Empty));
    }
}
