//! In-process lease event hub.
//!
//! The local backend records what it does (exec started, exec finished,
//! manifest accepted) as [`LeaseEvent`]s. Subscribers get the retained
//! history of a lease and, when following, everything published afterwards.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::cluster::EventStream;
use crate::lease::LeaseId;
use crate::protocol::{LeaseEvent, LeaseEventObject};

/// Events kept per lease for late subscribers.
const HISTORY_PER_LEASE: usize = 128;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Recorded {
    lease: LeaseId,
    service: String,
    event: LeaseEvent,
}

impl Recorded {
    fn matches(&self, lease: &LeaseId, services: &[String]) -> bool {
        &self.lease == lease && (services.is_empty() || services.contains(&self.service))
    }
}

pub struct EventHub {
    history: Mutex<HashMap<LeaseId, VecDeque<Recorded>>>,
    tx: broadcast::Sender<Recorded>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Record a `Normal` event about `object` (a pod name) of `service`.
    pub async fn publish(&self, lease: &LeaseId, service: &str, object: &str, reason: &str, note: String) {
        let event = LeaseEvent {
            kind: "Normal".to_string(),
            reporting_controller: "leasegw".to_string(),
            reporting_instance: String::new(),
            time: now_millis(),
            reason: reason.to_string(),
            note,
            object: LeaseEventObject {
                kind: "Pod".to_string(),
                namespace: lease.route_path(),
                name: object.to_string(),
            },
        };
        let recorded = Recorded {
            lease: lease.clone(),
            service: service.to_string(),
            event,
        };
        let mut history = self.history.lock().await;
        let entries = history.entry(lease.clone()).or_default();
        if entries.len() == HISTORY_PER_LEASE {
            entries.pop_front();
        }
        entries.push_back(recorded.clone());
        // Sent under the lock so a subscriber never sees an event twice or
        // misses one between its snapshot and its subscription.
        let _ = self.tx.send(recorded);
    }

    pub async fn stream(&self, lease: &LeaseId, services: &[String], follow: bool) -> EventStream {
        let history = self.history.lock().await;
        let past: Vec<LeaseEvent> = history
            .get(lease)
            .into_iter()
            .flatten()
            .filter(|r| r.matches(lease, services))
            .map(|r| r.event.clone())
            .collect();
        if !follow {
            return stream::iter(past).boxed();
        }
        let rx = self.tx.subscribe();
        drop(history);

        let lease = lease.clone();
        let services = services.to_vec();
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(recorded) => return Some((recorded, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |recorded| {
            let keep = recorded.matches(&lease, &services);
            futures::future::ready(keep.then_some(recorded.event))
        });
        stream::iter(past).chain(live).boxed()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn lease(dseq: u64) -> LeaseId {
        LeaseId {
            owner: testutil::owner(1),
            dseq,
            gseq: 1,
            oseq: 1,
            provider: testutil::owner(9),
        }
    }

    #[tokio::test]
    async fn history_is_filtered_by_lease_and_service() {
        let hub = EventHub::new();
        hub.publish(&lease(1), "web", "web-0", "Started", "a".to_string()).await;
        hub.publish(&lease(1), "db", "db-0", "Started", "b".to_string()).await;
        hub.publish(&lease(2), "web", "web-0", "Started", "c".to_string()).await;

        let all: Vec<_> = hub.stream(&lease(1), &[], false).await.collect().await;
        assert_eq!(all.len(), 2);

        let web: Vec<_> = hub
            .stream(&lease(1), &["web".to_string()], false)
            .await
            .collect()
            .await;
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].note, "a");
        assert_eq!(web[0].object.name, "web-0");
        assert_eq!(web[0].object.namespace, "1/1/1");
    }

    #[tokio::test]
    async fn follow_sees_new_events() {
        let hub = EventHub::new();
        hub.publish(&lease(1), "web", "web-0", "Started", "first".to_string()).await;
        let mut events = hub.stream(&lease(1), &[], true).await;
        assert_eq!(events.next().await.unwrap().note, "first");

        hub.publish(&lease(2), "web", "web-0", "Started", "other".to_string()).await;
        hub.publish(&lease(1), "web", "web-0", "Completed", "second".to_string()).await;
        let next = events.next().await.unwrap();
        assert_eq!(next.note, "second");
        assert_eq!(next.reason, "Completed");
    }
}
