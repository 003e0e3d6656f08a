//! Anomaly Notifier
//!
//! Fan-out of freshly committed anomalies to subscribers keyed by endpoint
//! identity. Delivery is best-effort: a closed or saturated sink never
//! blocks or fails the ingestion path, and closed sinks are pruned on the
//! spot rather than retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::Anomaly;

/// Per-sink buffer; a subscriber that falls this far behind loses messages.
const SINK_CAPACITY: usize = 64;

// ============================================================================
// SUMMARY PAYLOAD
// ============================================================================

/// What subscribers receive for each new anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySummary {
    pub anomaly_id: String,
    pub anomaly_type: String,
    pub risk_score: u8,
    pub source: String,
    pub endpoint_id: String,
    pub created_at: DateTime<Utc>,
}

impl AnomalySummary {
    pub fn from_anomaly(anomaly: &Anomaly, endpoint_id: &str) -> Self {
        Self {
            anomaly_id: anomaly.id.clone(),
            anomaly_type: anomaly.anomaly_type.clone(),
            risk_score: anomaly.risk_score,
            source: anomaly.source.clone(),
            endpoint_id: endpoint_id.to_string(),
            created_at: anomaly.created_at,
        }
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

struct Sink {
    id: u64,
    tx: SyncSender<AnomalySummary>,
}

/// Live subscription handle. Dropping the handle (or the receiver) closes
/// the sink; the next broadcast for that endpoint prunes it.
pub struct Subscription {
    pub endpoint_id: String,
    sink_id: u64,
    pub receiver: Receiver<AnomalySummary>,
}

/// Subscription registry mapping endpoint identity to delivery sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: Mutex<HashMap<String, Vec<Sink>>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for one endpoint. The caller owns the receiving end.
    pub fn subscribe(&self, endpoint_id: &str) -> Subscription {
        let (tx, rx) = sync_channel(SINK_CAPACITY);
        let sink_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .lock()
            .entry(endpoint_id.to_string())
            .or_default()
            .push(Sink { id: sink_id, tx });
        Subscription {
            endpoint_id: endpoint_id.to_string(),
            sink_id,
            receiver: rx,
        }
    }

    /// Remove one subscription. Safe to call after the receiver is gone.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut sinks = self.sinks.lock();
        if let Some(list) = sinks.get_mut(&subscription.endpoint_id) {
            list.retain(|s| s.id != subscription.sink_id);
            if list.is_empty() {
                sinks.remove(&subscription.endpoint_id);
            }
        }
    }

    /// Deliver a summary to every sink registered under this endpoint,
    /// and only this endpoint. Disconnected sinks are dropped; a full sink
    /// keeps its place but loses this message.
    pub fn broadcast(&self, endpoint_id: &str, summary: &AnomalySummary) {
        let mut sinks = self.sinks.lock();
        let Some(list) = sinks.get_mut(endpoint_id) else {
            return;
        };

        list.retain(|sink| match sink.tx.try_send(summary.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("notifier sink {} for {} is full, dropping message", sink.id, endpoint_id);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("pruning closed notifier sink {} for {}", sink.id, endpoint_id);
                false
            }
        });

        if list.is_empty() {
            sinks.remove(endpoint_id);
        }
    }

    /// Number of live sinks for an endpoint (observability).
    pub fn subscriber_count(&self, endpoint_id: &str) -> usize {
        self.sinks.lock().get(endpoint_id).map(|l| l.len()).unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(endpoint_id: &str) -> AnomalySummary {
        AnomalySummary {
            anomaly_id: "anom_0123456789ab".to_string(),
            anomaly_type: "brute_force_attempt".to_string(),
            risk_score: 85,
            source: "auth".to_string(),
            endpoint_id: endpoint_id.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_broadcast_reaches_all_endpoint_sinks() {
        let notifier = Notifier::new();
        let sub_a = notifier.subscribe("ep-1");
        let sub_b = notifier.subscribe("ep-1");

        notifier.broadcast("ep-1", &summary("ep-1"));

        assert!(sub_a.receiver.try_recv().is_ok());
        assert!(sub_b.receiver.try_recv().is_ok());
    }

    #[test]
    fn test_endpoint_isolation() {
        let notifier = Notifier::new();
        let sub_a = notifier.subscribe("ep-1");
        let sub_b = notifier.subscribe("ep-2");

        notifier.broadcast("ep-1", &summary("ep-1"));

        assert!(sub_a.receiver.try_recv().is_ok());
        // A channel subscribed under ep-2 never sees ep-1 traffic.
        assert!(sub_b.receiver.try_recv().is_err());
    }

    #[test]
    fn test_closed_sink_is_pruned_not_fatal() {
        let notifier = Notifier::new();
        let sub = notifier.subscribe("ep-1");
        drop(sub.receiver);

        notifier.broadcast("ep-1", &summary("ep-1"));
        assert_eq!(notifier.subscriber_count("ep-1"), 0);

        // Broadcasting to a now-empty endpoint is still fine.
        notifier.broadcast("ep-1", &summary("ep-1"));
    }

    #[test]
    fn test_unsubscribe_removes_sink() {
        let notifier = Notifier::new();
        let sub = notifier.subscribe("ep-1");
        assert_eq!(notifier.subscriber_count("ep-1"), 1);
        notifier.unsubscribe(&sub);
        assert_eq!(notifier.subscriber_count("ep-1"), 0);
    }

    #[test]
    fn test_full_sink_drops_message_but_stays() {
        let notifier = Notifier::new();
        let sub = notifier.subscribe("ep-1");
        for _ in 0..SINK_CAPACITY + 10 {
            notifier.broadcast("ep-1", &summary("ep-1"));
        }
        // Sink survived the overflow and still has a full buffer.
        assert_eq!(notifier.subscriber_count("ep-1"), 1);
        let mut received = 0;
        while sub.receiver.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SINK_CAPACITY);
    }
}
