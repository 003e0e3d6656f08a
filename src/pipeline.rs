//! Ingestion Pipeline
//!
//! Entry point gluing the stages together: accept a collector record,
//! persist it, evaluate the detection rules, materialize anomalies, and
//! notify subscribers. The event write and everything after it are
//! decoupled stages; once a record is committed it stays committed no
//! matter what detection or notification does.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Config;
use crate::detector;
use crate::engine::{self, StoreQuery};
use crate::error::PipelineResult;
use crate::explain::{ExplanationProvider, HttpExplanationProvider, NullExplanationProvider};
use crate::model::{IncomingRecord, LogEvent, LogType, Severity};
use crate::notify::{AnomalySummary, Notifier};
use crate::store::Store;
use crate::trackers::{AttackTracker, PacketSample, StreamAlert};

/// Messages shorter than this are collector noise and are dropped.
const MIN_MESSAGE_CHARS: usize = 10;

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    store: Arc<Store>,
    provider: Box<dyn ExplanationProvider>,
    notifier: Arc<Notifier>,
    tracker: AttackTracker,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        provider: Box<dyn ExplanationProvider>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            tracker: AttackTracker::new(),
        }
    }

    /// Wire the pipeline from configuration. With no explanation endpoint
    /// configured, every anomaly gets the locally synthesized explanation.
    pub fn from_config(config: &Config, store: Arc<Store>, notifier: Arc<Notifier>) -> Self {
        let provider: Box<dyn ExplanationProvider> = if config.explain_api_url.is_empty() {
            Box::new(NullExplanationProvider)
        } else {
            Box::new(HttpExplanationProvider::new(
                &config.explain_api_url,
                Duration::from_secs(config.explain_timeout_secs),
            ))
        };
        Self::new(store, provider, notifier)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Ingest one collector record.
    ///
    /// Returns `Ok(None)` for records dropped as noise (blank or
    /// too-short messages); the caller sees no error because the drop is
    /// intentional. The stored event carries a server-side timestamp and
    /// a normalized severity, whatever the collector claimed.
    pub fn ingest(&self, record: &IncomingRecord) -> PipelineResult<Option<LogEvent>> {
        let message = record.message.trim();
        if message.chars().count() < MIN_MESSAGE_CHARS {
            log::debug!(
                "dropping noise record from {} ({} chars)",
                record.endpoint_id,
                message.chars().count()
            );
            return Ok(None);
        }

        let event = self.store.insert_event(
            Utc::now(),
            &record.endpoint_id,
            &LogType::parse(&record.log_type),
            &record.source,
            Severity::normalize(&record.severity),
            message,
            record.raw_data.as_deref(),
        )?;

        if engine::should_analyze(&event) {
            self.detect(&event);
        }

        Ok(Some(event))
    }

    /// Rule evaluation and anomaly materialization for one stored event.
    /// Failures here are logged and swallowed; the write already stands.
    fn detect(&self, event: &LogEvent) {
        let query = StoreQuery::new(&self.store, Utc::now());

        for rule_match in engine::evaluate(event, &query) {
            match detector::create_anomaly(&self.store, self.provider.as_ref(), &rule_match, event)
            {
                Ok(Some(anomaly)) => {
                    let summary = AnomalySummary::from_anomaly(&anomaly, &event.endpoint_id);
                    self.notifier.broadcast(&event.endpoint_id, &summary);
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!(
                        "failed to materialize {} for event {}: {}",
                        rule_match.rule_id,
                        event.id,
                        e
                    );
                }
            }
        }
    }

    /// Feed one live network sample through the streaming trackers and
    /// ingest a synthesized network event for each alert that fired, so
    /// stream-level detections flow through the same store, rules, and
    /// notification path as collector records.
    pub fn observe_packet(&self, sample: &PacketSample) -> PipelineResult<Vec<LogEvent>> {
        let alerts = self.tracker.observe(sample, Utc::now());
        let mut events = Vec::with_capacity(alerts.len());

        for alert in alerts {
            let record = stream_alert_record(sample, alert);
            if let Some(event) = self.ingest(&record)? {
                events.push(event);
            }
        }

        Ok(events)
    }
}

fn stream_alert_record(sample: &PacketSample, alert: StreamAlert) -> IncomingRecord {
    let message = match alert {
        StreamAlert::PortScan => format!("Port scan detected from {}", sample.src_ip),
        StreamAlert::BruteForce => format!(
            "Repeated remote-access connection attempts from {}",
            sample.src_ip
        ),
        StreamAlert::Flood => format!("Packet flood detected from {}", sample.src_ip),
    };

    IncomingRecord {
        endpoint_id: sample.endpoint_id.clone(),
        log_type: "network".to_string(),
        source: "stream-tracker".to_string(),
        severity: "high".to_string(),
        message,
        raw_data: Some(format!(r#"{{"src_ip": "{}"}}"#, sample.src_ip)),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackers::PORT_SCAN_THRESHOLD;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Box::new(NullExplanationProvider),
            Arc::new(Notifier::new()),
        )
    }

    fn record(log_type: &str, severity: &str, message: &str) -> IncomingRecord {
        IncomingRecord {
            endpoint_id: "ep-1".to_string(),
            log_type: log_type.to_string(),
            source: "host-a".to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
            raw_data: None,
        }
    }

    #[test]
    fn test_short_messages_dropped_silently() {
        let p = pipeline();
        assert!(p.ingest(&record("auth", "low", "")).unwrap().is_none());
        assert!(p.ingest(&record("auth", "low", "   short  ")).unwrap().is_none());
        assert!(p.store().list_events(None, None, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_severity_normalized_and_timestamp_is_server_side() {
        let p = pipeline();
        let before = Utc::now();
        let event = p
            .ingest(&record("auth", "EXTREMELY_BAD", "Login failed for admin"))
            .unwrap()
            .unwrap();
        assert_eq!(event.severity, Severity::Low);
        assert!(event.timestamp >= before && event.timestamp <= Utc::now());
    }

    #[test]
    fn test_ingest_materializes_and_broadcasts_anomalies() {
        let p = pipeline();
        let sub = p.notifier().subscribe("ep-1");

        let event = p
            .ingest(&record("auth", "high", "Login failed for user admin"))
            .unwrap()
            .unwrap();

        let anomalies = p.store().list_anomalies().unwrap();
        assert!(!anomalies.is_empty());
        assert!(p.store().anomaly_exists("AUTH-001", event.id).unwrap());

        let summary = sub.receiver.try_recv().unwrap();
        assert_eq!(summary.endpoint_id, "ep-1");
    }

    #[test]
    fn test_resubmitted_event_creates_new_row_but_detection_dedups_per_event() {
        let p = pipeline();
        // Two identical submissions are two distinct events, each with its
        // own anomaly: dedup is per (rule, event), not per message text.
        p.ingest(&record("auth", "high", "Login failed for user admin"))
            .unwrap();
        p.ingest(&record("auth", "high", "Login failed for user admin"))
            .unwrap();
        assert_eq!(p.store().list_events(None, None, None, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_brute_force_fires_exactly_on_fifth_failure() {
        let p = pipeline();
        let mut rec = record("auth", "high", "Login failed for user admin");
        rec.raw_data = Some(r#"{"src_ip": "203.0.113.9"}"#.to_string());

        for _ in 0..5 {
            p.ingest(&rec).unwrap();
        }

        let brute = p
            .store()
            .list_anomalies()
            .unwrap()
            .into_iter()
            .filter(|a| a.anomaly_type == "brute_force_attempt")
            .collect::<Vec<_>>();
        assert_eq!(brute.len(), 1);
        assert_eq!(brute[0].risk_score, 85);

        // Linked to the fifth event, the one that crossed the threshold.
        let events = p.store().list_events(None, None, None, 10).unwrap();
        let last_id = events.iter().map(|e| e.id).max().unwrap();
        assert_eq!(p.store().linked_event_ids(&brute[0].id).unwrap(), vec![last_id]);
    }

    #[test]
    fn test_low_severity_network_noise_not_analyzed() {
        let p = pipeline();
        p.ingest(&record("network", "low", "Routine scan of printer subnet"))
            .unwrap();
        assert!(p.store().list_anomalies().unwrap().is_empty());
    }

    #[test]
    fn test_system_metrics_never_create_anomalies() {
        let p = pipeline();
        p.ingest(&record(
            "system_metrics",
            "critical",
            "cpu=99 attack malware breach",
        ))
        .unwrap();
        assert!(p.store().list_anomalies().unwrap().is_empty());
    }

    #[test]
    fn test_stream_alert_flows_into_store_and_rules() {
        let p = pipeline();
        let now_ports = 5000..5000 + PORT_SCAN_THRESHOLD as u16;
        let mut events = Vec::new();
        for port in now_ports {
            let sample = PacketSample {
                endpoint_id: "ep-1".to_string(),
                src_ip: "198.51.100.7".to_string(),
                dst_port: Some(port),
                size: None,
            };
            events.extend(p.observe_packet(&sample).unwrap());
        }

        // The scan alert landed as a stored network event and the rule
        // engine raised a port_scan anomaly from it.
        assert!(!events.is_empty());
        assert!(p
            .store()
            .list_anomalies()
            .unwrap()
            .iter()
            .any(|a| a.anomaly_type == "port_scan"));
    }
}
