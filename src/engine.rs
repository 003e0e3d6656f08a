//! Rule Engine
//!
//! Runs the rule library against one committed event. Evaluation order is
//! registration order; a single event may trigger several rules, and a
//! failing predicate never aborts the remaining ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::error::PipelineResult;
use crate::model::{LogEvent, LogType, Severity};
use crate::rules::{registry, EventQuery, RuleDef};
use crate::store::Store;

// ============================================================================
// PRE-FILTER
// ============================================================================

/// Should the rule engine look at this event at all?
///
/// Known-benign high-volume categories are suppressed before any rule is
/// dispatched: informational network/process chatter and routine USB
/// insertions. This bounds engine load, it is not a detection decision.
pub fn should_analyze(event: &LogEvent) -> bool {
    match event.log_type {
        LogType::Network => event.severity > Severity::Low,
        LogType::Usb => event.severity > Severity::Medium,
        LogType::Other(ref kind) if kind == "process" => event.severity > Severity::Low,
        _ => true,
    }
}

// ============================================================================
// STORE-BACKED QUERY
// ============================================================================

/// `EventQuery` over the live store with the evaluation instant frozen,
/// so every rule in one evaluation sees identical window boundaries.
pub struct StoreQuery<'a> {
    store: &'a Store,
    now: DateTime<Utc>,
}

impl<'a> StoreQuery<'a> {
    pub fn new(store: &'a Store, now: DateTime<Utc>) -> Self {
        Self { store, now }
    }
}

impl EventQuery for StoreQuery<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn count_recent(
        &self,
        log_type: Option<&LogType>,
        endpoint_id: &str,
        src_ip: Option<&str>,
        window: Duration,
    ) -> PipelineResult<u64> {
        self.store
            .count_recent(log_type, endpoint_id, src_ip, self.now, window)
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

/// One rule that matched an event, with the signal snapshot the anomaly
/// will be explained from.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: &'static str,
    pub anomaly_type: &'static str,
    pub risk_score: u8,
    pub signals: BTreeMap<String, String>,
}

/// Evaluate every applicable rule against one event.
///
/// `system_metrics` events are excluded here, once, before any rule is
/// consulted; they are periodic telemetry, never security-relevant on
/// their own.
pub fn evaluate(event: &LogEvent, query: &dyn EventQuery) -> Vec<RuleMatch> {
    if event.log_type == LogType::SystemMetrics {
        return Vec::new();
    }

    let mut matches = Vec::new();

    for rule in registry() {
        if let Some(filter) = &rule.log_type {
            if *filter != event.log_type {
                continue;
            }
        }

        match (rule.predicate)(event, query) {
            Ok(true) => matches.push(RuleMatch {
                rule_id: rule.id,
                anomaly_type: rule.anomaly_type,
                risk_score: rule.risk_score,
                signals: signals_for(rule, event),
            }),
            Ok(false) => {}
            Err(e) => {
                log::warn!("rule {} failed on event {}: {}", rule.id, event.id, e);
            }
        }
    }

    matches
}

/// Signal snapshot captured at match time.
fn signals_for(rule: &RuleDef, event: &LogEvent) -> BTreeMap<String, String> {
    let mut signals = BTreeMap::new();
    signals.insert("rule_id".to_string(), rule.id.to_string());
    signals.insert("message".to_string(), event.message.clone());
    signals.insert("log_type".to_string(), event.log_type.as_str().to_string());
    signals.insert("timestamp".to_string(), event.timestamp.to_rfc3339());
    if let Some(ip) = event.src_ip() {
        signals.insert("ip".to_string(), ip);
    }
    if let Some(user) = event.user() {
        signals.insert("user".to_string(), user);
    }
    signals
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn event(log_type: LogType, severity: Severity, message: &str, raw: Option<&str>) -> LogEvent {
        LogEvent {
            id: 7,
            timestamp: Utc::now(),
            endpoint_id: "ep-1".to_string(),
            log_type,
            source: "host-a".to_string(),
            severity,
            message: message.to_string(),
            raw_data: raw.map(|s| s.to_string()),
        }
    }

    struct ZeroQuery;

    impl EventQuery for ZeroQuery {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn count_recent(
            &self,
            _log_type: Option<&LogType>,
            _endpoint_id: &str,
            _src_ip: Option<&str>,
            _window: Duration,
        ) -> PipelineResult<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_system_metrics_never_evaluated() {
        // Even a message full of threat keywords must not match anything.
        let e = event(
            LogType::SystemMetrics,
            Severity::Critical,
            "malware ransomware mimikatz backdoor",
            None,
        );
        assert!(evaluate(&e, &ZeroQuery).is_empty());
    }

    #[test]
    fn test_multiple_rules_fire_independently() {
        let e = event(
            LogType::Auth,
            Severity::High,
            "Login failed: bruteforce suspected",
            None,
        );
        let matches = evaluate(&e, &ZeroQuery);
        let ids: Vec<&str> = matches.iter().map(|m| m.rule_id).collect();
        // Stateless auth failure plus the generic keyword tier.
        assert!(ids.contains(&"AUTH-001"));
        assert!(ids.contains(&"GEN-001"));
    }

    #[test]
    fn test_log_type_filter_applies() {
        let e = event(LogType::Defender, Severity::High, "Login failed", None);
        let matches = evaluate(&e, &ZeroQuery);
        assert!(matches.iter().all(|m| m.rule_id != "AUTH-001"));
    }

    #[test]
    fn test_signals_snapshot() {
        let e = event(
            LogType::Auth,
            Severity::High,
            "Login failed",
            Some(r#"{"src_ip": "10.0.0.2", "user": "alice"}"#),
        );
        let matches = evaluate(&e, &ZeroQuery);
        let m = matches.iter().find(|m| m.rule_id == "AUTH-001").unwrap();
        assert_eq!(m.signals.get("rule_id").unwrap(), "AUTH-001");
        assert_eq!(m.signals.get("ip").unwrap(), "10.0.0.2");
        assert_eq!(m.signals.get("user").unwrap(), "alice");
        assert_eq!(m.signals.get("log_type").unwrap(), "auth");
    }

    #[test]
    fn test_should_analyze_suppresses_noise() {
        assert!(!should_analyze(&event(
            LogType::Network,
            Severity::Low,
            "Connection opened to CDN",
            None
        )));
        assert!(should_analyze(&event(
            LogType::Network,
            Severity::High,
            "Port scan detected",
            None
        )));
        assert!(!should_analyze(&event(
            LogType::Usb,
            Severity::Medium,
            "USB device connected",
            None
        )));
        assert!(should_analyze(&event(
            LogType::Usb,
            Severity::High,
            "USB device connected",
            None
        )));
        // Auth noise is never suppressed; windowed rules need the volume.
        assert!(should_analyze(&event(
            LogType::Auth,
            Severity::Low,
            "Login failed",
            None
        )));
    }
}
