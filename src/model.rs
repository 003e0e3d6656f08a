//! Core Data Model
//!
//! Immutable, timestamped log events plus the anomaly records the rule
//! engine materializes from them. Log events are append-only and never
//! modified after creation; only the retention sweep removes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// LOG TYPE
// ============================================================================

/// Telemetry categories produced by the collector agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogType {
    Auth,
    Network,
    File,
    System,
    Registry,
    Service,
    Task,
    Usb,
    Defender,
    SystemMetrics,
    /// Unknown categories are preserved verbatim so ingestion never
    /// rejects a record for its type.
    Other(String),
}

impl LogType {
    pub fn as_str(&self) -> &str {
        match self {
            LogType::Auth => "auth",
            LogType::Network => "network",
            LogType::File => "file",
            LogType::System => "system",
            LogType::Registry => "registry",
            LogType::Service => "service",
            LogType::Task => "task",
            LogType::Usb => "usb",
            LogType::Defender => "defender",
            LogType::SystemMetrics => "system_metrics",
            LogType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "auth" => LogType::Auth,
            "network" => LogType::Network,
            "file" => LogType::File,
            "system" => LogType::System,
            "registry" => LogType::Registry,
            "service" => LogType::Service,
            "task" => LogType::Task,
            "usb" => LogType::Usb,
            "defender" => LogType::Defender,
            "system_metrics" => LogType::SystemMetrics,
            other => LogType::Other(other.to_string()),
        }
    }
}

impl From<String> for LogType {
    fn from(s: String) -> Self {
        LogType::parse(&s)
    }
}

impl From<LogType> for String {
    fn from(t: LogType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SEVERITY
// ============================================================================

/// Severity reported by collectors. Anything outside the allowed set is
/// coerced to `Low` at the ingestion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Normalize collector input. Unrecognized values become `Low`.
    pub fn normalize(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LOG EVENT
// ============================================================================

/// One normalized telemetry record, as stored.
///
/// `endpoint_id` is the isolation key: every query that must not leak
/// across endpoints filters on it. `timestamp` is assigned at write time
/// and never taken from the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
    pub log_type: LogType,
    pub source: String,
    pub severity: Severity,
    pub message: String,
    pub raw_data: Option<String>,
}

impl LogEvent {
    /// Parse `raw_data` as a JSON object. Payload schemas vary per
    /// log_type, so failures collapse to an empty map.
    pub fn raw_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.raw_data
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Source IP from the raw payload (`src_ip`, falling back to `ip`).
    pub fn src_ip(&self) -> Option<String> {
        let data = self.raw_json();
        data.get("src_ip")
            .or_else(|| data.get("ip"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Destination IP from the raw payload.
    pub fn dst_ip(&self) -> Option<String> {
        self.raw_json()
            .get("dst_ip")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// User field from the raw payload.
    pub fn user(&self) -> Option<String> {
        self.raw_json()
            .get("user")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Validated record handed over by the ingestion gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRecord {
    pub endpoint_id: String,
    pub log_type: String,
    pub source: String,
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub raw_data: Option<String>,
}

// ============================================================================
// ANOMALY
// ============================================================================

/// Lifecycle state of an anomaly. `Active` on creation, mutated only via
/// explicit operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    Active,
    Investigating,
    Resolved,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::Active => "active",
            AnomalyStatus::Investigating => "investigating",
            AnomalyStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AnomalyStatus::Active),
            "investigating" => Some(AnomalyStatus::Investigating),
            "resolved" => Some(AnomalyStatus::Resolved),
            _ => None,
        }
    }
}

/// A materialized, deduplicated security finding.
///
/// Anomalies are evidentiary records: they are never deleted by the
/// retention sweep and outlive the raw telemetry that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub anomaly_type: String,
    pub status: AnomalyStatus,
    pub risk_score: u8,
    /// The log_type that triggered the rule.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub explanation: Explanation,
}

/// Allocate an anomaly id in the `anom_<12 hex>` format.
pub fn new_anomaly_id() -> String {
    format!("anom_{}", &Uuid::new_v4().simple().to_string()[..12])
}

// ============================================================================
// EXPLANATION
// ============================================================================

/// One signal that contributed to the finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlaggedSignal {
    pub signal: String,
    pub explanation: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationStep {
    pub step: u32,
    pub action: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreventiveMeasure {
    pub control: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub description: String,
}

/// Structured rationale stored with every anomaly.
///
/// Always non-empty: when the provider times out or returns partial data,
/// the missing sections are synthesized from the raw signals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Explanation {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub why_flagged: Vec<FlaggedSignal>,
    #[serde(default)]
    pub remediation_steps: Vec<RemediationStep>,
    #[serde(default)]
    pub preventive_measures: Vec<PreventiveMeasure>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

// ============================================================================
// TESTS
// ============================================================================
