//! Rule Library
//!
//! Tagged rule descriptors evaluated by the engine. Each predicate is a
//! pure function of the current event plus a read-only query capability
//! into the event store, which keeps every rule independently testable.
//!
//! Stateful rules count prior events inside a fixed trailing time window
//! anchored at the evaluation instant.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::error::PipelineResult;
use crate::model::{LogEvent, LogType};

// ============================================================================
// THRESHOLDS & WINDOWS
// ============================================================================

/// UTC hours considered normal for interactive logins (06:00-21:59).
/// Timestamps are stored in UTC and the check runs on the UTC hour.
pub const BUSINESS_HOURS: std::ops::Range<u32> = 6..22;

/// Failed-auth burst: this many auth events inside the window.
pub const BRUTE_FORCE_THRESHOLD: u64 = 5;
pub const BRUTE_FORCE_WINDOW_SECS: i64 = 120;

/// Success following a failure burst.
pub const SUCCESS_AFTER_FAILURE_THRESHOLD: u64 = 3;
pub const SUCCESS_AFTER_FAILURE_WINDOW_SECS: i64 = 300;

/// Connection flood from one source.
pub const CONNECTION_FLOOD_THRESHOLD: u64 = 100;
pub const CONNECTION_FLOOD_WINDOW_SECS: i64 = 60;

// ============================================================================
// INDICATOR SETS
// ============================================================================

/// Directories whose modification is security-relevant on Windows.
pub const WINDOWS_CRITICAL_PATHS: &[&str] = &[
    "c:\\windows\\system32",
    "c:\\windows\\syswow64",
    "c:\\windows\\system32\\drivers",
    "c:\\program files",
    "c:\\program files (x86)",
    "c:\\users\\public",
    "c:\\windows\\temp",
    "c:\\temp",
];

/// Extensions that indicate executable or script content.
pub const SENSITIVE_EXTENSIONS: &[&str] = &[".exe", ".dll", ".ps1", ".bat", ".vbs", ".js"];

/// Living-off-the-land binaries and command patterns.
pub const SUSPICIOUS_WINDOWS_COMMANDS: &[&str] = &[
    "powershell -enc",
    "frombase64string",
    "invoke-webrequest",
    "iex ",
    "certutil",
    "bitsadmin",
    "mshta",
    "wmic",
];

pub const GENERIC_THREAT_KEYWORDS: &[&str] = &[
    "malware",
    "exploit",
    "unauthorized",
    "bruteforce",
    "backdoor",
    "mimikatz",
    "credential dump",
    "lsass",
    "ransomware",
];

// ============================================================================
// QUERY CAPABILITY
// ============================================================================

/// Read-only view of the event store handed to predicates.
///
/// `now()` is fixed once per evaluation, so window boundaries stay
/// identical across every rule consulted for one event.
pub trait EventQuery {
    fn now(&self) -> DateTime<Utc>;

    /// Count events of `log_type` for `endpoint_id` inside the trailing
    /// `window`, optionally restricted to one source IP from the payload.
    fn count_recent(
        &self,
        log_type: Option<&LogType>,
        endpoint_id: &str,
        src_ip: Option<&str>,
        window: Duration,
    ) -> PipelineResult<u64>;
}

// ============================================================================
// RULE DESCRIPTOR
// ============================================================================

pub type RulePredicate = fn(&LogEvent, &dyn EventQuery) -> PipelineResult<bool>;

/// One detection rule: id, category, static risk score and an optional
/// log-type filter. `log_type: None` marks the generic tier, registered
/// last by convention.
pub struct RuleDef {
    pub id: &'static str,
    pub anomaly_type: &'static str,
    pub log_type: Option<LogType>,
    pub risk_score: u8,
    pub predicate: RulePredicate,
}

/// Built-in rules in registration (= evaluation) order.
pub fn registry() -> &'static [RuleDef] {
    &RULES
}

static RULES: [RuleDef; 16] = [
    // ---------------- AUTH ----------------
    RuleDef {
        id: "AUTH-001",
        anomaly_type: "auth_failure",
        log_type: Some(LogType::Auth),
        risk_score: 40,
        predicate: auth_failure,
    },
    RuleDef {
        id: "AUTH-002",
        anomaly_type: "brute_force_attempt",
        log_type: Some(LogType::Auth),
        risk_score: 85,
        predicate: brute_force_attempt,
    },
    RuleDef {
        id: "AUTH-003",
        anomaly_type: "success_after_failure",
        log_type: Some(LogType::Auth),
        risk_score: 95,
        predicate: success_after_failure,
    },
    RuleDef {
        id: "AUTH-004",
        anomaly_type: "login_outside_business_hours",
        log_type: Some(LogType::Auth),
        risk_score: 70,
        predicate: login_outside_business_hours,
    },
    // ---------------- NETWORK ----------------
    RuleDef {
        id: "NET-001",
        anomaly_type: "port_scan",
        log_type: Some(LogType::Network),
        risk_score: 80,
        predicate: port_scan,
    },
    RuleDef {
        id: "NET-002",
        anomaly_type: "connection_flood",
        log_type: Some(LogType::Network),
        risk_score: 85,
        predicate: connection_flood,
    },
    RuleDef {
        id: "NET-003",
        anomaly_type: "internal_lateral_movement",
        log_type: Some(LogType::Network),
        risk_score: 85,
        predicate: internal_lateral_movement,
    },
    // ---------------- FILE ----------------
    RuleDef {
        id: "FILE-WIN-001",
        anomaly_type: "executable_in_temp",
        log_type: Some(LogType::File),
        risk_score: 95,
        predicate: executable_in_temp,
    },
    RuleDef {
        id: "FILE-WIN-002",
        anomaly_type: "critical_path_executable",
        log_type: Some(LogType::File),
        risk_score: 85,
        predicate: critical_path_executable,
    },
    // ---------------- REGISTRY ----------------
    RuleDef {
        id: "REG-001",
        anomaly_type: "registry_run_key_persistence",
        log_type: Some(LogType::Registry),
        risk_score: 90,
        predicate: registry_run_key_persistence,
    },
    // ---------------- SCHEDULED TASK ----------------
    RuleDef {
        id: "TASK-001",
        anomaly_type: "scheduled_task_created",
        log_type: Some(LogType::Task),
        risk_score: 70,
        predicate: scheduled_task_created,
    },
    // ---------------- SERVICE ----------------
    RuleDef {
        id: "SERVICE-001",
        anomaly_type: "service_created_or_modified",
        log_type: Some(LogType::Service),
        risk_score: 75,
        predicate: service_created_or_modified,
    },
    // ---------------- USB ----------------
    RuleDef {
        id: "USB-001",
        anomaly_type: "usb_device_connected",
        log_type: Some(LogType::Usb),
        risk_score: 20,
        predicate: always,
    },
    // ---------------- DEFENDER ----------------
    RuleDef {
        id: "DEF-001",
        anomaly_type: "defender_disabled",
        log_type: Some(LogType::Defender),
        risk_score: 95,
        predicate: defender_disabled,
    },
    // ---------------- GENERIC (LAST TIER) ----------------
    RuleDef {
        id: "GEN-001",
        anomaly_type: "generic_threat_indicator",
        log_type: None,
        risk_score: 65,
        predicate: generic_threat_indicator,
    },
    RuleDef {
        id: "GEN-002",
        anomaly_type: "lolbin_command",
        log_type: None,
        risk_score: 75,
        predicate: lolbin_command,
    },
];

// ============================================================================
// PREDICATES
// ============================================================================

fn always(_event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(true)
}

fn auth_failure(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(event.message.to_lowercase().contains("failed"))
}

fn brute_force_attempt(event: &LogEvent, q: &dyn EventQuery) -> PipelineResult<bool> {
    let count = q.count_recent(
        Some(&LogType::Auth),
        &event.endpoint_id,
        event.src_ip().as_deref(),
        Duration::seconds(BRUTE_FORCE_WINDOW_SECS),
    )?;
    Ok(count >= BRUTE_FORCE_THRESHOLD)
}

fn success_after_failure(event: &LogEvent, q: &dyn EventQuery) -> PipelineResult<bool> {
    if !event.message.to_lowercase().contains("success") {
        return Ok(false);
    }
    let count = q.count_recent(
        Some(&LogType::Auth),
        &event.endpoint_id,
        event.src_ip().as_deref(),
        Duration::seconds(SUCCESS_AFTER_FAILURE_WINDOW_SECS),
    )?;
    Ok(count >= SUCCESS_AFTER_FAILURE_THRESHOLD)
}

fn login_outside_business_hours(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(!BUSINESS_HOURS.contains(&event.timestamp.hour()))
}

fn port_scan(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(event.message.to_lowercase().contains("scan"))
}

fn connection_flood(event: &LogEvent, q: &dyn EventQuery) -> PipelineResult<bool> {
    let Some(src_ip) = event.src_ip() else {
        return Ok(false);
    };
    let count = q.count_recent(
        Some(&LogType::Network),
        &event.endpoint_id,
        Some(&src_ip),
        Duration::seconds(CONNECTION_FLOOD_WINDOW_SECS),
    )?;
    Ok(count >= CONNECTION_FLOOD_THRESHOLD)
}

fn internal_lateral_movement(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    match (event.src_ip(), event.dst_ip()) {
        (Some(src), Some(dst)) => Ok(src.starts_with("10.") && dst.starts_with("10.")),
        _ => Ok(false),
    }
}

/// File path from the payload: a structured `path` field when the payload
/// is JSON, otherwise the raw text itself.
fn file_path_of(event: &LogEvent) -> Option<String> {
    let raw = event.raw_data.as_deref()?;
    let path = event
        .raw_json()
        .get("path")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw.trim().trim_matches('"').to_string());
    Some(path.to_lowercase())
}

fn executable_in_temp(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    let Some(path) = file_path_of(event) else {
        return Ok(false);
    };
    Ok(path.contains("\\temp\\") && SENSITIVE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)))
}

fn critical_path_executable(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    let Some(path) = file_path_of(event) else {
        return Ok(false);
    };
    Ok(WINDOWS_CRITICAL_PATHS.iter().any(|p| path.starts_with(p))
        && SENSITIVE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)))
}

fn raw_lower(event: &LogEvent) -> Option<String> {
    event.raw_data.as_deref().map(|s| s.to_lowercase())
}

fn registry_run_key_persistence(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(raw_lower(event)
        .map(|raw| raw.contains("\\run\\") || raw.contains("\\runonce\\"))
        .unwrap_or(false))
}

fn scheduled_task_created(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(raw_lower(event).map(|raw| raw.contains("create")).unwrap_or(false))
}

fn service_created_or_modified(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    Ok(raw_lower(event)
        .map(|raw| ["create", "config", "change"].iter().any(|k| raw.contains(k)))
        .unwrap_or(false))
}

fn defender_disabled(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    let msg = event.message.to_lowercase();
    Ok(msg.contains("disabled") || msg.contains("tamper"))
}

fn generic_threat_indicator(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    let msg = event.message.to_lowercase();
    Ok(GENERIC_THREAT_KEYWORDS.iter().any(|k| msg.contains(k)))
}

fn lolbin_command(event: &LogEvent, _q: &dyn EventQuery) -> PipelineResult<bool> {
    let msg = event.message.to_lowercase();
    let raw = raw_lower(event).unwrap_or_default();
    Ok(SUSPICIOUS_WINDOWS_COMMANDS
        .iter()
        .any(|c| msg.contains(c) || raw.contains(c)))
}

// ============================================================================
// TESTS
// ============================================================================
