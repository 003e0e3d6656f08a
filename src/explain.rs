//! Explanation Provider Boundary
//!
//! The provider is an external service that turns raw signals into a
//! human-readable rationale. It can time out, fail, or return partial
//! data; every path through this module ends in a usable explanation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{
    Evidence, Explanation, FlaggedSignal, PreventiveMeasure, RemediationStep,
};
use crate::store::LogExcerpt;

/// Maximum related log excerpts sent with one request.
pub const MAX_LOG_EXCERPTS: usize = 10;

/// Maximum characters per excerpt message.
pub const EXCERPT_MAX_LEN: usize = 200;

/// Risk score at or above which remediation and prevention sections are
/// mandatory, whatever the provider returned.
pub const REMEDIATION_REQUIRED_RISK: u8 = 70;

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyMeta {
    pub id: String,
    pub anomaly_type: String,
    pub risk_score: u8,
    pub detected_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub name: String,
    pub value: String,
}

/// Full request payload for one explanation call.
#[derive(Debug, Clone, Serialize)]
pub struct ExplainRequest {
    pub anomaly: AnomalyMeta,
    pub entities: BTreeMap<String, String>,
    pub signals: Vec<Signal>,
    pub logs: Vec<LogExcerpt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
}

impl ExplainRequest {
    pub fn new(anomaly: AnomalyMeta, signals: &BTreeMap<String, String>) -> Self {
        Self {
            anomaly,
            entities: BTreeMap::new(),
            signals: signals
                .iter()
                .map(|(name, value)| Signal {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            logs: Vec::new(),
            baseline: None,
        }
    }

    pub fn with_entity(mut self, key: &str, value: &str) -> Self {
        self.entities.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_logs(mut self, mut logs: Vec<LogExcerpt>) -> Self {
        logs.truncate(MAX_LOG_EXCERPTS);
        self.logs = logs;
        self
    }

    pub fn with_baseline(mut self, note: &str) -> Self {
        self.baseline = Some(note.to_string());
        self
    }
}

/// Provider-side response. Fields are optional on purpose: anything the
/// provider omits is filled in locally.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplainResponse {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
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
// PROVIDER TRAIT
// ============================================================================

/// External collaborator: `explain(anomaly, signals, logs) -> explanation`.
pub trait ExplanationProvider: Send + Sync {
    fn explain(&self, request: &ExplainRequest) -> Result<ExplainResponse, String>;
}

/// HTTP provider with a hard timeout budget per call.
pub struct HttpExplanationProvider {
    agent: ureq::Agent,
    url: String,
}

impl HttpExplanationProvider {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .build();
        Self {
            agent,
            url: url.to_string(),
        }
    }
}

impl ExplanationProvider for HttpExplanationProvider {
    fn explain(&self, request: &ExplainRequest) -> Result<ExplainResponse, String> {
        if self.url.is_empty() {
            return Err("no explanation endpoint configured".to_string());
        }
        let body = serde_json::to_value(request).map_err(|e| e.to_string())?;
        let response = self
            .agent
            .post(&self.url)
            .send_json(body)
            .map_err(|e| format!("explanation request failed: {}", e))?;
        response
            .into_json::<ExplainResponse>()
            .map_err(|e| format!("malformed explanation response: {}", e))
    }
}

/// Provider that always fails; used when no endpoint is configured and in
/// tests of the fallback path.
pub struct NullExplanationProvider;

impl ExplanationProvider for NullExplanationProvider {
    fn explain(&self, _request: &ExplainRequest) -> Result<ExplainResponse, String> {
        Err("explanation provider disabled".to_string())
    }
}

// ============================================================================
// FALLBACK SYNTHESIS
// ============================================================================

/// Deterministic explanation built purely from the raw signals. Used when
/// the provider fails outright.
pub fn fallback_explanation(
    signals: &BTreeMap<String, String>,
    source_log_type: &str,
) -> Explanation {
    Explanation {
        summary: "Suspicious activity detected by rule-based engine".to_string(),
        confidence: 0.7,
        why_flagged: signals
            .iter()
            .map(|(k, v)| FlaggedSignal {
                signal: k.clone(),
                explanation: v.clone(),
                severity: "high".to_string(),
            })
            .collect(),
        remediation_steps: default_remediation(),
        preventive_measures: default_prevention(),
        evidence: vec![Evidence {
            kind: "log".to_string(),
            source: source_log_type.to_string(),
            description: "Rule-based anomaly triggered".to_string(),
        }],
    }
}

fn default_remediation() -> Vec<RemediationStep> {
    vec![
        RemediationStep {
            step: 1,
            action: "Review the affected endpoint and verify the activity".to_string(),
            reason: "Confirm whether the detected behavior is authorized".to_string(),
        },
        RemediationStep {
            step: 2,
            action: "Inspect related logs and network connections".to_string(),
            reason: "Identify potential lateral movement or misuse".to_string(),
        },
    ]
}

fn default_prevention() -> Vec<PreventiveMeasure> {
    vec![
        PreventiveMeasure {
            control: "Network monitoring".to_string(),
            purpose: "Detect abnormal internal traffic patterns".to_string(),
        },
        PreventiveMeasure {
            control: "Least privilege enforcement".to_string(),
            purpose: "Reduce the impact of compromised accounts".to_string(),
        },
    ]
}

/// Merge a provider response into a complete explanation, filling every
/// missing section from the signals, then enforce the high-risk floor:
/// at `REMEDIATION_REQUIRED_RISK` and above the record must carry at least
/// one remediation step and one preventive measure.
pub fn finalize_explanation(
    response: ExplainResponse,
    signals: &BTreeMap<String, String>,
    source_log_type: &str,
    risk_score: u8,
) -> Explanation {
    let fallback = fallback_explanation(signals, source_log_type);

    let mut explanation = Explanation {
        summary: response
            .summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(fallback.summary),
        confidence: response.confidence.unwrap_or(0.6),
        why_flagged: if response.why_flagged.is_empty() {
            fallback.why_flagged
        } else {
            response.why_flagged
        },
        remediation_steps: response.remediation_steps,
        preventive_measures: response.preventive_measures,
        evidence: if response.evidence.is_empty() {
            fallback.evidence
        } else {
            response.evidence
        },
    };

    if explanation.remediation_steps.is_empty() && risk_score >= REMEDIATION_REQUIRED_RISK {
        explanation.remediation_steps = default_remediation();
    }
    if explanation.preventive_measures.is_empty() && risk_score >= REMEDIATION_REQUIRED_RISK {
        explanation.preventive_measures = default_prevention();
    }

    explanation
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> BTreeMap<String, String> {
        let mut s = BTreeMap::new();
        s.insert("rule_id".to_string(), "AUTH-002".to_string());
        s.insert("message".to_string(), "Login failed".to_string());
        s.insert("ip".to_string(), "203.0.113.7".to_string());
        s
    }

    #[test]
    fn test_fallback_is_never_empty() {
        let exp = fallback_explanation(&signals(), "auth");
        assert!(!exp.summary.is_empty());
        assert_eq!(exp.why_flagged.len(), 3);
        assert!(!exp.remediation_steps.is_empty());
        assert!(!exp.preventive_measures.is_empty());
        assert!(!exp.evidence.is_empty());
    }

    #[test]
    fn test_finalize_fills_missing_sections() {
        let partial = ExplainResponse {
            summary: Some("Burst of failed logins from one address".to_string()),
            confidence: Some(0.9),
            ..Default::default()
        };
        let exp = finalize_explanation(partial, &signals(), "auth", 85);
        assert_eq!(exp.summary, "Burst of failed logins from one address");
        assert!(!exp.why_flagged.is_empty());
        // High risk: mandatory remediation + prevention even though the
        // provider sent none.
        assert!(!exp.remediation_steps.is_empty());
        assert!(!exp.preventive_measures.is_empty());
    }

    #[test]
    fn test_finalize_low_risk_allows_empty_remediation() {
        let exp = finalize_explanation(ExplainResponse::default(), &signals(), "usb", 20);
        assert!(exp.remediation_steps.is_empty());
        assert!(exp.preventive_measures.is_empty());
        assert!(!exp.summary.is_empty());
        assert!(!exp.why_flagged.is_empty());
    }

    #[test]
    fn test_blank_summary_replaced() {
        let blank = ExplainResponse {
            summary: Some("   ".to_string()),
            ..Default::default()
        };
        let exp = finalize_explanation(blank, &signals(), "auth", 40);
        assert_eq!(exp.summary, "Suspicious activity detected by rule-based engine");
    }

    #[test]
    fn test_request_truncates_log_excerpts() {
        let logs: Vec<LogExcerpt> = (0..25)
            .map(|i| LogExcerpt {
                timestamp: chrono::Utc::now(),
                source: "host-a".to_string(),
                message: format!("event {}", i),
            })
            .collect();
        let req = ExplainRequest::new(
            AnomalyMeta {
                id: "anom_abc".to_string(),
                anomaly_type: "brute_force_attempt".to_string(),
                risk_score: 85,
                detected_at: chrono::Utc::now().to_rfc3339(),
            },
            &signals(),
        )
        .with_logs(logs);
        assert_eq!(req.logs.len(), MAX_LOG_EXCERPTS);
    }

    #[test]
    fn test_null_provider_fails() {
        let req = ExplainRequest::new(
            AnomalyMeta {
                id: "anom_abc".to_string(),
                anomaly_type: "auth_failure".to_string(),
                risk_score: 40,
                detected_at: chrono::Utc::now().to_rfc3339(),
            },
            &signals(),
        );
        assert!(NullExplanationProvider.explain(&req).is_err());
    }
}
