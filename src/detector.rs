//! Anomaly Materialization
//!
//! Turns a rule match into a persisted anomaly exactly once per
//! (rule, triggering event) pair, with a structured explanation attached
//! before anything is notified.

use chrono::Utc;

use crate::engine::RuleMatch;
use crate::error::PipelineResult;
use crate::explain::{
    finalize_explanation, AnomalyMeta, ExplainRequest, ExplanationProvider, EXCERPT_MAX_LEN,
    MAX_LOG_EXCERPTS,
};
use crate::model::{new_anomaly_id, Anomaly, AnomalyStatus, LogEvent};
use crate::store::Store;

/// Materialize one rule match against its triggering event.
///
/// Returns `None` when an anomaly for this (rule, event) pair already
/// exists; duplicate submissions are a silent no-op. The provider call
/// happens before the insert; its failure is recovered locally with a
/// fallback and never bubbles up to the ingestion path.
pub fn create_anomaly(
    store: &Store,
    provider: &dyn ExplanationProvider,
    rule_match: &RuleMatch,
    event: &LogEvent,
) -> PipelineResult<Option<Anomaly>> {
    if store.anomaly_exists(rule_match.rule_id, event.id)? {
        return Ok(None);
    }

    let anomaly_id = new_anomaly_id();
    let created_at = Utc::now();

    let meta = AnomalyMeta {
        id: anomaly_id.clone(),
        anomaly_type: rule_match.anomaly_type.to_string(),
        risk_score: rule_match.risk_score,
        detected_at: created_at.to_rfc3339(),
    };

    let excerpts = store
        .recent_excerpts(&event.endpoint_id, MAX_LOG_EXCERPTS, EXCERPT_MAX_LEN)
        .unwrap_or_default();

    let request = ExplainRequest::new(meta, &rule_match.signals)
        .with_entity("source", event.log_type.as_str())
        .with_entity("endpoint_id", &event.endpoint_id)
        .with_entity("anomaly_type", rule_match.anomaly_type)
        .with_logs(excerpts)
        .with_baseline("Rule-based anomaly detection triggered");

    let explanation = match provider.explain(&request) {
        Ok(response) => finalize_explanation(
            response,
            &rule_match.signals,
            event.log_type.as_str(),
            rule_match.risk_score,
        ),
        Err(e) => {
            log::warn!(
                "explanation provider failed for {} ({}): {}",
                anomaly_id,
                rule_match.rule_id,
                e
            );
            crate::explain::fallback_explanation(&rule_match.signals, event.log_type.as_str())
        }
    };

    let anomaly = Anomaly {
        id: anomaly_id,
        anomaly_type: rule_match.anomaly_type.to_string(),
        status: AnomalyStatus::Active,
        risk_score: rule_match.risk_score,
        source: event.log_type.as_str().to_string(),
        created_at,
        resolved_at: None,
        explanation,
    };

    // Anomaly + event link commit together; a lost dedup race rolls both
    // back and reports a no-op.
    if !store.insert_anomaly(&anomaly, rule_match.rule_id, event.id)? {
        return Ok(None);
    }

    log::info!(
        "[{}] {} | risk={} endpoint={}",
        rule_match.rule_id,
        rule_match.anomaly_type,
        rule_match.risk_score,
        event.endpoint_id
    );

    Ok(Some(anomaly))
}

// ============================================================================
// TESTS
// ============================================================================
