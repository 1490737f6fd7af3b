use audit_chain_domain::DecisionContent;
use audit_chain_gateway::GatewayError;
use serde_json::json;
use tracing::warn;

/// Metadata key recording that a decision took the degraded path.
pub const FALLBACK_KEY: &str = "fallback";

/// Confidence multiplier applied to decisions made without external data.
pub const FALLBACK_CONFIDENCE_FACTOR: f64 = 0.5;

/// Degrade `content` after a gateway failure. The returned content carries a
/// `fallback` entry describing the failure and a reduced confidence, so the
/// degraded path is part of the hashed decision.
#[must_use]
pub fn fallback_content<E: std::fmt::Display>(
    content: DecisionContent,
    err: &GatewayError<E>,
) -> DecisionContent {
    warn!(kind = err.kind(), error = %err, "recording fallback decision");
    let confidence = (content.confidence * FALLBACK_CONFIDENCE_FACTOR).clamp(0.0, 1.0);
    let original_confidence = content.confidence;
    let mut degraded = content.with_metadata(
        FALLBACK_KEY,
        json!({
            "reason": err.kind(),
            "error": err.to_string(),
            "original_confidence": original_confidence,
        }),
    );
    degraded.confidence = confidence;
    degraded
}

/// Use the gateway value when the call succeeded, otherwise degrade `content`.
pub fn resolve_with_fallback<T, E: std::fmt::Display>(
    result: Result<T, GatewayError<E>>,
    content: DecisionContent,
    apply: impl FnOnce(DecisionContent, T) -> DecisionContent,
) -> DecisionContent {
    match result {
        Ok(value) => apply(content, value),
        Err(err) => fallback_content(content, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_chain_gateway::{GatewayConfig, ResilientGateway};
    use std::time::Duration;

    #[test]
    fn open_circuit_halves_confidence_and_records_reason() {
        let err: GatewayError<String> = GatewayError::CircuitOpen {
            gateway: "permits".to_string(),
            retry_after: Duration::from_secs(12),
        };
        let degraded = fallback_content(DecisionContent::new("approved", 0.8), &err);
        assert!((degraded.confidence - 0.4).abs() < f64::EPSILON);
        let fallback = match degraded.metadata.get(FALLBACK_KEY) {
            Some(value) => value,
            None => panic!("fallback metadata must be recorded"),
        };
        assert_eq!(fallback["reason"], "circuit_open");
        assert_eq!(fallback["original_confidence"], 0.8);
        assert!(degraded.validate().is_ok());
    }

    #[test]
    fn successful_call_is_applied_without_fallback() {
        let content = resolve_with_fallback(
            Ok::<_, GatewayError<String>>("B00123"),
            DecisionContent::new("approved", 0.9),
            |content, permit| content.with_metadata("permit", json!(permit)),
        );
        assert!(content.metadata.get(FALLBACK_KEY).is_none());
        assert_eq!(content.metadata["permit"], "B00123");
        assert!((content.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_gateway_degrades_the_decision() {
        let gateway = ResilientGateway::new(
            "permits",
            GatewayConfig {
                max_attempts: 2,
                ..GatewayConfig::default()
            },
        );
        let result = gateway
            .call(|| async { Err::<String, _>("permit portal unavailable".to_string()) })
            .await;

        let content = resolve_with_fallback(
            result,
            DecisionContent::new("approved", 0.6),
            |content, permit| content.with_metadata("permit", json!(permit)),
        );
        assert!((content.confidence - 0.3).abs() < 1e-12);
        assert_eq!(content.metadata[FALLBACK_KEY]["reason"], "retries_exhausted");
        let error = content.metadata[FALLBACK_KEY]["error"]
            .as_str()
            .unwrap_or_default();
        assert!(error.contains("permit portal unavailable"), "{error}");
        assert_eq!(gateway.metrics().failed_calls, 1);
    }
}
