//! Retry policy and error classification.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Label used when no classifier is set or the classifier gives up.
pub const DEFAULT_ERROR_TYPE: &str = "default";

/// Retry settings for one error type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Attempt ceiling for this error type (falls back to the job's).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64, multiplier: f64) -> Self {
        self.backoff_ms = Some(backoff_ms);
        self.backoff_multiplier = Some(multiplier);
        self
    }

    /// Delay before retry number `attempt` (1-based count for this error type).
    ///
    /// Exponential when the multiplier is finite and above 1, flat otherwise.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff_ms {
            Some(ms) if ms > 0 => ms as f64,
            _ => return Duration::ZERO,
        };
        let multiplier = self.backoff_multiplier.unwrap_or(1.0);
        if !multiplier.is_finite() || multiplier <= 1.0 {
            return Duration::from_millis(base as u64);
        }
        let exponent = attempt.saturating_sub(1) as i32;
        let ms = (base * multiplier.powi(exponent)).round();
        if ms.is_finite() && ms < u64::MAX as f64 {
            Duration::from_millis(ms as u64)
        } else {
            Duration::from_millis(u64::MAX)
        }
    }
}

/// Error-type label → policy, with an optional `default` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryStrategy {
    policies: BTreeMap<String, RetryPolicy>,
}

impl RetryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, error_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(error_type.into(), policy);
        self
    }

    pub fn with_default(self, policy: RetryPolicy) -> Self {
        self.with(DEFAULT_ERROR_TYPE, policy)
    }

    /// Specific entry, else the `default` entry.
    pub fn resolve(&self, error_type: &str) -> Option<&RetryPolicy> {
        self.policies
            .get(error_type)
            .or_else(|| self.policies.get(DEFAULT_ERROR_TYPE))
    }
}

/// Maps a worker failure to a retry label.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &anyhow::Error) -> String;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&anyhow::Error) -> String + Send + Sync,
{
    fn classify(&self, error: &anyhow::Error) -> String {
        self(error)
    }
}

/// Run a classifier, mapping an empty label or a panic to `default`.
pub(crate) fn classify(classifier: Option<&dyn ErrorClassifier>, error: &anyhow::Error) -> String {
    let Some(classifier) = classifier else {
        return DEFAULT_ERROR_TYPE.to_string();
    };
    match catch_unwind(AssertUnwindSafe(|| classifier.classify(error))) {
        Ok(label) if !label.trim().is_empty() => label,
        Ok(_) => DEFAULT_ERROR_TYPE.to_string(),
        Err(_) => {
            tracing::warn!(error = %error, "Error classifier panicked; using default");
            DEFAULT_ERROR_TYPE.to_string()
        }
    }
}

/// Whether the failure is tagged as a cancellation.
pub(crate) fn is_cancellation(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<JobError>()
        .is_some_and(JobError::is_cancellation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_backoff() {
        let policy = RetryPolicy::new(3).with_backoff(100, 1.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(4), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff() {
        let policy = RetryPolicy::new(5).with_backoff(100, 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn missing_or_invalid_backoff_is_zero() {
        assert_eq!(RetryPolicy::new(2).delay_for(1), Duration::ZERO);
        let nan = RetryPolicy {
            backoff_ms: Some(50),
            backoff_multiplier: Some(f64::NAN),
            ..Default::default()
        };
        assert_eq!(nan.delay_for(3), Duration::from_millis(50));
    }

    #[test]
    fn strategy_falls_back_to_default() {
        let strategy = RetryStrategy::new()
            .with("rate_limit", RetryPolicy::new(5))
            .with_default(RetryPolicy::new(2));
        assert_eq!(strategy.resolve("rate_limit").unwrap().max_attempts, Some(5));
        assert_eq!(strategy.resolve("timeout").unwrap().max_attempts, Some(2));
        assert!(RetryStrategy::new().resolve("x").is_none());
    }

    #[test]
    fn strategy_deserializes_from_map() {
        let strategy: RetryStrategy = serde_json::from_str(
            r#"{"default": {"maxAttempts": 3, "backoffMs": 10}, "network": {"maxAttempts": 5, "backoffMultiplier": 2}}"#,
        )
        .unwrap();
        let default = strategy.resolve("anything").unwrap();
        assert_eq!(default.max_attempts, Some(3));
        assert_eq!(default.backoff_ms, Some(10));
        assert_eq!(strategy.resolve("network").unwrap().backoff_multiplier, Some(2.0));
    }

    #[test]
    fn classify_handles_absent_empty_and_panicking() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(classify(None, &err), "default");

        let empty = |_: &anyhow::Error| String::new();
        assert_eq!(classify(Some(&empty), &err), "default");

        let panicking = |_: &anyhow::Error| -> String { panic!("classifier bug") };
        assert_eq!(classify(Some(&panicking), &err), "default");

        let network = |e: &anyhow::Error| {
            if e.to_string().contains("boom") { "network".to_string() } else { String::new() }
        };
        assert_eq!(classify(Some(&network), &err), "network");
    }

    #[test]
    fn cancellation_tag_is_detected() {
        let cancelled: anyhow::Error = JobError::Cancelled { id: uuid::Uuid::new_v4() }.into();
        assert!(is_cancellation(&cancelled));
        assert!(!is_cancellation(&anyhow::anyhow!("plain")));
    }
}
