//! Failure diagnosis for operators.
//!
//! Turns a raw delivery failure into a category, a plain-language
//! explanation, and concrete guidance. Status codes are authoritative when
//! present; otherwise the error text is pattern-matched. The categories
//! feed status output and the reconnect flow, not the retry state machine.

use serde::Serialize;

use crate::error::DeliveryError;

/// Category of a diagnosed delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credential present but rejected (HTTP 401).
    AuthInvalid,
    /// Credential lacks permission for the endpoint (HTTP 403).
    AuthMissing,
    /// The endpoint no longer exists (HTTP 404).
    EndpointGone,
    /// The target is throttling us (HTTP 429).
    RateLimited,
    /// Server-side failure at the target (HTTP 5xx).
    TargetError,
    /// Could not reach the target at all.
    Unreachable,
    /// The attempt timed out.
    Timeout,
    /// The binding names an auth header but no credential is stored.
    AuthNotConfigured,
    /// Anything we could not classify.
    Unknown,
}

impl ErrorCategory {
    /// Stable string form used in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthInvalid => "auth_invalid",
            Self::AuthMissing => "auth_missing",
            Self::EndpointGone => "endpoint_gone",
            Self::RateLimited => "rate_limited",
            Self::TargetError => "target_error",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::AuthNotConfigured => "auth_not_configured",
            Self::Unknown => "unknown",
        }
    }
}

/// A diagnosed delivery failure, ready to show an operator.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDiagnosis {
    /// Failure category.
    pub category: ErrorCategory,
    /// What went wrong, in plain language.
    pub user_message: String,
    /// What the operator should do about it.
    pub guidance: String,
    /// What is at risk while this persists, when delivery is actually
    /// blocked. Rate limits and 5xx heal on their own, so they carry none.
    pub risk_summary: Option<String>,
}

/// Diagnoses a classified delivery error.
pub fn diagnose(error: &DeliveryError, source_name: &str, endpoint_name: &str) -> ErrorDiagnosis {
    diagnose_error(error.status_code(), &error.to_string(), source_name, endpoint_name)
}

/// Diagnoses a failure from its status code and error text. Used for
/// failures replayed out of the retry log, where only text survives.
pub fn diagnose_error(
    status_code: Option<u16>,
    error_text: &str,
    source_name: &str,
    endpoint_name: &str,
) -> ErrorDiagnosis {
    match status_code {
        Some(401) => ErrorDiagnosis {
            category: ErrorCategory::AuthInvalid,
            user_message: format!(
                "{endpoint_name} rejected the credential for {source_name} deliveries"
            ),
            guidance: "The stored credential is invalid or expired. Update it and reconnect the target.".to_string(),
            risk_summary: Some(format!("{source_name} deliveries are parked until reauthorized")),
        },
        Some(403) => ErrorDiagnosis {
            category: ErrorCategory::AuthMissing,
            user_message: format!(
                "{endpoint_name} refused {source_name} deliveries: insufficient permission"
            ),
            guidance: "The credential works but lacks access to this endpoint. Check its scopes or permissions.".to_string(),
            risk_summary: Some(format!("{source_name} deliveries are parked until access is granted")),
        },
        Some(404) => ErrorDiagnosis {
            category: ErrorCategory::EndpointGone,
            user_message: format!("{endpoint_name} no longer exists"),
            guidance: "The endpoint was moved or deleted. Update the binding's URL or remove the binding.".to_string(),
            risk_summary: Some(format!(
                "{source_name} deliveries to {endpoint_name} will keep failing"
            )),
        },
        Some(429) => ErrorDiagnosis {
            category: ErrorCategory::RateLimited,
            user_message: format!("{endpoint_name} is rate limiting deliveries"),
            guidance: "Deliveries will retry automatically with backoff. No action needed unless it persists.".to_string(),
            risk_summary: None,
        },
        Some(code) if code >= 500 => ErrorDiagnosis {
            category: ErrorCategory::TargetError,
            user_message: format!("{endpoint_name} returned a server error (HTTP {code})"),
            guidance: "The target is having trouble. Deliveries will retry automatically.".to_string(),
            risk_summary: None,
        },
        _ => diagnose_from_text(error_text, source_name, endpoint_name),
    }
}

fn diagnose_from_text(error_text: &str, source_name: &str, endpoint_name: &str) -> ErrorDiagnosis {
    let lower = error_text.to_lowercase();

    if lower.contains("connection refused") || lower.contains("connection reset") {
        ErrorDiagnosis {
            category: ErrorCategory::Unreachable,
            user_message: format!("Could not reach {endpoint_name}"),
            guidance: "Check that the target is running and the endpoint URL is correct.".to_string(),
            risk_summary: Some(format!(
                "{source_name} deliveries are queued and will retry"
            )),
        }
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorDiagnosis {
            category: ErrorCategory::Timeout,
            user_message: format!("{endpoint_name} did not respond in time"),
            guidance: "The target may be overloaded. Deliveries will retry automatically.".to_string(),
            risk_summary: None,
        }
    } else if lower.contains("no credential") || lower.contains("credential not found") {
        ErrorDiagnosis {
            category: ErrorCategory::AuthNotConfigured,
            user_message: format!(
                "The {source_name} binding requires auth but no credential is stored"
            ),
            guidance: "Store a credential for this binding, then replay the failed items.".to_string(),
            risk_summary: Some(format!("{source_name} deliveries cannot proceed")),
        }
    } else {
        ErrorDiagnosis {
            category: ErrorCategory::Unknown,
            user_message: format!("{source_name} delivery to {endpoint_name} failed: {error_text}"),
            guidance: "Check the retry history for details; the delivery will retry automatically.".to_string(),
            risk_summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: Option<u16>, text: &str) -> ErrorDiagnosis {
        diagnose_error(status, text, "stats", "alerts-channel")
    }

    #[test]
    fn status_codes_map_to_categories() {
        assert_eq!(run(Some(401), "").category, ErrorCategory::AuthInvalid);
        assert_eq!(run(Some(403), "").category, ErrorCategory::AuthMissing);
        assert_eq!(run(Some(404), "").category, ErrorCategory::EndpointGone);
        assert_eq!(run(Some(429), "").category, ErrorCategory::RateLimited);
        assert_eq!(run(Some(500), "").category, ErrorCategory::TargetError);
        assert_eq!(run(Some(503), "").category, ErrorCategory::TargetError);
    }

    #[test]
    fn text_patterns_cover_statusless_failures() {
        assert_eq!(
            run(None, "network error: connection refused").category,
            ErrorCategory::Unreachable
        );
        assert_eq!(run(None, "delivery timeout after 30s").category, ErrorCategory::Timeout);
        assert_eq!(
            run(None, "configuration error: no credential stored for binding").category,
            ErrorCategory::AuthNotConfigured
        );
        assert_eq!(run(None, "something strange").category, ErrorCategory::Unknown);
    }

    #[test]
    fn status_wins_over_text() {
        let diagnosis = run(Some(401), "connection refused");
        assert_eq!(diagnosis.category, ErrorCategory::AuthInvalid);
    }

    #[test]
    fn self_healing_failures_carry_no_risk() {
        assert!(run(Some(429), "").risk_summary.is_none());
        assert!(run(Some(500), "").risk_summary.is_none());
        assert!(run(None, "timed out").risk_summary.is_none());
        assert!(run(Some(401), "").risk_summary.is_some());
    }

    #[test]
    fn classified_errors_diagnose_directly() {
        let err = DeliveryError::endpoint_rejected(404, "gone");
        let diagnosis = diagnose(&err, "stats", "alerts-channel");
        assert_eq!(diagnosis.category, ErrorCategory::EndpointGone);
    }

    #[test]
    fn messages_name_the_source_and_endpoint() {
        let diagnosis = run(Some(401), "");
        assert!(diagnosis.user_message.contains("alerts-channel"));
        assert!(diagnosis.user_message.contains("stats"));
    }
}
