use serde::Serialize;

/// Structured error body, designed for agents rather than humans.
/// Every error carries enough information for an agent to understand
/// what went wrong and how to fix it.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. "validation_failed", "session_expired")
    pub error: String,
    /// Human/agent-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
    /// Structured context for deterministic remediation (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Error codes used across the staged tool surface.
///
/// `SESSION_EXPIRED` deliberately covers expired, unknown, foreign-owner,
/// wrong-kind, and malformed session ids: callers must not be able to tell
/// those cases apart. `ACCESS_DENIED` likewise never distinguishes
/// "not found" from "forbidden".
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const SESSION_MISMATCH: &str = "session_mismatch";
    pub const BULK_LIMIT_EXCEEDED: &str = "bulk_limit_exceeded";
    pub const EXECUTION_FAILED: &str = "execution_failed";
}
