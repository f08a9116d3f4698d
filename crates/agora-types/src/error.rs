//! Error types for the Agora market
//!
//! Every rejection carries a reason string that automated callers can match
//! on. Capacity rejections, activity conflicts, timeouts and protocol
//! violations are distinct variants so callers never have to parse free text
//! to tell them apart.

use thiserror::Error;

/// Result type for market operations
pub type Result<T> = std::result::Result<T, MarketError>;

/// Message prefix used by every capacity rejection
pub const NO_CAPACITY: &str = "No capacity available";

/// Build the capacity rejection message for a provider with `limit` slots
pub fn capacity_reason(limit: usize) -> String {
    format!("{}. Reached Agreements limit: {}", NO_CAPACITY, limit)
}

/// Coarse classification of a [`MarketError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Capacity,
    ActivityConflict,
    Timeout,
    ProtocolViolation,
    NotFound,
    Payment,
    Invalid,
    Internal,
}

/// Market error types
#[derive(Debug, Clone, Error)]
pub enum MarketError {
    // ========================================================================
    // Admission Errors
    // ========================================================================

    /// Provider has no free agreement slot
    #[error("Provider {provider} rejected agreement. Reason: No capacity available. Reached Agreements limit: {limit}")]
    CapacityExceeded { provider: String, limit: usize },

    /// Agreement already runs as many activities as it may
    #[error("ExeUnit for agreement {agreement_id} terminated. Reason: {reason}, message: {message}")]
    ActivityConflict {
        agreement_id: String,
        reason: String,
        message: String,
    },

    // ========================================================================
    // Round-trip Errors
    // ========================================================================

    /// A cross-party round trip exceeded its deadline
    #[error("Operation {operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Operation attempted on an entity in the wrong state
    #[error("Protocol violation on {entity}: {reason}")]
    ProtocolViolation { entity: String, reason: String },

    // ========================================================================
    // Lookup Errors
    // ========================================================================

    #[error("Subscription {subscription_id} not found")]
    SubscriptionNotFound { subscription_id: String },

    #[error("Proposal {proposal_id} not found")]
    ProposalNotFound { proposal_id: String },

    #[error("Agreement {agreement_id} not found")]
    AgreementNotFound { agreement_id: String },

    #[error("Activity {activity_id} not found")]
    ActivityNotFound { activity_id: String },

    #[error("Batch {batch_id} not found")]
    BatchNotFound { batch_id: String },

    #[error("Provider {provider} not found")]
    ProviderNotFound { provider: String },

    #[error("Allocation {allocation_id} not found")]
    AllocationNotFound { allocation_id: String },

    #[error("Invoice {invoice_id} not found")]
    InvoiceNotFound { invoice_id: String },

    // ========================================================================
    // Payment Errors
    // ========================================================================

    #[error("Insufficient funds for {owner}: requested {requested}, available {available}")]
    InsufficientFunds {
        owner: String,
        requested: String,
        available: String,
    },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Constraint expression could not be parsed
    #[error("Invalid constraint at offset {offset}: {reason}")]
    InvalidConstraint { offset: usize, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MarketError {
    /// Create a protocol violation error
    pub fn protocol(entity: impl ToString, reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::Capacity,
            Self::ActivityConflict { .. } => ErrorKind::ActivityConflict,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Self::SubscriptionNotFound { .. }
            | Self::ProposalNotFound { .. }
            | Self::AgreementNotFound { .. }
            | Self::ActivityNotFound { .. }
            | Self::BatchNotFound { .. }
            | Self::ProviderNotFound { .. }
            | Self::AllocationNotFound { .. }
            | Self::InvoiceNotFound { .. } => ErrorKind::NotFound,
            Self::InsufficientFunds { .. } => ErrorKind::Payment,
            Self::InvalidConstraint { .. } => ErrorKind::Invalid,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Capacity rejections clear once a provider terminates an agreement and
    /// timeouts may succeed on a later attempt. The caller owns the retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. } | Self::Timeout { .. })
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::ActivityConflict { .. } => "ACTIVITY_CONFLICT",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::SubscriptionNotFound { .. } => "SUBSCRIPTION_NOT_FOUND",
            Self::ProposalNotFound { .. } => "PROPOSAL_NOT_FOUND",
            Self::AgreementNotFound { .. } => "AGREEMENT_NOT_FOUND",
            Self::ActivityNotFound { .. } => "ACTIVITY_NOT_FOUND",
            Self::BatchNotFound { .. } => "BATCH_NOT_FOUND",
            Self::ProviderNotFound { .. } => "PROVIDER_NOT_FOUND",
            Self::AllocationNotFound { .. } => "ALLOCATION_NOT_FOUND",
            Self::InvoiceNotFound { .. } => "INVOICE_NOT_FOUND",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InvalidConstraint { .. } => "INVALID_CONSTRAINT",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message() {
        let err = MarketError::CapacityExceeded {
            provider: "provider-1".to_string(),
            limit: 1,
        };
        assert!(err
            .to_string()
            .contains("No capacity available. Reached Agreements limit: 1"));
        assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[test]
    fn test_activity_conflict_body() {
        let err = MarketError::ActivityConflict {
            agreement_id: "agr_1".to_string(),
            reason: "Only single Activity allowed".to_string(),
            message: "Can't create 2 simultaneous Activities.".to_string(),
        };
        assert!(err.to_string().contains(
            "terminated. Reason: Only single Activity allowed, message: Can't create 2 simultaneous Activities."
        ));
    }

    #[test]
    fn test_retriable_errors() {
        assert!(MarketError::timeout("collect", std::time::Duration::from_secs(1)).is_retriable());
        assert!(!MarketError::protocol("act_1", "already destroyed").is_retriable());
        assert_eq!(
            MarketError::protocol("act_1", "already destroyed").kind(),
            ErrorKind::ProtocolViolation
        );
    }
}
