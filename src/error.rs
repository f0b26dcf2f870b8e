use std::time::Duration;
use thiserror::Error;

/// Main error type for the liquidity pipeline
#[derive(Error, Debug)]
pub enum LpFlowError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("RPC error: {0}")]
    Rpc(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Fatal execution errors
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Address not authorized: {0}")]
    AddressNotAuthorized(String),

    #[error("Amount below minimum: {0}")]
    MinimumAmount(String),

    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("Nonce too low: {0}")]
    NonceTooLow(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    // Operator action required
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("No liquidity pool: {0}")]
    NoLiquidityPool(String),

    // Startup errors
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Address parsing error: {0}")]
    AddressParsing(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Signature error: {0}")]
    Signature(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for LpFlowError
pub type Result<T> = std::result::Result<T, LpFlowError>;

/// How the retry layer treats a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retried with backoff
    Retryable,
    /// Permanent; propagated immediately
    Fatal,
    /// Unknown provider failure
    Unclassified,
}

impl LpFlowError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        LpFlowError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Classify this error for the retry layer
    pub fn class(&self) -> ErrorClass {
        use LpFlowError::*;

        match self {
            Network(_) | Timeout(_) | RateLimited { .. } | NonceTooLow(_) => ErrorClass::Retryable,
            Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Unclassified
                }
            }
            Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            InsufficientFunds(_)
            | InvalidParameters(_)
            | AddressNotAuthorized(_)
            | MinimumAmount(_)
            | TransactionReverted(_)
            | TransferFailed(_)
            | RouteNotFound(_)
            | NoLiquidityPool(_)
            | WalletNotFound(_)
            | ConfigMissing(_)
            | Config(_)
            | InvalidStateTransition { .. }
            | StateConflict(_)
            | AddressParsing(_)
            | Wallet(_)
            | Signature(_)
            | Json(_)
            | Cancelled => ErrorClass::Fatal,
            Rpc(_) | Io(_) | Internal(_) => ErrorClass::Unclassified,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LpFlowError::Cancelled)
    }

    /// Server-specified wait that overrides computed backoff
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LpFlowError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Map raw RPC/provider error text onto the error taxonomy
pub fn classify_rpc_error(message: &str) -> LpFlowError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        LpFlowError::rate_limited(message, None)
    } else if lower.contains("insufficient funds") {
        LpFlowError::InsufficientFunds(message.to_string())
    } else if lower.contains("nonce too low") {
        LpFlowError::NonceTooLow(message.to_string())
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        LpFlowError::TransactionReverted(message.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        LpFlowError::Timeout(message.to_string())
    } else if lower.contains("connection")
        || lower.contains("error sending request")
        || lower.contains("dns")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
    {
        LpFlowError::Network(message.to_string())
    } else if lower.contains("invalid argument") || lower.contains("invalid params") {
        LpFlowError::InvalidParameters(message.to_string())
    } else {
        LpFlowError::Rpc(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_classes() {
        assert_eq!(LpFlowError::Network("x".into()).class(), ErrorClass::Retryable);
        assert_eq!(LpFlowError::Timeout("x".into()).class(), ErrorClass::Retryable);
        assert_eq!(
            LpFlowError::rate_limited("slow down", None).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            LpFlowError::InsufficientFunds("x".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            LpFlowError::AddressNotAuthorized("x".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(LpFlowError::RouteNotFound("x".into()).class(), ErrorClass::Fatal);
        assert_eq!(LpFlowError::Rpc("x".into()).class(), ErrorClass::Unclassified);
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = LpFlowError::rate_limited("429", Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(LpFlowError::Network("down".into()).retry_after(), None);
    }

    #[test]
    fn classify_provider_messages() {
        assert!(matches!(
            classify_rpc_error("server returned 429 Too Many Requests"),
            LpFlowError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_rpc_error("insufficient funds for gas * price + value"),
            LpFlowError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_rpc_error("nonce too low: next nonce 5, tx nonce 4"),
            LpFlowError::NonceTooLow(_)
        ));
        assert!(matches!(
            classify_rpc_error("execution reverted: STF"),
            LpFlowError::TransactionReverted(_)
        ));
        assert!(matches!(
            classify_rpc_error("error sending request for url"),
            LpFlowError::Network(_)
        ));
        assert!(matches!(
            classify_rpc_error("something odd"),
            LpFlowError::Rpc(_)
        ));
    }
}
