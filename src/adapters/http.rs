//! Shared HTTP plumbing for the bridge and exchange clients

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::LpFlowError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub fn build_client() -> Result<reqwest::Client, LpFlowError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("lpflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(LpFlowError::Http)
}

/// `Retry-After` in seconds; HTTP-date values are ignored
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success status the caller has no specific rule for
pub fn status_error(
    service: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LpFlowError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            LpFlowError::rate_limited(format!("{} returned 429: {}", service, snippet), retry_after)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            LpFlowError::Timeout(format!("{} returned {}: {}", service, status, snippet))
        }
        s if s.is_server_error() => {
            LpFlowError::Network(format!("{} returned {}: {}", service, status, snippet))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            LpFlowError::InvalidParameters(format!("{} rejected request: {}", service, snippet))
        }
        _ => LpFlowError::Rpc(format!("{} returned {}: {}", service, status, snippet)),
    }
}
