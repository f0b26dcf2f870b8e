use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

use crate::config::{secret_from_env, ExchangeConfig};
use crate::error::{LpFlowError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Exchange API key pair
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    secret: Zeroizing<String>,
}

impl ApiCredentials {
    pub fn new(api_key: String, secret: String) -> Self {
        Self {
            api_key,
            secret: Zeroizing::new(secret),
        }
    }

    /// Load from the environment variables named in the exchange config
    pub fn from_env(config: &ExchangeConfig) -> Result<Self> {
        let api_key = secret_from_env(&config.api_key_env)?;
        let secret = secret_from_env(&config.api_secret_env)?;
        Ok(Self::new(api_key, secret))
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Query-string signer for the exchange's signed endpoints
#[derive(Clone, Debug)]
pub struct HmacAuth {
    credentials: ApiCredentials,
    recv_window_ms: u64,
}

impl HmacAuth {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            credentials,
            recv_window_ms: 5000,
        }
    }

    /// Get current timestamp in milliseconds
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Hex HMAC-SHA256 of `message`
    fn sign(&self, message: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.as_bytes())
            .map_err(|e| LpFlowError::Signature(format!("HMAC init failed: {}", e)))?;

        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn build_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| {
                let value: String = url::form_urlencoded::byte_serialize(v.as_bytes()).collect();
                format!("{}={}", k, value)
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    fn signed_query_at(&self, params: &[(&str, String)], timestamp_ms: u64) -> Result<String> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("recvWindow", self.recv_window_ms.to_string()));
        all.push(("timestamp", timestamp_ms.to_string()));

        let query = Self::build_query(&all);
        let signature = self.sign(&query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    /// Encode `params`, append timestamp and signature
    pub fn signed_query(&self, params: &[(&str, String)]) -> Result<String> {
        self.signed_query_at(params, Self::timestamp_ms())
    }

    /// Build authentication headers for a request
    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-MBX-APIKEY",
            HeaderValue::from_str(&self.credentials.api_key)
                .map_err(|e| LpFlowError::Internal(format!("Invalid API key header: {}", e)))?,
        );
        Ok(headers)
    }
}
