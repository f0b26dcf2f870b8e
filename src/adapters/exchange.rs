//! Centralized exchange client (Binance-style signed REST API)

use alloy::primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::http::{build_client, retry_after, status_error};
use crate::error::{LpFlowError, Result};
use crate::signing::{ApiCredentials, HmacAuth};

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawRequest {
    pub asset: String,
    pub network: String,
    pub address: Address,
    pub amount: Decimal,
    /// Client-chosen id; a retry with the same id is looked up, not re-issued
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalStatus {
    Pending { code: i32 },
    Completed { tx_hash: Option<String> },
    Failed { reason: String },
    Cancelled,
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WithdrawalStatus::Pending { .. })
    }

    /// Exchange status codes: 0 email sent, 1 cancelled, 2 awaiting approval,
    /// 3 rejected, 4 processing, 5 failure, 6 completed
    pub fn from_code(code: i32, tx_id: Option<String>, info: Option<String>) -> Self {
        match code {
            6 => WithdrawalStatus::Completed {
                tx_hash: tx_id.filter(|t| !t.is_empty()),
            },
            1 => WithdrawalStatus::Cancelled,
            3 => WithdrawalStatus::Failed {
                reason: info.unwrap_or_else(|| "withdrawal rejected".into()),
            },
            5 => WithdrawalStatus::Failed {
                reason: info.unwrap_or_else(|| "withdrawal failed".into()),
            },
            other => WithdrawalStatus::Pending { code: other },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub id: String,
    pub client_id: Option<String>,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Free balance of `asset`
    async fn balance(&self, asset: &str) -> Result<Decimal>;

    /// Initiate a withdrawal; returns the exchange's id
    async fn withdraw(&self, request: &WithdrawRequest) -> Result<String>;

    /// Look up a withdrawal by client id
    async fn withdrawal(&self, client_id: &str) -> Result<Option<Withdrawal>>;
}

pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
    auth: HmacAuth,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>, credentials: ApiCredentials) -> Result<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: HmacAuth::new(credentials),
        })
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        let query = self.auth.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, path, query);

        let response = self
            .http
            .request(method, &url)
            .headers(self.auth.headers()?)
            .send()
            .await?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        Err(classify_exchange_error(status, wait, &body))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn balance(&self, asset: &str) -> Result<Decimal> {
        let body = self.signed(reqwest::Method::GET, "/api/v3/account", &[]).await?;
        parse_balance(&body, asset)
    }

    #[instrument(
        skip(self, request),
        fields(asset = %request.asset, client_id = %request.client_id)
    )]
    async fn withdraw(&self, request: &WithdrawRequest) -> Result<String> {
        let params = vec![
            ("coin", request.asset.clone()),
            ("network", request.network.clone()),
            ("address", request.address.to_string()),
            ("amount", request.amount.normalize().to_string()),
            ("withdrawOrderId", request.client_id.clone()),
        ];
        let body = self
            .signed(reqwest::Method::POST, "/sapi/v1/capital/withdraw/apply", &params)
            .await?;
        let parsed: WithdrawResponse = serde_json::from_str(&body)?;
        info!(id = %parsed.id, amount = %request.amount, "Withdrawal submitted");
        Ok(parsed.id)
    }

    async fn withdrawal(&self, client_id: &str) -> Result<Option<Withdrawal>> {
        let params = vec![("withdrawOrderId", client_id.to_string())];
        let body = self
            .signed(reqwest::Method::GET, "/sapi/v1/capital/withdraw/history", &params)
            .await?;
        parse_withdrawal_history(&body, client_id)
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Map exchange error payloads onto the error taxonomy
pub fn classify_exchange_error(
    status: reqwest::StatusCode,
    wait: Option<Duration>,
    body: &str,
) -> LpFlowError {
    // 418 is the exchange's IP ban after ignoring 429s
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return LpFlowError::rate_limited(format!("exchange returned {}", status), wait);
    }

    let Ok(api) = serde_json::from_str::<ApiErrorBody>(body) else {
        return status_error("exchange", status, wait, body);
    };
    let msg = api.msg.to_ascii_lowercase();
    let detail = format!("exchange code {}: {}", api.code, api.msg);

    if api.code == -1003 {
        LpFlowError::rate_limited(detail, wait)
    } else if msg.contains("insufficient") {
        LpFlowError::InsufficientFunds(detail)
    } else if msg.contains("whitelist")
        || msg.contains("not authorized")
        || msg.contains("address verification")
    {
        LpFlowError::AddressNotAuthorized(detail)
    } else if msg.contains("minimum") || msg.contains("less than") {
        LpFlowError::MinimumAmount(detail)
    } else if api.code == -1021 || msg.contains("timestamp") {
        // Clock skew; a fresh signature usually fixes it
        LpFlowError::Network(detail)
    } else {
        status_error("exchange", status, wait, &detail)
    }
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

#[derive(Deserialize)]
struct WithdrawResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    id: String,
    amount: String,
    status: i32,
    #[serde(default)]
    tx_id: Option<String>,
    #[serde(default)]
    withdraw_order_id: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim()).map_err(|e| {
        LpFlowError::Internal(format!("exchange response: invalid {}: {}", field, e))
    })
}

pub(crate) fn parse_balance(body: &str, asset: &str) -> Result<Decimal> {
    let account: AccountResponse = serde_json::from_str(body)?;
    match account.balances.iter().find(|b| b.asset.eq_ignore_ascii_case(asset)) {
        Some(balance) => parse_decimal("free", &balance.free),
        None => Ok(Decimal::ZERO),
    }
}

pub(crate) fn parse_withdrawal_history(body: &str, client_id: &str) -> Result<Option<Withdrawal>> {
    let entries: Vec<HistoryEntry> = serde_json::from_str(body)?;
    let matching: Vec<HistoryEntry> = entries
        .into_iter()
        .filter(|e| e.withdraw_order_id.as_deref() == Some(client_id))
        .collect();
    if matching.len() > 1 {
        warn!(client_id, count = matching.len(), "Multiple withdrawals share one client id");
    }

    let Some(entry) = matching.into_iter().next() else {
        return Ok(None);
    };
    Ok(Some(Withdrawal {
        amount: parse_decimal("amount", &entry.amount)?,
        status: WithdrawalStatus::from_code(entry.status, entry.tx_id, entry.info),
        id: entry.id,
        client_id: entry.withdraw_order_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn balance_lookup_defaults_to_zero() {
        let body = r#"{"balances":[
            {"asset":"USDC","free":"1250.50","locked":"0"},
            {"asset":"ETH","free":"0.1","locked":"0"}
        ]}"#;
        assert_eq!(parse_balance(body, "usdc").unwrap(), dec!(1250.50));
        assert_eq!(parse_balance(body, "ARB").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn history_matches_client_id() {
        let body = r#"[
            {"id":"a1","amount":"10","status":4,"withdrawOrderId":"lpflow-0-abc"},
            {"id":"b2","amount":"12.5","status":6,"txId":"0xfeed","withdrawOrderId":"lpflow-1-abc"}
        ]"#;
        let found = parse_withdrawal_history(body, "lpflow-1-abc").unwrap().unwrap();
        assert_eq!(found.id, "b2");
        assert_eq!(found.amount, dec!(12.5));
        assert_eq!(
            found.status,
            WithdrawalStatus::Completed {
                tx_hash: Some("0xfeed".into())
            }
        );
        assert!(parse_withdrawal_history(body, "lpflow-9-abc").unwrap().is_none());
    }

    #[test]
    fn status_codes() {
        assert!(!WithdrawalStatus::from_code(4, None, None).is_terminal());
        assert_eq!(WithdrawalStatus::from_code(1, None, None), WithdrawalStatus::Cancelled);
        assert!(matches!(
            WithdrawalStatus::from_code(5, None, Some("chain halted".into())),
            WithdrawalStatus::Failed { reason } if reason == "chain halted"
        ));
    }

    #[test]
    fn error_messages_map_to_fatal_variants() {
        let bad = reqwest::StatusCode::BAD_REQUEST;
        assert!(matches!(
            classify_exchange_error(
                bad,
                None,
                r#"{"code":-4026,"msg":"User has insufficient balance"}"#
            ),
            LpFlowError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_exchange_error(
                bad,
                None,
                r#"{"code":-4014,"msg":"Withdrawal address is not in the whitelist"}"#
            ),
            LpFlowError::AddressNotAuthorized(_)
        ));
        assert!(matches!(
            classify_exchange_error(
                bad,
                None,
                r#"{"code":-4022,"msg":"The amount is less than the minimum withdrawal"}"#
            ),
            LpFlowError::MinimumAmount(_)
        ));
        assert!(classify_exchange_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(30)),
            ""
        )
        .is_retryable());
    }
}
