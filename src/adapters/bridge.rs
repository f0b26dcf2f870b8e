//! Bridge aggregator client (LI.FI-style `/quote` + `/status` API)
//!
//! Responses are parsed into strict types here; nothing untyped leaves this
//! module.

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::http::{build_client, retry_after, status_error};
use crate::domain::{ChainId, TxRequest};
use crate::error::{LpFlowError, Result};

/// Route request; `Address::ZERO` stands for the native coin
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub from_token: Address,
    pub to_token: Address,
    pub from_amount: u128,
    pub from_address: Address,
    pub to_address: Address,
    /// Fraction, e.g. 0.005
    pub slippage: Decimal,
}

/// Executable bridge route
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub tool: String,
    pub from_amount: u128,
    pub to_amount: u128,
    pub to_amount_min: u128,
    /// Spender that needs an ERC-20 allowance before `transaction`
    pub approval_address: Option<Address>,
    pub transaction: TxRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusQuery {
    pub tx_hash: TxHash,
    pub from_chain: ChainId,
    pub to_chain: ChainId,
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    /// Not indexed yet
    NotFound,
    Pending { substatus: Option<String> },
    Done {
        receiving_tx: Option<String>,
        amount: Option<u128>,
    },
    Failed { reason: String },
}

impl BridgeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeStatus::Done { .. } | BridgeStatus::Failed { .. })
    }
}

#[async_trait]
pub trait BridgeClient: Send + Sync {
    async fn quote(&self, request: &RouteRequest) -> Result<Route>;

    async fn status(&self, query: &StatusQuery) -> Result<BridgeStatus>;
}

pub struct LifiBridgeClient {
    http: reqwest::Client,
    base_url: String,
    integrator: String,
}

impl LifiBridgeClient {
    pub fn new(base_url: impl Into<String>, integrator: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            integrator: integrator.into(),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(query).send().await?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }
        Err(classify_bridge_error(status, wait, &body))
    }
}

#[async_trait]
impl BridgeClient for LifiBridgeClient {
    #[instrument(skip(self), fields(from_chain = request.from_chain, to_chain = request.to_chain))]
    async fn quote(&self, request: &RouteRequest) -> Result<Route> {
        let query = vec![
            ("fromChain", request.from_chain.to_string()),
            ("toChain", request.to_chain.to_string()),
            ("fromToken", request.from_token.to_string()),
            ("toToken", request.to_token.to_string()),
            ("fromAmount", request.from_amount.to_string()),
            ("fromAddress", request.from_address.to_string()),
            ("toAddress", request.to_address.to_string()),
            ("slippage", request.slippage.normalize().to_string()),
            ("integrator", self.integrator.clone()),
        ];
        let body = self.get("/quote", &query).await?;
        let route = parse_quote(&body)?;
        debug!(
            tool = %route.tool,
            to_amount = route.to_amount,
            to_amount_min = route.to_amount_min,
            "Bridge route quoted"
        );
        Ok(route)
    }

    async fn status(&self, query: &StatusQuery) -> Result<BridgeStatus> {
        let params = vec![
            ("txHash", query.tx_hash.to_string()),
            ("fromChain", query.from_chain.to_string()),
            ("toChain", query.to_chain.to_string()),
            ("bridge", query.tool.clone()),
        ];
        let body = self.get("/status", &params).await?;
        parse_status(&body)
    }
}

fn classify_bridge_error(
    status: reqwest::StatusCode,
    wait: Option<std::time::Duration>,
    body: &str,
) -> LpFlowError {
    let lower = body.to_ascii_lowercase();
    if status == reqwest::StatusCode::NOT_FOUND
        || lower.contains("no available quotes")
        || lower.contains("no route")
    {
        return LpFlowError::RouteNotFound(body.chars().take(300).collect());
    }
    status_error("bridge", status, wait, body)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    tool: String,
    estimate: QuoteEstimate,
    transaction_request: Option<RawTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteEstimate {
    from_amount: String,
    to_amount: String,
    to_amount_min: String,
    #[serde(default)]
    approval_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    to: String,
    data: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    gas_limit: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    substatus: Option<String>,
    #[serde(default)]
    substatus_message: Option<String>,
    #[serde(default)]
    receiving: Option<ReceivingLeg>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivingLeg {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    amount: Option<String>,
}

fn bad_response(what: &str, detail: impl std::fmt::Display) -> LpFlowError {
    LpFlowError::Internal(format!("bridge response: invalid {}: {}", what, detail))
}

fn parse_amount(field: &str, raw: &str) -> Result<u128> {
    raw.trim().parse::<u128>().map_err(|e| bad_response(field, e))
}

fn parse_address(field: &str, raw: &str) -> Result<Address> {
    raw.trim().parse::<Address>().map_err(|e| bad_response(field, e))
}

/// Hex (`0x..`) or decimal quantity
fn parse_quantity(field: &str, raw: &str) -> Result<U256> {
    raw.trim().parse::<U256>().map_err(|e| bad_response(field, e))
}

pub(crate) fn parse_quote(body: &str) -> Result<Route> {
    let raw: QuoteResponse = serde_json::from_str(body)?;
    let tx = raw
        .transaction_request
        .ok_or_else(|| bad_response("transactionRequest", "missing"))?;

    let value = match tx.value.as_deref() {
        Some(v) if !v.is_empty() => parse_quantity("value", v)?,
        _ => U256::ZERO,
    };
    let gas_limit = match tx.gas_limit.as_deref() {
        Some(g) if !g.is_empty() => Some(
            u64::try_from(parse_quantity("gasLimit", g)?)
                .map_err(|e| bad_response("gasLimit", e))?,
        ),
        _ => None,
    };
    let data: Bytes = tx.data.parse().map_err(|e| bad_response("data", e))?;

    let approval_address = match raw.estimate.approval_address.as_deref() {
        Some(a) if !a.is_empty() => Some(parse_address("approvalAddress", a)?),
        _ => None,
    };

    let route = Route {
        tool: raw.tool,
        from_amount: parse_amount("fromAmount", &raw.estimate.from_amount)?,
        to_amount: parse_amount("toAmount", &raw.estimate.to_amount)?,
        to_amount_min: parse_amount("toAmountMin", &raw.estimate.to_amount_min)?,
        approval_address,
        transaction: TxRequest::call(parse_address("to", &tx.to)?, data)
            .with_value(value)
            .with_gas_limit(gas_limit),
    };

    if route.to_amount_min > route.to_amount {
        return Err(bad_response(
            "estimate",
            format!("toAmountMin {} above toAmount {}", route.to_amount_min, route.to_amount),
        ));
    }
    Ok(route)
}

pub(crate) fn parse_status(body: &str) -> Result<BridgeStatus> {
    let raw: StatusResponse = serde_json::from_str(body)?;
    let status = match raw.status.as_str() {
        "NOT_FOUND" | "INVALID" => BridgeStatus::NotFound,
        "PENDING" => BridgeStatus::Pending {
            substatus: raw.substatus,
        },
        "DONE" if raw.substatus.as_deref() == Some("REFUNDED") => BridgeStatus::Failed {
            reason: raw
                .substatus_message
                .unwrap_or_else(|| "bridge refunded the transfer".into()),
        },
        "DONE" => {
            let receiving = raw.receiving.unwrap_or(ReceivingLeg {
                tx_hash: None,
                amount: None,
            });
            let amount = match receiving.amount.as_deref() {
                Some(a) if !a.is_empty() => Some(parse_amount("receiving.amount", a)?),
                _ => None,
            };
            BridgeStatus::Done {
                receiving_tx: receiving.tx_hash,
                amount,
            }
        }
        "FAILED" => BridgeStatus::Failed {
            reason: raw
                .substatus_message
                .or(raw.substatus)
                .unwrap_or_else(|| "bridge reported failure".into()),
        },
        other => return Err(bad_response("status", other)),
    };
    Ok(status)
}
