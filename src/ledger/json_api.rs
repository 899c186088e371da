//! Ledger JSON API Driver
//!
//! Concrete [`LedgerApi`] implementation over the ledger's HTTP JSON API,
//! with streaming delegated to the WebSocket driver in `stream.rs`.
//!
//! Every call carries a bearer token from the [`TokenProvider`]; a 401
//! invalidates the cached token and the call is retried once with a fresh
//! one before `AuthorizationExpired` propagates.

use async_trait::async_trait;
use futures::stream::BoxStream;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::codec;
use super::retry::{InFlightGuard, RetryPolicy, with_retry, with_retry_if};
use super::stream::{open_snapshot_stream, open_update_stream};
use super::token::TokenProvider;
use super::{
    ActiveContract, LedgerApi, LedgerCommand, LedgerError, LedgerUpdate, Offset, TemplateId,
    TransactionResult, REST_PAGE_CAP,
};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct JsonApiConfig {
    /// HTTP base URL, e.g. `https://ledger:7575`
    pub base_url: String,
    /// WebSocket base URL, e.g. `wss://ledger:7575`
    pub ws_url: String,
    /// Timeout for write commands (submit, execute, withdraw)
    pub write_timeout: Duration,
    /// Timeout for balance reads
    pub balance_timeout: Duration,
    /// Timeout for health probes
    pub probe_timeout: Duration,
}

impl JsonApiConfig {
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            write_timeout: Duration::from_secs(30),
            balance_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

pub struct JsonLedgerClient {
    config: JsonApiConfig,
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
    in_flight: InFlightGuard,
}

impl JsonLedgerClient {
    pub fn new(config: JsonApiConfig, tokens: Arc<TokenProvider>) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(config.write_timeout)
            .build()
            .map_err(LedgerError::from)?;
        Ok(Self {
            config,
            http,
            tokens,
            in_flight: InFlightGuard::new(),
        })
    }

    /// Liveness probe against the ledger's readiness endpoint
    pub async fn health_check(&self) -> Result<(), LedgerError> {
        let url = format!("{}/readyz", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.config.probe_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LedgerError::Transport(format!(
                "Ledger not ready: {}",
                response.status()
            )))
        }
    }

    /// POST with bearer auth; a 401 invalidates the token cache and the
    /// request is re-sent once with a refreshed token.
    async fn post_authed(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, LedgerError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut refreshed = false;
        loop {
            let token = self.tokens.token()?;
            let response = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .timeout(timeout)
                .json(body)
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(LedgerError::AuthorizationExpired);
                }
                warn!("Ledger returned 401 on {}; refreshing token", path);
                self.tokens.invalidate();
                self.tokens.refresh()?;
                refreshed = true;
                continue;
            }

            return map_response(response).await;
        }
    }

    /// Raw single-shot submit without retry policy
    async fn submit_once(
        &self,
        act_as: &[String],
        read_as: &[String],
        command: &LedgerCommand,
    ) -> Result<TransactionResult, LedgerError> {
        let (path, body) = match command {
            LedgerCommand::Create { template, payload } => (
                "/v1/create",
                json!({
                    "templateId": template.qualified_name(),
                    "payload": payload,
                    "meta": { "actAs": act_as, "readAs": read_as },
                }),
            ),
            LedgerCommand::Exercise {
                template,
                contract_id,
                choice,
                argument,
            } => (
                "/v1/exercise",
                json!({
                    "templateId": template.qualified_name(),
                    "contractId": contract_id,
                    "choice": choice,
                    "argument": argument,
                    "meta": { "actAs": act_as, "readAs": read_as },
                }),
            ),
        };

        let result = self
            .post_authed(path, &body, self.config.write_timeout)
            .await?;
        parse_transaction_result(&result)
    }
}

/// Map an HTTP response onto the error taxonomy, or return its `result` field
async fn map_response(response: reqwest::Response) -> Result<Value, LedgerError> {
    let status = response.status();
    if status.is_success() {
        let body: Value = response.json().await?;
        return Ok(body.get("result").cloned().unwrap_or(body));
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let body: Value = response.json().await.unwrap_or(Value::Null);
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| {
            body.get("errors")
                .and_then(Value::as_array)
                .and_then(|errs| errs.first())
                .and_then(Value::as_str)
        })
        .unwrap_or("no details")
        .to_string();
    Err(match status.as_u16() {
        400 => LedgerError::Validation(message),
        401 => LedgerError::AuthorizationExpired,
        404 => LedgerError::ContractNotFound(message),
        409 => LedgerError::Conflict(message),
        429 => LedgerError::AlreadyInFlight { retry_after },
        _ => LedgerError::Transport(format!("HTTP {}: {}", status, message)),
    })
}

fn parse_transaction_result(result: &Value) -> Result<TransactionResult, LedgerError> {
    let transaction_id = result
        .get("transactionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut created = Vec::new();
    let mut archived = Vec::new();
    if let Some(events) = result.get("events").and_then(Value::as_array) {
        for event in events {
            if let Some(raw) = event.get("created") {
                match codec::normalize_contract(raw) {
                    Ok(Some(contract)) => created.push(contract),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping unparseable created event: {}", e),
                }
            } else if let Some(raw) = event.get("archived") {
                if let Some(cid) = raw.get("contractId").and_then(Value::as_str) {
                    archived.push(cid.to_string());
                }
            }
        }
    }

    Ok(TransactionResult {
        transaction_id,
        created,
        archived,
    })
}

/// Transient kinds the driver re-attempts itself; conflicts are left to the
/// caller's policy
fn is_transient(err: &LedgerError) -> bool {
    matches!(
        err,
        LedgerError::Transport(_) | LedgerError::AlreadyInFlight { .. }
    )
}

#[async_trait]
impl LedgerApi for JsonLedgerClient {
    async fn submit_command(
        &self,
        act_as: &[String],
        read_as: &[String],
        command: LedgerCommand,
    ) -> Result<TransactionResult, LedgerError> {
        debug!("Submitting {}", command.describe());
        with_retry_if(
            RetryPolicy::generic_write(),
            &command.describe(),
            is_transient,
            || self.submit_once(act_as, read_as, &command),
        )
        .await
    }

    async fn query_active(
        &self,
        party: &str,
        templates: &[TemplateId],
        page_size: usize,
    ) -> Result<Vec<ActiveContract>, LedgerError> {
        let body = json!({
            "templateIds": templates.iter().map(|t| t.qualified_name()).collect::<Vec<_>>(),
            "party": party,
            "pageSize": page_size.min(REST_PAGE_CAP),
        });
        let result = self
            .post_authed("/v1/query", &body, self.config.write_timeout)
            .await?;

        let entries = result
            .as_array()
            .or_else(|| result.get("contracts").and_then(Value::as_array))
            .ok_or_else(|| LedgerError::Transport("Malformed query response".into()))?;

        let mut contracts = Vec::with_capacity(entries.len());
        for entry in entries {
            match codec::normalize_contract(entry) {
                Ok(Some(contract)) => contracts.push(contract),
                Ok(None) => {}
                Err(e) => warn!("Skipping unparseable contract entry: {}", e),
            }
        }
        Ok(contracts)
    }

    async fn stream_active_at_offset(
        &self,
        offset: &Offset,
        templates: &[TemplateId],
    ) -> Result<BoxStream<'static, Result<ActiveContract, LedgerError>>, LedgerError> {
        let token = self.tokens.token()?;
        open_snapshot_stream(&self.config.ws_url, &token, offset, templates).await
    }

    async fn stream_updates(
        &self,
        from_offset: &Offset,
        templates: &[TemplateId],
    ) -> Result<BoxStream<'static, Result<LedgerUpdate, LedgerError>>, LedgerError> {
        // Streams always subscribe with a fresh token; reconnects call this
        // again after the ReadModel refreshed the provider.
        let token = self.tokens.refresh()?;
        open_update_stream(&self.config.ws_url, &token, from_offset, templates).await
    }

    async fn execute_allocation(
        &self,
        allocation_ref: &str,
        executor: &str,
        owner_hint: &str,
    ) -> Result<TransactionResult, LedgerError> {
        // One execute per owner at a time; concurrent duplicates are not sent
        let _permit = self
            .in_flight
            .try_acquire(&format!("{}:execute-allocation", owner_hint))?;

        let command = LedgerCommand::Exercise {
            template: TemplateId::Allocation,
            contract_id: allocation_ref.to_string(),
            choice: "ExecuteTransfer".to_string(),
            argument: json!({ "executor": executor }),
        };
        let act_as = vec![executor.to_string()];
        let read_as = vec![executor.to_string(), owner_hint.to_string()];
        with_retry(RetryPolicy::allocation(), "execute allocation", || {
            self.submit_once(&act_as, &read_as, &command)
        })
        .await
    }

    async fn withdraw_allocation(
        &self,
        allocation_ref: &str,
        owner: &str,
    ) -> Result<TransactionResult, LedgerError> {
        let command = LedgerCommand::Exercise {
            template: TemplateId::Allocation,
            contract_id: allocation_ref.to_string(),
            choice: "Withdraw".to_string(),
            argument: json!({}),
        };
        let act_as = vec![owner.to_string()];
        let read_as = vec![owner.to_string()];
        with_retry_if(
            RetryPolicy::generic_write(),
            "withdraw allocation",
            is_transient,
            || self.submit_once(&act_as, &read_as, &command),
        )
        .await
    }

    async fn get_ledger_end(&self) -> Result<Offset, LedgerError> {
        let result = self
            .post_authed("/v1/ledger-end", &json!({}), self.config.write_timeout)
            .await?;
        result
            .get("offset")
            .and_then(Value::as_str)
            .map(|s| Offset(s.to_string()))
            .ok_or_else(|| LedgerError::Transport("Missing ledger-end offset".into()))
    }

    async fn get_available_balance(
        &self,
        party: &str,
        asset: &str,
    ) -> Result<Decimal, LedgerError> {
        let body = json!({ "party": party, "asset": asset });
        let result = self
            .post_authed("/v1/wallet/balance", &body, self.config.balance_timeout)
            .await?;
        let raw = result
            .get("available")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::Transport("Missing balance field".into()))?;
        Decimal::from_str(raw)
            .map_err(|_| LedgerError::Transport(format!("Unparseable balance: {}", raw)))
    }
}
