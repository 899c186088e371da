//! Ledger Payload Codec
//!
//! The ledger reports contracts in several nested shapes
//! (`JsActiveContract.createdEvent.createArgument` vs `payload` vs
//! `createArgument`) and wraps optionals inconsistently (`{"Some": x}` vs the
//! raw value vs `null`). Everything is normalised here, at the port boundary,
//! so the rest of the engine only sees [`ActiveContract`] and the domain
//! types.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

use super::{ActiveContract, LedgerCommand, TemplateId};
use crate::models::{Order, OrderMode, OrderSide, OrderStatus, Trade, TradingPair};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),
}

// ============================================================================
// Contract-shape normalisation
// ============================================================================

/// Normalise any of the known contract-entry shapes into a flat record.
/// Returns None for templates the core does not project.
pub fn normalize_contract(raw: &Value) -> Result<Option<ActiveContract>, CodecError> {
    // Shape 1: wrapped created-event
    let entry = raw
        .pointer("/JsActiveContract/createdEvent")
        .unwrap_or(raw);

    let contract_id = entry
        .get("contractId")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("contractId"))?
        .to_string();

    let template_name = entry
        .get("templateId")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField("templateId"))?;

    let template_id = match parse_template_id(template_name) {
        Some(t) => t,
        None => return Ok(None),
    };

    // Shape 2 and 3: payload vs createArgument
    let payload = entry
        .get("payload")
        .or_else(|| entry.get("createArgument"))
        .ok_or(CodecError::MissingField("payload"))?
        .clone();

    Ok(Some(ActiveContract {
        contract_id,
        template_id,
        payload,
    }))
}

/// Template ids may arrive fully qualified with a package hash prefix
/// (`<pkgid>:Module:Entity`); the core matches on `Module:Entity` only.
pub fn parse_template_id(name: &str) -> Option<TemplateId> {
    TemplateId::from_qualified_name(strip_package_prefix(name))
}

fn strip_package_prefix(name: &str) -> &str {
    match name.splitn(3, ':').collect::<Vec<_>>().as_slice() {
        [_pkg, module, entity] => {
            let tail_len = module.len() + 1 + entity.len();
            &name[name.len() - tail_len..]
        }
        _ => name,
    }
}

/// Unwrap the ledger's optional encodings: `{"Some": x}` -> x,
/// `null` / `{"None": {}}` / absent -> None, anything else -> the raw value.
pub fn unwrap_optional(value: Option<&Value>) -> Option<&Value> {
    let value = value?;
    if value.is_null() {
        return None;
    }
    if let Some(obj) = value.as_object() {
        if let Some(inner) = obj.get("Some") {
            return Some(inner);
        }
        if obj.contains_key("None") {
            return None;
        }
    }
    Some(value)
}

// ============================================================================
// Field extraction helpers
// ============================================================================

fn string_field(payload: &Value, field: &'static str) -> Result<String, CodecError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(CodecError::MissingField(field))
}

fn decimal_field(payload: &Value, field: &'static str) -> Result<Decimal, CodecError> {
    parse_decimal(payload.get(field), field)?.ok_or(CodecError::MissingField(field))
}

fn optional_decimal_field(
    payload: &Value,
    field: &'static str,
) -> Result<Option<Decimal>, CodecError> {
    parse_decimal(unwrap_optional(payload.get(field)), field)
}

/// Decimals arrive as JSON strings (the ledger never uses binary floats for
/// amounts); numeric values are accepted for robustness.
fn parse_decimal(value: Option<&Value>, field: &'static str) -> Result<Option<Decimal>, CodecError> {
    let value = match unwrap_optional(value) {
        Some(v) => v,
        None => return Ok(None),
    };
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    parsed.map(Some).ok_or(CodecError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn timestamp_field(payload: &Value, field: &'static str) -> Result<DateTime<Utc>, CodecError> {
    let value = unwrap_optional(payload.get(field)).ok_or(CodecError::MissingField(field))?;
    parse_timestamp(value, field)
}

fn optional_timestamp_field(
    payload: &Value,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, CodecError> {
    match unwrap_optional(payload.get(field)) {
        Some(v) => parse_timestamp(v, field).map(Some),
        None => Ok(None),
    }
}

fn parse_timestamp(value: &Value, field: &'static str) -> Result<DateTime<Utc>, CodecError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| CodecError::InvalidValue {
                field,
                value: s.clone(),
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or(CodecError::InvalidValue {
                field,
                value: n.to_string(),
            }),
        _ => Err(CodecError::InvalidValue {
            field,
            value: value.to_string(),
        }),
    }
}

fn uuid_field(payload: &Value, field: &'static str) -> Result<Uuid, CodecError> {
    let raw = string_field(payload, field)?;
    Uuid::parse_str(&raw).map_err(|_| CodecError::InvalidValue { field, value: raw })
}

// ============================================================================
// Domain conversions
// ============================================================================

pub fn order_from_contract(contract: &ActiveContract) -> Result<Order, CodecError> {
    let payload = &contract.payload;

    let side = match string_field(payload, "side")?.as_str() {
        "Buy" => OrderSide::Buy,
        "Sell" => OrderSide::Sell,
        other => {
            return Err(CodecError::InvalidValue {
                field: "side",
                value: other.to_string(),
            })
        }
    };

    let mode = match string_field(payload, "mode")?.as_str() {
        "Limit" => OrderMode::Limit,
        "Market" => OrderMode::Market,
        "StopLoss" => OrderMode::StopLoss,
        other => {
            return Err(CodecError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            })
        }
    };

    let status = match string_field(payload, "status")?.as_str() {
        "Open" => OrderStatus::Open,
        "PendingTrigger" => OrderStatus::PendingTrigger,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" => OrderStatus::Cancelled,
        other => {
            return Err(CodecError::InvalidValue {
                field: "status",
                value: other.to_string(),
            })
        }
    };

    let pair: TradingPair = string_field(payload, "tradingPair")?
        .parse()
        .map_err(|_| CodecError::MissingField("tradingPair"))?;

    Ok(Order {
        order_id: uuid_field(payload, "orderId")?,
        contract_id: contract.contract_id.clone(),
        owner: string_field(payload, "owner")?,
        pair,
        side,
        mode,
        price: optional_decimal_field(payload, "price")?,
        stop_price: optional_decimal_field(payload, "stopPrice")?,
        quantity: decimal_field(payload, "quantity")?,
        filled: decimal_field(payload, "filled")?,
        status,
        timestamp: timestamp_field(payload, "placedAt")?,
        allocation_ref: unwrap_optional(payload.get("allocationCid"))
            .and_then(Value::as_str)
            .map(str::to_string),
        triggered_at: optional_timestamp_field(payload, "triggeredAt")?,
    })
}

pub fn trade_from_contract(contract: &ActiveContract) -> Result<Trade, CodecError> {
    let payload = &contract.payload;

    let base_price = decimal_field(payload, "basePrice")?;
    let base_amount = decimal_field(payload, "baseAmount")?;

    Ok(Trade {
        trade_id: uuid_field(payload, "tradeId")?,
        contract_id: Some(contract.contract_id.clone()),
        pair: string_field(payload, "tradingPair")?
            .parse()
            .map_err(|_| CodecError::MissingField("tradingPair"))?,
        buyer: string_field(payload, "buyer")?,
        seller: string_field(payload, "seller")?,
        base_price,
        base_amount,
        quote_amount: optional_decimal_field(payload, "quoteAmount")?
            .unwrap_or(base_price * base_amount),
        buy_order_id: uuid_field(payload, "buyOrderId")?,
        sell_order_id: uuid_field(payload, "sellOrderId")?,
        timestamp: timestamp_field(payload, "executedAt")?,
        sell_allocation_ref: unwrap_optional(payload.get("sellAllocationCid"))
            .and_then(Value::as_str)
            .map(str::to_string),
        buy_allocation_ref: unwrap_optional(payload.get("buyAllocationCid"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ============================================================================
// Command payloads
// ============================================================================

fn optional_json<T: ToString>(value: &Option<T>) -> Value {
    match value {
        Some(v) => json!({ "Some": v.to_string() }),
        None => Value::Null,
    }
}

pub fn order_create_command(order: &Order, operator: &str) -> LedgerCommand {
    LedgerCommand::Create {
        template: TemplateId::Order,
        payload: json!({
            "orderId": order.order_id.to_string(),
            "owner": order.owner,
            "operator": operator,
            "tradingPair": order.pair.symbol(),
            "side": match order.side { OrderSide::Buy => "Buy", OrderSide::Sell => "Sell" },
            "mode": match order.mode {
                OrderMode::Limit => "Limit",
                OrderMode::Market => "Market",
                OrderMode::StopLoss => "StopLoss",
            },
            "price": optional_json(&order.price),
            "stopPrice": optional_json(&order.stop_price),
            "quantity": order.quantity.to_string(),
            "filled": order.filled.to_string(),
            "status": match order.status {
                OrderStatus::Open => "Open",
                OrderStatus::PendingTrigger => "PendingTrigger",
                OrderStatus::PartiallyFilled => "PartiallyFilled",
                OrderStatus::Filled => "Filled",
                OrderStatus::Cancelled => "Cancelled",
            },
            "placedAt": order.timestamp.to_rfc3339(),
            "allocationCid": optional_json(&order.allocation_ref),
            "triggeredAt": optional_json(&order.triggered_at.map(|t| t.to_rfc3339())),
        }),
    }
}

pub fn trade_create_command(trade: &Trade, operator: &str) -> LedgerCommand {
    LedgerCommand::Create {
        template: TemplateId::Trade,
        payload: json!({
            "tradeId": trade.trade_id.to_string(),
            "operator": operator,
            "tradingPair": trade.pair.symbol(),
            "buyer": trade.buyer,
            "seller": trade.seller,
            "basePrice": trade.base_price.to_string(),
            "baseAmount": trade.base_amount.to_string(),
            "quoteAmount": trade.quote_amount.to_string(),
            "buyOrderId": trade.buy_order_id.to_string(),
            "sellOrderId": trade.sell_order_id.to_string(),
            "executedAt": trade.timestamp.to_rfc3339(),
            "sellAllocationCid": optional_json(&trade.sell_allocation_ref),
            "buyAllocationCid": optional_json(&trade.buy_allocation_ref),
        }),
    }
}

pub fn fill_order_command(contract_id: &str, fill_quantity: Decimal) -> LedgerCommand {
    LedgerCommand::Exercise {
        template: TemplateId::Order,
        contract_id: contract_id.to_string(),
        choice: "FillOrder".to_string(),
        argument: json!({ "fillQuantity": fill_quantity.to_string() }),
    }
}

pub fn cancel_order_command(contract_id: &str) -> LedgerCommand {
    LedgerCommand::Exercise {
        template: TemplateId::Order,
        contract_id: contract_id.to_string(),
        choice: "CancelOrder".to_string(),
        argument: json!({}),
    }
}

pub fn trigger_stop_loss_command(
    contract_id: &str,
    triggered_at: DateTime<Utc>,
    trigger_price: Decimal,
) -> LedgerCommand {
    LedgerCommand::Exercise {
        template: TemplateId::Order,
        contract_id: contract_id.to_string(),
        choice: "TriggerStopLoss".to_string(),
        argument: json!({
            "triggeredAt": triggered_at.to_rfc3339(),
            "triggerPrice": trigger_price.to_string(),
        }),
    }
}
