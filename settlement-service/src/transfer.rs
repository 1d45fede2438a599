use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::str::FromStr;

const AMOUNT_FIELDS: &[&str] = &["amount", "totalAmount", "value"];
const DESCRIPTION_FIELDS: &[&str] = &["description", "content", "note"];
const TIME_FIELDS: &[&str] = &["when", "time", "createdAt"];
const ACCOUNT_FIELDS: &[&str] = &["account", "beneficiaryAccount", "toAccount"];
const TX_ID_FIELDS: &[&str] = &["txId", "id", "reference"];

/// One bank transfer, normalized from whatever field names the provider used.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub tx_id: String,
    /// Whole currency units. Zero when the provider sent nothing usable.
    pub amount: i64,
    pub description: String,
    pub occurred_at: String,
    pub account: String,
}

/// Split a webhook body into raw records: `{ data: [...] }`, a bare array, or
/// a single record.
pub fn split_payload(body: Value) -> Vec<Value> {
    match body {
        Value::Array(records) => records,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(records)) => records,
            Some(other) => {
                map.insert("data".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        Value::Null => vec![Value::Object(Default::default())],
        other => vec![other],
    }
}

/// Resolve field aliases for a single raw record.
pub fn normalize_record(raw: &Value, now: DateTime<Utc>) -> TransferRecord {
    let amount = first_present(raw, AMOUNT_FIELDS)
        .and_then(coerce_amount)
        .unwrap_or(Decimal::ZERO);
    let amount_units = amount
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0);

    let description = first_present(raw, DESCRIPTION_FIELDS)
        .map(value_to_string)
        .unwrap_or_default();
    let occurred_at = first_present(raw, TIME_FIELDS)
        .map(value_to_string)
        .unwrap_or_else(|| now.timestamp_millis().to_string());
    let account = first_present(raw, ACCOUNT_FIELDS)
        .map(value_to_string)
        .unwrap_or_default();
    let tx_id = first_present(raw, TX_ID_FIELDS)
        .map(value_to_string)
        .unwrap_or_else(|| format!("{}-{}-{}", account, occurred_at, amount.normalize()));

    TransferRecord {
        tx_id,
        amount: amount_units,
        description,
        occurred_at,
        account,
    }
}

/// First alias carrying a meaningful value. Null, false, zero and empty
/// strings fall through to the next alias.
fn first_present<'a>(raw: &'a Value, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .filter_map(|field| raw.get(field))
        .find(|value| match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
            _ => true,
        })
}

fn coerce_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| Decimal::from_scientific(&n.to_string()).ok()),
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .ok()
                .or_else(|| Decimal::from_scientific(s).ok())
        }
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
