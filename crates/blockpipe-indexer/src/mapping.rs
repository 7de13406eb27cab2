//! Pass-through mapping of `eth_getBlockByNumber` payloads into export records.
//!
//! Block numbers, indices, timestamps and gas amounts become integers; every
//! other field is copied as the node returned it. No ABI decoding happens here.

use blockpipe_core::{ExportRecord, KeyPart, PrimaryKey};
use serde_json::{Map, Value};
use thiserror::Error;

pub const BLOCKS: &str = "blocks";
pub const TRANSACTIONS: &str = "transactions";

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("expected a JSON object for {0}")]
    NotAnObject(&'static str),

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} is not a hex quantity: {value}")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

fn quantity(obj: &Map<String, Value>, field: &'static str) -> Result<u64, MappingError> {
    let raw = obj.get(field).ok_or(MappingError::MissingField(field))?;
    raw.as_str()
        .and_then(parse_quantity)
        .ok_or_else(|| MappingError::InvalidQuantity {
            field,
            value: raw.to_string(),
        })
}

fn optional_quantity(obj: &Map<String, Value>, field: &'static str) -> Result<Value, MappingError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(_) => quantity(obj, field).map(Value::from),
    }
}

fn copy(obj: &Map<String, Value>, from: &str) -> Value {
    obj.get(from).cloned().unwrap_or(Value::Null)
}

/// Map one block payload into a `blocks` record plus one `transactions`
/// record per full transaction object.
///
/// Returns `Ok(None)` for a `null` payload (block not yet produced).
pub fn block_records(payload: &Value) -> Result<Option<Vec<ExportRecord>>, MappingError> {
    let block = match payload {
        Value::Null => return Ok(None),
        Value::Object(obj) => obj,
        _ => return Err(MappingError::NotAnObject("block")),
    };

    let number = quantity(block, "number")?;
    let transactions = block
        .get("transactions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut row = Map::new();
    row.insert("hash".to_string(), copy(block, "hash"));
    row.insert("parent_hash".to_string(), copy(block, "parentHash"));
    row.insert("timestamp".to_string(), Value::from(quantity(block, "timestamp")?));
    row.insert("miner".to_string(), copy(block, "miner"));
    row.insert("gas_used".to_string(), Value::from(quantity(block, "gasUsed")?));
    row.insert("gas_limit".to_string(), Value::from(quantity(block, "gasLimit")?));
    row.insert("base_fee_per_gas".to_string(), optional_quantity(block, "baseFeePerGas")?);
    row.insert("transaction_count".to_string(), Value::from(transactions.len() as u64));

    let mut records = Vec::with_capacity(1 + transactions.len());
    records.push(
        ExportRecord::new(BLOCKS, PrimaryKey::single(KeyPart::UInt(number)), row)
            .map_err(|e| MappingError::InvalidRecord(e.to_string()))?,
    );

    for tx in transactions {
        // hash-only transaction lists carry nothing to export
        let Value::Object(tx) = tx else {
            continue;
        };
        records.push(transaction_record(number, tx)?);
    }
    Ok(Some(records))
}

fn transaction_record(block_number: u64, tx: &Map<String, Value>) -> Result<ExportRecord, MappingError> {
    let index = quantity(tx, "transactionIndex")?;

    let mut row = Map::new();
    row.insert("hash".to_string(), copy(tx, "hash"));
    row.insert("from_address".to_string(), copy(tx, "from"));
    row.insert("to_address".to_string(), copy(tx, "to"));
    row.insert("value".to_string(), copy(tx, "value"));
    row.insert("gas".to_string(), optional_quantity(tx, "gas")?);
    row.insert("gas_price".to_string(), copy(tx, "gasPrice"));
    row.insert("nonce".to_string(), optional_quantity(tx, "nonce")?);
    row.insert("input".to_string(), copy(tx, "input"));

    ExportRecord::new(
        TRANSACTIONS,
        PrimaryKey::new(vec![KeyPart::UInt(block_number), KeyPart::UInt(index)]),
        row,
    )
    .map_err(|e| MappingError::InvalidRecord(e.to_string()))
}
