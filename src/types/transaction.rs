//! Transaction data structures and feed message decoding
//!
//! The feed delivers JSON messages in the Blockchain.info websocket format:
//! `{"op": "utx", "x": {...transaction...}}`. Only `utx` operations carry
//! transactions; other operations (pings, block notifications) are ignored.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors raised while decoding an inbound feed message.
///
/// Every variant is a drop-and-count condition for the ingestion client;
/// none of them is fatal to the stream.
#[derive(Debug, Error)]
pub enum FeedDecodeError {
    #[error("malformed feed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("transaction message missing required field: {0}")]
    MissingField(&'static str),

    #[error("transaction has no outputs")]
    NoOutputs,
}

/// Raw feed envelope. Unknown extra fields are ignored by serde.
#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    op: String,
    #[serde(rename = "x")]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    hash: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    fee: Option<u64>,
    #[serde(default)]
    inputs: Vec<RawInput>,
    #[serde(default)]
    out: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    #[serde(default)]
    prev_out: Option<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    value: Option<u64>,
}

/// One normalized inbound transaction. Immutable once created; only the
/// feed decoder and the synthetic producer construct these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unique transaction identifier (hash).
    pub id: String,

    /// Transaction timestamp from the feed.
    pub timestamp: DateTime<Utc>,

    /// Total output value in satoshis.
    pub total_value: u64,

    /// Fee in satoshis.
    pub fee: u64,

    /// Number of inputs.
    pub input_count: u32,

    /// Number of outputs.
    pub output_count: u32,

    /// Distinct input addresses.
    pub input_addresses: BTreeSet<String>,

    /// Distinct output addresses.
    pub output_addresses: BTreeSet<String>,
}

/// Outcome of decoding one feed message.
#[derive(Debug)]
pub enum FeedMessage {
    /// A normalized transaction ready for the pipeline.
    Transaction(TransactionRecord),
    /// A valid message of a type the pipeline does not process.
    Ignored(String),
}

/// Decode one raw feed payload into a [`FeedMessage`].
///
/// Missing required fields and unparseable payloads produce a
/// [`FeedDecodeError`]; the caller drops the message and increments the
/// decode-failure counter.
pub fn decode_feed_message(payload: &[u8]) -> Result<FeedMessage, FeedDecodeError> {
    let envelope: FeedEnvelope = serde_json::from_slice(payload)?;

    if envelope.op != "utx" {
        return Ok(FeedMessage::Ignored(envelope.op));
    }

    let body = envelope.body.ok_or(FeedDecodeError::MissingField("x"))?;
    let raw: RawTransaction = serde_json::from_value(body)?;

    let id = raw.hash.ok_or(FeedDecodeError::MissingField("hash"))?;
    let time = raw.time.ok_or(FeedDecodeError::MissingField("time"))?;
    if raw.out.is_empty() {
        return Err(FeedDecodeError::NoOutputs);
    }

    let timestamp = Utc
        .timestamp_opt(time, 0)
        .single()
        .ok_or(FeedDecodeError::MissingField("time"))?;

    let total_value: u64 = raw.out.iter().filter_map(|o| o.value).sum();

    let output_addresses: BTreeSet<String> =
        raw.out.iter().filter_map(|o| o.addr.clone()).collect();

    let input_addresses: BTreeSet<String> = raw
        .inputs
        .iter()
        .filter_map(|i| i.prev_out.as_ref().and_then(|p| p.addr.clone()))
        .collect();

    Ok(FeedMessage::Transaction(TransactionRecord {
        id,
        timestamp,
        total_value,
        fee: raw.fee.unwrap_or(0),
        input_count: raw.inputs.len() as u32,
        output_count: raw.out.len() as u32,
        input_addresses,
        output_addresses,
    }))
}

impl TransactionRecord {
    /// Build a record directly, bypassing the feed decoder. Used by the
    /// synthetic producer and tests.
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        total_value: u64,
        fee: u64,
        input_addresses: BTreeSet<String>,
        output_addresses: BTreeSet<String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            total_value,
            fee,
            input_count: input_addresses.len().max(1) as u32,
            output_count: output_addresses.len().max(1) as u32,
            input_addresses,
            output_addresses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utx_payload() -> &'static str {
        r#"{
            "op": "utx",
            "x": {
                "hash": "ab01",
                "time": 1700000000,
                "fee": 1200,
                "inputs": [{"prev_out": {"addr": "1InA", "value": 60000}}],
                "out": [
                    {"addr": "1OutA", "value": 50000},
                    {"addr": "1OutB", "value": 8800}
                ],
                "lock_time": 0,
                "ver": 1
            }
        }"#
    }

    #[test]
    fn test_decode_transaction() {
        let msg = decode_feed_message(utx_payload().as_bytes()).unwrap();
        let record = match msg {
            FeedMessage::Transaction(r) => r,
            other => panic!("unexpected decode outcome: {other:?}"),
        };

        assert_eq!(record.id, "ab01");
        assert_eq!(record.total_value, 58800);
        assert_eq!(record.fee, 1200);
        assert_eq!(record.input_count, 1);
        assert_eq!(record.output_count, 2);
        assert!(record.output_addresses.contains("1OutA"));
        assert!(record.input_addresses.contains("1InA"));
    }

    #[test]
    fn test_non_transaction_op_ignored() {
        let msg = decode_feed_message(br#"{"op": "pong"}"#).unwrap();
        assert!(matches!(msg, FeedMessage::Ignored(op) if op == "pong"));
    }

    #[test]
    fn test_missing_hash_is_drop_and_count() {
        let payload = r#"{"op": "utx", "x": {"time": 1700000000, "out": [{"value": 1}]}}"#;
        let err = decode_feed_message(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, FeedDecodeError::MissingField("hash")));
    }

    #[test]
    fn test_unparseable_payload_is_drop_and_count() {
        let err = decode_feed_message(b"not json").unwrap_err();
        assert!(matches!(err, FeedDecodeError::Malformed(_)));
    }

    #[test]
    fn test_no_outputs_rejected() {
        let payload = r#"{"op": "utx", "x": {"hash": "cd02", "time": 1700000000, "out": []}}"#;
        let err = decode_feed_message(payload.as_bytes()).unwrap_err();
        assert!(matches!(err, FeedDecodeError::NoOutputs));
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let msg = decode_feed_message(utx_payload().as_bytes()).unwrap();
        let record = match msg {
            FeedMessage::Transaction(r) => r,
            _ => unreachable!(),
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: TransactionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.total_value, record.total_value);
    }
}
