//! Tick Frame Model
//!
//! Wire format for the ticks that flow through the gateway. Upstream
//! feeds deliver JSON text payloads; the broadcaster decodes them into
//! [`TickFrame`]s to extract the routing key (`symbol`) before fan-out,
//! and re-serializes exactly once per frame for delivery.
//!
//! Providers disagree on field names, so the routing fields accept the
//! common short aliases (`S`, `p`, `t`) in addition to the canonical
//! names. Any fields beyond the canonical three are carried through
//! untouched.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"date": "2025-06-02T14:30:00Z", "symbol": "AAPL", "price": "201.45", "size": 100}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A ticker symbol (e.g., "AAPL", "BTC-USD").
pub type Symbol = String;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while decoding upstream payloads into tick frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload was not valid JSON or was missing a required field.
    #[error("failed to decode tick frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// Payload decoded but carried an empty routing key.
    #[error("tick frame has empty symbol")]
    EmptySymbol,
}

// =============================================================================
// Tick Frame
// =============================================================================

/// A single market data tick routed through the gateway.
///
/// Downstream subscribers receive these frames re-serialized as JSON.
/// The `date`, `symbol`, and `price` fields are always present; every
/// other field from the upstream payload rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickFrame {
    /// Timestamp of the tick. Defaults to receive time when the
    /// upstream payload omits it.
    #[serde(alias = "t", default = "Utc::now")]
    pub date: DateTime<Utc>,

    /// Routing key: the ticker symbol this frame belongs to.
    #[serde(alias = "S")]
    pub symbol: Symbol,

    /// Trade or quote price, kept exact via fixed-point decimal.
    /// Accepts both string and numeric wire representations.
    #[serde(alias = "p")]
    pub price: Decimal,

    /// Provider-specific fields passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TickFrame {
    /// Decodes an upstream JSON payload into a frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] for malformed JSON or a missing
    /// `symbol`/`price`, and [`FrameError::EmptySymbol`] when the
    /// routing key is present but blank.
    pub fn decode(payload: &str) -> Result<Self, FrameError> {
        let frame: Self = serde_json::from_str(payload)?;
        if frame.symbol.trim().is_empty() {
            return Err(FrameError::EmptySymbol);
        }
        Ok(frame)
    }

    /// Serializes the frame for downstream delivery.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Decode`] if serialization fails, which only
    /// happens for non-string keys injected into `extra`.
    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_canonical_fields() {
        let payload = r#"{"date": "2025-06-02T14:30:00Z", "symbol": "AAPL", "price": "201.45"}"#;
        let frame = TickFrame::decode(payload).unwrap();

        assert_eq!(frame.symbol, "AAPL");
        assert_eq!(frame.price, Decimal::new(20145, 2));
        assert_eq!(frame.date.to_rfc3339(), "2025-06-02T14:30:00+00:00");
        assert!(frame.extra.is_empty());
    }

    #[test]
    fn decode_accepts_short_aliases() {
        let payload = r#"{"t": "2025-06-02T14:30:00Z", "S": "MSFT", "p": "411.20"}"#;
        let frame = TickFrame::decode(payload).unwrap();

        assert_eq!(frame.symbol, "MSFT");
        assert_eq!(frame.price, Decimal::new(41120, 2));
    }

    #[test]
    fn decode_defaults_missing_date_to_now() {
        let before = Utc::now();
        let frame = TickFrame::decode(r#"{"symbol": "AAPL", "price": "1.00"}"#).unwrap();
        let after = Utc::now();

        assert!(frame.date >= before && frame.date <= after);
    }

    #[test]
    fn decode_preserves_extra_fields() {
        let payload = r#"{"symbol": "AAPL", "price": "201.45", "size": 100, "exchange": "V"}"#;
        let frame = TickFrame::decode(payload).unwrap();

        assert_eq!(frame.extra.get("size"), Some(&Value::from(100)));
        assert_eq!(frame.extra.get("exchange"), Some(&Value::from("V")));
    }

    #[test]
    fn decode_rejects_missing_symbol() {
        let err = TickFrame::decode(r#"{"price": "201.45"}"#).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn decode_rejects_blank_symbol() {
        let err = TickFrame::decode(r#"{"symbol": "  ", "price": "201.45"}"#).unwrap_err();
        assert!(matches!(err, FrameError::EmptySymbol));
    }

    #[test]
    fn decode_rejects_non_json_payload() {
        assert!(TickFrame::decode("not json at all").is_err());
    }

    #[test]
    fn serialized_frame_uses_canonical_names() {
        let frame = TickFrame::decode(r#"{"S": "AAPL", "p": "201.45"}"#).unwrap();
        let json: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["price"], "201.45");
        assert!(json.get("S").is_none());
    }

    proptest! {
        #[test]
        fn extra_fields_survive_round_trip(
            key in "[a-z][a-z0-9_]{0,15}",
            int_val in any::<i64>(),
            str_val in "[ -~]{0,32}",
        ) {
            // Reserved names collide with the canonical fields; the
            // round-trip guarantee only covers passthrough keys.
            prop_assume!(!["date", "symbol", "price", "t", "S", "p"].contains(&key.as_str()));

            let mut object = Map::new();
            object.insert("symbol".to_string(), Value::from("AAPL"));
            object.insert("price".to_string(), Value::from("201.45"));
            object.insert(key.clone(), Value::from(int_val));
            object.insert(format!("{key}_s"), Value::from(str_val.clone()));
            let payload = Value::Object(object).to_string();

            let frame = TickFrame::decode(&payload).unwrap();
            let reencoded: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

            prop_assert_eq!(&reencoded[&key], &Value::from(int_val));
            prop_assert_eq!(&reencoded[format!("{key}_s")], &Value::from(str_val));
        }
    }
}
