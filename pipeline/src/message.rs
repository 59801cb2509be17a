use crate::transaction::{Amount, CorrelationId, Transaction, TransactionId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed transaction message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Queue payload: a reference to a stored transaction, not a snapshot.
///
/// Consumers re-read the store on every delivery; only `id` is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub id: TransactionId,
    pub correlation_id: CorrelationId,
    pub amount: Amount,
}

impl TransactionMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        // Only plain strings and integers; serialization cannot fail.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

impl From<&Transaction> for TransactionMessage {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            correlation_id: tx.correlation_id.clone(),
            amount: tx.amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "5f0c6b8e-5d7c-4c1e-9a55-3f5f6f0d2a11";

    #[test]
    fn parses_numeric_correlation_id() {
        let raw = format!(r#"{{"id":"{ID}","correlationId":42,"amount":150}}"#);
        let msg = TransactionMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(msg.id.to_string(), ID);
        assert_eq!(msg.correlation_id.as_str(), "42");
        assert_eq!(msg.amount.minor_units(), 150);
    }

    #[test]
    fn rejects_missing_fields_and_bad_amounts() {
        let missing = format!(r#"{{"id":"{ID}","amount":150}}"#);
        assert!(TransactionMessage::parse(missing.as_bytes()).is_err());

        let zero = format!(r#"{{"id":"{ID}","correlationId":"a","amount":0}}"#);
        assert!(TransactionMessage::parse(zero.as_bytes()).is_err());

        let bad_id = r#"{"id":"not-a-uuid","correlationId":"a","amount":5}"#;
        assert!(TransactionMessage::parse(bad_id.as_bytes()).is_err());

        assert!(TransactionMessage::parse(b"not json").is_err());
    }

    #[test]
    fn encodes_flat_camel_case_json() {
        let msg = TransactionMessage {
            id: ID.parse().unwrap(),
            correlation_id: CorrelationId::new("abc"),
            amount: Amount::new(10).unwrap(),
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": ID, "correlationId": "abc", "amount": 10})
        );
    }
}
