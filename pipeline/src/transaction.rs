use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};
use uuid::Uuid;

/// Store-assigned primary key of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Caller-visible business identifier. Not unique: two transactions may
/// share one, and nothing in the pipeline is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for CorrelationId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

// The wire format allows either a JSON string or a JSON number.
impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) if s.trim().is_empty() => {
                Err(serde::de::Error::custom("correlationId must not be empty"))
            }
            Raw::Text(s) => Ok(Self(s)),
            Raw::Number(n) => Ok(Self(n.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("amount must be a positive number of minor units, got {0}")]
pub struct InvalidAmount(pub i64);

/// Positive amount in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(minor_units: i64) -> Result<Self, InvalidAmount> {
        if minor_units <= 0 {
            return Err(InvalidAmount(minor_units));
        }
        Ok(Self(minor_units))
    }

    /// Raises non-positive values to the smallest valid amount.
    pub fn clamped(minor_units: i64) -> Self {
        Self(minor_units.max(1))
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = InvalidAmount;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    /// The last attempt failed and a redelivery is scheduled.
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Success => "success",
            TransactionStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for TransactionStatus {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>>
    where
        Self: Sized,
    {
        self.as_str().to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool
    where
        Self: Sized,
    {
        ty.name() == "transaction_status"
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        if !<Self as ToSql>::accepts(ty) {
            return Err(Box::new(tokio_postgres::types::WrongType::new::<Self>(
                ty.clone(),
            )));
        }
        self.to_sql(ty, out)
    }
}

impl<'a> FromSql<'a> for TransactionStatus {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        match std::str::from_utf8(raw)? {
            "pending" => Ok(TransactionStatus::Pending),
            "success" => Ok(TransactionStatus::Success),
            "rejected" => Ok(TransactionStatus::Rejected),
            other => Err(format!("unknown transaction_status variant: {}", other).into()),
        }
    }

    fn accepts(ty: &Type) -> bool {
        ty.name() == "transaction_status"
    }
}

/// Authoritative state of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub correlation_id: CorrelationId,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub attempt_count: u32,
    /// Informational only; the broker enforces the real delay.
    #[serde(with = "time::serde::rfc3339")]
    pub next_attempt_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Transaction {
    pub fn pending(id: TransactionId, new: NewTransaction, now: OffsetDateTime) -> Self {
        Self {
            id,
            correlation_id: new.correlation_id,
            amount: new.amount,
            status: TransactionStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub correlation_id: CorrelationId,
    pub amount: Amount,
}

impl NewTransaction {
    pub fn new(correlation_id: CorrelationId, amount: Amount) -> Self {
        Self {
            correlation_id,
            amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_must_be_positive() {
        assert!(Amount::new(1).is_ok());
        assert_eq!(Amount::new(0), Err(InvalidAmount(0)));
        assert_eq!(Amount::new(-5), Err(InvalidAmount(-5)));
    }

    #[test]
    fn correlation_id_accepts_strings_and_numbers() {
        let from_number: CorrelationId = serde_json::from_str("417").unwrap();
        let from_text: CorrelationId = serde_json::from_str("\"417\"").unwrap();
        assert_eq!(from_number, from_text);
        assert!(serde_json::from_str::<CorrelationId>("\"  \"").is_err());
        assert!(serde_json::from_str::<CorrelationId>("null").is_err());
    }

    #[test]
    fn only_success_is_terminal() {
        assert!(TransactionStatus::Success.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Rejected.is_terminal());
    }

    #[test]
    fn status_binds_only_to_its_postgres_enum() {
        use tokio_postgres::types::Kind;

        let enum_ty = Type::new(
            "transaction_status".to_string(),
            0,
            Kind::Enum(vec!["pending".into(), "success".into(), "rejected".into()]),
            "public".to_string(),
        );

        let mut out = BytesMut::new();
        TransactionStatus::Rejected
            .to_sql_checked(&enum_ty, &mut out)
            .unwrap();
        assert_eq!(&out[..], b"rejected");
        assert_eq!(
            TransactionStatus::from_sql(&enum_ty, b"success").unwrap(),
            TransactionStatus::Success
        );

        let mut out = BytesMut::new();
        assert!(
            TransactionStatus::Success
                .to_sql_checked(&Type::INT4, &mut out)
                .is_err()
        );
    }

    #[test]
    fn serializes_record_in_camel_case() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let tx = Transaction::pending(
            TransactionId::new_v4(),
            NewTransaction::new(CorrelationId::from(7), Amount::new(100).unwrap()),
            now,
        );
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["correlationId"], "7");
        assert_eq!(json["amount"], 100);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["attemptCount"], 0);
        assert_eq!(json["createdAt"], "1970-01-01T00:00:00Z");
    }
}
