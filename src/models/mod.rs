pub mod user;
pub mod market;
pub mod order;
pub mod balance;
pub mod position;
pub mod trade;

pub use user::*;
pub use market::*;
pub use order::*;
pub use balance::*;
pub use position::*;
pub use trade::*;

// Helper module to carry DateTime fields as millisecond timestamps on the
// wire. Both directions are needed: idempotent replay deserializes stored
// responses byte-for-byte.
pub(crate) mod datetime_as_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(dt.timestamp_millis())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}
