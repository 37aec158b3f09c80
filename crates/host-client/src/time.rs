//! Conversions between `chrono` timestamps and the API time wrappers.
//!
//! `Time` and `MicroTime` travel as RFC 3339 strings, so conversion goes
//! through their serde form and does not depend on the wrapped type.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClientError;

fn from_rfc3339<T: DeserializeOwned>(at: DateTime<Utc>, format: SecondsFormat) -> Result<T, ClientError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        at.to_rfc3339_opts(format, true),
    ))?)
}

fn to_utc<T: Serialize>(value: &T) -> Option<DateTime<Utc>> {
    let json = serde_json::to_value(value).ok()?;
    DateTime::parse_from_rfc3339(json.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Microsecond timestamp, as used by leases
pub fn micro_time(at: DateTime<Utc>) -> Result<MicroTime, ClientError> {
    from_rfc3339(at, SecondsFormat::Micros)
}

/// Second-precision timestamp, as used by conditions and metadata
pub fn time(at: DateTime<Utc>) -> Result<Time, ClientError> {
    from_rfc3339(at, SecondsFormat::Secs)
}

#[must_use]
pub fn micro_time_to_utc(value: &MicroTime) -> Option<DateTime<Utc>> {
    to_utc(value)
}

#[must_use]
pub fn time_to_utc(value: &Time) -> Option<DateTime<Utc>> {
    to_utc(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_conversions_keep_the_instant() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        assert_eq!(micro_time_to_utc(&micro_time(at).unwrap()), Some(at));
        assert_eq!(time_to_utc(&time(at).unwrap()), Some(at));
    }
}
