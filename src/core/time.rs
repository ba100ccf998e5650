#![forbid(unsafe_code)]

//! Timestamp columns are persisted as `YYYY-MM-DDTHH:MM:SS.ffffffZ` (UTC, microseconds), which
//! sorts lexicographically in time order.

use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const STORAGE_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

#[must_use]
pub fn now() -> OffsetDateTime {
    let t = OffsetDateTime::now_utc();
    // Drop sub-microsecond precision so values survive a storage round-trip unchanged.
    let micros = t.microsecond();
    t.replace_microsecond(micros).unwrap_or(t)
}

#[must_use]
pub fn format_timestamp(t: OffsetDateTime) -> String {
    let t = t.to_offset(UtcOffset::UTC);
    t.format(STORAGE_FORMAT)
        .or_else(|_| t.format(&Rfc3339))
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Accepts the storage form and RFC 3339.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    if let Ok(t) = PrimitiveDateTime::parse(s, STORAGE_FORMAT) {
        return Some(t.assume_utc());
    }
    OffsetDateTime::parse(s, &Rfc3339)
        .ok()
        .map(|t| t.to_offset(UtcOffset::UTC))
}

/// Seconds between two instants, fractional.
#[must_use]
pub fn seconds_between(start: OffsetDateTime, end: OffsetDateTime) -> f64 {
    (end - start).as_seconds_f64()
}

pub mod serde_timestamp {
    use serde::{Deserialize as _, Deserializer, Serializer, de};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    pub mod option {
        use serde::{Deserialize as _, Deserializer, Serializer, de};
        use time::OffsetDateTime;

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            t: &Option<OffsetDateTime>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_str(&super::super::format_timestamp(*t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            match raw {
                None => Ok(None),
                Some(raw) => super::super::parse_timestamp(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{raw}'"))),
            }
        }
    }
}
