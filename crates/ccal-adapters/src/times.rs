//! Provider time representations to UTC instants.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M%z", "%Y%m%dT%H%M%S%z"];
const FLOATING_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y%m%dT%H%M%S",
];

/// Wall-clock time in `tz`; the earlier instant wins across DST folds.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Accepts RFC 3339, ISO 8601 with a numeric offset, floating local times and bare dates.
pub fn parse_flexible(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in FLOATING_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return localize(naive, tz);
        }
    }
    parse_date(text).and_then(|date| localize(date.and_hms_opt(0, 0, 0)?, tz))
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y%m%d"))
        .ok()
}

/// Epoch milliseconds, as the Meetup API reports instants.
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Los_Angeles;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn offsets_are_honoured() {
        assert_eq!(
            parse_flexible("2026-10-21T19:00:00-0700", Los_Angeles),
            Some(utc(2026, 10, 22, 2, 0))
        );
        assert_eq!(
            parse_flexible("2026-10-21T19:00:00Z", Los_Angeles),
            Some(utc(2026, 10, 21, 19, 0))
        );
    }

    #[test]
    fn floating_times_use_the_configured_zone() {
        // PDT is UTC-7 in October.
        assert_eq!(
            parse_flexible("2026-10-21T19:00:00", Los_Angeles),
            Some(utc(2026, 10, 22, 2, 0))
        );
        assert_eq!(
            parse_flexible("2026-12-01", Los_Angeles),
            Some(utc(2026, 12, 1, 8, 0))
        );
        assert_eq!(parse_flexible("next tuesday", Los_Angeles), None);
    }

    #[test]
    fn epoch_millis_convert_exactly() {
        assert_eq!(from_epoch_millis(1_792_634_400_000), Some(utc(2026, 10, 22, 2, 0)));
    }
}
