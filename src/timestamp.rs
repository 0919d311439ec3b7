//! Timestamp alignment.
//!
//! All persisted timestamps are aligned down to the register's (or control
//! log's) period so that correlated metrics within one bucket share an
//! identical timestamp. Two registers polled at 10.050s and 10.150s both
//! land on 10.000s with a 1-second period.

use chrono::{DateTime, TimeZone, Utc};

/// Align a timestamp down to the previous multiple of `period_s`.
///
/// Deterministic: same input, same output. Sub-second periods (0.5s) and
/// hour-plus periods (7200s) use the same rule. Non-positive periods
/// return the input unchanged.
pub fn align_timestamp(ts: DateTime<Utc>, period_s: f64) -> DateTime<Utc> {
    if period_s <= 0.0 {
        return ts;
    }

    let epoch = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_micros()) / 1_000_000.0;
    let aligned = (epoch / period_s).floor() * period_s;

    let secs = aligned.floor() as i64;
    let micros = ((aligned - aligned.floor()) * 1_000_000.0).round() as u32;
    Utc.timestamp_opt(secs, micros * 1000).single().unwrap_or(ts)
}

/// Current UTC time aligned down to `period_s`.
pub fn aligned_now(period_s: f64) -> DateTime<Utc> {
    align_timestamp(Utc::now(), period_s)
}

/// Aligned current time as an ISO-8601 string (what the local store and
/// the cloud tables key on).
pub fn aligned_now_iso(period_s: f64) -> String {
    aligned_now(period_s).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32, milli: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap() + chrono::Duration::milliseconds(milli as i64)
    }

    #[test]
    fn aligns_down_to_second_boundaries() {
        assert_eq!(align_timestamp(at(14, 30, 17, 0), 10.0), at(14, 30, 10, 0));
        assert_eq!(align_timestamp(at(14, 30, 45, 0), 30.0), at(14, 30, 30, 0));
        assert_eq!(align_timestamp(at(14, 30, 17, 0), 60.0), at(14, 30, 0, 0));
    }

    #[test]
    fn sub_second_periods() {
        assert_eq!(align_timestamp(at(14, 30, 17, 234), 0.5), at(14, 30, 17, 0));
        assert_eq!(align_timestamp(at(14, 30, 17, 678), 0.5), at(14, 30, 17, 500));
    }

    #[test]
    fn hour_plus_periods() {
        assert_eq!(align_timestamp(at(14, 30, 17, 0), 3600.0), at(14, 0, 0, 0));
        assert_eq!(align_timestamp(at(15, 45, 0, 0), 7200.0), at(14, 0, 0, 0));
    }

    #[test]
    fn idempotent_and_bucket_stable() {
        let p = 10.0;
        let t1 = at(14, 30, 12, 100);
        let t2 = at(14, 30, 19, 900);
        let a1 = align_timestamp(t1, p);
        assert_eq!(align_timestamp(a1, p), a1);
        assert_eq!(a1, align_timestamp(t2, p));
    }

    #[test]
    fn non_positive_period_is_passthrough() {
        let t = at(14, 30, 17, 0);
        assert_eq!(align_timestamp(t, 0.0), t);
        assert_eq!(align_timestamp(t, -1.0), t);
    }
}
