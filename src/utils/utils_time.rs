use chrono::{DateTime, TimeZone, Utc};

pub fn current_time_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Instants before the epoch clamp to 0.
pub fn datetime_to_millis(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip_through_datetime() {
        let now = current_time_ms();
        assert_eq!(datetime_to_millis(millis_to_datetime(now)), now);
        assert_eq!(datetime_to_millis(DateTime::<Utc>::UNIX_EPOCH), 0);
    }

    #[test]
    fn test_current_time_follows_the_utc_clock() {
        let before = datetime_to_millis(Utc::now());
        let now = current_time_ms();
        let after = datetime_to_millis(Utc::now());
        assert!(before <= now && now <= after);
        assert_eq!(millis_to_datetime(now).timestamp_millis() as u64, now);
    }
}
