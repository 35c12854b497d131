use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

/// CME-style futures session: Sunday 17:00 to Friday 16:00 Chicago time,
/// with a 16:00-17:00 maintenance break every day. The dead-subscription
/// watchdog only runs while this is true; overnight silence is expected.
pub fn is_futures_market_open(now: DateTime<Utc>) -> bool {
    let chicago = now.with_timezone(&chrono_tz::America::Chicago);
    let hour = chicago.hour();

    match chicago.weekday() {
        Weekday::Sat => false,
        Weekday::Sun => hour >= 17,
        Weekday::Fri => hour < 16,
        _ => hour != 16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::Chicago;

    fn chicago(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Chicago
            .with_ymd_and_hms(y, m, d, h, 30, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn weekend_is_closed() {
        // Saturday mid-day.
        assert!(!is_futures_market_open(chicago(2026, 2, 28, 12)));
        // Sunday before the 17:00 open.
        assert!(!is_futures_market_open(chicago(2026, 3, 1, 12)));
        // Sunday evening after the open.
        assert!(is_futures_market_open(chicago(2026, 3, 1, 18)));
    }

    #[test]
    fn daily_maintenance_break_is_closed() {
        // Tuesday 16:30 Chicago.
        assert!(!is_futures_market_open(chicago(2026, 3, 3, 16)));
        assert!(is_futures_market_open(chicago(2026, 3, 3, 17)));
        assert!(is_futures_market_open(chicago(2026, 3, 3, 9)));
    }

    #[test]
    fn friday_closes_at_four() {
        assert!(is_futures_market_open(chicago(2026, 3, 6, 15)));
        assert!(!is_futures_market_open(chicago(2026, 3, 6, 16)));
        assert!(!is_futures_market_open(chicago(2026, 3, 6, 20)));
    }
}
