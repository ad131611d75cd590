use time::OffsetDateTime;

pub trait TimeSource {
    fn current_time(&self) -> OffsetDateTime;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub fn unix_millis(time: OffsetDateTime) -> i64 {
    i64::try_from(time.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn millis_since_epoch() {
        assert_eq!(unix_millis(datetime!(1970-01-01 00:00:01.5 UTC)), 1500);
        assert_eq!(unix_millis(datetime!(2023-11-14 22:13:20 UTC)), 1_700_000_000_000);
    }
}
