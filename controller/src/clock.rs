use anyhow::anyhow;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Offset, Utc};
use chrono_tz::Tz;
use growlight_common::{DeviceError, WallClock};

/// Before SNTP completes the RTC counts from the 1970 epoch.
const FIRST_SYNCED_YEAR: i32 = 2024;

#[derive(Debug, Clone, Copy)]
pub struct ZonedClock {
    timezone: Tz,
}

impl ZonedClock {
    pub fn new(timezone: &str) -> anyhow::Result<Self> {
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("unknown timezone `{timezone}`: {err}"))?;
        Ok(Self { timezone })
    }

    pub fn utc() -> Self {
        Self { timezone: Tz::UTC }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn now_in_timezone(&self, utc: DateTime<Utc>) -> Result<DateTime<FixedOffset>, DeviceError> {
        if utc.year() < FIRST_SYNCED_YEAR {
            return Err(DeviceError::TimeNotSynced);
        }
        let local = utc.with_timezone(&self.timezone);
        Ok(local.with_timezone(&local.offset().fix()))
    }
}

impl WallClock for ZonedClock {
    fn local_now(&self) -> Result<NaiveDateTime, DeviceError> {
        self.now_in_timezone(Utc::now()).map(|now| now.naive_local())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unsynced_epoch_time_is_reported() {
        let clock = ZonedClock::new("America/Sao_Paulo").unwrap();
        let boot = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 42).unwrap();
        assert_eq!(clock.now_in_timezone(boot), Err(DeviceError::TimeNotSynced));
    }

    #[test]
    fn converts_to_local_time() {
        let clock = ZonedClock::new("America/Sao_Paulo").unwrap();
        let utc = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let local = clock.now_in_timezone(utc).unwrap();

        assert_eq!(local.hour(), 9);
        assert_eq!(local.offset().local_minus_utc(), -3 * 3600);
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(ZonedClock::new("Mars/Olympus_Mons").is_err());
        assert_eq!(ZonedClock::utc().timezone(), Tz::UTC);
    }
}
