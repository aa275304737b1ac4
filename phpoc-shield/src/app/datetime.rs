//! The shield's real-time clock.

use time::{Date, Month, PrimitiveDateTime, Time};

use crate::error::{Result, ShieldError};
use crate::hw_trait::Spi;
use crate::protocol::cmd;
use crate::shield::Shield;

/// Longest formatted date kept.
const DATE_LEN: usize = 64;

pub struct DateTime<'a, S: Spi> {
    shield: &'a mut Shield<S>,
}

impl<'a, S: Spi> DateTime<'a, S> {
    pub fn new(shield: &'a mut Shield<S>) -> Self {
        Self { shield }
    }

    /// Current date formatted by the shield. A non-empty `format` replaces
    /// the shield's format first (PHP `date()` syntax).
    pub async fn date(&mut self, format: &str) -> Result<String> {
        if !format.is_empty() {
            self.shield
                .engine
                .command_with_data(cmd!("sys date format"), &[format.as_bytes()])
                .await?;
        }
        self.shield.engine.query_string(cmd!("sys date"), DATE_LEN).await
    }

    async fn rtc(&mut self, field: &str) -> Result<u32> {
        self.shield.engine.query_int(cmd!("sys rtc get {}", field)).await
    }

    async fn rtc_u8(&mut self, field: &str) -> Result<u8> {
        let value = self.rtc(field).await?;
        u8::try_from(value).map_err(|_| ShieldError::Protocol(format!("rtc {} out of range: {}", field, value)))
    }

    pub async fn hour(&mut self) -> Result<u8> {
        self.rtc_u8("hour").await
    }

    pub async fn minute(&mut self) -> Result<u8> {
        self.rtc_u8("minute").await
    }

    pub async fn second(&mut self) -> Result<u8> {
        self.rtc_u8("second").await
    }

    pub async fn day(&mut self) -> Result<u8> {
        self.rtc_u8("day").await
    }

    /// 0 is Sunday.
    pub async fn day_of_week(&mut self) -> Result<u8> {
        self.rtc_u8("wday").await
    }

    pub async fn month(&mut self) -> Result<u8> {
        self.rtc_u8("month").await
    }

    pub async fn year(&mut self) -> Result<u16> {
        let value = self.rtc("year").await?;
        u16::try_from(value).map_err(|_| ShieldError::Protocol(format!("rtc year out of range: {}", value)))
    }

    /// The clock as one value. Fields are read one by one, so a rollover
    /// between reads is possible.
    pub async fn now(&mut self) -> Result<PrimitiveDateTime> {
        let year = self.year().await?;
        let month = self.month().await?;
        let day = self.day().await?;
        let hour = self.hour().await?;
        let minute = self.minute().await?;
        let second = self.second().await?;

        let invalid = |e: time::error::ComponentRange| ShieldError::Protocol(format!("invalid rtc value: {}", e));
        let month = Month::try_from(month).map_err(invalid)?;
        let date = Date::from_calendar_date(year as i32, month, day).map_err(invalid)?;
        let time = Time::from_hms(hour, minute, second).map_err(invalid)?;
        Ok(PrimitiveDateTime::new(date, time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShieldConfig;
    use crate::sim::{SimReply, SimShield};
    use time::macros::datetime;

    #[tokio::test(start_paused = true)]
    async fn test_rtc_fields() {
        for (sim, handle) in [SimShield::v1(), SimShield::v2()] {
            let mut shield = Shield::new(sim, ShieldConfig::default());
            shield.begin().await.unwrap();
            handle.clear_commands();

            let mut clock = DateTime::new(&mut shield);
            assert_eq!(clock.hour().await.unwrap(), 9);
            assert_eq!(clock.day_of_week().await.unwrap(), 5);
            assert_eq!(clock.year().await.unwrap(), 2026);
            assert_eq!(clock.now().await.unwrap(), datetime!(2026-10-16 09:30:00));
            assert_eq!(handle.commands()[0], "sys rtc get hour");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_date_with_format() {
        let (sim, handle) = SimShield::v2();
        let mut shield = Shield::new(sim, ShieldConfig::default());
        shield.begin().await.unwrap();

        let mut clock = DateTime::new(&mut shield);
        assert_eq!(clock.date("YmdHis").await.unwrap(), "20261016093000");
        assert_eq!(handle.data_for("sys date format"), vec![b"YmdHis".to_vec()]);

        // empty format keeps the shield's
        clock.date("").await.unwrap();
        assert_eq!(handle.count_commands("sys date format"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_rtc_value() {
        let (sim, handle) = SimShield::v1();
        handle.set_value("sys rtc get month", SimReply::Int(13));
        let mut shield = Shield::new(sim, ShieldConfig::default());
        shield.begin().await.unwrap();

        let mut clock = DateTime::new(&mut shield);
        assert!(matches!(clock.now().await, Err(ShieldError::Protocol(_))));
    }
}
