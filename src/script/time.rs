//! Wall-clock instants as seen by scripts.
//!
//! Scripts receive instants as tables broken into calendar fields in the
//! host's configured timezone, plus `epoch_millis` which is what the host
//! reads back.

use chrono::{DateTime, Datelike, Days, Months, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use mlua::{Lua, Table, Value};

use crate::{HostError, Result};

const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;

/// Converts between epoch milliseconds and script instant tables.
#[derive(Debug, Clone, Copy)]
pub struct ScriptClock {
    tz: Tz,
}

impl ScriptClock {
    /// Clock for a timezone name such as `"Asia/Tokyo"` or `"UTC"`.
    pub fn new(timezone: &str) -> Result<Self> {
        let tz = timezone
            .parse()
            .map_err(|_| HostError::Config(format!("unknown timezone `{timezone}`")))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Current wall-clock time.
    pub fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn local(&self, millis: i64) -> mlua::Result<DateTime<Tz>> {
        DateTime::from_timestamp_millis(millis)
            .map(|utc| utc.with_timezone(&self.tz))
            .ok_or_else(|| mlua::Error::RuntimeError(format!("instant {millis} out of range")))
    }

    /// Break `millis` into an instant table.
    pub fn instant_table(&self, lua: &Lua, millis: i64) -> mlua::Result<Table> {
        let local = self.local(millis)?;
        let table = lua.create_table()?;

        table.raw_set("epoch_millis", millis)?;
        table.raw_set("year", local.year())?;
        table.raw_set("month", local.month())?;
        table.raw_set("day", local.day())?;
        table.raw_set("hour", local.hour())?;
        table.raw_set("minute", local.minute())?;
        table.raw_set("second", local.second())?;
        table.raw_set("millisecond", local.timestamp_subsec_millis())?;
        table.raw_set("weekday", local.weekday().number_from_monday())?;
        table.raw_set("yearday", local.ordinal())?;
        table.raw_set("timezone", self.tz.name())?;

        Ok(table)
    }

    /// Epoch milliseconds of an instant table or a bare number.
    pub fn millis_of(&self, value: &Value) -> mlua::Result<i64> {
        match value {
            Value::Integer(i) => Ok(*i),
            Value::Number(n) if n.fract() == 0.0 => Ok(*n as i64),
            Value::Table(table) => {
                let millis: Option<i64> = table.raw_get("epoch_millis")?;
                if let Some(millis) = millis {
                    return Ok(millis);
                }
                self.millis_from_fields(table)
            }
            other => Err(mlua::Error::RuntimeError(format!(
                "expected an instant, got {}",
                other.type_name()
            ))),
        }
    }

    /// Instant from calendar fields; missing time fields default to zero.
    fn millis_from_fields(&self, table: &Table) -> mlua::Result<i64> {
        let field = |name: &str, default: Option<u32>| -> mlua::Result<u32> {
            let value: Option<u32> = table.raw_get(name)?;
            value.or(default).ok_or_else(|| {
                mlua::Error::RuntimeError(format!("instant table is missing `{name}`"))
            })
        };

        let year: i32 = table
            .raw_get::<Option<i32>>("year")?
            .ok_or_else(|| mlua::Error::RuntimeError("instant table is missing `year`".into()))?;
        let local = self
            .tz
            .with_ymd_and_hms(
                year,
                field("month", None)?,
                field("day", None)?,
                field("hour", Some(0))?,
                field("minute", Some(0))?,
                field("second", Some(0))?,
            )
            .earliest()
            .ok_or_else(|| mlua::Error::RuntimeError("instant does not exist".to_string()))?;

        Ok(local.timestamp_millis() + i64::from(field("millisecond", Some(0))?))
    }

    /// Add a duration to an instant.
    ///
    /// A number is taken as milliseconds. A table may hold `years`,
    /// `months`, `weeks`, `days`, `hours`, `minutes`, `seconds` and
    /// `millis`; calendar parts follow the local calendar, so adding one day
    /// across a daylight-saving change keeps the wall-clock time.
    pub fn add_duration(&self, millis: i64, duration: &Value) -> mlua::Result<i64> {
        let overflow = || mlua::Error::RuntimeError("duration out of range".to_string());

        let table = match duration {
            Value::Integer(delta) => return millis.checked_add(*delta).ok_or_else(overflow),
            Value::Number(delta) => {
                return millis.checked_add(delta.round() as i64).ok_or_else(overflow)
            }
            Value::Table(table) => table,
            other => {
                return Err(mlua::Error::RuntimeError(format!(
                    "expected a duration, got {}",
                    other.type_name()
                )))
            }
        };

        let part = |name: &str| -> mlua::Result<i64> {
            Ok(table.raw_get::<Option<i64>>(name)?.unwrap_or(0))
        };

        let months = part("years")?
            .checked_mul(12)
            .and_then(|m| m.checked_add(part("months").ok()?))
            .ok_or_else(overflow)?;
        let days = part("weeks")?
            .checked_mul(7)
            .and_then(|d| d.checked_add(part("days").ok()?))
            .ok_or_else(overflow)?;

        let mut local = self.local(millis)?;
        if months != 0 {
            let amount = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?);
            local = if months > 0 {
                local.checked_add_months(amount)
            } else {
                local.checked_sub_months(amount)
            }
            .ok_or_else(overflow)?;
        }
        if days != 0 {
            let amount = Days::new(days.unsigned_abs());
            local = if days > 0 {
                local.checked_add_days(amount)
            } else {
                local.checked_sub_days(amount)
            }
            .ok_or_else(overflow)?;
        }

        let fixed = [
            (part("hours")?, MILLIS_PER_HOUR),
            (part("minutes")?, MILLIS_PER_MINUTE),
            (part("seconds")?, MILLIS_PER_SECOND),
            (part("millis")?, 1),
        ]
        .into_iter()
        .try_fold(0i64, |acc, (amount, unit)| {
            amount.checked_mul(unit).and_then(|m| acc.checked_add(m))
        })
        .ok_or_else(overflow)?;

        local
            .timestamp_millis()
            .checked_add(fixed)
            .ok_or_else(overflow)
    }
}
