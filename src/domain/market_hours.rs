//! US equity market session calendar.
//!
//! All session boundaries are defined in US Eastern time. The UTC offset is
//! derived directly from the DST rule (second Sunday of March through the
//! first Sunday of November) so the result does not depend on the host
//! timezone database.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc, Weekday};
use std::fmt;

/// Time-of-day trading session on US exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketSession {
    /// Pre-market, 04:00-09:30 ET.
    Pre,
    /// Regular trading hours, 09:30-16:00 ET.
    Regular,
    /// After-hours, 16:00-20:00 ET.
    After,
    /// Overnight and weekends.
    Closed,
}

impl MarketSession {
    /// Orders can go out during any session except `Closed`.
    pub fn is_tradable(&self) -> bool {
        !matches!(self, MarketSession::Closed)
    }
}

impl fmt::Display for MarketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketSession::Pre => write!(f, "PRE"),
            MarketSession::Regular => write!(f, "REGULAR"),
            MarketSession::After => write!(f, "AFTER"),
            MarketSession::Closed => write!(f, "CLOSED"),
        }
    }
}

fn first_sunday_on_or_after(mut date: NaiveDate) -> NaiveDate {
    while date.weekday() != Weekday::Sun {
        date += Duration::days(1);
    }
    date
}

/// DST window for the given year: [second Sunday of March, first Sunday of
/// November).
fn dst_bounds(year: i32) -> (NaiveDate, NaiveDate) {
    let march_8 = NaiveDate::from_ymd_opt(year, 3, 8).unwrap_or_default();
    let november_1 = NaiveDate::from_ymd_opt(year, 11, 1).unwrap_or_default();
    (
        first_sunday_on_or_after(march_8),
        first_sunday_on_or_after(november_1),
    )
}

pub fn is_dst(utc_date: NaiveDate) -> bool {
    let (start, end) = dst_bounds(utc_date.year());
    utc_date >= start && utc_date < end
}

/// Convert a UTC instant to naive US Eastern time (EDT or EST).
pub fn to_eastern(utc: DateTime<Utc>) -> NaiveDateTime {
    let offset_hours = if is_dst(utc.date_naive()) { 4 } else { 5 };
    utc.naive_utc() - Duration::hours(offset_hours)
}

/// Calendar date in US Eastern time; trades on the same Eastern date belong
/// to the same trading day regardless of session.
pub fn eastern_trade_date(utc: DateTime<Utc>) -> NaiveDate {
    to_eastern(utc).date()
}

pub fn session_at(utc: DateTime<Utc>) -> MarketSession {
    let eastern = to_eastern(utc);

    if matches!(eastern.weekday(), Weekday::Sat | Weekday::Sun) {
        return MarketSession::Closed;
    }

    let minutes = eastern.hour() * 60 + eastern.minute();
    match minutes {
        m if (570..960).contains(&m) => MarketSession::Regular,
        m if (240..570).contains(&m) => MarketSession::Pre,
        m if (960..1200).contains(&m) => MarketSession::After,
        _ => MarketSession::Closed,
    }
}

pub fn current_session() -> MarketSession {
    session_at(Utc::now())
}
