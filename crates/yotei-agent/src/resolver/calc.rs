use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::{monday_of, normalize_hhmm, weekday_ja};

/// A resolved calendar day with its Japanese weekday label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayInfo {
    pub date: NaiveDate,
    pub weekday: &'static str,
}

/// Monday..Sunday week enclosing a base date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekRange {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Result of minute arithmetic; the date moves when the time crosses
/// midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeShift {
    pub date: NaiveDate,
    pub time: String,
    pub weekday: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateInfo {
    pub date: NaiveDate,
    pub weekday: &'static str,
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

fn day_info(date: NaiveDate) -> DayInfo {
    DayInfo {
        date,
        weekday: weekday_ja(date),
    }
}

/// base_date から offset_days 日後（負なら前）の日付を返す。
pub fn calc_date_offset(base_date: NaiveDate, offset_days: i64) -> Result<DayInfo, String> {
    base_date
        .checked_add_signed(Duration::days(offset_days))
        .map(day_info)
        .ok_or_else(|| format!("offset_days が計算可能な範囲を超えています: {offset_days}"))
}

/// 指定月の月初(start)または月末(end)を返す。
pub fn calc_month_boundary(year: i32, month: u32, boundary: &str) -> Result<DayInfo, String> {
    if !(1..=12).contains(&month) {
        return Err(format!("month は 1〜12 で指定してください: {month}"));
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| format!("year が計算可能な範囲を超えています: {year}"))?;
    let result = match boundary {
        "start" => first,
        "end" => {
            let next_first = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
            .ok_or_else(|| format!("year が計算可能な範囲を超えています: {year}"))?;
            next_first - Duration::days(1)
        }
        other => {
            return Err(format!(
                "boundary は 'start' または 'end' を指定してください: {other}"
            ))
        }
    };
    Ok(day_info(result))
}

/// base_date から最も近い指定曜日を forward/backward で探す。当日が該当なら当日を返す。
pub fn calc_nearest_weekday(
    base_date: NaiveDate,
    weekday: i64,
    direction: &str,
) -> Result<DayInfo, String> {
    if !(0..=6).contains(&weekday) {
        return Err(format!("weekday は 0(月)〜6(日) で指定してください: {weekday}"));
    }
    let current = base_date.weekday().num_days_from_monday() as i64;
    if current == weekday {
        return Ok(day_info(base_date));
    }
    let diff = match direction {
        "forward" => (weekday - current).rem_euclid(7),
        "backward" => -((current - weekday).rem_euclid(7)),
        other => {
            return Err(format!(
                "direction は 'forward' または 'backward' を指定してください: {other}"
            ))
        }
    };
    Ok(day_info(base_date + Duration::days(diff)))
}

/// base_date の週から week_offset 週後(負なら前)の指定曜日を返す。
pub fn calc_week_weekday(
    base_date: NaiveDate,
    week_offset: i64,
    weekday: i64,
) -> Result<DayInfo, String> {
    if !(0..=6).contains(&weekday) {
        return Err(format!("weekday は 0(月)〜6(日) で指定してください: {weekday}"));
    }
    let target_monday = monday_of(base_date)
        .checked_add_signed(Duration::weeks(week_offset))
        .ok_or_else(|| format!("week_offset が計算可能な範囲を超えています: {week_offset}"))?;
    Ok(day_info(target_monday + Duration::days(weekday)))
}

/// base_date が含まれる週の月曜〜日曜の範囲を返す。
pub fn calc_week_range(base_date: NaiveDate) -> WeekRange {
    let monday = monday_of(base_date);
    WeekRange {
        period_start: monday,
        period_end: monday + Duration::days(6),
    }
}

/// base_date + base_time から offset_minutes 分加減算する。日跨ぎも対応。
pub fn calc_time_offset(
    base_date: NaiveDate,
    base_time: &str,
    offset_minutes: i64,
) -> Result<TimeShift, String> {
    let normalized = normalize_hhmm(Some(base_time), "");
    if normalized.is_empty() {
        return Err(format!("base_time の形式が不正です: {base_time}"));
    }
    let time = NaiveTime::parse_from_str(&normalized, "%H:%M")
        .map_err(|_| format!("base_time の形式が不正です: {base_time}"))?;
    let result: NaiveDateTime = base_date
        .and_time(time)
        .checked_add_signed(Duration::minutes(offset_minutes))
        .ok_or_else(|| format!("offset_minutes が計算可能な範囲を超えています: {offset_minutes}"))?;
    Ok(TimeShift {
        date: result.date(),
        time: format!("{:02}:{:02}", result.hour(), result.minute()),
        weekday: weekday_ja(result.date()),
    })
}

/// 日付の曜日等の情報を返す。
pub fn get_date_info(date: NaiveDate) -> DateInfo {
    DateInfo {
        date,
        weekday: weekday_ja(date),
        year: date.year(),
        month: date.month(),
        day: date.day(),
    }
}
