//! Natural-language date/time resolution. Pure functions: callers supply
//! the base date and time, nothing here touches a clock or the store.

pub mod calc;

use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use regex::Regex;

pub const WEEKDAY_NAMES_JA: [&str; 7] = [
    "月曜日",
    "火曜日",
    "水曜日",
    "木曜日",
    "金曜日",
    "土曜日",
    "日曜日",
];

pub fn weekday_ja(date: NaiveDate) -> &'static str {
    WEEKDAY_NAMES_JA[date.weekday().num_days_from_monday() as usize]
}

/// Monday of the week containing `date`.
pub fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Monday..Sunday bounds of the week containing `anchor`.
pub fn week_bounds(anchor: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = monday_of(anchor);
    (start, start + Duration::days(6))
}

// ─── HH:MM normalization ──────────────────────────────────────────────

static HHMM_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3])\s*:\s*([0-5]\d)$").unwrap());
static HOUR_JA_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([01]?\d|2[0-3])\s*時(?:\s*([0-5]?\d)\s*分?)?$").unwrap());

/// Normalize a time-ish string to `HH:MM`; anything unrecognized becomes
/// `fallback` (which may itself be empty).
pub fn normalize_hhmm(value: Option<&str>, fallback: &str) -> String {
    let text = match value {
        Some(v) => v.trim(),
        None => return fallback.to_string(),
    };
    if text.is_empty() {
        return fallback.to_string();
    }

    if let Some(caps) = HHMM_FULL.captures(text) {
        let hour: u32 = caps[1].parse().unwrap();
        let minute: u32 = caps[2].parse().unwrap();
        return format!("{hour:02}:{minute:02}");
    }

    if let Some(caps) = HOUR_JA_FULL.captures(text) {
        let hour: u32 = caps[1].parse().unwrap();
        let minute: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap());
        return format!("{hour:02}:{minute:02}");
    }

    match text {
        "正午" => "12:00".to_string(),
        "深夜" | "真夜中" => "00:00".to_string(),
        _ => fallback.to_string(),
    }
}

// ─── Explicit time extraction ─────────────────────────────────────────

static TIME_COLON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([01]?\d|2[0-3])\s*:\s*([0-5]\d)").unwrap());
static TIME_AMPM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(午前|午後)\s*([0-1]?\d)\s*時(?:\s*([0-5]?\d)\s*分?)?").unwrap());
static TIME_HALF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([01]?\d|2[0-3])\s*時\s*半").unwrap());
static TIME_HOUR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([01]?\d|2[0-3])\s*時(?:\s*([0-5]?\d)\s*分?)?").unwrap());

fn extract_explicit_time(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = TIME_COLON.captures(text) {
        let hour: u32 = caps[1].parse().unwrap();
        let minute: u32 = caps[2].parse().unwrap();
        return Some(format!("{hour:02}:{minute:02}"));
    }

    if let Some(caps) = TIME_AMPM.captures(text) {
        let marker = &caps[1];
        let mut hour: u32 = caps[2].parse().unwrap();
        let minute: u32 = caps.get(3).map_or(0, |m| m.as_str().parse().unwrap());
        if hour > 12 || minute > 59 {
            return None;
        }
        if marker == "午後" && hour < 12 {
            hour += 12;
        }
        if marker == "午前" && hour == 12 {
            hour = 0;
        }
        return Some(format!("{hour:02}:{minute:02}"));
    }

    if let Some(caps) = TIME_HALF.captures(text) {
        let hour: u32 = caps[1].parse().unwrap();
        return Some(format!("{hour:02}:30"));
    }

    if let Some(caps) = TIME_HOUR.captures(text) {
        let hour: u32 = caps[1].parse().unwrap();
        let minute: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap());
        return Some(format!("{hour:02}:{minute:02}"));
    }

    if text.contains("正午") {
        return Some("12:00".to_string());
    }
    if text.contains("深夜") || text.contains("真夜中") {
        return Some("00:00".to_string());
    }

    None
}

// ─── Relative time deltas ─────────────────────────────────────────────

static DELTA_HOURS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*時間(?:\s*(\d+)\s*分)?\s*(後|前|まえ)").unwrap());
static DELTA_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*分\s*(後|前|まえ)").unwrap());

/// Signed minute delta for `N時間[M分]{後,前}` / `N分{後,前}`.
fn extract_relative_time_delta(text: &str) -> Option<i64> {
    if let Some(caps) = DELTA_HOURS.captures(text) {
        let hours: i64 = caps[1].parse().ok()?;
        let minutes: i64 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
        let sign = if &caps[3] == "後" { 1 } else { -1 };
        return Some(sign * (hours * 60 + minutes));
    }
    if let Some(caps) = DELTA_MINUTES.captures(text) {
        let minutes: i64 = caps[1].parse().ok()?;
        let sign = if &caps[2] == "後" { 1 } else { -1 };
        return Some(sign * minutes);
    }
    None
}

// ─── Weekday / week-shift tokens ──────────────────────────────────────

static WEEKDAY_JA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(月|火|水|木|金|土|日)曜(?:日)?").unwrap());
static WEEKDAY_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(monday|mon|tuesday|tue|wednesday|wed|thursday|thu|friday|fri|saturday|sat|sunday|sun)\b",
    )
    .unwrap()
});

/// Weekday index (0=Mon..6=Sun) named in the text, Japanese or English.
pub fn extract_weekday(text: &str) -> Option<u32> {
    if let Some(caps) = WEEKDAY_JA.captures(text) {
        return match &caps[1] {
            "月" => Some(0),
            "火" => Some(1),
            "水" => Some(2),
            "木" => Some(3),
            "金" => Some(4),
            "土" => Some(5),
            "日" => Some(6),
            _ => None,
        };
    }

    let lower = text.to_lowercase();
    if let Some(caps) = WEEKDAY_EN.captures(&lower) {
        return match &caps[1][..3] {
            "mon" => Some(0),
            "tue" => Some(1),
            "wed" => Some(2),
            "thu" => Some(3),
            "fri" => Some(4),
            "sat" => Some(5),
            "sun" => Some(6),
            _ => None,
        };
    }

    None
}

/// Week shift for relative-week tokens (今週=0, 来週=+1, 再来週=+2, 先週=-1).
pub fn extract_relative_week_shift(text: &str) -> Option<i64> {
    if text.contains("再来週") || text.contains("翌々週") {
        return Some(2);
    }
    if text.contains("来週") || text.contains("翌週") {
        return Some(1);
    }
    if text.contains("先週") {
        return Some(-1);
    }
    if text.contains("今週") {
        return Some(0);
    }
    None
}

fn resolve_week_period(text: &str, base_date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let shift = extract_relative_week_shift(text)?;
    if extract_weekday(text).is_some() {
        return None;
    }
    let start = monday_of(base_date) + Duration::weeks(shift);
    Some((start, start + Duration::days(6)))
}

// ─── Date expression ladder ───────────────────────────────────────────

static DATE_EXPLICIT_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})[/-](\d{1,2})[/-](\d{1,2})").unwrap());
static DATE_EXPLICIT_JA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})年\s*(\d{1,2})月\s*(\d{1,2})日?").unwrap());
static DATE_MONTH_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})月\s*(\d{1,2})日").unwrap());
// No lookaround in the regex crate; explicit non-digit boundary groups
// stand in for Python's (?<!\d)…(?!\d).
static DATE_SLASH_MONTH_DAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])(\d{1,2})/(\d{1,2})(?:[^0-9]|$)").unwrap());
static DATE_DAY_SHIFT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*日\s*(後|前|まえ)").unwrap());
static DATE_WEEK_SHIFT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(?:週間|週)\s*(後|前|まえ)").unwrap());

const RELATIVE_DAY_KEYWORDS: [(&str, i64); 11] = [
    ("一昨日", -2),
    ("おととい", -2),
    ("昨日", -1),
    ("きのう", -1),
    ("今日", 0),
    ("本日", 0),
    ("きょう", 0),
    ("明日", 1),
    ("あした", 1),
    ("明後日", 2),
    ("あさって", 2),
];

fn safe_build_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Roll a month/day forward one year when it already passed the base date.
fn month_day_candidate(base_date: NaiveDate, month: u32, day: u32) -> Option<NaiveDate> {
    let candidate = safe_build_date(base_date.year(), month, day)?;
    if candidate < base_date {
        return Some(safe_build_date(base_date.year() + 1, month, day).unwrap_or(candidate));
    }
    Some(candidate)
}

fn resolve_date_expression(text: &str, base_date: NaiveDate) -> Option<(NaiveDate, String)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    for pattern in [&DATE_EXPLICIT_NUMERIC, &DATE_EXPLICIT_JA] {
        if let Some(caps) = pattern.captures(text) {
            let year: i32 = caps[1].parse().ok()?;
            let month: u32 = caps[2].parse().ok()?;
            let day: u32 = caps[3].parse().ok()?;
            if let Some(date) = safe_build_date(year, month, day) {
                return Some((date, "explicit_date".to_string()));
            }
        }
    }

    if let Some(caps) = DATE_MONTH_DAY.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        if let Some(date) = month_day_candidate(base_date, month, day) {
            return Some((date, "month_day".to_string()));
        }
    }

    if let Some(caps) = DATE_SLASH_MONTH_DAY.captures(text) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        if let Some(date) = month_day_candidate(base_date, month, day) {
            return Some((date, "month_day_slash".to_string()));
        }
    }

    for (token, offset) in RELATIVE_DAY_KEYWORDS {
        if text.contains(token) {
            return Some((
                base_date + Duration::days(offset),
                "relative_keyword".to_string(),
            ));
        }
    }

    if let Some(caps) = DATE_DAY_SHIFT.captures(text) {
        let days: i64 = caps[1].parse().ok()?;
        let sign = if &caps[2] == "後" { 1 } else { -1 };
        return Some((
            base_date + Duration::days(sign * days),
            "relative_day".to_string(),
        ));
    }

    if let Some(caps) = DATE_WEEK_SHIFT.captures(text) {
        let weeks: i64 = caps[1].parse().ok()?;
        let sign = if &caps[2] == "後" { 1 } else { -1 };
        return Some((
            base_date + Duration::weeks(sign * weeks),
            "relative_week_count".to_string(),
        ));
    }

    if let Some(shift) = extract_relative_week_shift(text) {
        let weekday = extract_weekday(text).unwrap_or(0);
        let date = monday_of(base_date) + Duration::weeks(shift) + Duration::days(weekday as i64);
        return Some((date, "relative_week".to_string()));
    }

    if let Some(weekday) = extract_weekday(text) {
        let current = base_date.weekday().num_days_from_monday();
        let mut days_ahead = (weekday as i64 - current as i64).rem_euclid(7);
        if text.contains("次の") || text.contains("今度の") {
            if days_ahead == 0 {
                days_ahead = 7;
            }
            return Some((
                base_date + Duration::days(days_ahead),
                "next_weekday".to_string(),
            ));
        }
        if days_ahead == 0
            && !text.contains("今週")
            && !text.contains("今日")
            && !text.contains("本日")
        {
            days_ahead = 7;
        }
        return Some((base_date + Duration::days(days_ahead), "weekday".to_string()));
    }

    // Last-resort parse of unambiguous numeric shapes.
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some((date, "generic_parse".to_string()));
        }
    }

    None
}

// ─── Expression resolver ──────────────────────────────────────────────

/// A natural-language expression resolved to an absolute date and time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub date: NaiveDate,
    pub time: String,
    pub datetime: String,
    pub weekday: &'static str,
    pub source: String,
    /// Monday..Sunday period carried when a bare week token was resolved.
    pub period: Option<(NaiveDate, NaiveDate)>,
}

fn format_datetime(dt: NaiveDateTime) -> String {
    format!(
        "{}T{:02}:{:02}",
        dt.date().format("%Y-%m-%d"),
        dt.hour(),
        dt.minute()
    )
}

/// Resolve an arbitrary schedule expression against `base_date`/`base_time`.
/// `default_time` fills in when the expression names no explicit time.
pub fn resolve_schedule_expression(
    expression: &str,
    base_date: NaiveDate,
    base_time: &str,
    default_time: &str,
) -> Result<Resolved, String> {
    let text = expression.trim();
    if text.is_empty() {
        return Err("expression が空です。".to_string());
    }

    let normalized_base_time = normalize_hhmm(Some(base_time), "00:00");
    let normalized_default_time = normalize_hhmm(Some(default_time), &normalized_base_time);
    let base_naive_time = NaiveTime::parse_from_str(&normalized_base_time, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    let base_datetime = base_date.and_time(base_naive_time);

    if let Some(delta_minutes) = extract_relative_time_delta(text) {
        let resolved = base_datetime + Duration::minutes(delta_minutes);
        return Ok(Resolved {
            date: resolved.date(),
            time: format!("{:02}:{:02}", resolved.hour(), resolved.minute()),
            datetime: format_datetime(resolved),
            weekday: weekday_ja(resolved.date()),
            source: "relative_time_delta".to_string(),
            period: None,
        });
    }

    let (resolved_date, date_source) = resolve_date_expression(text, base_date)
        .ok_or_else(|| format!("日付表現を解釈できませんでした: {text}"))?;

    let explicit_time = extract_explicit_time(text);
    let resolved_time = explicit_time
        .clone()
        .unwrap_or(normalized_default_time);
    let time = NaiveTime::parse_from_str(&resolved_time, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap());

    let source = if explicit_time.is_some() {
        format!("{date_source}+explicit_time")
    } else {
        date_source
    };

    Ok(Resolved {
        date: resolved_date,
        time: resolved_time,
        datetime: format_datetime(resolved_date.and_time(time)),
        weekday: weekday_ja(resolved_date),
        source,
        period: resolve_week_period(text, base_date),
    })
}

// ─── Predicates and parsing helpers ───────────────────────────────────

static RELATIVE_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*(日|週|週間|時間|分)\s*(後|前|まえ)").unwrap());
static ISO_DATE_FULL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

const RELATIVE_TOKENS: [&str; 17] = [
    "今日",
    "本日",
    "明日",
    "明後日",
    "昨日",
    "一昨日",
    "来週",
    "再来週",
    "先週",
    "今週",
    "次の",
    "今度の",
    "きょう",
    "あした",
    "あさって",
    "きのう",
    "おととい",
];

/// True when the text contains any relative date/time token, weekday name,
/// or numeric offset. Gates whether the orchestrator must insert a
/// resolver step before mutations.
pub fn is_relative_datetime_text(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    if RELATIVE_TOKENS.iter().any(|token| text.contains(token)) {
        return true;
    }
    if RELATIVE_NUMERIC.is_match(text) {
        return true;
    }
    if WEEKDAY_JA.is_match(text) {
        return true;
    }
    WEEKDAY_EN.is_match(&text.to_lowercase())
}

/// Anything other than strict `YYYY-MM-DD` needs resolution first.
pub fn requires_date_resolution(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    !ISO_DATE_FULL.is_match(text)
}

/// Strict `YYYY-MM-DD` parse.
pub fn try_parse_iso_date(value: &str) -> Option<NaiveDate> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// Lenient parse falling back to `default_date`.
pub fn parse_date_or(value: Option<&str>, default_date: NaiveDate) -> NaiveDate {
    let text = match value {
        Some(v) => v.trim(),
        None => return default_date,
    };
    if text.is_empty() {
        return default_date;
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date;
        }
    }
    default_date
}
