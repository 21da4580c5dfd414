use chrono::{Datelike, Duration, NaiveDate};
use libsql::Connection;
use serde_json::{json, Value};
use yotei_core::error::Result;
use yotei_core::types::Routine;

use crate::actions::ActionCall;
use crate::resolver::calc::{
    calc_date_offset, calc_month_boundary, calc_nearest_weekday, calc_time_offset, calc_week_range,
    calc_week_weekday, get_date_info, DayInfo,
};
use crate::resolver::{
    is_relative_datetime_text, normalize_hhmm, parse_date_or, requires_date_resolution,
    resolve_schedule_expression, try_parse_iso_date,
};
use crate::store::{queries, ScheduleStore};

/// Outcome of applying one action batch. Failed actions become error lines,
/// not `Err`: the orchestrator treats everything past the first round as
/// data.
#[derive(Debug, Default, Clone)]
pub struct ApplyOutcome {
    pub results: Vec<String>,
    pub errors: Vec<String>,
    pub modified_ids: Vec<String>,
}

/// Apply a batch of actions sequentially inside one transaction. Validation
/// failures skip to the next action; a storage failure rolls the whole
/// batch back, discards `results` and reports one synthetic error. Commits
/// only when at least one write happened.
pub async fn apply_actions(
    store: &ScheduleStore,
    actions: &[ActionCall],
    default_date: NaiveDate,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    if actions.is_empty() {
        return outcome;
    }

    let conn = store.conn();
    let tx = match conn.transaction().await {
        Ok(tx) => tx,
        Err(e) => {
            outcome.errors.push(format!("操作の適用に失敗しました: {e}"));
            return outcome;
        }
    };

    match run_batch(&tx, actions, default_date, &mut outcome).await {
        Ok(dirty) => {
            let finish = if dirty { tx.commit().await } else { tx.rollback().await };
            if let Err(e) = finish {
                outcome.results.clear();
                outcome.errors.push(format!("操作の適用に失敗しました: {e}"));
            }
        }
        Err(e) => {
            let _ = tx.rollback().await;
            outcome.results.clear();
            outcome.errors.push(format!("操作の適用に失敗しました: {e}"));
        }
    }

    outcome
}

// ─── Argument coercion ────────────────────────────────────────────────

fn arg_str<'a>(action: &'a ActionCall, key: &str) -> Option<&'a str> {
    action.arg(key).and_then(Value::as_str)
}

/// Integer argument; numeric strings are tolerated because models send
/// both.
fn arg_int(action: &ActionCall, key: &str) -> Option<i64> {
    match action.arg(key) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_from_value(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        },
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        _ => default,
    }
}

fn needs_resolution(action: &ActionCall, key: &str) -> bool {
    matches!(arg_str(action, key), Some(s) if requires_date_resolution(s))
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn day_info_json(info: &DayInfo) -> Value {
    json!({ "ok": true, "date": iso(info.date), "weekday": info.weekday })
}

// ─── Routine name matching ────────────────────────────────────────────

const DELETE_ALL_ROUTINE_TOKENS: [&str; 13] = [
    "all",
    "allroutine",
    "allroutines",
    "全部",
    "すべて",
    "全て",
    "全件",
    "全ルーチン",
    "全ルーティン",
    "すべてのルーチン",
    "すべてのルーティン",
    "全部のルーチン",
    "全部のルーティン",
];

const ROUTINE_NAME_SUFFIXES: [&str; 4] = ["ルーチン", "ルーティン", "routine", "routines"];

fn normalize_routine_name_key(value: &str) -> String {
    let text = value.trim().trim_matches(|c| "「」『』\"'`".contains(c));
    let text = text.replace('　', " ");
    text.split_whitespace()
        .collect::<String>()
        .to_lowercase()
}

fn routine_name_candidates(value: &str) -> Vec<String> {
    let base = normalize_routine_name_key(value);
    if base.is_empty() {
        return vec![];
    }
    let mut candidates = vec![base.clone()];
    for suffix in ROUTINE_NAME_SUFFIXES {
        if base.ends_with(suffix) && base.len() > suffix.len() {
            candidates.push(base[..base.len() - suffix.len()].to_string());
        }
        let suffix_with_no = format!("の{suffix}");
        if base.ends_with(&suffix_with_no) && base.len() > suffix_with_no.len() {
            candidates.push(base[..base.len() - suffix_with_no.len()].to_string());
        }
    }
    candidates.retain(|c| !c.is_empty());
    candidates.dedup();
    candidates
}

fn is_delete_all_routine_request(action: &ActionCall, routine_name: Option<&str>) -> bool {
    if bool_from_value(action.arg("all"), false) {
        return true;
    }
    if let Some(scope) = arg_str(action, "scope") {
        let key = normalize_routine_name_key(scope);
        if !key.is_empty() && DELETE_ALL_ROUTINE_TOKENS.contains(&key.as_str()) {
            return true;
        }
    }
    match routine_name {
        Some(name) => {
            let key = normalize_routine_name_key(name);
            !key.is_empty() && DELETE_ALL_ROUTINE_TOKENS.contains(&key.as_str())
        }
        None => false,
    }
}

/// Exact-key matches first; partial (substring) matches only when nothing
/// is exact. Returns the matches and whether they were exact.
fn match_routines_by_name(routines: &[Routine], routine_name: &str) -> (Vec<Routine>, bool) {
    let candidates = routine_name_candidates(routine_name);
    if candidates.is_empty() {
        return (vec![], false);
    }

    let keyed: Vec<(&Routine, String)> = routines
        .iter()
        .map(|r| (r, normalize_routine_name_key(&r.name)))
        .collect();

    let mut exact: Vec<Routine> = Vec::new();
    for candidate in &candidates {
        for (routine, key) in &keyed {
            if key == candidate && !exact.iter().any(|r| r.id == routine.id) {
                exact.push((*routine).clone());
            }
        }
    }
    if !exact.is_empty() {
        return (exact, true);
    }

    let mut partial: Vec<Routine> = Vec::new();
    for candidate in &candidates {
        for (routine, key) in &keyed {
            if key.contains(candidate.as_str()) && !partial.iter().any(|r| r.id == routine.id) {
                partial.push((*routine).clone());
            }
        }
    }
    (partial, false)
}

pub(crate) fn routine_matches_weekday(routine: &Routine, weekday: u32) -> bool {
    routine
        .days
        .split(',')
        .any(|token| token == weekday.to_string())
}

// ─── Batch execution ──────────────────────────────────────────────────

struct BatchState<'a> {
    outcome: &'a mut ApplyOutcome,
    dirty: bool,
}

impl BatchState<'_> {
    fn result(&mut self, line: String) {
        self.outcome.results.push(line);
    }
    fn error(&mut self, line: impl Into<String>) {
        self.outcome.errors.push(line.into());
    }
    fn modified(&mut self, token: String) {
        self.outcome.modified_ids.push(token);
    }
}

async fn run_batch(
    conn: &Connection,
    actions: &[ActionCall],
    default_date: NaiveDate,
    outcome: &mut ApplyOutcome,
) -> Result<bool> {
    let mut state = BatchState {
        outcome,
        dirty: false,
    };

    for action in actions {
        apply_one(conn, action, default_date, &mut state).await?;
    }

    Ok(state.dirty)
}

async fn apply_one(
    conn: &Connection,
    action: &ActionCall,
    default_date: NaiveDate,
    state: &mut BatchState<'_>,
) -> Result<()> {
    match action.name.as_str() {
        // ---------- 原子的計算ツール ----------
        "calc_date_offset" => {
            let Some(base_date) = arg_str(action, "base_date").and_then(try_parse_iso_date) else {
                state.error("calc_date_offset: base_date が不正です。YYYY-MM-DD で指定してください。");
                return Ok(());
            };
            let offset = match action.arg("offset_days") {
                None => 0,
                Some(_) => match arg_int(action, "offset_days") {
                    Some(n) => n,
                    None => {
                        state.error("calc_date_offset: offset_days が整数ではありません。");
                        return Ok(());
                    }
                },
            };
            match calc_date_offset(base_date, offset) {
                Ok(info) => state.result(format!(
                    "計算結果(calc_date_offset): {}",
                    day_info_json(&info)
                )),
                Err(e) => state.error(format!("calc_date_offset: {e}")),
            }
        }

        "calc_month_boundary" => {
            let year = arg_int(action, "year");
            let month = arg_int(action, "month");
            let (Some(year), Some(month)) = (year, month) else {
                state.error("calc_month_boundary: year/month が整数ではありません。");
                return Ok(());
            };
            if !(1..=12).contains(&month) {
                state.error(format!(
                    "calc_month_boundary: month は 1〜12 で指定してください: {month}"
                ));
                return Ok(());
            }
            let boundary = arg_str(action, "boundary").unwrap_or("").trim().to_string();
            match calc_month_boundary(year as i32, month as u32, &boundary) {
                Ok(info) => state.result(format!(
                    "計算結果(calc_month_boundary): {}",
                    day_info_json(&info)
                )),
                Err(e) => state.error(format!("calc_month_boundary: {e}")),
            }
        }

        "calc_nearest_weekday" => {
            let Some(base_date) = arg_str(action, "base_date").and_then(try_parse_iso_date) else {
                state.error(
                    "calc_nearest_weekday: base_date が不正です。YYYY-MM-DD で指定してください。",
                );
                return Ok(());
            };
            let Some(weekday) = arg_int(action, "weekday") else {
                state.error("calc_nearest_weekday: weekday が整数ではありません。");
                return Ok(());
            };
            let direction = arg_str(action, "direction").unwrap_or("").trim().to_string();
            match calc_nearest_weekday(base_date, weekday, &direction) {
                Ok(info) => state.result(format!(
                    "計算結果(calc_nearest_weekday): {}",
                    day_info_json(&info)
                )),
                Err(e) => state.error(format!("calc_nearest_weekday: {e}")),
            }
        }

        "calc_week_weekday" => {
            let Some(base_date) = arg_str(action, "base_date").and_then(try_parse_iso_date) else {
                state.error("calc_week_weekday: base_date が不正です。YYYY-MM-DD で指定してください。");
                return Ok(());
            };
            let week_offset = match action.arg("week_offset") {
                None => Some(0),
                Some(_) => arg_int(action, "week_offset"),
            };
            let (Some(week_offset), Some(weekday)) = (week_offset, arg_int(action, "weekday"))
            else {
                state.error("calc_week_weekday: week_offset/weekday が整数ではありません。");
                return Ok(());
            };
            match calc_week_weekday(base_date, week_offset, weekday) {
                Ok(info) => state.result(format!(
                    "計算結果(calc_week_weekday): {}",
                    day_info_json(&info)
                )),
                Err(e) => state.error(format!("calc_week_weekday: {e}")),
            }
        }

        "calc_week_range" => {
            let Some(base_date) = arg_str(action, "base_date").and_then(try_parse_iso_date) else {
                state.error("calc_week_range: base_date が不正です。YYYY-MM-DD で指定してください。");
                return Ok(());
            };
            let range = calc_week_range(base_date);
            let payload = json!({
                "ok": true,
                "period_start": iso(range.period_start),
                "period_start_weekday": crate::resolver::weekday_ja(range.period_start),
                "period_end": iso(range.period_end),
                "period_end_weekday": crate::resolver::weekday_ja(range.period_end),
            });
            state.result(format!("計算結果(calc_week_range): {payload}"));
        }

        "calc_time_offset" => {
            let Some(base_date) = arg_str(action, "base_date").and_then(try_parse_iso_date) else {
                state.error("calc_time_offset: base_date が不正です。YYYY-MM-DD で指定してください。");
                return Ok(());
            };
            let base_time = arg_str(action, "base_time").unwrap_or("").trim().to_string();
            let offset_minutes = match action.arg("offset_minutes") {
                None => Some(0),
                Some(_) => arg_int(action, "offset_minutes"),
            };
            let Some(offset_minutes) = offset_minutes else {
                state.error("calc_time_offset: offset_minutes が整数ではありません。");
                return Ok(());
            };
            match calc_time_offset(base_date, &base_time, offset_minutes) {
                Ok(shift) => {
                    let payload = json!({
                        "ok": true,
                        "date": iso(shift.date),
                        "time": shift.time,
                        "weekday": shift.weekday,
                    });
                    state.result(format!("計算結果(calc_time_offset): {payload}"));
                }
                Err(e) => state.error(format!("calc_time_offset: {e}")),
            }
        }

        "get_date_info" => {
            let Some(date) = arg_str(action, "date").and_then(try_parse_iso_date) else {
                state.error("get_date_info: date が不正です。YYYY-MM-DD で指定してください。");
                return Ok(());
            };
            let info = get_date_info(date);
            let payload = json!({
                "ok": true,
                "date": iso(info.date),
                "weekday": info.weekday,
                "year": info.year,
                "month": info.month,
                "day": info.day,
            });
            state.result(format!("計算結果(get_date_info): {payload}"));
        }

        "resolve_schedule_expression" => {
            let Some(expression) = arg_str(action, "expression").filter(|s| !s.trim().is_empty())
            else {
                state.error("resolve_schedule_expression: expression が指定されていません。");
                return Ok(());
            };
            let base_date = parse_date_or(arg_str(action, "base_date"), default_date);
            let fallback_base_time = chrono::Local::now().format("%H:%M").to_string();
            let base_time = normalize_hhmm(arg_str(action, "base_time"), &fallback_base_time);
            let default_time = normalize_hhmm(arg_str(action, "default_time"), &base_time);
            match resolve_schedule_expression(expression, base_date, &base_time, &default_time) {
                Ok(resolved) => {
                    let mut line = format!(
                        "計算結果: expression={} date={} time={} datetime={} source={}",
                        expression.trim(),
                        iso(resolved.date),
                        resolved.time,
                        resolved.datetime,
                        resolved.source,
                    );
                    if let Some((start, end)) = resolved.period {
                        line.push_str(&format!(
                            " period_start={} period_end={}",
                            iso(start),
                            iso(end)
                        ));
                    }
                    state.result(line);
                }
                Err(e) => state.error(format!("resolve_schedule_expression: {e}")),
            }
        }

        // ---------- カスタムタスク ----------
        "create_custom_task" => {
            let Some(name) = arg_str(action, "name").filter(|s| !s.trim().is_empty()) else {
                state.error("create_custom_task: name が指定されていません。");
                return Ok(());
            };
            if needs_resolution(action, "date") {
                state.error(
                    "create_custom_task: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日時へ変換してください。",
                );
                return Ok(());
            }
            if matches!(arg_str(action, "time"), Some(t) if is_relative_datetime_text(t)) {
                state.error(
                    "create_custom_task: time に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日時へ変換してください。",
                );
                return Ok(());
            }
            let date = parse_date_or(arg_str(action, "date"), default_date);
            let time = arg_str(action, "time").unwrap_or("00:00").trim().to_string();
            let memo = arg_str(action, "memo").unwrap_or("").trim().to_string();
            let id = queries::insert_custom_task(conn, date, name.trim(), &time, &memo).await?;
            state.result(format!(
                "カスタムタスク「{}」(ID: {}) を {} の {} に追加しました。",
                name.trim(),
                id,
                iso(date),
                time
            ));
            state.modified(format!("item_custom_{id}"));
            state.dirty = true;
        }

        "create_tasks_in_range" => {
            let Some(name) = arg_str(action, "name").filter(|s| !s.trim().is_empty()) else {
                state.error("create_tasks_in_range: name が指定されていません。");
                return Ok(());
            };
            if needs_resolution(action, "start_date") || needs_resolution(action, "end_date") {
                state.error(
                    "create_tasks_in_range: 日付に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let start = arg_str(action, "start_date").and_then(try_parse_iso_date);
            let end = arg_str(action, "end_date").and_then(try_parse_iso_date);
            let (Some(start), Some(end)) = (start, end) else {
                state.error(
                    "create_tasks_in_range: start_date / end_date が YYYY-MM-DD 形式ではありません。",
                );
                return Ok(());
            };
            if start > end {
                state.error("create_tasks_in_range: start_date が end_date より後です。");
                return Ok(());
            }
            let span = (end - start).num_days() + 1;
            if span > 365 {
                state.error("create_tasks_in_range: 期間が長すぎます（最大365日）。");
                return Ok(());
            }
            let time = match arg_str(action, "time") {
                Some(t) if !t.trim().is_empty() => t.trim().to_string(),
                _ => "00:00".to_string(),
            };
            let memo = arg_str(action, "memo").unwrap_or("").trim().to_string();
            let mut current = start;
            while current <= end {
                let id =
                    queries::insert_custom_task(conn, current, name.trim(), &time, &memo).await?;
                state.modified(format!("item_custom_{id}"));
                current = current + Duration::days(1);
            }
            state.result(format!(
                "「{}」を {} から {} まで {} 件登録しました。",
                name.trim(),
                iso(start),
                iso(end),
                span
            ));
            state.dirty = true;
        }

        "delete_custom_task" => {
            let Some(task_id) = arg_int(action, "task_id") else {
                state.error("delete_custom_task: task_id が不正です。");
                return Ok(());
            };
            let Some(task) = queries::get_custom_task(conn, task_id).await? else {
                state.error(format!("task_id={task_id} が見つかりませんでした。"));
                return Ok(());
            };
            queries::delete_custom_task(conn, task_id).await?;
            state.result(format!("カスタムタスク「{}」を削除しました。", task.name));
            state.dirty = true;
        }

        "toggle_step" => {
            let Some(step_id) = arg_int(action, "step_id") else {
                state.error("toggle_step: step_id が不正です。");
                return Ok(());
            };
            let Some(step) = queries::get_step(conn, step_id).await? else {
                state.error(format!("step_id={step_id} が見つかりませんでした。"));
                return Ok(());
            };
            if needs_resolution(action, "date") {
                state.error(
                    "toggle_step: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let date = parse_date_or(arg_str(action, "date"), default_date);
            let done = bool_from_value(action.arg("done"), true);
            let memo = arg_str(action, "memo").map(str::trim);
            match queries::get_daily_log(conn, date, step.id).await? {
                Some(log) => {
                    let memo = memo.unwrap_or(log.memo.as_str());
                    queries::update_daily_log(conn, log.id, done, memo).await?;
                }
                None => {
                    queries::insert_daily_log(conn, date, step.id, done, memo.unwrap_or(""))
                        .await?;
                }
            }
            state.result(format!(
                "ステップ「{}」({}) を {} に更新しました。",
                step.name,
                iso(date),
                if done { "完了" } else { "未完了" }
            ));
            state.modified(format!("item_routine_{}", step.id));
            state.dirty = true;
        }

        "toggle_custom_task" => {
            let Some(task_id) = arg_int(action, "task_id") else {
                state.error("toggle_custom_task: task_id が不正です。");
                return Ok(());
            };
            let Some(task) = queries::get_custom_task(conn, task_id).await? else {
                state.error(format!("task_id={task_id} が見つかりませんでした。"));
                return Ok(());
            };
            let done = bool_from_value(action.arg("done"), true);
            let memo = arg_str(action, "memo").map(str::trim);
            queries::update_custom_task_done(conn, task_id, done, memo).await?;
            state.result(format!(
                "カスタムタスク「{}」を {} に更新しました。",
                task.name,
                if done { "完了" } else { "未完了" }
            ));
            state.modified(format!("item_custom_{task_id}"));
            state.dirty = true;
        }

        "update_custom_task_time" => {
            let Some(new_time) = arg_str(action, "new_time").filter(|s| !s.is_empty()) else {
                state.error("update_custom_task_time: new_time が指定されていません。");
                return Ok(());
            };
            let Some(task_id) = arg_int(action, "task_id") else {
                state.error("update_custom_task_time: task_id が不正です。");
                return Ok(());
            };
            let Some(task) = queries::get_custom_task(conn, task_id).await? else {
                state.error(format!("task_id={task_id} が見つかりませんでした。"));
                return Ok(());
            };
            let new_time = new_time.trim();
            queries::update_custom_task_time(conn, task_id, new_time).await?;
            state.result(format!(
                "カスタムタスク「{}」の時刻を {} に更新しました。",
                task.name, new_time
            ));
            state.modified(format!("item_custom_{task_id}"));
            state.dirty = true;
        }

        "rename_custom_task" => {
            let Some(new_name) = arg_str(action, "new_name").filter(|s| !s.is_empty()) else {
                state.error("rename_custom_task: new_name が指定されていません。");
                return Ok(());
            };
            let Some(task_id) = arg_int(action, "task_id") else {
                state.error("rename_custom_task: task_id が不正です。");
                return Ok(());
            };
            let Some(task) = queries::get_custom_task(conn, task_id).await? else {
                state.error(format!("task_id={task_id} が見つかりませんでした。"));
                return Ok(());
            };
            let new_name = new_name.trim();
            queries::rename_custom_task(conn, task_id, new_name).await?;
            state.result(format!(
                "カスタムタスク「{}」の名前を「{}」に更新しました。",
                task.name, new_name
            ));
            state.modified(format!("item_custom_{task_id}"));
            state.dirty = true;
        }

        "update_custom_task_memo" => {
            let Some(new_memo) = arg_str(action, "new_memo") else {
                state.error("update_custom_task_memo: new_memo が指定されていません。");
                return Ok(());
            };
            let Some(task_id) = arg_int(action, "task_id") else {
                state.error("update_custom_task_memo: task_id が不正です。");
                return Ok(());
            };
            let Some(task) = queries::get_custom_task(conn, task_id).await? else {
                state.error(format!("task_id={task_id} が見つかりませんでした。"));
                return Ok(());
            };
            queries::update_custom_task_memo(conn, task_id, new_memo.trim()).await?;
            state.result(format!("カスタムタスク「{}」のメモを更新しました。", task.name));
            state.modified(format!("item_custom_{task_id}"));
            state.dirty = true;
        }

        // ---------- 日報 ----------
        "update_log" => {
            let Some(content) = arg_str(action, "content").filter(|s| !s.trim().is_empty()) else {
                state.error("update_log: content が指定されていません。");
                return Ok(());
            };
            if needs_resolution(action, "date") {
                state.error(
                    "update_log: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let date = parse_date_or(arg_str(action, "date"), default_date);
            match queries::get_day_log(conn, date).await? {
                Some(log) => queries::update_day_log_content(conn, log.id, content.trim()).await?,
                None => {
                    queries::insert_day_log(conn, date, content.trim()).await?;
                }
            }
            state.result(format!("{} の日報を更新しました。", iso(date)));
            state.modified("daily-log-card".to_string());
            state.dirty = true;
        }

        "append_day_log" => {
            let Some(content) = arg_str(action, "content").filter(|s| !s.trim().is_empty()) else {
                state.error("append_day_log: content が指定されていません。");
                return Ok(());
            };
            if needs_resolution(action, "date") {
                state.error(
                    "append_day_log: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let date = parse_date_or(arg_str(action, "date"), default_date);
            match queries::get_day_log(conn, date).await? {
                Some(log) => {
                    let updated = if log.content.is_empty() {
                        content.trim().to_string()
                    } else {
                        format!("{}\n{}", log.content, content.trim())
                    };
                    queries::update_day_log_content(conn, log.id, &updated).await?;
                }
                None => {
                    queries::insert_day_log(conn, date, content.trim()).await?;
                }
            }
            state.result(format!("{} の日報に追記しました。", iso(date)));
            state.modified("daily-log-card".to_string());
            state.dirty = true;
        }

        "get_day_log" => {
            if needs_resolution(action, "date") {
                state.error(
                    "get_day_log: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let date = parse_date_or(arg_str(action, "date"), default_date);
            match queries::get_day_log(conn, date).await? {
                Some(log) if !log.content.is_empty() => {
                    state.result(format!("{} の日報:\n{}", iso(date), log.content));
                }
                _ => state.result(format!("{} の日報は見つかりませんでした。", iso(date))),
            }
        }

        // ---------- ルーチン ----------
        "add_routine" => {
            let Some(name) = arg_str(action, "name").filter(|s| !s.is_empty()) else {
                state.error("add_routine: name is required");
                return Ok(());
            };
            let days = arg_str(action, "days").unwrap_or("0,1,2,3,4");
            let description = arg_str(action, "description").unwrap_or("");
            let id = queries::insert_routine(conn, name, days, description).await?;
            state.result(format!("ルーチン「{name}」(ID: {id}) を追加しました。"));
            state.dirty = true;
        }

        "delete_routine" => {
            apply_delete_routine(conn, action, state).await?;
        }

        "update_routine_days" => {
            let Some(new_days) = arg_str(action, "new_days").filter(|s| !s.is_empty()) else {
                state.error("update_routine_days: new_days が指定されていません。");
                return Ok(());
            };
            let Some(routine_id) = arg_int(action, "routine_id") else {
                state.error("update_routine_days: routine_id が不正です。");
                return Ok(());
            };
            let Some(routine) = queries::get_routine(conn, routine_id).await? else {
                state.error(format!("routine_id={routine_id} が見つかりませんでした。"));
                return Ok(());
            };
            let new_days = new_days.trim();
            queries::update_routine_days(conn, routine_id, new_days).await?;
            state.result(format!(
                "ルーチン「{}」の曜日を {} に更新しました。",
                routine.name, new_days
            ));
            state.dirty = true;
        }

        // ---------- ステップ ----------
        "add_step" => {
            let routine_id = arg_int(action, "routine_id");
            let name = arg_str(action, "name").filter(|s| !s.is_empty());
            let (Some(routine_id), Some(name)) = (routine_id, name) else {
                state.error("add_step: routine_id and name required");
                return Ok(());
            };
            let time = arg_str(action, "time").unwrap_or("00:00");
            let category = arg_str(action, "category").unwrap_or("Other");
            let id = queries::insert_step(conn, routine_id, name, time, category).await?;
            state.result(format!(
                "ルーチン(ID:{routine_id})にステップ「{name}」(ID: {id}) を追加しました。"
            ));
            state.modified(format!("item_routine_{id}"));
            state.dirty = true;
        }

        "delete_step" => {
            let step = match arg_int(action, "step_id") {
                Some(step_id) => queries::get_step(conn, step_id).await?,
                None => None,
            };
            match step {
                Some(step) => {
                    queries::delete_step(conn, step.id).await?;
                    state.result(format!("ステップ「{}」を削除しました。", step.name));
                    state.dirty = true;
                }
                None => state.error("delete_step: not found"),
            }
        }

        "update_step_time" => {
            let Some(new_time) = arg_str(action, "new_time").filter(|s| !s.is_empty()) else {
                state.error("update_step_time: new_time が指定されていません。");
                return Ok(());
            };
            let Some(step_id) = arg_int(action, "step_id") else {
                state.error("update_step_time: step_id が不正です。");
                return Ok(());
            };
            let Some(step) = queries::get_step(conn, step_id).await? else {
                state.error(format!("step_id={step_id} が見つかりませんでした。"));
                return Ok(());
            };
            let new_time = new_time.trim();
            queries::update_step_time(conn, step_id, new_time).await?;
            state.result(format!(
                "ステップ「{}」の時刻を {} に更新しました。",
                step.name, new_time
            ));
            state.modified(format!("item_routine_{step_id}"));
            state.dirty = true;
        }

        "rename_step" => {
            let Some(new_name) = arg_str(action, "new_name").filter(|s| !s.is_empty()) else {
                state.error("rename_step: new_name が指定されていません。");
                return Ok(());
            };
            let Some(step_id) = arg_int(action, "step_id") else {
                state.error("rename_step: step_id が不正です。");
                return Ok(());
            };
            let Some(step) = queries::get_step(conn, step_id).await? else {
                state.error(format!("step_id={step_id} が見つかりませんでした。"));
                return Ok(());
            };
            let new_name = new_name.trim();
            queries::rename_step(conn, step_id, new_name).await?;
            state.result(format!(
                "ステップ「{}」の名前を「{}」に更新しました。",
                step.name, new_name
            ));
            state.modified(format!("item_routine_{step_id}"));
            state.dirty = true;
        }

        "update_step_memo" => {
            let Some(new_memo) = arg_str(action, "new_memo") else {
                state.error("update_step_memo: new_memo が指定されていません。");
                return Ok(());
            };
            let Some(step_id) = arg_int(action, "step_id") else {
                state.error("update_step_memo: step_id が不正です。");
                return Ok(());
            };
            let Some(step) = queries::get_step(conn, step_id).await? else {
                state.error(format!("step_id={step_id} が見つかりませんでした。"));
                return Ok(());
            };
            queries::update_step_memo(conn, step_id, new_memo.trim()).await?;
            state.result(format!("ステップ「{}」のメモを更新しました。", step.name));
            state.modified(format!("item_routine_{step_id}"));
            state.dirty = true;
        }

        // ---------- 参照 ----------
        "list_tasks_in_period" => {
            if needs_resolution(action, "start_date") || needs_resolution(action, "end_date") {
                state.error(
                    "list_tasks_in_period: 相対日付が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let start = parse_date_or(arg_str(action, "start_date"), default_date);
            let end = parse_date_or(arg_str(action, "end_date"), default_date);
            if start > end {
                state.error("list_tasks_in_period: 開始日が終了日より後です。");
                return Ok(());
            }

            let mut lines = Vec::new();

            for task in queries::custom_tasks_in_range(conn, start, end).await? {
                let memo = if task.memo.is_empty() { "なし" } else { task.memo.as_str() };
                lines.push(format!(
                    "カスタムタスク [{}]: {} {} - {} (完了: {}) (メモ: {})",
                    task.id,
                    iso(task.date),
                    task.time,
                    task.name,
                    task.done,
                    memo
                ));
            }

            let routines = queries::list_routines(conn).await?;
            let mut current = start;
            while current <= end {
                let weekday = current.weekday().num_days_from_monday();
                for routine in routines.iter().filter(|r| routine_matches_weekday(r, weekday)) {
                    for step in queries::steps_for_routine(conn, routine.id).await? {
                        let log = queries::get_daily_log(conn, current, step.id).await?;
                        let status = match &log {
                            Some(log) if log.done => "完了",
                            _ => "未完了",
                        };
                        let memo = log
                            .as_ref()
                            .map(|l| l.memo.as_str())
                            .filter(|m| !m.is_empty())
                            .unwrap_or(if step.memo.is_empty() { "なし" } else { step.memo.as_str() });
                        lines.push(format!(
                            "ルーチンステップ [{}]: {} {} - {} - {} (完了: {}) (メモ: {})",
                            step.id,
                            iso(current),
                            step.time,
                            routine.name,
                            step.name,
                            status,
                            memo
                        ));
                    }
                }
                current = current + Duration::days(1);
            }

            if lines.is_empty() {
                state.result(format!(
                    "{} から {} までのタスクは見つかりませんでした。",
                    iso(start),
                    iso(end)
                ));
            } else {
                state.result(format!(
                    "{} から {} までのタスク:\n{}",
                    iso(start),
                    iso(end),
                    lines.join("\n")
                ));
            }
        }

        "get_daily_summary" => {
            if needs_resolution(action, "date") {
                state.error(
                    "get_daily_summary: date に相対表現が含まれています。\
                     resolve_schedule_expression で先に絶対日付へ変換してください。",
                );
                return Ok(());
            }
            let target = parse_date_or(arg_str(action, "date"), default_date);

            let mut parts = Vec::new();

            match queries::get_day_log(conn, target).await? {
                Some(log) if !log.content.is_empty() => {
                    parts.push(format!("日報: {}", log.content))
                }
                _ => parts.push("日報: なし".to_string()),
            }

            let tasks = queries::custom_tasks_for_date(conn, target).await?;
            if tasks.is_empty() {
                parts.push("カスタムタスク: なし".to_string());
            } else {
                parts.push("カスタムタスク:".to_string());
                for task in tasks {
                    let status = if task.done { "完了" } else { "未完了" };
                    let memo = if task.memo.is_empty() { "なし" } else { task.memo.as_str() };
                    parts.push(format!(
                        "- {} {} ({}) (メモ: {})",
                        task.time, task.name, status, memo
                    ));
                }
            }

            let routines = queries::list_routines(conn).await?;
            let weekday = target.weekday().num_days_from_monday();
            let matching: Vec<&Routine> = routines
                .iter()
                .filter(|r| routine_matches_weekday(r, weekday))
                .collect();
            if matching.is_empty() {
                parts.push("ルーチンステップ: なし".to_string());
            } else {
                parts.push("ルーチンステップ:".to_string());
                for routine in matching {
                    for step in queries::steps_for_routine(conn, routine.id).await? {
                        let log = queries::get_daily_log(conn, target, step.id).await?;
                        let status = match &log {
                            Some(log) if log.done => "完了",
                            _ => "未完了",
                        };
                        let memo = log
                            .as_ref()
                            .map(|l| l.memo.as_str())
                            .filter(|m| !m.is_empty())
                            .unwrap_or(if step.memo.is_empty() { "なし" } else { step.memo.as_str() });
                        parts.push(format!(
                            "- {} {} - {} ({}) (メモ: {})",
                            step.time, routine.name, step.name, status, memo
                        ));
                    }
                }
            }

            state.result(format!("{} の活動概要:\n{}", iso(target), parts.join("\n")));
        }

        unknown => state.error(format!("未知のアクション: {unknown}")),
    }

    Ok(())
}

async fn apply_delete_routine(
    conn: &Connection,
    action: &ActionCall,
    state: &mut BatchState<'_>,
) -> Result<()> {
    let routine_name = arg_str(action, "routine_name");
    let delete_all = is_delete_all_routine_request(action, routine_name);

    // Explicit id wins over every other addressing form.
    let has_id = match action.arg("routine_id") {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(v) => !v.is_null(),
        None => false,
    };
    if has_id {
        let Some(routine_id) = arg_int(action, "routine_id") else {
            state.error("delete_routine: routine_id が不正です。");
            return Ok(());
        };
        let Some(routine) = queries::get_routine(conn, routine_id).await? else {
            state.error(format!("routine_id={routine_id} が見つかりませんでした。"));
            return Ok(());
        };
        queries::delete_routine(conn, routine_id).await?;
        state.result(format!("ルーチン「{}」を削除しました。", routine.name));
        state.dirty = true;
        return Ok(());
    }

    let routines = queries::list_routines(conn).await?;

    if delete_all {
        if routines.is_empty() {
            state.result("削除対象のルーチンはありませんでした。".to_string());
            return Ok(());
        }
        let mut deleted = 0;
        for routine in &routines {
            queries::delete_routine(conn, routine.id).await?;
            deleted += 1;
        }
        state.result(format!("ルーチンを{deleted}件削除しました。"));
        state.dirty = true;
        return Ok(());
    }

    let Some(routine_name) = routine_name.filter(|s| !s.trim().is_empty()) else {
        state.error(
            "delete_routine: routine_id / routine_name / scope=all のいずれかを指定してください。",
        );
        return Ok(());
    };

    let (matched, exact) = match_routines_by_name(&routines, routine_name);
    if matched.is_empty() {
        state.error(format!(
            "delete_routine: routine_name='{}' に一致するルーチンが見つかりませんでした。",
            routine_name.trim()
        ));
        return Ok(());
    }

    if !exact && matched.len() > 1 {
        let candidates = matched
            .iter()
            .take(5)
            .map(|r| format!("{}(ID:{})", r.name, r.id))
            .collect::<Vec<_>>()
            .join("、");
        state.error(format!(
            "delete_routine: routine_name に一致するルーチンが複数あります。 \
             候補: {candidates}。routine_id またはより具体的な routine_name を指定してください。"
        ));
        return Ok(());
    }

    for routine in &matched {
        queries::delete_routine(conn, routine.id).await?;
    }
    if matched.len() == 1 {
        state.result(format!("ルーチン「{}」を削除しました。", matched[0].name));
    } else {
        state.result(format!(
            "ルーチン名「{}」に一致した {} 件を削除しました。",
            routine_name.trim(),
            matched.len()
        ));
    }
    state.dirty = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn base() -> NaiveDate {
        d(2026, 2, 12)
    }

    fn call(name: &str, args: Value) -> ActionCall {
        ActionCall::new(name, args)
    }

    async fn store() -> ScheduleStore {
        ScheduleStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_custom_task_defaults() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[call("create_custom_task", json!({ "name": "買い物" }))],
            base(),
        )
        .await;
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.modified_ids, vec!["item_custom_1"]);
        assert!(outcome.results[0].contains("「買い物」"));
        assert!(outcome.results[0].contains("2026-02-12 の 00:00"));

        let tasks = store.custom_tasks_for_date(base()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].done);
    }

    #[tokio::test]
    async fn test_relative_date_rejected_without_resolution() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[call(
                "create_custom_task",
                json!({ "name": "買い物", "date": "3日後", "time": "10:00" }),
            )],
            base(),
        )
        .await;
        assert!(outcome.results.is_empty());
        assert!(outcome.modified_ids.is_empty());
        assert!(outcome.errors[0].contains("resolve_schedule_expression"));
        assert!(store.custom_tasks_for_date(base()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_schedule_expression_action() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[call(
                "resolve_schedule_expression",
                json!({
                    "expression": "来週火曜日 9時",
                    "base_date": "2026-02-12",
                    "default_time": "00:00"
                }),
            )],
            base(),
        )
        .await;
        assert!(outcome.errors.is_empty());
        assert!(outcome.modified_ids.is_empty());
        assert!(outcome.results[0].starts_with("計算結果: expression=来週火曜日 9時"));
        assert!(outcome.results[0].contains("date=2026-02-17"));
        assert!(outcome.results[0].contains("time=09:00"));
    }

    #[tokio::test]
    async fn test_resolve_unresolvable_expression_is_error() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[call(
                "resolve_schedule_expression",
                json!({ "expression": "銀行記念日" }),
            )],
            base(),
        )
        .await;
        assert!(outcome.results.is_empty());
        assert!(outcome.errors[0].contains("日付表現を解釈できませんでした"));
    }

    #[tokio::test]
    async fn test_create_tasks_in_range_validations() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[
                call(
                    "create_tasks_in_range",
                    json!({ "name": "朝会", "start_date": "2026-02-14", "end_date": "2026-02-12" }),
                ),
                call(
                    "create_tasks_in_range",
                    json!({ "name": "朝会", "start_date": "2026-01-01", "end_date": "2027-06-01" }),
                ),
                call(
                    "create_tasks_in_range",
                    json!({
                        "name": "朝会",
                        "start_date": "2026-02-12",
                        "end_date": "2026-02-14",
                        "time": "09:30"
                    }),
                ),
            ],
            base(),
        )
        .await;
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].contains("start_date が end_date より後"));
        assert!(outcome.errors[1].contains("最大365日"));
        assert!(outcome.results[0].contains("3 件登録しました"));
        assert_eq!(outcome.modified_ids.len(), 3);
        assert!(outcome.modified_ids[0].starts_with("item_custom_"));
    }

    #[tokio::test]
    async fn test_delete_custom_task_top_level() {
        let store = store().await;
        let created = apply_actions(
            &store,
            &[call("create_custom_task", json!({ "name": "歯医者" }))],
            base(),
        )
        .await;
        assert!(created.errors.is_empty());

        let outcome = apply_actions(
            &store,
            &[
                call("delete_custom_task", json!({ "task_id": 1 })),
                call("delete_custom_task", json!({ "task_id": 99 })),
            ],
            base(),
        )
        .await;
        assert_eq!(outcome.results, vec!["カスタムタスク「歯医者」を削除しました。"]);
        assert_eq!(outcome.errors, vec!["task_id=99 が見つかりませんでした。"]);
        // Deletions never surface modified-id tokens.
        assert!(outcome.modified_ids.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_step_upserts_daily_log() {
        let store = store().await;
        let conn = store.conn();
        let rid = queries::insert_routine(&conn, "朝の支度", "0,1,2,3,4", "")
            .await
            .unwrap();
        let sid = queries::insert_step(&conn, rid, "ストレッチ", "07:00", "Lifestyle")
            .await
            .unwrap();

        let first = apply_actions(
            &store,
            &[call("toggle_step", json!({ "step_id": sid, "memo": "10分" }))],
            base(),
        )
        .await;
        assert!(first.results[0].contains("完了"));
        assert_eq!(first.modified_ids, vec![format!("item_routine_{sid}")]);

        let log = queries::get_daily_log(&store.conn(), base(), sid)
            .await
            .unwrap()
            .unwrap();
        assert!(log.done);
        assert_eq!(log.memo, "10分");

        let second = apply_actions(
            &store,
            &[call("toggle_step", json!({ "step_id": sid, "done": false }))],
            base(),
        )
        .await;
        assert!(second.results[0].contains("未完了"));
        let log = queries::get_daily_log(&store.conn(), base(), sid)
            .await
            .unwrap()
            .unwrap();
        assert!(!log.done);
        // Memo survives a toggle that doesn't mention it.
        assert_eq!(log.memo, "10分");
    }

    #[tokio::test]
    async fn test_day_log_overwrite_and_append() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[
                call("update_log", json!({ "content": "午前は集中できた" })),
                call("append_day_log", json!({ "content": "午後は散歩" })),
            ],
            base(),
        )
        .await;
        assert_eq!(outcome.errors.len(), 0);
        assert_eq!(outcome.modified_ids, vec!["daily-log-card", "daily-log-card"]);

        let log = store.get_day_log(base()).await.unwrap().unwrap();
        assert_eq!(log.content, "午前は集中できた\n午後は散歩");

        let overwrite = apply_actions(
            &store,
            &[call("update_log", json!({ "content": "書き直し" }))],
            base(),
        )
        .await;
        assert!(overwrite.errors.is_empty());
        let log = store.get_day_log(base()).await.unwrap().unwrap();
        assert_eq!(log.content, "書き直し");
    }

    #[tokio::test]
    async fn test_delete_routine_by_name_matching() {
        let store = store().await;
        let conn = store.conn();
        queries::insert_routine(&conn, "朝のルーチン", "0,1,2,3,4", "")
            .await
            .unwrap();
        queries::insert_routine(&conn, "朝活", "5,6", "").await.unwrap();
        queries::insert_routine(&conn, "夜のルーチン", "0,1,2,3,4", "")
            .await
            .unwrap();

        // Case-folded, whitespace-stripped exact match deletes just one.
        let outcome = apply_actions(
            &store,
            &[call("delete_routine", json!({ "routine_name": "朝の ルーチン" }))],
            base(),
        )
        .await;
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.results, vec!["ルーチン「朝のルーチン」を削除しました。"]);

        // Ambiguous partial match lists candidates instead of deleting.
        let conn = store.conn();
        queries::insert_routine(&conn, "朝の読書", "0", "").await.unwrap();
        let ambiguous = apply_actions(
            &store,
            &[call("delete_routine", json!({ "routine_name": "朝" }))],
            base(),
        )
        .await;
        assert!(ambiguous.results.is_empty());
        assert!(ambiguous.errors[0].contains("複数あります"));
        assert!(ambiguous.errors[0].contains("朝活(ID:"));

        let missing = apply_actions(
            &store,
            &[call("delete_routine", json!({ "routine_name": "昼寝" }))],
            base(),
        )
        .await;
        assert!(missing.errors[0].contains("一致するルーチンが見つかりませんでした"));
    }

    #[tokio::test]
    async fn test_delete_routine_all_tokens() {
        let store = store().await;
        let conn = store.conn();
        queries::insert_routine(&conn, "A", "0", "").await.unwrap();
        queries::insert_routine(&conn, "B", "1", "").await.unwrap();

        let outcome = apply_actions(
            &store,
            &[call("delete_routine", json!({ "routine_name": "すべてのルーチン" }))],
            base(),
        )
        .await;
        assert_eq!(outcome.results, vec!["ルーチンを2件削除しました。"]);
        assert!(store.list_routines().await.unwrap().is_empty());

        let empty = apply_actions(
            &store,
            &[call("delete_routine", json!({ "scope": "all" }))],
            base(),
        )
        .await;
        assert_eq!(empty.results, vec!["削除対象のルーチンはありませんでした。"]);
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[call("summon_coffee", json!({}))],
            base(),
        )
        .await;
        assert_eq!(outcome.errors, vec!["未知のアクション: summon_coffee"]);
    }

    #[tokio::test]
    async fn test_calc_actions_produce_json_results() {
        let store = store().await;
        let outcome = apply_actions(
            &store,
            &[
                call(
                    "calc_date_offset",
                    json!({ "base_date": "2026-02-12", "offset_days": 3 }),
                ),
                call("calc_week_range", json!({ "base_date": "2026-02-12" })),
                call(
                    "calc_month_boundary",
                    json!({ "year": 2026, "month": 2, "boundary": "end" }),
                ),
                call(
                    "calc_time_offset",
                    json!({ "base_date": "2026-02-12", "base_time": "23:30", "offset_minutes": 45 }),
                ),
                call("calc_month_boundary", json!({ "year": 2026, "month": 13, "boundary": "end" })),
            ],
            base(),
        )
        .await;
        assert!(outcome.results[0].contains("計算結果(calc_date_offset)"));
        assert!(outcome.results[0].contains("2026-02-15"));
        assert!(outcome.results[1].contains("\"period_start\":\"2026-02-09\""));
        assert!(outcome.results[1].contains("\"period_end\":\"2026-02-15\""));
        assert!(outcome.results[2].contains("2026-02-28"));
        assert!(outcome.results[3].contains("\"date\":\"2026-02-13\""));
        assert!(outcome.results[3].contains("\"time\":\"00:15\""));
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("calc_month_boundary"));
    }

    #[tokio::test]
    async fn test_read_after_read_is_stable() {
        let store = store().await;
        let conn = store.conn();
        let rid = queries::insert_routine(&conn, "夜の片付け", "3", "").await.unwrap();
        queries::insert_step(&conn, rid, "机を拭く", "21:00", "Lifestyle")
            .await
            .unwrap();

        let action = call("get_daily_summary", json!({ "date": "2026-02-12" }));
        let first = apply_actions(&store, std::slice::from_ref(&action), base()).await;
        let second = apply_actions(&store, std::slice::from_ref(&action), base()).await;
        assert_eq!(first.results, second.results);
        assert!(first.results[0].contains("2026-02-12 の活動概要:"));
        assert!(first.results[0].contains("机を拭く"));
    }

    #[tokio::test]
    async fn test_list_tasks_in_period_mixes_tasks_and_steps() {
        let store = store().await;
        let conn = store.conn();
        // 2026-02-12 is Thursday → weekday 3
        let rid = queries::insert_routine(&conn, "夜の片付け", "3", "").await.unwrap();
        let sid = queries::insert_step(&conn, rid, "机を拭く", "21:00", "Lifestyle")
            .await
            .unwrap();
        queries::insert_custom_task(&conn, base(), "歯医者", "10:00", "")
            .await
            .unwrap();

        let outcome = apply_actions(
            &store,
            &[call(
                "list_tasks_in_period",
                json!({ "start_date": "2026-02-12", "end_date": "2026-02-13" }),
            )],
            base(),
        )
        .await;
        let text = &outcome.results[0];
        assert!(text.starts_with("2026-02-12 から 2026-02-13 までのタスク:"));
        assert!(text.contains("カスタムタスク [1]: 2026-02-12 10:00 - 歯医者"));
        assert!(text.contains(&format!("ルーチンステップ [{sid}]: 2026-02-12 21:00 - 夜の片付け - 机を拭く")));
        // Friday has no matching routine, so no step line for 2026-02-13.
        assert!(!text.contains("2026-02-13 21:00"));
    }

    #[tokio::test]
    async fn test_update_and_rename_custom_task() {
        let store = store().await;
        apply_actions(
            &store,
            &[call("create_custom_task", json!({ "name": "歯医者", "time": "09:00" }))],
            base(),
        )
        .await;

        let outcome = apply_actions(
            &store,
            &[
                call("update_custom_task_time", json!({ "task_id": 1, "new_time": "11:00" })),
                call("rename_custom_task", json!({ "task_id": 1, "new_name": "歯科検診" })),
                call("update_custom_task_memo", json!({ "task_id": 1, "new_memo": "保険証" })),
                call("toggle_custom_task", json!({ "task_id": 1 })),
            ],
            base(),
        )
        .await;
        assert!(outcome.errors.is_empty());
        assert!(outcome.results[0].contains("11:00 に更新しました"));
        assert!(outcome.results[1].contains("「歯科検診」に更新しました"));
        assert!(outcome.results[3].contains("完了 に更新しました"));

        let task = store.custom_tasks_for_date(base()).await.unwrap().remove(0);
        assert_eq!(task.name, "歯科検診");
        assert_eq!(task.time, "11:00");
        assert_eq!(task.memo, "保険証");
        assert!(task.done);
    }

    #[test]
    fn test_routine_name_candidates() {
        let candidates = routine_name_candidates("朝のルーチン");
        assert!(candidates.contains(&"朝のルーチン".to_string()));
        assert!(candidates.contains(&"朝の".to_string()));
        assert!(candidates.contains(&"朝".to_string()));

        let with_quotes = routine_name_candidates("「夜活 Routine」");
        assert!(with_quotes.contains(&"夜活routine".to_string()));
        assert!(with_quotes.contains(&"夜活".to_string()));
        assert!(routine_name_candidates("  ").is_empty());
    }

    #[test]
    fn test_weekday_matching_is_exact_token() {
        let routine = Routine {
            id: 1,
            name: "r".into(),
            days: "0,1,2".into(),
            description: String::new(),
        };
        assert!(routine_matches_weekday(&routine, 1));
        assert!(!routine_matches_weekday(&routine, 3));
    }
}
