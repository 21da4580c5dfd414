use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use yotei_core::config::SchedulerConfig;
use yotei_core::types::ChatMessage;

use crate::actions::{action_signature, ActionCall};
use crate::context::build_scheduler_context;
use crate::dispatch::apply_actions;
use crate::llm::ChatBackend;
use crate::resolver::{
    extract_relative_week_shift, extract_weekday, is_relative_datetime_text, normalize_hhmm,
    parse_date_or, resolve_schedule_expression, try_parse_iso_date, week_bounds,
};
use crate::store::ScheduleStore;
use crate::tools::scheduler_tools;

// ─── Run outcome ──────────────────────────────────────────────────────

/// One executed (or skipped) round in the persisted execution trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRound {
    pub round: u32,
    pub actions: Vec<Value>,
    pub results: Vec<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
}

impl TraceRound {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Accumulated outputs of one orchestration run.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub reply_text: String,
    pub raw_replies: Vec<String>,
    pub actions: Vec<ActionCall>,
    pub results: Vec<String>,
    pub errors: Vec<String>,
    pub modified_ids: Vec<String>,
    pub execution_trace: Vec<TraceRound>,
}

// ─── Prompt assembly ──────────────────────────────────────────────────

fn agent_system_prompt() -> String {
    let now = chrono::Local::now();
    let current_time_jp = now.format("%Y年%m月%d日 %H時%M分%S秒");
    let current_time_iso = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, false);

    format!(
        "現在日時: {current_time_jp} / {current_time_iso}\n\
         あなたはユーザーの生活リズムを整え、日々のタスク管理をサポートする、親しみやすく頼れるパートナーAIです。\n\
         ユーザーの自然言語による指示を解釈し、適切なツールを選択して、ルーチンの管理、カスタムタスク（予定）の操作、日報（Daily Log）の記録を行います。\n\
         \n\
         ## コンテキストとデータの取り扱い\n\
         1. **現在のコンテキスト**: 提供されたコンテキストには「今日」のデータ（ルーチン、タスク、ログ）のみが含まれています。\n\
         2. **日付指定の検索**: 「明日」「来週」「昨日」などのデータが必要な場合は、推測せずに必ず `list_tasks_in_period` や `get_day_log`、`get_daily_summary` を使用して取得してください。\n\
         3. **IDの厳守**: タスクやステップの完了・削除・編集を行う際は、必ずコンテキストに含まれる `id` (例: `step_id`, `task_id`) を正確に使用してください。\n\
             - **新規作成時**: アイテムを新規作成した場合、そのIDは「実行結果」として会話履歴に残ります。直後の操作ではそのIDを参照してください。\n\
         \n\
         ## ツールの選択基準\n\
         - **予定・スケジュール**: 外部カレンダーは使用しません。「〇〇の予定を入れて」は `create_custom_task` を使用します。\n\
         - **習慣・繰り返し**: 「毎週〇曜日に〜する」は `add_routine` を使用します。\n\
         - **日報・メモ**: \n\
             - 「日記をつけて」「メモして」など、その日全体の記録は `append_day_log` (追記) を優先的に使用してください。上書きしたい場合のみ `update_log` を使います。\n\
             - 特定のタスクに対するメモは `update_custom_task_memo` や `update_step_memo` を使用します。\n\
         - **完了チェック**: タスクの完了は `toggle_custom_task`、ルーチンのステップは `toggle_step` です。\n\
         \n\
         ## 応答ガイドライン\n\
         - **フレンドリーに**: 機械的な応答ではなく、親しみやすい話し言葉（です・ます調）で、適度に絵文字（✨、👍、📅など）を使用してください。\n\
         - **明確な報告**: ツールを実行した結果は、必ずユーザーに日本語で報告してください。「〇〇を登録しました！」「××を完了にしました、お疲れ様です！」など。\n\
         - **不明確な指示への対応**: 必要な情報（時間、名前など）が不足している場合は、デフォルト値で強行せず、優しく聞き返してください。ただし日付が省略された場合は「今日」とみなして進めて構いません。\n\
         - **JSON禁止**: ユーザーへの返答（reply）には生のJSONやツールコール定義を含めず、自然な文章のみを返してください。\n"
    )
}

/// Break model-confusing pseudo tool-call syntax before it reaches the
/// prompt.
fn sanitize_text(text: &str) -> String {
    text.replace("<function=", "(function=")
}

fn last_user_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

// ─── Week-scope confirmation normalization ────────────────────────────

static CONFIRM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"確認",
        r"見せ",
        r"教えて",
        r"一覧",
        r"表示",
        r"把握",
        r"知りたい",
        r"ある\??$",
        r"あります\??$",
        r"入って",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

const SCHEDULE_TOKENS: [&str; 4] = ["予定", "スケジュール", "タスク", "日程"];

/// A message like 「来週の予定を確認して」: relative-week token, no
/// explicit weekday, schedule noun plus a confirmation verb.
fn is_week_scope_confirmation_request(user_message: &str) -> bool {
    let text = user_message.trim();
    if text.is_empty() {
        return false;
    }
    if extract_relative_week_shift(text).is_none() {
        return false;
    }
    if extract_weekday(text).is_some() {
        return false;
    }
    let has_schedule = SCHEDULE_TOKENS.iter().any(|token| text.contains(token));
    let has_confirm = CONFIRM_PATTERNS.iter().any(|pattern| pattern.is_match(text));
    has_schedule && has_confirm
}

/// For week-scope confirmations, single-day reads become whole-week reads:
/// `get_daily_summary` turns into the enclosing week's
/// `list_tasks_in_period`, and short periods expand to Monday..Sunday.
fn normalize_actions_for_week_scope_confirmation(
    actions: Vec<ActionCall>,
    user_message: &str,
) -> Vec<ActionCall> {
    if !is_week_scope_confirmation_request(user_message) {
        return actions;
    }

    actions
        .into_iter()
        .map(|action| match action.name.as_str() {
            "get_daily_summary" => {
                let Some(date) = action
                    .arg("date")
                    .and_then(Value::as_str)
                    .and_then(try_parse_iso_date)
                else {
                    return action;
                };
                let (week_start, week_end) = week_bounds(date);
                ActionCall::new(
                    "list_tasks_in_period",
                    json!({
                        "start_date": week_start.format("%Y-%m-%d").to_string(),
                        "end_date": week_end.format("%Y-%m-%d").to_string(),
                    }),
                )
            }
            "list_tasks_in_period" => {
                let start = action
                    .arg("start_date")
                    .and_then(Value::as_str)
                    .and_then(try_parse_iso_date);
                let end = action
                    .arg("end_date")
                    .and_then(Value::as_str)
                    .and_then(try_parse_iso_date);
                let (Some(start), Some(end)) = (start, end) else {
                    return action;
                };
                if start <= end && (end - start).num_days() < 6 {
                    let (week_start, week_end) = week_bounds(start);
                    let mut args = action.args.clone();
                    if let Value::Object(map) = &mut args {
                        map.insert(
                            "start_date".to_string(),
                            json!(week_start.format("%Y-%m-%d").to_string()),
                        );
                        map.insert(
                            "end_date".to_string(),
                            json!(week_end.format("%Y-%m-%d").to_string()),
                        );
                    }
                    ActionCall::new("list_tasks_in_period", args)
                } else {
                    action
                }
            }
            _ => action,
        })
        .collect()
}

// ─── Reference-date injection ─────────────────────────────────────────

const REFERENCE_DATE_TOKENS: [&str; 10] = [
    "その",
    "それ",
    "同日",
    "当日",
    "同じ日",
    "その日",
    "翌日",
    "翌々日",
    "前日",
    "前々日",
];

fn has_reference_date_token(value: &str) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    REFERENCE_DATE_TOKENS.iter().any(|token| text.contains(token))
}

/// An absolute datetime produced by the resolver during this run, used to
/// anchor reference tokens like 「その3日後」.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMemoryItem {
    pub expression: String,
    pub date: String,
    pub time: String,
    pub datetime: String,
    pub period_start: String,
    pub period_end: String,
}

/// Anchor reference-token resolve calls on the most recent resolved date,
/// chaining through the batch so 「その翌日」 after 「その3日後」 lands where
/// the user expects.
fn inject_base_date_for_reference_resolves(
    actions: Vec<ActionCall>,
    resolved_memory: &[ResolvedMemoryItem],
) -> Vec<ActionCall> {
    let Some(mut anchor) = resolved_memory
        .iter()
        .rev()
        .find_map(|item| try_parse_iso_date(&item.date))
    else {
        return actions;
    };

    actions
        .into_iter()
        .map(|action| {
            if !action.is_resolve() {
                return action;
            }
            let Some(expression) = action.arg("expression").and_then(Value::as_str) else {
                return action;
            };
            if !has_reference_date_token(expression) {
                return action;
            }
            let base_date_set = action
                .arg("base_date")
                .and_then(Value::as_str)
                .and_then(try_parse_iso_date)
                .is_some();
            if base_date_set {
                return action;
            }

            let mut args = action.args.clone();
            if let Value::Object(map) = &mut args {
                map.insert(
                    "base_date".to_string(),
                    json!(anchor.format("%Y-%m-%d").to_string()),
                );
            }
            let updated = ActionCall::new("resolve_schedule_expression", args);

            let fallback_base_time = chrono::Local::now().format("%H:%M").to_string();
            let base_time = normalize_hhmm(
                updated.arg("base_time").and_then(Value::as_str),
                &fallback_base_time,
            );
            let default_time =
                normalize_hhmm(updated.arg("default_time").and_then(Value::as_str), &base_time);
            if let Ok(resolved) =
                resolve_schedule_expression(expression, anchor, &base_time, &default_time)
            {
                anchor = resolved.date;
            }

            updated
        })
        .collect()
}

// ─── Step-progress inference ──────────────────────────────────────────

struct StepDefinition {
    id: &'static str,
    label: &'static str,
    pattern: &'static str,
    action_types: &'static [&'static str],
}

const STEP_DEFINITIONS: [StepDefinition; 5] = [
    StepDefinition {
        id: "confirm",
        label: "予定確認",
        pattern: r"(確認|見せて|見せる|一覧|表示|サマリー)",
        action_types: &["list_tasks_in_period", "get_daily_summary", "get_day_log"],
    },
    StepDefinition {
        id: "add",
        label: "予定追加",
        pattern: r"(追加|入れて|登録)",
        action_types: &["create_custom_task", "add_routine", "add_step"],
    },
    StepDefinition {
        id: "complete",
        label: "完了更新",
        pattern: r"(完了に|完了して|終わったら|チェックして)",
        action_types: &["toggle_custom_task", "toggle_step"],
    },
    StepDefinition {
        id: "append_log",
        label: "日報更新",
        pattern: r"(日報.*追記|追記.*日報|日報.*メモ|メモ.*日報)",
        action_types: &["append_day_log", "update_log"],
    },
    StepDefinition {
        id: "reschedule",
        label: "時刻変更",
        pattern: r"(ずらして|後ろに|前倒し|時間.*変更|時刻.*変更)",
        action_types: &["update_custom_task_time", "update_step_time"],
    },
];

static STEP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    STEP_DEFINITIONS
        .iter()
        .map(|def| Regex::new(def.pattern).unwrap())
        .collect()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedStep {
    pub id: &'static str,
    pub label: &'static str,
    pub action_types: &'static [&'static str],
}

/// Infer the ordered coarse plan behind a user message from trigger words,
/// with a leading calculate step whenever the message is relative.
fn infer_requested_steps(user_message: &str) -> Vec<RequestedStep> {
    let text = user_message.trim();
    if text.is_empty() {
        return vec![];
    }

    let mut events: Vec<(usize, usize)> = Vec::new();
    for (index, pattern) in STEP_PATTERNS.iter().enumerate() {
        for found in pattern.find_iter(text) {
            events.push((found.start(), index));
        }
    }

    const CALCULATE_INDEX: usize = usize::MAX;
    if is_relative_datetime_text(text) {
        events.push((0, CALCULATE_INDEX));
    }

    if events.is_empty() {
        return vec![];
    }
    events.sort_by_key(|(position, _)| *position);

    let mut steps: Vec<RequestedStep> = Vec::new();
    for (_, index) in events {
        let step = if index == CALCULATE_INDEX {
            RequestedStep {
                id: "calculate",
                label: "日時計算",
                action_types: &["resolve_schedule_expression"],
            }
        } else {
            let def = &STEP_DEFINITIONS[index];
            RequestedStep {
                id: def.id,
                label: def.label,
                action_types: def.action_types,
            }
        };
        if steps.last().map(|s| s.id) == Some(step.id) {
            continue;
        }
        steps.push(step);
    }
    steps
}

fn format_step_progress(steps: &[RequestedStep], completed_steps: usize) -> String {
    if steps.is_empty() {
        return "(none)".to_string();
    }

    let mut lines = Vec::new();
    let mut next_step_label = "";
    for (idx, step) in steps.iter().enumerate() {
        let done = idx < completed_steps;
        let marker = if done { "x" } else { " " };
        lines.push(format!("- [{marker}] {}. {}", idx + 1, step.label));
        if !done && next_step_label.is_empty() {
            next_step_label = step.label;
        }
    }

    if next_step_label.is_empty() {
        lines.push("next_expected_step: (all completed)".to_string());
    } else {
        lines.push(format!("next_expected_step: {next_step_label}"));
    }

    lines.join("\n")
}

// ─── Resolved memory ──────────────────────────────────────────────────

/// Re-run the resolver over the round's executed resolve calls to record
/// what they produced (the resolver is pure, so this matches the
/// dispatcher's own computation).
fn extract_resolved_memory_from_actions(
    actions: &[ActionCall],
    default_date: NaiveDate,
) -> Vec<ResolvedMemoryItem> {
    let fallback_base_time = chrono::Local::now().format("%H:%M").to_string();
    let mut memories = Vec::new();

    for action in actions {
        if !action.is_resolve() {
            continue;
        }
        let Some(expression) = action
            .arg("expression")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
        else {
            continue;
        };
        let base_date = parse_date_or(action.arg("base_date").and_then(Value::as_str), default_date);
        let base_time = normalize_hhmm(
            action.arg("base_time").and_then(Value::as_str),
            &fallback_base_time,
        );
        let default_time =
            normalize_hhmm(action.arg("default_time").and_then(Value::as_str), &base_time);
        let Ok(resolved) =
            resolve_schedule_expression(expression, base_date, &base_time, &default_time)
        else {
            continue;
        };
        memories.push(ResolvedMemoryItem {
            expression: expression.trim().to_string(),
            date: resolved.date.format("%Y-%m-%d").to_string(),
            time: resolved.time.clone(),
            datetime: resolved.datetime.clone(),
            period_start: resolved
                .period
                .map(|(start, _)| start.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            period_end: resolved
                .period
                .map(|(_, end)| end.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
        });
    }

    memories
}

// ─── Round feedback ───────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn build_round_feedback(
    round_index: u32,
    actions: &[ActionCall],
    results: &[String],
    errors: &[String],
    inferred_steps: &[RequestedStep],
    completed_steps: usize,
    resolved_memory: &[ResolvedMemoryItem],
    duplicate_warning: &str,
) -> String {
    let action_lines = if actions.is_empty() {
        "- (none)".to_string()
    } else {
        actions
            .iter()
            .map(|a| format!("- {}", a.fingerprint()))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let result_lines = if results.is_empty() {
        "- (none)".to_string()
    } else {
        results
            .iter()
            .map(|r| format!("- {r}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let error_lines = if errors.is_empty() {
        "- (none)".to_string()
    } else {
        errors
            .iter()
            .map(|e| format!("- {e}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let progress_lines = format_step_progress(inferred_steps, completed_steps);
    let recent: Vec<&ResolvedMemoryItem> = resolved_memory.iter().rev().take(3).collect();
    let resolved_lines = if recent.is_empty() {
        "- (none)".to_string()
    } else {
        recent
            .into_iter()
            .rev()
            .map(|item| {
                format!(
                    "- expression={} => date={} time={} datetime={} period_start={} period_end={}",
                    item.expression,
                    item.date,
                    item.time,
                    item.datetime,
                    item.period_start,
                    item.period_end
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let duplicate_lines = if duplicate_warning.is_empty() {
        String::new()
    } else {
        format!("duplicate_warning:\n- {duplicate_warning}\n")
    };

    format!(
        "Execution round {round_index} completed.\n\
         inferred_request_progress:\n\
         {progress_lines}\n\
         resolved_datetime_memory:\n\
         {resolved_lines}\n\
         {duplicate_lines}\
         executed_actions:\n\
         {action_lines}\n\
         execution_results:\n\
         {result_lines}\n\
         execution_errors:\n\
         {error_lines}\n\
         元のユーザー要望を満たすために追加操作が必要ならツールを続けて呼んでください。\n\
         要望が満たされた場合はツールを呼ばず、自然な日本語の最終回答のみを返してください。\n\
         今日以外の日付を扱う場合（相対表現・曜日指定・明示日付を含む）は resolve_schedule_expression を先に実行してから参照/更新ツールを呼んでください。\n\
         resolve_schedule_expression が「日付表現を解釈できませんでした」を返した場合は、同じ expression を繰り返さず、記念日名や曖昧語を具体的な月日/ISO日付へ言い換えて再計算してください。\n\
         「その3日後」「その翌日」など参照語つき日時は、resolved_datetime_memory の直近 date を base_date に設定して計算してください。\n\
         直前と同じ参照/計算アクションを繰り返さず、next_expected_step を優先してください。\n\
         同じ作成・更新系のアクションを重複して実行しないでください。"
    )
}

fn dedupe_modified_ids(modified_ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    modified_ids
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

// ─── The loop ─────────────────────────────────────────────────────────

/// Drive up to `max_action_rounds` rounds of context → LLM → guard →
/// dispatch → feedback. Never returns `Err`: every failure past this point
/// is recorded in `errors` and surfaced through the synthesized reply.
pub async fn run_scheduler_multi_step<B: ChatBackend>(
    store: &ScheduleStore,
    llm: &B,
    formatted_messages: &[ChatMessage],
    today: NaiveDate,
    caps: &SchedulerConfig,
) -> RunOutcome {
    let rounds_limit = caps.max_action_rounds.clamp(1, 10);
    let max_same_read_action_streak = caps.max_same_read_action_streak.clamp(1, 10);

    let mut working_messages: Vec<ChatMessage> = formatted_messages.to_vec();
    let user_message = last_user_message(formatted_messages);
    let inferred_steps = infer_requested_steps(&user_message);

    let mut outcome = RunOutcome::default();
    let mut resolved_memory: Vec<ResolvedMemoryItem> = Vec::new();

    let mut previous_signature = String::new();
    let mut previous_round_had_write = false;
    let mut stale_read_repeat_count: u32 = 0;
    let mut no_progress_rounds = 0;
    let mut completed_steps = 0usize;
    let mut executed_write_fingerprints: HashSet<String> = HashSet::new();

    if !inferred_steps.is_empty() {
        working_messages.push(ChatMessage::system(format!(
            "requested_steps_plan:\n{}\nこの順序を意識して実行してください。",
            format_step_progress(&inferred_steps, completed_steps)
        )));
    }

    let tools = scheduler_tools();
    let mut exhausted = true;

    for round_index in 1..=rounds_limit {
        let context = match build_scheduler_context(store, today).await {
            Ok(context) => context,
            Err(e) => {
                outcome.errors.push(format!("操作の適用に失敗しました: {e}"));
                exhausted = false;
                break;
            }
        };

        let mut request_messages = vec![
            ChatMessage::system(agent_system_prompt()),
            ChatMessage::system(sanitize_text(&context)),
        ];
        request_messages.extend(
            working_messages
                .iter()
                .map(|m| ChatMessage::text(m.role.clone(), sanitize_text(&m.content))),
        );

        let request = yotei_core::types::ChatRequest {
            messages: request_messages,
            max_tokens: Some(1500),
            temperature: Some(0.4),
        };

        let response = match llm.chat_with_tools(request, &tools, "auto").await {
            Ok(response) => response,
            Err(e) => {
                outcome.errors.push(format!("LLM 呼び出しに失敗しました: {e}"));
                exhausted = false;
                break;
            }
        };

        let reply_text = response.content.clone();
        outcome.raw_replies.push(reply_text.clone());

        let current_actions = ActionCall::from_tool_calls(&response.tool_calls);
        let current_actions =
            normalize_actions_for_week_scope_confirmation(current_actions, &user_message);
        let current_actions =
            inject_base_date_for_reference_resolves(current_actions, &resolved_memory);
        if current_actions.is_empty() {
            exhausted = false;
            break;
        }

        // The resolver mutates nothing, so repeated resolves are handled
        // like repeated reads rather than a hard duplicate stop.
        let all_read_like = current_actions
            .iter()
            .all(|a| a.is_read_only() || a.is_resolve());
        let signature = action_signature(&current_actions);
        if !signature.is_empty() && signature == previous_signature {
            if all_read_like && !previous_round_had_write {
                stale_read_repeat_count += 1;
                if stale_read_repeat_count >= max_same_read_action_streak {
                    outcome.errors.push(format!(
                        "同じ参照/計算アクションが{max_same_read_action_streak}回連続したため処理を終了しました。"
                    ));
                    exhausted = false;
                    break;
                }
            } else {
                outcome
                    .errors
                    .push("同一アクションが連続して提案されたため、重複実行を停止しました。".to_string());
                exhausted = false;
                break;
            }
        } else {
            stale_read_repeat_count = 0;
        }
        previous_signature = signature;

        let mut actions_to_execute: Vec<ActionCall> = Vec::new();
        let mut skipped_any = false;
        for action in &current_actions {
            if action.is_read_only() {
                actions_to_execute.push(action.clone());
                continue;
            }
            let fingerprint = action.fingerprint();
            if executed_write_fingerprints.contains(&fingerprint) {
                skipped_any = true;
                continue;
            }
            executed_write_fingerprints.insert(fingerprint);
            actions_to_execute.push(action.clone());
        }

        let duplicate_warning = if skipped_any {
            "同一の更新アクションが再提案されたため再実行をスキップしました。"
        } else {
            ""
        };

        if actions_to_execute.is_empty() {
            no_progress_rounds += 1;
            outcome.execution_trace.push(TraceRound {
                round: round_index,
                actions: current_actions.iter().map(ActionCall::trace_entry).collect(),
                results: vec![],
                errors: if duplicate_warning.is_empty() {
                    vec![]
                } else {
                    vec![duplicate_warning.to_string()]
                },
                skipped: Some(true),
            });
            let feedback = build_round_feedback(
                round_index,
                &current_actions,
                &[],
                &[],
                &inferred_steps,
                completed_steps,
                &resolved_memory,
                duplicate_warning,
            );
            let assistant_feedback = if reply_text.trim().is_empty() {
                "了解しました。".to_string()
            } else {
                reply_text.trim().to_string()
            };
            working_messages.push(ChatMessage::assistant(assistant_feedback));
            working_messages.push(ChatMessage::system(feedback));
            if no_progress_rounds >= 2 {
                outcome
                    .errors
                    .push("進捗が得られない状態が続いたため処理を終了しました。".to_string());
                exhausted = false;
                break;
            }
            continue;
        }

        let applied = apply_actions(store, &actions_to_execute, today).await;
        outcome.actions.extend(actions_to_execute.iter().cloned());
        outcome.results.extend(applied.results.iter().cloned());
        outcome.errors.extend(applied.errors.iter().cloned());
        outcome.modified_ids.extend(applied.modified_ids.iter().cloned());

        let before_completed_steps = completed_steps;
        for action in &actions_to_execute {
            if completed_steps >= inferred_steps.len() {
                break;
            }
            if inferred_steps[completed_steps]
                .action_types
                .contains(&action.name.as_str())
            {
                completed_steps += 1;
            }
        }

        let new_resolved_items = extract_resolved_memory_from_actions(&actions_to_execute, today);
        let mut existing_keys: HashSet<(String, String, String)> = resolved_memory
            .iter()
            .map(|item| (item.expression.clone(), item.date.clone(), item.time.clone()))
            .collect();
        for item in new_resolved_items {
            let key = (item.expression.clone(), item.date.clone(), item.time.clone());
            if existing_keys.insert(key) {
                resolved_memory.push(item);
            }
        }

        outcome.execution_trace.push(TraceRound {
            round: round_index,
            actions: actions_to_execute.iter().map(ActionCall::trace_entry).collect(),
            results: applied.results.clone(),
            errors: applied.errors.clone(),
            skipped: None,
        });

        let has_progress = !applied.modified_ids.is_empty()
            || !applied.results.is_empty()
            || completed_steps > before_completed_steps;
        if has_progress {
            no_progress_rounds = 0;
        } else {
            no_progress_rounds += 1;
        }

        previous_round_had_write = actions_to_execute
            .iter()
            .any(|a| !a.is_read_only() && !a.is_resolve());

        let feedback = build_round_feedback(
            round_index,
            &actions_to_execute,
            &applied.results,
            &applied.errors,
            &inferred_steps,
            completed_steps,
            &resolved_memory,
            duplicate_warning,
        );
        let assistant_feedback = if reply_text.trim().is_empty() {
            "了解しました。".to_string()
        } else {
            reply_text.trim().to_string()
        };
        working_messages.push(ChatMessage::assistant(assistant_feedback));
        working_messages.push(ChatMessage::system(feedback));

        if no_progress_rounds >= 2 {
            outcome
                .errors
                .push("進捗が得られない状態が続いたため処理を終了しました。".to_string());
            exhausted = false;
            break;
        }
    }

    if exhausted {
        outcome.errors.push(format!(
            "複数ステップ実行の上限（{rounds_limit}ラウンド）に達したため処理を終了しました。"
        ));
    }

    outcome.reply_text = outcome.raw_replies.last().cloned().unwrap_or_default();
    outcome.modified_ids = dedupe_modified_ids(std::mem::take(&mut outcome.modified_ids));
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::queries;
    use crate::test_support::ScriptedBackend;
    use yotei_core::error::AgentError;
    use yotei_core::types::{ChatResponse, ToolInvocation};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn base() -> NaiveDate {
        d(2026, 2, 12)
    }

    fn caps() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    fn tool_call(name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation {
            name: name.to_string(),
            arguments,
        }
    }

    fn round(text: &str, calls: Vec<ToolInvocation>) -> yotei_core::error::Result<ChatResponse> {
        Ok(ChatResponse {
            content: text.to_string(),
            tool_calls: calls,
            decision: None,
            usage: None,
        })
    }

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(content)]
    }

    async fn store() -> ScheduleStore {
        ScheduleStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_multi_step_run_accumulates_rounds() {
        let store = store().await;
        let backend = ScriptedBackend::new(vec![
            round(
                "まず予定を確認します。",
                vec![tool_call("get_daily_summary", json!({ "date": "2026-02-12" }))],
            ),
            round(
                "予定を追加します。",
                vec![tool_call(
                    "create_custom_task",
                    json!({ "name": "歯医者", "date": "2026-02-12", "time": "10:00" }),
                )],
            ),
            round("確認完了です。", vec![]),
        ]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("予定確認して追加して"),
            base(),
            &caps(),
        )
        .await;

        assert_eq!(backend.rounds_consumed(), 3);
        assert_eq!(outcome.reply_text, "確認完了です。");
        assert_eq!(outcome.execution_trace.len(), 2);
        assert_eq!(
            outcome.execution_trace[0].actions[0]["type"],
            "get_daily_summary"
        );
        assert_eq!(outcome.modified_ids, vec!["item_custom_1"]);
        assert!(outcome.errors.is_empty());

        // Round 2 must have seen round 1's feedback.
        let second_request = &backend.seen_round_requests.lock().unwrap()[1];
        assert!(second_request.messages.iter().any(|m| {
            m.role == "system" && m.content.contains("Execution round 1 completed.")
        }));
        // Every round starts with the agent prompt and the world block.
        assert!(second_request.messages[1].content.contains("today_date: 2026-02-12"));
    }

    #[tokio::test]
    async fn test_duplicate_write_rounds_stop_the_loop() {
        let store = store().await;
        let create = || {
            round(
                "同じアクションを実行します。",
                vec![tool_call(
                    "create_custom_task",
                    json!({ "name": "重複", "date": "2026-02-12", "time": "09:00" }),
                )],
            )
        };
        let backend = ScriptedBackend::new(vec![create(), create(), create(), create()]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("同じ予定を追加して"),
            base(),
            &caps(),
        )
        .await;

        assert_eq!(backend.rounds_consumed(), 2);
        assert_eq!(outcome.execution_trace.len(), 1);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("重複実行を停止しました")));
        assert_eq!(store.custom_tasks_for_date(base()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_resolve_recovers_without_duplicate_stop() {
        let store = store().await;
        let resolve = || {
            round(
                "まず計算します。",
                vec![tool_call(
                    "resolve_schedule_expression",
                    json!({ "expression": "明日9時", "base_date": "2026-02-12" }),
                )],
            )
        };
        let backend = ScriptedBackend::new(vec![
            resolve(),
            resolve(),
            round(
                "追加します。",
                vec![tool_call(
                    "create_custom_task",
                    json!({ "name": "歯医者", "date": "2026-02-13", "time": "09:00" }),
                )],
            ),
            round("完了です。", vec![]),
        ]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("明日9時に歯医者を追加して"),
            base(),
            &caps(),
        )
        .await;

        assert!(outcome
            .actions
            .iter()
            .any(|a| a.name == "create_custom_task"));
        assert_eq!(outcome.modified_ids, vec!["item_custom_1"]);
        assert!(!outcome
            .errors
            .iter()
            .any(|e| e.contains("同一アクションが連続して提案")));
        assert!(outcome
            .execution_trace
            .iter()
            .any(|t| t.skipped == Some(true)));
    }

    #[tokio::test]
    async fn test_duplicate_write_in_one_round_skipped_silently() {
        let store = store().await;
        let call = tool_call(
            "create_custom_task",
            json!({ "name": "歯医者", "date": "2026-02-13", "time": "10:00" }),
        );
        let backend = ScriptedBackend::new(vec![
            round("追加します。", vec![call.clone(), call]),
            round("完了です。", vec![]),
        ]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("明日10時に歯医者を追加"),
            base(),
            &caps(),
        )
        .await;

        // One insert, one silent skip; the first insert made progress.
        assert_eq!(
            store
                .custom_tasks_for_date(d(2026, 2, 13))
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.errors.is_empty());

        // The duplicate warning reaches the model in round feedback.
        let second_request = &backend.seen_round_requests.lock().unwrap()[1];
        assert!(second_request.messages.iter().any(|m| {
            m.content.contains("同一の更新アクションが再提案されたため再実行をスキップしました。")
        }));
    }

    #[tokio::test]
    async fn test_stale_read_streak_stops_the_loop() {
        let store = store().await;
        let summary = || {
            round(
                "確認します。",
                vec![tool_call("get_daily_summary", json!({ "date": "2026-02-12" }))],
            )
        };
        let backend =
            ScriptedBackend::new(vec![summary(), summary(), summary(), summary(), summary()]);
        let caps = SchedulerConfig {
            max_action_rounds: 10,
            max_same_read_action_streak: 3,
        };

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("今日の予定を確認して"),
            base(),
            &caps,
        )
        .await;

        assert_eq!(backend.rounds_consumed(), 4);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e == "同じ参照/計算アクションが3回連続したため処理を終了しました。"));
        // The reads themselves still produced results for the reply.
        assert!(!outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_round_limit_error_appended() {
        let store = store().await;
        let backend = ScriptedBackend::new(vec![
            round(
                "1件目。",
                vec![tool_call("create_custom_task", json!({ "name": "A" }))],
            ),
            round(
                "2件目。",
                vec![tool_call("create_custom_task", json!({ "name": "B" }))],
            ),
        ]);
        let caps = SchedulerConfig {
            max_action_rounds: 2,
            max_same_read_action_streak: 10,
        };

        let outcome =
            run_scheduler_multi_step(&store, &backend, &user("追加して"), base(), &caps).await;

        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("複数ステップ実行の上限（2ラウンド）")));
        assert_eq!(outcome.execution_trace.len(), 2);
    }

    #[tokio::test]
    async fn test_llm_failure_breaks_loop_with_error() {
        let store = store().await;
        let backend = ScriptedBackend::new(vec![Err(AgentError::Llm {
            provider: "anthropic".to_string(),
            message: "boom".to_string(),
        })]);

        let outcome =
            run_scheduler_multi_step(&store, &backend, &user("予定を追加して"), base(), &caps())
                .await;

        assert!(outcome.errors[0].contains("LLM 呼び出しに失敗しました"));
        assert!(outcome.execution_trace.is_empty());
    }

    #[tokio::test]
    async fn test_resolved_memory_feeds_back_to_the_model() {
        let store = store().await;
        let backend = ScriptedBackend::new(vec![
            round(
                "計算します。",
                vec![tool_call(
                    "resolve_schedule_expression",
                    json!({ "expression": "明日", "base_date": "2026-02-12" }),
                )],
            ),
            round("完了です。", vec![]),
        ]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("明日の予定を教えて"),
            base(),
            &caps(),
        )
        .await;

        assert!(outcome.results[0].contains("date=2026-02-13"));
        let second_request = &backend.seen_round_requests.lock().unwrap()[1];
        assert!(second_request.messages.iter().any(|m| {
            m.content.contains("resolved_datetime_memory:")
                && m.content.contains("expression=明日 => date=2026-02-13")
        }));
    }

    #[tokio::test]
    async fn test_week_scope_confirmation_rewrites_daily_summary() {
        let store = store().await;
        let conn = store.conn();
        queries::insert_custom_task(&conn, d(2026, 2, 27), "映画", "19:00", "")
            .await
            .unwrap();

        let backend = ScriptedBackend::new(vec![
            round(
                "確認します。",
                vec![tool_call("get_daily_summary", json!({ "date": "2026-02-23" }))],
            ),
            round("確認しました。", vec![]),
        ]);

        let outcome = run_scheduler_multi_step(
            &store,
            &backend,
            &user("再来週の予定を確認して"),
            base(),
            &caps(),
        )
        .await;

        assert_eq!(outcome.actions[0].name, "list_tasks_in_period");
        assert_eq!(
            outcome.actions[0].arg("start_date").unwrap(),
            "2026-02-23"
        );
        assert_eq!(outcome.actions[0].arg("end_date").unwrap(), "2026-03-01");
        assert!(outcome.results[0].contains("映画"));
    }

    #[test]
    fn test_week_scope_predicate() {
        assert!(is_week_scope_confirmation_request("来週の予定を確認して"));
        assert!(is_week_scope_confirmation_request("再来週のスケジュール教えて"));
        // Weekday present → single-day request, not week scope.
        assert!(!is_week_scope_confirmation_request("再来週火曜の予定を確認して"));
        // No confirmation verb.
        assert!(!is_week_scope_confirmation_request("来週の予定"));
        // No schedule noun.
        assert!(!is_week_scope_confirmation_request("来週を確認して"));
    }

    #[test]
    fn test_week_scope_expands_short_periods() {
        let actions = vec![ActionCall::new(
            "list_tasks_in_period",
            json!({ "start_date": "2026-02-24", "end_date": "2026-02-25" }),
        )];
        let normalized =
            normalize_actions_for_week_scope_confirmation(actions, "来週の予定を確認して");
        assert_eq!(normalized[0].arg("start_date").unwrap(), "2026-02-23");
        assert_eq!(normalized[0].arg("end_date").unwrap(), "2026-03-01");

        // Already a full week: untouched.
        let full_week = vec![ActionCall::new(
            "list_tasks_in_period",
            json!({ "start_date": "2026-02-23", "end_date": "2026-03-01" }),
        )];
        let normalized =
            normalize_actions_for_week_scope_confirmation(full_week, "来週の予定を確認して");
        assert_eq!(normalized[0].arg("start_date").unwrap(), "2026-02-23");
        assert_eq!(normalized[0].arg("end_date").unwrap(), "2026-03-01");
    }

    #[test]
    fn test_reference_date_injection() {
        let memory = vec![ResolvedMemoryItem {
            expression: "明日".to_string(),
            date: "2026-02-13".to_string(),
            time: "10:00".to_string(),
            datetime: "2026-02-13T10:00".to_string(),
            period_start: String::new(),
            period_end: String::new(),
        }];
        let actions = vec![ActionCall::new(
            "resolve_schedule_expression",
            json!({ "expression": "その3日後" }),
        )];
        let injected = inject_base_date_for_reference_resolves(actions, &memory);
        assert_eq!(injected[0].arg("base_date").unwrap(), "2026-02-13");

        // Explicit ISO base_date wins over the injection.
        let actions = vec![ActionCall::new(
            "resolve_schedule_expression",
            json!({ "expression": "その翌日", "base_date": "2026-03-01" }),
        )];
        let injected = inject_base_date_for_reference_resolves(actions, &memory);
        assert_eq!(injected[0].arg("base_date").unwrap(), "2026-03-01");

        // No reference token → untouched.
        let actions = vec![ActionCall::new(
            "resolve_schedule_expression",
            json!({ "expression": "明後日" }),
        )];
        let injected = inject_base_date_for_reference_resolves(actions, &memory);
        assert!(injected[0].arg("base_date").is_none());
    }

    #[test]
    fn test_reference_date_injection_chains_within_a_batch() {
        let memory = vec![ResolvedMemoryItem {
            expression: "明日".to_string(),
            date: "2026-02-13".to_string(),
            time: "00:00".to_string(),
            datetime: "2026-02-13T00:00".to_string(),
            period_start: String::new(),
            period_end: String::new(),
        }];
        let actions = vec![
            ActionCall::new(
                "resolve_schedule_expression",
                json!({ "expression": "その3日後" }),
            ),
            ActionCall::new(
                "resolve_schedule_expression",
                json!({ "expression": "その翌日" }),
            ),
        ];
        let injected = inject_base_date_for_reference_resolves(actions, &memory);
        assert_eq!(injected[0].arg("base_date").unwrap(), "2026-02-13");
        // Second reference anchors on the first resolution (02-16).
        assert_eq!(injected[1].arg("base_date").unwrap(), "2026-02-16");
    }

    #[test]
    fn test_infer_requested_steps_order_and_dedup() {
        let steps = infer_requested_steps("明日10時に歯医者を追加して、終わったら完了にして");
        let ids: Vec<&str> = steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["calculate", "add", "complete"]);

        let steps = infer_requested_steps("今日の予定を表示して");
        let ids: Vec<&str> = steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["calculate", "confirm"]);

        assert!(infer_requested_steps("こんにちは").is_empty());
    }

    #[test]
    fn test_format_step_progress() {
        let steps = infer_requested_steps("明日の予定を確認して追加して");
        let text = format_step_progress(&steps, 1);
        assert!(text.contains("- [x] 1. 日時計算"));
        assert!(text.contains("- [ ] 2. 予定確認"));
        assert!(text.contains("next_expected_step: 予定確認"));

        let done = format_step_progress(&steps, steps.len());
        assert!(done.contains("next_expected_step: (all completed)"));

        assert_eq!(format_step_progress(&[], 0), "(none)");
    }

    #[test]
    fn test_dedupe_modified_ids_keeps_first_occurrence() {
        let deduped = dedupe_modified_ids(vec![
            "item_custom_1".to_string(),
            "daily-log-card".to_string(),
            "item_custom_1".to_string(),
            "item_custom_2".to_string(),
        ]);
        assert_eq!(deduped, vec!["item_custom_1", "daily-log-card", "item_custom_2"]);
    }

    #[test]
    fn test_sanitize_text_breaks_function_syntax() {
        assert_eq!(
            sanitize_text("call <function=create_custom_task>{}"),
            "call (function=create_custom_task>{}"
        );
    }
}
