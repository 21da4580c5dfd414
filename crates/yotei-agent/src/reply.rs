use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use yotei_core::types::{ChatMessage, ChatRequest};

use crate::llm::ChatBackend;

const EXEC_TRACE_MARKER_PREFIX: &str = "[[EXEC_TRACE_B64:";
const EXEC_TRACE_MARKER_SUFFIX: &str = "]]";

// ─── Execution trace marker ───────────────────────────────────────────

static TRACE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n?\[\[EXEC_TRACE_B64:([A-Za-z0-9+/=]+)\]\]\s*$").unwrap()
});

/// Append the run's execution trace to the stored assistant content as a
/// base64 marker. Empty traces leave the content untouched.
pub fn attach_execution_trace(content: &str, execution_trace: &[Value]) -> String {
    let items: Vec<&Value> = execution_trace.iter().filter(|v| v.is_object()).collect();
    if items.is_empty() {
        return content.to_string();
    }
    let trace_json = match serde_json::to_string(&items) {
        Ok(json) => json,
        Err(_) => return content.to_string(),
    };
    let encoded = BASE64.encode(trace_json.as_bytes());
    format!("{content}\n{EXEC_TRACE_MARKER_PREFIX}{encoded}{EXEC_TRACE_MARKER_SUFFIX}")
}

/// Split stored content into the clean reply and the embedded trace. Any
/// decode failure yields the original text and an empty trace.
pub fn extract_execution_trace(content: &str) -> (String, Vec<Value>) {
    let Some(caps) = TRACE_MARKER.captures(content) else {
        return (content.to_string(), vec![]);
    };
    let whole = caps.get(0).unwrap();
    let body = content[..whole.start()].trim_end().to_string();

    let decoded = match BASE64.decode(caps[1].as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => return (body, vec![]),
    };
    let text = match String::from_utf8(decoded) {
        Ok(text) => text,
        Err(_) => return (body, vec![]),
    };
    let parsed: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => return (body, vec![]),
    };
    let Value::Array(items) = parsed else {
        return (body, vec![]);
    };
    let trace = items.into_iter().filter(|v| v.is_object()).collect();
    (body, trace)
}

// ─── Reply filtering ──────────────────────────────────────────────────

static NO_SCHEDULE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"予定\s*(?:な\s*し|無し)").unwrap());
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Drop "予定なし" lines entirely and collapse the blank runs they leave.
pub fn remove_no_schedule_lines(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !NO_SCHEDULE_LINE.is_match(line))
        .collect();
    BLANK_RUNS
        .replace_all(&kept.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Loop-control messages recorded for the trace but never shown to users.
const INTERNAL_ERROR_MARKERS: [&str; 5] = [
    "同一アクションが連続して提案されたため、重複実行を停止しました。",
    "同じ参照/計算アクションが",
    "進捗が得られない状態が続いたため処理を終了しました。",
    "複数ステップ実行の上限",
    "同一の更新アクションが再提案されたため再実行をスキップしました。",
];

pub fn is_internal_system_error(error_text: &str) -> bool {
    let text = error_text.trim();
    if text.is_empty() {
        return false;
    }
    INTERNAL_ERROR_MARKERS.iter().any(|marker| text.contains(marker))
}

pub fn visible_errors(errors: &[String]) -> Vec<&String> {
    errors
        .iter()
        .filter(|e| !is_internal_system_error(e))
        .collect()
}

/// Summarizer output that still contains raw execution markers gets
/// discarded in favor of the deterministic fallback.
fn looks_mechanical_reply(text: &str) -> bool {
    ["【実行結果】", "計算結果:", "expression=", "source=", "datetime="]
        .iter()
        .any(|marker| text.contains(marker))
}

// ─── Deterministic friendly fallback ──────────────────────────────────

static FRIENDLY_CALC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^計算結果:\s*expression=(.+?)\s+date=([0-9]{4}-[0-9]{2}-[0-9]{2})\s+time=([0-9]{2}:[0-9]{2})",
    )
    .unwrap()
});
static FRIENDLY_ADD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^カスタムタスク「(.+?)」\(ID:\s*\d+\)\s+を\s+([0-9]{4}-[0-9]{2}-[0-9]{2})\s+の\s+([0-9]{2}:[0-9]{2})\s+に追加しました。",
    )
    .unwrap()
});
static FRIENDLY_TOGGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^カスタムタスク「(.+?)」を\s+(完了|未完了)\s+に更新しました。").unwrap()
});
static FRIENDLY_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{4}-[0-9]{2}-[0-9]{2})\s+の活動概要:").unwrap());
static FRIENDLY_SUMMARY_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s*([0-9]{2}:[0-9]{2})\s+(.+?)\s+\((完了|未完了)\)").unwrap()
});

fn friendly_result_line(result: &str) -> Vec<String> {
    let text = result.trim();
    if text.is_empty() {
        return vec![];
    }

    if let Some(caps) = FRIENDLY_CALC.captures(text) {
        return vec![format!(
            "🧮 「{}」を {} {} に計算しました！",
            caps[1].trim(),
            &caps[2],
            &caps[3]
        )];
    }

    if let Some(caps) = FRIENDLY_ADD.captures(text) {
        return vec![format!(
            "📅 {} {} に「{}」を追加しました！",
            &caps[2],
            &caps[3],
            caps[1].trim()
        )];
    }

    if let Some(caps) = FRIENDLY_TOGGLE.captures(text) {
        return vec![format!("✅ 「{}」を{}にしました。", caps[1].trim(), &caps[2])];
    }

    if let Some(caps) = FRIENDLY_SUMMARY.captures(text) {
        let mut lines = vec![format!("📋 {} の予定を確認しました！", &caps[1])];
        let details: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("- "))
            .filter_map(|line| {
                FRIENDLY_SUMMARY_ENTRY.captures(line).map(|entry| {
                    format!("・{} {}（{}）", &entry[1], entry[2].trim(), &entry[3])
                })
            })
            .collect();
        if details.is_empty() {
            lines.push("・いまのところ目立った予定はありません。".to_string());
        } else {
            lines.extend(details.into_iter().take(5));
        }
        return lines;
    }

    vec![format!("・{text}")]
}

/// Deterministic reply used when the summarizer fails or echoes raw
/// markers.
pub fn build_pop_friendly_reply(
    user_message: &str,
    results: &[String],
    errors: &[String],
) -> String {
    let mut lines = vec!["✨ 実行しました！".to_string()];

    for result in results {
        lines.extend(friendly_result_line(result));
    }

    let visible = visible_errors(errors);
    if !visible.is_empty() {
        lines.push("⚠️ いくつか確認が必要な点があります。".to_string());
        lines.extend(visible.iter().take(3).map(|e| format!("・{e}")));
    }

    if results.is_empty() && visible.is_empty() {
        if user_message.trim().is_empty() {
            lines.push("内容を確認しました。".to_string());
        } else {
            lines.push("内容を確認しました。必要なら次の操作もすぐ進められます。".to_string());
        }
    }

    lines.push("🌈 ほかにもやりたい操作があれば続けて教えてください！".to_string());
    remove_no_schedule_lines(&lines.join("\n"))
}

// ─── Final reply synthesis ────────────────────────────────────────────

const SUMMARY_SYSTEM_PROMPT: &str = "あなたはユーザーのスケジュール管理をサポートする親しみやすいAIパートナーです。\n\
ユーザーの要望に対してシステムがアクションを実行しました。\n\
その「実行結果」をもとに、ユーザーへの最終的な回答を作成してください。\n\
\n\
## ガイドライン\n\
1. **フレンドリーに**: 絵文字（📅, ✅, ✨, 👍など）を適度に使用し、硬苦しくない丁寧語（です・ます）で話してください。\n\
2. **分かりやすく**: 実行結果の羅列（「カスタムタスク[2]...」のような形式）は避け、人間が読みやすい文章に整形してください。\n\
   - 例: 「12月10日の9時から『カラオケ』の予定が入っていますね！楽しんできてください🎤」\n\
   - 予定がない日は `予定なし` と書かず、その行自体を省略してください。\n\
   - `expression=...` `source=...` のような内部表現はそのまま出力しないでください。\n\
3. **エラーへの対応**: エラーがある場合は、優しくその旨を伝え、どうすればよいか（もし分かれば）示唆してください。\n\
   - 重複停止や上限到達などの内部制御メッセージは、必要時だけ『一部を安全のためスキップしました』程度に言い換えてください。\n\
4. **元の文脈を維持**: ユーザーの元の発言に対する返答として自然になるようにしてください。\n";

/// Produce the user-facing reply: verbatim LLM text when nothing visible
/// happened, otherwise a summarizer paraphrase with a deterministic
/// fallback.
pub async fn build_final_reply<B: ChatBackend>(
    llm: &B,
    user_message: &str,
    reply_text: &str,
    results: &[String],
    errors: &[String],
) -> String {
    let visible = visible_errors(errors);
    if results.is_empty() && visible.is_empty() {
        let reply = if reply_text.is_empty() {
            "了解しました。"
        } else {
            reply_text
        };
        return remove_no_schedule_lines(reply);
    }

    let mut result_text = String::new();
    if !results.is_empty() {
        result_text.push_str("【実行結果】\n");
        for item in results {
            result_text.push_str(&format!("- {item}\n"));
        }
    }
    if !visible.is_empty() {
        result_text.push_str("【エラー】\n");
        for err in &visible {
            result_text.push_str(&format!("- {err}\n"));
        }
    }

    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(format!("ユーザーの発言: {user_message}\n\n{result_text}")),
        ],
        max_tokens: Some(1000),
        temperature: Some(0.7),
    };

    let final_reply = match llm.chat_summarize(request).await {
        Ok(response) if !looks_mechanical_reply(&response.content) => response.content,
        Ok(_) => build_pop_friendly_reply(user_message, results, errors),
        Err(e) => {
            log!(" [summary-llm] failed: {e}");
            build_pop_friendly_reply(user_message, results, errors)
        }
    };

    remove_no_schedule_lines(&final_reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;
    use serde_json::json;
    use yotei_core::types::ChatResponse;

    #[test]
    fn test_trace_roundtrip() {
        let trace = vec![json!({
            "round": 1,
            "actions": [{ "type": "create_custom_task", "params": { "name": "歯医者" } }],
            "results": ["カスタムタスク「歯医者」(ID: 1) を 2026-02-13 の 09:00 に追加しました。"],
            "errors": [],
        })];
        let stored = attach_execution_trace("保存済み", &trace);
        assert!(stored.starts_with("保存済み\n[[EXEC_TRACE_B64:"));
        assert!(stored.ends_with("]]"));

        let (content, extracted) = extract_execution_trace(&stored);
        assert_eq!(content, "保存済み");
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0]["actions"][0]["type"], "create_custom_task");
        assert_eq!(extracted, trace);
    }

    #[test]
    fn test_trace_absent_and_corrupt() {
        let (content, trace) = extract_execution_trace("マーカーなし");
        assert_eq!(content, "マーカーなし");
        assert!(trace.is_empty());

        let corrupt = "返信\n[[EXEC_TRACE_B64:!!notbase64!!]]";
        let (content, trace) = extract_execution_trace(corrupt);
        assert_eq!(content, corrupt);
        assert!(trace.is_empty());

        let bad_payload = format!("返信\n[[EXEC_TRACE_B64:{}]]", BASE64.encode(b"not json"));
        let (content, trace) = extract_execution_trace(&bad_payload);
        assert_eq!(content, "返信");
        assert!(trace.is_empty());
    }

    #[test]
    fn test_attach_empty_trace_is_identity() {
        assert_eq!(attach_execution_trace("返信", &[]), "返信");
    }

    #[test]
    fn test_remove_no_schedule_lines() {
        let input = "10時に会議\n予定なし\n\n\n予定 無し\n夕方は散歩";
        assert_eq!(remove_no_schedule_lines(input), "10時に会議\n\n夕方は散歩");
        assert_eq!(remove_no_schedule_lines("予定なし"), "");
    }

    #[test]
    fn test_internal_errors_are_filtered() {
        let errors = vec![
            "同じ参照/計算アクションが10回連続したため処理を終了しました。".to_string(),
            "複数ステップ実行の上限（10ラウンド）に達したため処理を終了しました。".to_string(),
            "task_id=99 が見つかりませんでした。".to_string(),
        ];
        let visible = visible_errors(&errors);
        assert_eq!(visible.len(), 1);
        assert!(visible[0].contains("task_id=99"));
    }

    #[test]
    fn test_friendly_fallback_formats_known_lines() {
        let results = vec![
            "計算結果: expression=再来週火曜の11時 date=2026-02-24 time=11:00 datetime=2026-02-24T11:00 source=relative_week+explicit_time".to_string(),
            "カスタムタスク「歯科検診」(ID: 7) を 2026-02-24 の 11:00 に追加しました。".to_string(),
            "カスタムタスク「歯科検診」を 完了 に更新しました。".to_string(),
        ];
        let errors = vec!["同じ参照/計算アクションが続いたため処理を終了しました。".to_string()];

        let reply = build_pop_friendly_reply("再来週火曜の11時に歯科検診を追加して", &results, &errors);

        assert!(reply.contains("✨ 実行しました！"));
        assert!(reply.contains("🧮 「再来週火曜の11時」を 2026-02-24 11:00 に計算しました！"));
        assert!(reply.contains("📅 2026-02-24 11:00 に「歯科検診」を追加しました！"));
        assert!(reply.contains("✅ 「歯科検診」を完了にしました。"));
        assert!(reply.contains("🌈 ほかにもやりたい操作があれば続けて教えてください！"));
        assert!(!reply.contains("expression="));
        assert!(!reply.contains("source="));
        assert!(!reply.contains("同じ参照/計算アクション"));
    }

    #[test]
    fn test_friendly_fallback_summary_block() {
        let summary = "2026-02-12 の活動概要:\n\
                       日報: なし\n\
                       カスタムタスク:\n\
                       - 10:00 歯医者 (未完了) (メモ: なし)\n\
                       ルーチンステップ:\n\
                       - 07:00 朝の支度 - ストレッチ (完了) (メモ: なし)";
        let reply = build_pop_friendly_reply("今日の予定見せて", &[summary.to_string()], &[]);
        assert!(reply.contains("📋 2026-02-12 の予定を確認しました！"));
        assert!(reply.contains("・10:00 歯医者（未完了）"));
        assert!(reply.contains("・07:00 朝の支度 - ストレッチ（完了）"));
    }

    #[test]
    fn test_friendly_fallback_visible_errors_capped_at_three() {
        let errors: Vec<String> = (1..=5)
            .map(|i| format!("task_id={i} が見つかりませんでした。"))
            .collect();
        let reply = build_pop_friendly_reply("やって", &[], &errors);
        assert!(reply.contains("⚠️ いくつか確認が必要な点があります。"));
        assert!(reply.contains("task_id=3"));
        assert!(!reply.contains("task_id=4"));
    }

    #[tokio::test]
    async fn test_final_reply_verbatim_when_nothing_visible_happened() {
        let backend = ScriptedBackend::new(vec![]);
        let internal = vec!["複数ステップ実行の上限（10ラウンド）に達したため処理を終了しました。".to_string()];
        let reply =
            build_final_reply(&backend, "こんにちは", "今日は予定がありません。\n予定なし", &[], &internal).await;
        assert_eq!(reply, "今日は予定がありません。");

        let empty = build_final_reply(&backend, "こんにちは", "", &[], &[]).await;
        assert_eq!(empty, "了解しました。");
    }

    #[tokio::test]
    async fn test_final_reply_uses_summarizer_output() {
        let backend = ScriptedBackend::new(vec![]).with_summaries(vec![Ok(ChatResponse::text(
            "2月24日の11時に歯科検診を入れておきました！✨",
        ))]);
        let results = vec!["カスタムタスク「歯科検診」(ID: 7) を 2026-02-24 の 11:00 に追加しました。".to_string()];
        let reply = build_final_reply(&backend, "追加して", "", &results, &[]).await;
        assert_eq!(reply, "2月24日の11時に歯科検診を入れておきました！✨");
    }

    #[tokio::test]
    async fn test_final_reply_discards_mechanical_summarizer_output() {
        let backend = ScriptedBackend::new(vec![]).with_summaries(vec![Ok(ChatResponse::text(
            "【実行結果】\n- expression=明日",
        ))]);
        let results = vec!["カスタムタスク「歯科検診」(ID: 7) を 2026-02-24 の 11:00 に追加しました。".to_string()];
        let reply = build_final_reply(&backend, "追加して", "", &results, &[]).await;
        assert!(reply.contains("✨ 実行しました！"));
        assert!(reply.contains("📅 2026-02-24 11:00 に「歯科検診」を追加しました！"));
        assert!(!reply.contains("【実行結果】"));
    }

    #[tokio::test]
    async fn test_final_reply_falls_back_when_summarizer_fails() {
        let backend = ScriptedBackend::new(vec![]); // no summaries scripted → Err
        let results = vec!["カスタムタスク「歯科検診」を 完了 に更新しました。".to_string()];
        let reply = build_final_reply(&backend, "完了にして", "", &results, &[]).await;
        assert!(reply.contains("✅ 「歯科検診」を完了にしました。"));
    }
}
