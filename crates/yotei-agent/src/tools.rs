use serde_json::{json, Value};
use yotei_core::types::ToolDefinition;

pub use yotei_llm::provider::REVIEW_DECISION_TOOL_NAME;

fn build_tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }),
    }
}

/// The full scheduler tool catalog: every dispatcher action, the expression
/// resolver, and the atomic calculators.
pub fn scheduler_tools() -> Vec<ToolDefinition> {
    vec![
        build_tool(
            "resolve_schedule_expression",
            "「明日」「再来週火曜の11時」などの相対日時表現を絶対日時に変換します。今日以外の日付を扱う前に必ず実行してください。",
            json!({
                "expression": { "type": "string", "description": "解釈したい日時表現" },
                "base_date": { "type": "string", "description": "基準日 YYYY-MM-DD（省略時は today_date）" },
                "base_time": { "type": "string", "description": "基準時刻 HH:MM" },
                "default_time": { "type": "string", "description": "時刻指定が無い場合の既定時刻 HH:MM" },
            }),
            &["expression"],
        ),
        build_tool(
            "calc_date_offset",
            "基準日から指定日数後（負なら前）の日付を計算します。",
            json!({
                "base_date": { "type": "string", "description": "YYYY-MM-DD" },
                "offset_days": { "type": "integer", "description": "日数（負なら過去方向）" },
            }),
            &["base_date", "offset_days"],
        ),
        build_tool(
            "calc_month_boundary",
            "指定月の月初(start)または月末(end)の日付を計算します。",
            json!({
                "year": { "type": "integer", "description": "西暦年" },
                "month": { "type": "integer", "description": "月 (1-12)" },
                "boundary": { "type": "string", "enum": ["start", "end"], "description": "start=月初 / end=月末" },
            }),
            &["year", "month", "boundary"],
        ),
        build_tool(
            "calc_nearest_weekday",
            "基準日から最も近い指定曜日を前方(forward)/後方(backward)に探します。当日が該当すれば当日を返します。",
            json!({
                "base_date": { "type": "string", "description": "YYYY-MM-DD" },
                "weekday": { "type": "integer", "description": "曜日 0=月 ... 6=日" },
                "direction": { "type": "string", "enum": ["forward", "backward"], "description": "探索方向" },
            }),
            &["base_date", "weekday", "direction"],
        ),
        build_tool(
            "calc_week_weekday",
            "基準日の週から week_offset 週後（負なら前）の指定曜日の日付を計算します。週は月曜起点です。",
            json!({
                "base_date": { "type": "string", "description": "YYYY-MM-DD" },
                "week_offset": { "type": "integer", "description": "週数（0=今週, 1=来週, 2=再来週, -1=先週）" },
                "weekday": { "type": "integer", "description": "曜日 0=月 ... 6=日" },
            }),
            &["base_date", "week_offset", "weekday"],
        ),
        build_tool(
            "calc_week_range",
            "基準日を含む週の月曜〜日曜の範囲を返します。",
            json!({
                "base_date": { "type": "string", "description": "YYYY-MM-DD" },
            }),
            &["base_date"],
        ),
        build_tool(
            "calc_time_offset",
            "基準日時から指定分数後（負なら前）の日時を計算します。日跨ぎにも対応します。",
            json!({
                "base_date": { "type": "string", "description": "YYYY-MM-DD" },
                "base_time": { "type": "string", "description": "HH:MM (24時間表記)" },
                "offset_minutes": { "type": "integer", "description": "分数（負なら過去方向）" },
            }),
            &["base_date", "base_time", "offset_minutes"],
        ),
        build_tool(
            "get_date_info",
            "指定日付の曜日・年月日情報を返します。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
            }),
            &["date"],
        ),
        build_tool(
            "create_custom_task",
            "日付・時間・名前を指定してカスタムタスクを追加します。日付を省略した場合は today_date を使ってください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
                "name": { "type": "string", "description": "タスク名" },
                "time": { "type": "string", "description": "HH:MM (24時間表記)" },
                "memo": { "type": "string", "description": "任意のメモ" },
            }),
            &["name"],
        ),
        build_tool(
            "create_tasks_in_range",
            "開始日から終了日まで（両端含む）毎日同じカスタムタスクを登録します。期間は最大365日です。",
            json!({
                "name": { "type": "string", "description": "タスク名" },
                "start_date": { "type": "string", "description": "YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "YYYY-MM-DD" },
                "time": { "type": "string", "description": "HH:MM (24時間表記)" },
                "memo": { "type": "string", "description": "任意のメモ" },
            }),
            &["name", "start_date", "end_date"],
        ),
        build_tool(
            "delete_custom_task",
            "指定したIDのカスタムタスクを削除します。",
            json!({
                "task_id": { "type": "integer", "description": "カスタムタスクID" },
            }),
            &["task_id"],
        ),
        build_tool(
            "toggle_step",
            "ステップの完了状態を更新します。日付が無い場合は today_date を利用してください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
                "step_id": { "type": "integer", "description": "ステップID" },
                "done": { "type": "boolean", "description": "完了なら true" },
                "memo": { "type": "string", "description": "任意のメモ" },
            }),
            &["step_id"],
        ),
        build_tool(
            "toggle_custom_task",
            "カスタムタスクの完了状態を更新します。",
            json!({
                "task_id": { "type": "integer", "description": "カスタムタスクID" },
                "done": { "type": "boolean", "description": "完了なら true" },
                "memo": { "type": "string", "description": "任意のメモ" },
            }),
            &["task_id"],
        ),
        build_tool(
            "update_custom_task_time",
            "カスタムタスクの予定時刻を変更します。",
            json!({
                "task_id": { "type": "integer", "description": "カスタムタスクID" },
                "new_time": { "type": "string", "description": "HH:MM (24時間表記)" },
            }),
            &["task_id", "new_time"],
        ),
        build_tool(
            "rename_custom_task",
            "カスタムタスクの名称を変更します。",
            json!({
                "task_id": { "type": "integer", "description": "カスタムタスクID" },
                "new_name": { "type": "string", "description": "新しい名称" },
            }),
            &["task_id", "new_name"],
        ),
        build_tool(
            "update_custom_task_memo",
            "カスタムタスクのメモを更新します。",
            json!({
                "task_id": { "type": "integer", "description": "カスタムタスクID" },
                "new_memo": { "type": "string", "description": "更新後のメモ（空文字で削除可）" },
            }),
            &["task_id", "new_memo"],
        ),
        build_tool(
            "update_log",
            "指定日付の日報を上書き保存します。日付が無い場合は today_date を使ってください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
                "content": { "type": "string", "description": "日報本文" },
            }),
            &["content"],
        ),
        build_tool(
            "append_day_log",
            "指定日付の日報に追記します。既存の内容は保持され、新しい内容が改行区切りで追加されます。日付が無い場合は today_date を使ってください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
                "content": { "type": "string", "description": "追記する内容" },
            }),
            &["content"],
        ),
        build_tool(
            "get_day_log",
            "指定日付の日報を取得します。日付が無い場合は today_date を使ってください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
            }),
            &[],
        ),
        build_tool(
            "add_routine",
            "新しいルーチンを追加します。days は 0=月, 6=日 のカンマ区切りです。",
            json!({
                "name": { "type": "string", "description": "ルーチン名" },
                "days": { "type": "string", "description": "例: 0,1,2,3,4" },
                "description": { "type": "string", "description": "説明/メモ" },
            }),
            &["name"],
        ),
        build_tool(
            "delete_routine",
            "ルーチンを削除します。routine_id か routine_name、または scope=all（全削除）を指定してください。",
            json!({
                "routine_id": { "type": "integer", "description": "ルーチンID" },
                "routine_name": { "type": "string", "description": "ルーチン名（部分一致可）" },
                "scope": { "type": "string", "description": "all を指定すると全ルーチンを削除" },
                "all": { "type": "boolean", "description": "true で全ルーチンを削除" },
            }),
            &[],
        ),
        build_tool(
            "update_routine_days",
            "ルーチンの曜日設定を変更します。days は 0=月, 6=日 のカンマ区切りです。",
            json!({
                "routine_id": { "type": "integer", "description": "ルーチンID" },
                "new_days": { "type": "string", "description": "例: 0,2,4" },
            }),
            &["routine_id", "new_days"],
        ),
        build_tool(
            "add_step",
            "ルーチンにステップを追加します。",
            json!({
                "routine_id": { "type": "integer", "description": "ルーチンID" },
                "name": { "type": "string", "description": "ステップ名" },
                "time": { "type": "string", "description": "HH:MM (24時間表記)" },
                "category": { "type": "string", "description": "カテゴリ (IoT / Browser / Lifestyle / Other)" },
            }),
            &["routine_id", "name"],
        ),
        build_tool(
            "delete_step",
            "指定IDのステップを削除します。",
            json!({
                "step_id": { "type": "integer", "description": "ステップID" },
            }),
            &["step_id"],
        ),
        build_tool(
            "update_step_time",
            "ステップの時刻を変更します。",
            json!({
                "step_id": { "type": "integer", "description": "ステップID" },
                "new_time": { "type": "string", "description": "HH:MM (24時間表記)" },
            }),
            &["step_id", "new_time"],
        ),
        build_tool(
            "rename_step",
            "ステップ名を変更します。",
            json!({
                "step_id": { "type": "integer", "description": "ステップID" },
                "new_name": { "type": "string", "description": "新しい名称" },
            }),
            &["step_id", "new_name"],
        ),
        build_tool(
            "update_step_memo",
            "ステップのメモを更新します。",
            json!({
                "step_id": { "type": "integer", "description": "ステップID" },
                "new_memo": { "type": "string", "description": "更新後のメモ（空文字で削除可）" },
            }),
            &["step_id", "new_memo"],
        ),
        build_tool(
            "list_tasks_in_period",
            "指定期間のタスク・ルーチンステップ一覧を取得します。",
            json!({
                "start_date": { "type": "string", "description": "YYYY-MM-DD" },
                "end_date": { "type": "string", "description": "YYYY-MM-DD" },
            }),
            &["start_date", "end_date"],
        ),
        build_tool(
            "get_daily_summary",
            "指定日付のサマリーを生成して返します。日付が無い場合は today_date を利用してください。",
            json!({
                "date": { "type": "string", "description": "YYYY-MM-DD" },
            }),
            &[],
        ),
    ]
}

/// Scheduler tools plus the reserved review-decision tool, for the external
/// conversation-review collaborator.
pub fn review_tools() -> Vec<ToolDefinition> {
    let mut tools = vec![build_tool(
        REVIEW_DECISION_TOOL_NAME,
        "レビュー結果をまとめます。actions を出す場合は別のツールコールとして発行してください。",
        json!({
            "action_required": { "type": "boolean", "description": "自動アクションが必要か" },
            "should_reply": { "type": "boolean", "description": "ユーザーへ返信すべきか" },
            "reply": { "type": "string", "description": "返信メッセージ（省略可）" },
            "notes": { "type": "string", "description": "内部メモ/補足" },
        }),
        &["action_required", "should_reply"],
    )];
    tools.extend(scheduler_tools());
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::READ_ONLY_ACTION_TYPES;

    #[test]
    fn test_catalog_covers_every_read_only_action() {
        let tools = scheduler_tools();
        for name in READ_ONLY_ACTION_TYPES {
            assert!(tools.iter().any(|t| t.name == name), "missing {name}");
        }
    }

    #[test]
    fn test_catalog_names_are_unique_and_schemas_closed() {
        let tools = scheduler_tools();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), before);

        for tool in &tools {
            assert_eq!(tool.parameters["type"], "object", "{}", tool.name);
            assert_eq!(
                tool.parameters["additionalProperties"], false,
                "{}",
                tool.name
            );
            assert!(tool.parameters["required"].is_array(), "{}", tool.name);
        }
    }

    #[test]
    fn test_required_fields() {
        let tools = scheduler_tools();
        let required_of = |name: &str| {
            tools
                .iter()
                .find(|t| t.name == name)
                .unwrap()
                .parameters["required"]
                .clone()
        };
        assert_eq!(required_of("create_custom_task"), json!(["name"]));
        assert_eq!(
            required_of("list_tasks_in_period"),
            json!(["start_date", "end_date"])
        );
        assert_eq!(required_of("get_daily_summary"), json!([]));
        assert_eq!(required_of("resolve_schedule_expression"), json!(["expression"]));
    }

    #[test]
    fn test_review_tools_prepend_decision_tool() {
        let tools = review_tools();
        assert_eq!(tools[0].name, REVIEW_DECISION_TOOL_NAME);
        assert_eq!(tools.len(), scheduler_tools().len() + 1);
    }
}
