use chrono::{Duration, NaiveDate};
use yotei_core::error::Result;

use crate::store::ScheduleStore;

/// Render "today's world" as the labeled text block handed to the LLM
/// every round. This is the model's sole view of mutable schedule state,
/// so it is rebuilt from the store each time.
pub async fn build_scheduler_context(store: &ScheduleStore, today: NaiveDate) -> Result<String> {
    let routines = store.list_routines().await?;
    let today_logs = store.daily_logs_for_date(today).await?;
    let custom_tasks = store.custom_tasks_for_date(today).await?;

    let mut recent_day_logs = Vec::new();
    for i in 0..3 {
        let date = today - Duration::days(i);
        if let Some(log) = store.get_day_log(date).await? {
            if !log.content.is_empty() {
                recent_day_logs.push(format!(
                    "Date: {} | Content: {}",
                    date.format("%Y-%m-%d"),
                    log.content
                ));
            }
        }
    }

    let mut routine_lines = Vec::new();
    for routine in &routines {
        let steps = store.steps_for_routine(routine.id).await?;
        let step_text = if steps.is_empty() {
            "no steps".to_string()
        } else {
            steps
                .iter()
                .map(|step| format!("[{}] {} {} ({})", step.id, step.time, step.name, step.category))
                .collect::<Vec<_>>()
                .join(", ")
        };
        routine_lines.push(format!(
            "- Routine {}: {} | days={} | {}",
            routine.id, routine.name, routine.days, step_text
        ));
    }

    let custom_lines: Vec<String> = custom_tasks
        .iter()
        .map(|task| {
            let memo = if task.memo.is_empty() {
                String::new()
            } else {
                format!(" memo={}", task.memo)
            };
            format!(
                "- CustomTask {}: {} {} done={}{}",
                task.id, task.time, task.name, task.done, memo
            )
        })
        .collect();

    let log_lines: Vec<String> = today_logs
        .iter()
        .map(|log| {
            let memo = if log.memo.is_empty() {
                String::new()
            } else {
                format!(" memo={}", log.memo)
            };
            format!("- StepLog step_id={} done={}{}", log.step_id, log.done, memo)
        })
        .collect();

    let mut parts = vec![
        format!("today_date: {}", today.format("%Y-%m-%d")),
        "routines:".to_string(),
    ];
    parts.extend(routine_lines);
    parts.push("today_custom_tasks:".to_string());
    if custom_lines.is_empty() {
        parts.push("(none)".to_string());
    } else {
        parts.extend(custom_lines);
    }
    parts.push("today_step_logs:".to_string());
    if log_lines.is_empty() {
        parts.push("(none)".to_string());
    } else {
        parts.extend(log_lines);
    }
    parts.push("recent_day_logs:".to_string());
    if recent_day_logs.is_empty() {
        parts.push("(none)".to_string());
    } else {
        parts.extend(recent_day_logs);
    }

    Ok(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::queries;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_context() {
        let store = ScheduleStore::open_in_memory().await.unwrap();
        let context = build_scheduler_context(&store, d(2026, 2, 12)).await.unwrap();
        assert_eq!(
            context,
            "today_date: 2026-02-12\n\
             routines:\n\
             today_custom_tasks:\n\
             (none)\n\
             today_step_logs:\n\
             (none)\n\
             recent_day_logs:\n\
             (none)"
        );
    }

    #[tokio::test]
    async fn test_populated_context_layout() {
        let store = ScheduleStore::open_in_memory().await.unwrap();
        let conn = store.conn();
        let today = d(2026, 2, 12);

        let rid = queries::insert_routine(&conn, "朝の支度", "0,1,2,3,4", "")
            .await
            .unwrap();
        // Inserted out of time order; the block must sort by time.
        queries::insert_step(&conn, rid, "朝食", "07:30", "Lifestyle")
            .await
            .unwrap();
        let sid = queries::insert_step(&conn, rid, "ストレッチ", "07:00", "Lifestyle")
            .await
            .unwrap();
        queries::insert_routine(&conn, "空のルーチン", "5", "").await.unwrap();

        queries::insert_custom_task(&conn, today, "歯医者", "10:00", "保険証")
            .await
            .unwrap();
        queries::insert_daily_log(&conn, today, sid, true, "").await.unwrap();
        queries::insert_day_log(&conn, today, "今日の記録").await.unwrap();
        queries::insert_day_log(&conn, today - Duration::days(1), "昨日の記録")
            .await
            .unwrap();
        // Three days ago falls outside the recent window.
        queries::insert_day_log(&conn, today - Duration::days(3), "古い記録")
            .await
            .unwrap();

        let context = build_scheduler_context(&store, today).await.unwrap();

        let routine_line = context
            .lines()
            .find(|l| l.contains("朝の支度"))
            .unwrap();
        assert!(routine_line.contains("days=0,1,2,3,4"));
        let stretch = routine_line.find("ストレッチ").unwrap();
        let breakfast = routine_line.find("朝食").unwrap();
        assert!(stretch < breakfast, "steps must be sorted by time");

        assert!(context.contains("| no steps"));
        assert!(context.contains("- CustomTask 1: 10:00 歯医者 done=false memo=保険証"));
        assert!(context.contains(&format!("- StepLog step_id={sid} done=true")));
        assert!(context.contains("Date: 2026-02-12 | Content: 今日の記録"));
        assert!(context.contains("Date: 2026-02-11 | Content: 昨日の記録"));
        assert!(!context.contains("古い記録"));

        // Section order is fixed.
        let idx = |needle: &str| context.find(needle).unwrap();
        assert!(idx("today_date:") < idx("routines:"));
        assert!(idx("routines:") < idx("today_custom_tasks:"));
        assert!(idx("today_custom_tasks:") < idx("today_step_logs:"));
        assert!(idx("today_step_logs:") < idx("recent_day_logs:"));
    }
}
