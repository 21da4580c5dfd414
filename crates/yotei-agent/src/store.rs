use chrono::NaiveDate;
use libsql::{Builder, Connection, Database};
use yotei_core::error::{AgentError, Result};
use yotei_core::types::{ChatRecord, CustomTask, DailyLog, DayLog, Routine, Step};

/// Relational store for routines, steps, per-day step logs, custom tasks,
/// day journals and the chat transcript.
///
/// Row-level operations live in [`queries`] as free functions over a
/// `&Connection`, so the action dispatcher can run a whole batch inside one
/// transaction while read paths use the plain connection. One underlying
/// connection is shared via cheap clones; access is sequential per request.
pub struct ScheduleStore {
    _db: Database,
    conn: Connection,
}

fn map_err(e: libsql::Error) -> AgentError {
    AgentError::Database(e.to_string())
}

pub(crate) fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn sql_to_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| AgentError::Database(format!("bad date '{text}': {e}")))
}

impl ScheduleStore {
    /// Open a local libsql database at the given file path.
    pub async fn open(path: &str) -> Result<Self> {
        let db = Builder::new_local(path).build().await.map_err(map_err)?;
        let conn = db.connect().map_err(map_err)?;
        let store = Self { _db: db, conn };
        store.init_tables().await?;
        Ok(store)
    }

    /// Open an in-memory database. Used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub(crate) fn conn(&self) -> Connection {
        self.conn.clone()
    }

    async fn init_tables(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS routine (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                days TEXT NOT NULL DEFAULT '0,1,2,3,4',
                description TEXT NOT NULL DEFAULT ''
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS step (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                routine_id INTEGER NOT NULL REFERENCES routine(id),
                name TEXT NOT NULL,
                time TEXT NOT NULL DEFAULT '00:00',
                category TEXT NOT NULL DEFAULT 'Other',
                memo TEXT NOT NULL DEFAULT ''
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                step_id INTEGER NOT NULL REFERENCES step(id),
                done INTEGER NOT NULL DEFAULT 0,
                memo TEXT NOT NULL DEFAULT ''
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS custom_task (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                name TEXT NOT NULL,
                time TEXT NOT NULL DEFAULT '00:00',
                done INTEGER NOT NULL DEFAULT 0,
                memo TEXT NOT NULL DEFAULT ''
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS day_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL DEFAULT ''
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            (),
        )
        .await
        .map_err(map_err)?;

        Ok(())
    }

    // ─── Convenience reads used outside the dispatcher ────────────────

    pub async fn list_routines(&self) -> Result<Vec<Routine>> {
        queries::list_routines(&self.conn()).await
    }

    pub async fn steps_for_routine(&self, routine_id: i64) -> Result<Vec<Step>> {
        queries::steps_for_routine(&self.conn(), routine_id).await
    }

    pub async fn custom_tasks_for_date(&self, date: NaiveDate) -> Result<Vec<CustomTask>> {
        queries::custom_tasks_for_date(&self.conn(), date).await
    }

    pub async fn daily_logs_for_date(&self, date: NaiveDate) -> Result<Vec<DailyLog>> {
        queries::daily_logs_for_date(&self.conn(), date).await
    }

    pub async fn get_day_log(&self, date: NaiveDate) -> Result<Option<DayLog>> {
        queries::get_day_log(&self.conn(), date).await
    }

    // ─── Chat transcript ──────────────────────────────────────────────

    pub async fn append_chat(&self, role: &str, content: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO chat_history (role, content, created_at) VALUES (?, ?, ?)",
            libsql::params![
                role.to_string(),
                content.to_string(),
                yotei_core::types::now_unix()
            ],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn recent_chat(&self, limit: usize) -> Result<Vec<ChatRecord>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, role, content, created_at FROM chat_history ORDER BY id DESC LIMIT ?",
                libsql::params![limit as i64],
            )
            .await
            .map_err(map_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            records.push(ChatRecord {
                id: row.get::<i64>(0).map_err(map_err)?,
                role: row.get::<String>(1).map_err(map_err)?,
                content: row.get::<String>(2).map_err(map_err)?,
                created_at: row.get::<i64>(3).map_err(map_err)?,
            });
        }
        records.reverse();
        Ok(records)
    }

    pub async fn clear_chat(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM chat_history", ())
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

/// Row-level operations over an explicit connection (or transaction, via
/// deref). All dates cross the SQL boundary as `YYYY-MM-DD` text.
pub mod queries {
    use super::*;

    fn routine_from_row(row: &libsql::Row) -> Result<Routine> {
        Ok(Routine {
            id: row.get::<i64>(0).map_err(map_err)?,
            name: row.get::<String>(1).map_err(map_err)?,
            days: row.get::<String>(2).map_err(map_err)?,
            description: row.get::<String>(3).map_err(map_err)?,
        })
    }

    fn step_from_row(row: &libsql::Row) -> Result<Step> {
        Ok(Step {
            id: row.get::<i64>(0).map_err(map_err)?,
            routine_id: row.get::<i64>(1).map_err(map_err)?,
            name: row.get::<String>(2).map_err(map_err)?,
            time: row.get::<String>(3).map_err(map_err)?,
            category: row.get::<String>(4).map_err(map_err)?,
            memo: row.get::<String>(5).map_err(map_err)?,
        })
    }

    fn daily_log_from_row(row: &libsql::Row) -> Result<DailyLog> {
        Ok(DailyLog {
            id: row.get::<i64>(0).map_err(map_err)?,
            date: sql_to_date(&row.get::<String>(1).map_err(map_err)?)?,
            step_id: row.get::<i64>(2).map_err(map_err)?,
            done: row.get::<i64>(3).map_err(map_err)? != 0,
            memo: row.get::<String>(4).map_err(map_err)?,
        })
    }

    fn custom_task_from_row(row: &libsql::Row) -> Result<CustomTask> {
        Ok(CustomTask {
            id: row.get::<i64>(0).map_err(map_err)?,
            date: sql_to_date(&row.get::<String>(1).map_err(map_err)?)?,
            name: row.get::<String>(2).map_err(map_err)?,
            time: row.get::<String>(3).map_err(map_err)?,
            done: row.get::<i64>(4).map_err(map_err)? != 0,
            memo: row.get::<String>(5).map_err(map_err)?,
        })
    }

    fn day_log_from_row(row: &libsql::Row) -> Result<DayLog> {
        Ok(DayLog {
            id: row.get::<i64>(0).map_err(map_err)?,
            date: sql_to_date(&row.get::<String>(1).map_err(map_err)?)?,
            content: row.get::<String>(2).map_err(map_err)?,
        })
    }

    // ─── Routines ─────────────────────────────────────────────────────

    pub async fn insert_routine(
        conn: &Connection,
        name: &str,
        days: &str,
        description: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO routine (name, days, description) VALUES (?, ?, ?)",
            libsql::params![name.to_string(), days.to_string(), description.to_string()],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_routine(conn: &Connection, id: i64) -> Result<Option<Routine>> {
        let mut rows = conn
            .query(
                "SELECT id, name, days, description FROM routine WHERE id = ?",
                libsql::params![id],
            )
            .await
            .map_err(map_err)?;
        match rows.next().await.map_err(map_err)? {
            Some(row) => Ok(Some(routine_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_routines(conn: &Connection) -> Result<Vec<Routine>> {
        let mut rows = conn
            .query(
                "SELECT id, name, days, description FROM routine ORDER BY id",
                (),
            )
            .await
            .map_err(map_err)?;
        let mut routines = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            routines.push(routine_from_row(&row)?);
        }
        Ok(routines)
    }

    /// Delete a routine with its steps and their daily logs.
    pub async fn delete_routine(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM daily_log WHERE step_id IN (SELECT id FROM step WHERE routine_id = ?)",
            libsql::params![id],
        )
        .await
        .map_err(map_err)?;
        conn.execute("DELETE FROM step WHERE routine_id = ?", libsql::params![id])
            .await
            .map_err(map_err)?;
        conn.execute("DELETE FROM routine WHERE id = ?", libsql::params![id])
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn update_routine_days(conn: &Connection, id: i64, days: &str) -> Result<()> {
        conn.execute(
            "UPDATE routine SET days = ? WHERE id = ?",
            libsql::params![days.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    // ─── Steps ────────────────────────────────────────────────────────

    pub async fn insert_step(
        conn: &Connection,
        routine_id: i64,
        name: &str,
        time: &str,
        category: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO step (routine_id, name, time, category, memo) VALUES (?, ?, ?, ?, '')",
            libsql::params![
                routine_id,
                name.to_string(),
                time.to_string(),
                category.to_string()
            ],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_step(conn: &Connection, id: i64) -> Result<Option<Step>> {
        let mut rows = conn
            .query(
                "SELECT id, routine_id, name, time, category, memo FROM step WHERE id = ?",
                libsql::params![id],
            )
            .await
            .map_err(map_err)?;
        match rows.next().await.map_err(map_err)? {
            Some(row) => Ok(Some(step_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn steps_for_routine(conn: &Connection, routine_id: i64) -> Result<Vec<Step>> {
        let mut rows = conn
            .query(
                "SELECT id, routine_id, name, time, category, memo FROM step
                 WHERE routine_id = ? ORDER BY time, id",
                libsql::params![routine_id],
            )
            .await
            .map_err(map_err)?;
        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            steps.push(step_from_row(&row)?);
        }
        Ok(steps)
    }

    /// Delete a step with its daily logs.
    pub async fn delete_step(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM daily_log WHERE step_id = ?", libsql::params![id])
            .await
            .map_err(map_err)?;
        conn.execute("DELETE FROM step WHERE id = ?", libsql::params![id])
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn update_step_time(conn: &Connection, id: i64, time: &str) -> Result<()> {
        conn.execute(
            "UPDATE step SET time = ? WHERE id = ?",
            libsql::params![time.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn rename_step(conn: &Connection, id: i64, name: &str) -> Result<()> {
        conn.execute(
            "UPDATE step SET name = ? WHERE id = ?",
            libsql::params![name.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn update_step_memo(conn: &Connection, id: i64, memo: &str) -> Result<()> {
        conn.execute(
            "UPDATE step SET memo = ? WHERE id = ?",
            libsql::params![memo.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    // ─── Daily logs ───────────────────────────────────────────────────

    pub async fn get_daily_log(
        conn: &Connection,
        date: NaiveDate,
        step_id: i64,
    ) -> Result<Option<DailyLog>> {
        let mut rows = conn
            .query(
                "SELECT id, date, step_id, done, memo FROM daily_log WHERE date = ? AND step_id = ?",
                libsql::params![date_to_sql(date), step_id],
            )
            .await
            .map_err(map_err)?;
        match rows.next().await.map_err(map_err)? {
            Some(row) => Ok(Some(daily_log_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn daily_logs_for_date(conn: &Connection, date: NaiveDate) -> Result<Vec<DailyLog>> {
        let mut rows = conn
            .query(
                "SELECT id, date, step_id, done, memo FROM daily_log WHERE date = ? ORDER BY step_id",
                libsql::params![date_to_sql(date)],
            )
            .await
            .map_err(map_err)?;
        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            logs.push(daily_log_from_row(&row)?);
        }
        Ok(logs)
    }

    pub async fn insert_daily_log(
        conn: &Connection,
        date: NaiveDate,
        step_id: i64,
        done: bool,
        memo: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO daily_log (date, step_id, done, memo) VALUES (?, ?, ?, ?)",
            libsql::params![date_to_sql(date), step_id, done as i64, memo.to_string()],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_daily_log(
        conn: &Connection,
        id: i64,
        done: bool,
        memo: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE daily_log SET done = ?, memo = ? WHERE id = ?",
            libsql::params![done as i64, memo.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    // ─── Custom tasks ─────────────────────────────────────────────────

    pub async fn insert_custom_task(
        conn: &Connection,
        date: NaiveDate,
        name: &str,
        time: &str,
        memo: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO custom_task (date, name, time, done, memo) VALUES (?, ?, ?, 0, ?)",
            libsql::params![
                date_to_sql(date),
                name.to_string(),
                time.to_string(),
                memo.to_string()
            ],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_custom_task(conn: &Connection, id: i64) -> Result<Option<CustomTask>> {
        let mut rows = conn
            .query(
                "SELECT id, date, name, time, done, memo FROM custom_task WHERE id = ?",
                libsql::params![id],
            )
            .await
            .map_err(map_err)?;
        match rows.next().await.map_err(map_err)? {
            Some(row) => Ok(Some(custom_task_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_custom_task(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM custom_task WHERE id = ?", libsql::params![id])
            .await
            .map_err(map_err)?;
        Ok(())
    }

    pub async fn update_custom_task_done(
        conn: &Connection,
        id: i64,
        done: bool,
        memo: Option<&str>,
    ) -> Result<()> {
        match memo {
            Some(memo) => conn
                .execute(
                    "UPDATE custom_task SET done = ?, memo = ? WHERE id = ?",
                    libsql::params![done as i64, memo.to_string(), id],
                )
                .await
                .map_err(map_err)?,
            None => conn
                .execute(
                    "UPDATE custom_task SET done = ? WHERE id = ?",
                    libsql::params![done as i64, id],
                )
                .await
                .map_err(map_err)?,
        };
        Ok(())
    }

    pub async fn update_custom_task_time(conn: &Connection, id: i64, time: &str) -> Result<()> {
        conn.execute(
            "UPDATE custom_task SET time = ? WHERE id = ?",
            libsql::params![time.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn rename_custom_task(conn: &Connection, id: i64, name: &str) -> Result<()> {
        conn.execute(
            "UPDATE custom_task SET name = ? WHERE id = ?",
            libsql::params![name.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn update_custom_task_memo(conn: &Connection, id: i64, memo: &str) -> Result<()> {
        conn.execute(
            "UPDATE custom_task SET memo = ? WHERE id = ?",
            libsql::params![memo.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }

    pub async fn custom_tasks_for_date(
        conn: &Connection,
        date: NaiveDate,
    ) -> Result<Vec<CustomTask>> {
        let mut rows = conn
            .query(
                "SELECT id, date, name, time, done, memo FROM custom_task
                 WHERE date = ? ORDER BY time, id",
                libsql::params![date_to_sql(date)],
            )
            .await
            .map_err(map_err)?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            tasks.push(custom_task_from_row(&row)?);
        }
        Ok(tasks)
    }

    pub async fn custom_tasks_in_range(
        conn: &Connection,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CustomTask>> {
        let mut rows = conn
            .query(
                "SELECT id, date, name, time, done, memo FROM custom_task
                 WHERE date BETWEEN ? AND ? ORDER BY date, time, id",
                libsql::params![date_to_sql(start), date_to_sql(end)],
            )
            .await
            .map_err(map_err)?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_err)? {
            tasks.push(custom_task_from_row(&row)?);
        }
        Ok(tasks)
    }

    // ─── Day logs ─────────────────────────────────────────────────────

    pub async fn get_day_log(conn: &Connection, date: NaiveDate) -> Result<Option<DayLog>> {
        let mut rows = conn
            .query(
                "SELECT id, date, content FROM day_log WHERE date = ?",
                libsql::params![date_to_sql(date)],
            )
            .await
            .map_err(map_err)?;
        match rows.next().await.map_err(map_err)? {
            Some(row) => Ok(Some(day_log_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn insert_day_log(conn: &Connection, date: NaiveDate, content: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO day_log (date, content) VALUES (?, ?)",
            libsql::params![date_to_sql(date), content.to_string()],
        )
        .await
        .map_err(map_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_day_log_content(conn: &Connection, id: i64, content: &str) -> Result<()> {
        conn.execute(
            "UPDATE day_log SET content = ? WHERE id = ?",
            libsql::params![content.to_string(), id],
        )
        .await
        .map_err(map_err)?;
        Ok(())
    }
}
