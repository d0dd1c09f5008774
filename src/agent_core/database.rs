//! SQLite session backend.
//!
//! Uses `rusqlite` in synchronous mode behind a mutex; calls are short and
//! the store never holds the connection across an await point. WAL mode is
//! enabled so history reads do not block turn commits.
//!
//! The turn lock lives in the owning process, so the database is opened in
//! exclusive locking mode: a second process opening the same file fails
//! instead of running turns that race this one.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::errors::DeskError;
use super::session_store::{lock, SessionBackend};
use super::types::{
    ConversationContext, FlowState, Message, MessageRole, Session, SessionId, TransparencyReport,
};

// ─── Database ───────────────────────────────────────────────────────────────

/// Persistent [`SessionBackend`].
pub struct SqliteSessionBackend {
    conn: Mutex<Connection>,
}

impl SqliteSessionBackend {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, DeskError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA locking_mode=EXCLUSIVE;")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| DeskError::Storage {
            reason: format!("session database {path} is in use by another process: {e}"),
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        tracing::info!(path, "session database opened");
        Ok(db)
    }

    /// Create all required tables if they don't exist.
    fn create_tables(&self) -> Result<(), DeskError> {
        lock(&self.conn)?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                flow_state TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                turns INTEGER NOT NULL DEFAULT 0,
                closed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS session_messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS turn_reports (
                report_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                turn INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                report TEXT NOT NULL,
                PRIMARY KEY (session_id, turn),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_activity
                ON sessions(last_activity);
            ",
        )?;
        Ok(())
    }
}

impl SessionBackend for SqliteSessionBackend {
    fn load(&self, id: SessionId) -> Result<Option<Session>, DeskError> {
        let conn = lock(&self.conn)?;
        let key = id.to_string();

        let row = conn
            .query_row(
                "SELECT created_at, last_activity, flow_state, context, turns, closed
                 FROM sessions WHERE id = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i32>(5)? != 0,
                    ))
                },
            )
            .optional()?;

        let Some((created_at, last_activity, flow_state, context, turns, closed)) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT role, text, timestamp, payload
             FROM session_messages
             WHERE session_id = ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, text, timestamp, payload) = row?;
            messages.push(Message {
                role: str_to_role(&role)?,
                text,
                timestamp: parse_time(&timestamp)?,
                payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
            });
        }

        Ok(Some(Session {
            id,
            created_at: parse_time(&created_at)?,
            last_activity: parse_time(&last_activity)?,
            flow_state: str_to_flow(&flow_state)?,
            messages,
            context: serde_json::from_str::<ConversationContext>(&context)?,
            turns: turns as u32,
            closed,
        }))
    }

    fn create_if_absent(&self, session: &Session) -> Result<bool, DeskError> {
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions (id, created_at, last_activity, flow_state, context, turns, closed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id.to_string(),
                session.created_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
                flow_to_str(session.flow_state),
                serde_json::to_string(&session.context)?,
                session.turns as i64,
                session.closed as i32,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn save(&self, session: &Session) -> Result<(), DeskError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let key = session.id.to_string();

        tx.execute(
            "INSERT INTO sessions (id, created_at, last_activity, flow_state, context, turns, closed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                last_activity = excluded.last_activity,
                flow_state = excluded.flow_state,
                context = excluded.context,
                turns = excluded.turns,
                closed = excluded.closed",
            params![
                key,
                session.created_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
                flow_to_str(session.flow_state),
                serde_json::to_string(&session.context)?,
                session.turns as i64,
                session.closed as i32,
            ],
        )?;

        // History is append-only: only rows past the stored count are new.
        let stored: i64 = tx.query_row(
            "SELECT COUNT(*) FROM session_messages WHERE session_id = ?1",
            params![key],
            |row| row.get(0),
        )?;
        for (seq, msg) in session.messages.iter().enumerate().skip(stored as usize) {
            let payload = msg.payload.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO session_messages (session_id, seq, role, text, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key,
                    seq as i64,
                    role_to_str(msg.role),
                    msg.text,
                    msg.timestamp.to_rfc3339(),
                    payload,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn remove(&self, id: SessionId) -> Result<bool, DeskError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])?;
        Ok(removed > 0)
    }

    fn activity(&self) -> Result<Vec<(SessionId, DateTime<Utc>)>, DeskError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT id, last_activity FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, at) = row?;
            let id = id.parse::<SessionId>().map_err(|e| DeskError::Storage {
                reason: format!("bad session id '{id}': {e}"),
            })?;
            out.push((id, parse_time(&at)?));
        }
        Ok(out)
    }

    fn save_report(&self, report: &TransparencyReport) -> Result<(), DeskError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT OR REPLACE INTO turn_reports (report_id, session_id, turn, created_at, report)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report.report_id,
                report.session_id.to_string(),
                report.turn as i64,
                report.created_at.to_rfc3339(),
                serde_json::to_string(report)?,
            ],
        )?;
        Ok(())
    }

    fn reports(&self, id: SessionId) -> Result<Vec<TransparencyReport>, DeskError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT report FROM turn_reports WHERE session_id = ?1 ORDER BY turn ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(serde_json::from_str(&row?)?);
        }
        Ok(reports)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_time(s: &str) -> Result<DateTime<Utc>, DeskError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DeskError::Storage {
            reason: format!("bad timestamp '{s}': {e}"),
        })
}

fn role_to_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Agent => "agent",
        MessageRole::System => "system",
    }
}

fn str_to_role(s: &str) -> Result<MessageRole, DeskError> {
    match s {
        "user" => Ok(MessageRole::User),
        "agent" => Ok(MessageRole::Agent),
        "system" => Ok(MessageRole::System),
        other => Err(DeskError::Storage {
            reason: format!("unknown message role '{other}'"),
        }),
    }
}

fn flow_to_str(state: FlowState) -> &'static str {
    match state {
        FlowState::Active => "active",
        FlowState::CollectingInfo => "collecting_info",
        FlowState::Completed => "completed",
        FlowState::Escalated => "escalated",
    }
}

fn str_to_flow(s: &str) -> Result<FlowState, DeskError> {
    match s {
        "active" => Ok(FlowState::Active),
        "collecting_info" => Ok(FlowState::CollectingInfo),
        "completed" => Ok(FlowState::Completed),
        "escalated" => Ok(FlowState::Escalated),
        other => Err(DeskError::Storage {
            reason: format!("unknown flow state '{other}'"),
        }),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
