//! SQLite persistence for the edittrack authority.
//!
//! Single-writer store: users, files, sessions, an append-only file_events
//! audit log, comments and the tracker registry. Mutating statements name
//! exactly the columns their transition may touch; in particular, nothing
//! here but `set_session_commented` can write `is_commented`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileRow {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub file_id: String,
    pub tracker_id: Option<String>,
    pub started_at: String,
    pub last_activity: String,
    pub ended_at: Option<String>,
    pub hash_before: Option<String>,
    pub hash_after: Option<String>,
    pub resume_count: u32,
    pub is_commented: bool,
    pub is_multi_user: bool,
    pub co_editors: Option<String>,
    pub last_confirmed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommentRow {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub content: String,
    pub change_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrackerRow {
    pub tracker_id: String,
    pub command_socket: String,
    pub registered_at: String,
    pub last_seen_at: String,
}

/// Session joined with its file and user for the query surface.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub session: SessionRow,
    pub file_path: String,
    pub file_name: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<CommentRow>,
}

const SESSION_COLUMNS: &str = "id, user_id, file_id, tracker_id, started_at, last_activity, \
     ended_at, hash_before, hash_after, COALESCE(resume_count, 0), \
     COALESCE(is_commented, 0), COALESCE(is_multi_user, 0), co_editors, last_confirmed_at";

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create database directory: {}", err))?;
        }
        Connection::open(&self.path).map_err(|err| format!("Failed to open database: {}", err))
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT UNIQUE NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS files (
                    id TEXT PRIMARY KEY,
                    file_path TEXT UNIQUE NOT NULL,
                    file_name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    file_id TEXT NOT NULL,
                    tracker_id TEXT,
                    started_at TEXT NOT NULL,
                    last_activity TEXT NOT NULL,
                    ended_at TEXT,
                    hash_before TEXT,
                    hash_after TEXT,
                    resume_count INTEGER NOT NULL DEFAULT 0,
                    is_commented INTEGER NOT NULL DEFAULT 0,
                    is_multi_user INTEGER NOT NULL DEFAULT 0,
                    co_editors TEXT,
                    last_confirmed_at TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_sessions_user_file
                    ON sessions(user_id, file_id);
                 CREATE TABLE IF NOT EXISTS file_events (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    file_hash TEXT,
                    event_timestamp TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS comments (
                    id TEXT PRIMARY KEY,
                    session_id TEXT UNIQUE NOT NULL,
                    user_id TEXT NOT NULL,
                    content TEXT NOT NULL,
                    change_type TEXT NOT NULL,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS trackers (
                    tracker_id TEXT PRIMARY KEY,
                    command_socket TEXT NOT NULL,
                    registered_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    // ── users ──

    pub fn get_user_by_name(&self, username: &str) -> Result<Option<UserRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, username, created_at FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query user: {}", err))
        })
    }

    pub fn get_or_create_user(&self, username: &str, now: &str) -> Result<UserRow, String> {
        if let Some(user) = self.get_user_by_name(username)? {
            return Ok(user);
        }
        let user = UserRow {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            created_at: now.to_string(),
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(username) DO NOTHING",
                params![user.id, user.username, user.created_at],
            )
            .map_err(|err| format!("Failed to insert user: {}", err))?;
            Ok(())
        })?;
        // A racing insert may have won; read back the canonical row.
        self.get_user_by_name(username)?
            .ok_or_else(|| format!("User {} vanished after insert", username))
    }

    // ── files ──

    pub fn get_file_by_path(&self, file_path: &str) -> Result<Option<FileRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, file_path, file_name, created_at FROM files WHERE file_path = ?1",
                params![file_path],
                |row| {
                    Ok(FileRow {
                        id: row.get(0)?,
                        file_path: row.get(1)?,
                        file_name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query file: {}", err))
        })
    }

    pub fn get_or_create_file(
        &self,
        file_path: &str,
        file_name: &str,
        now: &str,
    ) -> Result<FileRow, String> {
        if let Some(file) = self.get_file_by_path(file_path)? {
            return Ok(file);
        }
        let file = FileRow {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: file_path.to_string(),
            file_name: file_name.to_string(),
            created_at: now.to_string(),
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO files (id, file_path, file_name, created_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(file_path) DO NOTHING",
                params![file.id, file.file_path, file.file_name, file.created_at],
            )
            .map_err(|err| format!("Failed to insert file: {}", err))?;
            Ok(())
        })?;
        self.get_file_by_path(file_path)?
            .ok_or_else(|| format!("File {} vanished after insert", file_path))
    }

    pub fn update_file_path(
        &self,
        file_id: &str,
        file_path: &str,
        file_name: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE files SET file_path = ?2, file_name = ?3 WHERE id = ?1",
                params![file_id, file_path, file_name],
            )
            .map_err(|err| format!("Failed to update file path: {}", err))?;
            Ok(())
        })
    }

    // ── sessions ──

    pub fn insert_session(&self, session: &SessionRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (id, user_id, file_id, tracker_id, started_at, last_activity, ended_at, \
                     hash_before, hash_after, resume_count, is_commented, is_multi_user, \
                     co_editors, last_confirmed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    session.id,
                    session.user_id,
                    session.file_id,
                    session.tracker_id,
                    session.started_at,
                    session.last_activity,
                    session.ended_at,
                    session.hash_before,
                    session.hash_after,
                    session.resume_count,
                    session.is_commented,
                    session.is_multi_user,
                    session.co_editors,
                    session.last_confirmed_at
                ],
            )
            .map_err(|err| format!("Failed to insert session: {}", err))?;
            Ok(())
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![session_id],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query session: {}", err))
        })
    }

    /// The active (ended_at IS NULL) session for a (user, file) pair. The
    /// invariant is at most one; the ordering makes duplicates, should they
    /// ever appear, resolve deterministically.
    pub fn get_active_session(
        &self,
        user_id: &str,
        file_id: &str,
    ) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sessions \
                     WHERE user_id = ?1 AND file_id = ?2 AND ended_at IS NULL \
                     ORDER BY last_activity DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![user_id, file_id],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query active session: {}", err))
        })
    }

    pub fn get_any_active_session_for_file(
        &self,
        file_id: &str,
    ) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sessions \
                     WHERE file_id = ?1 AND ended_at IS NULL \
                     ORDER BY last_activity DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![file_id],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query active session for file: {}", err))
        })
    }

    pub fn list_active_sessions_for_file(&self, file_id: &str) -> Result<Vec<SessionRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions \
                     WHERE file_id = ?1 AND ended_at IS NULL \
                     ORDER BY last_activity DESC",
                    SESSION_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare file sessions query: {}", err))?;
            let rows = stmt
                .query_map(params![file_id], session_from_row)
                .map_err(|err| format!("Failed to query file sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    pub fn get_recent_closed_session(
        &self,
        user_id: &str,
        file_id: &str,
        cutoff: &str,
    ) -> Result<Option<SessionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sessions \
                     WHERE user_id = ?1 AND file_id = ?2 \
                       AND ended_at IS NOT NULL AND ended_at >= ?3 \
                     ORDER BY ended_at DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![user_id, file_id, cutoff],
                session_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query recent closed session: {}", err))
        })
    }

    /// Idempotent-merge update for a redelivered or repeated created event.
    pub fn update_session_on_created(
        &self,
        session_id: &str,
        last_activity: &str,
        hash_before: Option<&str>,
        resume_count: u32,
        is_multi_user: Option<bool>,
        co_editors: Option<&str>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    last_activity = ?2, \
                    hash_before = COALESCE(?3, hash_before), \
                    resume_count = MAX(resume_count, ?4), \
                    is_multi_user = MAX(is_multi_user, COALESCE(?5, 0)), \
                    co_editors = COALESCE(?6, co_editors) \
                 WHERE id = ?1",
                params![
                    session_id,
                    last_activity,
                    hash_before,
                    resume_count,
                    is_multi_user.map(|flag| flag as i32),
                    co_editors
                ],
            )
            .map_err(|err| format!("Failed to update session on created: {}", err))?;
            Ok(())
        })
    }

    pub fn update_session_on_modified(
        &self,
        session_id: &str,
        last_activity: &str,
        hash_after: Option<&str>,
        resume_count: u32,
        is_multi_user: Option<bool>,
        co_editors: Option<&str>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    last_activity = ?2, \
                    hash_after = COALESCE(?3, hash_after), \
                    resume_count = MAX(resume_count, ?4), \
                    is_multi_user = MAX(is_multi_user, COALESCE(?5, 0)), \
                    co_editors = COALESCE(?6, co_editors) \
                 WHERE id = ?1",
                params![
                    session_id,
                    last_activity,
                    hash_after,
                    resume_count,
                    is_multi_user.map(|flag| flag as i32),
                    co_editors
                ],
            )
            .map_err(|err| format!("Failed to update session on modified: {}", err))?;
            Ok(())
        })
    }

    /// Reopen a closed session under its original identity. Refuses
    /// commented rows at the SQL level as the last line of defense.
    pub fn resume_session(
        &self,
        session_id: &str,
        last_activity: &str,
        resume_count: u32,
        hash_before: Option<&str>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET \
                        ended_at = NULL, \
                        hash_after = NULL, \
                        last_activity = ?2, \
                        resume_count = ?3, \
                        hash_before = COALESCE(?4, hash_before) \
                     WHERE id = ?1 AND is_commented = 0",
                    params![session_id, last_activity, resume_count, hash_before],
                )
                .map_err(|err| format!("Failed to resume session: {}", err))?;
            Ok(changed > 0)
        })
    }

    pub fn close_session_row(
        &self,
        session_id: &str,
        ended_at: &str,
        hash_after: Option<&str>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    ended_at = ?2, \
                    hash_after = COALESCE(?3, hash_after) \
                 WHERE id = ?1",
                params![session_id, ended_at, hash_after],
            )
            .map_err(|err| format!("Failed to close session: {}", err))?;
            Ok(())
        })
    }

    pub fn repoint_session_file(
        &self,
        session_id: &str,
        file_id: &str,
        last_activity: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET file_id = ?2, last_activity = ?3 WHERE id = ?1",
                params![session_id, file_id, last_activity],
            )
            .map_err(|err| format!("Failed to repoint session file: {}", err))?;
            Ok(())
        })
    }

    pub fn reassign_session_user(&self, session_id: &str, user_id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET user_id = ?2 WHERE id = ?1",
                params![session_id, user_id],
            )
            .map_err(|err| format!("Failed to reassign session user: {}", err))?;
            Ok(())
        })
    }

    /// The only writer of is_commented. Forces ended_at when still null:
    /// a comment is the authoritative end of a session.
    pub fn set_session_commented(&self, session_id: &str, now: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET \
                    is_commented = 1, \
                    ended_at = COALESCE(ended_at, ?2) \
                 WHERE id = ?1",
                params![session_id, now],
            )
            .map_err(|err| format!("Failed to mark session commented: {}", err))?;
            Ok(())
        })
    }

    pub fn confirm_sessions(
        &self,
        tracker_id: &str,
        session_ids: &[String],
        now: &str,
    ) -> Result<usize, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to begin confirm transaction: {}", err))?;
            let mut confirmed = 0;
            for session_id in session_ids {
                confirmed += tx
                    .execute(
                        "UPDATE sessions SET last_confirmed_at = ?3 \
                         WHERE id = ?1 AND tracker_id = ?2 AND ended_at IS NULL",
                        params![session_id, tracker_id, now],
                    )
                    .map_err(|err| format!("Failed to confirm session: {}", err))?;
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit confirmations: {}", err))?;
            Ok(confirmed)
        })
    }

    pub fn list_active_sessions(&self) -> Result<Vec<SessionRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions WHERE ended_at IS NULL \
                     ORDER BY last_activity DESC",
                    SESSION_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare active sessions query: {}", err))?;
            let rows = stmt
                .query_map([], session_from_row)
                .map_err(|err| format!("Failed to query active sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    // ── events (append-only audit) ──

    pub fn insert_event(
        &self,
        event_id: &str,
        session_id: &str,
        event_type: &str,
        file_hash: Option<&str>,
        event_timestamp: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO file_events (id, session_id, event_type, file_hash, event_timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO NOTHING",
                params![event_id, session_id, event_type, file_hash, event_timestamp],
            )
            .map_err(|err| format!("Failed to insert event: {}", err))?;
            Ok(())
        })
    }

    pub fn has_event(&self, event_id: &str) -> Result<bool, String> {
        let count = self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM file_events WHERE id = ?1",
                params![event_id],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|err| format!("Failed to count events: {}", err))
        })?;
        Ok(count > 0)
    }

    pub fn list_events_for_session(&self, session_id: &str) -> Result<Vec<(String, String)>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_type, event_timestamp FROM file_events \
                     WHERE session_id = ?1 ORDER BY event_timestamp ASC",
                )
                .map_err(|err| format!("Failed to prepare events query: {}", err))?;
            let rows = stmt
                .query_map(params![session_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|err| format!("Failed to query events: {}", err))?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row.map_err(|err| format!("Failed to decode event row: {}", err))?);
            }
            Ok(events)
        })
    }

    // ── comments ──

    pub fn insert_comment(&self, comment: &CommentRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO comments (id, session_id, user_id, content, change_type, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment.id,
                    comment.session_id,
                    comment.user_id,
                    comment.content,
                    comment.change_type,
                    comment.created_at
                ],
            )
            .map_err(|err| format!("Failed to insert comment: {}", err))?;
            Ok(())
        })
    }

    pub fn get_comment_by_session(&self, session_id: &str) -> Result<Option<CommentRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, session_id, user_id, content, change_type, created_at \
                 FROM comments WHERE session_id = ?1",
                params![session_id],
                comment_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query comment: {}", err))
        })
    }

    // ── trackers ──

    pub fn upsert_tracker(
        &self,
        tracker_id: &str,
        command_socket: &str,
        now: &str,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO trackers (tracker_id, command_socket, registered_at, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT(tracker_id) DO UPDATE SET \
                    command_socket = excluded.command_socket, \
                    last_seen_at = excluded.last_seen_at",
                params![tracker_id, command_socket, now],
            )
            .map_err(|err| format!("Failed to upsert tracker: {}", err))?;
            Ok(())
        })
    }

    pub fn list_trackers(&self) -> Result<Vec<TrackerRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT tracker_id, command_socket, registered_at, last_seen_at \
                     FROM trackers ORDER BY tracker_id ASC",
                )
                .map_err(|err| format!("Failed to prepare trackers query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TrackerRow {
                        tracker_id: row.get(0)?,
                        command_socket: row.get(1)?,
                        registered_at: row.get(2)?,
                        last_seen_at: row.get(3)?,
                    })
                })
                .map_err(|err| format!("Failed to query trackers: {}", err))?;

            let mut trackers = Vec::new();
            for row in rows {
                trackers.push(row.map_err(|err| format!("Failed to decode tracker row: {}", err))?);
            }
            Ok(trackers)
        })
    }

    pub fn get_tracker(&self, tracker_id: &str) -> Result<Option<TrackerRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT tracker_id, command_socket, registered_at, last_seen_at \
                 FROM trackers WHERE tracker_id = ?1",
                params![tracker_id],
                |row| {
                    Ok(TrackerRow {
                        tracker_id: row.get(0)?,
                        command_socket: row.get(1)?,
                        registered_at: row.get(2)?,
                        last_seen_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|err| format!("Failed to query tracker: {}", err))
        })
    }

    // ── joined query surface ──

    pub fn session_details(&self, session_id: &str) -> Result<Option<SessionDetails>, String> {
        let session = match self.get_session(session_id)? {
            Some(session) => session,
            None => return Ok(None),
        };
        self.attach_details(session).map(Some)
    }

    pub fn list_active_session_details(&self) -> Result<Vec<SessionDetails>, String> {
        let sessions = self.list_active_sessions()?;
        sessions
            .into_iter()
            .map(|session| self.attach_details(session))
            .collect()
    }

    pub fn list_commented_session_details(&self) -> Result<Vec<SessionDetails>, String> {
        let sessions = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions WHERE is_commented = 1 \
                     ORDER BY last_activity DESC",
                    SESSION_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare commented sessions query: {}", err))?;
            let rows = stmt
                .query_map([], session_from_row)
                .map_err(|err| format!("Failed to query commented sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })?;

        sessions
            .into_iter()
            .map(|session| self.attach_details(session))
            .collect()
    }

    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM sessions WHERE user_id = ?1 \
                     ORDER BY last_activity DESC",
                    SESSION_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare user sessions query: {}", err))?;
            let rows = stmt
                .query_map(params![user_id], session_from_row)
                .map_err(|err| format!("Failed to query user sessions: {}", err))?;

            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row.map_err(|err| format!("Failed to decode session row: {}", err))?);
            }
            Ok(sessions)
        })
    }

    fn attach_details(&self, session: SessionRow) -> Result<SessionDetails, String> {
        let (file_path, file_name) = self
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT file_path, file_name FROM files WHERE id = ?1",
                    params![session.file_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(|err| format!("Failed to query session file: {}", err))
            })?
            .unwrap_or_default();
        let username = self
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    params![session.user_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query session user: {}", err))
            })?
            .unwrap_or_default();
        let comment = self.get_comment_by_session(&session.id)?;

        Ok(SessionDetails {
            session,
            file_path,
            file_name,
            username,
            comment,
        })
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_id: row.get(2)?,
        tracker_id: row.get(3)?,
        started_at: row.get(4)?,
        last_activity: row.get(5)?,
        ended_at: row.get(6)?,
        hash_before: row.get(7)?,
        hash_after: row.get(8)?,
        resume_count: row.get::<_, i64>(9)? as u32,
        is_commented: row.get::<_, i64>(10)? != 0,
        is_multi_user: row.get::<_, i64>(11)? != 0,
        co_editors: row.get(12)?,
        last_confirmed_at: row.get(13)?,
    })
}

fn comment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommentRow> {
    Ok(CommentRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        user_id: row.get(2)?,
        content: row.get(3)?,
        change_type: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("sessions.db")).expect("db init");
        (dir, db)
    }

    fn session(id: &str, user_id: &str, file_id: &str) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            user_id: user_id.to_string(),
            file_id: file_id.to_string(),
            tracker_id: Some("tracker-a".to_string()),
            started_at: "2026-05-12T09:00:00+00:00".to_string(),
            last_activity: "2026-05-12T09:00:00+00:00".to_string(),
            ended_at: None,
            hash_before: None,
            hash_after: None,
            resume_count: 0,
            is_commented: false,
            is_multi_user: false,
            co_editors: None,
            last_confirmed_at: Some("2026-05-12T09:00:00+00:00".to_string()),
        }
    }

    #[test]
    fn user_and_file_creation_is_idempotent() {
        let (_dir, db) = db();
        let user_a = db.get_or_create_user("alice", "2026-05-12T09:00:00+00:00").expect("user");
        let user_b = db.get_or_create_user("alice", "2026-05-12T10:00:00+00:00").expect("user");
        assert_eq!(user_a.id, user_b.id);

        let file_a = db
            .get_or_create_file("/share/report.docx", "report.docx", "2026-05-12T09:00:00+00:00")
            .expect("file");
        let file_b = db
            .get_or_create_file("/share/report.docx", "report.docx", "2026-05-12T10:00:00+00:00")
            .expect("file");
        assert_eq!(file_a.id, file_b.id);
    }

    #[test]
    fn active_session_lookup_ignores_closed_rows() {
        let (_dir, db) = db();
        let mut closed = session("s-1", "u-1", "f-1");
        closed.ended_at = Some("2026-05-12T09:30:00+00:00".to_string());
        db.insert_session(&closed).expect("insert");
        db.insert_session(&session("s-2", "u-1", "f-1")).expect("insert");

        let active = db.get_active_session("u-1", "f-1").expect("query").expect("active");
        assert_eq!(active.id, "s-2");
    }

    #[test]
    fn resume_refuses_commented_sessions() {
        let (_dir, db) = db();
        let mut row = session("s-1", "u-1", "f-1");
        row.ended_at = Some("2026-05-12T09:30:00+00:00".to_string());
        db.insert_session(&row).expect("insert");
        db.set_session_commented("s-1", "2026-05-12T09:31:00+00:00").expect("comment");

        let resumed = db
            .resume_session("s-1", "2026-05-12T09:40:00+00:00", 1, None)
            .expect("resume call");
        assert!(!resumed);

        let row = db.get_session("s-1").expect("query").expect("row");
        assert!(row.is_commented);
        assert!(row.ended_at.is_some());
    }

    #[test]
    fn set_commented_forces_ended_at_once() {
        let (_dir, db) = db();
        db.insert_session(&session("s-1", "u-1", "f-1")).expect("insert");
        db.set_session_commented("s-1", "2026-05-12T09:31:00+00:00").expect("comment");

        let row = db.get_session("s-1").expect("query").expect("row");
        assert_eq!(row.ended_at.as_deref(), Some("2026-05-12T09:31:00+00:00"));

        // A later call must not move the original end time.
        db.set_session_commented("s-1", "2026-05-12T11:00:00+00:00").expect("comment");
        let row = db.get_session("s-1").expect("query").expect("row");
        assert_eq!(row.ended_at.as_deref(), Some("2026-05-12T09:31:00+00:00"));
    }

    #[test]
    fn update_paths_do_not_touch_is_commented() {
        let (_dir, db) = db();
        db.insert_session(&session("s-1", "u-1", "f-1")).expect("insert");
        db.set_session_commented("s-1", "2026-05-12T09:31:00+00:00").expect("comment");

        db.update_session_on_created("s-1", "2026-05-12T09:40:00+00:00", None, 2, Some(true), None)
            .expect("update");
        db.update_session_on_modified("s-1", "2026-05-12T09:41:00+00:00", None, 2, None, None)
            .expect("update");
        db.close_session_row("s-1", "2026-05-12T09:42:00+00:00", None)
            .expect("close");

        let row = db.get_session("s-1").expect("query").expect("row");
        assert!(row.is_commented);
    }

    #[test]
    fn event_log_deduplicates_by_id() {
        let (_dir, db) = db();
        db.insert_event("evt-1", "s-1", "created", None, "2026-05-12T09:00:00+00:00")
            .expect("insert");
        db.insert_event("evt-1", "s-1", "created", None, "2026-05-12T09:00:00+00:00")
            .expect("insert");
        assert!(db.has_event("evt-1").expect("has"));
        assert_eq!(db.list_events_for_session("s-1").expect("list").len(), 1);
    }

    #[test]
    fn confirm_sessions_only_touches_own_tracker() {
        let (_dir, db) = db();
        db.insert_session(&session("s-1", "u-1", "f-1")).expect("insert");
        let mut other = session("s-2", "u-2", "f-2");
        other.tracker_id = Some("tracker-b".to_string());
        db.insert_session(&other).expect("insert");

        let confirmed = db
            .confirm_sessions(
                "tracker-a",
                &["s-1".to_string(), "s-2".to_string()],
                "2026-05-12T10:00:00+00:00",
            )
            .expect("confirm");
        assert_eq!(confirmed, 1);

        let row = db.get_session("s-2").expect("query").expect("row");
        assert_eq!(
            row.last_confirmed_at.as_deref(),
            Some("2026-05-12T09:00:00+00:00")
        );
    }

    #[test]
    fn tracker_registry_upserts() {
        let (_dir, db) = db();
        db.upsert_tracker("tracker-a", "/tmp/a.sock", "2026-05-12T09:00:00+00:00")
            .expect("upsert");
        db.upsert_tracker("tracker-a", "/tmp/b.sock", "2026-05-12T10:00:00+00:00")
            .expect("upsert");

        let trackers = db.list_trackers().expect("list");
        assert_eq!(trackers.len(), 1);
        assert_eq!(trackers[0].command_socket, "/tmp/b.sock");
        assert_eq!(trackers[0].registered_at, "2026-05-12T09:00:00+00:00");
    }
}
