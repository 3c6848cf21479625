//! Shared authority state: the session store plus the tracker registry.
//!
//! Event application and comment creation hold the write lock so
//! read-modify-write on a (user, file) key is serialized; two created
//! events racing in from network retries collapse into one session instead
//! of forking. Query snapshots read without the lock.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

use edittrack_protocol::{
    CommentNotice, CommentRequest, ErrorInfo, EventEnvelope, TrackerRegistration,
};

use crate::config::AuthorityConfig;
use crate::db::{CommentRow, Db, SessionDetails, TrackerRow};
use crate::reconcile::{apply_event, ReconcileOutcome};

pub struct SharedState {
    db: Db,
    write_lock: Mutex<()>,
    resume_window: Duration,
}

/// Comment creation result: the stored row plus where to send the
/// tracker notification, if the originating tracker is known.
pub struct CommentCreated {
    pub comment: CommentRow,
    pub notice: Option<(TrackerRow, CommentNotice)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEditors {
    pub file_path: String,
    pub file_name: String,
    pub editors: Vec<EditorEntry>,
    pub is_multi_user: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditorEntry {
    pub username: String,
    pub session_id: String,
    pub started_at: String,
    pub last_activity: String,
    pub co_editors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserActivity {
    pub username: String,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub commented_sessions: usize,
    pub total_resumes: u32,
}

impl SharedState {
    pub fn new(db: Db, config: &AuthorityConfig) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
            resume_window: Duration::minutes(config.resume_window_minutes),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Serialize every lock-step guard acquisition through one poisoning-
    /// tolerant path: a panicked writer must not wedge the daemon.
    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn apply_event(&self, event: &EventEnvelope) -> Result<ReconcileOutcome, String> {
        let _guard = self.guard();
        apply_event(&self.db, event, self.resume_window)
    }

    pub fn register_tracker(&self, registration: &TrackerRegistration) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        self.db.upsert_tracker(
            &registration.tracker_id,
            &registration.command_socket,
            &now,
        )?;
        tracing::info!(
            tracker_id = %registration.tracker_id,
            command_socket = %registration.command_socket,
            "Tracker registered"
        );
        Ok(())
    }

    /// Create the 1:1 comment for a session. The comment is the
    /// authoritative end of the session: ended_at is forced and the record
    /// becomes permanently non-resumable. A second comment is an explicit
    /// conflict, never a merge.
    pub fn create_comment(&self, request: &CommentRequest) -> Result<CommentCreated, ErrorInfo> {
        let _guard = self.guard();

        let session = self
            .db
            .get_session(&request.session_id)
            .map_err(|err| ErrorInfo::new("storage_error", err))?
            .ok_or_else(|| ErrorInfo::new("session_not_found", "session does not exist"))?;

        let existing = self
            .db
            .get_comment_by_session(&session.id)
            .map_err(|err| ErrorInfo::new("storage_error", err))?;
        if existing.is_some() {
            return Err(ErrorInfo::new(
                "comment_exists",
                "a comment already exists for this session",
            ));
        }

        let now = Utc::now().to_rfc3339();
        let user = self
            .db
            .get_or_create_user(&request.user_id, &now)
            .map_err(|err| ErrorInfo::new("storage_error", err))?;

        self.db
            .set_session_commented(&session.id, &now)
            .map_err(|err| ErrorInfo::new("storage_error", err))?;

        let comment = CommentRow {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            user_id: user.id,
            content: request.content.clone(),
            change_type: request.change_type.clone(),
            created_at: now,
        };
        self.db
            .insert_comment(&comment)
            .map_err(|err| ErrorInfo::new("storage_error", err))?;

        tracing::info!(
            session_id = %session.id,
            change_type = %comment.change_type,
            "Comment created, session retired"
        );

        let notice = self.build_notice(&session.id).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to resolve tracker notice target");
            None
        });

        Ok(CommentCreated { comment, notice })
    }

    fn build_notice(&self, session_id: &str) -> Result<Option<(TrackerRow, CommentNotice)>, String> {
        let Some(details) = self.db.session_details(session_id)? else {
            return Ok(None);
        };
        let Some(tracker_id) = details.session.tracker_id.as_deref() else {
            return Ok(None);
        };
        let Some(tracker) = self.db.get_tracker(tracker_id)? else {
            return Ok(None);
        };
        Ok(Some((
            tracker,
            CommentNotice {
                session_id: session_id.to_string(),
                file_path: details.file_path,
                username: details.username,
            },
        )))
    }

    // ── query surface ──

    pub fn active_sessions_snapshot(&self) -> Result<Vec<SessionDetails>, String> {
        self.db.list_active_session_details()
    }

    pub fn commented_sessions_snapshot(&self) -> Result<Vec<SessionDetails>, String> {
        self.db.list_commented_session_details()
    }

    pub fn comment_for_session(&self, session_id: &str) -> Result<Option<SessionDetails>, String> {
        self.db.session_details(session_id)
    }

    /// Audit trail for a session, oldest first.
    pub fn session_events(&self, session_id: &str) -> Result<Vec<(String, String)>, String> {
        self.db.list_events_for_session(session_id)
    }

    /// Who is editing a file right now: the primary of each active session
    /// plus observed co-editors.
    pub fn current_editors(&self, file_path: &str) -> Result<Option<FileEditors>, String> {
        let Some(file) = self.db.get_file_by_path(file_path)? else {
            return Ok(None);
        };
        let sessions = self.db.list_active_sessions_for_file(&file.id)?;

        let mut editors = Vec::new();
        let mut multi = sessions.len() > 1;
        for session in sessions {
            let details = self.db.session_details(&session.id)?;
            let username = details.map(|d| d.username).unwrap_or_default();
            let co_editors = decode_co_editors(session.co_editors.as_deref());
            multi = multi || session.is_multi_user || !co_editors.is_empty();
            editors.push(EditorEntry {
                username,
                session_id: session.id,
                started_at: session.started_at,
                last_activity: session.last_activity,
                co_editors,
            });
        }

        Ok(Some(FileEditors {
            file_path: file.file_path,
            file_name: file.file_name,
            editors,
            is_multi_user: multi,
        }))
    }

    /// Files with concurrent editing observed on their active sessions.
    pub fn multi_user_files(&self) -> Result<Vec<FileEditors>, String> {
        let details = self.db.list_active_session_details()?;
        let mut paths: Vec<String> = Vec::new();
        for entry in &details {
            let co_editors = decode_co_editors(entry.session.co_editors.as_deref());
            if entry.session.is_multi_user || !co_editors.is_empty() {
                if !paths.contains(&entry.file_path) {
                    paths.push(entry.file_path.clone());
                }
            }
        }

        let mut files = Vec::new();
        for path in paths {
            if let Some(editors) = self.current_editors(&path)? {
                files.push(editors);
            }
        }
        Ok(files)
    }

    pub fn user_activity(&self, username: &str) -> Result<Option<UserActivity>, String> {
        let Some(user) = self.db.get_user_by_name(username)? else {
            return Ok(None);
        };
        let sessions = self.db.list_sessions_for_user(&user.id)?;

        Ok(Some(UserActivity {
            username: user.username,
            total_sessions: sessions.len(),
            active_sessions: sessions
                .iter()
                .filter(|session| session.ended_at.is_none())
                .count(),
            commented_sessions: sessions
                .iter()
                .filter(|session| session.is_commented)
                .count(),
            total_resumes: sessions.iter().map(|session| session.resume_count).sum(),
        }))
    }
}

fn decode_co_editors(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|value| serde_json::from_str::<Vec<String>>(value).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edittrack_protocol::EventKind;

    fn state() -> (tempfile::TempDir, SharedState) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("sessions.db")).expect("db init");
        let state = SharedState::new(db, &AuthorityConfig::default());
        (dir, state)
    }

    fn created_event(event_id: &str, session_id: &str, path: &str, user: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: event_id.to_string(),
            event_timestamp: "2026-05-12T09:00:00+00:00".to_string(),
            event_type: EventKind::Created,
            tracker_id: "tracker-a".to_string(),
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            user_id: user.to_string(),
            session_id: Some(session_id.to_string()),
            resume_count: 0,
            file_hash: None,
            old_file_path: None,
            session_started_at: None,
            session_ended_at: None,
            is_multi_user: None,
            co_editors: None,
        }
    }

    fn comment_request(session_id: &str) -> CommentRequest {
        CommentRequest {
            session_id: session_id.to_string(),
            user_id: "alice".to_string(),
            content: "updated the totals".to_string(),
            change_type: "content_update".to_string(),
        }
    }

    #[test]
    fn comment_forces_end_and_rejects_duplicates() {
        let (_dir, state) = state();
        state
            .apply_event(&created_event("evt-1", "session-1", "/share/report.docx", "alice"))
            .expect("apply");

        let created = state.create_comment(&comment_request("session-1")).expect("comment");
        assert_eq!(created.comment.session_id, "session-1");

        let session = state.db().get_session("session-1").expect("query").expect("row");
        assert!(session.is_commented);
        assert!(session.ended_at.is_some());

        let duplicate = state.create_comment(&comment_request("session-1"));
        assert_eq!(duplicate.err().map(|err| err.code), Some("comment_exists".to_string()));
    }

    #[test]
    fn comment_on_unknown_session_is_not_found() {
        let (_dir, state) = state();
        let result = state.create_comment(&comment_request("missing"));
        assert_eq!(result.err().map(|err| err.code), Some("session_not_found".to_string()));
    }

    #[test]
    fn comment_resolves_notice_target_for_registered_tracker() {
        let (_dir, state) = state();
        state
            .register_tracker(&TrackerRegistration {
                tracker_id: "tracker-a".to_string(),
                command_socket: "/tmp/tracker-a.sock".to_string(),
            })
            .expect("register");
        state
            .apply_event(&created_event("evt-1", "session-1", "/share/report.docx", "alice"))
            .expect("apply");

        let created = state.create_comment(&comment_request("session-1")).expect("comment");
        let (tracker, notice) = created.notice.expect("notice");
        assert_eq!(tracker.command_socket, "/tmp/tracker-a.sock");
        assert_eq!(notice.file_path, "/share/report.docx");
        assert_eq!(notice.username, "alice");
    }

    #[test]
    fn current_editors_lists_primary_and_co_editors() {
        let (_dir, state) = state();
        let mut event = created_event("evt-1", "session-1", "/share/report.docx", "alice");
        event.is_multi_user = Some(true);
        event.co_editors = Some(vec!["bob".to_string()]);
        state.apply_event(&event).expect("apply");

        let editors = state
            .current_editors("/share/report.docx")
            .expect("query")
            .expect("file");
        assert!(editors.is_multi_user);
        assert_eq!(editors.editors.len(), 1);
        assert_eq!(editors.editors[0].username, "alice");
        assert_eq!(editors.editors[0].co_editors, vec!["bob".to_string()]);

        let multi = state.multi_user_files().expect("query");
        assert_eq!(multi.len(), 1);
        assert_eq!(multi[0].file_path, "/share/report.docx");
    }

    #[test]
    fn user_activity_counts_sessions() {
        let (_dir, state) = state();
        state
            .apply_event(&created_event("evt-1", "session-1", "/share/report.docx", "alice"))
            .expect("apply");
        state
            .apply_event(&created_event("evt-2", "session-2", "/share/plan.dwg", "alice"))
            .expect("apply");
        state.create_comment(&comment_request("session-1")).expect("comment");

        let activity = state.user_activity("alice").expect("query").expect("user");
        assert_eq!(activity.total_sessions, 2);
        assert_eq!(activity.active_sessions, 1);
        assert_eq!(activity.commented_sessions, 1);

        assert!(state.user_activity("nobody").expect("query").is_none());
    }
}
