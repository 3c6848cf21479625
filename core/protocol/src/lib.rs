//! Wire protocol types and validation for the edittrack daemons.
//!
//! This crate is shared by the tracker, the authority, and any client that
//! talks to either, to prevent schema drift. Each daemon remains the
//! authority on validation for the requests it serves, but both reuse the
//! same types to construct valid payloads.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Comment change-type vocabulary surfaced by the authority.
pub const CHANGE_TYPES: &[&str] = &["content_update", "correction", "formatting", "review", "other"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    // Served by both daemons.
    GetHealth,
    // Authority surface.
    RegisterTracker,
    Event,
    CreateComment,
    GetSessions,
    GetSessionsWithComments,
    GetComment,
    GetCurrentEditors,
    GetMultiUserFiles,
    GetUserActivity,
    // Tracker surface.
    WatchEvent,
    GetActiveSessions,
    GetStats,
    CloseSession,
    CommentCreated,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Raw filesystem notification as produced by an OS-level watch service.
///
/// This is the tracker's inbound boundary; everything downstream of it is
/// normalized by the tracker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum WatchKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub path: String,
    #[serde(default)]
    pub dest_path: Option<String>,
}

impl WatchEvent {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.path, "path")?;
        if self.kind == WatchKind::Moved {
            require_string(&self.dest_path, "dest_path")?;
        }
        Ok(())
    }
}

/// Normalized session lifecycle event, tracker -> authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum EventKind {
    Created,
    Modified,
    Closed,
    Deleted,
    Moved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Closed => "closed",
            EventKind::Deleted => "deleted",
            EventKind::Moved => "moved",
        }
    }
}

/// Delivered over an at-least-once channel: the authority must treat
/// redelivery of the same envelope as safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_timestamp: String,
    pub event_type: EventKind,
    pub tracker_id: String,
    pub file_path: String,
    pub file_name: String,
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub old_file_path: Option<String>,
    #[serde(default)]
    pub session_started_at: Option<String>,
    #[serde(default)]
    pub session_ended_at: Option<String>,
    #[serde(default)]
    pub is_multi_user: Option<bool>,
    #[serde(default)]
    pub co_editors: Option<Vec<String>>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }
        require_rfc3339(&self.event_timestamp, "event_timestamp")?;
        require_str(&self.tracker_id, "tracker_id")?;
        require_str(&self.file_path, "file_path")?;
        require_str(&self.user_id, "user_id")?;

        match self.event_type {
            EventKind::Created | EventKind::Modified => {
                require_string(&self.session_id, "session_id")?;
            }
            EventKind::Closed => {
                require_string(&self.session_id, "session_id")?;
                if let Some(ended) = self.session_ended_at.as_deref() {
                    require_rfc3339(ended, "session_ended_at")?;
                }
            }
            EventKind::Moved => {
                require_string(&self.old_file_path, "old_file_path")?;
            }
            // A delete may arrive for a file that never had a session.
            EventKind::Deleted => {}
        }

        if let Some(started) = self.session_started_at.as_deref() {
            require_rfc3339(started, "session_started_at")?;
        }

        Ok(())
    }
}

/// Tracker announcement so the authority can reach it back (orphan sweep,
/// comment notifications).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerRegistration {
    pub tracker_id: String,
    pub command_socket: String,
}

impl TrackerRegistration {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.tracker_id, "tracker_id")?;
        require_str(&self.command_socket, "command_socket")?;
        Ok(())
    }
}

/// Comment creation, external client -> authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentRequest {
    pub session_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default = "default_change_type")]
    pub change_type: String,
}

fn default_change_type() -> String {
    "other".to_string()
}

impl CommentRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.session_id, "session_id")?;
        require_str(&self.user_id, "user_id")?;
        require_str(&self.content, "content")?;
        require_str(&self.change_type, "change_type")?;
        Ok(())
    }
}

/// Authority -> tracker: force-close a local session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseSessionCommand {
    #[serde(default)]
    pub session_id: Option<String>,
    pub file_path: String,
    pub username: String,
    #[serde(default)]
    pub ended_at: Option<String>,
}

impl CloseSessionCommand {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.file_path, "file_path")?;
        require_str(&self.username, "username")?;
        if let Some(ended) = self.ended_at.as_deref() {
            require_rfc3339(ended, "ended_at")?;
        }
        Ok(())
    }
}

/// Authority -> tracker: a comment landed, the local session must never
/// be resumed again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentNotice {
    pub session_id: String,
    pub file_path: String,
    pub username: String,
}

impl CommentNotice {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.session_id, "session_id")?;
        require_str(&self.file_path, "file_path")?;
        require_str(&self.username, "username")?;
        Ok(())
    }
}

/// One row of a tracker's active-session listing, consumed by the
/// authority's orphan sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSessionInfo {
    pub session_id: String,
    pub file_path: String,
    pub file_name: String,
    pub username: String,
    pub started_at: String,
    pub last_activity: String,
    pub resume_count: u32,
    pub is_commented: bool,
    pub is_multi_user: bool,
    #[serde(default)]
    pub co_editors: Vec<String>,
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

pub fn parse_watch_event(params: Value) -> Result<WatchEvent, ErrorInfo> {
    let event: WatchEvent = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("watch event payload is invalid JSON: {}", err),
        )
    })?;
    event.validate()?;
    Ok(event)
}

pub fn parse_registration(params: Value) -> Result<TrackerRegistration, ErrorInfo> {
    let registration: TrackerRegistration = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("registration payload is invalid JSON: {}", err),
        )
    })?;
    registration.validate()?;
    Ok(registration)
}

pub fn parse_comment(params: Value) -> Result<CommentRequest, ErrorInfo> {
    let comment: CommentRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("comment payload is invalid JSON: {}", err),
        )
    })?;
    comment.validate()?;
    Ok(comment)
}

pub fn parse_close_command(params: Value) -> Result<CloseSessionCommand, ErrorInfo> {
    let command: CloseSessionCommand = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("close-session payload is invalid JSON: {}", err),
        )
    })?;
    command.validate()?;
    Ok(command)
}

pub fn parse_comment_notice(params: Value) -> Result<CommentNotice, ErrorInfo> {
    let notice: CommentNotice = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("comment notice payload is invalid JSON: {}", err),
        )
    })?;
    notice.validate()?;
    Ok(notice)
}

fn require_rfc3339(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if DateTime::parse_from_rfc3339(value).is_err() {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            format!("{} must be RFC3339", field),
        ));
    }
    Ok(())
}

fn require_str(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event(event_type: EventKind) -> EventEnvelope {
        EventEnvelope {
            event_id: "evt-1".to_string(),
            event_timestamp: "2026-05-12T09:00:00Z".to_string(),
            event_type,
            tracker_id: "tracker-a".to_string(),
            file_path: "/share/report.docx".to_string(),
            file_name: "report.docx".to_string(),
            user_id: "alice".to_string(),
            session_id: Some("session-1".to_string()),
            resume_count: 0,
            file_hash: None,
            old_file_path: None,
            session_started_at: None,
            session_ended_at: None,
            is_multi_user: None,
            co_editors: None,
        }
    }

    #[test]
    fn validates_created_event() {
        let event = base_event(EventKind::Created);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn created_requires_session_id() {
        let mut event = base_event(EventKind::Created);
        event.session_id = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn moved_requires_old_path() {
        let mut event = base_event(EventKind::Moved);
        assert!(event.validate().is_err());
        event.old_file_path = Some("/share/~wrl0001.tmp".to_string());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn deleted_allows_missing_session_id() {
        let mut event = base_event(EventKind::Deleted);
        event.session_id = None;
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut event = base_event(EventKind::Modified);
        event.event_timestamp = "not-a-time".to_string();
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_long_event_id() {
        let mut event = base_event(EventKind::Closed);
        event.event_id = "a".repeat(256);
        assert!(event.validate().is_err());
    }

    #[test]
    fn watch_move_requires_dest() {
        let event = WatchEvent {
            kind: WatchKind::Moved,
            path: "/share/a.docx".to_string(),
            dest_path: None,
        };
        assert!(event.validate().is_err());
    }

    #[test]
    fn comment_defaults_change_type() {
        let comment: CommentRequest = serde_json::from_value(serde_json::json!({
            "session_id": "session-1",
            "user_id": "alice",
            "content": "updated totals"
        }))
        .expect("deserialize comment");
        assert_eq!(comment.change_type, "other");
        assert!(comment.validate().is_ok());
    }

    #[test]
    fn comment_rejects_empty_content() {
        let comment = CommentRequest {
            session_id: "session-1".to_string(),
            user_id: "alice".to_string(),
            content: "  ".to_string(),
            change_type: "review".to_string(),
        };
        assert!(comment.validate().is_err());
    }

    #[test]
    fn parse_event_round_trips() {
        let event = base_event(EventKind::Created);
        let value = serde_json::to_value(&event).expect("serialize");
        let parsed = parse_event(value).expect("parse");
        assert_eq!(parsed.session_id.as_deref(), Some("session-1"));
        assert_eq!(parsed.event_type, EventKind::Created);
    }
}
