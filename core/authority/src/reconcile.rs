//! Idempotent reconciliation of tracker events into the session store.
//!
//! Every decision here assumes at-least-once delivery: redelivered and
//! out-of-order events must collapse into the same durable state. The one
//! hard rule is that no path below ever forks a second active session for a
//! (user, file) pair, and none of them can touch `is_commented`.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use edittrack_protocol::{EventEnvelope, EventKind};

use crate::db::{parse_rfc3339, Db, SessionRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: &'static str,
    pub session_id: Option<String>,
}

impl ReconcileOutcome {
    fn new(action: &'static str, session_id: impl Into<Option<String>>) -> Self {
        Self {
            action,
            session_id: session_id.into(),
        }
    }
}

pub fn apply_event(
    db: &Db,
    event: &EventEnvelope,
    resume_window: Duration,
) -> Result<ReconcileOutcome, String> {
    // Exact redelivery: the audit log already has this event, and the state
    // transition it describes has been applied.
    if db.has_event(&event.event_id)? {
        debug!(event_id = %event.event_id, "Duplicate event delivery absorbed");
        return Ok(ReconcileOutcome::new(
            "duplicate_delivery",
            event.session_id.clone(),
        ));
    }

    let timestamp = parse_rfc3339(&event.event_timestamp)
        .ok_or_else(|| format!("Unparseable event timestamp: {}", event.event_timestamp))?;

    let outcome = match event.event_type {
        EventKind::Moved => apply_moved(db, event, timestamp)?,
        EventKind::Created => apply_created(db, event, timestamp, resume_window)?,
        EventKind::Modified => apply_modified(db, event, timestamp)?,
        EventKind::Closed => apply_closed(db, event, timestamp)?,
        EventKind::Deleted => apply_deleted(db, event, timestamp)?,
    };

    if let Some(session_id) = &outcome.session_id {
        db.insert_event(
            &event.event_id,
            session_id,
            event.event_type.as_str(),
            event.file_hash.as_deref(),
            &timestamp.to_rfc3339(),
        )?;
    }

    Ok(outcome)
}

fn apply_created(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
    resume_window: Duration,
) -> Result<ReconcileOutcome, String> {
    let (user, file) = resolve_user_file(db, event, timestamp)?;
    let ts = timestamp.to_rfc3339();

    // A live session for this key absorbs the create; never fork.
    if let Some(active) = db.get_active_session(&user.id, &file.id)? {
        db.update_session_on_created(
            &active.id,
            &ts,
            event.file_hash.as_deref(),
            event.resume_count,
            event.is_multi_user,
            co_editors_json(event).as_deref(),
        )?;
        maybe_reassign_user(db, &active, &user.id, event)?;
        debug!(session_id = %active.id, "Created event merged into active session");
        return Ok(ReconcileOutcome::new("session_updated", Some(active.id)));
    }

    // The tracker believed this was a resume; agree if a recently-closed,
    // uncommented session is on record.
    if event.resume_count > 0 {
        let cutoff = (timestamp - resume_window).to_rfc3339();
        if let Some(recent) = db.get_recent_closed_session(&user.id, &file.id, &cutoff)? {
            if recent.is_commented {
                info!(
                    session_id = %recent.id,
                    "Commented session is terminal, creating fresh instead of resuming"
                );
            } else if db.resume_session(
                &recent.id,
                &ts,
                event.resume_count.max(recent.resume_count),
                event.file_hash.as_deref(),
            )? {
                info!(session_id = %recent.id, resume_count = event.resume_count, "Session resumed");
                return Ok(ReconcileOutcome::new("session_resumed", Some(recent.id)));
            }
        }
    }

    let session_id = insert_fresh_session(db, event, &user.id, &file.id, timestamp)?;
    info!(session_id = %session_id, file_path = %event.file_path, "Session created");
    Ok(ReconcileOutcome::new("session_created", Some(session_id)))
}

fn apply_modified(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
) -> Result<ReconcileOutcome, String> {
    let (user, file) = resolve_user_file(db, event, timestamp)?;
    let ts = timestamp.to_rfc3339();

    let session = resolve_session(db, event, &user.id, &file.id)?;
    match session {
        Some(session) => {
            db.update_session_on_modified(
                &session.id,
                &ts,
                event.file_hash.as_deref(),
                event.resume_count,
                event.is_multi_user,
                co_editors_json(event).as_deref(),
            )?;
            maybe_reassign_user(db, &session, &user.id, event)?;
            Ok(ReconcileOutcome::new("session_updated", Some(session.id)))
        }
        None => {
            // Modified before any created made it through: same semantics.
            let session_id = insert_fresh_session(db, event, &user.id, &file.id, timestamp)?;
            info!(session_id = %session_id, "Session created from modified event");
            Ok(ReconcileOutcome::new("session_created", Some(session_id)))
        }
    }
}

fn apply_closed(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
) -> Result<ReconcileOutcome, String> {
    let (user, file) = resolve_user_file(db, event, timestamp)?;

    let session = resolve_session(db, event, &user.id, &file.id)?;
    match session {
        Some(session) => {
            let ended_at = event
                .session_ended_at
                .as_deref()
                .and_then(parse_rfc3339)
                .unwrap_or(timestamp);
            db.close_session_row(&session.id, &ended_at.to_rfc3339(), event.file_hash.as_deref())?;
            info!(session_id = %session.id, ended_at = %ended_at.to_rfc3339(), "Session closed");
            Ok(ReconcileOutcome::new("session_closed", Some(session.id)))
        }
        None => {
            debug!(file_path = %event.file_path, "Closed event without a matching session");
            Ok(ReconcileOutcome::new("no_session_found", event.session_id.clone()))
        }
    }
}

fn apply_deleted(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
) -> Result<ReconcileOutcome, String> {
    let (user, file) = resolve_user_file(db, event, timestamp)?;
    let ts = timestamp.to_rfc3339();

    let session = resolve_session(db, event, &user.id, &file.id)?;
    match session {
        Some(session) => {
            db.close_session_row(&session.id, &ts, None)?;
            info!(session_id = %session.id, "Session closed for deleted file");
            Ok(ReconcileOutcome::new("session_closed", Some(session.id)))
        }
        None => {
            // Keep the audit trail even without a live session: a short
            // already-closed session anchors the deleted event.
            let session_id = Uuid::new_v4().to_string();
            db.insert_session(&SessionRow {
                id: session_id.clone(),
                user_id: user.id,
                file_id: file.id,
                tracker_id: Some(event.tracker_id.clone()),
                started_at: ts.clone(),
                last_activity: ts.clone(),
                ended_at: Some(ts.clone()),
                hash_before: None,
                hash_after: None,
                resume_count: 0,
                is_commented: false,
                is_multi_user: false,
                co_editors: None,
                last_confirmed_at: Some(ts),
            })?;
            debug!(session_id = %session_id, "Anchored deleted event to tombstone session");
            Ok(ReconcileOutcome::new("deleted_event_anchored", Some(session_id)))
        }
    }
}

fn apply_moved(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
) -> Result<ReconcileOutcome, String> {
    let old_path = event
        .old_file_path
        .as_deref()
        .ok_or_else(|| "Moved event without old_file_path".to_string())?;
    let user = db.get_or_create_user(&event.user_id, &timestamp.to_rfc3339())?;
    let ts = timestamp.to_rfc3339();

    // Prefer the tracker-supplied identity, then the old path's active
    // session for this user, then any active session on the old file.
    let mut session = match event.session_id.as_deref() {
        Some(session_id) => db.get_session(session_id)?,
        None => None,
    };
    let old_file = db.get_file_by_path(old_path)?;
    if session.is_none() {
        if let Some(old_file) = &old_file {
            session = db.get_active_session(&user.id, &old_file.id)?;
            if session.is_none() {
                session = db.get_any_active_session_for_file(&old_file.id)?;
            }
        }
    }

    match session {
        Some(session) if session.ended_at.is_none() => {
            let dest = db.get_file_by_path(&event.file_path)?;
            match dest {
                Some(dest) if dest.id != session.file_id => {
                    db.repoint_session_file(&session.id, &dest.id, &ts)?;
                }
                Some(_) => {
                    db.repoint_session_file(&session.id, &session.file_id, &ts)?;
                }
                None => {
                    // Carry the old file row to the new path so history on
                    // the file follows the rename.
                    db.update_file_path(&session.file_id, &event.file_path, &event.file_name)?;
                    db.repoint_session_file(&session.id, &session.file_id, &ts)?;
                }
            }
            if let Some(hash) = event.file_hash.as_deref() {
                db.update_session_on_modified(&session.id, &ts, Some(hash), session.resume_count, None, None)?;
            }
            info!(
                session_id = %session.id,
                old_path = %old_path,
                new_path = %event.file_path,
                "Session moved"
            );
            Ok(ReconcileOutcome::new("session_moved", Some(session.id)))
        }
        _ => {
            let file = db.get_or_create_file(&event.file_path, &event.file_name, &ts)?;
            // No duplicate actives even via the move path.
            if let Some(active) = db.get_active_session(&user.id, &file.id)? {
                db.update_session_on_created(
                    &active.id,
                    &ts,
                    event.file_hash.as_deref(),
                    event.resume_count,
                    event.is_multi_user,
                    co_editors_json(event).as_deref(),
                )?;
                return Ok(ReconcileOutcome::new("session_updated", Some(active.id)));
            }
            let session_id = insert_fresh_session(db, event, &user.id, &file.id, timestamp)?;
            info!(
                session_id = %session_id,
                new_path = %event.file_path,
                "Session created for moved file"
            );
            Ok(ReconcileOutcome::new("session_created", Some(session_id)))
        }
    }
}

fn resolve_user_file(
    db: &Db,
    event: &EventEnvelope,
    timestamp: DateTime<Utc>,
) -> Result<(crate::db::UserRow, crate::db::FileRow), String> {
    let ts = timestamp.to_rfc3339();
    let user = db.get_or_create_user(&event.user_id, &ts)?;
    let file = db.get_or_create_file(&event.file_path, &event.file_name, &ts)?;
    Ok((user, file))
}

/// Supplied identity first, (user, file) active lookup second.
fn resolve_session(
    db: &Db,
    event: &EventEnvelope,
    user_id: &str,
    file_id: &str,
) -> Result<Option<SessionRow>, String> {
    if let Some(session_id) = event.session_id.as_deref() {
        if let Some(session) = db.get_session(session_id)? {
            return Ok(Some(session));
        }
    }
    db.get_active_session(user_id, file_id)
}

fn insert_fresh_session(
    db: &Db,
    event: &EventEnvelope,
    user_id: &str,
    file_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<String, String> {
    let ts = timestamp.to_rfc3339();
    // Honor the tracker-minted identity for cross-process continuity, unless
    // something else already owns it.
    let session_id = match event.session_id.as_deref() {
        Some(candidate) if db.get_session(candidate)?.is_none() => candidate.to_string(),
        Some(candidate) => {
            warn!(
                session_id = %candidate,
                "Supplied session id already in use, minting a new one"
            );
            Uuid::new_v4().to_string()
        }
        None => Uuid::new_v4().to_string(),
    };

    let started_at = event
        .session_started_at
        .as_deref()
        .and_then(parse_rfc3339)
        .unwrap_or(timestamp)
        .to_rfc3339();

    db.insert_session(&SessionRow {
        id: session_id.clone(),
        user_id: user_id.to_string(),
        file_id: file_id.to_string(),
        tracker_id: Some(event.tracker_id.clone()),
        started_at,
        last_activity: ts.clone(),
        ended_at: None,
        hash_before: event.file_hash.clone(),
        hash_after: None,
        resume_count: event.resume_count,
        is_commented: false,
        is_multi_user: event.is_multi_user.unwrap_or(false),
        co_editors: co_editors_json(event),
        last_confirmed_at: Some(ts),
    })?;

    Ok(session_id)
}

/// Ownership follows the tracker's primary-editor resolution: when an event
/// resolved by session id names a different primary, the durable record
/// follows, keeping session identity intact.
fn maybe_reassign_user(
    db: &Db,
    session: &SessionRow,
    event_user_id: &str,
    event: &EventEnvelope,
) -> Result<(), String> {
    if session.user_id != event_user_id && event.session_id.as_deref() == Some(session.id.as_str())
    {
        info!(
            session_id = %session.id,
            new_user = %event.user_id,
            "Primary editor reassigned"
        );
        db.reassign_session_user(&session.id, event_user_id)?;
    }
    Ok(())
}

fn co_editors_json(event: &EventEnvelope) -> Option<String> {
    event
        .co_editors
        .as_ref()
        .map(|editors| serde_json::to_string(editors).unwrap_or_else(|_| "[]".to_string()))
}
