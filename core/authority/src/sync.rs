//! Cross-tracker reconciliation sweep.
//!
//! Fetch-then-reconcile: every registered tracker is polled for its active
//! sessions first, with no lock held across the round-trips; only then are
//! confirmations stamped and stale sessions closed. A session the owning
//! tracker stops confirming ages past the grace window and is closed as
//! orphaned, which bounds staleness when a tracker dies without reporting.
//! The inverse drift is pushed back: sessions a tracker still reports
//! active that the authority has ended get a close command.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use edittrack_protocol::{ActiveSessionInfo, CloseSessionCommand};

use crate::db::{parse_rfc3339, TrackerRow};
use crate::notify::{fetch_active_sessions, send_close_session};
use crate::state::SharedState;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SweepSummary {
    pub trackers_polled: usize,
    pub trackers_unreachable: usize,
    pub sessions_confirmed: usize,
    pub orphans_closed: usize,
    pub tracker_closes_sent: usize,
}

pub fn run_orphan_sweep(
    state: &SharedState,
    grace: Duration,
    tracker_timeout: StdDuration,
) -> Result<SweepSummary, String> {
    let mut summary = SweepSummary::default();
    let trackers = state.db().list_trackers()?;

    // Fetch phase: collect every tracker's view before touching the store.
    let mut reports: Vec<(TrackerRow, Vec<ActiveSessionInfo>)> = Vec::new();
    for tracker in trackers {
        summary.trackers_polled += 1;
        match fetch_active_sessions(Path::new(&tracker.command_socket), tracker_timeout) {
            Ok(sessions) => reports.push((tracker, sessions)),
            Err(err) => {
                summary.trackers_unreachable += 1;
                warn!(
                    tracker_id = %tracker.tracker_id,
                    error = %err,
                    "Tracker unreachable during sweep"
                );
            }
        }
    }

    let now = Utc::now();
    let now_str = now.to_rfc3339();

    // Reconcile phase: stamp confirmations, push back closes for sessions
    // the tracker believes active but the authority has ended.
    for (tracker, sessions) in &reports {
        let ids: Vec<String> = sessions
            .iter()
            .map(|session| session.session_id.clone())
            .collect();
        summary.sessions_confirmed += state.db().confirm_sessions(&tracker.tracker_id, &ids, &now_str)?;

        for info in sessions {
            let Some(row) = state.db().get_session(&info.session_id)? else {
                continue;
            };
            if row.ended_at.is_none() {
                continue;
            }
            debug!(
                session_id = %info.session_id,
                tracker_id = %tracker.tracker_id,
                "Tracker still reports an ended session, sending close"
            );
            let command = CloseSessionCommand {
                session_id: Some(info.session_id.clone()),
                file_path: info.file_path.clone(),
                username: info.username.clone(),
                ended_at: row.ended_at.clone(),
            };
            match send_close_session(
                Path::new(&tracker.command_socket),
                &command,
                tracker_timeout,
            ) {
                Ok(()) => summary.tracker_closes_sent += 1,
                Err(err) => warn!(
                    tracker_id = %tracker.tracker_id,
                    error = %err,
                    "Failed to push close command"
                ),
            }
        }
    }

    // Orphan close: active sessions whose confirmation has aged out.
    for session in state.db().list_active_sessions()? {
        let anchor = session
            .last_confirmed_at
            .as_deref()
            .or(Some(session.last_activity.as_str()))
            .and_then(parse_rfc3339);
        let Some(anchor) = anchor else {
            warn!(session_id = %session.id, "Session has no parseable confirmation time");
            continue;
        };
        if now - anchor <= grace {
            continue;
        }

        info!(
            session_id = %session.id,
            tracker_id = ?session.tracker_id,
            unconfirmed_secs = (now - anchor).num_seconds(),
            "Closing orphaned session"
        );
        state.db().close_session_row(&session.id, &now_str, None)?;
        state.db().insert_event(
            &format!("sweep-{}", Uuid::new_v4()),
            &session.id,
            "closed",
            None,
            &now_str,
        )?;
        summary.orphans_closed += 1;
    }

    if summary.orphans_closed > 0 || summary.trackers_unreachable > 0 {
        info!(
            polled = summary.trackers_polled,
            unreachable = summary.trackers_unreachable,
            confirmed = summary.sessions_confirmed,
            orphans = summary.orphans_closed,
            "Orphan sweep complete"
        );
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthorityConfig;
    use crate::db::Db;
    use edittrack_protocol::{
        EventEnvelope, EventKind, Method, Request, Response, TrackerRegistration,
    };
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;

    fn state(dir: &Path) -> SharedState {
        let db = Db::new(dir.join("sessions.db")).expect("db init");
        SharedState::new(db, &AuthorityConfig::default())
    }

    fn created_event(event_id: &str, session_id: &str, path: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: event_id.to_string(),
            event_timestamp: Utc::now().to_rfc3339(),
            event_type: EventKind::Created,
            tracker_id: "tracker-a".to_string(),
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            user_id: "alice".to_string(),
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

    /// Serves GetActiveSessions with a fixed listing until dropped.
    fn spawn_tracker_stub(
        listener: UnixListener,
        sessions: serde_json::Value,
        connections: usize,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 2048];
                loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            buffer.extend_from_slice(&chunk[..n]);
                            if buffer.contains(&b'\n') {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let newline = buffer.iter().position(|b| *b == b'\n').unwrap_or(buffer.len());
                let request: Request =
                    serde_json::from_slice(&buffer[..newline]).expect("request json");
                let response = match request.method {
                    Method::GetActiveSessions => Response::ok(
                        None,
                        serde_json::json!({ "sessions": sessions.clone() }),
                    ),
                    _ => Response::ok(None, serde_json::json!({"status": "ok"})),
                };
                let mut payload = serde_json::to_vec(&response).expect("serialize");
                payload.push(b'\n');
                let _ = stream.write_all(&payload);
            }
        })
    }

    fn session_info(session_id: &str, path: &str) -> serde_json::Value {
        serde_json::json!({
            "session_id": session_id,
            "file_path": path,
            "file_name": path.rsplit('/').next().unwrap_or(path),
            "username": "alice",
            "started_at": Utc::now().to_rfc3339(),
            "last_activity": Utc::now().to_rfc3339(),
            "resume_count": 0,
            "is_commented": false,
            "is_multi_user": false,
            "co_editors": []
        })
    }

    #[test]
    fn confirmed_sessions_survive_unconfirmed_ones_close() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());

        let socket = dir.path().join("tracker-a.sock");
        state
            .register_tracker(&TrackerRegistration {
                tracker_id: "tracker-a".to_string(),
                command_socket: socket.display().to_string(),
            })
            .expect("register");

        state
            .apply_event(&created_event("evt-1", "session-live", "/share/live.docx"))
            .expect("apply");
        state
            .apply_event(&created_event("evt-2", "session-stale", "/share/stale.docx"))
            .expect("apply");

        // The tracker only confirms session-live.
        let listener = UnixListener::bind(&socket).expect("bind");
        let handle = spawn_tracker_stub(
            listener,
            serde_json::json!([session_info("session-live", "/share/live.docx")]),
            1,
        );

        let summary = run_orphan_sweep(
            &state,
            Duration::zero(),
            StdDuration::from_millis(500),
        )
        .expect("sweep");
        handle.join().expect("tracker stub");

        assert_eq!(summary.sessions_confirmed, 1);
        assert_eq!(summary.orphans_closed, 1);

        let live = state.db().get_session("session-live").expect("query").expect("row");
        assert!(live.ended_at.is_none());
        let stale = state.db().get_session("session-stale").expect("query").expect("row");
        assert!(stale.ended_at.is_some());
    }

    #[test]
    fn unreachable_tracker_sessions_close_after_grace() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());
        state
            .register_tracker(&TrackerRegistration {
                tracker_id: "tracker-a".to_string(),
                command_socket: dir.path().join("gone.sock").display().to_string(),
            })
            .expect("register");
        state
            .apply_event(&created_event("evt-1", "session-1", "/share/report.docx"))
            .expect("apply");

        // Generous grace: nothing closes yet even with the tracker down.
        let summary = run_orphan_sweep(
            &state,
            Duration::minutes(10),
            StdDuration::from_millis(100),
        )
        .expect("sweep");
        assert_eq!(summary.trackers_unreachable, 1);
        assert_eq!(summary.orphans_closed, 0);

        // Zero grace: the unconfirmed session ages out immediately.
        let summary = run_orphan_sweep(
            &state,
            Duration::zero(),
            StdDuration::from_millis(100),
        )
        .expect("sweep");
        assert_eq!(summary.orphans_closed, 1);
    }

    #[test]
    fn ended_sessions_reported_active_get_close_commands() {
        let dir = tempfile::tempdir().expect("temp dir");
        let state = state(dir.path());

        let socket = dir.path().join("tracker-a.sock");
        state
            .register_tracker(&TrackerRegistration {
                tracker_id: "tracker-a".to_string(),
                command_socket: socket.display().to_string(),
            })
            .expect("register");

        state
            .apply_event(&created_event("evt-1", "session-1", "/share/report.docx"))
            .expect("apply");
        state
            .db()
            .close_session_row("session-1", &Utc::now().to_rfc3339(), None)
            .expect("close");

        // Tracker still reports it active: sweep answers with a close.
        let listener = UnixListener::bind(&socket).expect("bind");
        let handle = spawn_tracker_stub(
            listener,
            serde_json::json!([session_info("session-1", "/share/report.docx")]),
            2,
        );

        let summary = run_orphan_sweep(
            &state,
            Duration::minutes(10),
            StdDuration::from_millis(500),
        )
        .expect("sweep");
        handle.join().expect("tracker stub");

        assert_eq!(summary.tracker_closes_sent, 1);
    }
}
