//! The local (file, user) -> session state machine.
//!
//! States: no-session -> active -> closed -> resumed | retired. The table is
//! the single authority on local session identity; every transition stamps
//! timestamps from the caller-supplied clock so duplicate and out-of-order
//! detection paths collapse deterministically.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::config::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalSession {
    pub session_id: String,
    pub file_path: String,
    pub file_name: String,
    pub username: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hash_before: Option<String>,
    pub hash_after: Option<String>,
    pub resume_count: u32,
    pub is_commented: bool,
    pub co_editors: BTreeMap<String, DateTime<Utc>>,
    pub is_multi_user: bool,
}

impl LocalSession {
    pub fn duration_secs(&self) -> Option<i64> {
        self.ended_at
            .map(|ended| (ended - self.started_at).num_seconds())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An active session already existed; the call collapsed into it.
    Existing,
    /// A recently-closed session was reopened under its original identity.
    Resumed,
    /// A brand-new session was minted.
    Created,
}

#[derive(Debug, Clone)]
pub struct SmartCreateResult {
    pub session: LocalSession,
    pub outcome: SessionOutcome,
    /// Set when the active entry found for the key had already expired and
    /// was closed before the create was applied. The caller owes downstream
    /// a closed event for it.
    pub expired_prior: Option<LocalSession>,
}

type SessionKey = (String, String);

pub struct SessionTable {
    active: HashMap<SessionKey, LocalSession>,
    closed: HashMap<SessionKey, VecDeque<LocalSession>>,
    timeout: Duration,
    max_age: Duration,
    resume_window: Duration,
    history_limit: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub closed_sessions: usize,
    pub multi_user_sessions: usize,
}

impl SessionTable {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            active: HashMap::new(),
            closed: HashMap::new(),
            timeout: Duration::minutes(config.timeout_minutes),
            max_age: Duration::hours(config.max_session_hours),
            resume_window: Duration::minutes(config.resume_window_minutes),
            history_limit: config.closed_history_limit.max(1),
        }
    }

    /// Idempotent create: collapse onto the active session, resume a
    /// recently-closed one, or mint a fresh identity, in that order.
    pub fn smart_create(
        &mut self,
        file_path: &str,
        username: &str,
        file_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> SmartCreateResult {
        let key = session_key(file_path, username);

        let mut expired_prior = None;
        if let Some(session) = self.active.get_mut(&key) {
            if is_expired(session, self.timeout, self.max_age, now) {
                tracing::info!(file_path = %file_path, username = %username, "Active session already expired, closing before create");
                expired_prior = self.close(file_path, username, None, now);
            } else {
                session.last_activity = now;
                return SmartCreateResult {
                    session: session.clone(),
                    outcome: SessionOutcome::Existing,
                    expired_prior: None,
                };
            }
        }

        if let Some(recent) = self.take_resumable(&key, now) {
            let session = self.resume(recent, file_hash, now);
            return SmartCreateResult {
                session,
                outcome: SessionOutcome::Resumed,
                expired_prior,
            };
        }

        let session = LocalSession {
            session_id: Uuid::new_v4().to_string(),
            file_path: file_path.to_string(),
            file_name: base_name(file_path),
            username: username.to_string(),
            started_at: now,
            last_activity: now,
            resumed_at: None,
            ended_at: None,
            hash_before: file_hash,
            hash_after: None,
            resume_count: 0,
            is_commented: false,
            co_editors: BTreeMap::new(),
            is_multi_user: false,
        };
        tracing::info!(file_path = %file_path, username = %username, session_id = %session.session_id, "New session created");
        self.active.insert(key, session.clone());

        SmartCreateResult {
            session,
            outcome: SessionOutcome::Created,
            expired_prior,
        }
    }

    /// Pop the most recent closed entry for the key if it qualifies for
    /// resumption: within the resume window, not commented, and carrying a
    /// real `ended_at` (a closed entry without one is corrupt and skipped).
    fn take_resumable(&mut self, key: &SessionKey, now: DateTime<Utc>) -> Option<LocalSession> {
        let history = self.closed.get_mut(key)?;
        let candidate = history.back()?;

        if candidate.is_commented {
            tracing::debug!(
                session_id = %candidate.session_id,
                "Commented session is not resumable"
            );
            return None;
        }
        let ended_at = match candidate.ended_at {
            Some(ended_at) => ended_at,
            None => {
                tracing::warn!(
                    session_id = %candidate.session_id,
                    "Closed session without ended_at; skipping resume"
                );
                return None;
            }
        };
        if now - ended_at > self.resume_window {
            return None;
        }

        history.pop_back()
    }

    fn resume(
        &mut self,
        mut session: LocalSession,
        file_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> LocalSession {
        session.last_activity = now;
        session.resumed_at = Some(now);
        session.resume_count += 1;
        session.hash_before = file_hash;
        session.ended_at = None;
        session.hash_after = None;

        tracing::info!(
            file_path = %session.file_path,
            session_id = %session.session_id,
            resume_count = session.resume_count,
            "Resumed session"
        );

        let key = session_key(&session.file_path, &session.username);
        self.active.insert(key, session.clone());
        session
    }

    /// Close the active session for the key. None when nothing is active:
    /// double-close is expected when detection paths race.
    pub fn close(
        &mut self,
        file_path: &str,
        username: &str,
        file_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<LocalSession> {
        let key = session_key(file_path, username);
        let mut session = self.active.remove(&key)?;

        // ended_at is stamped before anything else touches the record; a
        // closed session without it would poison the resume path.
        session.ended_at = Some(now);
        session.hash_after = file_hash;

        let history = self.closed.entry(key).or_default();
        let already_recorded = history
            .iter()
            .any(|entry| entry.session_id == session.session_id);
        if !already_recorded {
            history.push_back(session.clone());
        }
        while history.len() > self.history_limit {
            history.pop_front();
        }

        tracing::info!(file_path = %file_path, username = %username, session_id = %session.session_id, "Session closed");
        Some(session)
    }

    /// Close every active session for a file regardless of user. Safety net
    /// for deletes where username normalization may not match the key.
    pub fn close_all_for_file(&mut self, file_path: &str, now: DateTime<Utc>) -> Vec<LocalSession> {
        let users: Vec<String> = self
            .active
            .keys()
            .filter(|(path, _)| path == file_path)
            .map(|(_, user)| user.clone())
            .collect();

        users
            .into_iter()
            .filter_map(|user| self.close(file_path, &user, None, now))
            .collect()
    }

    /// Sweep the active table, closing everything past the inactivity
    /// timeout or the maximum session age. Iterates a snapshot because the
    /// close path mutates the table.
    pub fn check_and_close_expired(&mut self, now: DateTime<Utc>) -> Vec<LocalSession> {
        let expired_keys: Vec<SessionKey> = self
            .active
            .iter()
            .filter(|(_, session)| is_expired(session, self.timeout, self.max_age, now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut closed = Vec::new();
        for (file_path, username) in expired_keys {
            if let Some(session) = self.close(&file_path, &username, None, now) {
                closed.push(session);
            }
        }
        if !closed.is_empty() {
            tracing::info!(count = closed.len(), "Closed expired sessions");
        }
        closed
    }

    /// Re-key an active session to a new path, preserving identity,
    /// started_at, resume_count and co-editor state. A rename must not look
    /// like close-old + create-new downstream.
    pub fn transfer(
        &mut self,
        old_path: &str,
        new_path: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> Option<LocalSession> {
        let old_key = session_key(old_path, username);
        let mut session = self.active.remove(&old_key)?;

        session.file_path = new_path.to_string();
        session.file_name = base_name(new_path);
        session.last_activity = now;

        tracing::info!(
            old_path = %old_path,
            new_path = %new_path,
            session_id = %session.session_id,
            "Transferred session"
        );

        self.active
            .insert(session_key(new_path, username), session.clone());
        Some(session)
    }

    /// Move session ownership to a new primary editor, demoting the old one
    /// into the co-editor set. Identity and timestamps are preserved.
    pub fn reassign_primary(
        &mut self,
        file_path: &str,
        old_user: &str,
        new_user: &str,
        now: DateTime<Utc>,
    ) -> Option<LocalSession> {
        let mut session = self.active.remove(&session_key(file_path, old_user))?;

        let old_last_seen = session.last_activity;
        session.username = new_user.to_string();
        session.co_editors.remove(new_user);
        session
            .co_editors
            .insert(old_user.to_string(), old_last_seen);
        session.is_multi_user = true;
        session.last_activity = now;

        tracing::info!(
            file_path = %file_path,
            from = %old_user,
            to = %new_user,
            session_id = %session.session_id,
            "Primary editor reassigned"
        );

        self.active
            .insert(session_key(file_path, new_user), session.clone());
        Some(session)
    }

    /// Record observed co-editors on the active session.
    pub fn set_editor_state(
        &mut self,
        file_path: &str,
        username: &str,
        co_editors: BTreeMap<String, DateTime<Utc>>,
    ) {
        if let Some(session) = self.active.get_mut(&session_key(file_path, username)) {
            session.is_multi_user = session.is_multi_user || !co_editors.is_empty();
            session.co_editors = co_editors;
        }
    }

    /// Terminal marker: the session (active, or the most recent closed
    /// entry) becomes permanently ineligible for resumption.
    pub fn mark_commented(&mut self, file_path: &str, username: &str) -> bool {
        let key = session_key(file_path, username);
        if let Some(session) = self.active.get_mut(&key) {
            session.is_commented = true;
            tracing::info!(file_path = %file_path, username = %username, "Marked active session as commented");
            return true;
        }
        if let Some(history) = self.closed.get_mut(&key) {
            if let Some(last) = history.back_mut() {
                last.is_commented = true;
                tracing::info!(file_path = %file_path, username = %username, "Marked closed session as commented");
                return true;
            }
        }
        false
    }

    pub fn get_active(&self, file_path: &str, username: &str) -> Option<&LocalSession> {
        self.active.get(&session_key(file_path, username))
    }

    /// Any user with an active session on the file. Used when the caller's
    /// username may not match the key (normalization drift across hosts).
    pub fn any_active_user(&self, file_path: &str) -> Option<String> {
        self.active
            .keys()
            .filter(|(path, _)| path == file_path)
            .map(|(_, user)| user.clone())
            .min()
    }

    pub fn active_sessions(&self) -> impl Iterator<Item = &LocalSession> {
        self.active.values()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.active.len(),
            closed_sessions: self.closed.values().map(|history| history.len()).sum(),
            multi_user_sessions: self
                .active
                .values()
                .filter(|session| session.is_multi_user || !session.co_editors.is_empty())
                .count(),
        }
    }
}

fn session_key(file_path: &str, username: &str) -> SessionKey {
    (file_path.to_string(), username.to_string())
}

fn is_expired(
    session: &LocalSession,
    timeout: Duration,
    max_age: Duration,
    now: DateTime<Utc>,
) -> bool {
    if now - session.last_activity > timeout {
        tracing::debug!(
            file_path = %session.file_path,
            inactive_secs = (now - session.last_activity).num_seconds(),
            "Session expired by inactivity"
        );
        return true;
    }
    if now - session.started_at > max_age {
        tracing::debug!(
            file_path = %session.file_path,
            age_secs = (now - session.started_at).num_seconds(),
            "Session expired by max age"
        );
        return true;
    }
    false
}

pub fn base_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SessionTable {
        SessionTable::new(&SessionConfig::default())
    }

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-12T09:00:00Z")
            .expect("base time")
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    #[test]
    fn create_modify_close_lifecycle() {
        let mut table = table();

        let created = table.smart_create("/share/report.docx", "alice", Some("h1".into()), at(0));
        assert_eq!(created.outcome, SessionOutcome::Created);
        assert_eq!(created.session.resume_count, 0);
        let session_id = created.session.session_id.clone();

        for minute in 1..=3 {
            let again =
                table.smart_create("/share/report.docx", "alice", Some("h2".into()), at(minute));
            assert_eq!(again.outcome, SessionOutcome::Existing);
            assert_eq!(again.session.session_id, session_id);
            assert_eq!(again.session.last_activity, at(minute));
        }
        assert_eq!(table.stats().active_sessions, 1);

        let closed = table
            .close("/share/report.docx", "alice", Some("h3".into()), at(10))
            .expect("close");
        assert_eq!(closed.session_id, session_id);
        assert_eq!(closed.ended_at, Some(at(10)));
        assert_eq!(closed.hash_after.as_deref(), Some("h3"));
        assert_eq!(closed.duration_secs(), Some(600));
        assert!(table.get_active("/share/report.docx", "alice").is_none());
    }

    #[test]
    fn reopen_within_window_resumes_same_identity() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));
        let session_id = created.session.session_id.clone();
        table.close("/share/report.docx", "alice", Some("h1".into()), at(5));

        let resumed = table.smart_create("/share/report.docx", "alice", Some("h2".into()), at(15));
        assert_eq!(resumed.outcome, SessionOutcome::Resumed);
        assert_eq!(resumed.session.session_id, session_id);
        assert_eq!(resumed.session.resume_count, 1);
        assert_eq!(resumed.session.started_at, at(0));
        assert_eq!(resumed.session.ended_at, None);
        assert_eq!(resumed.session.hash_after, None);
        assert_eq!(resumed.session.hash_before.as_deref(), Some("h2"));
    }

    #[test]
    fn reopen_outside_window_creates_new_identity() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));
        let first_id = created.session.session_id.clone();
        table.close("/share/report.docx", "alice", None, at(5));

        let fresh = table.smart_create("/share/report.docx", "alice", None, at(5 + 61));
        assert_eq!(fresh.outcome, SessionOutcome::Created);
        assert_ne!(fresh.session.session_id, first_id);
        assert_eq!(fresh.session.resume_count, 0);
    }

    #[test]
    fn commented_session_is_never_resumed() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));
        let first_id = created.session.session_id.clone();
        table.close("/share/report.docx", "alice", None, at(5));
        assert!(table.mark_commented("/share/report.docx", "alice"));

        let next = table.smart_create("/share/report.docx", "alice", None, at(10));
        assert_eq!(next.outcome, SessionOutcome::Created);
        assert_ne!(next.session.session_id, first_id);
    }

    #[test]
    fn corrupt_closed_entry_is_skipped() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));
        let first_id = created.session.session_id.clone();
        table.close("/share/report.docx", "alice", None, at(5));

        // Simulate a corrupt history record that lost its close stamp.
        let key = ("/share/report.docx".to_string(), "alice".to_string());
        table
            .closed
            .get_mut(&key)
            .expect("history")
            .back_mut()
            .expect("entry")
            .ended_at = None;

        let next = table.smart_create("/share/report.docx", "alice", None, at(10));
        assert_eq!(next.outcome, SessionOutcome::Created);
        assert_ne!(next.session.session_id, first_id);
    }

    #[test]
    fn double_close_returns_none() {
        let mut table = table();
        table.smart_create("/share/report.docx", "alice", None, at(0));
        assert!(table.close("/share/report.docx", "alice", None, at(1)).is_some());
        assert!(table.close("/share/report.docx", "alice", None, at(2)).is_none());
    }

    #[test]
    fn expiry_sweep_closes_inactive_and_aged_sessions() {
        let mut table = table();
        table.smart_create("/share/idle.docx", "alice", None, at(0));
        table.smart_create("/share/busy.docx", "bob", None, at(0));
        // Keep bob alive past alice's timeout.
        table.smart_create("/share/busy.docx", "bob", None, at(29));

        let closed = table.check_and_close_expired(at(31));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].file_path, "/share/idle.docx");
        assert_eq!(closed[0].ended_at, Some(at(31)));
        assert!(table.get_active("/share/busy.docx", "bob").is_some());

        // Max age catches even continuously-active sessions.
        let mut minute = 45;
        while minute <= 170 {
            table.smart_create("/share/busy.docx", "bob", None, at(minute));
            minute += 20;
        }
        let closed = table.check_and_close_expired(at(181));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].file_path, "/share/busy.docx");
    }

    #[test]
    fn smart_create_reports_expired_prior_session() {
        let mut table = table();
        let first = table.smart_create("/share/report.docx", "alice", None, at(0));
        let first_id = first.session.session_id.clone();

        // Next touch arrives well past the inactivity timeout; the stale
        // session must be closed (with ended_at) and then resumed.
        let result = table.smart_create("/share/report.docx", "alice", None, at(45));
        let prior = result.expired_prior.expect("expired prior");
        assert_eq!(prior.session_id, first_id);
        assert_eq!(prior.ended_at, Some(at(45)));
        assert_eq!(result.outcome, SessionOutcome::Resumed);
        assert_eq!(result.session.session_id, first_id);
        assert_eq!(result.session.resume_count, 1);
    }

    #[test]
    fn transfer_preserves_identity_and_counters() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));
        table.close("/share/report.docx", "alice", None, at(1));
        let resumed = table.smart_create("/share/report.docx", "alice", None, at(2));
        assert_eq!(resumed.session.resume_count, 1);

        let moved = table
            .transfer("/share/report.docx", "/share/final.docx", "alice", at(3))
            .expect("transfer");
        assert_eq!(moved.session_id, created.session.session_id);
        assert_eq!(moved.started_at, at(0));
        assert_eq!(moved.resume_count, 1);
        assert_eq!(moved.file_name, "final.docx");
        assert!(table.get_active("/share/report.docx", "alice").is_none());
        assert!(table.get_active("/share/final.docx", "alice").is_some());
    }

    #[test]
    fn close_all_for_file_sweeps_every_user() {
        let mut table = table();
        table.smart_create("/share/report.docx", "alice", None, at(0));
        table.smart_create("/share/report.docx", "bob", None, at(0));
        table.smart_create("/share/other.docx", "carol", None, at(0));

        let closed = table.close_all_for_file("/share/report.docx", at(1));
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|session| session.ended_at == Some(at(1))));
        assert_eq!(table.stats().active_sessions, 1);
    }

    #[test]
    fn closed_history_is_bounded() {
        let mut table = table();
        for i in 0..8 {
            table.smart_create("/share/report.docx", "alice", None, at(i * 200));
            table.close("/share/report.docx", "alice", None, at(i * 200 + 1));
        }
        let key = ("/share/report.docx".to_string(), "alice".to_string());
        assert_eq!(table.closed.get(&key).expect("history").len(), 5);
    }

    #[test]
    fn reassign_primary_keeps_identity_and_demotes_old_owner() {
        let mut table = table();
        let created = table.smart_create("/share/report.docx", "alice", None, at(0));

        let reassigned = table
            .reassign_primary("/share/report.docx", "alice", "bob", at(6))
            .expect("reassign");
        assert_eq!(reassigned.session_id, created.session.session_id);
        assert_eq!(reassigned.username, "bob");
        assert!(reassigned.is_multi_user);
        assert!(reassigned.co_editors.contains_key("alice"));
        assert!(table.get_active("/share/report.docx", "alice").is_none());
        assert!(table.get_active("/share/report.docx", "bob").is_some());
    }
}
