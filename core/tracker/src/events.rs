//! The ingestion pipeline: raw watch events in, normalized lifecycle
//! events out.
//!
//! Every watch event runs through the classification gate, username
//! normalization, editor observation and the session state machine; moves
//! additionally run through the category-pair table before any session
//! impact is decided. The pipeline never performs network I/O: it returns
//! the envelopes it wants delivered and the caller owns the channel.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use edittrack_protocol::{ActiveSessionInfo, EventEnvelope, EventKind, WatchEvent, WatchKind};

use crate::classify::{is_temporary_name, FileCategory, FileClassifier};
use crate::config::TrackerConfig;
use crate::editors::{EditorTable, PrimaryChange, ProcessScanner};
use crate::hashing::HashCalculator;
use crate::moves::{classify_move, MoveKind, MoveTracker};
use crate::sessions::{base_name, LocalSession, SessionOutcome, SessionTable, SessionStats};

struct OpenFileInfo {
    username: String,
    last_activity: DateTime<Utc>,
    last_checked: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PipelineStats {
    pub events_processed: u64,
    pub sessions_created: u64,
    pub sessions_resumed: u64,
    pub files_closed: u64,
    pub files_deleted: u64,
    pub expired_sessions: u64,
    pub moves_processed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub pipeline: PipelineStats,
    #[serde(flatten)]
    pub sessions: SessionStats,
    pub open_files_tracked: usize,
}

pub struct EventPipeline<S: ProcessScanner> {
    tracker_id: String,
    classifier: FileClassifier,
    sessions: SessionTable,
    editors: EditorTable,
    moves: MoveTracker,
    hasher: HashCalculator,
    scanner: S,
    open_files: HashMap<String, OpenFileInfo>,
    close_debounce: Duration,
    default_user: String,
    stats: PipelineStats,
}

impl<S: ProcessScanner> EventPipeline<S> {
    pub fn new(config: &TrackerConfig, scanner: S) -> Self {
        Self {
            tracker_id: config.tracker_id.clone(),
            classifier: FileClassifier::new(config.classify.clone()),
            sessions: SessionTable::new(&config.sessions),
            editors: EditorTable::new(config.editors.primary_grace_secs),
            moves: MoveTracker::new(),
            hasher: HashCalculator::new(config.hashing.clone()),
            scanner,
            open_files: HashMap::new(),
            close_debounce: Duration::seconds(config.sweep.close_debounce_secs),
            default_user: current_user(),
            stats: PipelineStats::default(),
        }
    }

    pub fn handle_watch_event(&mut self, event: &WatchEvent, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        self.stats.events_processed += 1;
        tracing::debug!(kind = ?event.kind, path = %event.path, dest = ?event.dest_path, "Raw watch event");

        match event.kind {
            WatchKind::Created => self.handle_created(&event.path, now),
            WatchKind::Modified => self.handle_modified(&event.path, now),
            WatchKind::Deleted => self.handle_deleted(&event.path, now),
            WatchKind::Moved => match event.dest_path.as_deref() {
                Some(dest) => self.handle_moved(&event.path, dest, now),
                None => {
                    tracing::warn!(path = %event.path, "Moved event without destination");
                    Vec::new()
                }
            },
        }
    }

    fn handle_created(&mut self, path: &str, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        if self.moves.was_move_target(path) {
            // Rename fallout: the moved handler already settled this path.
            tracing::debug!(path = %path, "Ignoring created event for moved file");
            self.moves.resolve(path);
            return Vec::new();
        }
        if !self.is_trackable_main(path) {
            return Vec::new();
        }
        self.touch_main_file(path, EventKind::Created, now)
    }

    fn handle_modified(&mut self, path: &str, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        if !self.is_trackable_main(path) {
            return Vec::new();
        }
        self.touch_main_file(path, EventKind::Modified, now)
    }

    /// Shared created/modified path: observe editors, resolve the owning
    /// primary, collapse onto the session table, surface expired leftovers.
    fn touch_main_file(
        &mut self,
        path: &str,
        kind: EventKind,
        now: DateTime<Utc>,
    ) -> Vec<EventEnvelope> {
        let user = self.attributed_user(path);
        let snapshot = self.scanner.open_file_snapshot(path);
        let change = self.editors.observe(path, &user, &snapshot, now);
        if let PrimaryChange::Transferred { from, to } = &change {
            self.sessions.reassign_primary(path, from, to, now);
        }
        let owner = self
            .editors
            .primary(path)
            .unwrap_or(user.as_str())
            .to_string();

        if !snapshot.is_empty() {
            self.open_files.insert(
                path.to_string(),
                OpenFileInfo {
                    username: owner.clone(),
                    last_activity: now,
                    last_checked: now,
                },
            );
        } else if let Some(info) = self.open_files.get_mut(path) {
            info.last_activity = now;
        }

        let hash = self.fingerprint_if_present(path);
        let result = self.sessions.smart_create(path, &owner, hash.clone(), now);
        match result.outcome {
            SessionOutcome::Created => self.stats.sessions_created += 1,
            SessionOutcome::Resumed => self.stats.sessions_resumed += 1,
            SessionOutcome::Existing => {}
        }
        self.sessions
            .set_editor_state(path, &owner, self.editors.co_editors(path));
        // Re-read so the envelope carries the merged editor state.
        let session = self
            .sessions
            .get_active(path, &owner)
            .cloned()
            .unwrap_or(result.session);

        let mut envelopes = Vec::new();
        if let Some(prior) = result.expired_prior {
            self.stats.expired_sessions += 1;
            envelopes.push(self.closed_envelope(&prior, None));
        }
        envelopes.push(self.session_envelope(kind, &session, hash, now));
        envelopes
    }

    fn handle_deleted(&mut self, path: &str, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        if self.moves.was_move_source(path) {
            tracing::debug!(path = %path, "Ignoring deleted event for moved file");
            return Vec::new();
        }
        if self.classifier.classify(path) != FileCategory::Main {
            return Vec::new();
        }

        tracing::info!(path = %path, "File deleted");
        self.stats.files_deleted += 1;
        self.open_files.remove(path);
        self.editors.remove(path);

        let user = self.attributed_user(path);
        let mut closed = Vec::new();
        if let Some(session) = self.sessions.close(path, &user, None, now) {
            closed.push(session);
        } else {
            // The normalized key may not match; no session may outlive its
            // file.
            closed = self.sessions.close_all_for_file(path, now);
            if !closed.is_empty() {
                tracing::info!(path = %path, count = closed.len(), "Forced close for deleted file");
            }
        }

        if closed.is_empty() {
            tracing::debug!(path = %path, "No session found for deleted file");
            return vec![self.sessionless_envelope(EventKind::Deleted, path, &user, now)];
        }

        closed
            .iter()
            .map(|session| self.session_envelope(EventKind::Deleted, session, None, now))
            .collect()
    }

    fn handle_moved(&mut self, old_path: &str, new_path: &str, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        self.stats.moves_processed += 1;
        let old_category = self.classifier.classify(old_path);
        let new_category = self.classifier.classify(new_path);
        let kind = classify_move(old_category, new_category);
        tracing::info!(
            old_path = %old_path,
            new_path = %new_path,
            old_category = old_category.as_str(),
            new_category = new_category.as_str(),
            "File moved"
        );

        match kind {
            MoveKind::TempToTemp => {
                self.moves.record_link(old_path, new_path);
                Vec::new()
            }
            MoveKind::MainToTemp => {
                // Likely mid-save: the main file went transient. Remember
                // where it came from so the finishing rename can find it.
                self.moves.record_link(old_path, new_path);
                self.moves.record_temp_origin(new_path, old_path);
                Vec::new()
            }
            MoveKind::TempToIgnore => {
                tracing::debug!(old_path = %old_path, "Transient artifact discarded");
                Vec::new()
            }
            MoveKind::TempToMain => self.resolve_move_target(old_path, new_path, false, now),
            MoveKind::MainToMain => self.resolve_move_target(old_path, new_path, true, now),
            MoveKind::IgnoreToMain => self.resolve_move_target(old_path, new_path, true, now),
            MoveKind::Other { dest_is_main: true } => {
                self.resolve_move_target(old_path, new_path, true, now)
            }
            MoveKind::Other { dest_is_main: false } => {
                tracing::warn!(
                    old_path = %old_path,
                    new_path = %new_path,
                    "Unclassified move away from tracked namespace"
                );
                self.moves.record_link(old_path, new_path);
                self.moves.record_temp_origin(new_path, old_path);
                Vec::new()
            }
        }
    }

    /// The destination is MAIN: transfer the originating session if one can
    /// be found through the old path, the temp-origin map or the move
    /// chain; otherwise mint a fresh session at the destination. Falling
    /// back to fresh is the safety net; a move must never be dropped.
    fn resolve_move_target(
        &mut self,
        old_path: &str,
        new_path: &str,
        include_old: bool,
        now: DateTime<Utc>,
    ) -> Vec<EventEnvelope> {
        let user = self.attributed_user(new_path);
        let hash = self.fingerprint_if_present(new_path);

        let mut candidates: Vec<String> = Vec::new();
        if include_old {
            candidates.push(old_path.to_string());
        }
        for candidate in self.moves.transfer_candidates(old_path) {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        for candidate in &candidates {
            let candidate_user = match self.sessions.get_active(candidate, &user) {
                Some(_) => Some(user.clone()),
                None => self.sessions.any_active_user(candidate),
            };
            let Some(candidate_user) = candidate_user else {
                continue;
            };
            if let Some(session) =
                self.sessions
                    .transfer(candidate, new_path, &candidate_user, now)
            {
                self.editors.rekey(candidate, new_path);
                self.editors.rekey(old_path, new_path);
                self.rekey_open_file(candidate, new_path);
                self.rekey_open_file(old_path, new_path);
                self.moves.record_link(old_path, new_path);
                self.moves.resolve(old_path);

                let mut envelope =
                    self.session_envelope(EventKind::Moved, &session, hash, now);
                envelope.old_file_path = Some(candidate.clone());
                return vec![envelope];
            }
        }

        // No originating session anywhere: fresh session at the destination,
        // never at the transient name.
        self.editors.rekey(old_path, new_path);
        self.rekey_open_file(old_path, new_path);
        self.moves.record_link(old_path, new_path);
        let result = self.sessions.smart_create(new_path, &user, hash.clone(), now);
        match result.outcome {
            SessionOutcome::Created => self.stats.sessions_created += 1,
            SessionOutcome::Resumed => self.stats.sessions_resumed += 1,
            SessionOutcome::Existing => {}
        }

        let mut envelopes = Vec::new();
        if let Some(prior) = result.expired_prior {
            self.stats.expired_sessions += 1;
            envelopes.push(self.closed_envelope(&prior, None));
        }
        let mut envelope = self.session_envelope(EventKind::Moved, &result.session, hash, now);
        envelope.old_file_path = Some(old_path.to_string());
        envelopes.push(envelope);
        envelopes
    }

    /// Recheck every file believed open. A file whose process set has gone
    /// empty and stayed quiet past the debounce closes its session; the
    /// debounce absorbs the snapshot race where an editor process bounces
    /// between saves.
    pub fn check_open_files(&mut self, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        let paths: Vec<String> = self.open_files.keys().cloned().collect();
        let mut envelopes = Vec::new();

        for path in paths {
            let snapshot = self.scanner.open_file_snapshot(&path);
            if !snapshot.is_empty() {
                if let Some(info) = self.open_files.get_mut(&path) {
                    info.last_checked = now;
                    info.last_activity = now;
                }
                continue;
            }

            let Some(info) = self.open_files.get_mut(&path) else {
                continue;
            };
            if now - info.last_activity <= self.close_debounce {
                info.last_checked = now;
                continue;
            }

            let username = info.username.clone();
            tracing::info!(
                path = %path,
                idle_secs = (now - info.last_activity).num_seconds(),
                last_checked = %info.last_checked.to_rfc3339(),
                "File no longer open, closing session"
            );
            self.open_files.remove(&path);

            let hash = self.fingerprint_if_present(&path);
            let owner = self
                .editors
                .primary(&path)
                .unwrap_or(username.as_str())
                .to_string();
            let mut closed = Vec::new();
            if let Some(session) = self.sessions.close(&path, &owner, hash.clone(), now) {
                closed.push(session);
            } else {
                closed = self.sessions.close_all_for_file(&path, now);
            }
            self.editors.remove(&path);

            for session in closed {
                self.stats.files_closed += 1;
                envelopes.push(self.closed_envelope(&session, hash.clone()));
            }
        }

        envelopes
    }

    /// Expiry sweep: inactivity and max-age timeouts, emitted as closed
    /// events stamped with the session's own close time.
    pub fn check_expired(&mut self, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        let expired = self.sessions.check_and_close_expired(now);
        let mut envelopes = Vec::new();
        for session in expired {
            self.stats.expired_sessions += 1;
            self.open_files.remove(&session.file_path);
            let hash = self.fingerprint_if_present(&session.file_path);
            envelopes.push(self.closed_envelope(&session, hash));
        }
        envelopes
    }

    /// Close sessions whose file has vanished without a delete event
    /// (tracker restart, watch gaps).
    pub fn cleanup_orphaned(&mut self, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        let orphaned: Vec<(String, String)> = self
            .sessions
            .active_sessions()
            .filter(|session| !Path::new(&session.file_path).exists())
            .map(|session| (session.file_path.clone(), session.username.clone()))
            .collect();

        let mut envelopes = Vec::new();
        for (path, username) in orphaned {
            tracing::info!(path = %path, "Closing orphaned session for missing file");
            if let Some(session) = self.sessions.close(&path, &username, None, now) {
                self.open_files.remove(&path);
                self.editors.remove(&path);
                envelopes.push(self.session_envelope(EventKind::Deleted, &session, None, now));
            }
        }
        envelopes
    }

    /// Authority-commanded close (the session was finished centrally).
    pub fn handle_close_command(
        &mut self,
        file_path: &str,
        username: &str,
        ended_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<LocalSession> {
        let close_time = ended_at.unwrap_or(now);
        let closed = self
            .sessions
            .close(file_path, username, None, close_time)
            .or_else(|| {
                self.sessions
                    .close_all_for_file(file_path, close_time)
                    .into_iter()
                    .next()
            });
        if closed.is_some() {
            self.open_files.remove(file_path);
        }
        closed
    }

    /// A comment landed centrally: the session is finished and permanently
    /// non-resumable.
    pub fn handle_comment_notice(
        &mut self,
        file_path: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let marked = self.sessions.mark_commented(file_path, username);
        if self.sessions.get_active(file_path, username).is_some() {
            self.sessions.close(file_path, username, None, now);
            self.open_files.remove(file_path);
        }
        marked
    }

    pub fn active_snapshot(&self) -> Vec<ActiveSessionInfo> {
        self.sessions
            .active_sessions()
            .map(|session| ActiveSessionInfo {
                session_id: session.session_id.clone(),
                file_path: session.file_path.clone(),
                file_name: session.file_name.clone(),
                username: session.username.clone(),
                started_at: session.started_at.to_rfc3339(),
                last_activity: session.last_activity.to_rfc3339(),
                resume_count: session.resume_count,
                is_commented: session.is_commented,
                is_multi_user: session.is_multi_user,
                co_editors: session.co_editors.keys().cloned().collect(),
            })
            .collect()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pipeline: self.stats,
            sessions: self.sessions.stats(),
            open_files_tracked: self.open_files.len(),
        }
    }

    /// Final housekeeping before shutdown; the caller delivers what remains.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> Vec<EventEnvelope> {
        let mut envelopes = self.check_expired(now);
        envelopes.extend(self.check_open_files(now));
        envelopes.extend(self.cleanup_orphaned(now));
        envelopes
    }

    fn is_trackable_main(&mut self, path: &str) -> bool {
        match self.classifier.classify(path) {
            FileCategory::Ignore => {
                tracing::debug!(path = %path, "Ignoring file");
                false
            }
            FileCategory::Temporary => {
                tracing::debug!(path = %path, "Temporary file, no session");
                false
            }
            FileCategory::Main => self.classifier.passes_main_checks(path),
        }
    }

    fn attributed_user(&mut self, path: &str) -> String {
        let raw = self
            .scanner
            .file_owner(path)
            .unwrap_or_else(|| self.default_user.clone());
        normalize_username(&raw)
    }

    fn fingerprint_if_present(&self, path: &str) -> Option<String> {
        if !self.hasher.enabled() || is_temporary_name(&base_name(path)) {
            return None;
        }
        if !Path::new(path).exists() {
            return None;
        }
        self.hasher.fingerprint_with_retry(path)
    }

    fn rekey_open_file(&mut self, old_path: &str, new_path: &str) {
        if let Some(info) = self.open_files.remove(old_path) {
            self.open_files.insert(new_path.to_string(), info);
        }
    }

    fn session_envelope(
        &self,
        kind: EventKind,
        session: &LocalSession,
        file_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> EventEnvelope {
        EventEnvelope {
            event_id: make_event_id(),
            event_timestamp: now.to_rfc3339(),
            event_type: kind,
            tracker_id: self.tracker_id.clone(),
            file_path: session.file_path.clone(),
            file_name: session.file_name.clone(),
            user_id: session.username.clone(),
            session_id: Some(session.session_id.clone()),
            resume_count: session.resume_count,
            file_hash,
            old_file_path: None,
            session_started_at: Some(session.started_at.to_rfc3339()),
            session_ended_at: session.ended_at.map(|ended| ended.to_rfc3339()),
            is_multi_user: Some(session.is_multi_user),
            co_editors: if session.co_editors.is_empty() {
                None
            } else {
                Some(session.co_editors.keys().cloned().collect())
            },
        }
    }

    /// Closed events are stamped with the session's own close time, not the
    /// emission time, so the authority records the real duration.
    fn closed_envelope(&self, session: &LocalSession, file_hash: Option<String>) -> EventEnvelope {
        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        let mut envelope = self.session_envelope(EventKind::Closed, session, file_hash, ended_at);
        envelope.session_ended_at = Some(ended_at.to_rfc3339());
        envelope
    }

    fn sessionless_envelope(
        &self,
        kind: EventKind,
        path: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> EventEnvelope {
        EventEnvelope {
            event_id: make_event_id(),
            event_timestamp: now.to_rfc3339(),
            event_type: kind,
            tracker_id: self.tracker_id.clone(),
            file_path: path.to_string(),
            file_name: base_name(path),
            user_id: username.to_string(),
            session_id: None,
            resume_count: 0,
            file_hash: None,
            old_file_path: None,
            session_started_at: None,
            session_ended_at: None,
            is_multi_user: None,
            co_editors: None,
        }
    }
}

pub fn normalize_username(username: &str) -> String {
    let trimmed = username.trim();
    // DOMAIN\user arrives from Windows shares; key on the bare username.
    match trimmed.rsplit('\\').next() {
        Some(bare) if !bare.is_empty() => bare.to_string(),
        _ => trimmed.to_string(),
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn make_event_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "evt-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editors::ObservedEditor;
    use std::collections::VecDeque;

    /// Scripted scanner: per-path queues of snapshots, constant attribution.
    struct FakeScanner {
        snapshots: HashMap<String, VecDeque<Vec<ObservedEditor>>>,
        owners: HashMap<String, String>,
        default_owner: Option<String>,
    }

    impl FakeScanner {
        fn new() -> Self {
            Self {
                snapshots: HashMap::new(),
                owners: HashMap::new(),
                default_owner: Some("alice".to_string()),
            }
        }

        fn push_snapshot(&mut self, path: &str, editors: Vec<ObservedEditor>) {
            self.snapshots
                .entry(path.to_string())
                .or_default()
                .push_back(editors);
        }

        fn set_owner(&mut self, path: &str, owner: &str) {
            self.owners.insert(path.to_string(), owner.to_string());
        }
    }

    impl ProcessScanner for FakeScanner {
        fn open_file_snapshot(&mut self, file_path: &str) -> Vec<ObservedEditor> {
            self.snapshots
                .get_mut(file_path)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_default()
        }

        fn file_owner(&mut self, file_path: &str) -> Option<String> {
            self.owners
                .get(file_path)
                .cloned()
                .or_else(|| self.default_owner.clone())
        }
    }

    fn editor(pid: u32, username: &str) -> ObservedEditor {
        ObservedEditor {
            pid,
            process_name: "winword".to_string(),
            username: username.to_string(),
        }
    }

    fn pipeline() -> EventPipeline<FakeScanner> {
        let mut config = TrackerConfig::default();
        config.tracker_id = "tracker-test".to_string();
        config.hashing.enabled = false;
        EventPipeline::new(&config, FakeScanner::new())
    }

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-05-12T09:00:00Z")
            .expect("base time")
            .with_timezone(&Utc)
            + Duration::minutes(minute)
    }

    fn watch(kind: WatchKind, path: &str) -> WatchEvent {
        WatchEvent {
            kind,
            path: path.to_string(),
            dest_path: None,
        }
    }

    fn watch_move(old: &str, new: &str) -> WatchEvent {
        WatchEvent {
            kind: WatchKind::Moved,
            path: old.to_string(),
            dest_path: Some(new.to_string()),
        }
    }

    #[test]
    fn created_then_modified_keeps_one_session() {
        let mut pipeline = pipeline();

        let created = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].event_type, EventKind::Created);
        assert_eq!(created[0].user_id, "alice");
        let session_id = created[0].session_id.clone().expect("session id");

        for minute in 1..=3 {
            let modified = pipeline
                .handle_watch_event(&watch(WatchKind::Modified, "/share/report.docx"), at(minute));
            assert_eq!(modified.len(), 1);
            assert_eq!(modified[0].event_type, EventKind::Modified);
            assert_eq!(modified[0].session_id.as_deref(), Some(session_id.as_str()));
        }
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 1);
    }

    #[test]
    fn ignored_and_temporary_files_produce_nothing() {
        let mut pipeline = pipeline();
        assert!(pipeline
            .handle_watch_event(&watch(WatchKind::Created, "/share/build.log"), at(0))
            .is_empty());
        assert!(pipeline
            .handle_watch_event(&watch(WatchKind::Created, "/share/~$report.docx"), at(0))
            .is_empty());
        assert!(pipeline
            .handle_watch_event(&watch(WatchKind::Modified, "/share/E3327DC9.tmp"), at(0))
            .is_empty());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);
    }

    #[test]
    fn delete_closes_and_emits_deleted() {
        let mut pipeline = pipeline();
        let created = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));
        let session_id = created[0].session_id.clone();

        let deleted = pipeline.handle_watch_event(&watch(WatchKind::Deleted, "/share/report.docx"), at(1));
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].event_type, EventKind::Deleted);
        assert_eq!(deleted[0].session_id, session_id);
        assert!(deleted[0].session_ended_at.is_some());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);
    }

    #[test]
    fn delete_with_mismatched_user_still_closes() {
        let mut pipeline = pipeline();
        pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));
        // Attribution changes between the create and the delete.
        pipeline.scanner.set_owner("/share/report.docx", r"CORP\mallory");

        let deleted = pipeline.handle_watch_event(&watch(WatchKind::Deleted, "/share/report.docx"), at(1));
        assert_eq!(deleted.len(), 1);
        assert!(deleted[0].session_id.is_some());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);
    }

    #[test]
    fn delete_without_session_emits_sessionless_event() {
        let mut pipeline = pipeline();
        let deleted = pipeline.handle_watch_event(&watch(WatchKind::Deleted, "/share/report.docx"), at(0));
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].event_type, EventKind::Deleted);
        assert!(deleted[0].session_id.is_none());
    }

    #[test]
    fn office_save_shuffle_transfers_session() {
        // Scenario: report.docx open; Office renames report.docx ->
        // ~wrl0001.tmp then saves new content as report.docx via a temp.
        let mut pipeline = pipeline();
        let created = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));
        let session_id = created[0].session_id.clone().expect("session id");

        // MAIN -> TEMP: mid-save, no session impact.
        let out = pipeline.handle_watch_event(
            &watch_move("/share/report.docx", "/share/~wrl0001.tmp"),
            at(1),
        );
        assert!(out.is_empty());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 1);

        // TEMP -> MAIN: the finishing rename finds the originating session.
        let out = pipeline.handle_watch_event(
            &watch_move("/share/~wrl0001.tmp", "/share/report.docx"),
            at(1),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Moved);
        assert_eq!(out[0].session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 1);
        assert_eq!(pipeline.stats_snapshot().pipeline.sessions_created, 1);
    }

    #[test]
    fn temp_to_main_without_origin_creates_fresh_at_destination() {
        let mut pipeline = pipeline();
        let out = pipeline.handle_watch_event(
            &watch_move("/share/~wrl0009.tmp", "/share/report.docx"),
            at(0),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Moved);
        assert_eq!(out[0].file_path, "/share/report.docx");
        assert!(out[0].session_id.is_some());
        // The session lives at the destination, never the temp name.
        assert!(pipeline.sessions.get_active("/share/report.docx", "alice").is_some());
    }

    #[test]
    fn main_to_main_rename_transfers_in_place() {
        let mut pipeline = pipeline();
        let created = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/draft.docx"), at(0));
        let session_id = created[0].session_id.clone();

        let out = pipeline.handle_watch_event(
            &watch_move("/share/draft.docx", "/share/final.docx"),
            at(1),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].session_id, session_id);
        assert_eq!(out[0].old_file_path.as_deref(), Some("/share/draft.docx"));

        // Trailing watcher artifacts for the same rename are ignored.
        let fallout = pipeline.handle_watch_event(&watch(WatchKind::Deleted, "/share/draft.docx"), at(1));
        assert!(fallout.is_empty());
        let fallout = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/final.docx"), at(1));
        assert!(fallout.is_empty());
    }

    #[test]
    fn temp_shuffles_have_no_session_impact() {
        let mut pipeline = pipeline();
        assert!(pipeline
            .handle_watch_event(&watch_move("/share/AB12.tmp", "/share/CD34.tmp"), at(0))
            .is_empty());
        assert!(pipeline
            .handle_watch_event(&watch_move("/share/AB12.tmp", "/share/calc.log"), at(0))
            .is_empty());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);
    }

    #[test]
    fn co_editors_surface_in_envelopes() {
        let mut pipeline = pipeline();
        pipeline
            .scanner
            .push_snapshot("/share/report.docx", vec![editor(100, "alice")]);
        pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));

        pipeline
            .scanner
            .push_snapshot("/share/report.docx", vec![editor(100, "alice"), editor(200, "bob")]);
        let out = pipeline.handle_watch_event(&watch(WatchKind::Modified, "/share/report.docx"), at(1));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].user_id, "alice");
        assert_eq!(out[0].is_multi_user, Some(true));
        assert_eq!(out[0].co_editors.as_deref(), Some(&["bob".to_string()][..]));
    }

    #[test]
    fn open_file_recheck_closes_after_debounce() {
        let mut pipeline = pipeline();
        pipeline
            .scanner
            .push_snapshot("/share/report.docx", vec![editor(100, "alice")]);
        pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));

        // Still within debounce: nothing closes even though the file looks
        // closed.
        let out = pipeline.check_open_files(at(0));
        assert!(out.is_empty());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 1);

        let out = pipeline.check_open_files(at(1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Closed);
        assert!(out[0].session_ended_at.is_some());
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);
    }

    #[test]
    fn expiry_sweep_emits_closed_with_close_time() {
        let mut pipeline = pipeline();
        pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));

        let out = pipeline.check_expired(at(31));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventKind::Closed);
        assert_eq!(out[0].event_timestamp, at(31).to_rfc3339());
        assert_eq!(out[0].session_ended_at.as_deref(), Some(at(31).to_rfc3339().as_str()));
    }

    #[test]
    fn comment_notice_retires_session_permanently() {
        let mut pipeline = pipeline();
        let created = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));
        let first_id = created[0].session_id.clone().expect("session id");

        assert!(pipeline.handle_comment_notice("/share/report.docx", "alice", at(1)));
        assert_eq!(pipeline.stats_snapshot().sessions.active_sessions, 0);

        // Reopening mints a new identity; the commented one is retired.
        let reopened = pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(2));
        assert_ne!(reopened[0].session_id.as_deref(), Some(first_id.as_str()));
    }

    #[test]
    fn close_command_honors_supplied_end_time() {
        let mut pipeline = pipeline();
        pipeline.handle_watch_event(&watch(WatchKind::Created, "/share/report.docx"), at(0));

        let closed = pipeline
            .handle_close_command("/share/report.docx", "alice", Some(at(7)), at(9))
            .expect("closed");
        assert_eq!(closed.ended_at, Some(at(7)));
    }

    #[test]
    fn username_normalization_strips_domains() {
        assert_eq!(normalize_username(r"CORP\alice"), "alice");
        assert_eq!(normalize_username("alice"), "alice");
        assert_eq!(normalize_username(r"EMEA\corp\bob"), "bob");
        assert_eq!(normalize_username("  carol "), "carol");
    }
}
