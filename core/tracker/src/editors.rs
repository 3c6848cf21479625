//! Editor tracking: who currently holds a file open, and which of them owns
//! the session.
//!
//! Process snapshots are point-in-time and inherently racy; the table
//! tolerates false negatives through the primary grace period rather than
//! any blocking wait. Session identity stays singular: the first observed
//! user is the sticky primary, everyone else accrues as a co-editor.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEditor {
    pub pid: u32,
    pub process_name: String,
    pub username: String,
}

/// Point-in-time view of processes holding a file open, plus best-effort
/// file-owner attribution. The production implementation inspects the
/// process table and file metadata; tests script both.
pub trait ProcessScanner {
    fn open_file_snapshot(&mut self, file_path: &str) -> Vec<ObservedEditor>;

    /// Username the file's last write is attributed to, when the host can
    /// tell. None falls back to the daemon's own user.
    fn file_owner(&mut self, _file_path: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorState {
    pub primary: String,
    pub primary_last_seen: DateTime<Utc>,
    pub co_editors: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryChange {
    Unchanged,
    Transferred { from: String, to: String },
}

pub struct EditorTable {
    files: HashMap<String, EditorState>,
    grace: Duration,
}

impl EditorTable {
    pub fn new(primary_grace_secs: i64) -> Self {
        Self {
            files: HashMap::new(),
            grace: Duration::seconds(primary_grace_secs),
        }
    }

    /// Fold a snapshot into the per-file state. `attributed_user` is the
    /// user the triggering filesystem event was attributed to; it counts as
    /// observed even when process inspection misses it.
    pub fn observe(
        &mut self,
        file_path: &str,
        attributed_user: &str,
        snapshot: &[ObservedEditor],
        now: DateTime<Utc>,
    ) -> PrimaryChange {
        let state = self
            .files
            .entry(file_path.to_string())
            .or_insert_with(|| EditorState {
                primary: attributed_user.to_string(),
                primary_last_seen: now,
                co_editors: BTreeMap::new(),
            });

        let mut seen_primary = false;
        for username in observed_users(attributed_user, snapshot) {
            if username == state.primary {
                seen_primary = true;
            } else {
                state.co_editors.insert(username, now);
            }
        }
        if seen_primary {
            state.primary_last_seen = now;
        }

        if !seen_primary
            && now - state.primary_last_seen > self.grace
            && !state.co_editors.is_empty()
        {
            let successor = most_recent_co_editor(&state.co_editors);
            let previous = std::mem::replace(&mut state.primary, successor.clone());
            let previous_seen = state.primary_last_seen;
            state.co_editors.remove(&successor);
            state.co_editors.insert(previous.clone(), previous_seen);
            state.primary_last_seen = now;

            tracing::info!(
                file_path = %file_path,
                from = %previous,
                to = %state.primary,
                "Primary editor transferred"
            );
            return PrimaryChange::Transferred {
                from: previous,
                to: successor,
            };
        }

        PrimaryChange::Unchanged
    }

    pub fn primary(&self, file_path: &str) -> Option<&str> {
        self.files.get(file_path).map(|state| state.primary.as_str())
    }

    pub fn co_editors(&self, file_path: &str) -> BTreeMap<String, DateTime<Utc>> {
        self.files
            .get(file_path)
            .map(|state| state.co_editors.clone())
            .unwrap_or_default()
    }

    pub fn is_multi_user(&self, file_path: &str) -> bool {
        self.files
            .get(file_path)
            .map(|state| !state.co_editors.is_empty())
            .unwrap_or(false)
    }

    /// Carry editor state across a rename so a mid-save shuffle does not
    /// reset primacy.
    pub fn rekey(&mut self, old_path: &str, new_path: &str) {
        if let Some(state) = self.files.remove(old_path) {
            self.files.insert(new_path.to_string(), state);
        }
    }

    pub fn remove(&mut self, file_path: &str) {
        self.files.remove(file_path);
    }
}

fn observed_users(attributed_user: &str, snapshot: &[ObservedEditor]) -> Vec<String> {
    let mut users: Vec<String> = vec![attributed_user.to_string()];
    for editor in snapshot {
        if !users.contains(&editor.username) {
            users.push(editor.username.clone());
        }
    }
    users
}

/// Most recent last-seen wins; an exact tie goes to the lexicographically
/// smallest username so reassignment stays deterministic.
fn most_recent_co_editor(co_editors: &BTreeMap<String, DateTime<Utc>>) -> String {
    let mut best: Option<(&String, &DateTime<Utc>)> = None;
    for (username, last_seen) in co_editors {
        match best {
            Some((_, best_seen)) if last_seen <= best_seen => {}
            _ => best = Some((username, last_seen)),
        }
    }
    best.map(|(username, _)| username.clone())
        .unwrap_or_default()
}

/// Production scanner: walks the process table and keeps the processes that
/// hold the file open. Linux-only introspection via /proc; other platforms
/// degrade to an empty snapshot and rely on inactivity timeouts.
pub struct ProcScanner {
    system: sysinfo::System,
    users: sysinfo::Users,
}

impl ProcScanner {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
            users: sysinfo::Users::new_with_refreshed_list(),
        }
    }
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner for ProcScanner {
    #[cfg(target_os = "linux")]
    fn open_file_snapshot(&mut self, file_path: &str) -> Vec<ObservedEditor> {
        use sysinfo::{ProcessRefreshKind, RefreshKind, UpdateKind};

        self.system.refresh_specifics(
            RefreshKind::new()
                .with_processes(ProcessRefreshKind::new().with_user(UpdateKind::Always)),
        );

        let mut editors = Vec::new();
        for (pid, process) in self.system.processes() {
            let fd_dir = format!("/proc/{}/fd", pid.as_u32());
            let entries = match std::fs::read_dir(&fd_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let holds_file = entries.filter_map(|entry| entry.ok()).any(|entry| {
                std::fs::read_link(entry.path())
                    .map(|target| target.as_os_str() == std::ffi::OsStr::new(file_path))
                    .unwrap_or(false)
            });
            if !holds_file {
                continue;
            }

            let username = process
                .user_id()
                .and_then(|uid| self.users.get_user_by_id(uid))
                .map(|user| user.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            editors.push(ObservedEditor {
                pid: pid.as_u32(),
                process_name: process.name().to_string(),
                username,
            });
        }
        editors
    }

    #[cfg(not(target_os = "linux"))]
    fn open_file_snapshot(&mut self, _file_path: &str) -> Vec<ObservedEditor> {
        Vec::new()
    }

    #[cfg(unix)]
    fn file_owner(&mut self, file_path: &str) -> Option<String> {
        use std::os::unix::fs::MetadataExt;

        let metadata = std::fs::metadata(file_path).ok()?;
        let uid = sysinfo::Uid::try_from(metadata.uid() as usize).ok()?;
        self.users
            .get_user_by_id(&uid)
            .map(|user| user.name().to_string())
    }

    #[cfg(not(unix))]
    fn file_owner(&mut self, _file_path: &str) -> Option<String> {
        None
    }
}
