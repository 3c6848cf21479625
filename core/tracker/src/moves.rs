//! Move/rename bookkeeping.
//!
//! A move is classified by the categories of its endpoints before any
//! session impact is decided. The tracker keeps two bounded maps: chain
//! links (every observed old -> new hop) and temp origins (where a MAIN
//! file went when it temporarily disappeared under a transient name, the
//! middle of an Office save shuffle). Together they let a later TEMP->MAIN
//! or IGNORE->MAIN hop find the session that actually owns the content.

use std::collections::HashMap;

use crate::classify::FileCategory;

const MAX_TRACKED_MOVES: usize = 512;
const MAX_CHAIN_HOPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    TempToTemp,
    MainToTemp,
    TempToMain,
    MainToMain,
    TempToIgnore,
    IgnoreToMain,
    /// Anything outside the table. Real-world save flows are observed
    /// empirically, not enumerable; the fallback must never drop a file
    /// silently.
    Other { dest_is_main: bool },
}

pub fn classify_move(old: FileCategory, new: FileCategory) -> MoveKind {
    match (old, new) {
        (FileCategory::Temporary, FileCategory::Temporary) => MoveKind::TempToTemp,
        (FileCategory::Main, FileCategory::Temporary) => MoveKind::MainToTemp,
        (FileCategory::Temporary, FileCategory::Main) => MoveKind::TempToMain,
        (FileCategory::Main, FileCategory::Main) => MoveKind::MainToMain,
        (FileCategory::Temporary, FileCategory::Ignore) => MoveKind::TempToIgnore,
        (FileCategory::Ignore, FileCategory::Main) => MoveKind::IgnoreToMain,
        (_, new) => MoveKind::Other {
            dest_is_main: new == FileCategory::Main,
        },
    }
}

#[derive(Default)]
pub struct MoveTracker {
    /// new_path -> old_path for every observed hop.
    links: HashMap<String, String>,
    /// temp_path -> originating MAIN path ("main gone temporary").
    temp_origins: HashMap<String, String>,
    /// Paths that were the source of a processed move; a trailing deleted
    /// event for them is rename fallout, not a real delete.
    move_sources: HashMap<String, String>,
}

impl MoveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_link(&mut self, old_path: &str, new_path: &str) {
        if self.links.len() > MAX_TRACKED_MOVES {
            tracing::debug!(entries = self.links.len(), "Clearing move-chain map");
            self.links.clear();
        }
        if self.move_sources.len() > MAX_TRACKED_MOVES {
            self.move_sources.clear();
        }
        self.links
            .insert(new_path.to_string(), old_path.to_string());
        self.move_sources
            .insert(old_path.to_string(), new_path.to_string());
    }

    pub fn record_temp_origin(&mut self, temp_path: &str, main_path: &str) {
        if self.temp_origins.len() > MAX_TRACKED_MOVES {
            tracing::debug!(entries = self.temp_origins.len(), "Clearing temp-origin map");
            self.temp_origins.clear();
        }
        self.temp_origins
            .insert(temp_path.to_string(), main_path.to_string());
    }

    pub fn was_move_source(&self, path: &str) -> bool {
        self.move_sources.contains_key(path)
    }

    pub fn was_move_target(&self, path: &str) -> bool {
        self.links.contains_key(path)
    }

    /// Candidate originating paths for a transfer, best first: the recorded
    /// temp origin, then every ancestor along the move chain. The caller
    /// probes each for an active session and falls back to a fresh session
    /// when none match.
    pub fn transfer_candidates(&self, old_path: &str) -> Vec<String> {
        let mut candidates = Vec::new();

        if let Some(origin) = self.temp_origins.get(old_path) {
            candidates.push(origin.clone());
        }

        let mut cursor = old_path;
        for _ in 0..MAX_CHAIN_HOPS {
            let Some(previous) = self.links.get(cursor) else {
                break;
            };
            if previous == old_path || candidates.contains(previous) {
                break;
            }
            // A chain hop that was itself a recorded temp origin points at
            // the real main file.
            if let Some(origin) = self.temp_origins.get(previous.as_str()) {
                if !candidates.contains(origin) {
                    candidates.push(origin.clone());
                }
            }
            candidates.push(previous.clone());
            cursor = previous;
        }

        candidates
    }

    /// Forget state tied to a path once its session question is settled.
    pub fn resolve(&mut self, path: &str) {
        self.temp_origins.remove(path);
        self.links.remove(path);
    }
}
