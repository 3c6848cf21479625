//! File classification: MAIN / TEMPORARY / IGNORE.
//!
//! The category decides whether a path participates in session tracking at
//! all. Classification is closed-world: anything that matches neither the
//! temporary heuristics nor the MAIN allow-list is ignored. Results are
//! cached per path; the cache is cleared wholesale past a size ceiling so it
//! can never grow without bound.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::config::ClassifyConfig;

const MAX_CACHE_ENTRIES: usize = 1000;

/// Tracked session formats: office, text, CAD, geo, archives, images.
const MAIN_EXTENSIONS: &[&str] = &[
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "rtf", "pdf", "txt", "md", "odt", "ods", "odp",
    "dwg", "dxf", "dgn", "rvt", "rfa", "rte", "sat", "ipt", "iam", "prt", "asm", "sldprt",
    "sldasm", "3dm", "skp", "max", "blend", "gpx", "kml", "kmz", "zip", "rar", "7z", "iso", "jpg",
    "jpeg", "png", "bmp", "tiff", "tif",
];

/// Static temporary suffixes: generic temp files, CAD backups and locks.
const TEMP_SUFFIXES: &[&str] = &[
    ".tmp", ".temp", ".crdownload", ".part", ".bak", ".dwl", ".dwl2", ".sv$", ".autosave",
    ".lock", ".lck",
];

/// Office save-pattern prefixes (`~$report.docx`, `~wrl0001.tmp`, ...).
const TEMP_PREFIXES: &[&str] = &["~$", "~wr", "~rf"];

const IGNORE_SUFFIXES: &[&str] = &[".log", ".cache", ".thumb", ".thumbs", ".tmp.metadata"];
const IGNORE_NAMES: &[&str] = &[".ds_store", "desktop.ini", "thumbs.db"];

// Hex-named transients are the save pattern of Office and several CAD tools:
// E3327DC9.tmp, C1EE4200, and friends.
static HEX_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)[0-9A-F]{4,16}(\.tmp|\.temp)?$").expect("hex temp regex"));
static OFFICE_SHUFFLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)~(wrl|wrd|rf)[0-9a-z]*\.tmp$").expect("office shuffle regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Main,
    Temporary,
    Ignore,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Main => "main",
            FileCategory::Temporary => "temporary",
            FileCategory::Ignore => "ignore",
        }
    }
}

pub struct FileClassifier {
    config: ClassifyConfig,
    cache: HashMap<String, FileCategory>,
}

impl FileClassifier {
    pub fn new(config: ClassifyConfig) -> Self {
        Self {
            config,
            cache: HashMap::new(),
        }
    }

    /// Categorize a path. Name-based only; no filesystem access.
    pub fn classify(&mut self, path: &str) -> FileCategory {
        if self.cache.len() > MAX_CACHE_ENTRIES {
            tracing::debug!(entries = self.cache.len(), "Clearing category cache");
            self.cache.clear();
        }
        if let Some(category) = self.cache.get(path) {
            return *category;
        }

        let category = self.classify_uncached(path);
        self.cache.insert(path.to_string(), category);
        category
    }

    fn classify_uncached(&self, path: &str) -> FileCategory {
        let filename = file_name(path);
        let lowered = filename.to_lowercase();

        if self.is_ignored_name(&lowered) || self.in_ignored_dir(path) {
            return FileCategory::Ignore;
        }
        if is_temporary_name(&filename) {
            return FileCategory::Temporary;
        }

        let extension = extension_of(&lowered);
        if self.config.ignore_extensions.iter().any(|e| {
            e.trim_start_matches('.').eq_ignore_ascii_case(&extension)
        }) {
            return FileCategory::Ignore;
        }
        if MAIN_EXTENSIONS.contains(&extension.as_str()) {
            return FileCategory::Main;
        }

        FileCategory::Ignore
    }

    /// Whether a MAIN-classified file should actually be monitored. Separate
    /// from `classify` because it touches the filesystem (size check) and is
    /// skipped for already-deleted paths.
    pub fn passes_main_checks(&self, path: &str) -> bool {
        let metadata = match fs_err::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return true,
        };
        if metadata.len() < self.config.min_file_bytes {
            tracing::debug!(path = %path, size = metadata.len(), "Ignoring undersized file");
            return false;
        }
        true
    }

    fn is_ignored_name(&self, lowered: &str) -> bool {
        if IGNORE_NAMES.contains(&lowered) {
            return true;
        }
        if IGNORE_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix)) {
            return true;
        }
        self.config
            .ignore_patterns
            .iter()
            .any(|pattern| matches_glob(lowered, &pattern.to_lowercase()))
    }

    fn in_ignored_dir(&self, path: &str) -> bool {
        if self.config.ignore_dirs.is_empty() {
            return false;
        }
        let lowered = path.to_lowercase();
        let components: Vec<&str> = lowered
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .collect();
        // The final component is the filename, not a directory.
        let dirs = &components[..components.len().saturating_sub(1)];
        self.config
            .ignore_dirs
            .iter()
            .any(|dir| dirs.contains(&dir.to_lowercase().as_str()))
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

/// Temporary-name heuristics, shared with hashing (temp files are never
/// fingerprinted) and the move classifier.
pub fn is_temporary_name(filename: &str) -> bool {
    let lowered = filename.to_lowercase();

    if TEMP_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
        return true;
    }
    if TEMP_SUFFIXES.iter().any(|suffix| lowered.ends_with(suffix)) {
        return true;
    }
    if HEX_NAME_RE.is_match(filename) || OFFICE_SHUFFLE_RE.is_match(&lowered) {
        return true;
    }

    // Extensionless all-caps 4-8 char names are the dominant Office/Windows
    // transient convention. Deliberate heuristic: user files matching it are
    // misclassified, and that trade is accepted.
    if !filename.contains('.')
        && (4..=8).contains(&filename.len())
        && filename.chars().all(|c| c.is_ascii_alphanumeric())
        && filename
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
    {
        return true;
    }

    false
}

fn file_name(path: &str) -> String {
    // Windows shares report backslash paths; Path::file_name alone would
    // keep the whole string on Unix hosts.
    let normalized = path.rsplit(['/', '\\']).next().unwrap_or(path);
    Path::new(normalized)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| normalized.to_string())
}

fn extension_of(lowered_filename: &str) -> String {
    match lowered_filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_string(),
        _ => String::new(),
    }
}

fn matches_glob(name: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return name.ends_with(suffix);
        }
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return name.starts_with(prefix);
        }
    }
    if pattern.contains('*') {
        let escaped = regex::escape(pattern).replace(r"\*", ".*");
        return Regex::new(&format!("^{}$", escaped))
            .map(|re| re.is_match(name))
            .unwrap_or(false);
    }
    name == pattern
}
