//! Content fingerprints for session open/close bookkeeping.
//!
//! Fingerprints are metadata, not integrity proofs: a cheap digest that
//! answers "did the bytes change between open and close". Large files get a
//! head/middle/tail partial digest under the configured ceiling so CAD
//! assemblies do not stall the event path.

use fs_err::File;
use std::io::{Read, Seek, SeekFrom};
use std::thread;
use std::time::Duration;

use crate::config::HashConfig;

const CHUNK_SIZE: usize = 64 * 1024;

pub struct HashCalculator {
    config: HashConfig,
}

impl HashCalculator {
    pub fn new(config: HashConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Fingerprint with bounded retry: files on a shared filesystem are
    /// routinely locked mid-save. Unreadable after retries means no
    /// fingerprint, not a failed event.
    pub fn fingerprint_with_retry(&self, file_path: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let attempts = self.config.retry_attempts.max(1);
        for attempt in 0..attempts {
            match self.fingerprint(file_path) {
                Ok(digest) => return Some(digest),
                Err(err) => {
                    tracing::debug!(
                        file_path = %file_path,
                        attempt = attempt + 1,
                        error = %err,
                        "Fingerprint attempt failed"
                    );
                    if attempt + 1 < attempts {
                        thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                    }
                }
            }
        }
        tracing::warn!(file_path = %file_path, "Giving up on fingerprint");
        None
    }

    fn fingerprint(&self, file_path: &str) -> Result<String, String> {
        let metadata = fs_err::metadata(file_path)
            .map_err(|err| format!("Failed to stat {}: {}", file_path, err))?;
        let ceiling = self.config.max_file_size_mb * 1024 * 1024;

        if metadata.len() > ceiling {
            partial_digest(file_path, metadata.len())
        } else {
            full_digest(file_path)
        }
    }
}

fn full_digest(file_path: &str) -> Result<String, String> {
    let mut file =
        File::open(file_path).map_err(|err| format!("Failed to open {}: {}", file_path, err))?;
    let mut context = md5::Context::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|err| format!("Failed to read {}: {}", file_path, err))?;
        if read == 0 {
            break;
        }
        context.consume(&chunk[..read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// Digest the first, middle and last 64KB. Size goes into the digest too so
/// a pure append is still visible.
fn partial_digest(file_path: &str, file_size: u64) -> Result<String, String> {
    let mut file =
        File::open(file_path).map_err(|err| format!("Failed to open {}: {}", file_path, err))?;
    let mut context = md5::Context::new();
    context.consume(file_size.to_le_bytes());

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let offsets = [
        0,
        file_size / 2,
        file_size.saturating_sub(CHUNK_SIZE as u64),
    ];
    for offset in offsets {
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| format!("Failed to seek {}: {}", file_path, err))?;
        let read = file
            .read(&mut chunk)
            .map_err(|err| format!("Failed to read {}: {}", file_path, err))?;
        context.consume(&chunk[..read]);
    }

    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn calculator(max_mb: u64) -> HashCalculator {
        HashCalculator::new(HashConfig {
            enabled: true,
            max_file_size_mb: max_mb,
            retry_attempts: 2,
            retry_delay_ms: 1,
        })
    }

    #[test]
    fn same_content_same_fingerprint() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path_a = dir.path().join("a.docx");
        let path_b = dir.path().join("b.docx");
        std::fs::write(&path_a, b"quarterly numbers").expect("write");
        std::fs::write(&path_b, b"quarterly numbers").expect("write");

        let calc = calculator(50);
        let digest_a = calc.fingerprint_with_retry(path_a.to_str().unwrap());
        let digest_b = calc.fingerprint_with_retry(path_b.to_str().unwrap());
        assert!(digest_a.is_some());
        assert_eq!(digest_a, digest_b);
    }

    #[test]
    fn changed_content_changes_fingerprint() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("a.docx");
        std::fs::write(&path, b"draft one").expect("write");
        let calc = calculator(50);
        let before = calc.fingerprint_with_retry(path.to_str().unwrap());

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(b" plus edits").expect("append");
        let after = calc.fingerprint_with_retry(path.to_str().unwrap());

        assert_ne!(before, after);
    }

    #[test]
    fn missing_file_yields_none() {
        let calc = calculator(50);
        assert!(calc
            .fingerprint_with_retry("/nonexistent/edittrack/file.docx")
            .is_none());
    }

    #[test]
    fn disabled_hashing_yields_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("a.docx");
        std::fs::write(&path, b"content").expect("write");

        let calc = HashCalculator::new(HashConfig {
            enabled: false,
            ..HashConfig::default()
        });
        assert!(calc.fingerprint_with_retry(path.to_str().unwrap()).is_none());
    }

    #[test]
    fn oversized_files_use_partial_digest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("big.iso");
        // 2MB of patterned data against a 1MB ceiling.
        let data: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).expect("write");

        let calc = calculator(1);
        let digest = calc.fingerprint_with_retry(path.to_str().unwrap());
        assert!(digest.is_some());

        let full = full_digest(path.to_str().unwrap()).expect("full digest");
        assert_ne!(digest.as_deref(), Some(full.as_str()));
    }
}
