//! Outbound event delivery to the central authority.
//!
//! At-least-once semantics: the ingestion path makes one bounded attempt and
//! never sleeps; anything undelivered lands in a JSON-persisted queue that
//! survives restarts and is flushed after any successful round-trip.
//! Between flushes the client backs off exponentially so an unreachable
//! authority costs one connect attempt per window, not per event.

use fs_err as fs;
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use edittrack_protocol::{
    EventEnvelope, Method, Request, Response, TrackerRegistration, MAX_REQUEST_BYTES,
    PROTOCOL_VERSION,
};

use crate::config::DeliveryConfig;

pub struct DeliveryClient {
    socket_path: PathBuf,
    queue_path: PathBuf,
    send_timeout: Duration,
    max_backoff: Duration,
    pending: Vec<EventEnvelope>,
    consecutive_failures: u32,
    next_flush_at: Option<Instant>,
}

impl DeliveryClient {
    pub fn new(socket_path: PathBuf, queue_path: PathBuf, config: &DeliveryConfig) -> Self {
        let pending = load_queue(&queue_path);
        if !pending.is_empty() {
            info!(count = pending.len(), "Loaded undelivered events from queue");
        }
        Self {
            socket_path,
            queue_path,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            pending,
            consecutive_failures: 0,
            next_flush_at: None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// One bounded attempt; queue on failure. Never blocks the event path
    /// beyond the socket timeout.
    pub fn submit(&mut self, envelope: EventEnvelope) -> bool {
        match self.send_event(&envelope) {
            Ok(()) => {
                self.record_success();
                self.flush_queued();
                true
            }
            Err(err) => {
                warn!(
                    error = %err,
                    event_id = %envelope.event_id,
                    event_type = ?envelope.event_type,
                    "Failed to deliver event, queueing"
                );
                self.record_failure();
                self.enqueue(envelope);
                false
            }
        }
    }

    /// Opportunistic queue flush, honoring the backoff window. Returns the
    /// number of events delivered.
    pub fn flush(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if let Some(next) = self.next_flush_at {
            if Instant::now() < next {
                return 0;
            }
        }
        self.flush_queued()
    }

    /// Shutdown drain: keep flushing, ignoring the backoff window, until
    /// the queue empties or the deadline passes. What remains stays
    /// persisted for the next start.
    pub fn drain(&mut self, deadline: Duration) -> bool {
        let started = Instant::now();
        while !self.pending.is_empty() && started.elapsed() < deadline {
            if self.flush_queued() == 0 {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
        let drained = self.pending.is_empty();
        if !drained {
            warn!(
                remaining = self.pending.len(),
                "Shutdown drain incomplete, events remain queued"
            );
        }
        drained
    }

    pub fn register(&mut self, registration: &TrackerRegistration) -> Result<(), String> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::RegisterTracker,
            id: Some(format!("register-{}", registration.tracker_id)),
            params: Some(
                serde_json::to_value(registration)
                    .map_err(|err| format!("Failed to serialize registration: {}", err))?,
            ),
        };
        let response = self.send_request(request)?;
        if response.ok {
            Ok(())
        } else {
            Err(response
                .error
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| "Unknown authority error".to_string()))
        }
    }

    /// Connectivity probe; a healthy authority triggers a queue flush.
    pub fn check_connection(&mut self) -> bool {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        };
        match self.send_request(request) {
            Ok(response) if response.ok => {
                self.record_success();
                self.flush_queued();
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!(error = %err, "Authority connectivity check failed");
                false
            }
        }
    }

    fn flush_queued(&mut self) -> usize {
        let mut delivered = 0;
        let mut interrupted = false;
        while let Some(envelope) = self.pending.first().cloned() {
            match self.send_event(&envelope) {
                Ok(()) => {
                    self.pending.remove(0);
                    delivered += 1;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        remaining = self.pending.len(),
                        "Queue flush interrupted"
                    );
                    self.record_failure();
                    interrupted = true;
                    break;
                }
            }
        }
        if delivered > 0 {
            info!(delivered, remaining = self.pending.len(), "Flushed queued events");
            self.persist();
        }
        if delivered > 0 && !interrupted {
            self.record_success();
        }
        delivered
    }

    fn send_event(&self, envelope: &EventEnvelope) -> Result<(), String> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::Event,
            // Reusing the event id keeps redelivery idempotent server-side.
            id: Some(envelope.event_id.clone()),
            params: Some(
                serde_json::to_value(envelope)
                    .map_err(|err| format!("Failed to serialize event: {}", err))?,
            ),
        };

        let response = self.send_request(request)?;
        if response.ok {
            Ok(())
        } else {
            Err(response
                .error
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| "Unknown authority error".to_string()))
        }
    }

    fn send_request(&self, request: Request) -> Result<Response, String> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|err| format!("Failed to connect to authority socket: {}", err))?;
        let _ = stream.set_read_timeout(Some(self.send_timeout));
        let _ = stream.set_write_timeout(Some(self.send_timeout));

        serde_json::to_writer(&mut stream, &request)
            .map_err(|err| format!("Failed to write request: {}", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| format!("Failed to flush request: {}", err))?;
        stream.flush().ok();

        read_response(&mut stream)
    }

    fn enqueue(&mut self, envelope: EventEnvelope) {
        self.pending.push(envelope);
        self.persist();
    }

    fn persist(&self) {
        if let Err(err) = save_queue(&self.queue_path, &self.pending) {
            warn!(error = %err, "Failed to persist event queue");
        }
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exponent = self.consecutive_failures.min(6);
        let backoff = Duration::from_secs(1u64 << exponent).min(self.max_backoff);
        self.next_flush_at = Some(Instant::now() + backoff);
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.next_flush_at = None;
    }
}

fn load_queue(path: &Path) -> Vec<EventEnvelope> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(error = %err, "Failed to read event queue");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(pending) => pending,
        Err(err) => {
            warn!(error = %err, "Failed to parse event queue, starting empty");
            Vec::new()
        }
    }
}

fn save_queue(path: &Path, pending: &[EventEnvelope]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create queue directory: {}", err))?;
    }
    let payload = serde_json::to_vec_pretty(pending)
        .map_err(|err| format!("Failed to serialize event queue: {}", err))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).map_err(|err| format!("Failed to write event queue: {}", err))?;
    fs::rename(&tmp_path, path).map_err(|err| format!("Failed to commit event queue: {}", err))?;
    Ok(())
}

pub fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err("Timed out waiting for authority response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Authority response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

/// Send a one-shot request to a daemon socket. Shared by the authority's
/// tracker-notification path and tests.
pub fn send_request_to(
    socket_path: &Path,
    method: Method,
    id: Option<String>,
    params: Option<Value>,
    timeout: Duration,
) -> Result<Response, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id,
        params,
    };
    let mut stream = UnixStream::connect(socket_path)
        .map_err(|err| format!("Failed to connect to socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}
