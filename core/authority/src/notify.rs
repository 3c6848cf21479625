//! Authority -> tracker command channel.
//!
//! Small one-shot client over the tracker's command socket: comment
//! notifications, centrally-ordered closes, and the active-session fetch
//! the orphan sweep runs on. All best-effort with short timeouts; a tracker
//! that cannot be reached is retried on the next sweep, never blocked on.

use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use edittrack_protocol::{
    ActiveSessionInfo, CloseSessionCommand, CommentNotice, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

pub fn notify_comment_created(
    socket: &Path,
    notice: &CommentNotice,
    timeout: Duration,
) -> Result<(), String> {
    let params = serde_json::to_value(notice)
        .map_err(|err| format!("Failed to serialize comment notice: {}", err))?;
    let response = send_request(
        socket,
        Method::CommentCreated,
        Some(format!("comment-{}", notice.session_id)),
        Some(params),
        timeout,
    )?;
    expect_ok(response)
}

pub fn send_close_session(
    socket: &Path,
    command: &CloseSessionCommand,
    timeout: Duration,
) -> Result<(), String> {
    let params = serde_json::to_value(command)
        .map_err(|err| format!("Failed to serialize close command: {}", err))?;
    let response = send_request(
        socket,
        Method::CloseSession,
        command.session_id.clone(),
        Some(params),
        timeout,
    )?;
    expect_ok(response)
}

pub fn fetch_active_sessions(
    socket: &Path,
    timeout: Duration,
) -> Result<Vec<ActiveSessionInfo>, String> {
    let response = send_request(socket, Method::GetActiveSessions, None, None, timeout)?;
    if !response.ok {
        return Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown tracker error".to_string()));
    }
    let data = response
        .data
        .ok_or_else(|| "Tracker response carried no data".to_string())?;
    let sessions = data
        .get("sessions")
        .cloned()
        .ok_or_else(|| "Tracker response missing sessions".to_string())?;
    serde_json::from_value(sessions)
        .map_err(|err| format!("Failed to parse tracker sessions: {}", err))
}

fn expect_ok(response: Response) -> Result<(), String> {
    if response.ok {
        Ok(())
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown tracker error".to_string()))
    }
}

fn send_request(
    socket: &Path,
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

    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("Failed to connect to tracker socket: {}", err))?;
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

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
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
                return Err("Timed out waiting for tracker response".to_string());
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
        return Err("Tracker response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn serve_once(listener: UnixListener, response: Response) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buffer = Vec::new();
                let mut chunk = [0u8; 1024];
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
                let mut payload = serde_json::to_vec(&response).expect("serialize");
                payload.push(b'\n');
                let _ = stream.write_all(&payload);
            }
        })
    }

    #[test]
    fn fetch_active_sessions_parses_listing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("tracker.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let listing = serde_json::json!({
            "sessions": [{
                "session_id": "session-1",
                "file_path": "/share/report.docx",
                "file_name": "report.docx",
                "username": "alice",
                "started_at": "2026-05-12T09:00:00+00:00",
                "last_activity": "2026-05-12T09:05:00+00:00",
                "resume_count": 0,
                "is_commented": false,
                "is_multi_user": false,
                "co_editors": []
            }]
        });
        let handle = serve_once(listener, Response::ok(None, listing));

        let sessions =
            fetch_active_sessions(&socket, Duration::from_millis(500)).expect("fetch");
        handle.join().expect("server");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "session-1");
    }

    #[test]
    fn unreachable_tracker_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("missing.sock");
        assert!(fetch_active_sessions(&socket, Duration::from_millis(100)).is_err());
    }

    #[test]
    fn tracker_error_response_propagates() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("tracker.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let handle = serve_once(listener, Response::error(None, "state_error", "down"));

        let notice = CommentNotice {
            session_id: "session-1".to_string(),
            file_path: "/share/report.docx".to_string(),
            username: "alice".to_string(),
        };
        let result = notify_comment_created(&socket, &notice, Duration::from_millis(500));
        handle.join().expect("server");
        assert!(result.is_err());
    }
}
