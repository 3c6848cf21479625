//! edittrack authority daemon entrypoint.
//!
//! The single source of truth for sessions: a socket listener with strict
//! request validation, a SQLite-backed session store with idempotent event
//! reconciliation, the comment surface, and the periodic cross-tracker
//! orphan sweep.

use chrono::Duration as ChronoDuration;
use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edittrack_protocol::{
    parse_comment, parse_event, parse_registration, ErrorInfo, Method, Request, Response,
    CHANGE_TYPES, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod config;
mod db;
mod notify;
mod reconcile;
mod state;
mod sync;

use config::{load_config, AuthorityConfig};
use db::Db;
use state::SharedState;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "edittrack-authority", about = "Central edit-session authority daemon")]
struct Args {
    /// Path to the authority TOML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listening socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load authority config");
            std::process::exit(1);
        }
    };
    if let Some(socket) = args.socket {
        config.socket = Some(socket);
    }
    if let Some(db_path) = args.db {
        config.db_path = Some(db_path);
    }

    let socket_path = match config.socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve authority socket path");
            std::process::exit(1);
        }
    };
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare authority socket directory");
        std::process::exit(1);
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind authority socket");
            std::process::exit(1);
        }
    };

    let db_path = match config.db_path_resolved() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve authority database path");
            std::process::exit(1);
        }
    };
    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize authority database");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Edittrack authority started");

    let shared_state = Arc::new(SharedState::new(db, &config));
    spawn_orphan_sweeper(Arc::clone(&shared_state), &config);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept authority connection");
            }
        }
    }
}

fn spawn_orphan_sweeper(state: Arc<SharedState>, config: &AuthorityConfig) {
    let interval = Duration::from_secs(config.sync.interval_secs.max(1));
    let grace = ChronoDuration::seconds(config.sync.grace_secs);
    let timeout = Duration::from_millis(config.sync.tracker_timeout_ms);

    thread::spawn(move || loop {
        thread::sleep(interval);
        match sync::run_orphan_sweep(&state, grace, timeout) {
            Ok(summary) => {
                tracing::debug!(
                    polled = summary.trackers_polled,
                    orphans = summary.orphans_closed,
                    "Periodic orphan sweep finished"
                );
            }
            Err(err) => {
                warn!(error = %err, "Periodic orphan sweep failed");
            }
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("EDITTRACK_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Authority request received");
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => Response::ok(
            request.id,
            serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "change_types": CHANGE_TYPES,
            }),
        ),
        Method::RegisterTracker => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "registration required")
                }
            };
            let registration = match parse_registration(params) {
                Ok(registration) => registration,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            match state.register_tracker(&registration) {
                Ok(()) => Response::ok(request.id, serde_json::json!({"registered": true})),
                Err(err) => Response::error(request.id, "storage_error", err),
            }
        }
        Method::Event => handle_event(request, state),
        Method::CreateComment => handle_create_comment(request, state),
        Method::GetSessions => match state.active_sessions_snapshot() {
            Ok(sessions) => {
                let count = sessions.len();
                match serde_json::to_value(&sessions) {
                    Ok(value) => {
                        tracing::debug!(sessions = count, "Active sessions snapshot");
                        Response::ok(request.id, serde_json::json!({ "sessions": value }))
                    }
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize sessions: {}", err),
                    ),
                }
            }
            Err(err) => Response::error(
                request.id,
                "sessions_error",
                format!("Failed to fetch sessions: {}", err),
            ),
        },
        Method::GetSessionsWithComments => match state.commented_sessions_snapshot() {
            Ok(sessions) => match serde_json::to_value(&sessions) {
                Ok(value) => Response::ok(request.id, serde_json::json!({ "sessions": value })),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize sessions: {}", err),
                ),
            },
            Err(err) => Response::error(
                request.id,
                "sessions_error",
                format!("Failed to fetch commented sessions: {}", err),
            ),
        },
        Method::GetComment => {
            let session_id = match string_param(&request.params, "session_id") {
                Some(session_id) => session_id,
                None => {
                    return Response::error(request.id, "invalid_params", "session_id is required")
                }
            };
            match state.comment_for_session(&session_id) {
                Ok(Some(details)) => match serde_json::to_value(&details) {
                    Ok(mut value) => {
                        if let Ok(events) = state.session_events(&session_id) {
                            let trail: Vec<_> = events
                                .into_iter()
                                .map(|(event_type, event_timestamp)| {
                                    serde_json::json!({
                                        "event_type": event_type,
                                        "event_timestamp": event_timestamp,
                                    })
                                })
                                .collect();
                            value["events"] = serde_json::json!(trail);
                        }
                        Response::ok(request.id, value)
                    }
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize session: {}", err),
                    ),
                },
                Ok(None) => Response::error(request.id, "session_not_found", "unknown session"),
                Err(err) => Response::error(
                    request.id,
                    "comment_error",
                    format!("Failed to fetch comment: {}", err),
                ),
            }
        }
        Method::GetCurrentEditors => {
            let file_path = match string_param(&request.params, "file_path") {
                Some(file_path) => file_path,
                None => {
                    return Response::error(request.id, "invalid_params", "file_path is required")
                }
            };
            match state.current_editors(&file_path) {
                Ok(Some(editors)) => match serde_json::to_value(&editors) {
                    Ok(value) => Response::ok(request.id, value),
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize editors: {}", err),
                    ),
                },
                Ok(None) => Response::error(request.id, "file_not_found", "unknown file"),
                Err(err) => Response::error(
                    request.id,
                    "editors_error",
                    format!("Failed to fetch editors: {}", err),
                ),
            }
        }
        Method::GetMultiUserFiles => match state.multi_user_files() {
            Ok(files) => match serde_json::to_value(&files) {
                Ok(value) => Response::ok(request.id, serde_json::json!({ "files": value })),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize files: {}", err),
                ),
            },
            Err(err) => Response::error(
                request.id,
                "files_error",
                format!("Failed to fetch multi-user files: {}", err),
            ),
        },
        Method::GetUserActivity => {
            let username = match string_param(&request.params, "username") {
                Some(username) => username,
                None => {
                    return Response::error(request.id, "invalid_params", "username is required")
                }
            };
            match state.user_activity(&username) {
                Ok(Some(activity)) => match serde_json::to_value(&activity) {
                    Ok(value) => Response::ok(request.id, value),
                    Err(err) => Response::error(
                        request.id,
                        "serialization_error",
                        format!("Failed to serialize activity: {}", err),
                    ),
                },
                Ok(None) => Response::error(request.id, "user_not_found", "unknown user"),
                Err(err) => Response::error(
                    request.id,
                    "activity_error",
                    format!("Failed to fetch activity: {}", err),
                ),
            }
        }
        _ => Response::error(request.id, "unsupported_method", "method not served here"),
    }
}

fn handle_event(request: Request, state: Arc<SharedState>) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };
    let event = match parse_event(params) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        event_type = ?event.event_type,
        file_path = %event.file_path,
        user_id = %event.user_id,
        session_id = ?event.session_id,
        tracker_id = %event.tracker_id,
        "Received event"
    );

    match state.apply_event(&event) {
        Ok(outcome) => Response::ok(
            request.id,
            serde_json::json!({
                "accepted": true,
                "action": outcome.action,
                "session_id": outcome.session_id,
            }),
        ),
        Err(err) => {
            warn!(error = %err, event_id = %event.event_id, "Failed to apply event");
            Response::error(request.id, "reconcile_error", err)
        }
    }
}

fn handle_create_comment(request: Request, state: Arc<SharedState>) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "comment payload is required"),
    };
    let comment = match parse_comment(params) {
        Ok(comment) => comment,
        Err(err) => return Response::error_with_info(request.id, err),
    };
    if !CHANGE_TYPES.contains(&comment.change_type.as_str()) {
        return Response::error(
            request.id,
            "invalid_change_type",
            format!("change_type must be one of {:?}", CHANGE_TYPES),
        );
    }

    let created = match state.create_comment(&comment) {
        Ok(created) => created,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    // Notify the originating tracker so the local session is retired too.
    // Best-effort: the sweep pushes a close later if this does not land.
    if let Some((tracker, notice)) = &created.notice {
        match notify::notify_comment_created(
            Path::new(&tracker.command_socket),
            notice,
            Duration::from_millis(1000),
        ) {
            Ok(()) => info!(
                tracker_id = %tracker.tracker_id,
                session_id = %notice.session_id,
                "Tracker notified of comment"
            ),
            Err(err) => warn!(
                tracker_id = %tracker.tracker_id,
                error = %err,
                "Failed to notify tracker of comment"
            ),
        }
    }

    match serde_json::to_value(&created.comment) {
        Ok(value) => Response::ok(request.id, value),
        Err(err) => Response::error(
            request.id,
            "serialization_error",
            format!("Failed to serialize comment: {}", err),
        ),
    }
}

fn string_param(params: &Option<serde_json::Value>, field: &str) -> Option<String> {
    params
        .as_ref()
        .and_then(|params| params.get(field))
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
