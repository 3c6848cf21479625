//! edittrack tracker daemon entrypoint.
//!
//! A small single-writer service: a socket listener fed raw watch events by
//! an external watch service, strict request validation, the in-memory
//! session engine, and a durable outbound queue toward the central
//! authority. Authority-issued commands (close-session, comment-created,
//! active-session listing) arrive on the same socket.

use chrono::{DateTime, Utc};
use clap::Parser;
use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edittrack_protocol::{
    parse_close_command, parse_comment_notice, parse_watch_event, ErrorInfo, Method, Request,
    Response, TrackerRegistration, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

use edittrack_tracker::config::load_config;
use edittrack_tracker::delivery::DeliveryClient;
use edittrack_tracker::editors::ProcScanner;
use edittrack_tracker::events::EventPipeline;
use edittrack_tracker::sweep::spawn_sweeper;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const ACCEPT_POLL_MS: u64 = 100;

type SharedPipeline = Arc<Mutex<EventPipeline<ProcScanner>>>;
type SharedDelivery = Arc<Mutex<DeliveryClient>>;

#[derive(Parser, Debug)]
#[command(name = "edittrack-tracker", about = "Local edit-session tracker daemon")]
struct Args {
    /// Path to the tracker TOML config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the command socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the authority socket path.
    #[arg(long)]
    authority_socket: Option<PathBuf>,

    /// Override the tracker id reported to the authority.
    #[arg(long)]
    tracker_id: Option<String>,
}

fn main() {
    init_logging();
    let args = Args::parse();

    let mut config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load tracker config");
            std::process::exit(1);
        }
    };
    if let Some(socket) = args.socket {
        config.command_socket = Some(socket);
    }
    if let Some(socket) = args.authority_socket {
        config.delivery.authority_socket = Some(socket);
    }
    if let Some(tracker_id) = args.tracker_id {
        config.tracker_id = tracker_id;
    }

    let socket_path = match config.command_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve tracker socket path");
            std::process::exit(1);
        }
    };
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare tracker socket directory");
        std::process::exit(1);
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind tracker socket");
            std::process::exit(1);
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        error!(error = %err, "Failed to configure tracker socket");
        std::process::exit(1);
    }

    let (authority_socket, queue_path) =
        match (config.authority_socket_path(), config.queue_path()) {
            (Ok(socket), Ok(queue)) => (socket, queue),
            (Err(err), _) | (_, Err(err)) => {
                error!(error = %err, "Failed to resolve delivery paths");
                std::process::exit(1);
            }
        };

    info!(
        tracker_id = %config.tracker_id,
        socket = %socket_path.display(),
        authority = %authority_socket.display(),
        "Edittrack tracker started"
    );

    let mut delivery = DeliveryClient::new(authority_socket, queue_path, &config.delivery);
    let registration = TrackerRegistration {
        tracker_id: config.tracker_id.clone(),
        command_socket: socket_path.display().to_string(),
    };
    match delivery.register(&registration) {
        Ok(()) => info!("Registered with authority"),
        Err(err) => warn!(error = %err, "Authority registration failed, continuing offline"),
    }
    delivery.check_connection();

    let drain_deadline = Duration::from_secs(config.delivery.shutdown_drain_secs);
    let sweep_config = config.sweep.clone();
    let pipeline: SharedPipeline = Arc::new(Mutex::new(EventPipeline::new(
        &config,
        ProcScanner::new(),
    )));
    let delivery: SharedDelivery = Arc::new(Mutex::new(delivery));

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            warn!(error = %err, signal, "Failed to register signal handler");
        }
    }

    let sweeper = spawn_sweeper(
        Arc::clone(&pipeline),
        Arc::clone(&delivery),
        sweep_config,
        Arc::clone(&shutdown),
    );

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let pipeline = Arc::clone(&pipeline);
                let delivery = Arc::clone(&delivery);
                thread::spawn(move || handle_connection(stream, pipeline, delivery));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept tracker connection");
            }
        }
    }

    info!("Shutdown requested, draining");
    shutdown.store(true, Ordering::SeqCst);
    let _ = sweeper.join();

    // Final housekeeping, then a bounded attempt to deliver what is left.
    let final_envelopes = pipeline
        .lock()
        .map(|mut pipeline| pipeline.cleanup(Utc::now()))
        .unwrap_or_default();
    if let Ok(mut delivery) = delivery.lock() {
        for envelope in final_envelopes {
            delivery.submit(envelope);
        }
        delivery.drain(drain_deadline);
    }
    let _ = fs::remove_file(&socket_path);
    info!("Edittrack tracker stopped");
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

fn handle_connection(mut stream: UnixStream, pipeline: SharedPipeline, delivery: SharedDelivery) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Tracker request received");
    let response = handle_request(request, pipeline, delivery);
    let _ = write_response(&mut stream, response);
}

fn handle_request(request: Request, pipeline: SharedPipeline, delivery: SharedDelivery) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(pipeline) = pipeline.lock() {
                if let Ok(value) = serde_json::to_value(pipeline.stats_snapshot()) {
                    data["stats"] = value;
                }
            }
            if let Ok(delivery) = delivery.lock() {
                data["queued_events"] = serde_json::json!(delivery.pending_len());
            }
            Response::ok(request.id, data)
        }
        Method::WatchEvent => handle_watch_event(request, pipeline, delivery),
        Method::GetActiveSessions => {
            let snapshot = match pipeline.lock() {
                Ok(pipeline) => pipeline.active_snapshot(),
                Err(_) => {
                    return Response::error(request.id, "state_error", "tracker state unavailable")
                }
            };
            match serde_json::to_value(&snapshot) {
                Ok(value) => {
                    tracing::debug!(sessions = snapshot.len(), "Active sessions snapshot");
                    Response::ok(request.id, serde_json::json!({ "sessions": value }))
                }
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize sessions: {}", err),
                ),
            }
        }
        Method::GetStats => {
            let snapshot = match pipeline.lock() {
                Ok(pipeline) => pipeline.stats_snapshot(),
                Err(_) => {
                    return Response::error(request.id, "state_error", "tracker state unavailable")
                }
            };
            match serde_json::to_value(snapshot) {
                Ok(value) => Response::ok(request.id, value),
                Err(err) => Response::error(
                    request.id,
                    "serialization_error",
                    format!("Failed to serialize stats: {}", err),
                ),
            }
        }
        Method::CloseSession => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "command payload required")
                }
            };
            let command = match parse_close_command(params) {
                Ok(command) => command,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            let ended_at = command.ended_at.as_deref().and_then(parse_rfc3339);

            let closed = match pipeline.lock() {
                Ok(mut pipeline) => pipeline.handle_close_command(
                    &command.file_path,
                    &command.username,
                    ended_at,
                    Utc::now(),
                ),
                Err(_) => {
                    return Response::error(request.id, "state_error", "tracker state unavailable")
                }
            };

            match closed {
                Some(session) => {
                    info!(file_path = %command.file_path, session_id = %session.session_id, "Session closed by authority command");
                    Response::ok(
                        request.id,
                        serde_json::json!({"status": "closed", "session_id": session.session_id}),
                    )
                }
                None => Response::ok(request.id, serde_json::json!({"status": "already_closed"})),
            }
        }
        Method::CommentCreated => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(request.id, "invalid_params", "notice payload required")
                }
            };
            let notice = match parse_comment_notice(params) {
                Ok(notice) => notice,
                Err(err) => return Response::error_with_info(request.id, err),
            };

            let marked = match pipeline.lock() {
                Ok(mut pipeline) => {
                    pipeline.handle_comment_notice(&notice.file_path, &notice.username, Utc::now())
                }
                Err(_) => {
                    return Response::error(request.id, "state_error", "tracker state unavailable")
                }
            };

            info!(
                file_path = %notice.file_path,
                session_id = %notice.session_id,
                marked,
                "Comment notice processed"
            );
            Response::ok(request.id, serde_json::json!({"status": "processed", "marked": marked}))
        }
        _ => Response::error(request.id, "unsupported_method", "method not served here"),
    }
}

fn handle_watch_event(request: Request, pipeline: SharedPipeline, delivery: SharedDelivery) -> Response {
    let params = match request.params {
        Some(params) => params,
        None => return Response::error(request.id, "invalid_params", "event payload is required"),
    };
    let event = match parse_watch_event(params) {
        Ok(event) => event,
        Err(err) => return Response::error_with_info(request.id, err),
    };

    info!(
        kind = ?event.kind,
        path = %event.path,
        dest = ?event.dest_path,
        "Received watch event"
    );

    let envelopes = match pipeline.lock() {
        Ok(mut pipeline) => pipeline.handle_watch_event(&event, Utc::now()),
        Err(_) => return Response::error(request.id, "state_error", "tracker state unavailable"),
    };

    let emitted = envelopes.len();
    if let Ok(mut delivery) = delivery.lock() {
        for envelope in envelopes {
            delivery.submit(envelope);
        }
    }

    Response::ok(
        request.id,
        serde_json::json!({"accepted": true, "emitted": emitted}),
    )
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
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
        Some(index) => &buffer[..index],
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
