//! Admin interface (C10): a minimal TCP server exposing
//! `/status`, `/suspend`, `/isolate`, `/resume`, `/shutdown`. Per spec.md
//! §4.10, this component exists only for its interaction with the
//! supervisor — only enough of a request line is parsed to pull out the
//! path and an optional `password` query parameter; no general HTTP
//! server is built. Every response is `200 OK` followed by a short
//! plain-text body, matching §6's "Admin: ... 200 OK with a text body".

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::supervisor::{State, StatusReport, Supervisor};

/// Poll interval between non-blocking `accept` attempts: short enough that
/// a `Shutdown`/`Dead` transition is noticed promptly with no request ever
/// having to arrive, long enough to avoid spinning.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run the admin accept loop on `listener`. Polls rather than blocks in
/// `accept` so the loop rechecks supervisor state on a fixed cadence and
/// can exit on `Shutdown`/`Dead` even with no request ever arriving —
/// `main` moves the listener into this thread and retains no handle of its
/// own to close it from the outside.
pub fn run(listener: TcpListener, password: Option<String>, supervisor: Arc<Supervisor>) {
    supervisor.flow_threads.add_producer();
    if let Err(e) = listener.set_nonblocking(true) {
        warn!("admin listener failed to set non-blocking: {e}");
    }
    while !matches!(supervisor.state(), State::Shutdown | State::Dead) {
        match listener.accept() {
            Ok((stream, _)) => handle_connection(stream, password.as_deref(), &supervisor),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("admin accept error: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    supervisor.flow_threads.remove_producer();
}

fn handle_connection(mut stream: TcpStream, password: Option<&str>, supervisor: &Supervisor) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("admin connection clone failed: {e}");
            return;
        }
    });
    let mut line = String::new();
    if reader.read_line(&mut line).is_err() || line.is_empty() {
        return;
    }

    let response = dispatch(&line, password, supervisor);
    let _ = stream.write_all(response.as_bytes());
}

struct Request {
    path: String,
    password: Option<String>,
}

/// Parse a request line shaped like `GET /suspend?password=secret HTTP/1.0`.
/// Tolerant of a bare `/status` with no method or version, since the spec
/// only requires that path and query be recoverable.
fn parse_request_line(line: &str) -> Option<Request> {
    let line = line.trim();
    let target = line.split_whitespace().nth(1).unwrap_or(line);
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let password = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("password="))
        .map(|v| v.to_string());
    Some(Request {
        path: path.to_string(),
        password,
    })
}

fn dispatch(line: &str, expected_password: Option<&str>, supervisor: &Supervisor) -> String {
    let Some(req) = parse_request_line(line) else {
        return text_response("400 Bad Request", "malformed request");
    };
    debug!("admin request: {}", req.path);

    if matches!(supervisor.state(), State::Shutdown | State::Dead) {
        return text_response("503 Service Unavailable", "shutting down");
    }

    if let Some(expected) = expected_password {
        if req.password.as_deref() != Some(expected) {
            return text_response("403 Forbidden", "invalid or missing password");
        }
    }

    match req.path.as_str() {
        "/status" => text_response("200 OK", &format_status(&supervisor.status_report())),
        "/suspend" => {
            supervisor.suspend();
            info!("admin: suspended");
            text_response("200 OK", "suspended")
        }
        "/isolate" => {
            supervisor.isolate();
            info!("admin: isolated");
            text_response("200 OK", "isolated")
        }
        "/resume" => {
            supervisor.resume();
            info!("admin: resumed");
            text_response("200 OK", "running")
        }
        "/shutdown" => {
            supervisor.shutdown();
            info!("admin: shutdown requested");
            text_response("200 OK", "shutting down")
        }
        other => text_response("404 Not Found", &format!("unknown command '{other}'")),
    }
}

fn text_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.0 {status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn format_status(report: &StatusReport) -> String {
    format!(
        "state={:?} smscs={} smsboxes={} wapboxes={} incoming_sms={} incoming_wdp={} outgoing_sms={} outgoing_wdp={}",
        report.state,
        report.smsc_count,
        report.sms_box_count,
        report.wap_box_count,
        report.incoming_sms_len,
        report.incoming_wdp_len,
        report.outgoing_sms_len,
        report.outgoing_wdp_len,
    )
}
