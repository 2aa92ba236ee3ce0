//! Socket request framing and method dispatch.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use tracing::{debug, info, warn};

use lidguard_core::StateController;
use lidguard_daemon_protocol::{
    ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

pub fn handle_connection(mut stream: UnixStream, controller: &StateController) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = request.method.as_str(), id = ?request.id, "Daemon request received");
    let response = handle_request(request, controller);
    if let Err(err) = write_response(&mut stream, response) {
        debug!(error = %err, "Client went away before the response was written");
    }
}

pub fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
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
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
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

pub fn handle_request(request: Request, controller: &StateController) -> Response {
    if let Err(err) = request
        .check_version()
        .and_then(|()| request.check_params())
    {
        return Response::error_with_info(request.id, err);
    }

    match request.method {
        Method::Arm => {
            let status = controller.arm();
            to_response(request.id, &status)
        }
        Method::Stop => {
            let status = controller.stop();
            to_response(request.id, &status)
        }
        Method::Status => to_response(request.id, &controller.status()),
        Method::TestTrigger => {
            let outcome = controller.test_trigger();
            info!(success = outcome.success, reason = ?outcome.reason, "Test trigger");
            to_response(request.id, &outcome)
        }
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            match serde_json::to_value(controller.health()) {
                Ok(value) => data["controller"] = value,
                Err(err) => warn!(error = %err, "Failed to serialize controller health"),
            }
            Response::ok(request.id, data)
        }
    }
}

fn to_response<T: Serialize>(id: Option<String>, payload: &T) -> Response {
    match serde_json::to_value(payload) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

pub fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
