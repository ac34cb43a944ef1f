//! WebSocket shell relay.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /shell`. The session token travels in the
//!    first `initialize` message, not in the upgrade request.
//! 2. All messages are JSON objects with a `"type"` field. An optional
//!    `"request_id"` on any incoming message is echoed on its response.
//! 3. `initialize` opens an exec channel into the session's pod. A second
//!    `initialize` replaces the first.
//! 4. When the remote shell ends the server closes the socket. When the
//!    client disconnects the exec channel is cancelled.
//!
//! ## Message types (client → server)
//!
//! | Type         | Fields                        | Response type(s)             |
//! |--------------|-------------------------------|------------------------------|
//! | `initialize` | `session_id`, `cols`, `rows`  | `initialized` or `error`     |
//! | `input`      | `data`                        | `acknowledged` if `request_id` given, `error` without a shell |
//! | `resize`     | `cols`, `rows`                | `acknowledged` or `error`    |
//!
//! ## Message types (server → client)
//!
//! | Type           | Key fields        |
//! |----------------|-------------------|
//! | `initialized`  | `session_id`      |
//! | `data`         | `data`            |
//! | `acknowledged` | -                 |
//! | `error`        | `code`, `message` |

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cluster::{find_pod_for_rank, ExecChannel, ExecEnd, ExecEvent, TerminalSize};
use crate::error::{Error, Result};
use crate::jobs::JobDirectory;
use crate::sessions::SessionType;
use crate::AppState;

/// Tries bash, zsh and fish in order, falling back to `/bin/sh`.
const SHELL_DISCOVERY: &str = "export TERM=xterm-256color; \
    if command -v bash >/dev/null 2>&1; then exec bash; \
    elif command -v zsh >/dev/null 2>&1; then exec zsh; \
    elif command -v fish >/dev/null 2>&1; then exec fish; \
    else exec /bin/sh; fi";

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Everything the socket writer can be asked to do.
#[derive(Debug)]
enum Outgoing {
    Json(Value),
    /// Send a close frame and stop writing.
    Close(&'static str),
}

/// Exec channel owned by one WebSocket connection.
struct ShellExec {
    stdin: mpsc::Sender<Vec<u8>>,
    resize: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
    forward: JoinHandle<()>,
}

impl ShellExec {
    fn close(self) {
        self.cancel.cancel();
        self.forward.abort();
    }
}

/// Reassembles UTF-8 characters split across output chunks.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode as much of `pending + chunk` as possible, keeping an incomplete
    /// trailing sequence for the next call. Invalid bytes become U+FFFD.
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    } else {
                        rest = after;
                        break;
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Whatever is left once the stream has ended.
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// `GET /shell`: WebSocket upgrade handler for the shell relay.
pub async fn shell_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| {
        let span = info_span!("shell", conn_id = %uuid::Uuid::new_v4());
        handle_shell(socket, state).instrument(span)
    })
}

fn with_request_id(mut msg: Value, request_id: Option<&str>) -> Value {
    if let Some(rid) = request_id {
        msg["request_id"] = json!(rid);
    }
    msg
}

fn error_message(code: &str, message: &str, request_id: Option<&str>) -> Value {
    with_request_id(
        json!({"type": "error", "code": code, "message": message}),
        request_id,
    )
}

#[allow(clippy::cast_possible_truncation)]
fn terminal_size(parsed: &Value) -> TerminalSize {
    let dim = |key: &str, default: u16| {
        parsed[key]
            .as_u64()
            .map_or(default, |v| v.min(u64::from(u16::MAX)) as u16)
    };
    TerminalSize {
        cols: dim("cols", DEFAULT_COLS),
        rows: dim("rows", DEFAULT_ROWS),
    }
}

/// Main WebSocket event loop for one shell connection.
///
/// Outgoing messages go through an mpsc channel so the exec output task can
/// write without holding the socket.
async fn handle_shell(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(256);

    let mut send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Json(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            error!("WS send: failed to serialize message: {e}");
                            continue;
                        }
                    };
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close(reason) => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut exec: Option<ShellExec> = None;
    info!("Shell client connected");

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx
                        .send(Outgoing::Json(error_message(
                            "INVALID_JSON",
                            "Failed to parse JSON message",
                            None,
                        )))
                        .await;
                    continue;
                };

                let msg_type = parsed["type"].as_str().unwrap_or("");
                let request_id = parsed["request_id"].as_str();

                match msg_type {
                    "initialize" => {
                        let session_id = parsed["session_id"].as_str().unwrap_or("");
                        let size = terminal_size(&parsed);
                        if let Some(previous) = exec.take() {
                            debug!("Replacing shell on re-initialize");
                            previous.close();
                        }
                        match initialize(&state, &tx, session_id, size, request_id).await {
                            Ok(opened) => exec = Some(opened),
                            Err(e) => {
                                warn!("Shell initialize failed: {e}");
                                let _ = tx
                                    .send(Outgoing::Json(error_message(
                                        e.code(),
                                        &e.to_string(),
                                        request_id,
                                    )))
                                    .await;
                            }
                        }
                    }
                    "input" => {
                        let Some(shell) = &exec else {
                            let _ = tx.send(Outgoing::Json(not_initialized(request_id))).await;
                            continue;
                        };
                        let data = parsed["data"].as_str().unwrap_or("");
                        if shell.stdin.send(data.as_bytes().to_vec()).await.is_err() {
                            let _ = tx.send(Outgoing::Json(shell_gone(request_id))).await;
                        } else if request_id.is_some() {
                            let _ = tx
                                .send(Outgoing::Json(with_request_id(
                                    json!({"type": "acknowledged"}),
                                    request_id,
                                )))
                                .await;
                        }
                    }
                    "resize" => {
                        let Some(shell) = &exec else {
                            let _ = tx.send(Outgoing::Json(not_initialized(request_id))).await;
                            continue;
                        };
                        let size = terminal_size(&parsed);
                        debug!(cols = size.cols, rows = size.rows, "Shell resize");
                        let reply = if shell.resize.send(size).await.is_err() {
                            shell_gone(request_id)
                        } else {
                            with_request_id(json!({"type": "acknowledged"}), request_id)
                        };
                        let _ = tx.send(Outgoing::Json(reply)).await;
                    }
                    other => {
                        let _ = tx
                            .send(Outgoing::Json(error_message(
                                "UNKNOWN_TYPE",
                                &format!("Unknown message type: {other}"),
                                request_id,
                            )))
                            .await;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    if let Some(shell) = exec.take() {
        shell.close();
    }
    send_task.abort();
    info!("Shell client disconnected");
}

fn not_initialized(request_id: Option<&str>) -> Value {
    error_message("NOT_FOUND", "No shell initialized on this connection", request_id)
}

fn shell_gone(request_id: Option<&str>) -> Value {
    error_message("NOT_FOUND", "Shell is no longer running", request_id)
}

/// Resolve the session, open an exec channel in its pod and start relaying.
async fn initialize(
    state: &AppState,
    tx: &mpsc::Sender<Outgoing>,
    session_id: &str,
    size: TerminalSize,
    request_id: Option<&str>,
) -> Result<ShellExec> {
    let target = state
        .sessions
        .resolve(session_id, SessionType::Shell)
        .await
        .ok_or_else(|| Error::not_found("Session not found"))?;
    let job = state
        .jobs
        .find_job(&target.job_id)
        .await
        .ok_or_else(|| Error::not_found(format!("Job {} not found", target.job_id)))?;
    let pod = find_pod_for_rank(
        state.cluster.as_ref(),
        job.namespace(&state.config.cluster.namespace),
        &state.config.cluster.workload_label,
        &job.workload,
        target.rank,
    )
    .await?;

    let command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        SHELL_DISCOVERY.to_string(),
    ];
    let ExecChannel {
        stdin,
        resize,
        output,
        cancel,
    } = state.cluster.exec(&pod, &command).await?;

    info!(
        job_id = %target.job_id,
        rank = target.rank,
        pod = %pod.name,
        cols = size.cols,
        rows = size.rows,
        "Shell initialized"
    );
    let _ = tx
        .send(Outgoing::Json(with_request_id(
            json!({"type": "initialized", "session_id": session_id}),
            request_id,
        )))
        .await;
    let _ = resize.send(size).await;

    let forward = tokio::spawn(forward_output(output, tx.clone(), cancel.clone()));
    Ok(ShellExec {
        stdin,
        resize,
        cancel,
        forward,
    })
}

/// Relay exec output as `data` messages, then close the socket when the
/// remote side ends. Ends silently when this connection cancelled the exec.
async fn forward_output(
    mut output: mpsc::Receiver<ExecEvent>,
    tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
) {
    let mut carry = Utf8Carry::default();
    let end = loop {
        match output.recv().await {
            Some(ExecEvent::Output(bytes)) => {
                let data = carry.push(&bytes);
                if data.is_empty() {
                    continue;
                }
                if tx
                    .send(Outgoing::Json(json!({"type": "data", "data": data})))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(ExecEvent::Ended(end)) => break end,
            None => break ExecEnd::Completed,
        }
    };

    if cancel.is_cancelled() {
        return;
    }

    let tail = carry.finish();
    if !tail.is_empty() {
        let _ = tx
            .send(Outgoing::Json(json!({"type": "data", "data": tail})))
            .await;
    }

    match end {
        ExecEnd::Completed => {
            info!("Shell exited");
            let _ = tx.send(Outgoing::Close("shell exited")).await;
        }
        ExecEnd::Cancelled | ExecEnd::NotFound => {
            info!("Shell ended ({end:?})");
            let _ = tx.send(Outgoing::Close("shell ended")).await;
        }
        ExecEnd::Failed(reason) => {
            warn!("Shell failed: {reason}");
            let _ = tx
                .send(Outgoing::Json(error_message("EXEC_FAILED", &reason, None)))
                .await;
            let _ = tx.send(Outgoing::Close("shell failed")).await;
        }
    }
}
