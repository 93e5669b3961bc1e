use std::process::Stdio;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ServerConfig, TerminalConfig, DEFAULT_SHELL};
use crate::server::ServerState;

/// Interactive terminal endpoint, gated by the same credentials as the
/// command endpoint (basic auth, client id/secret as username/password).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_basic_auth(&state.cfg, &headers) {
        return denied;
    }
    ws.on_upgrade(move |socket| bridge(socket, state))
}

/// The gate is skipped entirely when auth is not configured.
fn check_basic_auth(cfg: &ServerConfig, headers: &HeaderMap) -> Result<(), Response> {
    if cfg.client_id.is_empty() && cfg.client_secret.is_empty() {
        return Ok(());
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());

    let authorized = presented
        .as_deref()
        .and_then(|credentials| credentials.split_once(':'))
        .map(|(user, pass)| user == cfg.client_id && pass == cfg.client_secret)
        .unwrap_or(false);

    if authorized {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"caas\"")],
        )
            .into_response())
    }
}

/// Pass-through to the terminal child: socket frames feed its stdin, its
/// stdout/stderr stream back as binary frames. The child dies with the
/// socket.
async fn bridge(socket: WebSocket, state: Arc<ServerState>) {
    let mut command = terminal_command(&state.cfg);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to spawn terminal shell: {err}");
            return;
        }
    };

    let mut stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => return,
    };
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    if !state.cfg.terminal.init_command.is_empty() {
        let init = format!("{}\n", state.cfg.terminal.init_command);
        if let Err(err) = stdin.write_all(init.as_bytes()).await {
            warn!("failed to write terminal init command: {err}");
        }
    }

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    if let Some(stdout) = stdout {
        tokio::spawn(copy_stream(stdout, out_tx.clone()));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(copy_stream(stderr, out_tx));
    }

    loop {
        tokio::select! {
            chunk = out_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if sender.send(Message::Binary(chunk)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!("terminal receive error: {err}");
                        break;
                    }
                };
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("terminal session ended, killing shell");
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn copy_stream(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    out: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if out.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// The direct driver execs the configured shell; a container driver
/// wraps it in an interactive `<engine> run` with the configured image.
fn terminal_command(cfg: &ServerConfig) -> Command {
    let TerminalConfig {
        shell,
        driver,
        driver_image,
        ..
    } = &cfg.terminal;

    let shell = if !shell.is_empty() {
        shell.as_str()
    } else if !cfg.shell.is_empty() {
        cfg.shell.as_str()
    } else {
        DEFAULT_SHELL
    };

    let mut command = if !driver.is_empty() && driver != "host" && !driver_image.is_empty() {
        let mut command = Command::new(driver);
        command.args(["run", "-i", "--rm", driver_image, shell]);
        command
    } else {
        Command::new(shell)
    };

    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}
