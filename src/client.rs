use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::heartbeat;
use crate::protocol::{self, opcode, AuthRequest, CommandRequest};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace before the auth request goes out, giving the server's dispatch
/// a beat to come up after the upgrade.
const AUTH_SEND_DELAY: Duration = Duration::from_millis(10);

/// Remote command failure: the exit code the process would have
/// surfaced, plus an optional protocol-level reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitError {
    pub exit_code: i32,
    pub message: String,
}

impl ExitError {
    fn new(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "exit code: {}", self.exit_code)
        } else {
            write!(f, "exit code: {}, message: {}", self.exit_code, self.message)
        }
    }
}

impl std::error::Error for ExitError {}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// In-memory sink used by [`Client::output`].
#[derive(Clone, Default)]
struct BufSink(Arc<Mutex<Vec<u8>>>);

impl BufSink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("buffer poisoned")).into_owned()
    }
}

impl Write for BufSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Client half of the protocol: dial, authenticate, then execute one or
/// more commands, streaming remote output into the configured sinks.
pub struct Client {
    cfg: ClientConfig,
    stdout: Sink,
    stderr: Sink,
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
    close_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<mpsc::UnboundedReceiver<i32>>,
    verdict_rx: Option<mpsc::UnboundedReceiver<Result<(), ExitError>>>,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            stdout: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
            stderr: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
            frames: None,
            close_tx: None,
            exit_rx: None,
            verdict_rx: None,
        }
    }

    /// Replace the output sinks; useful for capturing remote output.
    pub fn with_output(
        mut self,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        self.stdout = Arc::new(Mutex::new(stdout));
        self.stderr = Arc::new(Mutex::new(stderr));
        self
    }

    /// Dial the server and complete the auth handshake. Returns once the
    /// server's verdict arrives: `Ok` after AuthResponseSuccess, an
    /// [`ExitError`] after AuthResponseFailure, and a plain error when
    /// the connection dies first.
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        let url = self.cfg.server.clone();
        debug!("connecting to {url}");

        let stream = match timeout(DIAL_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status();
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                bail!("failed to connect at {url} (status: {status}, response: {body})");
            }
            Ok(Err(err)) => bail!("failed to connect at {url} (error: {err})"),
            Err(_) => bail!("failed to connect at {url} (timeout after {DIAL_TIMEOUT:?})"),
        };

        let (mut write, mut read) = stream.split();

        let (frames, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if write.send(to_message(frame)).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut close_rx => {
                        let _ = write.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit_rx) = mpsc::unbounded_channel::<i32>();
        let (verdict_tx, mut verdict_rx) = mpsc::unbounded_channel::<Result<(), ExitError>>();
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let data = match msg {
                    Ok(tungstenite::Message::Text(text)) => text.into_bytes(),
                    Ok(tungstenite::Message::Binary(data)) => data,
                    Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let (op, payload) = match protocol::decode(&data) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        debug!("dropping malformed frame: {err}");
                        continue;
                    }
                };
                match op {
                    opcode::COMMAND_STDOUT => write_sink(&stdout, payload),
                    opcode::COMMAND_STDERR => write_sink(&stderr, payload),
                    opcode::COMMAND_EXIT_CODE => {
                        if let Some(code) = payload.first() {
                            let _ = exit_tx.send(*code as i32);
                        }
                    }
                    opcode::AUTH_RESPONSE_SUCCESS => {
                        let _ = verdict_tx.send(Ok(()));
                    }
                    opcode::AUTH_RESPONSE_FAILURE => {
                        write_sink(&stderr, payload);
                        let _ = verdict_tx.send(Err(ExitError::new(
                            1,
                            String::from_utf8_lossy(payload).into_owned(),
                        )));
                    }
                    other => debug!("ignoring frame with opcode {other}"),
                }
            }
            // Covers abnormal close during the handshake; ignored once
            // the verdict has been consumed.
            let _ = verdict_tx.send(Err(ExitError::new(
                1,
                "connection closed before authentication completed",
            )));
        });

        self.frames = Some(frames.clone());
        self.close_tx = Some(close_tx);
        self.exit_rx = Some(exit_rx);

        heartbeat::spawn_ping_loop(frames.clone());

        sleep(AUTH_SEND_DELAY).await;
        let auth = AuthRequest {
            client_id: self.cfg.client_id.clone(),
            client_secret: self.cfg.client_secret.clone(),
        };
        let payload = serde_json::to_vec(&auth).context("failed to marshal auth request")?;
        frames
            .send(protocol::encode(opcode::AUTH_REQUEST, &payload))
            .map_err(|_| anyhow!("failed to send auth request: connection closed"))?;

        let verdict = verdict_rx
            .recv()
            .await
            .unwrap_or_else(|| Err(ExitError::new(1, "connection closed")));
        self.verdict_rx = Some(verdict_rx);

        verdict.map_err(Into::into)
    }

    /// Submit the command and wait for its exit code. The only local
    /// guard is the configured exec timeout; on expiry the error carries
    /// exit code 1 and "command exec timeout" has been written to the
    /// stderr sink.
    pub async fn exec(&mut self, command: &CommandRequest) -> Result<(), ExitError> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| ExitError::new(1, "not connected"))?;
        let payload = serde_json::to_vec(command)
            .map_err(|err| ExitError::new(1, format!("failed to marshal command request: {err}")))?;
        frames
            .send(protocol::encode(opcode::COMMAND, &payload))
            .map_err(|_| ExitError::new(1, "failed to send command request: connection closed"))?;

        let exec_timeout = self.cfg.exec_timeout;
        let stderr = self.stderr.clone();
        let exit_rx = self
            .exit_rx
            .as_mut()
            .ok_or_else(|| ExitError::new(1, "not connected"))?;

        let exit_code = tokio::select! {
            code = exit_rx.recv() => code.unwrap_or(1),
            _ = sleep(exec_timeout) => {
                write_sink(&stderr, b"command exec timeout\n");
                1
            }
        };

        if exit_code == 0 {
            Ok(())
        } else {
            Err(ExitError::new(exit_code, ""))
        }
    }

    /// Run the command and return its combined output, trimmed. The exit
    /// status is deliberately swallowed: callers that shell out for a
    /// value want whatever text came back, error or not.
    pub async fn output(&mut self, command: &CommandRequest) -> anyhow::Result<String> {
        let buffer = BufSink::default();
        *self.stdout.lock().expect("sink poisoned") = Box::new(buffer.clone());
        *self.stderr.lock().expect("sink poisoned") = Box::new(buffer.clone());

        if self.exec(command).await.is_err() {
            return Ok(buffer.contents().trim().to_string());
        }

        self.close();
        Ok(buffer.contents().trim().to_string())
    }

    /// URL of the server's interactive terminal endpoint.
    pub fn terminal_url(&self, path: Option<&str>) -> String {
        let terminal_path = match path {
            Some(path) if !path.is_empty() => path,
            _ => "/terminal",
        };
        match url::Url::parse(&self.cfg.server) {
            Ok(mut url) => {
                url.set_path(terminal_path);
                url.to_string()
            }
            Err(_) => String::new(),
        }
    }

    /// Close the transport. Idempotent; outstanding reads unblock with a
    /// close error on the server side.
    pub fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        self.frames = None;
    }
}

fn write_sink(sink: &Sink, data: &[u8]) {
    let mut sink = sink.lock().expect("sink poisoned");
    if let Err(err) = sink.write_all(data) {
        error!("failed to write remote output: {err}");
    }
    let _ = sink.flush();
}

/// Mirror of the server's framing: text frames whenever the payload is
/// valid UTF-8, binary otherwise.
fn to_message(frame: Vec<u8>) -> tungstenite::Message {
    match String::from_utf8(frame) {
        Ok(text) => tungstenite::Message::Text(text.into()),
        Err(err) => tungstenite::Message::Binary(err.into_bytes()),
    }
}
