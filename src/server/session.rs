use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::heartbeat::IDLE_TIMEOUT;
use crate::protocol::{self, opcode, AuthRequest, CommandRequest};
use crate::server::executor::{self, RunEnd};
use crate::server::metadata::RunMetadata;
use crate::server::{FrameTx, ServerState};

/// Deadline before an unauthenticated session is dropped.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// What the dispatch of one inbound frame decided about the session.
enum Flow {
    Continue,
    Close,
}

/// Per-connection state machine. One task owns this: the read loop below
/// is the only place session state is touched, while command execution
/// and the wire writer run on their own tasks.
struct Session {
    id: String,
    state: Arc<ServerState>,
    frames: FrameTx,
    authenticated: bool,
    /// Set once the (single) command of this session has finished.
    stopped: bool,
    /// Live while a command is executing.
    exec: Option<JoinHandle<()>>,
    /// Dropped (or signalled) when the peer is gone; the executor kills
    /// the child and suppresses the exit frame.
    peer_gone: Option<watch::Sender<bool>>,
    auth_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
}

/// Drive one WebSocket connection to its end.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // All wire writes funnel through this channel so the executor's pump
    // tasks never touch the socket directly.
    let (frames, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sender.send(to_message(frame)).await.is_err() {
                break;
            }
        }
        debug!("session {writer_id}: writer ended");
    });

    let authenticated = state.auth.is_disabled();
    let now = Instant::now();
    let mut session = Session {
        id: id.clone(),
        state,
        frames,
        authenticated,
        stopped: false,
        exec: None,
        peer_gone: None,
        auth_deadline: Some(now + AUTH_TIMEOUT),
        heartbeat_deadline: Some(now + IDLE_TIMEOUT),
    };

    debug!("session {id}: connect (authenticated: {authenticated})");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("session {id}: closed by peer");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!("session {id}: receive error: {err}");
                        break;
                    }
                };
                match session.dispatch(&frame).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(err) => {
                        // Handler boundary: report, acknowledge, terminate.
                        error!("session {id}: handler error: {err:#}");
                        session.send_frame(opcode::COMMAND_STDERR,
                            format!("internal server error: {err}\n").as_bytes());
                        session.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
                        break;
                    }
                }
            }
            _ = deadline(session.auth_deadline), if session.auth_deadline.is_some() => {
                if !session.authenticated {
                    debug!("session {id}: authentication timeout");
                    break;
                }
                session.auth_deadline = None;
            }
            _ = deadline(session.heartbeat_deadline), if session.heartbeat_deadline.is_some() => {
                debug!("session {id}: heartbeat timeout");
                break;
            }
            res = join_exec(&mut session.exec), if session.exec.is_some() => {
                session.exec = None;
                session.stopped = true;
                // The one command of this session is done; idle pings are
                // no longer required of the peer.
                session.heartbeat_deadline = None;
                if let Err(err) = res {
                    error!("session {id}: execution task failed: {err}");
                    session.send_frame(opcode::COMMAND_STDERR,
                        format!("internal server error: {err}\n").as_bytes());
                    session.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
                    break;
                }
            }
        }
    }

    // Peer (or deadline) closed the session. If a command is still
    // running, its executor observes the peer-gone signal, kills the
    // child and sends no exit frame.
    if session.exec.is_some() && !session.stopped {
        info!("session {id}: closed mid-run, cancelling command");
    }
    if let Some(gone) = session.peer_gone.take() {
        let _ = gone.send(true);
    }
    drop(session);

    let _ = writer.await;
    debug!("session {id}: disconnect");
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_exec(exec: &mut Option<JoinHandle<()>>) -> Result<(), tokio::task::JoinError> {
    match exec {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn dispatch(&mut self, frame: &[u8]) -> anyhow::Result<Flow> {
        let (op, payload) = match protocol::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("session {}: dropping malformed frame: {err}", self.id);
                return Ok(Flow::Continue);
            }
        };

        match op {
            opcode::PING => {
                debug!("session {}: ping", self.id);
                if self.heartbeat_deadline.is_some() {
                    self.heartbeat_deadline = Some(Instant::now() + IDLE_TIMEOUT);
                }
                Ok(Flow::Continue)
            }
            opcode::AUTH_REQUEST => self.handle_auth(payload).await,
            opcode::COMMAND => self.handle_command(payload),
            other => {
                error!("session {}: unknown message type: {other}", self.id);
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_auth(&mut self, payload: &[u8]) -> anyhow::Result<Flow> {
        info!("session {}: auth request", self.id);
        let request: AuthRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                error!("session {}: failed to unmarshal auth request: {err}", self.id);
                return Ok(Flow::Continue);
            }
        };

        self.auth_deadline = None;

        match self
            .state
            .auth
            .authenticate(&request.client_id, &request.client_secret)
            .await
        {
            Ok(()) => {
                self.authenticated = true;
                info!("session {}: authenticated", self.id);
                self.send_frame(opcode::AUTH_RESPONSE_SUCCESS, &[]);
                Ok(Flow::Continue)
            }
            Err(err) => {
                error!("session {}: failed to authenticate: {err}", self.id);
                self.send_frame(
                    opcode::AUTH_RESPONSE_FAILURE,
                    format!("failed to authenticate: {err}\n").as_bytes(),
                );
                self.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
                Ok(Flow::Close)
            }
        }
    }

    fn handle_command(&mut self, payload: &[u8]) -> anyhow::Result<Flow> {
        if !self.authenticated {
            error!("session {}: not authenticated", self.id);
            self.send_frame(opcode::COMMAND_STDERR, b"not authenticated\n");
            self.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
            return Ok(Flow::Close);
        }

        // One command per session; a second frame is a protocol error.
        if self.exec.is_some() || self.stopped {
            error!("session {}: command rejected, session already executed one", self.id);
            self.send_frame(opcode::COMMAND_STDERR, b"command already executed\n");
            self.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
            return Ok(Flow::Close);
        }

        let request: CommandRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                error!("session {}: failed to unmarshal command request: {err}", self.id);
                self.send_frame(opcode::COMMAND_STDERR, b"invalid command request\n");
                self.send_frame(opcode::COMMAND_EXIT_CODE, &[1]);
                return Ok(Flow::Continue);
            }
        };

        let run_id = if request.id.is_empty() {
            self.id.clone()
        } else {
            request.id.clone()
        };

        let cfg = &self.state.cfg;
        let meta = Arc::new(RunMetadata::prepare(
            &cfg.metadata_dir,
            &cfg.work_dir,
            &request.workdirbase,
            &run_id,
        )?);

        let (gone_tx, gone_rx) = watch::channel(false);
        self.peer_gone = Some(gone_tx);

        let state = self.state.clone();
        let frames = self.frames.clone();
        let session_id = self.id.clone();
        self.exec = Some(tokio::spawn(async move {
            run_to_completion(state, request, meta, frames, gone_rx, session_id).await;
        }));

        Ok(Flow::Continue)
    }

    fn send_frame(&self, op: u8, payload: &[u8]) {
        if self.frames.send(protocol::encode(op, payload)).is_err() {
            debug!("session {}: write after close dropped", self.id);
        }
    }
}

/// Execution task: run the command, then emit the verdict frames and
/// final metadata. Detached from the read loop so the connection keeps
/// observing pings and close while the child runs.
async fn run_to_completion(
    state: Arc<ServerState>,
    request: CommandRequest,
    meta: Arc<RunMetadata>,
    frames: FrameTx,
    peer_gone: watch::Receiver<bool>,
    session_id: String,
) {
    let cfg = &state.cfg;
    let send = |op: u8, payload: &[u8]| {
        let _ = frames.send(protocol::encode(op, payload));
    };

    match executor::execute(cfg, &request, &meta, &frames, peer_gone).await {
        Ok(RunEnd::Exited(0)) => {
            info!("session {session_id}: command succeeded: {}", request.script);
            send(opcode::COMMAND_EXIT_CODE, &[0]);
            if cfg.auto_clean_workdir {
                info!("session {session_id}: cleaning work dir {}", meta.work_dir.display());
                meta.clean_work_dir();
            }
            meta.record_success();
        }
        Ok(RunEnd::Exited(code)) => {
            error!(
                "session {session_id}: command failed: {} (exit code: {code})",
                request.script
            );
            meta.record_failure(&format!("exit status: {code}"));
            send(opcode::COMMAND_EXIT_CODE, &[code as u8]);
        }
        Ok(RunEnd::TimedOut) => {
            error!(
                "session {session_id}: command timed out after {}s: {}",
                cfg.timeout, request.script
            );
            meta.record_failure(&format!("command timed out after {}s", cfg.timeout));
            // Signal death carries no code; the wire byte mirrors -1.
            send(opcode::COMMAND_EXIT_CODE, &[(-1i32) as u8]);
        }
        Ok(RunEnd::KilledByPeerGone) => {
            // The peer already knows by connection loss: no exit frame,
            // no failure metadata.
            info!("session {session_id}: command killed by disconnect: {}", request.script);
        }
        Err(err) => {
            error!("session {session_id}: failed to run command: {err}");
            meta.record_failure(&err.to_string());
            send(
                opcode::COMMAND_STDERR,
                format!("internal server error: {err}\n").as_bytes(),
            );
            send(opcode::COMMAND_EXIT_CODE, &[1]);
        }
    }
}

/// Frames travel as text frames; a chunk of child output that is not
/// valid UTF-8 falls back to a binary frame with identical bytes.
fn to_message(frame: Vec<u8>) -> Message {
    match String::from_utf8(frame) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}
