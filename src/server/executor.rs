use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, DEFAULT_SHELL};
use crate::protocol::{self, opcode, CommandRequest};
use crate::server::metadata::RunMetadata;
use crate::server::FrameTx;

const READ_CHUNK_SIZE: usize = 8192;

/// How a run ended. Peer-gone cancellation is the one outcome with no
/// wire acknowledgement: the connection is already dead.
#[derive(Debug, PartialEq, Eq)]
pub enum RunEnd {
    /// Child exited on its own; signal death maps to -1.
    Exited(i32),
    /// Killed because the connection closed mid-run.
    KilledByPeerGone,
    /// Killed by the server-side command deadline.
    TimedOut,
}

/// Run one command to completion: write the start-of-run metadata, spawn
/// the child with merged environment, fan its output out to the log and
/// the wire, and race completion against cancellation and the command
/// deadline.
///
/// All child output is drained onto the wire before the caller emits the
/// exit frame: both pump tasks are joined before this returns.
pub async fn execute(
    cfg: &ServerConfig,
    request: &CommandRequest,
    meta: &Arc<RunMetadata>,
    frames: &FrameTx,
    mut peer_gone: watch::Receiver<bool>,
) -> io::Result<RunEnd> {
    let env = merge_environment(cfg, request);
    let env_lines = env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    meta.record_start(&request.script, &env_lines);

    let script_file = ScriptFile::materialize(cfg, &request.script)?;
    let mut command = build_command(cfg, request, &meta.work_dir, &env, script_file.path())?;

    if !request.engine.is_empty() {
        debug!(
            "ignoring containerization hints (engine {}): direct shell executor",
            request.engine
        );
    }

    info!("starting command: {}", request.script);
    let mut child = command.spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        io::Error::other("stdout pipe was unexpectedly not available")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        io::Error::other("stderr pipe was unexpectedly not available")
    })?;

    let stdout_pump = tokio::spawn(pump(stdout, opcode::COMMAND_STDOUT, meta.clone(), frames.clone()));
    let stderr_pump = tokio::spawn(pump(stderr, opcode::COMMAND_STDERR, meta.clone(), frames.clone()));

    let end = tokio::select! {
        status = child.wait() => {
            let status = status?;
            RunEnd::Exited(status.code().unwrap_or(-1))
        }
        _ = peer_gone.changed() => {
            debug!("connection closed mid-run, killing child");
            kill_and_reap(&mut child).await;
            RunEnd::KilledByPeerGone
        }
        _ = command_deadline(cfg.timeout) => {
            warn!("command deadline ({}s) reached, killing child", cfg.timeout);
            kill_and_reap(&mut child).await;
            RunEnd::TimedOut
        }
    };

    // Drain remaining output before the exit frame goes out.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    Ok(end)
}

/// Pending forever when the deadline is disabled.
async fn command_deadline(timeout_secs: u64) {
    if timeout_secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(std::time::Duration::from_secs(timeout_secs)).await;
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!("failed to kill child: {err}");
    }
    let _ = child.wait().await;
}

/// Copy one child stream to the run log and the wire, chunk by chunk. A
/// closed wire channel stops the frames but never the log: the run's
/// on-disk record stays complete even after the peer is gone.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    flag: u8,
    meta: Arc<RunMetadata>,
    frames: FrameTx,
) {
    let mut wire_open = true;
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("child stream read ended: {err}");
                break;
            }
        };
        meta.append_log(&buf[..n]);
        if wire_open && frames.send(protocol::encode(flag, &buf[..n])).is_err() {
            debug!("wire closed, continuing log-only");
            wire_open = false;
        }
    }
}

/// Merged child environment in first-insertion order: a seed of the
/// server process's identity variables, then the request environment,
/// then the server environment. Later entries override in place, so the
/// server wins on conflict.
fn merge_environment(cfg: &ServerConfig, request: &CommandRequest) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut upsert = |key: &str, value: String| {
        if let Some(slot) = env.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            env.push((key.to_string(), value));
        }
    };

    for key in ["HOME", "USER", "LOGNAME"] {
        upsert(key, std::env::var(key).unwrap_or_default());
    }
    upsert("SHELL", cfg.shell.clone());
    for key in ["TERM", "PATH"] {
        upsert(key, std::env::var(key).unwrap_or_default());
    }

    for (k, v) in sorted(&request.environment) {
        upsert(k, v.clone());
    }
    for (k, v) in sorted(&cfg.environment) {
        upsert(k, v.clone());
    }

    env
}

fn sorted(map: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn build_command(
    cfg: &ServerConfig,
    request: &CommandRequest,
    work_dir: &std::path::Path,
    env: &[(String, String)],
    script_path: Option<&PathBuf>,
) -> io::Result<Command> {
    let mut command = Command::new(&cfg.shell);
    match script_path {
        None => {
            command.arg("-c").arg(&request.script);
        }
        Some(path) => {
            command.arg(path);
        }
    }

    command
        .current_dir(work_dir)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !request.user.is_empty() {
        drop_to_user(&mut command, &request.user)?;
    }

    Ok(command)
}

#[cfg(unix)]
fn drop_to_user(command: &mut Command, username: &str) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    let user = nix::unistd::User::from_name(username)
        .map_err(io::Error::other)?
        .ok_or_else(|| io::Error::other(format!("unknown user: {username}")))?;

    info!("running as user {username} (uid {} gid {})", user.uid, user.gid);
    command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
    command
        .env("USER", username)
        .env("HOME", &user.dir)
        .env("LOGNAME", username)
        .env("UID", user.uid.as_raw().to_string())
        .env("GID", user.gid.as_raw().to_string());
    Ok(())
}

#[cfg(not(unix))]
fn drop_to_user(_command: &mut Command, username: &str) -> io::Result<()> {
    Err(io::Error::other(format!(
        "running as user {username} is not supported on this platform"
    )))
}

/// Script delivery to the shell: the default shell takes the script as a
/// `-c` argument; any other shell gets it as a temp file positional
/// argument, removed when the run ends.
enum ScriptFile {
    Inline,
    File(PathBuf),
}

impl ScriptFile {
    fn materialize(cfg: &ServerConfig, script: &str) -> io::Result<Self> {
        if cfg.shell == DEFAULT_SHELL {
            return Ok(Self::Inline);
        }
        let path = std::env::temp_dir().join(format!("caas-script-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, script)?;
        Ok(Self::File(path))
    }

    fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Inline => None,
            Self::File(path) => Some(path),
        }
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if let Self::File(path) = self {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("failed to remove tmp script file: {err}");
            }
        }
    }
}
