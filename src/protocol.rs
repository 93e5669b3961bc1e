use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Wire opcodes. Every frame is `[opcode] ++ payload`; the set is closed
/// and the values are stable. Never renumber them.
pub mod opcode {
    /// C→S: JSON [`CommandRequest`](super::CommandRequest) payload.
    pub const COMMAND: u8 = 0x00;
    /// C→S: empty payload, resets the server's idle deadline.
    pub const PING: u8 = 0x01;
    /// C→S: JSON [`AuthRequest`](super::AuthRequest) payload.
    pub const AUTH_REQUEST: u8 = 0x02;
    /// S→C: empty payload.
    pub const AUTH_RESPONSE_SUCCESS: u8 = 0x03;
    /// S→C: UTF-8 reason.
    pub const AUTH_RESPONSE_FAILURE: u8 = 0x04;
    /// S→C: raw stdout bytes.
    pub const COMMAND_STDOUT: u8 = 0x05;
    /// S→C: raw stderr bytes.
    pub const COMMAND_STDERR: u8 = 0x06;
    /// S→C: single exit byte. Exit codes are transmitted as one unsigned
    /// byte, so negative codes (signal death reports -1) wrap modulo 256;
    /// a client observing 255 should read it as "killed or -1".
    pub const COMMAND_EXIT_CODE: u8 = 0x07;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
}

/// Encode a frame: one opcode byte followed by the payload verbatim.
pub fn encode(op: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(op);
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into opcode and payload. An empty frame is malformed;
/// callers drop it with a debug log rather than killing the connection.
pub fn decode(frame: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    match frame.split_first() {
        Some((op, payload)) => Ok((*op, payload)),
        None => Err(FrameError::Empty),
    }
}

/// Credentials presented by a connecting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub client_id: String,
    pub client_secret: String,
}

/// One execution request. A session accepts at most one of these.
///
/// The containerization hints (`engine` and friends) are carried for
/// executors that understand them; the direct shell executor ignores them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Run id; defaults to the connection id when empty.
    #[serde(default)]
    pub id: String,
    /// Shell source to execute.
    pub script: String,
    /// Extra environment for the child, overridden by the server's own
    /// environment on conflict.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Absolute path overriding the server's workdir base for this run.
    #[serde(default)]
    pub workdirbase: String,
    /// OS user to drop to before exec.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub privileged: bool,
}
