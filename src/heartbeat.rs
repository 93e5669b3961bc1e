//! Connection liveness: the client pings on a fixed period, the server
//! holds a receive-side deadline that every ping pushes forward. Both
//! sides run on tokio's monotonic clock.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::debug;

use crate::protocol::{self, opcode};

/// Period of the client's Ping frames.
pub const PING_PERIOD: Duration = Duration::from_secs(3);

/// Server-side idle deadline; a session with no Ping for this long is
/// disconnected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the client-side ping loop: one Ping frame every [`PING_PERIOD`]
/// until the wire channel closes.
pub fn spawn_ping_loop(frames: mpsc::UnboundedSender<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the ping cadence starts one
        // period after connect.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("ping");
            if frames.send(protocol::encode(opcode::PING, &[])).is_err() {
                debug!("ping loop ended: connection closed");
                break;
            }
        }
    })
}
