use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::raft::node::RaftMessage;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Periodic heartbeat trigger for a leader.
///
/// Sends [`RaftMessage::Heartbeat`] tagged with the leader's epoch every
/// `interval` until cancelled or dropped.
#[derive(Debug)]
pub struct HeartbeatTimer {
    token: CancellationToken,
}

impl HeartbeatTimer {
    pub fn start(interval: Duration, events: mpsc::Sender<RaftMessage>, epoch: u64) -> Self {
        let token = CancellationToken::new();
        let alive = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = alive.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if alive.is_cancelled() {
                            break;
                        }
                        if events.send(RaftMessage::Heartbeat { epoch }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
