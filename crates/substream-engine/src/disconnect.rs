//! Disconnect Monitor - peer liveness of a streaming connection
//!
//! A client may vanish without closing its stream (crash, network partition,
//! killed process). Writes to such a connection can succeed for a long time,
//! so the session would keep its partitions while nobody reads them.
//!
//! ## How It Works
//!
//! 1. One monitor task per connection polls `ConnectionProbe::has_peer_gone()`
//!    every `disconnect_poll_interval`
//! 2. On the first positive answer it raises the connection's closed flag
//!    (a `watch<bool>`) and exits
//! 3. The session loop checks the flag between flush cycles and tears down:
//!    partitions released, uncommitted in-memory cursors discarded
//!
//! The monitor also exits when the session's shutdown flag is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Transport capability: has the peer gone away?
pub trait ConnectionProbe: Send + Sync {
    fn has_peer_gone(&self) -> bool;
}

/// Probe driven by hand (tests, in-process transports)
#[derive(Debug, Default)]
pub struct ManualConnectionProbe {
    gone: AtomicBool,
}

impl ManualConnectionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the peer vanishing
    pub fn disconnect(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }
}

impl ConnectionProbe for ManualConnectionProbe {
    fn has_peer_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }
}

/// Background poller of one connection
pub struct DisconnectMonitor {
    label: String,
    probe: std::sync::Arc<dyn ConnectionProbe>,
    interval: Duration,
    closed_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DisconnectMonitor {
    /// Create a monitor; the returned receiver observes the closed flag
    pub fn new(
        label: String,
        probe: std::sync::Arc<dyn ConnectionProbe>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<bool>) {
        let (closed_tx, closed_rx) = watch::channel(false);
        (
            Self {
                label,
                probe,
                interval,
                closed_tx,
                shutdown_rx,
            },
            closed_rx,
        )
    }

    /// Poll until the peer is gone or the session shuts down
    pub async fn run(mut self) {
        debug!(
            connection = %self.label,
            interval_ms = self.interval.as_millis() as u64,
            "Disconnect monitor started"
        );

        loop {
            if self.probe.has_peer_gone() {
                info!(connection = %self.label, "Peer disconnected");
                self.closed_tx.send_replace(true);
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = raised(&mut self.shutdown_rx) => break,
            }
        }

        debug!(connection = %self.label, "Disconnect monitor stopped");
    }
}

/// Resolve once the flag is `true`; never resolves if the sender is dropped
/// while the flag is still `false`.
pub(crate) async fn raised(flag: &mut watch::Receiver<bool>) {
    let closed = flag.wait_for(|raised| *raised).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_flag_raised_within_poll_interval() {
        let probe = Arc::new(ManualConnectionProbe::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, mut closed) = DisconnectMonitor::new(
            "conn-1".to_string(),
            probe.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        );
        let handle = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!*closed.borrow());

        probe.disconnect();
        tokio::time::timeout(Duration::from_millis(100), closed.changed())
            .await
            .expect("flag not raised in time")
            .unwrap();
        assert!(*closed.borrow());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let probe = Arc::new(ManualConnectionProbe::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (monitor, closed) = DisconnectMonitor::new(
            "conn-2".to_string(),
            probe,
            Duration::from_secs(60),
            shutdown_rx,
        );
        let handle = tokio::spawn(monitor.run());

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert!(!*closed.borrow());
    }
}
