//! Background check that restarts the log channel once the engine becomes
//! reachable again.

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::logs::LogStream;

const CONNECT_TIMEOUT_MS: u64 = 3_000;

/// TCP-level reachability; no protocol exchange.
pub async fn is_reachable(server: &ServerConfig) -> bool {
    let host = server.host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || server.port == 0 {
        return false;
    }
    let connect = timeout(
        Duration::from_millis(CONNECT_TIMEOUT_MS),
        TcpStream::connect((host, server.port)),
    )
    .await;
    matches!(connect, Ok(Ok(_)))
}

pub struct ReachabilityMonitor {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReachabilityMonitor {
    pub fn spawn(stream: LogStream, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(monitor(stream, interval, stop_rx));
        Self { stop_tx, join }
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

async fn monitor(stream: LogStream, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    // Start pessimistic so the first successful check counts as a recovery.
    let mut was_reachable = false;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        if let Some(server) = stream.server().await {
            let reachable = is_reachable(&server).await;
            if reachable && !was_reachable {
                debug!("engine {} reachable", server.identity());
                if stream.reconnect_if_down().await {
                    info!("engine {} back online, log stream restarted", server.identity());
                }
            }
            was_reachable = reachable;
        }
        tokio::select! {
            _ = stop_rx.changed() => {},
            _ = sleep(interval) => {},
        }
    }
}
