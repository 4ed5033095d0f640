//! Listener multiplexer.
//!
//! Binds one TCP listener per configured address and funnels accepted
//! connections into a single stream for the serve loop. Each sub-listener
//! runs its own accept task; cancelling the shared token stops every task
//! and drops the listeners, so new connections are refused at the TCP level.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACCEPT_BACKLOG: usize = 64;

/// Pause after a failed `accept`, so fd exhaustion does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct MultiListener {
    rx: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addrs: Vec<SocketAddr>,
}

impl MultiListener {
    /// Binds every address, collecting per-address failures.
    ///
    /// Returns `None` for the listener when no address could be bound. Accept
    /// tasks run until `cancel` fires.
    pub(crate) async fn bind(
        addrs: &[SocketAddr],
        cancel: CancellationToken,
    ) -> (Option<Self>, Vec<(SocketAddr, std::io::Error)>) {
        let mut listeners = Vec::new();
        let mut failures = Vec::new();

        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => listeners.push(listener),
                Err(err) => failures.push((*addr, err)),
            }
        }

        if listeners.is_empty() {
            return (None, failures);
        }

        let local_addrs = listeners.iter().filter_map(|l| l.local_addr().ok()).collect();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        for listener in listeners {
            tokio::spawn(accept_loop(listener, tx.clone(), cancel.clone()));
        }

        (Some(Self { rx, local_addrs }), failures)
    }

    /// Addresses actually bound, with ephemeral ports resolved.
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Next accepted connection, or `None` once every accept task stopped.
    pub(crate) async fn accept(&mut self) -> Option<(TcpStream, SocketAddr)> {
        self.rx.recv().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<(TcpStream, SocketAddr)>,
    cancel: CancellationToken,
) {
    let addr = listener.local_addr().ok();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(?addr, "listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    if tx.send(conn).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?addr, error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_what_it_can_and_reports_the_rest() {
        // Occupy a port so one of the two binds fails.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let occupied_addr = occupied.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let addrs = [occupied_addr, "127.0.0.1:0".parse().unwrap()];
        let (listener, failures) = MultiListener::bind(&addrs, cancel.clone()).await;

        let listener = listener.expect("one address should bind");
        assert_eq!(listener.local_addrs().len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, occupied_addr);

        cancel.cancel();
    }

    #[tokio::test]
    async fn accepted_connections_flow_through() {
        let cancel = CancellationToken::new();
        let addrs = ["127.0.0.1:0".parse().unwrap()];
        let (listener, failures) = MultiListener::bind(&addrs, cancel.clone()).await;
        let mut listener = listener.unwrap();
        assert!(failures.is_empty());

        let addr = listener.local_addrs()[0];
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });

        let (_stream, peer) = listener.accept().await.expect("connection should arrive");
        assert!(client.await.unwrap().is_ok());
        assert_eq!(peer.ip(), addr.ip());

        // After cancellation the accept stream ends.
        cancel.cancel();
        assert!(listener.accept().await.is_none());
    }
}
