pub mod admin;
pub mod connection;
pub mod handler;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::Broker;
use crate::config::{BrokerConfig, QueueKind};
use crate::error::Result;
use crate::queue::{FileQueue, QueueAdapter};

/// Opcodes delivered to the server loop by connection handlers. This is the
/// wakeup channel of the broker: administrative shutdown requests travel
/// here rather than being acted on inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Shutdown,
    ShutdownGraceful,
}

pub struct Server {
    config: BrokerConfig,
    broker: Arc<Mutex<Broker>>,
    listeners: Vec<TcpListener>,
}

impl Server {
    /// Build the broker, install the configured queue adapter, and replay
    /// persisted jobs. Adapter failures here are fatal.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let queue: Option<Arc<dyn QueueAdapter>> = match &config.queue {
            QueueKind::None => None,
            QueueKind::File(path) => Some(Arc::new(FileQueue::open(path)?)),
        };

        let mut broker = Broker::new(&config, queue);
        broker.replay_queue()?;

        Ok(Self {
            config,
            broker: Arc::new(Mutex::new(broker)),
            listeners: Vec::new(),
        })
    }

    pub fn broker(&self) -> Arc<Mutex<Broker>> {
        self.broker.clone()
    }

    /// Bind one listener per configured address. Must run inside the
    /// runtime. Separate from `run` so callers can learn the bound
    /// addresses before serving (port 0 picks a free port).
    pub fn bind(&mut self) -> Result<()> {
        for addr in self.config.listen.clone() {
            let listener = bind_listener(addr, self.config.backlog)?;
            tracing::info!(addr = %listener.local_addr()?, "Listening");
            self.listeners.push(listener);
        }
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    /// Serve until shutdown. Cancelling `shutdown` is an immediate
    /// shutdown; the administrative `shutdown [graceful]` command arrives
    /// through the control channel. Graceful stops accepting and waits for
    /// every assigned job to reach terminal status before closing
    /// connections.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if self.listeners.is_empty() {
            self.bind()?;
        }

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let accept_token = CancellationToken::new();
        let conn_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let next_conn = Arc::new(AtomicU64::new(1));

        for listener in self.listeners.drain(..) {
            tracker.spawn(accept_loop(
                listener,
                self.broker.clone(),
                control_tx.clone(),
                accept_token.clone(),
                conn_token.clone(),
                tracker.clone(),
                next_conn.clone(),
            ));
        }

        let graceful = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutting down");
                    break false;
                }
                event = control_rx.recv() => match event {
                    Some(ControlEvent::Shutdown) => {
                        tracing::info!("Shutdown requested");
                        break false;
                    }
                    Some(ControlEvent::ShutdownGraceful) => {
                        tracing::info!("Graceful shutdown requested");
                        break true;
                    }
                    // Unreachable while we hold control_tx.
                    None => break false,
                }
            }
        };

        accept_token.cancel();

        if graceful {
            let mut interval = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if self.broker.lock().await.running_jobs() == 0 {
                            break;
                        }
                    }
                    // A signal during the drain forces the immediate path.
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        conn_token.cancel();
        tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await;

        tracing::info!("Shutdown complete");
        Ok(())
    }
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    broker: Arc<Mutex<Broker>>,
    control: mpsc::UnboundedSender<ControlEvent>,
    accept_token: CancellationToken,
    conn_token: CancellationToken,
    tracker: TaskTracker,
    next_conn: Arc<AtomicU64>,
) {
    loop {
        let accepted = tokio::select! {
            _ = accept_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!(conn, error = %err, "Failed to set TCP_NODELAY");
                }
                tracing::debug!(conn, %peer, "Connection accepted");
                tracker.spawn(connection::run_connection(
                    broker.clone(),
                    control.clone(),
                    conn,
                    stream,
                    peer,
                    conn_token.clone(),
                ));
            }
            Err(err) => {
                tracing::error!(error = %err, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
