//! One forwarding conduit between a single local peer and the
//! upstream server.
//!
//! A stream owns the outbound "dialed" UDP socket for its peer, so
//! the upstream sees one source address per gateway. The first
//! datagram connects lazily; a reader task then pumps upstream
//! replies back to the peer through the shared local socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type DataReceivedFn = Box<dyn Fn(&[u8], SocketAddr) + Send + Sync>;
type SocketErrorFn = Box<dyn Fn(&io::Error) + Send + Sync>;

/// Hooks the owning proxy installs into a stream. They are invoked
/// from the stream's tasks, so they must not block.
pub struct ProxyStreamEvents {
    /// A datagram arrived from the upstream and was relayed to the peer
    pub data_received: DataReceivedFn,
    /// Writing to the shared local socket failed
    pub local_error: SocketErrorFn,
    /// The outbound socket failed
    pub remote_error: SocketErrorFn,
}

pub struct ProxyStreamConfig {
    /// Log name, e.g. "up:10.0.0.1:34567"
    pub name: String,
    /// Capture-file slot of the peer
    pub index: usize,
    /// Read buffer size for upstream replies
    pub buffer_size: usize,
    /// The local socket shared with the proxy, used for replies
    pub local: Arc<UdpSocket>,
    /// Where replies are sent: the local peer the stream belongs to
    pub local_reply_addr: SocketAddr,
    /// The upstream server
    pub remote_addr: SocketAddr,
    /// Interface to bind the outbound socket to
    pub remote_bind_addr: Option<SocketAddr>,
    pub events: ProxyStreamEvents,
}

#[derive(Default)]
struct StreamState {
    connected: bool,
    closed: bool,
    remote: Option<Arc<UdpSocket>>,
    /// Address the upstream last replied from, which may differ from
    /// the dialed one on asymmetric servers
    remote_reply_addr: Option<SocketAddr>,
}

pub struct ProxyStream {
    conf: ProxyStreamConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
    state: Mutex<StreamState>,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "trying to use a closed stream")
}

impl ProxyStream {
    /// Create an idle stream; the outbound socket is dialed on the
    /// first datagram. Reader tasks are spawned on `tracker`.
    pub fn new(conf: ProxyStreamConfig, tracker: TaskTracker) -> Self {
        Self {
            conf,
            tracker,
            cancel: CancellationToken::new(),
            state: Mutex::new(StreamState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn index(&self) -> usize {
        self.conf.index
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("stream state lock poisoned").closed
    }

    /// Address the upstream last replied from, if any.
    pub fn remote_reply_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .expect("stream state lock poisoned")
            .remote_reply_addr
    }

    /// Forward one datagram from the local peer to the upstream,
    /// dialing the outbound socket first if necessary.
    pub async fn handle_local(self: &Arc<Self>, data: &[u8]) -> io::Result<()> {
        let remote = {
            let state = self.state.lock().expect("stream state lock poisoned");
            if state.closed {
                return Err(closed_error());
            }
            state.remote.clone()
        };

        let remote = match remote {
            Some(remote) => remote,
            None => {
                debug!("[{}] Remote not connected, connecting now", self.conf.name);
                self.connect().await?
            }
        };

        debug!(
            "[{}] Sending {} bytes to {}",
            self.conf.name,
            data.len(),
            self.conf.remote_addr
        );

        if let Err(err) = remote.send(data).await {
            warn!(
                "[{}] Unable to write to remote ({}): {}",
                self.conf.name, self.conf.remote_addr, err
            );
            self.close();
            (self.conf.events.remote_error)(&err);
            return Err(err);
        }

        Ok(())
    }

    /// Close the stream and stop its reader task. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("stream state lock poisoned");
        if state.closed {
            return;
        }
        debug!("[{}] Closing stream", self.conf.name);
        state.closed = true;
        state.connected = false;
        state.remote = None;
        drop(state);
        self.cancel.cancel();
    }

    async fn connect(self: &Arc<Self>) -> io::Result<Arc<UdpSocket>> {
        let bind_addr = self
            .conf
            .remote_bind_addr
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

        debug!(
            "[{}] Dialing {} (from {})",
            self.conf.name, self.conf.remote_addr, bind_addr
        );

        let remote = UdpSocket::bind(bind_addr).await?;
        remote.connect(self.conf.remote_addr).await?;
        let remote = Arc::new(remote);

        {
            let mut state = self.state.lock().expect("stream state lock poisoned");
            if state.closed {
                return Err(closed_error());
            }
            if let Some(existing) = &state.remote {
                return Ok(existing.clone());
            }
            state.remote = Some(remote.clone());
            state.connected = true;
        }

        info!("[{}] Connected to {}", self.conf.name, self.conf.remote_addr);

        let this = self.clone();
        let reader_sock = remote.clone();
        self.tracker.spawn(async move {
            this.remote_to_local(reader_sock).await;
        });

        Ok(remote)
    }

    async fn remote_to_local(self: Arc<Self>, remote: Arc<UdpSocket>) {
        debug!("[{}] Reading task started", self.conf.name);
        let mut buf = vec![0u8; self.conf.buffer_size];

        loop {
            let (n, addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = remote.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(err) => {
                        if self.is_closed() {
                            break;
                        }
                        error!(
                            "[{}] Could not read from remote side: {}",
                            self.conf.name, err
                        );
                        self.close();
                        (self.conf.events.remote_error)(&err);
                        break;
                    }
                },
            };

            debug!("[{}] Received {} bytes from {}", self.conf.name, n, addr);

            // Once a reply arrives, remember the observed source so
            // asymmetric upstreams can still be tracked
            self.state
                .lock()
                .expect("stream state lock poisoned")
                .remote_reply_addr = Some(addr);

            match self
                .conf
                .local
                .send_to(&buf[..n], self.conf.local_reply_addr)
                .await
            {
                Err(err) => {
                    warn!(
                        "[{}] Unable to write to local ({}): {}",
                        self.conf.name, self.conf.local_reply_addr, err
                    );
                    self.close();
                    (self.conf.events.local_error)(&err);
                    break;
                }
                Ok(written) if written != n => {
                    // No retry, UDP does not fragment for us
                    warn!(
                        "[{}] Remote-to-local fragmentation ({} != {})",
                        self.conf.name, written, n
                    );
                }
                Ok(_) => {}
            }

            (self.conf.events.data_received)(&buf[..n], addr);
        }

        debug!("[{}] Reading task exited", self.conf.name);
    }
}
