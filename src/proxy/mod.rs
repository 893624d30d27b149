//! Bidirectional UDP forwarding fabric.
//!
//! One local socket per direction accepts packet-forwarder traffic
//! and demultiplexes it into per-peer [`ProxyStream`]s held in LRU
//! maps, so memory stays bounded no matter how many gateways appear.
//! Every datagram is handed to the installed [`ProxyTap`] after being
//! forwarded; the tap never adds latency to the forwarding path.
//!
//! Local socket errors tear down both directions and re-bind after a
//! configurable pause, forever. Remote socket errors only evict the
//! affected stream, which is rebuilt on the peer's next datagram.

mod stream;

pub use stream::{ProxyStream, ProxyStreamConfig, ProxyStreamEvents};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lru::LruCache;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Observer invoked for every datagram crossing the proxy, in arrival
/// order per peer. Implementations must not block: they run on the
/// forwarding tasks.
pub trait ProxyTap: Send + Sync {
    /// Datagram from a local peer on the up socket
    fn up_local(&self, data: &[u8], peer: SocketAddr);
    /// Datagram from the upstream on an up stream
    fn up_remote(&self, data: &[u8], peer: SocketAddr);
    /// Datagram from a local peer on the dn socket
    fn dn_local(&self, data: &[u8], peer: SocketAddr);
    /// Datagram from the upstream on a dn stream
    fn dn_remote(&self, data: &[u8], peer: SocketAddr);
}

/// Addresses of the optional second (downlink) socket pair.
#[derive(Debug, Clone)]
pub struct DownlinkAddrs {
    pub listen_addr: SocketAddr,
    pub connect_addr: SocketAddr,
    pub bind_addr: Option<SocketAddr>,
}

pub struct UdpProxyConfig {
    pub up_listen_addr: SocketAddr,
    pub up_connect_addr: SocketAddr,
    pub up_connect_bind_addr: Option<SocketAddr>,
    /// When None the up socket carries both directions (single-port mode)
    pub dn: Option<DownlinkAddrs>,
    /// Per-datagram read buffer
    pub buffer_size: usize,
    /// LRU cap per direction
    pub socket_streams: usize,
    /// Pause between re-bind attempts after a local socket error
    pub reconnect_interval: Duration,
    /// Capture file receiving one "index:base64" line per datagram
    pub dump_file: Option<File>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Dn,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Dn => write!(f, "dn"),
        }
    }
}

struct ProxyState {
    /// Sockets are torn down (restart pending, or terminal shutdown)
    closed: bool,
    /// Terminal close requested, restarts must stop
    shutdown: bool,
    generation: CancellationToken,
    up_sock: Option<Arc<UdpSocket>>,
    dn_sock: Option<Arc<UdpSocket>>,
    up_local_addr: Option<SocketAddr>,
    dn_local_addr: Option<SocketAddr>,
    up_streams: LruCache<String, Arc<ProxyStream>>,
    dn_streams: LruCache<String, Arc<ProxyStream>>,
    /// Capture-file slot per local peer IP
    stream_ids: LruCache<String, usize>,
    last_stream_id: usize,
}

struct ProxyShared {
    up_listen_addr: SocketAddr,
    up_connect_addr: SocketAddr,
    up_connect_bind_addr: Option<SocketAddr>,
    dn: Option<DownlinkAddrs>,
    buffer_size: usize,
    reconnect_interval: Duration,
    dump_file: Option<Mutex<File>>,
    tap: OnceLock<Arc<dyn ProxyTap>>,
    tracker: TaskTracker,
    state: Mutex<ProxyState>,
}

/// The transparent relay: forwards datagrams unchanged in both
/// directions and taps them for the analytics side.
pub struct UdpProxy {
    shared: Arc<ProxyShared>,
}

impl UdpProxy {
    /// Bind the local sockets and start the reader tasks.
    pub async fn new(mut config: UdpProxyConfig) -> Result<Self> {
        let cap = NonZeroUsize::new(config.socket_streams.max(1)).unwrap_or(NonZeroUsize::MIN);
        let shared = Arc::new(ProxyShared {
            up_listen_addr: config.up_listen_addr,
            up_connect_addr: config.up_connect_addr,
            up_connect_bind_addr: config.up_connect_bind_addr,
            dn: config.dn.take(),
            buffer_size: config.buffer_size,
            reconnect_interval: config.reconnect_interval,
            dump_file: config.dump_file.take().map(Mutex::new),
            tap: OnceLock::new(),
            tracker: TaskTracker::new(),
            state: Mutex::new(ProxyState {
                closed: true,
                shutdown: false,
                generation: CancellationToken::new(),
                up_sock: None,
                dn_sock: None,
                up_local_addr: None,
                dn_local_addr: None,
                up_streams: LruCache::new(cap),
                dn_streams: LruCache::new(cap),
                stream_ids: LruCache::new(cap),
                last_stream_id: 0,
            }),
        });

        shared.bind_local().await?;
        Ok(Self { shared })
    }

    /// Install the datagram observer. Only the first call wins; the
    /// tap is not meant to be swapped after startup.
    pub fn set_tap(&self, tap: Arc<dyn ProxyTap>) {
        if self.shared.tap.set(tap).is_err() {
            warn!("Proxy tap is already installed, ignoring replacement");
        }
    }

    /// Local address of the up socket.
    pub fn up_local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().expect("proxy state lock poisoned").up_local_addr
    }

    /// Local address of the dn socket, if running in two-port mode.
    pub fn dn_local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().expect("proxy state lock poisoned").dn_local_addr
    }

    /// Stop forwarding: close both sockets, purge every stream and
    /// join the background tasks. Idempotent.
    pub async fn close(&self) {
        self.shared
            .state
            .lock()
            .expect("proxy state lock poisoned")
            .shutdown = true;
        self.shared.close_all();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }
}

impl ProxyShared {
    async fn bind_local(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().expect("proxy state lock poisoned");
            if state.shutdown {
                bail!("proxy is shut down");
            }
        }
        self.tracker.reopen();

        let up_sock = Arc::new(
            UdpSocket::bind(self.up_listen_addr)
                .await
                .with_context(|| format!("Could not bind to {} for UP", self.up_listen_addr))?,
        );
        let dn_sock = match &self.dn {
            Some(dn) => Some(Arc::new(UdpSocket::bind(dn.listen_addr).await.with_context(
                || format!("Could not bind to {} for DOWN", dn.listen_addr),
            )?)),
            None => None,
        };

        let generation = CancellationToken::new();
        {
            let mut state = self.state.lock().expect("proxy state lock poisoned");
            state.closed = false;
            state.generation = generation.clone();
            state.up_sock = Some(up_sock.clone());
            state.up_local_addr = up_sock.local_addr().ok();
            state.dn_sock = dn_sock.clone();
            state.dn_local_addr = dn_sock.as_ref().and_then(|s| s.local_addr().ok());
        }

        let this = self.clone();
        let up_generation = generation.clone();
        self.tracker.spawn(async move {
            this.reader_loop(up_sock, Direction::Up, up_generation).await;
        });
        info!("[up] Listening on {} for uplinks", self.up_listen_addr);

        match (&self.dn, dn_sock) {
            (Some(dn), Some(sock)) => {
                let this = self.clone();
                self.tracker.spawn(async move {
                    this.reader_loop(sock, Direction::Dn, generation).await;
                });
                info!("[dn] Listening on {} for downlinks", dn.listen_addr);
            }
            _ => {
                info!("[dn] Also listening on {} for downlinks", self.up_listen_addr);
            }
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().expect("proxy state lock poisoned").closed
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().expect("proxy state lock poisoned").shutdown
    }

    /// Tear down both sockets and every stream. The streams close
    /// synchronously; their reader tasks drain via the tracker.
    fn close_all(&self) {
        let mut state = self.state.lock().expect("proxy state lock poisoned");
        if state.closed {
            return;
        }
        state.closed = true;

        debug!("[up] Closing socket");
        state.up_sock = None;
        debug!("[dn] Closing socket");
        state.dn_sock = None;
        state.generation.cancel();

        debug!("[up] Purging {} streams", state.up_streams.len());
        while let Some((_, stream)) = state.up_streams.pop_lru() {
            stream.close();
        }
        debug!("[dn] Purging {} streams", state.dn_streams.len());
        while let Some((_, stream)) = state.dn_streams.pop_lru() {
            stream.close();
        }
    }

    /// Close everything and re-bind after the configured pause. Keeps
    /// retrying with the same pause until it succeeds; gives up only
    /// on terminal shutdown.
    fn schedule_restart(self: &Arc<Self>) {
        {
            let state = self.state.lock().expect("proxy state lock poisoned");
            if state.closed {
                return;
            }
        }

        info!(
            "Restarting sockets in {} seconds",
            self.reconnect_interval.as_secs()
        );
        self.close_all();

        let this = self.clone();
        tokio::spawn(async move {
            // We may be running inside one of the reader tasks, so the
            // join has to happen from a fresh task.
            this.tracker.close();
            this.tracker.wait().await;

            loop {
                if this.is_shutdown() {
                    return;
                }
                tokio::time::sleep(this.reconnect_interval).await;
                match this.bind_local().await {
                    Ok(()) => return,
                    Err(err) => warn!("Could not start local sockets: {err:#}"),
                }
            }
        });
    }

    fn write_dump(&self, index: usize, data: &[u8]) {
        let Some(file) = &self.dump_file else {
            return;
        };
        let line = format!("{}:{}\n", index, BASE64.encode(data));
        let mut file = file.lock().expect("dump file lock poisoned");
        if let Err(err) = file.write_all(line.as_bytes()) {
            warn!("Error writing to dump file: {}", err);
        } else {
            let _ = file.sync_data();
        }
    }

    fn remove_stream(&self, direction: Direction, key: &str) {
        let mut state = self.state.lock().expect("proxy state lock poisoned");
        let cache = match direction {
            Direction::Up => &mut state.up_streams,
            Direction::Dn => &mut state.dn_streams,
        };
        if let Some(stream) = cache.pop(key) {
            stream.close();
        }
    }

    /// Fetch or lazily create the stream owning `peer`'s conduit.
    /// Creating may evict the least-recently-used stream, which is
    /// closed on the spot.
    fn stream_for(
        self: &Arc<Self>,
        direction: Direction,
        peer: SocketAddr,
    ) -> Option<Arc<ProxyStream>> {
        let mut state = self.state.lock().expect("proxy state lock poisoned");
        if state.closed {
            return None;
        }

        let key = peer.to_string();
        {
            let cache = match direction {
                Direction::Up => &mut state.up_streams,
                Direction::Dn => &mut state.dn_streams,
            };
            if let Some(found) = cache.get(&key) {
                return Some(found.clone());
            }
        }

        // Allocate the capture-file slot for this peer's IP
        let ip_key = peer.ip().to_string();
        let slot = match state.stream_ids.get(&ip_key) {
            Some(slot) => *slot,
            None => {
                let slot = state.last_stream_id;
                state.last_stream_id += 1;
                state.stream_ids.push(ip_key, slot);
                slot
            }
        };

        let (local, remote_addr, remote_bind_addr) = match direction {
            Direction::Up => (
                state.up_sock.clone()?,
                self.up_connect_addr,
                self.up_connect_bind_addr,
            ),
            Direction::Dn => {
                let dn = self.dn.as_ref()?;
                (state.dn_sock.clone()?, dn.connect_addr, dn.bind_addr)
            }
        };

        let weak = Arc::downgrade(self);
        let events = ProxyStreamEvents {
            data_received: {
                let weak = weak.clone();
                Box::new(move |data, _rx_from| {
                    if let Some(shared) = weak.upgrade() {
                        shared.write_dump(slot * 2 + 1, data);
                        if let Some(tap) = shared.tap.get() {
                            match direction {
                                Direction::Up => tap.up_remote(data, peer),
                                Direction::Dn => tap.dn_remote(data, peer),
                            }
                        }
                    }
                })
            },
            local_error: {
                let weak = weak.clone();
                Box::new(move |_err| {
                    if let Some(shared) = weak.upgrade() {
                        shared.schedule_restart();
                    }
                })
            },
            remote_error: {
                let weak = weak.clone();
                let key = key.clone();
                Box::new(move |_err| {
                    if let Some(shared) = weak.upgrade() {
                        shared.remove_stream(direction, &key);
                    }
                })
            },
        };

        let stream = Arc::new(ProxyStream::new(
            ProxyStreamConfig {
                name: format!("{}:{}", direction, key),
                index: slot,
                buffer_size: self.buffer_size,
                local,
                local_reply_addr: peer,
                remote_addr,
                remote_bind_addr,
                events,
            },
            self.tracker.clone(),
        ));

        let cache = match direction {
            Direction::Up => &mut state.up_streams,
            Direction::Dn => &mut state.dn_streams,
        };
        if let Some((_, evicted)) = cache.push(key, stream.clone()) {
            if !Arc::ptr_eq(&evicted, &stream) {
                debug!("[{}] Stream evicted", evicted.name());
                evicted.close();
            }
        }

        Some(stream)
    }

    async fn reader_loop(
        self: Arc<Self>,
        sock: Arc<UdpSocket>,
        direction: Direction,
        generation: CancellationToken,
    ) {
        debug!("[{}] Started reader task", direction);
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let (n, peer) = tokio::select! {
                _ = generation.cancelled() => break,
                res = sock.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(err) => {
                        if self.is_closed() {
                            break;
                        }
                        error!("[{}] Unable to read from local socket: {}", direction, err);
                        self.schedule_restart();
                        break;
                    }
                },
            };
            let data = &buf[..n];

            let Some(stream) = self.stream_for(direction, peer) else {
                break;
            };
            self.write_dump(stream.index() * 2, data);

            if let Err(err) = stream.handle_local(data).await {
                // The datagram is lost; evict the stream so the next
                // one from this peer rebuilds it on a fresh socket
                warn!("[{}:{}] Could not write to remote: {}", direction, peer, err);
                debug!("[{}:{}] Evicting stream after forward error", direction, peer);
                self.remove_stream(direction, &peer.to_string());
                continue;
            }

            if let Some(tap) = self.tap.get() {
                match direction {
                    Direction::Up => tap.up_local(data, peer),
                    Direction::Dn => tap.dn_local(data, peer),
                }
            }
        }

        debug!("[{}] Reader task exited", direction);
    }
}
