//! Per-gateway metrics aggregation and periodic delivery.
//!
//! The forwarder implements the proxy tap: every datagram increments
//! the per-direction counters of its gateway's in-progress batch, and
//! decodable Semtech payloads are converted into uplink/downlink/stat
//! records. Batches are keyed by the local peer's IP and kept in an
//! LRU map with the same capacity as the proxy streams, so the two
//! stay in step. A ticker drains all batches; LRU eviction drains the
//! evicted batch on the spot.
//!
//! Delivery is lossy best-effort: a failed push is logged and the
//! data dropped. Nothing in here may fail the forwarding path.

use lru::LruCache;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::api::{AnalyticsInternalMetrics, AnalyticsMetrics};
use super::client::MetricsSink;
use super::convert;
use crate::proxy::{ProxyTap, UdpProxy};
use crate::semtech::{self, Envelope, PacketKind};

/// Pause between attempts to reach the collector at startup.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Settings the aggregation side cares about.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Batch cap; matches the proxy's per-direction stream cap
    pub max_udp_streams: usize,
    /// Seconds between flushes
    pub flush_interval: u64,
    /// Gateway name stamped on batches in edge mode
    pub gateway_id: String,
    /// Stat records carry gauge values
    pub gauge_stat: bool,
    /// Running in front of a server: batches are keyed per gateway IP
    /// and the gateway name comes from the traffic itself
    pub server_side: bool,
}

enum Counter {
    UpRx,
    UpTx,
    DnRx,
    DnTx,
}

/// Tap implementation feeding the analytics collector.
pub struct AnalyticsForwarder {
    settings: ForwarderSettings,
    sink: Arc<dyn MetricsSink>,
    proxy: Arc<UdpProxy>,
    frames: Mutex<LruCache<String, Arc<Mutex<AnalyticsMetrics>>>>,
    is_sending: AtomicBool,
}

fn has_frame_data(frame: &AnalyticsMetrics) -> bool {
    if !frame.uplinks.is_empty() || !frame.downlinks.is_empty() || !frame.stats.is_empty() {
        return true;
    }
    frame.metrics.as_ref().is_some_and(|m| {
        m.up_rx_packets > 0 || m.up_tx_packets > 0 || m.dn_rx_packets > 0 || m.dn_tx_packets > 0
    })
}

/// Clone the batch for sending and reset it in place, atomically with
/// respect to the tap callbacks.
fn snapshot_and_reset(frame: &Mutex<AnalyticsMetrics>) -> Option<AnalyticsMetrics> {
    let mut frame = frame.lock().expect("metrics frame lock poisoned");
    if !has_frame_data(&frame) {
        return None;
    }

    let snapshot = frame.clone();
    frame.uplinks.clear();
    frame.downlinks.clear();
    frame.stats.clear();
    if let Some(metrics) = frame.metrics.as_mut() {
        metrics.up_rx_packets = 0;
        metrics.up_tx_packets = 0;
        metrics.dn_rx_packets = 0;
        metrics.dn_tx_packets = 0;
        metrics.pkt_push_data = 0;
        metrics.pkt_push_ack = 0;
        metrics.pkt_pull_data = 0;
        metrics.pkt_pull_resp = 0;
        metrics.pkt_pull_ack = 0;
        metrics.pkt_tx_ack = 0;
    }
    Some(snapshot)
}

impl AnalyticsForwarder {
    pub fn new(
        settings: ForwarderSettings,
        sink: Arc<dyn MetricsSink>,
        proxy: Arc<UdpProxy>,
    ) -> Self {
        let cap = NonZeroUsize::new(settings.max_udp_streams.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            sink,
            proxy,
            frames: Mutex::new(LruCache::new(cap)),
            is_sending: AtomicBool::new(false),
        }
    }

    /// Connect to the collector (retrying forever), install the tap
    /// and run the flush ticker. Never returns.
    pub async fn start_and_wait(self: Arc<Self>) {
        loop {
            match self.sink.connect().await {
                Ok(()) => break,
                Err(err) => {
                    warn!("Could not connect to analytics endpoint: {err:#}");
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }

        info!("Connected to analytics endpoint");
        self.proxy.set_tap(self.clone());

        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.flush_interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if !self.is_sending.load(Ordering::Acquire) && self.has_data() {
                self.flush_data().await;
            }
        }
    }

    fn has_data(&self) -> bool {
        let frames = self.frames.lock().expect("frames lock poisoned");
        frames
            .iter()
            .any(|(_, frame)| has_frame_data(&frame.lock().expect("metrics frame lock poisoned")))
    }

    /// Drain every batch that has data and push the snapshots.
    pub async fn flush_data(&self) {
        self.is_sending.store(true, Ordering::Release);

        let snapshots: Vec<AnalyticsMetrics> = {
            let frames = self.frames.lock().expect("frames lock poisoned");
            debug!("Flushing {} gateway batches", frames.len());
            frames
                .iter()
                .filter_map(|(_, frame)| snapshot_and_reset(frame))
                .collect()
        };

        for snapshot in snapshots {
            if let Err(err) = self.sink.push_metrics(snapshot).await {
                warn!("Unable to push metrics: {err:#}");
            }
        }

        self.is_sending.store(false, Ordering::Release);
    }

    /// Fetch or create the batch for a peer. Creating may evict the
    /// least-recently-used batch, which is drained on the spot and its
    /// snapshot pushed from a background task.
    fn frame_for(&self, peer: SocketAddr) -> Arc<Mutex<AnalyticsMetrics>> {
        let key = peer.ip().to_string();
        let mut frames = self.frames.lock().expect("frames lock poisoned");
        if let Some(found) = frames.get(&key) {
            return found.clone();
        }

        let frame = Arc::new(Mutex::new(AnalyticsMetrics {
            metrics: Some(AnalyticsInternalMetrics {
                // Stats carry the peer address only on the server side
                gateway_ip: if self.settings.server_side {
                    peer.to_string()
                } else {
                    String::new()
                },
                ..Default::default()
            }),
            ..Default::default()
        }));

        if let Some((_, evicted)) = frames.push(key, frame.clone()) {
            if !Arc::ptr_eq(&evicted, &frame) {
                debug!("Evicting batch of a recycled gateway stream");
                if let Some(snapshot) = snapshot_and_reset(&evicted) {
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        if let Err(err) = sink.push_metrics(snapshot).await {
                            warn!("Unable to push metrics: {err:#}");
                        }
                    });
                }
            }
        }

        frame
    }

    fn handle_datagram(&self, data: &[u8], peer: SocketAddr, counter: Counter) {
        let frame = self.frame_for(peer);

        {
            let mut frame = frame.lock().expect("metrics frame lock poisoned");
            if let Some(metrics) = frame.metrics.as_mut() {
                match counter {
                    Counter::UpRx => metrics.up_rx_packets += 1,
                    Counter::UpTx => metrics.up_tx_packets += 1,
                    Counter::DnRx => metrics.dn_rx_packets += 1,
                    Counter::DnTx => metrics.dn_tx_packets += 1,
                }
            }
        }

        // Direction is decided by the Semtech kind, not by which
        // socket carried the datagram: in single-port mode both
        // directions share the up socket.
        if semtech::is_uplink(data) {
            self.handle_uplink(data, peer, &frame);
        } else if semtech::is_downlink(data) {
            self.handle_downlink(data, peer, &frame);
        }
    }

    fn inc_pkt_stat(metrics: &mut AnalyticsInternalMetrics, kind: PacketKind) {
        match kind {
            PacketKind::PushData => metrics.pkt_push_data += 1,
            PacketKind::PushAck => metrics.pkt_push_ack += 1,
            PacketKind::PullData => metrics.pkt_pull_data += 1,
            PacketKind::PullResp => metrics.pkt_pull_resp += 1,
            PacketKind::PullAck => metrics.pkt_pull_ack += 1,
            PacketKind::TxAck => metrics.pkt_tx_ack += 1,
        }
    }

    fn handle_uplink(&self, data: &[u8], peer: SocketAddr, frame: &Mutex<AnalyticsMetrics>) {
        let mut envelope = match Envelope::decode(data, peer, chrono::Utc::now()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Could not handle uplink: {}", err);
                return;
            }
        };

        let eui = envelope.gateway_eui().map(<[u8]>::to_vec);
        let gateway_id = envelope.gateway_id();

        let mut uplinks = Vec::new();
        let mut stat = None;
        if eui.is_some() {
            if let Ok(rx) = envelope.rx_packets() {
                uplinks.extend(rx.iter().map(convert::convert_rx_packet));
            }
            if let Ok(Some(record)) = envelope.stat() {
                stat = Some(convert::convert_stat(record, self.settings.gauge_stat));
            }
        } else {
            debug!("No EUI in the frame");
        }

        let mut frame = frame.lock().expect("metrics frame lock poisoned");
        if let Some(metrics) = frame.metrics.as_mut() {
            Self::inc_pkt_stat(metrics, envelope.kind);
        }
        if let Some(eui) = eui {
            frame.gateway_eui = eui;
            if !self.settings.server_side {
                frame.gateway_id = self.settings.gateway_id.clone();
            } else if frame.gateway_id.is_empty() {
                if let Some(id) = gateway_id {
                    frame.gateway_id = id;
                }
            }
        }
        frame.uplinks.append(&mut uplinks);
        if let Some(stat) = stat {
            frame.stats.push(stat);
        }
    }

    fn handle_downlink(&self, data: &[u8], peer: SocketAddr, frame: &Mutex<AnalyticsMetrics>) {
        let mut envelope = match Envelope::decode(data, peer, chrono::Utc::now()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Could not handle downlink: {}", err);
                return;
            }
        };

        let eui = envelope.gateway_eui().map(<[u8]>::to_vec);
        let downlink = match envelope.tx_packet() {
            Ok(Some(tx)) => Some(convert::convert_tx_packet(tx)),
            _ => None,
        };

        let mut frame = frame.lock().expect("metrics frame lock poisoned");
        if let Some(metrics) = frame.metrics.as_mut() {
            Self::inc_pkt_stat(metrics, envelope.kind);
        }
        if let Some(eui) = eui {
            frame.gateway_eui = eui;
        }
        if let Some(downlink) = downlink {
            frame.downlinks.push(downlink);
        }
    }
}

impl ProxyTap for AnalyticsForwarder {
    fn up_local(&self, data: &[u8], peer: SocketAddr) {
        self.handle_datagram(data, peer, Counter::UpTx);
    }

    fn up_remote(&self, data: &[u8], peer: SocketAddr) {
        self.handle_datagram(data, peer, Counter::UpRx);
    }

    fn dn_local(&self, data: &[u8], peer: SocketAddr) {
        self.handle_datagram(data, peer, Counter::DnTx);
    }

    fn dn_remote(&self, data: &[u8], peer: SocketAddr) {
        self.handle_datagram(data, peer, Counter::DnRx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::UdpProxyConfig;
    use anyhow::Result;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    const PACKET_PUSH_DATA_UP: &str = "Ar43AHB2/wBWBgPleyJyeHBrIjpbeyJhZXNrIjowLCJicmQiOjAsImNvZHIiOiI0LzUiLCJkYXRhIjoiUUt5ZEN5WUFRd01CN2l1NVFENnNINXUxQytZaCIsImRhdHIiOiJTRjlCVzEyNSIsImZyZXEiOjg2Ny4xLCJqdmVyIjoyLCJtb2R1IjoiTE9SQSIsInJzaWciOlt7ImFudCI6MCwiY2hhbiI6MCwibHNuciI6MTMuMiwicnNzaWMiOi01MH1dLCJzaXplIjoyMSwic3RhdCI6MSwidGltZSI6IjIwMjMtMDItMjJUMDE6NTM6MzEuMzA2MjI0WiIsInRtc3QiOjM4MDA1OTUyODR9XX0=";
    const PACKET_PULL_RESP: &str = "AgAEA3sidHhwayI6eyJpbW1lIjpmYWxzZSwidG1zdCI6NDI1NDM3MDM5NiwiZnJlcSI6ODY4LjMsInJmY2giOjAsInBvd2UiOjE0LCJtb2R1IjoiTE9SQSIsImRhdHIiOiJTRjdCVzEyNSIsImNvZHIiOiI0LzUiLCJpcG9sIjp0cnVlLCJzaXplIjozMywibmNyYyI6dHJ1ZSwiZGF0YSI6IklHK1NCcGU1TlVvNEk4TDNpQ1RzbUlnWFBFSERMNjNFcWo2bGFWbXJHS1JGIn19";
    const PACKET_PUSH_ACK: &str = "Ar43AQ==";

    #[derive(Default)]
    struct RecordingSink {
        pushed: Mutex<Vec<AnalyticsMetrics>>,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn push_metrics(&self, metrics: AnalyticsMetrics) -> Result<()> {
            self.pushed
                .lock()
                .expect("sink lock poisoned")
                .push(metrics);
            Ok(())
        }
    }

    fn settings(max_streams: usize) -> ForwarderSettings {
        ForwarderSettings {
            max_udp_streams: max_streams,
            flush_interval: 1,
            gateway_id: "test-gw".to_string(),
            gauge_stat: false,
            server_side: false,
        }
    }

    async fn test_forwarder(
        max_streams: usize,
        server_side: bool,
    ) -> (Arc<AnalyticsForwarder>, Arc<RecordingSink>) {
        let proxy = Arc::new(
            UdpProxy::new(UdpProxyConfig {
                up_listen_addr: "127.0.0.1:0".parse().expect("addr"),
                up_connect_addr: "127.0.0.1:9".parse().expect("addr"),
                up_connect_bind_addr: None,
                dn: None,
                buffer_size: 1500,
                socket_streams: max_streams,
                reconnect_interval: Duration::from_secs(1),
                dump_file: None,
            })
            .await
            .expect("proxy"),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut settings = settings(max_streams);
        settings.server_side = server_side;
        let forwarder = Arc::new(AnalyticsForwarder::new(settings, sink.clone(), proxy));
        (forwarder, sink)
    }

    fn peer(ip: &str) -> SocketAddr {
        format!("{}:40000", ip).parse().expect("peer addr")
    }

    #[tokio::test]
    async fn aggregates_uplinks_with_fingerprint() {
        let (forwarder, _sink) = test_forwarder(4, false).await;
        let datagram = BASE64.decode(PACKET_PUSH_DATA_UP).expect("test datagram");

        forwarder.up_local(&datagram, peer("10.0.0.1"));

        let frame = forwarder.frame_for(peer("10.0.0.1"));
        let frame = frame.lock().expect("frame lock");
        assert_eq!(frame.gateway_id, "test-gw");
        assert_eq!(
            frame.gateway_eui,
            vec![0x70, 0x76, 0xff, 0x00, 0x56, 0x06, 0x03, 0xe5]
        );
        assert_eq!(frame.uplinks.len(), 1);

        let up = &frame.uplinks[0];
        let payload = BASE64
            .decode("QKydCyYAQwMB7iu5QD6sH5u1C+Yh")
            .expect("payload");
        assert_eq!(up.fhdr, payload[..9].to_vec());
        assert_eq!(up.unique_id.len(), 20);

        let metrics = frame.metrics.as_ref().expect("metrics present");
        assert_eq!(metrics.up_tx_packets, 1);
        assert_eq!(metrics.pkt_push_data, 1);
    }

    #[tokio::test]
    async fn classifies_by_kind_not_by_socket() {
        // A PULL_RESP arriving via the up-socket tap must still be
        // recorded as a downlink (single-port mode).
        let (forwarder, _sink) = test_forwarder(4, false).await;
        let datagram = BASE64.decode(PACKET_PULL_RESP).expect("test datagram");

        forwarder.up_remote(&datagram, peer("10.0.0.2"));

        let frame = forwarder.frame_for(peer("10.0.0.2"));
        let frame = frame.lock().expect("frame lock");
        assert_eq!(frame.downlinks.len(), 1);
        assert!(frame.uplinks.is_empty());

        let metrics = frame.metrics.as_ref().expect("metrics present");
        assert_eq!(metrics.up_rx_packets, 1);
        assert_eq!(metrics.pkt_pull_resp, 1);
    }

    #[tokio::test]
    async fn flush_resets_batches_and_skips_empty_ones() {
        let (forwarder, sink) = test_forwarder(4, false).await;
        let datagram = BASE64.decode(PACKET_PUSH_DATA_UP).expect("test datagram");

        forwarder.up_local(&datagram, peer("10.0.0.1"));
        assert!(forwarder.has_data());

        forwarder.flush_data().await;
        let pushed = sink.pushed.lock().expect("sink lock").clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].uplinks.len(), 1);
        assert_eq!(
            pushed[0].metrics.as_ref().expect("metrics").up_tx_packets,
            1
        );

        // Everything is reset after the flush
        assert!(!forwarder.has_data());
        let frame = forwarder.frame_for(peer("10.0.0.1"));
        {
            let frame = frame.lock().expect("frame lock");
            assert!(frame.uplinks.is_empty());
            assert_eq!(frame.metrics.as_ref().expect("metrics").up_tx_packets, 0);
        }

        // Flushing with no data issues no push
        forwarder.flush_data().await;
        assert_eq!(sink.pushed.lock().expect("sink lock").len(), 1);
    }

    #[tokio::test]
    async fn counters_alone_make_a_batch_flushable() {
        let (forwarder, sink) = test_forwarder(4, false).await;
        let datagram = BASE64.decode(PACKET_PUSH_ACK).expect("test datagram");

        // PUSH_ACK converts to no record but still counts
        forwarder.up_remote(&datagram, peer("10.0.0.1"));
        assert!(forwarder.has_data());

        forwarder.flush_data().await;
        let pushed = sink.pushed.lock().expect("sink lock").clone();
        assert_eq!(pushed.len(), 1);
        assert!(pushed[0].uplinks.is_empty());
        let metrics = pushed[0].metrics.as_ref().expect("metrics");
        assert_eq!(metrics.up_rx_packets, 1);
        assert_eq!(metrics.pkt_push_ack, 1);
    }

    #[tokio::test]
    async fn evicted_batches_are_flushed() {
        let (forwarder, sink) = test_forwarder(2, false).await;
        let datagram = BASE64.decode(PACKET_PUSH_DATA_UP).expect("test datagram");

        forwarder.up_local(&datagram, peer("10.0.0.1"));
        forwarder.up_local(&datagram, peer("10.0.0.2"));
        // The third gateway evicts 10.0.0.1, whose batch is drained
        forwarder.up_local(&datagram, peer("10.0.0.3"));

        // The eviction push runs on a background task
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let pushed = sink.pushed.lock().expect("sink lock").clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].uplinks.len(), 1);
    }

    #[tokio::test]
    async fn server_side_mode_derives_gateway_identity() {
        let (forwarder, _sink) = test_forwarder(4, true).await;
        let datagram = BASE64.decode(PACKET_PUSH_DATA_UP).expect("test datagram");

        forwarder.up_local(&datagram, peer("10.0.0.7"));

        let frame = forwarder.frame_for(peer("10.0.0.7"));
        let frame = frame.lock().expect("frame lock");
        assert_eq!(frame.gateway_id, "eui-7076ff00560603e5");
        assert_eq!(
            frame.metrics.as_ref().expect("metrics").gateway_ip,
            "10.0.0.7:40000"
        );
    }

    #[tokio::test]
    async fn malformed_datagrams_only_count() {
        let (forwarder, _sink) = test_forwarder(4, false).await;

        // Version byte is valid but the JSON is not
        let mut datagram = vec![0x02, 0x00, 0x00, 0x00];
        datagram.extend_from_slice(&[0u8; 8]); // EUI
        datagram.extend_from_slice(b"{not json");

        forwarder.up_local(&datagram, peer("10.0.0.1"));

        let frame = forwarder.frame_for(peer("10.0.0.1"));
        let frame = frame.lock().expect("frame lock");
        assert!(frame.uplinks.is_empty());
        assert_eq!(
            frame.metrics.as_ref().expect("metrics").up_tx_packets,
            1
        );
    }
}
