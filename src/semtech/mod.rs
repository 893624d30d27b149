//! Semtech UDP Packet Forwarder protocol codec (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Datagram layout: version byte (always 0x02), a 16-bit token in
//! little-endian order, a kind byte, then the body. PUSH_DATA,
//! PULL_DATA and TX_ACK carry the 8-byte gateway EUI at the start of
//! the body; PUSH_DATA, PULL_RESP and TX_ACK additionally carry a
//! JSON document with rxpk/txpk/stat records.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid protocol version (0x{0:02x})")]
    BadVersion(u8),
    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("truncated body: {0} bytes")]
    TruncatedBody(usize),
    #[error("invalid packet type")]
    InvalidPacketType,
    #[error("could not parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Packet kinds (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketKind::PushData),
            0x01 => Ok(PacketKind::PushAck),
            0x02 => Ok(PacketKind::PullData),
            0x03 => Ok(PacketKind::PullResp),
            0x04 => Ok(PacketKind::PullAck),
            0x05 => Ok(PacketKind::TxAck),
            _ => Err(CodecError::UnknownKind(value)),
        }
    }
}

impl PacketKind {
    /// True for datagrams that travel gateway → server.
    pub fn is_uplink(self) -> bool {
        matches!(self, PacketKind::PushData | PacketKind::PushAck)
    }

    /// True for datagrams of the PULL/TX_ACK conversation.
    pub fn is_downlink(self) -> bool {
        !self.is_uplink()
    }
}

/// Classify a raw datagram as uplink-direction without decoding it.
///
/// Returns false for anything that is not a well-formed Semtech header.
pub fn is_uplink(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == PROTOCOL_VERSION
        && matches!(PacketKind::try_from(data[3]), Ok(kind) if kind.is_uplink())
}

/// Classify a raw datagram as downlink-direction without decoding it.
pub fn is_downlink(data: &[u8]) -> bool {
    data.len() >= 4
        && data[0] == PROTOCOL_VERSION
        && matches!(PacketKind::try_from(data[3]), Ok(kind) if kind.is_downlink())
}

/// Per-antenna signal metadata (Kerlink "rsig" extension).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxSignal {
    /// Antenna number on which the signal has been received
    pub ant: u8,
    /// Concentrator "IF" channel used for RX
    pub chan: u8,
    /// RSSI of the channel in dBm
    pub rssic: i16,
    /// RSSI of the signal in dBm
    pub rssis: Option<i16>,
    /// Standard deviation of RSSI during preamble
    pub rssisd: Option<u16>,
    /// LoRa SNR ratio in dB
    pub lsnr: f64,
    /// Encrypted fine timestamp, base64
    pub etime: Option<String>,
    /// Fine timestamp, ns precision
    pub ftime: Option<i64>,
    /// Frequency offset in Hz
    pub foff: Option<i32>,
}

/// One received radio frame inside a PUSH_DATA rxpk array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxPacket {
    /// UTC time of packet reception, RFC 3339
    pub time: String,
    /// GPS time (ms since GPS epoch)
    pub tmms: i64,
    /// Concentrator internal timestamp (us)
    pub tmst: i64,
    /// Frequency in MHz
    pub freq: f32,
    /// RF channel
    pub chan: i32,
    /// Concentrator RF chain
    pub rfch: u32,
    /// CRC status: 1 OK, -1 fail, 0 missing
    pub stat: i32,
    /// Modulation, "LORA" or "FSK"
    pub modu: String,
    /// Data rate, e.g. "SF7BW125" or an FSK rate
    pub datr: String,
    /// Coding rate, e.g. "4/5"
    pub codr: String,
    /// RSSI in dBm
    pub rssi: f32,
    /// LoRa SNR ratio in dB
    pub lsnr: f32,
    /// Payload size in bytes
    pub size: u32,
    /// Base64-encoded PHY payload
    pub data: String,
    /// Per-antenna details, when the gateway reports them
    pub rsig: Vec<RxSignal>,
}

/// The txpk document of a PULL_RESP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxPacket {
    /// Send immediately, ignoring tmst/tmms
    pub imme: bool,
    pub tmst: i64,
    pub tmms: i64,
    pub freq: f32,
    pub rfch: u32,
    /// TX output power in dBm
    pub powe: f32,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    /// FSK frequency deviation in Hz
    pub fdev: f32,
    /// Invert polarity (LoRa downlinks)
    pub ipol: bool,
    /// RF preamble size
    pub prea: u32,
    /// Disable the physical CRC
    pub ncrc: bool,
    pub size: u32,
    pub data: String,
}

/// The stat document of a PUSH_DATA.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatRecord {
    pub time: String,
    pub lati: f32,
    pub long: f32,
    pub alti: f32,
    /// Radio packets received
    pub rxnb: u32,
    /// Radio packets with a valid PHY CRC
    pub rxok: u32,
    /// Radio packets forwarded upstream
    pub rxfw: u32,
    /// Ratio of upstream datagrams that were acknowledged
    pub ackr: f32,
    /// Downlink datagrams received
    pub dwnb: u32,
    /// Packets emitted
    pub txnb: u32,
}

#[derive(Debug, Default, Deserialize)]
struct JsonPayload {
    #[serde(default)]
    rxpk: Vec<RxPacket>,
    txpk: Option<TxPacket>,
    stat: Option<StatRecord>,
}

/// A decoded Semtech UDP datagram.
///
/// The JSON sub-payload is parsed lazily on the first accessor and
/// cached, so repeated accessors do not re-parse.
#[derive(Debug)]
pub struct Envelope {
    pub sender: SocketAddr,
    pub received_at: DateTime<Utc>,
    pub version: u8,
    pub token: u16,
    pub kind: PacketKind,
    pub body: Vec<u8>,
    parsed: Option<JsonPayload>,
}

impl Envelope {
    /// Decode a raw datagram.
    ///
    /// Fails when the datagram is shorter than the 4-byte header or
    /// carries a different protocol version.
    pub fn decode(
        payload: &[u8],
        sender: SocketAddr,
        received_at: DateTime<Utc>,
    ) -> Result<Self, CodecError> {
        if payload.len() < 4 {
            return Err(CodecError::TooShort(payload.len()));
        }
        if payload[0] != PROTOCOL_VERSION {
            return Err(CodecError::BadVersion(payload[0]));
        }

        Ok(Envelope {
            sender,
            received_at,
            version: payload[0],
            token: u16::from_le_bytes([payload[1], payload[2]]),
            kind: PacketKind::try_from(payload[3])?,
            body: payload[4..].to_vec(),
            parsed: None,
        })
    }

    /// Re-encode the envelope into datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.body.len());
        buf.put_u8(self.version);
        buf.put_u16_le(self.token);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.body);
        buf.to_vec()
    }

    /// The 8-byte gateway EUI, present on PUSH_DATA, PULL_DATA and TX_ACK.
    pub fn gateway_eui(&self) -> Option<&[u8]> {
        match self.kind {
            PacketKind::PushData | PacketKind::PullData | PacketKind::TxAck
                if self.body.len() >= 8 =>
            {
                Some(&self.body[..8])
            }
            _ => None,
        }
    }

    /// The conventional "eui-<hex>" gateway name.
    pub fn gateway_id(&self) -> Option<String> {
        self.gateway_eui().map(|eui| format!("eui-{}", hex::encode(eui)))
    }

    fn json_offset(&self) -> usize {
        if self.kind == PacketKind::PullResp {
            0
        } else {
            8
        }
    }

    fn ensure_parsed(&mut self) -> Result<(), CodecError> {
        if self.parsed.is_some() {
            return Ok(());
        }
        let ofs = self.json_offset();
        if self.body.len() < ofs {
            return Err(CodecError::TruncatedBody(self.body.len()));
        }
        self.parsed = Some(serde_json::from_slice(&self.body[ofs..])?);
        Ok(())
    }

    /// The stat record of a PUSH_DATA, if any.
    pub fn stat(&mut self) -> Result<Option<&StatRecord>, CodecError> {
        if self.kind != PacketKind::PushData {
            return Err(CodecError::InvalidPacketType);
        }
        self.ensure_parsed()?;
        Ok(self.parsed.as_ref().and_then(|p| p.stat.as_ref()))
    }

    /// All rxpk records of a PUSH_DATA.
    pub fn rx_packets(&mut self) -> Result<&[RxPacket], CodecError> {
        if self.kind != PacketKind::PushData {
            return Err(CodecError::InvalidPacketType);
        }
        self.ensure_parsed()?;
        Ok(self.parsed.as_ref().map(|p| p.rxpk.as_slice()).unwrap_or(&[]))
    }

    /// The txpk record of a PULL_RESP, if any.
    pub fn tx_packet(&mut self) -> Result<Option<&TxPacket>, CodecError> {
        if self.kind != PacketKind::PullResp {
            return Err(CodecError::InvalidPacketType);
        }
        self.ensure_parsed()?;
        Ok(self.parsed.as_ref().and_then(|p| p.txpk.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    // Raw datagrams captured from Kerlink gateways.
    const PACKET_PULL_REQ: &str = "Ar4XAnB2/wBWBgPl";
    const PACKET_PULL_ACK: &str = "Ar4XBA==";
    const PACKET_PUSH_DATA_STAT: &str = "Ar42AHB2/wBWBgPleyJzdGF0Ijp7ImFja3IiOjEwMC4wLCJib290IjoiMjAyMy0wMi0yMiAwMTowNTowNiBHTVQiLCJkd25iIjowLCJmcGdhIjozMSwiaGFsIjoiNS4wLjEiLCJscHBzIjozMCwicGluZyI6MTIwLCJyeGZ3IjoxLCJyeG5iIjoxLCJyeG9rIjowLCJ0aW1lIjoiMjAyMy0wMi0yMiAwMTo1MzowNyBHTVQiLCJ0eG5iIjowfX0=";
    const PACKET_PUSH_DATA_UP: &str = "Ar43AHB2/wBWBgPleyJyeHBrIjpbeyJhZXNrIjowLCJicmQiOjAsImNvZHIiOiI0LzUiLCJkYXRhIjoiUUt5ZEN5WUFRd01CN2l1NVFENnNINXUxQytZaCIsImRhdHIiOiJTRjlCVzEyNSIsImZyZXEiOjg2Ny4xLCJqdmVyIjoyLCJtb2R1IjoiTE9SQSIsInJzaWciOlt7ImFudCI6MCwiY2hhbiI6MCwibHNuciI6MTMuMiwicnNzaWMiOi01MH1dLCJzaXplIjoyMSwic3RhdCI6MSwidGltZSI6IjIwMjMtMDItMjJUMDE6NTM6MzEuMzA2MjI0WiIsInRtc3QiOjM4MDA1OTUyODR9XX0=";
    const PACKET_PUSH_ACK: &str = "Ar43AQ==";
    const PACKET_PULL_RESP: &str = "AgAEA3sidHhwayI6eyJpbW1lIjpmYWxzZSwidG1zdCI6NDI1NDM3MDM5NiwiZnJlcSI6ODY4LjMsInJmY2giOjAsInBvd2UiOjE0LCJtb2R1IjoiTE9SQSIsImRhdHIiOiJTRjdCVzEyNSIsImNvZHIiOiI0LzUiLCJpcG9sIjp0cnVlLCJzaXplIjozMywibmNyYyI6dHJ1ZSwiZGF0YSI6IklHK1NCcGU1TlVvNEk4TDNpQ1RzbUlnWFBFSERMNjNFcWo2bGFWbXJHS1JGIn19";
    const PACKET_TX_ACK: &str = "AgAEBXB2/wBWBgPleyJ0eHBrX2FjayI6eyJlcnJvciI6Ik5PTkUifX0=";

    const GATEWAY_EUI: [u8; 8] = [0x70, 0x76, 0xff, 0x00, 0x56, 0x06, 0x03, 0xe5];

    fn decode_const(b64: &str) -> Envelope {
        let raw = BASE64.decode(b64).expect("valid base64 constant");
        let sender: SocketAddr = "127.0.0.1:1700".parse().expect("valid address");
        Envelope::decode(&raw, sender, Utc::now()).expect("valid datagram")
    }

    #[test]
    fn decodes_pull_data() {
        let env = decode_const(PACKET_PULL_REQ);
        assert_eq!(env.kind, PacketKind::PullData);
        assert_eq!(env.token, 0x17be);
        assert_eq!(env.gateway_eui(), Some(&GATEWAY_EUI[..]));
    }

    #[test]
    fn decodes_pull_ack() {
        let env = decode_const(PACKET_PULL_ACK);
        assert_eq!(env.kind, PacketKind::PullAck);
        assert_eq!(env.token, 0x17be);
        assert_eq!(env.gateway_eui(), None);
    }

    #[test]
    fn decodes_push_data_with_stat_only() {
        let mut env = decode_const(PACKET_PUSH_DATA_STAT);
        assert_eq!(env.kind, PacketKind::PushData);
        assert_eq!(env.token, 0x36be);
        assert_eq!(env.gateway_eui(), Some(&GATEWAY_EUI[..]));
        assert_eq!(env.gateway_id().as_deref(), Some("eui-7076ff00560603e5"));

        let stat = env.stat().expect("stat accessor").expect("stat present").clone();
        assert_eq!(stat.time, "2023-02-22 01:53:07 GMT");
        assert_eq!(stat.rxnb, 1);
        assert_eq!(stat.rxok, 0);
        assert_eq!(stat.rxfw, 1);
        assert_eq!(stat.ackr, 100.0);
        assert_eq!(stat.txnb, 0);

        let rx = env.rx_packets().expect("rxpk accessor");
        assert!(rx.is_empty());
    }

    #[test]
    fn decodes_push_data_with_uplink() {
        let mut env = decode_const(PACKET_PUSH_DATA_UP);
        assert_eq!(env.kind, PacketKind::PushData);
        assert_eq!(env.token, 0x37be);
        assert_eq!(env.gateway_eui(), Some(&GATEWAY_EUI[..]));
        assert!(env.stat().expect("stat accessor").is_none());

        let rx = env.rx_packets().expect("rxpk accessor");
        assert_eq!(rx.len(), 1);
        let pkt = &rx[0];
        assert_eq!(pkt.time, "2023-02-22T01:53:31.306224Z");
        assert_eq!(pkt.tmst, 3800595284);
        assert_eq!(pkt.freq, 867.1);
        assert_eq!(pkt.stat, 1);
        assert_eq!(pkt.modu, "LORA");
        assert_eq!(pkt.datr, "SF9BW125");
        assert_eq!(pkt.codr, "4/5");
        assert_eq!(pkt.size, 21);
        assert_eq!(pkt.data, "QKydCyYAQwMB7iu5QD6sH5u1C+Yh");
        assert_eq!(pkt.rsig.len(), 1);
        assert_eq!(pkt.rsig[0].ant, 0);
        assert_eq!(pkt.rsig[0].chan, 0);
        assert_eq!(pkt.rsig[0].rssic, -50);
        assert_eq!(pkt.rsig[0].lsnr, 13.2);
        assert_eq!(pkt.rsig[0].rssis, None);
    }

    #[test]
    fn decodes_push_ack() {
        let env = decode_const(PACKET_PUSH_ACK);
        assert_eq!(env.kind, PacketKind::PushAck);
        assert_eq!(env.token, 0x37be);
        assert_eq!(env.gateway_eui(), None);
    }

    #[test]
    fn decodes_pull_resp() {
        let mut env = decode_const(PACKET_PULL_RESP);
        assert_eq!(env.kind, PacketKind::PullResp);
        assert_eq!(env.token, 0x0400);
        assert_eq!(env.gateway_eui(), None);

        let tx = env.tx_packet().expect("txpk accessor").expect("txpk present").clone();
        assert!(!tx.imme);
        assert_eq!(tx.tmst, 4254370396);
        assert_eq!(tx.freq, 868.3);
        assert_eq!(tx.powe, 14.0);
        assert_eq!(tx.modu, "LORA");
        assert_eq!(tx.datr, "SF7BW125");
        assert_eq!(tx.codr, "4/5");
        assert!(tx.ipol);
        assert!(tx.ncrc);
        assert_eq!(tx.size, 33);
    }

    #[test]
    fn decodes_tx_ack() {
        let env = decode_const(PACKET_TX_ACK);
        assert_eq!(env.kind, PacketKind::TxAck);
        assert_eq!(env.token, 0x0400);
        assert_eq!(env.gateway_eui(), Some(&GATEWAY_EUI[..]));
    }

    #[test]
    fn accessors_reject_wrong_kinds() {
        let mut env = decode_const(PACKET_PULL_RESP);
        assert!(matches!(env.stat(), Err(CodecError::InvalidPacketType)));
        assert!(matches!(env.rx_packets(), Err(CodecError::InvalidPacketType)));

        let mut env = decode_const(PACKET_PUSH_DATA_UP);
        assert!(matches!(env.tx_packet(), Err(CodecError::InvalidPacketType)));
    }

    #[test]
    fn rejects_short_datagrams() {
        let sender: SocketAddr = "127.0.0.1:1700".parse().expect("valid address");
        let err = Envelope::decode(&[0x02, 0x01, 0x02], sender, Utc::now());
        assert!(matches!(err, Err(CodecError::TooShort(3))));
    }

    #[test]
    fn rejects_wrong_version() {
        let sender: SocketAddr = "127.0.0.1:1700".parse().expect("valid address");
        let err = Envelope::decode(&[0x01, 0x00, 0x00, 0x00], sender, Utc::now());
        assert!(matches!(err, Err(CodecError::BadVersion(0x01))));
    }

    #[test]
    fn encode_roundtrips() {
        for b64 in [
            PACKET_PULL_REQ,
            PACKET_PULL_ACK,
            PACKET_PUSH_DATA_STAT,
            PACKET_PUSH_DATA_UP,
            PACKET_PUSH_ACK,
            PACKET_PULL_RESP,
            PACKET_TX_ACK,
        ] {
            let raw = BASE64.decode(b64).expect("valid base64 constant");
            let sender: SocketAddr = "127.0.0.1:1700".parse().expect("valid address");
            let env = Envelope::decode(&raw, sender, Utc::now()).expect("valid datagram");
            assert_eq!(env.encode(), raw);
        }
    }

    #[test]
    fn classifies_directions() {
        let uplinks = [PACKET_PUSH_DATA_UP, PACKET_PUSH_ACK];
        let downlinks = [
            PACKET_PULL_REQ,
            PACKET_PULL_ACK,
            PACKET_PULL_RESP,
            PACKET_TX_ACK,
        ];
        for b64 in uplinks {
            let raw = BASE64.decode(b64).expect("valid base64 constant");
            assert!(is_uplink(&raw));
            assert!(!is_downlink(&raw));
        }
        for b64 in downlinks {
            let raw = BASE64.decode(b64).expect("valid base64 constant");
            assert!(is_downlink(&raw));
            assert!(!is_uplink(&raw));
        }

        // Wrong version classifies as neither direction.
        assert!(!is_uplink(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_downlink(&[0x01, 0x00, 0x00, 0x03]));
        assert!(!is_uplink(&[0x02]));
    }
}
