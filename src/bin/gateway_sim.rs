//! Gateway Simulator
//!
//! Simulates a LoRa gateway sending Semtech UDP Packet Forwarder
//! frames through the relay. Useful for testing without hardware:
//! point it at the relay's up port and watch the upstream ACKs come
//! back through the per-gateway stream.
//!
//! Usage: cargo run --bin gateway_sim [relay_addr]

use std::env;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PUSH_ACK: u8 = 0x01;
const PULL_DATA: u8 = 0x02;
const PULL_ACK: u8 = 0x04;

/// Fake gateway EUI
const GATEWAY_EUI: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let relay_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1800".to_string())
        .parse()?;

    println!("📡 lora-relay Gateway Simulator");
    println!("  Target: {}", relay_addr);
    println!("  Gateway EUI: {}", hex::encode(GATEWAY_EUI));
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let scenarios: Vec<(&str, Vec<u8>)> = vec![
        (
            "PULL_DATA (open the downlink path)",
            build_pull_data(1, &GATEWAY_EUI),
        ),
        (
            "PUSH_DATA uplink (temperature sensor)",
            build_push_data(2, &GATEWAY_EUI, &uplink_json()),
        ),
        (
            "PUSH_DATA stat (gateway status)",
            build_push_data(3, &GATEWAY_EUI, &stat_json()),
        ),
        (
            "PUSH_DATA uplink (humidity sensor)",
            build_push_data(4, &GATEWAY_EUI, &uplink_json_2()),
        ),
    ];

    for (desc, packet) in &scenarios {
        println!("📤 Sending: {}", desc);
        println!("   Size: {} bytes", packet.len());

        socket.send_to(packet, relay_addr).await?;

        // Wait for the ACK relayed back from the upstream
        let mut ack_buf = [0u8; 64];
        match tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut ack_buf)).await {
            Ok(Ok((len, from))) => {
                if len >= 4 && (ack_buf[3] == PUSH_ACK || ack_buf[3] == PULL_ACK) {
                    println!("   ✅ ACK received from {}", from);
                } else {
                    println!("   ⚠️  Unexpected response ({} bytes) from {}", len, from);
                }
            }
            Ok(Err(e)) => println!("   ❌ Recv error: {}", e),
            Err(_) => println!("   ⏰ No ACK (timeout)"),
        }
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    println!("✨ Simulation complete!");
    Ok(())
}

fn header(token: u16, kind: u8) -> Vec<u8> {
    // The token travels little-endian on the wire
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.extend_from_slice(&token.to_le_bytes());
    packet.push(kind);
    packet
}

fn build_push_data(token: u16, gateway_eui: &[u8; 8], json: &str) -> Vec<u8> {
    let mut packet = header(token, PUSH_DATA);
    packet.extend_from_slice(gateway_eui);
    packet.extend_from_slice(json.as_bytes());
    packet
}

fn build_pull_data(token: u16, gateway_eui: &[u8; 8]) -> Vec<u8> {
    let mut packet = header(token, PULL_DATA);
    packet.extend_from_slice(gateway_eui);
    packet
}

/// Encode bytes as base64
fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Unconfirmed Data Up — simulated temperature sensor
fn uplink_json() -> String {
    // MHDR=0x40 (Unconfirmed Data Up)
    // DevAddr=0x260B1234 (LE: 34 12 0B 26)
    // FCtrl=0x80 (ADR=1), FCnt=0x0042, FPort=0x01
    // Payload: temperature=22.5°C → 0x00E1 (225 in 0.1°C)
    let phy: Vec<u8> = vec![
        0x40, 0x34, 0x12, 0x0B, 0x26, 0x80, 0x42, 0x00, 0x01, 0x00, 0xE1, 0x78, 0x56, 0x34, 0x12,
    ];
    format!(
        r#"{{"rxpk":[{{"time":"2026-02-18T17:30:00Z","tmst":3512348611,"freq":902.3,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/5","rssi":-65,"lsnr":7.5,"size":{},"data":"{}"}}]}}"#,
        phy.len(),
        b64(&phy)
    )
}

/// Second uplink — same device, next frame counter
fn uplink_json_2() -> String {
    let phy: Vec<u8> = vec![
        0x40, 0x34, 0x12, 0x0B, 0x26, 0x80, 0x43, 0x00, 0x01, 0x41, 0x78, 0x56, 0x34, 0x12,
    ];
    format!(
        r#"{{"rxpk":[{{"time":"2026-02-18T17:30:05Z","tmst":3517348611,"freq":902.3,"stat":1,"modu":"LORA","datr":"SF7BW125","codr":"4/5","rssi":-68,"lsnr":6.8,"size":{},"data":"{}"}}]}}"#,
        phy.len(),
        b64(&phy)
    )
}

/// Gateway status (no rxpk)
fn stat_json() -> String {
    r#"{"stat":{"time":"2026-02-18T17:30:00Z","lati":29.7604,"long":-95.3698,"alti":15,"rxnb":47,"rxok":44,"rxfw":44,"ackr":100.0,"dwnb":3,"txnb":3}}"#
        .to_string()
}
