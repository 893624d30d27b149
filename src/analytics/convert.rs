//! Conversion of decoded Semtech JSON records into the analytics wire
//! types.
//!
//! The mappings are lossy by design: unparsable times become 0 and
//! unknown enum strings map to the UNKNOWN variants, so a single odd
//! record never fails the batch.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::api::{
    analytics_downlink, analytics_uplink, AnalyticsDownlink, AnalyticsStat, AnalyticsUplink,
    AnalyticsUplinkAntenna, CrcStatus, LoraBw, LoraCodingRate, LoraDataRate, LoraSf, Modulation,
};
use super::fingerprint;
use crate::lorawan;
use crate::semtech::{RxPacket, StatRecord, TxPacket};

fn parse_coding_rate(cr: &str) -> LoraCodingRate {
    match cr {
        "off" => LoraCodingRate::CrOff,
        "4/5" => LoraCodingRate::Cr45,
        "4/6" => LoraCodingRate::Cr46,
        "4/7" => LoraCodingRate::Cr47,
        "4/8" => LoraCodingRate::Cr48,
        "4/9" => LoraCodingRate::Cr49,
        "4/10" => LoraCodingRate::Cr410,
        "4/11" => LoraCodingRate::Cr411,
        "4/12" => LoraCodingRate::Cr412,
        "4/13" => LoraCodingRate::Cr413,
        "4/14" => LoraCodingRate::Cr414,
        "4/15" => LoraCodingRate::Cr415,
        "4/16" => LoraCodingRate::Cr416,
        _ => LoraCodingRate::CrUnknown,
    }
}

fn parse_crc_stat(stat: i32) -> CrcStatus {
    match stat {
        1 => CrcStatus::Ok,
        -1 => CrcStatus::Fail,
        _ => CrcStatus::Missing,
    }
}

fn parse_modulation(modu: &str) -> Modulation {
    match modu {
        "LORA" => Modulation::Lora,
        "FSK" => Modulation::Fsk,
        _ => Modulation::Unknown,
    }
}

fn parse_sf(sf: &str) -> LoraSf {
    match sf {
        "7" => LoraSf::Sf7,
        "8" => LoraSf::Sf8,
        "9" => LoraSf::Sf9,
        "10" => LoraSf::Sf10,
        "11" => LoraSf::Sf11,
        "12" => LoraSf::Sf12,
        _ => LoraSf::SfUnknown,
    }
}

fn parse_bw(bw: &str) -> LoraBw {
    match bw {
        "125" => LoraBw::Bw125k,
        "250" => LoraBw::Bw250k,
        "500" => LoraBw::Bw500k,
        _ => LoraBw::BwUnknown,
    }
}

/// Parse a LoRa data-rate string such as "SF7BW125".
fn parse_lora_data_rate(datr: &str) -> LoraDataRate {
    let mut rate = LoraDataRate::default();
    match datr.find("BW") {
        Some(bw_idx) if bw_idx >= 2 => {
            rate.spreading_factor = parse_sf(&datr[2..bw_idx]) as i32;
            rate.bandwidth = parse_bw(&datr[bw_idx + 2..]) as i32;
        }
        _ => warn!("Unparsable data rate '{}'", datr),
    }
    rate
}

fn rfc3339_micros(time: &str) -> i64 {
    DateTime::parse_from_rfc3339(time)
        .map(|t| t.timestamp_micros())
        .unwrap_or(0)
}

fn rfc3339_millis(time: &str) -> i64 {
    DateTime::parse_from_rfc3339(time)
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

fn convert_antenna(sig: &crate::semtech::RxSignal) -> AnalyticsUplinkAntenna {
    AnalyticsUplinkAntenna {
        antenna: sig.ant as i32,
        if_chan: sig.chan as i32,
        rssic: sig.rssic as i32,
        rssis: sig.rssis.map(|v| v as i32),
        rssisd: sig.rssisd.map(|v| v as i32),
        lsnr: sig.lsnr as f32,
        etime: sig
            .etime
            .as_deref()
            .and_then(|e| BASE64.decode(e).ok())
            .unwrap_or_default(),
        ftime: sig.ftime,
        foff: sig.foff,
    }
}

/// Convert one rxpk record of a PUSH_DATA into an uplink record.
pub fn convert_rx_packet(pkt: &RxPacket) -> AnalyticsUplink {
    let mut out = AnalyticsUplink {
        rx_wall_time: rfc3339_micros(&pkt.time),
        rx_finished_time: pkt.tmst,
        rx_gps_time: pkt.tmms,
        frequency: pkt.freq,
        rf_chain: pkt.rfch,
        coding_rate: parse_coding_rate(&pkt.codr) as i32,
        crc: parse_crc_stat(pkt.stat) as i32,
        modulation: parse_modulation(&pkt.modu) as i32,
        size: pkt.size,
        ..Default::default()
    };

    match pkt.modu.as_str() {
        "LORA" => {
            out.data_rate = Some(analytics_uplink::DataRate::DataRateLora(
                parse_lora_data_rate(&pkt.datr),
            ));
        }
        "FSK" => {
            if let Ok(rate) = pkt.datr.parse::<u32>() {
                out.data_rate = Some(analytics_uplink::DataRate::DataRateFsk(rate));
            }
        }
        _ => {}
    }

    if pkt.rsig.is_empty() {
        // Older forwarders report a single flat antenna reading
        out.ant.push(AnalyticsUplinkAntenna {
            antenna: 0,
            if_chan: pkt.chan,
            rssic: pkt.rssi as i32,
            lsnr: pkt.lsnr,
            ..Default::default()
        });
    } else {
        out.ant.extend(pkt.rsig.iter().map(convert_antenna));
    }

    if let Ok(data) = BASE64.decode(&pkt.data) {
        let fhdr_len = lorawan::mac_header_len(&data);
        out.fhdr = data[..fhdr_len].to_vec();
        fingerprint::compute_unique_id_up(&mut out, &data);
    }

    out
}

/// Convert the txpk record of a PULL_RESP into a downlink record.
pub fn convert_tx_packet(pkt: &TxPacket) -> AnalyticsDownlink {
    let mut out = AnalyticsDownlink {
        tx_time: pkt.tmst,
        tx_gps_time: pkt.tmms,
        fsk_freq_dev: pkt.fdev,
        frequency: pkt.freq,
        channel: 0,
        rf_chain: pkt.rfch,
        power: pkt.powe,
        modulation: parse_modulation(&pkt.modu) as i32,
        coding_rate: parse_coding_rate(&pkt.codr) as i32,
        invert_polarity: pkt.ipol,
        immediately: pkt.imme,
        rf_preamble: pkt.prea,
        size: pkt.size,
        no_crc: pkt.ncrc,
        rx_wall_time: Utc::now().timestamp_millis(),
        ..Default::default()
    };

    match pkt.modu.as_str() {
        "LORA" => {
            out.data_rate = Some(analytics_downlink::DataRate::DataRateLora(
                parse_lora_data_rate(&pkt.datr),
            ));
        }
        "FSK" => {
            if let Ok(rate) = pkt.datr.parse::<u32>() {
                out.data_rate = Some(analytics_downlink::DataRate::DataRateFsk(rate));
            }
        }
        _ => {}
    }

    if let Ok(data) = BASE64.decode(&pkt.data) {
        let fhdr_len = lorawan::mac_header_len(&data);
        out.fhdr = data[..fhdr_len].to_vec();
        fingerprint::compute_unique_id_down(&mut out, &data);
    }

    out
}

/// Convert the stat record of a PUSH_DATA.
pub fn convert_stat(stat: &StatRecord, is_gauge: bool) -> AnalyticsStat {
    AnalyticsStat {
        gw_time: rfc3339_millis(&stat.time),
        gw_latitude: stat.lati,
        gw_longitude: stat.long,
        gw_altitude: stat.alti,
        rx_packets: stat.rxnb,
        rx_with_valid_phy_crc: stat.rxok,
        rx_forwarded: stat.rxfw,
        rx_ackr: stat.ackr,
        tx_received: stat.dwnb,
        tx_emitted: stat.txnb,
        is_gauge,
    }
}
