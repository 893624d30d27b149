//! Stable per-frame identifiers for radio-level deduplication.
//!
//! The encrypted LoRaWAN payload is already a good source of entropy,
//! but a mote that fails to advance its frame counter retransmits the
//! exact same bytes. The radio parameters that stay constant across
//! such retransmissions (frequency, coding rate, data rate) are mixed
//! into the hash so the id still keys the transmission window.
//!
//! The byte layout of the hash input is a wire contract shared with
//! the server-side deduplicator and must not change:
//!
//! ```text
//! payload ‖ freq(u32 LE) ‖ coding_rate(u16 LE)
//!         ‖ 0x01 ‖ bandwidth(u16 LE) ‖ sf(u16 LE)     (LoRa)
//!         ‖ 0x02 ‖ rate(u32 LE)                       (FSK)
//! ```

use sha1::{Digest, Sha1};

use super::api::{analytics_downlink, analytics_uplink, AnalyticsDownlink, AnalyticsUplink};

const TAG_LORA: u8 = 0x01;
const TAG_FSK: u8 = 0x02;

enum DataRateParams {
    None,
    Lora { bandwidth: i32, spreading_factor: i32 },
    Fsk(u32),
}

fn digest(full_payload: &[u8], frequency: f32, coding_rate: i32, rate: DataRateParams) -> Vec<u8> {
    let mut extra = Vec::with_capacity(11);
    extra.extend_from_slice(&(frequency as u32).to_le_bytes());
    extra.extend_from_slice(&(coding_rate as u16).to_le_bytes());

    match rate {
        DataRateParams::Lora {
            bandwidth,
            spreading_factor,
        } => {
            extra.push(TAG_LORA);
            extra.extend_from_slice(&(bandwidth as u16).to_le_bytes());
            extra.extend_from_slice(&(spreading_factor as u16).to_le_bytes());
        }
        DataRateParams::Fsk(rate) => {
            extra.push(TAG_FSK);
            extra.extend_from_slice(&rate.to_le_bytes());
        }
        DataRateParams::None => {}
    }

    let mut hasher = Sha1::new();
    hasher.update(full_payload);
    hasher.update(&extra);
    hasher.finalize().to_vec()
}

/// Compute and assign the 20-byte unique id of an uplink record.
pub fn compute_unique_id_up(up: &mut AnalyticsUplink, full_payload: &[u8]) {
    let rate = match up.data_rate {
        Some(analytics_uplink::DataRate::DataRateLora(dr)) => DataRateParams::Lora {
            bandwidth: dr.bandwidth,
            spreading_factor: dr.spreading_factor,
        },
        Some(analytics_uplink::DataRate::DataRateFsk(rate)) => DataRateParams::Fsk(rate),
        None => DataRateParams::None,
    };
    up.unique_id = digest(full_payload, up.frequency, up.coding_rate, rate);
}

/// Compute and assign the 20-byte unique id of a downlink record.
pub fn compute_unique_id_down(down: &mut AnalyticsDownlink, full_payload: &[u8]) {
    let rate = match down.data_rate {
        Some(analytics_downlink::DataRate::DataRateLora(dr)) => DataRateParams::Lora {
            bandwidth: dr.bandwidth,
            spreading_factor: dr.spreading_factor,
        },
        Some(analytics_downlink::DataRate::DataRateFsk(rate)) => DataRateParams::Fsk(rate),
        None => DataRateParams::None,
    };
    down.unique_id = digest(full_payload, down.frequency, down.coding_rate, rate);
}
