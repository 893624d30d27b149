//! Minimal LoRaWAN MAC-header probe.
//!
//! The relay never decrypts or validates frames; the only MAC-layer
//! knowledge it needs is how many leading bytes of a PHY payload form
//! the frame header (MHDR + FHDR + FPort), which the analytics side
//! slices off for fingerprinting.

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

/// Length of the OTAA request frames: MHDR(1) + JoinEUI(8) + DevEUI(8) + DevNonce(2)
const JOIN_REQUEST_HEADER_LEN: usize = 19;

/// Number of leading bytes of a raw PHY payload that form the MAC
/// header (MHDR + FHDR + FPort).
///
/// The result is always within `0..=data.len()`: payloads too short to
/// hold the header they announce are taken whole.
pub fn mac_header_len(data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }

    match MType::from(data[0]) {
        MType::JoinRequest | MType::RejoinRequest => {
            // OTAA request frames have a fixed length
            data.len().min(JOIN_REQUEST_HEADER_LEN)
        }
        // OTAA accept frames are fixed-length too, but can extend with
        // the variable CFList, so collect everything
        MType::JoinAccept => data.len(),
        // We don't know anything about proprietary frames
        MType::Proprietary => data.len(),
        _ => {
            // Data frame: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2),
            // then FOpts and usually a port byte right after
            if data.len() < 8 {
                return data.len();
            }
            let fopts_len = (data[5] & 0x0F) as usize;
            if data.len() < 8 + fopts_len + 1 {
                // FOpts does not fit, probably not a LoRaWAN frame
                return data.len();
            }
            8 + fopts_len + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_probes_zero() {
        assert_eq!(mac_header_len(&[]), 0);
    }

    #[test]
    fn data_frame_without_fopts() {
        // MHDR=0x40 (UnconfirmedDataUp), FCtrl=0x00, FPort present
        let data: Vec<u8> = vec![
            0x40, // MHDR
            0x04, 0x03, 0x02, 0x01, // DevAddr
            0x00, // FCtrl (FOptsLen=0)
            0x01, 0x00, // FCnt
            0x01, // FPort
            0xAA, 0xBB, // FRMPayload
            0xEF, 0xBE, 0xAD, 0xDE, // MIC
        ];
        assert_eq!(mac_header_len(&data), 9);
    }

    #[test]
    fn data_frame_with_max_fopts() {
        // FOptsLen=15 with a payload of exactly 8 + 15 + 1 bytes
        let mut data = vec![0x40, 0, 0, 0, 0, 0x0F, 0, 0];
        data.extend_from_slice(&[0u8; 16]);
        assert_eq!(data.len(), 24);
        assert_eq!(mac_header_len(&data), 24);
    }

    #[test]
    fn data_frame_shorter_than_announced_header() {
        // FOptsLen=15 but only 10 bytes of payload
        let data = vec![0x40, 0, 0, 0, 0, 0x0F, 0, 0, 0, 0];
        assert_eq!(mac_header_len(&data), 10);
    }

    #[test]
    fn short_data_frame_is_taken_whole() {
        let data = vec![0x40, 0x01, 0x02];
        assert_eq!(mac_header_len(&data), 3);
    }

    #[test]
    fn join_request_is_fixed_length() {
        let mut data = vec![0x00];
        data.extend_from_slice(&[0u8; 22]);
        assert_eq!(mac_header_len(&data), 19);

        // Truncated request frames are taken whole
        assert_eq!(mac_header_len(&data[..10]), 10);
    }

    #[test]
    fn rejoin_request_matches_join_request() {
        let mut data = vec![0xC0];
        data.extend_from_slice(&[0u8; 22]);
        assert_eq!(mac_header_len(&data), 19);
    }

    #[test]
    fn join_accept_is_taken_whole() {
        let mut data = vec![0x20];
        data.extend_from_slice(&[0u8; 32]);
        assert_eq!(mac_header_len(&data), 33);
    }

    #[test]
    fn proprietary_is_taken_whole() {
        let data = vec![0xE0, 0x01, 0x02, 0x03];
        assert_eq!(mac_header_len(&data), 4);
    }

    #[test]
    fn probe_never_exceeds_input_length() {
        for mhdr in [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0] {
            for len in 0usize..32 {
                let mut data = vec![mhdr];
                data.extend(std::iter::repeat(0xFF).take(len));
                assert!(mac_header_len(&data) <= data.len());
            }
        }
    }
}
