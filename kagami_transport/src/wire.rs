//! Video stream packet framing.
//!
//! Every packet starts with a 12-byte header: a big-endian u64 whose top two
//! bits are flags and whose low 62 bits are the presentation timestamp,
//! followed by a big-endian u32 payload length. A header whose pts field is
//! all-ones announces a codec configuration packet (SPS/PPS/VPS).

use crate::{Result, TransportError};

pub const HEADER_LEN: usize = 12;

const FLAG_CONFIG: u64 = 1 << 63;
const FLAG_KEY_FRAME: u64 = 1 << 62;
const PTS_MASK: u64 = FLAG_KEY_FRAME - 1;
const NO_PTS: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// `None` for codec configuration packets.
    pub pts: Option<u64>,
    pub key_frame: bool,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn config(payload_len: u32) -> Self {
        Self {
            pts: None,
            key_frame: false,
            payload_len,
        }
    }

    pub fn media(pts: u64, key_frame: bool, payload_len: u32) -> Self {
        Self {
            pts: Some(pts & PTS_MASK),
            key_frame,
            payload_len,
        }
    }

    pub fn is_config(&self) -> bool {
        self.pts.is_none()
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let word = match self.pts {
            None => NO_PTS,
            Some(pts) => {
                let mut word = pts & PTS_MASK;
                if self.key_frame {
                    word |= FLAG_KEY_FRAME;
                }
                word
            }
        };

        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(&word.to_be_bytes());
        out[8..].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::Malformed("video header"));
        }
        let word = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        let payload_len = u32::from_be_bytes(bytes[8..12].try_into().unwrap());

        if word == NO_PTS || word & FLAG_CONFIG != 0 {
            return Ok(Self::config(payload_len));
        }
        Ok(Self {
            pts: Some(word & PTS_MASK),
            key_frame: word & FLAG_KEY_FRAME != 0,
            payload_len,
        })
    }
}

/// The 12-byte stream preamble the agent sends in reliable-UDP mode before
/// the first packet: codec four-cc, width, height, all big-endian u32.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoHeader {
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 {
            return Err(TransportError::Malformed("stream preamble"));
        }
        Ok(Self {
            codec_id: u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
            width: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            height: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
        })
    }

    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.codec_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.width.to_be_bytes());
        out[8..12].copy_from_slice(&self.height.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_header_round_trip() {
        let hdr = PacketHeader::media(0x1234_5678_9abc, true, 4096);
        let decoded = PacketHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
        assert!(!decoded.is_config());
        assert!(decoded.key_frame);
    }

    #[test]
    fn config_header_is_all_ones() {
        let hdr = PacketHeader::config(40);
        let bytes = hdr.encode();
        assert_eq!(&bytes[..8], &[0xff; 8]);
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert!(decoded.is_config());
        assert_eq!(decoded.payload_len, 40);
    }

    #[test]
    fn pts_flags_do_not_leak_into_timestamp() {
        let hdr = PacketHeader::media(u64::MAX, false, 1);
        let decoded = PacketHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded.pts, Some(u64::MAX & PTS_MASK));
        assert!(!decoded.key_frame);
    }

    #[test]
    fn short_header_rejected() {
        assert!(PacketHeader::decode(&[0u8; 11]).is_err());
    }
}
