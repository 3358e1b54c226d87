//! RTP packet parsing
//!
//! Read-only view of the RFC 3550 wire format: 12-byte fixed header,
//! optional CSRC list, optional extension block, optional padding whose
//! final byte counts its own length. Anything that does not match the bit
//! layout is rejected before it can reach stream state.

use bytes::Bytes;

use super::{RTP_HEADER_SIZE, RTP_VERSION};
use crate::error::{Error, Result};
use crate::types::payload_types;

/// A parsed RTP packet with its payload copied out of the capture buffer
///
/// The payload copy is the single allocation on the accepted-packet path;
/// the record owns it from here on.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    /// Marker bit
    pub marker: bool,
    /// 7-bit payload type
    pub payload_type: u8,
    /// 16-bit sequence number
    pub sequence: u16,
    /// 32-bit media timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Contributing sources (0–15 entries)
    pub csrc: Vec<u32>,
    /// Payload bytes, padding stripped
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse an RTP packet from a demultiplexed UDP payload
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_HEADER_SIZE {
            return Err(Error::invalid_rtp(format!(
                "packet too short: {} bytes",
                buf.len()
            )));
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(Error::invalid_rtp(format!("unsupported version {version}")));
        }
        let padding = b0 & 0x20 != 0;
        let extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0F) as usize;

        let marker = b1 & 0x80 != 0;
        let payload_type = b1 & 0x7F;

        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = RTP_HEADER_SIZE + 4 * csrc_count;
        if buf.len() < offset {
            return Err(Error::invalid_rtp("truncated CSRC list"));
        }
        let csrc = (0..csrc_count)
            .map(|i| {
                let at = RTP_HEADER_SIZE + 4 * i;
                u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
            })
            .collect();

        if extension {
            if buf.len() < offset + 4 {
                return Err(Error::invalid_rtp("truncated extension header"));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + 4 * words;
            if buf.len() < offset {
                return Err(Error::invalid_rtp("truncated extension data"));
            }
        }

        let mut end = buf.len();
        if padding {
            let pad_len = buf[end - 1] as usize;
            if pad_len == 0 || offset + pad_len > end {
                return Err(Error::invalid_rtp("invalid padding length"));
            }
            end -= pad_len;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            payload: Bytes::copy_from_slice(&buf[offset..end]),
        })
    }

    /// Audio plausibility filter applied after parsing
    ///
    /// Rejects payload types outside the audio ranges and payloads too short
    /// for the codec they claim. PCMU/PCMA carry at least one full 20 ms
    /// frame (160 bytes).
    pub fn validate_audio(&self) -> Result<()> {
        if !payload_types::is_audio(self.payload_type) {
            return Err(Error::invalid_rtp(format!(
                "payload type {} is not an audio type",
                self.payload_type
            )));
        }
        let min_len = match self.payload_type {
            payload_types::PCMU | payload_types::PCMA => 160,
            _ => 1,
        };
        if self.payload.len() < min_len {
            return Err(Error::invalid_rtp(format!(
                "payload too short for PT {}: {} bytes",
                self.payload_type,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_packet(
        seq: u16,
        ts: u32,
        ssrc: u32,
        pt: u8,
        payload: &[u8],
        csrc: &[u32],
        padding: usize,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut b0 = 0x80; // version 2
        if padding > 0 {
            b0 |= 0x20;
        }
        b0 |= csrc.len() as u8;
        buf.push(b0);
        buf.push(pt & 0x7F);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(&ssrc.to_be_bytes());
        for c in csrc {
            buf.extend_from_slice(&c.to_be_bytes());
        }
        buf.extend_from_slice(payload);
        if padding > 0 {
            buf.extend(std::iter::repeat(0u8).take(padding - 1));
            buf.push(padding as u8);
        }
        buf
    }

    #[test]
    fn test_parse_minimal() {
        let wire = build_packet(1000, 160_000, 0xDEAD_BEEF, 0, &[0x7F; 160], &[], 0);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert_eq!(pkt.sequence, 1000);
        assert_eq!(pkt.timestamp, 160_000);
        assert_eq!(pkt.ssrc, 0xDEAD_BEEF);
        assert_eq!(pkt.payload_type, 0);
        assert_eq!(pkt.payload.len(), 160);
        assert!(pkt.validate_audio().is_ok());
    }

    #[test]
    fn test_parse_csrc_and_padding() {
        let wire = build_packet(7, 80, 1, 8, &[0x55; 160], &[0xAAAA, 0xBBBB], 4);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert_eq!(pkt.csrc, vec![0xAAAA, 0xBBBB]);
        assert_eq!(pkt.payload.len(), 160);
    }

    #[test]
    fn test_parse_extension() {
        let mut wire = build_packet(7, 80, 1, 96, &[], &[], 0);
        // extension flag + one 4-byte extension word after the preamble
        wire[0] |= 0x10;
        wire.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4, 9, 9]);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert_eq!(pkt.payload.as_ref(), &[9, 9]);
    }

    #[test]
    fn test_reject_short_and_bad_version() {
        assert!(RtpPacket::parse(&[0x80; 11]).is_err());

        let mut wire = build_packet(7, 80, 1, 0, &[0; 160], &[], 0);
        wire[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn test_reject_truncated_csrc() {
        let mut wire = build_packet(7, 80, 1, 0, &[], &[], 0);
        wire[0] |= 0x03; // claims 2 CSRCs that are not present
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn test_reject_bad_padding() {
        let mut wire = build_packet(7, 80, 1, 0, &[1, 2, 3], &[], 0);
        wire[0] |= 0x20;
        *wire.last_mut().unwrap() = 200; // padding longer than the packet
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn test_validate_audio_sizes() {
        let wire = build_packet(7, 80, 1, 0, &[0x7F; 20], &[], 0);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert!(pkt.validate_audio().is_err(), "short PCMU frame accepted");

        let wire = build_packet(7, 80, 1, 50, &[0x7F; 160], &[], 0);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert!(pkt.validate_audio().is_err(), "PT 50 is not audio");
    }
}
