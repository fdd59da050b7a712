//! RTP packetization for outbound Opus frames
//!
//! One packetizer per outbound track: monotone 16-bit sequence, 32-bit
//! timestamp advancing 960 samples per 20 ms frame, random SSRC.

use bytes::Bytes;
use rand::Rng;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::webrtc::peer::OPUS_PAYLOAD_TYPE;

/// Timestamp increment per 20 ms Opus frame at 48 kHz.
pub const TIMESTAMP_STEP: u32 = 960;

pub struct RtpPacketizer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl Default for RtpPacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpPacketizer {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            sequence: rng.gen(),
            timestamp: rng.gen(),
            ssrc: rng.gen(),
        }
    }

    /// Stamp one Opus frame into an RTP packet.
    pub fn packet(&mut self, payload: Bytes) -> Packet {
        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: OPUS_PAYLOAD_TYPE,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(TIMESTAMP_STEP);
        packet
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_header_fields() {
        let mut packetizer = RtpPacketizer::new();
        let packet = packetizer.packet(Bytes::from_static(&[0xFC, 0x00]));

        assert_eq!(packet.header.version, 2);
        assert!(!packet.header.marker);
        assert_eq!(packet.header.payload_type, OPUS_PAYLOAD_TYPE);
        assert_eq!(packet.header.ssrc, packetizer.ssrc());
        assert_eq!(packet.payload.len(), 2);
    }

    #[test]
    fn sequence_and_timestamp_advance_per_frame() {
        let mut packetizer = RtpPacketizer::new();
        let first = packetizer.packet(Bytes::from_static(&[0]));
        let second = packetizer.packet(Bytes::from_static(&[0]));

        assert_eq!(
            second.header.sequence_number,
            first.header.sequence_number.wrapping_add(1)
        );
        assert_eq!(
            second.header.timestamp,
            first.header.timestamp.wrapping_add(TIMESTAMP_STEP)
        );
        assert_eq!(first.header.ssrc, second.header.ssrc);
    }

    #[test]
    fn sequence_wraps_mod_2_16() {
        let mut packetizer = RtpPacketizer::new();
        packetizer.sequence = u16::MAX;
        let last = packetizer.packet(Bytes::from_static(&[0]));
        let wrapped = packetizer.packet(Bytes::from_static(&[0]));
        assert_eq!(last.header.sequence_number, u16::MAX);
        assert_eq!(wrapped.header.sequence_number, 0);
    }
}
