//! RTCP packet types
//!
//! Inbound feedback arrives as compound datagrams: a concatenation of
//! RTCP packets sharing the 4-byte common header (RFC 3550 §6.4.1).
//! [`CompoundRtcp::parse`] splits one datagram and decodes the packet
//! kinds this send-only endpoint reacts to — Receiver Reports and
//! Generic NACKs — skipping everything else by length.

mod nack;
mod ntp;
mod receiver_report;
mod sender_report;

pub use nack::NackPacket;
pub use ntp::NtpTime;
pub use receiver_report::{ReceiverReportPacket, ReportBlock};
pub use sender_report::SenderReportPacket;

use bytes::{Buf, BufMut};
use tracing::warn;

use crate::error::Error;
use crate::Result;

/// RTCP version field value (RFC 3550)
pub const RTCP_VERSION: u8 = 2;

/// Minimum bytes needed for the common header
pub const RTCP_MIN_HEADER_LEN: usize = 4;

/// RTCP packet type codes handled or recognized by this endpoint
pub mod packet_type {
    pub const FIR: u8 = 192;
    pub const SR: u8 = 200;
    pub const RR: u8 = 201;
    pub const SDES: u8 = 202;
    pub const BYE: u8 = 203;
    pub const APP: u8 = 204;
    pub const RTPFB: u8 = 205;
    pub const PSFB: u8 = 206;
    pub const XR: u8 = 207;
}

/// Generic NACK feedback message type (RFC 4585 §6.2.1)
pub const RTPFB_FMT_NACK: u8 = 1;

/// Common header shared by every RTCP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Padding flag
    pub padding: bool,

    /// Reception report count or feedback format, depending on type
    pub count_or_format: u8,

    /// Packet type
    pub packet_type: u8,

    /// Packet length in 32-bit words, not counting this header
    pub length: u16,
}

impl RtcpHeader {
    /// Parse the common header from the front of `buf`.
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTCP_MIN_HEADER_LEN {
            return Err(Error::BufferTooSmall {
                required: RTCP_MIN_HEADER_LEN,
                available: buf.remaining(),
            });
        }
        let first = buf.get_u8();
        let version = first >> 6;
        if version != RTCP_VERSION {
            return Err(Error::RtcpError(format!("unexpected version {}", version)));
        }
        Ok(Self {
            padding: (first & 0x20) != 0,
            count_or_format: first & 0x1f,
            packet_type: buf.get_u8(),
            length: buf.get_u16(),
        })
    }

    /// Serialize the common header.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        let mut first = RTCP_VERSION << 6;
        if self.padding {
            first |= 0x20;
        }
        first |= self.count_or_format & 0x1f;
        buf.put_u8(first);
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
    }
}

/// One decoded packet out of a compound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    ReceiverReport(ReceiverReportPacket),
    Nack(NackPacket),
    /// Recognized but unhandled; parsed only far enough to skip
    Other { packet_type: u8, format: u8 },
}

/// A parsed compound RTCP datagram
#[derive(Debug, Clone, Default)]
pub struct CompoundRtcp {
    packets: Vec<RtcpPacket>,
}

impl CompoundRtcp {
    /// Split `data` into its constituent RTCP packets.
    ///
    /// Fails if any packet header is malformed or claims more bytes
    /// than the datagram holds; the caller drops the whole datagram.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut packets = Vec::new();
        let mut rest = data;
        while rest.len() >= RTCP_MIN_HEADER_LEN {
            let mut cursor = rest;
            let header = RtcpHeader::parse(&mut cursor)?;
            let payload_len = header.length as usize * 4;
            if cursor.remaining() < payload_len {
                return Err(Error::BufferTooSmall {
                    required: payload_len,
                    available: cursor.remaining(),
                });
            }
            let mut payload = &rest[RTCP_MIN_HEADER_LEN..RTCP_MIN_HEADER_LEN + payload_len];

            let packet = match header.packet_type {
                packet_type::RR => {
                    RtcpPacket::ReceiverReport(ReceiverReportPacket::parse(&header, &mut payload)?)
                }
                packet_type::RTPFB if header.count_or_format == RTPFB_FMT_NACK => {
                    RtcpPacket::Nack(NackPacket::parse(&header, &mut payload)?)
                }
                other => RtcpPacket::Other {
                    packet_type: other,
                    format: header.count_or_format,
                },
            };
            packets.push(packet);
            rest = &rest[RTCP_MIN_HEADER_LEN + payload_len..];
        }

        if !rest.is_empty() {
            warn!("trailing {} bytes after last rtcp packet", rest.len());
        }
        Ok(Self { packets })
    }

    pub fn packets(&self) -> &[RtcpPacket] {
        &self.packets
    }
}

/// Classify a datagram as RTCP.
///
/// Requires at least a common header, version 2, and a payload type
/// in the RTCP range. 193 (the RFC 2032 NACK) is deliberately not
/// claimed so it can fall through to the RTP check.
pub fn is_rtcp(data: &[u8]) -> bool {
    if data.len() < RTCP_MIN_HEADER_LEN {
        return false;
    }
    if data[0] >> 6 != RTCP_VERSION {
        return false;
    }
    matches!(data[1], 192 | 195 | 200..=207)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_is_rtcp_classification() {
        // SR with version 2
        assert!(is_rtcp(&[0x80, 200, 0, 6]));
        assert!(is_rtcp(&[0x81, 201, 0, 7]));
        assert!(is_rtcp(&[0x80, 192, 0, 2]));
        assert!(is_rtcp(&[0x80, 195, 0, 2]));
        // 193 falls through to RTP handling
        assert!(!is_rtcp(&[0x80, 193, 0, 2]));
        // wrong version
        assert!(!is_rtcp(&[0x40, 200, 0, 6]));
        // RTP payload types are not RTCP
        assert!(!is_rtcp(&[0x80, 96, 0, 6]));
        // too short
        assert!(!is_rtcp(&[0x80, 200]));
    }

    #[test]
    fn test_compound_parse_rr_and_nack() {
        let mut data = BytesMut::new();

        // RR with one report block
        let block = ReportBlock {
            source_ssrc: 0x12345678,
            fraction_lost: 3,
            cumulative_lost: 17,
            extended_high_seq: 1000,
            jitter: 5,
            last_sr: 0xaabbccdd,
            delay_since_last_sr: 100,
        };
        let rr = ReceiverReportPacket {
            sender_ssrc: 0x01020304,
            report_blocks: vec![block],
        };
        rr.serialize(&mut data);

        // Generic NACK
        let nack = NackPacket {
            sender_ssrc: 0x01020304,
            media_ssrc: 0x12345678,
            lost_sequence_numbers: vec![100, 101, 103],
        };
        nack.serialize(&mut data);

        let compound = CompoundRtcp::parse(&data).unwrap();
        assert_eq!(compound.packets().len(), 2);
        match &compound.packets()[0] {
            RtcpPacket::ReceiverReport(rr) => {
                assert_eq!(rr.sender_ssrc, 0x01020304);
                assert_eq!(rr.report_blocks.len(), 1);
                assert_eq!(rr.report_blocks[0].source_ssrc, 0x12345678);
            }
            other => panic!("expected receiver report, got {:?}", other),
        }
        match &compound.packets()[1] {
            RtcpPacket::Nack(nack) => {
                assert_eq!(nack.media_ssrc, 0x12345678);
                assert_eq!(nack.lost_sequence_numbers, vec![100, 101, 103]);
            }
            other => panic!("expected nack, got {:?}", other),
        }
    }

    #[test]
    fn test_compound_skips_unknown_types() {
        let mut data = BytesMut::new();
        // SDES-like packet: header plus one 4-byte chunk
        RtcpHeader {
            padding: false,
            count_or_format: 1,
            packet_type: packet_type::SDES,
            length: 1,
        }
        .serialize(&mut data);
        data.extend_from_slice(&[0, 0, 0, 0]);

        let compound = CompoundRtcp::parse(&data).unwrap();
        assert_eq!(
            compound.packets(),
            &[RtcpPacket::Other {
                packet_type: packet_type::SDES,
                format: 1
            }]
        );
    }

    #[test]
    fn test_compound_truncated_fails() {
        // header claims 6 words of payload but carries none
        let data = [0x80, 200, 0, 6];
        assert!(CompoundRtcp::parse(&data).is_err());
    }
}
