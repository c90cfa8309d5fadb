use bytes::{Buf, BufMut, BytesMut};

use super::{packet_type, RtcpHeader};
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// RTCP Sender Report (SR) packet
/// Defined in RFC 3550 Section 6.4.1
///
/// This endpoint only sends media, so no report blocks are attached.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReportPacket {
    /// SSRC of the sender
    pub sender_ssrc: RtpSsrc,

    /// NTP timestamp seconds of this report
    pub ntp_seconds: u32,

    /// NTP timestamp fractions of this report
    pub ntp_fractions: u32,

    /// RTP timestamp corresponding to the NTP timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// Count of original packets sent (retransmissions excluded)
    pub send_packet_count: u32,

    /// Count of octets sent (retransmissions excluded)
    pub send_octets: u32,
}

impl SenderReportPacket {
    /// Sender info plus sender SSRC, in bytes
    const SENDER_BASE_LENGTH: usize = 24;

    /// Serialized size of the report
    pub const SIZE: usize = 4 + Self::SENDER_BASE_LENGTH;

    /// Serialize the report, common header included.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        RtcpHeader {
            padding: false,
            count_or_format: 0,
            packet_type: packet_type::SR,
            length: (Self::SIZE / 4 - 1) as u16,
        }
        .serialize(buf);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.ntp_seconds);
        buf.put_u32(self.ntp_fractions);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.send_packet_count);
        buf.put_u32(self.send_octets);
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.serialize(&mut buf);
        buf
    }

    /// Parse a full SR packet, common header included.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let header = RtcpHeader::parse(&mut buf)?;
        if header.packet_type != packet_type::SR {
            return Err(Error::RtcpError(format!(
                "not a sender report: pt {}",
                header.packet_type
            )));
        }
        if buf.remaining() < Self::SENDER_BASE_LENGTH {
            return Err(Error::BufferTooSmall {
                required: Self::SENDER_BASE_LENGTH,
                available: buf.remaining(),
            });
        }
        Ok(Self {
            sender_ssrc: buf.get_u32(),
            ntp_seconds: buf.get_u32(),
            ntp_fractions: buf.get_u32(),
            rtp_timestamp: buf.get_u32(),
            send_packet_count: buf.get_u32(),
            send_octets: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_layout() {
        let sr = SenderReportPacket {
            sender_ssrc: 0x12345678,
            ntp_seconds: 1,
            ntp_fractions: 0x8000_0000,
            rtp_timestamp: 90_000,
            send_packet_count: 10,
            send_octets: 1000,
        };
        let bytes = sr.to_bytes();
        assert_eq!(bytes.len(), SenderReportPacket::SIZE);
        // V=2, count 0, PT 200, length 6 words
        assert_eq!(&bytes[..4], &[0x80, 200, 0, 6]);
        assert_eq!(&bytes[4..8], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_parse_then_reserialize_is_byte_exact() {
        let sr = SenderReportPacket {
            sender_ssrc: 0xdeadbeef,
            ntp_seconds: 0x11223344,
            ntp_fractions: 0x55667788,
            rtp_timestamp: 0x99aabbcc,
            send_packet_count: 1000,
            send_octets: 100_000,
        };
        let bytes = sr.to_bytes();
        let parsed = SenderReportPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, sr);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let sr = SenderReportPacket::default();
        let mut bytes = sr.to_bytes();
        bytes[1] = 201;
        assert!(SenderReportPacket::parse(&bytes).is_err());
    }
}
