use bytes::{Buf, BufMut};

use super::{packet_type, RtcpHeader};
use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Report block in RTCP SR/RR packets (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportBlock {
    /// SSRC of the source this report is about
    pub source_ssrc: RtpSsrc,

    /// Fraction of packets lost since the last report
    pub fraction_lost: u8,

    /// Cumulative packets lost (24-bit on the wire, kept unsigned)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub extended_high_seq: u32,

    /// Interarrival jitter estimate
    pub jitter: u32,

    /// Compact NTP timestamp of the last SR received from the source
    pub last_sr: u32,

    /// Delay since that SR, in units of 1/65536 s
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    /// Serialized size in bytes
    pub const SIZE: usize = 24;

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }
        let source_ssrc = buf.get_u32();
        let fraction_lost = buf.get_u8();
        let cumulative_lost =
            ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
        Ok(Self {
            source_ssrc,
            fraction_lost,
            cumulative_lost,
            extended_high_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.source_ssrc);
        buf.put_u8(self.fraction_lost);
        buf.put_u8((self.cumulative_lost >> 16) as u8);
        buf.put_u8((self.cumulative_lost >> 8) as u8);
        buf.put_u8(self.cumulative_lost as u8);
        buf.put_u32(self.extended_high_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

/// RTCP Receiver Report (RR) packet
/// Defined in RFC 3550 Section 6.4.2
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReportPacket {
    /// SSRC of the reporting receiver
    pub sender_ssrc: RtpSsrc,

    /// One block per reported source
    pub report_blocks: Vec<ReportBlock>,
}

impl ReceiverReportPacket {
    /// Parse the body of an RR whose common header was already read.
    pub fn parse(header: &RtcpHeader, buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }
        let sender_ssrc = buf.get_u32();
        let mut report_blocks = Vec::with_capacity(header.count_or_format as usize);
        for _ in 0..header.count_or_format {
            report_blocks.push(ReportBlock::parse(buf)?);
        }
        Ok(Self {
            sender_ssrc,
            report_blocks,
        })
    }

    /// Serialize the report, common header included.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        let length = (4 + self.report_blocks.len() * ReportBlock::SIZE) / 4;
        RtcpHeader {
            padding: false,
            count_or_format: self.report_blocks.len() as u8,
            packet_type: packet_type::RR,
            length: length as u16,
        }
        .serialize(buf);
        buf.put_u32(self.sender_ssrc);
        for block in &self.report_blocks {
            block.serialize(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_block() -> ReportBlock {
        ReportBlock {
            source_ssrc: 0x12345678,
            fraction_lost: 42,
            cumulative_lost: 0x00abcdef,
            extended_high_seq: 5000,
            jitter: 100,
            last_sr: 0x87654321,
            delay_since_last_sr: 1500,
        }
    }

    #[test]
    fn test_report_block_round_trip() {
        let block = sample_block();
        let mut buf = BytesMut::new();
        block.serialize(&mut buf);
        assert_eq!(buf.len(), ReportBlock::SIZE);

        let parsed = ReportBlock::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn test_receiver_report_round_trip() {
        let rr = ReceiverReportPacket {
            sender_ssrc: 0xcafebabe,
            report_blocks: vec![sample_block(), sample_block()],
        };
        let mut buf = BytesMut::new();
        rr.serialize(&mut buf);

        let mut cursor = &buf[..];
        let header = RtcpHeader::parse(&mut cursor).unwrap();
        assert_eq!(header.packet_type, packet_type::RR);
        assert_eq!(header.count_or_format, 2);

        let parsed = ReceiverReportPacket::parse(&header, &mut cursor).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn test_truncated_block_fails() {
        let mut data = &[0u8; 10][..];
        assert!(ReportBlock::parse(&mut data).is_err());
    }
}
