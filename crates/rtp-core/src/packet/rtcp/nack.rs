use bytes::{Buf, BufMut};

use super::{packet_type, RtcpHeader, RTPFB_FMT_NACK};
use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc};

/// Generic NACK transport feedback (RFC 4585 Section 6.2.1)
///
/// The FCI is a run of (PID, BLP) pairs; bit `i` of a BLP marks
/// `PID + i + 1` as lost. Parsing expands the pairs into the flat
/// list of lost sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NackPacket {
    /// SSRC of the packet sender
    pub sender_ssrc: RtpSsrc,

    /// SSRC of the media source the feedback is about
    pub media_ssrc: RtpSsrc,

    /// Expanded lost sequence numbers
    pub lost_sequence_numbers: Vec<RtpSequenceNumber>,
}

impl NackPacket {
    /// Sender SSRC plus media SSRC, in bytes
    const COMMON_FEEDBACK_LENGTH: usize = 8;

    /// One (PID, BLP) pair, in bytes
    const ITEM_LENGTH: usize = 4;

    /// Parse the body of a NACK whose common header was already read.
    pub fn parse(header: &RtcpHeader, buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::COMMON_FEEDBACK_LENGTH {
            return Err(Error::BufferTooSmall {
                required: Self::COMMON_FEEDBACK_LENGTH,
                available: buf.remaining(),
            });
        }
        let sender_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();

        let payload_len = header.length as usize * 4;
        let item_count = payload_len.saturating_sub(Self::COMMON_FEEDBACK_LENGTH) / Self::ITEM_LENGTH;
        let mut lost_sequence_numbers = Vec::new();
        for _ in 0..item_count {
            if buf.remaining() < Self::ITEM_LENGTH {
                return Err(Error::BufferTooSmall {
                    required: Self::ITEM_LENGTH,
                    available: buf.remaining(),
                });
            }
            let mut pid = buf.get_u16();
            let blp = buf.get_u16();
            lost_sequence_numbers.push(pid);

            pid = pid.wrapping_add(1);
            let mut bitmask = blp;
            while bitmask != 0 {
                if bitmask & 1 != 0 {
                    lost_sequence_numbers.push(pid);
                }
                bitmask >>= 1;
                pid = pid.wrapping_add(1);
            }
        }

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            lost_sequence_numbers,
        })
    }

    /// Serialize the NACK, common header included, re-packing the
    /// lost list into (PID, BLP) pairs.
    pub fn serialize(&self, buf: &mut impl BufMut) {
        let mut items: Vec<(u16, u16)> = Vec::new();
        for &seq in &self.lost_sequence_numbers {
            match items.last_mut() {
                Some((pid, blp)) if seq.wrapping_sub(*pid) >= 1 && seq.wrapping_sub(*pid) <= 16 => {
                    *blp |= 1 << (seq.wrapping_sub(*pid) - 1);
                }
                _ => items.push((seq, 0)),
            }
        }

        let length = (Self::COMMON_FEEDBACK_LENGTH + items.len() * Self::ITEM_LENGTH) / 4;
        RtcpHeader {
            padding: false,
            count_or_format: RTPFB_FMT_NACK,
            packet_type: packet_type::RTPFB,
            length: length as u16,
        }
        .serialize(buf);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for (pid, blp) in items {
            buf.put_u16(pid);
            buf.put_u16(blp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parse_back(data: &[u8]) -> NackPacket {
        let mut cursor = data;
        let header = RtcpHeader::parse(&mut cursor).unwrap();
        NackPacket::parse(&header, &mut cursor).unwrap()
    }

    #[test]
    fn test_blp_expansion() {
        // PID 100, BLP 0b0000_0000_0000_0101 expands to 100, 101, 103
        let mut buf = BytesMut::new();
        RtcpHeader {
            padding: false,
            count_or_format: RTPFB_FMT_NACK,
            packet_type: packet_type::RTPFB,
            length: 3,
        }
        .serialize(&mut buf);
        buf.put_u32(1);
        buf.put_u32(2);
        buf.put_u16(100);
        buf.put_u16(0b0000_0000_0000_0101);

        let nack = parse_back(&buf);
        assert_eq!(nack.lost_sequence_numbers, vec![100, 101, 103]);
    }

    #[test]
    fn test_round_trip() {
        let nack = NackPacket {
            sender_ssrc: 0x11111111,
            media_ssrc: 0x22222222,
            lost_sequence_numbers: vec![7, 8, 20, 500],
        };
        let mut buf = BytesMut::new();
        nack.serialize(&mut buf);
        assert_eq!(parse_back(&buf), nack);
    }

    #[test]
    fn test_expansion_wraps_at_sequence_boundary() {
        let mut buf = BytesMut::new();
        RtcpHeader {
            padding: false,
            count_or_format: RTPFB_FMT_NACK,
            packet_type: packet_type::RTPFB,
            length: 3,
        }
        .serialize(&mut buf);
        buf.put_u32(1);
        buf.put_u32(2);
        buf.put_u16(65535);
        buf.put_u16(0b1);

        let nack = parse_back(&buf);
        assert_eq!(nack.lost_sequence_numbers, vec![65535, 0]);
    }
}
