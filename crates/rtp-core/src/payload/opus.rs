//! Opus RTP packetization (RFC 7587)
//!
//! One input frame becomes exactly one RTP packet with the marker
//! bit set; the payload is the Opus frame verbatim.

use super::{rtp_timestamp, MediaFrame, Packetizer, RTP_BUFFER_SIZE};
use crate::error::Error;
use crate::packet::{FixedRtpHeader, RtpPacket, RTP_HEADER_SIZE};
use crate::{Result, RtpSequenceNumber, RtpSsrc};

/// Packetizer for Opus frames.
pub struct OpusPacketizer {
    ssrc: RtpSsrc,
    payload_type: u8,
    clock_rate: u32,
    sequence_number: RtpSequenceNumber,
    buf: Vec<u8>,
}

impl OpusPacketizer {
    pub fn new(ssrc: RtpSsrc, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            sequence_number: 0,
            buf: vec![0u8; RTP_BUFFER_SIZE],
        }
    }
}

impl Packetizer for OpusPacketizer {
    fn pack(&mut self, frame: &MediaFrame<'_>, emit: &mut dyn FnMut(&RtpPacket<'_>)) -> Result<()> {
        if frame.data.is_empty() {
            return Err(Error::PayloadError("empty opus frame".into()));
        }
        if frame.data.len() > self.buf.len() - RTP_HEADER_SIZE {
            return Err(Error::PayloadError(format!(
                "opus frame of {} bytes exceeds buffer",
                frame.data.len()
            )));
        }
        let timestamp = rtp_timestamp(frame.timestamp_ms, self.clock_rate);

        let seq = self.sequence_number;
        let mut header = FixedRtpHeader::new(&mut self.buf);
        header.set_payload_type(self.payload_type);
        header.set_ssrc(self.ssrc);
        header.set_timestamp(timestamp);
        header.set_sequence_number(seq);
        header.set_marker(true);
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let end = RTP_HEADER_SIZE + frame.data.len();
        self.buf[RTP_HEADER_SIZE..end].copy_from_slice(frame.data);

        let pkt = RtpPacket::new(self.ssrc, seq, timestamp, RTP_HEADER_SIZE, &self.buf[..end]);
        emit(&pkt);
        Ok(())
    }
}
