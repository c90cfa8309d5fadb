//! H.264 RTP packetization (RFC 6184)
//!
//! Input access units are Annex-B byte streams. Each NALU at or under
//! the payload cap goes out as a single-NALU packet; larger NALUs are
//! split into FU-A fragments. When an IDR NALU is reached, a STAP-A
//! carrying the out-of-band SPS/PPS is emitted first so decoders can
//! join at the keyframe. The last packet of the frame carries the
//! marker bit.

use bytes::Bytes;

use super::{rtp_timestamp, MediaFrame, Packetizer, RTP_BUFFER_SIZE};
use crate::error::Error;
use crate::packet::{FixedRtpHeader, RtpPacket, RTP_HEADER_SIZE};
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp, MAX_RTP_PAYLOAD_SIZE};

const NAL_TYPE_MASK: u8 = 0x1f;
const NAL_TYPE_IDR: u8 = 5;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// Packetizer for H.264 access units.
pub struct H264Packetizer {
    ssrc: RtpSsrc,
    payload_type: u8,
    clock_rate: u32,
    sequence_number: RtpSequenceNumber,
    buf: Vec<u8>,
    frame_end_marker: bool,
}

impl H264Packetizer {
    pub fn new(ssrc: RtpSsrc, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            sequence_number: 0,
            buf: vec![0u8; RTP_BUFFER_SIZE],
            frame_end_marker: false,
        }
    }

    /// Write the fixed header for the next packet and return the
    /// sequence number it was stamped with.
    fn write_header(&mut self, timestamp: RtpTimestamp, marker: bool) -> RtpSequenceNumber {
        let seq = self.sequence_number;
        let mut header = FixedRtpHeader::new(&mut self.buf);
        header.set_payload_type(self.payload_type);
        header.set_ssrc(self.ssrc);
        header.set_timestamp(timestamp);
        header.set_sequence_number(seq);
        header.set_marker(marker);
        self.sequence_number = self.sequence_number.wrapping_add(1);
        seq
    }

    fn pack_stap_a(
        &mut self,
        nalus: &[Bytes],
        timestamp: RtpTimestamp,
        emit: &mut dyn FnMut(&RtpPacket<'_>),
    ) {
        if nalus.is_empty() {
            return;
        }
        let seq = self.write_header(timestamp, false);
        let mut end = RTP_HEADER_SIZE;

        // STAP-A indicator inherits the NRI bits of the first NALU
        self.buf[end] = NAL_TYPE_STAP_A | (nalus[0][0] & !NAL_TYPE_MASK);
        end += 1;

        for nalu in nalus {
            self.buf[end..end + 2].copy_from_slice(&(nalu.len() as u16).to_be_bytes());
            end += 2;
            self.buf[end..end + nalu.len()].copy_from_slice(nalu);
            end += nalu.len();
        }

        let pkt = RtpPacket::new(self.ssrc, seq, timestamp, RTP_HEADER_SIZE, &self.buf[..end]);
        emit(&pkt);
    }

    fn pack_single_nalu(
        &mut self,
        nalu: &[u8],
        timestamp: RtpTimestamp,
        emit: &mut dyn FnMut(&RtpPacket<'_>),
    ) {
        let marker = self.frame_end_marker;
        let seq = self.write_header(timestamp, marker);
        let end = RTP_HEADER_SIZE + nalu.len();
        self.buf[RTP_HEADER_SIZE..end].copy_from_slice(nalu);

        let pkt = RtpPacket::new(self.ssrc, seq, timestamp, RTP_HEADER_SIZE, &self.buf[..end]);
        emit(&pkt);
    }

    fn pack_fu_a(
        &mut self,
        nalu: &[u8],
        timestamp: RtpTimestamp,
        emit: &mut dyn FnMut(&RtpPacket<'_>),
    ) {
        let nalu_header = nalu[0];
        let fu_indicator = NAL_TYPE_FU_A | (nalu_header & !NAL_TYPE_MASK);

        let mut rest = &nalu[1..];
        let mut start = true;
        loop {
            let end = rest.len() <= MAX_RTP_PAYLOAD_SIZE - 2;
            let chunk_len = if end { rest.len() } else { MAX_RTP_PAYLOAD_SIZE - 2 };

            let marker = end && self.frame_end_marker;
            let seq = self.write_header(timestamp, marker);

            let mut fu_header = nalu_header & NAL_TYPE_MASK;
            if start {
                fu_header |= FU_START;
                start = false;
            }
            if end {
                fu_header |= FU_END;
            }

            self.buf[RTP_HEADER_SIZE] = fu_indicator;
            self.buf[RTP_HEADER_SIZE + 1] = fu_header;
            let total = RTP_HEADER_SIZE + 2 + chunk_len;
            self.buf[RTP_HEADER_SIZE + 2..total].copy_from_slice(&rest[..chunk_len]);

            let pkt = RtpPacket::new(self.ssrc, seq, timestamp, RTP_HEADER_SIZE, &self.buf[..total]);
            emit(&pkt);

            rest = &rest[chunk_len..];
            if end {
                break;
            }
        }
    }
}

impl Packetizer for H264Packetizer {
    fn pack(&mut self, frame: &MediaFrame<'_>, emit: &mut dyn FnMut(&RtpPacket<'_>)) -> Result<()> {
        let nalus = split_annex_b(frame.data);
        if nalus.is_empty() {
            return Err(Error::PayloadError("no NALUs in access unit".into()));
        }
        let timestamp = rtp_timestamp(frame.timestamp_ms, self.clock_rate);

        self.frame_end_marker = false;
        for (i, nalu) in nalus.iter().enumerate() {
            if nalu[0] & NAL_TYPE_MASK == NAL_TYPE_IDR {
                self.pack_stap_a(frame.side_data, timestamp, emit);
            }

            if i + 1 == nalus.len() {
                self.frame_end_marker = true;
            }
            if nalu.len() <= MAX_RTP_PAYLOAD_SIZE {
                self.pack_single_nalu(nalu, timestamp, emit);
            } else {
                self.pack_fu_a(nalu, timestamp, emit);
            }
        }
        Ok(())
    }
}

/// Split an Annex-B byte stream into NALU slices.
///
/// Both 3-byte (00 00 01) and 4-byte (00 00 00 01) start codes are
/// accepted; bytes before the first start code are discarded.
pub fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut nalus = Vec::new();
    let mut nalu_start: Option<usize> = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(start) = nalu_start {
                if code_start > start {
                    nalus.push(&data[start..code_start]);
                }
            }
            nalu_start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(start) = nalu_start {
        if data.len() > start {
            nalus.push(&data[start..]);
        }
    }
    nalus
}
