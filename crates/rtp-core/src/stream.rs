//! Per-SSRC send-side RTP stream state
//!
//! Every outbound packet is recorded here; when NACK is enabled a
//! deep copy lands in a fixed ring of [`SEND_BUFFER_CAPACITY`] slots
//! indexed by `sequence_number % capacity`. Generic NACKs are
//! answered from that ring, rewritten in place to RTX format when a
//! retransmission stream is negotiated. The stream also builds the
//! periodic Sender Report and digests Receiver Report blocks into an
//! RTT estimate.
//!
//! Time is always handed in by the caller as a millisecond reading of
//! its own monotonic clock; the stream never consults a clock itself.

use tracing::trace;

use crate::packet::rtcp::{NackPacket, NtpTime, ReportBlock, SenderReportPacket};
use crate::packet::{FixedRtpHeader, RtpPacket};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Slots in the send ring, per SSRC.
pub const SEND_BUFFER_CAPACITY: usize = 1024;

/// RTT assumed before the first Receiver Report arrives.
pub const DEFAULT_RTT_MILLIS: u64 = 100;

/// Media kind carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Configuration for one outbound SSRC.
#[derive(Debug, Clone)]
pub struct RtpParams {
    pub kind: MediaKind,
    pub ssrc: RtpSsrc,
    pub clock_rate: u32,
    pub payload_type: u8,
    pub rtx_ssrc: RtpSsrc,
    pub rtx_payload_type: u8,
    pub rtx_enabled: bool,
    pub nack_enabled: bool,
    pub twcc_enabled: bool,
}

impl Default for RtpParams {
    fn default() -> Self {
        Self {
            kind: MediaKind::Video,
            ssrc: 0,
            clock_rate: 90_000,
            payload_type: 0,
            rtx_ssrc: 0,
            rtx_payload_type: 0,
            rtx_enabled: false,
            nack_enabled: false,
            twcc_enabled: false,
        }
    }
}

/// Owned copy of an outbound packet kept for retransmission.
///
/// The buffer is allocated with two bytes of tail slack so a single
/// in-place rewrite can promote the packet to RTX format
/// (RFC 4588 Section 8.3) without reallocating.
#[derive(Debug, Clone)]
pub struct RtpStoragePacket {
    ssrc: RtpSsrc,
    sequence_number: RtpSequenceNumber,
    timestamp: RtpTimestamp,
    header_offset: usize,
    data: Vec<u8>,
    resend_millis: u64,
    is_rtx: bool,
}

/// Bytes reserved past the payload for the OSN field.
const RTX_EXTRA_SIZE: usize = 2;

impl RtpStoragePacket {
    /// Deep-copy a generated packet.
    pub fn from_packet(pkt: &RtpPacket<'_>) -> Self {
        let mut data = Vec::with_capacity(pkt.len() + RTX_EXTRA_SIZE);
        data.extend_from_slice(pkt.data());
        Self {
            ssrc: pkt.ssrc(),
            sequence_number: pkt.sequence_number(),
            timestamp: pkt.timestamp(),
            header_offset: pkt.header_offset(),
            data,
            resend_millis: 0,
            is_rtx: false,
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    pub fn sequence_number(&self) -> RtpSequenceNumber {
        self.sequence_number
    }

    pub fn timestamp(&self) -> RtpTimestamp {
        self.timestamp
    }

    /// Serialized bytes, including the OSN field once promoted.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_rtx(&self) -> bool {
        self.is_rtx
    }

    pub fn resend_millis(&self) -> u64 {
        self.resend_millis
    }

    pub fn set_resend_millis(&mut self, millis: u64) {
        self.resend_millis = millis;
    }

    /// Rewrite in place to RTX format (RFC 4588 Section 8.3):
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                         RTP Header                            |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |            OSN                |                               |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               |
    /// |                  Original RTP Packet Payload                  |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    ///
    /// The payload shifts into the reserved slack, the original
    /// sequence number lands in front of it, and the header is
    /// restamped with the RTX SSRC, sequence number and payload
    /// type. A later call only refreshes the sequence number.
    pub fn make_rtx(
        &mut self,
        ssrc: RtpSsrc,
        sequence_number: RtpSequenceNumber,
        payload_type: u8,
    ) {
        if !self.is_rtx {
            let original_len = self.data.len();
            self.data.resize(original_len + RTX_EXTRA_SIZE, 0);
            self.data
                .copy_within(self.header_offset..original_len, self.header_offset + RTX_EXTRA_SIZE);
            // OSN comes straight from the header's sequence field,
            // which still holds the original number at this point
            let osn = [self.data[2], self.data[3]];
            self.data[self.header_offset] = osn[0];
            self.data[self.header_offset + 1] = osn[1];

            let mut header = FixedRtpHeader::wrap(&mut self.data);
            header.set_ssrc(ssrc);
            header.set_sequence_number(sequence_number);
            header.set_payload_type(payload_type);
        } else {
            let mut header = FixedRtpHeader::wrap(&mut self.data);
            header.set_sequence_number(sequence_number);
        }
        self.is_rtx = true;
    }
}

/// Send-side state for one SSRC.
pub struct RtpSendStream {
    params: RtpParams,
    send_buffer: Box<[Option<RtpStoragePacket>]>,
    max_rtp_timestamp: RtpTimestamp,
    max_packet_millis: u64,
    max_resend_delay_in_clock_rate: u32,
    rtt_millis: u64,
    send_packet_count: u32,
    send_octets: u32,
    rtx_sequence_number: RtpSequenceNumber,
}

impl RtpSendStream {
    pub fn new(params: RtpParams) -> Self {
        let mut send_buffer = Vec::with_capacity(SEND_BUFFER_CAPACITY);
        send_buffer.resize_with(SEND_BUFFER_CAPACITY, || None);
        Self {
            max_resend_delay_in_clock_rate: params.clock_rate * 2,
            params,
            send_buffer: send_buffer.into_boxed_slice(),
            max_rtp_timestamp: 0,
            max_packet_millis: 0,
            rtt_millis: DEFAULT_RTT_MILLIS,
            send_packet_count: 0,
            send_octets: 0,
            rtx_sequence_number: 0,
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.params.ssrc
    }

    /// Current RTT estimate in milliseconds.
    pub fn rtt_millis(&self) -> u64 {
        self.rtt_millis
    }

    /// Record a freshly generated packet.
    ///
    /// Updates the send counters and, when NACK is on, deep-copies
    /// the packet into its ring slot, overwriting whatever was there.
    pub fn record_sent(&mut self, pkt: &RtpPacket<'_>, now_millis: u64) {
        if pkt.ssrc() != self.params.ssrc {
            return;
        }
        self.send_packet_count = self.send_packet_count.wrapping_add(1);
        self.send_octets = self.send_octets.wrapping_add(pkt.len() as u32);
        self.max_rtp_timestamp = pkt.timestamp();
        self.max_packet_millis = now_millis;

        if self.params.nack_enabled {
            let slot = pkt.sequence_number() as usize % SEND_BUFFER_CAPACITY;
            self.send_buffer[slot] = Some(RtpStoragePacket::from_packet(pkt));
        }
    }

    /// Answer a Generic NACK, invoking `on_resend` for every lost
    /// packet still worth retransmitting.
    ///
    /// A lost sequence number is skipped when its slot is empty or
    /// holds a different packet, when the stored media is older than
    /// two seconds against the newest timestamp, or when it was
    /// already resent within the current RTT.
    pub fn handle_nack(
        &mut self,
        nack: &NackPacket,
        now_millis: u64,
        on_resend: &mut dyn FnMut(&RtpStoragePacket),
    ) {
        if nack.media_ssrc != self.params.ssrc || !self.params.nack_enabled {
            return;
        }

        for &seq in &nack.lost_sequence_numbers {
            let slot = seq as usize % SEND_BUFFER_CAPACITY;
            let Some(pkt) = self.send_buffer[slot].as_mut() else {
                continue;
            };
            let stored_seq = if pkt.is_rtx() {
                // promoted packets keep their OSN in front of the payload
                u16::from_be_bytes([pkt.data[pkt.header_offset], pkt.data[pkt.header_offset + 1]])
            } else {
                pkt.sequence_number()
            };
            if stored_seq != seq {
                trace!(seq, stored_seq, "send buffer slot overwritten, skipping resend");
                continue;
            }

            if self.max_rtp_timestamp.wrapping_sub(pkt.timestamp())
                > self.max_resend_delay_in_clock_rate
            {
                continue;
            }

            if pkt.resend_millis() != 0
                && now_millis.saturating_sub(pkt.resend_millis()) <= self.rtt_millis
            {
                continue;
            }
            pkt.set_resend_millis(now_millis);

            if self.params.rtx_enabled {
                let rtx_seq = self.rtx_sequence_number;
                self.rtx_sequence_number = self.rtx_sequence_number.wrapping_add(1);
                pkt.make_rtx(self.params.rtx_ssrc, rtx_seq, self.params.rtx_payload_type);
            }
            on_resend(pkt);
        }
    }

    /// Fold a Receiver Report block into the RTT estimate.
    ///
    /// Blocks with `last_sr == 0` carry no timing and are ignored.
    pub fn handle_report_block(&mut self, block: &ReportBlock, now_millis: u64) {
        if block.last_sr == 0 {
            return;
        }
        let compact_now = NtpTime::from_millis(now_millis).to_compact();
        let rtt_compact = compact_now
            .wrapping_sub(block.delay_since_last_sr)
            .wrapping_sub(block.last_sr);
        self.rtt_millis = NtpTime::from_compact(rtt_compact).to_millis();
    }

    /// Build the periodic Sender Report.
    ///
    /// Returns `None` until at least one packet has been sent. The
    /// RTP timestamp is extrapolated from the newest packet by the
    /// time elapsed since it went out.
    pub fn create_sender_report(&self, now_millis: u64) -> Option<SenderReportPacket> {
        if self.send_packet_count == 0 {
            return None;
        }
        let ntp = NtpTime::from_millis(now_millis);
        let elapsed = now_millis.saturating_sub(self.max_packet_millis);
        let elapsed_in_clock_rate = (elapsed * self.params.clock_rate as u64 / 1000) as u32;
        Some(SenderReportPacket {
            sender_ssrc: self.params.ssrc,
            ntp_seconds: ntp.seconds(),
            ntp_fractions: ntp.fractions(),
            rtp_timestamp: self.max_rtp_timestamp.wrapping_add(elapsed_in_clock_rate),
            send_packet_count: self.send_packet_count,
            send_octets: self.send_octets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RTP_HEADER_SIZE;

    fn video_params() -> RtpParams {
        RtpParams {
            kind: MediaKind::Video,
            ssrc: 12345678,
            clock_rate: 90_000,
            payload_type: 125,
            rtx_ssrc: 9527,
            rtx_payload_type: 107,
            rtx_enabled: true,
            nack_enabled: true,
            twcc_enabled: false,
        }
    }

    fn make_packet(seq: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; RTP_HEADER_SIZE + payload.len()];
        let mut header = FixedRtpHeader::new(&mut data);
        header.set_payload_type(125);
        header.set_ssrc(12345678);
        header.set_sequence_number(seq);
        header.set_timestamp(timestamp);
        data[RTP_HEADER_SIZE..].copy_from_slice(payload);
        data
    }

    fn record(stream: &mut RtpSendStream, seq: u16, timestamp: u32, payload: &[u8], now: u64) {
        let data = make_packet(seq, timestamp, payload);
        let pkt = RtpPacket::new(12345678, seq, timestamp, RTP_HEADER_SIZE, &data);
        stream.record_sent(&pkt, now);
    }

    fn nack_for(seqs: &[u16]) -> NackPacket {
        NackPacket {
            sender_ssrc: 1,
            media_ssrc: 12345678,
            lost_sequence_numbers: seqs.to_vec(),
        }
    }

    #[test]
    fn test_nack_retransmits_as_rtx() {
        let mut stream = RtpSendStream::new(video_params());
        for seq in 5u16..=10 {
            record(&mut stream, seq, 1000, &[seq as u8; 4], 10);
        }

        // NACK FCI pid=7 blp=0x0001 expands to 7 and 8
        let mut resent = Vec::new();
        stream.handle_nack(&nack_for(&[7, 8]), 20, &mut |pkt| {
            resent.push(pkt.data().to_vec());
        });

        assert_eq!(resent.len(), 2);
        for (i, data) in resent.iter().enumerate() {
            let osn = u16::from_be_bytes([data[RTP_HEADER_SIZE], data[RTP_HEADER_SIZE + 1]]);
            assert_eq!(osn, 7 + i as u16);
            // RTX SSRC and payload type
            assert_eq!(&data[8..12], &9527u32.to_be_bytes());
            assert_eq!(data[1] & 0x7f, 107);
            // RTX sequence numbers start at zero
            let rtx_seq = u16::from_be_bytes([data[2], data[3]]);
            assert_eq!(rtx_seq, i as u16);
            // payload shifted intact past the OSN
            assert_eq!(&data[RTP_HEADER_SIZE + 2..], &[7 + i as u8; 4]);
        }
    }

    #[test]
    fn test_ring_overwrite_and_slot_validation() {
        let mut stream = RtpSendStream::new(video_params());
        record(&mut stream, 100, 0, b"first", 0);

        // 1024 packets later the slot holds the newer packet
        record(&mut stream, 100 + SEND_BUFFER_CAPACITY as u16, 0, b"second", 1);

        let mut resent = Vec::new();
        stream.handle_nack(&nack_for(&[100]), 5, &mut |pkt| {
            resent.push(pkt.sequence_number());
        });
        // stored sequence number no longer matches, so no resend
        assert!(resent.is_empty());

        let mut resent = Vec::new();
        stream.handle_nack(&nack_for(&[100 + SEND_BUFFER_CAPACITY as u16]), 5, &mut |pkt| {
            resent.push(pkt.data().to_vec());
        });
        assert_eq!(resent.len(), 1);
        assert_eq!(&resent[0][RTP_HEADER_SIZE + 2..], b"second");
    }

    #[test]
    fn test_resend_suppressed_within_rtt() {
        let mut stream = RtpSendStream::new(video_params());
        record(&mut stream, 1, 0, b"data", 0);

        let mut count = 0;
        stream.handle_nack(&nack_for(&[1]), 100, &mut |_| count += 1);
        assert_eq!(count, 1);

        // a second NACK inside the default 100 ms RTT is a no-op
        stream.handle_nack(&nack_for(&[1]), 150, &mut |_| count += 1);
        assert_eq!(count, 1);

        // past the RTT the packet goes out again, with a fresh RTX seq
        let mut rtx_seqs = Vec::new();
        stream.handle_nack(&nack_for(&[1]), 201, &mut |pkt| {
            rtx_seqs.push(u16::from_be_bytes([pkt.data()[2], pkt.data()[3]]));
        });
        assert_eq!(rtx_seqs, vec![1]);
    }

    #[test]
    fn test_stale_media_not_retransmitted() {
        let mut stream = RtpSendStream::new(video_params());
        record(&mut stream, 1, 0, b"old", 0);
        // newest timestamp moves more than 2 s (180000 ticks) ahead
        record(&mut stream, 2, 200_000, b"new", 10);

        let mut count = 0;
        stream.handle_nack(&nack_for(&[1]), 20, &mut |_| count += 1);
        assert_eq!(count, 0);
        stream.handle_nack(&nack_for(&[2]), 20, &mut |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_nack_ignored_when_disabled() {
        let mut params = video_params();
        params.nack_enabled = false;
        let mut stream = RtpSendStream::new(params);
        record(&mut stream, 1, 0, b"data", 0);

        let mut count = 0;
        stream.handle_nack(&nack_for(&[1]), 100, &mut |_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_sender_report_extrapolates_timestamp() {
        let mut stream = RtpSendStream::new(video_params());
        assert!(stream.create_sender_report(0).is_none());

        record(&mut stream, 1, 90_000, &[0u8; 100], 1000);
        let sr = stream.create_sender_report(1500).unwrap();
        assert_eq!(sr.sender_ssrc, 12345678);
        // 500 ms at 90 kHz on top of the newest timestamp
        assert_eq!(sr.rtp_timestamp, 90_000 + 45_000);
        assert_eq!(sr.send_packet_count, 1);
        assert_eq!(sr.send_octets, 112);
        assert_eq!(sr.ntp_seconds, 1);
        assert_eq!(sr.ntp_fractions, 0x8000_0000);
    }

    #[test]
    fn test_report_block_updates_rtt() {
        let mut stream = RtpSendStream::new(video_params());
        assert_eq!(stream.rtt_millis(), DEFAULT_RTT_MILLIS);

        // now = 10 s; SR was sent at 9 s, receiver held it 0.5 s:
        // rtt = 10 - 0.5 - 9 = 0.5 s
        let now_millis = 10_000;
        let last_sr = NtpTime::from_millis(9_000).to_compact();
        let dlsr = NtpTime::from_millis(500).to_compact();
        let block = ReportBlock {
            source_ssrc: 12345678,
            last_sr,
            delay_since_last_sr: dlsr,
            ..Default::default()
        };
        stream.handle_report_block(&block, now_millis);
        assert!((stream.rtt_millis() as i64 - 500).abs() <= 1);

        // last_sr of zero leaves the estimate alone
        let stale = ReportBlock::default();
        stream.handle_report_block(&stale, now_millis);
        assert!((stream.rtt_millis() as i64 - 500).abs() <= 1);
    }
}
