//! Per-subscriber media stream
//!
//! Owns the H.264 and Opus packetizers and one send stream per SSRC.
//! Media packets are dispatched to the right packetizer; every
//! generated RTP packet goes out through the caller's sink and is
//! recorded in its send stream. Inbound compound RTCP drives the
//! NACK and RTT machinery; a periodic tick emits Sender Reports.
//!
//! All methods run on the owning transport's loop, which also
//! supplies the millisecond clock.

use std::collections::HashMap;

use bytes::BytesMut;
use rtcast_rtp_core::{
    CompoundRtcp, H264Packetizer, MediaFrame, MediaKind as RtpMediaKind, OpusPacketizer,
    Packetizer, RtcpPacket, RtpParams, RtpSendStream, RtpSsrc,
};
use tracing::{debug, warn};

use crate::media::{MediaKind, MediaPacket};
use crate::Result;

/// Stack buffer size for serialized Sender Reports.
const RTCP_BUFFER_SIZE: usize = 1500;

/// Where finished packets go: the transport implements this by
/// protecting with SRTP and writing to its socket.
pub trait MediaStreamOutput {
    fn send_rtp(&mut self, data: &[u8]);
    fn send_rtcp(&mut self, data: &[u8]);
}

/// Packetizers plus per-SSRC send state for one subscriber.
#[derive(Default)]
pub struct MediaStream {
    h264_packetizer: Option<H264Packetizer>,
    opus_packetizer: Option<OpusPacketizer>,
    rtp_streams: HashMap<RtpSsrc, RtpSendStream>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one outbound SSRC and its packetizer.
    pub fn add_rtp_stream(&mut self, params: RtpParams) {
        match params.kind {
            RtpMediaKind::Video => {
                self.h264_packetizer = Some(H264Packetizer::new(
                    params.ssrc,
                    params.payload_type,
                    params.clock_rate,
                ));
            }
            RtpMediaKind::Audio => {
                self.opus_packetizer = Some(OpusPacketizer::new(
                    params.ssrc,
                    params.payload_type,
                    params.clock_rate,
                ));
            }
        }
        self.rtp_streams.insert(params.ssrc, RtpSendStream::new(params));
    }

    /// Packetize one media packet and send every generated RTP
    /// packet.
    pub fn handle_media_packet(
        &mut self,
        packet: &MediaPacket,
        now_millis: u64,
        out: &mut dyn MediaStreamOutput,
    ) -> Result<()> {
        let packetizer: &mut dyn Packetizer = match packet.kind {
            MediaKind::Video => match self.h264_packetizer.as_mut() {
                Some(p) => p,
                None => return Ok(()),
            },
            MediaKind::Audio => match self.opus_packetizer.as_mut() {
                Some(p) => p,
                None => return Ok(()),
            },
        };
        let frame = MediaFrame {
            data: &packet.data,
            timestamp_ms: packet.timestamp_ms,
            side_data: &packet.side_data,
        };

        let rtp_streams = &mut self.rtp_streams;
        packetizer.pack(&frame, &mut |rtp| {
            // fast path: the borrowed view goes straight to SRTP and
            // the wire; only the send buffer takes a copy
            out.send_rtp(rtp.data());
            if let Some(stream) = rtp_streams.get_mut(&rtp.ssrc()) {
                stream.record_sent(rtp, now_millis);
            }
        })?;
        Ok(())
    }

    /// Decompound and apply one unprotected RTCP datagram.
    pub fn handle_rtcp(&mut self, data: &[u8], now_millis: u64, out: &mut dyn MediaStreamOutput) {
        let compound = match CompoundRtcp::parse(data) {
            Ok(compound) => compound,
            Err(e) => {
                warn!("failed to parse compound rtcp: {}", e);
                return;
            }
        };

        for packet in compound.packets() {
            match packet {
                RtcpPacket::Nack(nack) => {
                    if let Some(stream) = self.rtp_streams.get_mut(&nack.media_ssrc) {
                        stream.handle_nack(nack, now_millis, &mut |resend| {
                            out.send_rtp(resend.data());
                        });
                    }
                }
                RtcpPacket::ReceiverReport(rr) => {
                    for block in &rr.report_blocks {
                        // RR blocks about the RTX stream have no
                        // matching send stream and fall through
                        if let Some(stream) = self.rtp_streams.get_mut(&block.source_ssrc) {
                            stream.handle_report_block(block, now_millis);
                        }
                    }
                }
                RtcpPacket::Other { packet_type, format } => {
                    debug!(packet_type, format, "ignoring rtcp packet");
                }
            }
        }
    }

    /// Emit one Sender Report per stream that has sent anything.
    pub fn send_rtcp_reports(&mut self, now_millis: u64, out: &mut dyn MediaStreamOutput) {
        for stream in self.rtp_streams.values() {
            if let Some(report) = stream.create_sender_report(now_millis) {
                let mut buf = BytesMut::with_capacity(RTCP_BUFFER_SIZE);
                report.serialize(&mut buf);
                out.send_rtcp(&buf);
            }
        }
    }

    /// Lowest RTT estimate across streams, for diagnostics.
    pub fn min_rtt_millis(&self) -> Option<u64> {
        self.rtp_streams.values().map(|s| s.rtt_millis()).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use rtcast_rtp_core::{NackPacket, SenderReportPacket};

    #[derive(Default)]
    struct Captured {
        rtp: Vec<Vec<u8>>,
        rtcp: Vec<Vec<u8>>,
    }

    impl MediaStreamOutput for Captured {
        fn send_rtp(&mut self, data: &[u8]) {
            self.rtp.push(data.to_vec());
        }
        fn send_rtcp(&mut self, data: &[u8]) {
            self.rtcp.push(data.to_vec());
        }
    }

    fn video_stream() -> MediaStream {
        let mut stream = MediaStream::new();
        stream.add_rtp_stream(RtpParams {
            kind: RtpMediaKind::Video,
            ssrc: 12345678,
            clock_rate: 90_000,
            payload_type: 125,
            rtx_ssrc: 9527,
            rtx_payload_type: 107,
            rtx_enabled: true,
            nack_enabled: true,
            twcc_enabled: false,
        });
        stream
    }

    fn video_packet(timestamp_ms: u64) -> MediaPacket {
        let mut data = vec![0, 0, 0, 1];
        data.push(0x41);
        data.extend_from_slice(&[0x11; 50]);
        MediaPacket::video(Bytes::from(data), timestamp_ms, false, Vec::new())
    }

    #[test]
    fn test_media_packet_flows_to_output_and_send_buffer() {
        let mut stream = video_stream();
        let mut out = Captured::default();

        stream
            .handle_media_packet(&video_packet(0), 10, &mut out)
            .unwrap();
        assert_eq!(out.rtp.len(), 1);

        // a NACK for the packet just sent is answered from the buffer
        let mut nack_data = BytesMut::new();
        NackPacket {
            sender_ssrc: 1,
            media_ssrc: 12345678,
            lost_sequence_numbers: vec![0],
        }
        .serialize(&mut nack_data);

        stream.handle_rtcp(&nack_data, 20, &mut out);
        assert_eq!(out.rtp.len(), 2);
        // the retransmission went out on the RTX SSRC
        assert_eq!(&out.rtp[1][8..12], &9527u32.to_be_bytes());
    }

    #[test]
    fn test_rtcp_reports_only_after_sending() {
        let mut stream = video_stream();
        let mut out = Captured::default();

        stream.send_rtcp_reports(100, &mut out);
        assert!(out.rtcp.is_empty());

        stream
            .handle_media_packet(&video_packet(0), 100, &mut out)
            .unwrap();
        stream.send_rtcp_reports(300, &mut out);
        assert_eq!(out.rtcp.len(), 1);

        let report = SenderReportPacket::parse(&out.rtcp[0]).unwrap();
        assert_eq!(report.sender_ssrc, 12345678);
        assert_eq!(report.send_packet_count, 1);
    }

    #[test]
    fn test_malformed_rtcp_is_dropped() {
        let mut stream = video_stream();
        let mut out = Captured::default();
        // claims 6 words of payload, carries none
        stream.handle_rtcp(&[0x80, 200, 0, 6], 10, &mut out);
        assert!(out.rtp.is_empty());
        assert!(out.rtcp.is_empty());
    }

    #[test]
    fn test_media_without_packetizer_is_ignored() {
        let mut stream = video_stream();
        let mut out = Captured::default();
        let audio = MediaPacket::audio(Bytes::from_static(&[1, 2, 3]), 0);
        stream.handle_media_packet(&audio, 10, &mut out).unwrap();
        assert!(out.rtp.is_empty());
    }
}
