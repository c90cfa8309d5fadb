//! End-to-end exercise of the send side: packetize an access unit,
//! record everything in the send stream, lose packets, answer the
//! NACK with RTX, and check the Sender Report accounting.

use bytes::{Bytes, BytesMut};
use rtcast_rtp_core::{
    CompoundRtcp, H264Packetizer, MediaFrame, MediaKind, NackPacket, Packetizer, RtcpPacket,
    RtpParams, RtpSendStream, RtpStoragePacket, SenderReportPacket,
};

const VIDEO_SSRC: u32 = 12345678;
const RTX_SSRC: u32 = 9527;

fn video_params() -> RtpParams {
    RtpParams {
        kind: MediaKind::Video,
        ssrc: VIDEO_SSRC,
        clock_rate: 90_000,
        payload_type: 125,
        rtx_ssrc: RTX_SSRC,
        rtx_payload_type: 107,
        rtx_enabled: true,
        nack_enabled: true,
        twcc_enabled: false,
    }
}

fn keyframe_access_unit() -> (Vec<u8>, Vec<Bytes>) {
    let sps = vec![0x67, 0x64, 0x00, 0x1f];
    let pps = vec![0x68, 0xeb, 0xec];
    let mut idr = vec![0x65];
    idr.resize(2000, 0x42);

    let mut data = Vec::new();
    for nalu in [&sps, &pps, &idr] {
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(nalu);
    }
    (data, vec![Bytes::from(sps), Bytes::from(pps)])
}

#[test]
fn packetize_lose_and_retransmit() {
    let mut packetizer = H264Packetizer::new(VIDEO_SSRC, 125, 90_000);
    let mut stream = RtpSendStream::new(video_params());

    let (data, side_data) = keyframe_access_unit();
    let frame = MediaFrame {
        data: &data,
        timestamp_ms: 40,
        side_data: &side_data,
    };

    // SPS + PPS + STAP-A + two FU-A fragments of the IDR
    let mut wire: Vec<Vec<u8>> = Vec::new();
    packetizer
        .pack(&frame, &mut |pkt| {
            wire.push(pkt.data().to_vec());
            stream.record_sent(pkt, 1000);
        })
        .unwrap();
    assert_eq!(wire.len(), 5);

    // gapless sequence numbers, one marker at the end
    for (i, pkt) in wire.iter().enumerate() {
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), i as u16);
    }
    assert_eq!(wire.iter().filter(|p| p[1] & 0x80 != 0).count(), 1);
    assert!(wire.last().unwrap()[1] & 0x80 != 0);

    // the receiver reports 1 and 3 lost via one compound datagram
    let mut feedback = BytesMut::new();
    NackPacket {
        sender_ssrc: 1,
        media_ssrc: VIDEO_SSRC,
        lost_sequence_numbers: vec![1, 3],
    }
    .serialize(&mut feedback);

    let compound = CompoundRtcp::parse(&feedback).unwrap();
    let mut resent: Vec<RtpStoragePacket> = Vec::new();
    for packet in compound.packets() {
        if let RtcpPacket::Nack(nack) = packet {
            stream.handle_nack(nack, 1100, &mut |pkt| resent.push(pkt.clone()));
        }
    }

    // retransmissions ride the RTX stream with their own counter and
    // carry the original sequence number in front of the payload
    assert_eq!(resent.len(), 2);
    for (i, pkt) in resent.iter().enumerate() {
        let data = pkt.data();
        assert_eq!(&data[8..12], &RTX_SSRC.to_be_bytes());
        assert_eq!(data[1] & 0x7f, 107);
        assert_eq!(u16::from_be_bytes([data[2], data[3]]), i as u16);
        let osn = u16::from_be_bytes([data[12], data[13]]);
        assert_eq!(osn, [1u16, 3u16][i]);
        // the rewritten payload matches the original bytes
        assert_eq!(&data[14..], &wire[osn as usize][12..]);
    }

    // the sender report counts originals only, never retransmissions
    let report = stream.create_sender_report(2000).unwrap();
    assert_eq!(report.sender_ssrc, VIDEO_SSRC);
    assert_eq!(report.send_packet_count, 5);
    assert_eq!(
        report.send_octets,
        wire.iter().map(|p| p.len() as u32).sum::<u32>()
    );

    // and it survives a byte-exact round trip
    let bytes = report.to_bytes();
    assert_eq!(SenderReportPacket::parse(&bytes).unwrap(), report);
}
