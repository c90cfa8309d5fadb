//! # RTP core library for the rtcast project
//!
//! `rtcast-rtp-core` contains the send-side RTP machinery of the
//! media server: packetizers that slice encoded H.264 access units
//! and Opus frames into RTP packets, the per-SSRC send stream that
//! answers NACKs with RTX retransmissions and produces RTCP Sender
//! Reports, and the compound RTCP parser for inbound feedback.
//!
//! The crate is transport-agnostic: packetizers hand finished packets
//! to a callback as borrowed views over an internal buffer, and the
//! send stream copies what it must keep for retransmission.

pub mod error;
pub mod packet;
pub mod payload;
pub mod stream;

pub use error::{Error, Result};
pub use packet::{FixedRtpHeader, RtpPacket, RTP_HEADER_SIZE};
pub use packet::rtcp::{
    is_rtcp, CompoundRtcp, NackPacket, NtpTime, ReceiverReportPacket,
    ReportBlock, RtcpPacket, SenderReportPacket,
};
pub use payload::{H264Packetizer, MediaFrame, OpusPacketizer, Packetizer};
pub use stream::{
    MediaKind, RtpParams, RtpSendStream, RtpStoragePacket, DEFAULT_RTT_MILLIS,
    SEND_BUFFER_CAPACITY,
};

/// RTP synchronization source identifier.
pub type RtpSsrc = u32;

/// RTP sequence number.
pub type RtpSequenceNumber = u16;

/// RTP timestamp in clock-rate units.
pub type RtpTimestamp = u32;

/// Largest RTP payload the packetizers will emit in one packet.
pub const MAX_RTP_PAYLOAD_SIZE: usize = 1200;
