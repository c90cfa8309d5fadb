//! RTP payload packetizers
//!
//! A packetizer turns one encoded frame into one or more RTP packets
//! inside its own serialization buffer, invoking the caller's emit
//! closure with a borrowed [`RtpPacket`] view per packet. Sequence
//! numbers are per-packetizer and increment once per generated
//! packet, wrapping modulo 2^16.

mod h264;
mod opus;

pub use h264::H264Packetizer;
pub use opus::OpusPacketizer;

use bytes::Bytes;

use crate::{Result, RtpPacket, RtpTimestamp};

/// Size of the per-packetizer serialization buffer
pub(crate) const RTP_BUFFER_SIZE: usize = 5000;

/// One encoded frame handed to a packetizer.
///
/// `data` is the compressed access unit (Annex-B byte stream for
/// H.264, a raw frame for Opus); `side_data` carries out-of-band
/// parameter sets such as SPS/PPS.
pub struct MediaFrame<'a> {
    pub data: &'a [u8],
    pub timestamp_ms: u64,
    pub side_data: &'a [Bytes],
}

/// Common packetizer interface.
pub trait Packetizer {
    /// Packetize `frame`, calling `emit` once per generated packet.
    ///
    /// The [`RtpPacket`] view is only valid inside the callback;
    /// callers copy what they need to keep.
    fn pack(&mut self, frame: &MediaFrame<'_>, emit: &mut dyn FnMut(&RtpPacket<'_>)) -> Result<()>;
}

/// Media time to RTP timestamp, rounded.
pub(crate) fn rtp_timestamp(timestamp_ms: u64, clock_rate: u32) -> RtpTimestamp {
    ((timestamp_ms * clock_rate as u64 + 500) / 1000) as RtpTimestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_timestamp_rounding() {
        assert_eq!(rtp_timestamp(0, 90_000), 0);
        assert_eq!(rtp_timestamp(1000, 90_000), 90_000);
        assert_eq!(rtp_timestamp(20, 48_000), 960);
        // 33 ms at 90 kHz is 2970 exactly; 7 ms is 630
        assert_eq!(rtp_timestamp(33, 90_000), 2970);
        // rounding, not truncation
        assert_eq!(rtp_timestamp(1, 48_000), 48);
        assert_eq!(rtp_timestamp(1, 90_001), 90);
    }
}
