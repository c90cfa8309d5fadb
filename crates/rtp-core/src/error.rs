use thiserror::Error;

/// Result type alias for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building or parsing RTP/RTCP packets
#[derive(Error, Debug)]
pub enum Error {
    /// Input buffer ended before the structure being read
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// A field carried a value the protocol does not allow
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// RTCP-specific parse or serialize failure
    #[error("RTCP error: {0}")]
    RtcpError(String),

    /// Payload could not be packetized
    #[error("payload error: {0}")]
    PayloadError(String),
}
