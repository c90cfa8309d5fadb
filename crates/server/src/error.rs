use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server-side error type.
///
/// Initialization failures are fatal to the process; per-session
/// failures reject that subscriber; per-packet failures are logged
/// and the packet dropped.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error(transparent)]
    Ice(#[from] rtcast_ice_lite::Error),

    #[error(transparent)]
    Rtp(#[from] rtcast_rtp_core::Error),

    #[error("DTLS error: {0}")]
    Dtls(String),

    #[error("SRTP error: {0}")]
    Srtp(String),

    #[error("ingest error: {0}")]
    Ingest(String),

    #[error("transcode error: {0}")]
    Transcode(String),

    #[error("no free port in range {min}..={max}")]
    NoAvailablePort { min: u16, max: u16 },

    #[error("unknown stream id: {0}")]
    SourceNotFound(String),

    #[error("transport error: {0}")]
    Transport(String),
}
