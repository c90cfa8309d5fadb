//! WebRTC delivery side
//!
//! Everything between a parsed SDP offer and SRTP packets on the
//! wire: the DTLS handshake driver, the SRTP session pair, the
//! per-subscriber media stream with its packetizers and send
//! streams, the transport that multiplexes one UDP socket, and the
//! registry that owns every transport.

pub mod dtls;
pub mod media_stream;
pub mod sdp;
pub mod srtp;
pub mod transport;
pub mod transport_manager;

pub use dtls::{is_dtls, DtlsContext, DtlsKeys};
pub use media_stream::{MediaStream, MediaStreamOutput};
pub use sdp::{create_answer, parse_offer, AnswerParams, SdpOffer};
pub use srtp::SrtpPair;
pub use transport::{TransportConfig, WebrtcTransport};
pub use transport_manager::{ManagerCommand, TransportManager};

/// SSRC of the single video stream every subscriber receives.
pub const VIDEO_SSRC: u32 = 12345678;

/// SSRC of the video retransmission stream.
pub const VIDEO_RTX_SSRC: u32 = 9527;

/// SSRC of the audio stream.
pub const AUDIO_SSRC: u32 = 87654321;
