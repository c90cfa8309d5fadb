//! Ingest side of the server
//!
//! A [`MediaSource`] pulls one upstream RTMP feed on its own thread
//! and fans reference-counted [`MediaPacket`]s out to observers. The
//! [`MediaSourceManager`] is the process-wide registry the signaling
//! surface drives.

mod gop_cache;
mod packet;
mod source;
mod source_manager;
mod transcode;

pub use gop_cache::GopCache;
pub use packet::{MediaKind, MediaPacket};
pub use source::{MediaObserver, MediaSource};
pub use source_manager::{MediaSourceManager, StreamInfo};
pub use transcode::OpusTranscoder;
