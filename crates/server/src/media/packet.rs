use bytes::Bytes;

/// Kind of media a packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// One encoded frame from the ingest side.
///
/// Immutable and shared by reference count: the source creates it,
/// every subscriber transport holds an `Arc` until its packetizer is
/// done with it. Video data is an H.264 access unit in Annex-B byte
/// stream form; audio data is a single Opus frame.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,

    /// The compressed access unit or audio frame
    pub data: Bytes,

    /// Presentation time in milliseconds, rebased so the stream
    /// starts at zero
    pub timestamp_ms: u64,

    /// True for video keyframes
    pub keyframe: bool,

    /// Out-of-band parameter sets (SPS, then PPS) for video
    pub side_data: Vec<Bytes>,
}

impl MediaPacket {
    pub fn video(data: Bytes, timestamp_ms: u64, keyframe: bool, side_data: Vec<Bytes>) -> Self {
        Self {
            kind: MediaKind::Video,
            data,
            timestamp_ms,
            keyframe,
            side_data,
        }
    }

    pub fn audio(data: Bytes, timestamp_ms: u64) -> Self {
        Self {
            kind: MediaKind::Audio,
            data,
            timestamp_ms,
            keyframe: false,
            side_data: Vec::new(),
        }
    }
}
