use std::sync::Arc;

use super::packet::{MediaKind, MediaPacket};

/// Cache of every packet since the most recent video keyframe.
///
/// A new keyframe clears the cache before being appended, so the
/// cache always begins at a point a decoder can join from. Readers
/// take a snapshot copy; there is no expiry beyond the next
/// keyframe.
#[derive(Default)]
pub struct GopCache {
    cached_packets: Vec<Arc<MediaPacket>>,
}

impl GopCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packet(&mut self, packet: &Arc<MediaPacket>) {
        if packet.kind == MediaKind::Video && packet.keyframe {
            self.cached_packets.clear();
        }
        self.cached_packets.push(packet.clone());
    }

    pub fn snapshot(&self) -> Vec<Arc<MediaPacket>> {
        self.cached_packets.clone()
    }

    pub fn len(&self) -> usize {
        self.cached_packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached_packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(keyframe: bool) -> Arc<MediaPacket> {
        Arc::new(MediaPacket::video(Bytes::new(), 0, keyframe, Vec::new()))
    }

    fn audio() -> Arc<MediaPacket> {
        Arc::new(MediaPacket::audio(Bytes::new(), 0))
    }

    #[test]
    fn test_keyframe_resets_cache() {
        let mut cache = GopCache::new();
        cache.add_packet(&video(true));
        cache.add_packet(&video(false));
        cache.add_packet(&audio());
        cache.add_packet(&video(false));
        cache.add_packet(&video(true));
        cache.add_packet(&audio());

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].kind, MediaKind::Video);
        assert!(snapshot[0].keyframe);
        assert_eq!(snapshot[1].kind, MediaKind::Audio);
    }

    #[test]
    fn test_audio_keyframe_flag_does_not_reset() {
        let mut cache = GopCache::new();
        cache.add_packet(&video(true));
        // audio packets never clear, whatever their flags
        let mut pkt = MediaPacket::audio(Bytes::new(), 0);
        pkt.keyframe = true;
        cache.add_packet(&Arc::new(pkt));
        assert_eq!(cache.len(), 2);
    }
}
