//! Upstream media source
//!
//! One `MediaSource` pulls a single RTMP feed on a dedicated ingest
//! thread: TCP + RTMP handshake, connect, play, then a read loop
//! that turns FLV video/audio tags into [`MediaPacket`]s. Video AVC
//! tags are converted from AVCC length-prefixed form to the Annex-B
//! byte stream the packetizers expect; AAC audio goes through the
//! Opus transcoder. Delivery to observers is a direct call under the
//! observer-list mutex; observers treat it as a cross-thread handoff
//! and must not block for long.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
};
use tracing::{debug, error, info, trace, warn};

use super::gop_cache::GopCache;
use super::packet::MediaPacket;
use super::transcode::OpusTranscoder;
use crate::error::Error;
use crate::Result;

/// Ingest aborts after this long without bytes from upstream.
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket read timeout, which doubles as the closed-flag poll rate.
const READ_POLL: Duration = Duration::from_millis(500);

/// FLV video codec id for AVC
const FLV_CODEC_AVC: u8 = 7;

/// FLV audio format id for AAC
const FLV_FORMAT_AAC: u8 = 10;

/// Observer of one media source.
///
/// Calls arrive on the ingest thread while the observer-list mutex
/// is held.
pub trait MediaObserver: Send + Sync {
    /// A live packet was produced.
    fn on_media_packet(&self, packet: Arc<MediaPacket>);

    /// GOP-cache backlog handed over at registration, before any
    /// live packet.
    fn on_cached_packets(&self, packets: Vec<Arc<MediaPacket>>) {
        let _ = packets;
    }

    /// The upstream feed ended or failed.
    fn on_source_end(&self);
}

struct Shared {
    observers: Vec<(u64, Arc<dyn MediaObserver>)>,
    gop_cache: Option<GopCache>,
}

/// A single upstream RTMP pull.
pub struct MediaSource {
    url: String,
    target: RtmpUrl,
    shared: Mutex<Shared>,
    closed: AtomicBool,
    connection: Mutex<Option<TcpStream>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MediaSource {
    /// Validate the URL and establish the upstream TCP connection.
    ///
    /// The RTMP session itself is driven by the ingest thread once
    /// [`MediaSource::start`] runs.
    pub fn open(url: &str, enable_gop_cache: bool) -> Result<Arc<Self>> {
        let target = RtmpUrl::parse(url)?;
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .map_err(|e| Error::Ingest(format!("connect {}: {}", url, e)))?;
        stream
            .set_read_timeout(Some(READ_POLL))
            .map_err(|e| Error::Ingest(format!("socket setup: {}", e)))?;
        let _ = stream.set_nodelay(true);

        Ok(Arc::new(Self {
            url: url.to_string(),
            target,
            shared: Mutex::new(Shared {
                observers: Vec::new(),
                gop_cache: enable_gop_cache.then(GopCache::new),
            }),
            closed: AtomicBool::new(false),
            connection: Mutex::new(Some(stream)),
            worker: Mutex::new(None),
        }))
    }

    /// Spawn the ingest thread.
    pub fn start(self: Arc<Self>) {
        let source = self.clone();
        let stream = self.connection.lock().unwrap().take();
        let handle = std::thread::spawn(move || {
            let Some(stream) = stream else {
                return;
            };
            match source.ingest_loop(stream) {
                Ok(()) => info!(url = %source.url, "ingest stopped"),
                Err(e) => error!(url = %source.url, "ingest failed: {}", e),
            }
            if !source.closed.load(Ordering::SeqCst) {
                source.notify_source_end();
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Stop the ingest thread and wait for it.
    pub fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Add an observer; a GOP-cache snapshot is handed over first so
    /// new subscribers start from the last keyframe.
    pub fn register_observer(&self, id: u64, observer: Arc<dyn MediaObserver>) {
        let mut shared = self.shared.lock().unwrap();
        if shared.observers.iter().any(|(other, _)| *other == id) {
            return;
        }
        if let Some(gop_cache) = &shared.gop_cache {
            if !gop_cache.is_empty() {
                observer.on_cached_packets(gop_cache.snapshot());
            }
        }
        shared.observers.push((id, observer));
    }

    pub fn deregister_observer(&self, id: u64) {
        let mut shared = self.shared.lock().unwrap();
        shared.observers.retain(|(other, _)| *other != id);
    }

    fn deliver(&self, packet: Arc<MediaPacket>) {
        let mut shared = self.shared.lock().unwrap();
        if let Some(gop_cache) = &mut shared.gop_cache {
            gop_cache.add_packet(&packet);
        }
        for (_, observer) in &shared.observers {
            observer.on_media_packet(packet.clone());
        }
    }

    fn notify_source_end(&self) {
        let shared = self.shared.lock().unwrap();
        for (_, observer) in &shared.observers {
            observer.on_source_end();
        }
    }

    fn ingest_loop(&self, mut stream: TcpStream) -> Result<()> {
        let mut read_buf = [0u8; 4096];
        let mut last_io = Instant::now();

        // RTMP handshake first, raw over the socket
        let mut handshake = Handshake::new(PeerType::Client);
        let p0_and_p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| Error::Ingest(format!("handshake start: {:?}", e)))?;
        stream.write_all(&p0_and_p1)?;

        let leftover = loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            let n = match stream.read(&mut read_buf) {
                Ok(0) => return Err(Error::Ingest("upstream closed during handshake".into())),
                Ok(n) => n,
                Err(e) if is_read_timeout(&e) => {
                    if last_io.elapsed() > IO_TIMEOUT {
                        return Err(Error::Ingest("handshake timed out".into()));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            last_io = Instant::now();
            match handshake
                .process_bytes(&read_buf[..n])
                .map_err(|e| Error::Ingest(format!("handshake: {:?}", e)))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes)?;
                    }
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes)?;
                    }
                    break remaining_bytes;
                }
            }
        };

        let (mut session, initial_results) = ClientSession::new(ClientSessionConfig::new())
            .map_err(|e| Error::Ingest(format!("rtmp session: {:?}", e)))?;
        let mut ctx = IngestContext::new(self.target.stream_key.clone());
        self.handle_session_results(&mut stream, &mut session, initial_results, &mut ctx)?;

        let connect = session
            .request_connection(self.target.app.clone())
            .map_err(|e| Error::Ingest(format!("connect request: {:?}", e)))?;
        self.handle_session_results(&mut stream, &mut session, vec![connect], &mut ctx)?;

        if !leftover.is_empty() {
            let results = session
                .handle_input(&leftover)
                .map_err(|e| Error::Ingest(format!("rtmp input: {:?}", e)))?;
            self.handle_session_results(&mut stream, &mut session, results, &mut ctx)?;
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            match stream.read(&mut read_buf) {
                Ok(0) => return Err(Error::Ingest("upstream closed".into())),
                Ok(n) => {
                    last_io = Instant::now();
                    let results = session
                        .handle_input(&read_buf[..n])
                        .map_err(|e| Error::Ingest(format!("rtmp input: {:?}", e)))?;
                    self.handle_session_results(&mut stream, &mut session, results, &mut ctx)?;
                }
                Err(e) if is_read_timeout(&e) => {
                    if last_io.elapsed() > IO_TIMEOUT {
                        return Err(Error::Ingest("upstream timed out".into()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_session_results(
        &self,
        stream: &mut TcpStream,
        session: &mut ClientSession,
        results: Vec<ClientSessionResult>,
        ctx: &mut IngestContext,
    ) -> Result<()> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    stream.write_all(&packet.bytes)?;
                }
                ClientSessionResult::RaisedEvent(event) => {
                    self.handle_session_event(stream, session, event, ctx)?;
                }
                ClientSessionResult::UnhandleableMessageReceived(_) => {
                    trace!("unhandleable rtmp message");
                }
            }
        }
        Ok(())
    }

    fn handle_session_event(
        &self,
        stream: &mut TcpStream,
        session: &mut ClientSession,
        event: ClientSessionEvent,
        ctx: &mut IngestContext,
    ) -> Result<()> {
        match event {
            ClientSessionEvent::ConnectionRequestAccepted => {
                debug!(url = %self.url, "rtmp connection accepted, requesting playback");
                let result = session
                    .request_playback(ctx.stream_key.clone())
                    .map_err(|e| Error::Ingest(format!("play request: {:?}", e)))?;
                self.handle_session_results(stream, session, vec![result], ctx)?;
            }
            ClientSessionEvent::ConnectionRequestRejected { description } => {
                return Err(Error::Ingest(format!("connection rejected: {}", description)));
            }
            ClientSessionEvent::PlaybackRequestAccepted => {
                info!(url = %self.url, "rtmp playback started");
            }
            ClientSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                self.handle_video_tag(ctx, data, timestamp.value);
            }
            ClientSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                self.handle_audio_tag(ctx, data, timestamp.value);
            }
            other => {
                trace!(?other, "ignoring rtmp event");
            }
        }
        Ok(())
    }

    /// Turn one FLV/AVC video tag into a media packet.
    ///
    /// Malformed tags are logged and dropped; they never take the
    /// ingest down.
    fn handle_video_tag(&self, ctx: &mut IngestContext, data: Bytes, timestamp: u32) {
        if data.len() < 5 {
            warn!("short video tag");
            return;
        }
        let frame_type = data[0] >> 4;
        let codec = data[0] & 0x0f;
        if codec != FLV_CODEC_AVC {
            warn!(codec, "only H264 video is supported");
            return;
        }

        match data[1] {
            0 => {
                // AVC sequence header
                match parse_avc_decoder_configuration_record(&data[5..]) {
                    Ok(config) => {
                        debug!(
                            sps = config.sps.len(),
                            pps = config.pps.len(),
                            "parsed AVC configuration record"
                        );
                        ctx.avc_config = Some(config);
                    }
                    Err(e) => warn!("bad AVC configuration record: {}", e),
                }
            }
            1 => {
                let Some(config) = &ctx.avc_config else {
                    warn!("video data before AVC configuration record");
                    return;
                };
                let annex_b = match avcc_to_annex_b(&data[5..], config.length_size) {
                    Ok(annex_b) => annex_b,
                    Err(e) => {
                        warn!("dropping malformed access unit: {}", e);
                        return;
                    }
                };
                let first = *ctx.first_video_timestamp.get_or_insert(timestamp);
                let timestamp_ms = timestamp.wrapping_sub(first) as u64;
                let packet = MediaPacket::video(
                    annex_b.into(),
                    timestamp_ms,
                    frame_type == 1,
                    vec![config.sps.clone(), config.pps.clone()],
                );
                self.deliver(Arc::new(packet));
            }
            _ => {}
        }
    }

    /// Turn one FLV/AAC audio tag into Opus media packets.
    fn handle_audio_tag(&self, ctx: &mut IngestContext, data: Bytes, timestamp: u32) {
        if data.len() < 2 {
            warn!("short audio tag");
            return;
        }
        if data[0] >> 4 != FLV_FORMAT_AAC {
            warn!(format = data[0] >> 4, "only AAC audio is supported");
            return;
        }

        match data[1] {
            0 => {
                ctx.audio_specific_config = Some(data.slice(2..));
            }
            1 => {
                if ctx.transcoder.is_none() {
                    let Some(asc) = &ctx.audio_specific_config else {
                        warn!("audio data before AudioSpecificConfig");
                        return;
                    };
                    // the audio timeline starts offset from the first
                    // video timestamp; audio arriving first pins the
                    // offset at zero
                    let video_base = ctx.first_video_timestamp.unwrap_or(timestamp);
                    let base_ms = (timestamp as i64 - video_base as i64).max(0) as u64;
                    match OpusTranscoder::new(asc, base_ms) {
                        Ok(transcoder) => ctx.transcoder = Some(transcoder),
                        Err(e) => {
                            warn!("cannot start audio transcoder: {}", e);
                            return;
                        }
                    }
                }
                let Some(transcoder) = &mut ctx.transcoder else {
                    return;
                };
                let result = transcoder.transcode(&data[2..], &mut |frame, pts_ms| {
                    self.deliver(Arc::new(MediaPacket::audio(frame, pts_ms)));
                });
                if let Err(e) = result {
                    warn!("dropping audio frame: {}", e);
                }
            }
            _ => {}
        }
    }
}

fn is_read_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Per-ingest parser state.
struct IngestContext {
    stream_key: String,
    avc_config: Option<AvcConfig>,
    audio_specific_config: Option<Bytes>,
    transcoder: Option<OpusTranscoder>,
    first_video_timestamp: Option<u32>,
}

impl IngestContext {
    fn new(stream_key: String) -> Self {
        Self {
            stream_key,
            avc_config: None,
            audio_specific_config: None,
            transcoder: None,
            first_video_timestamp: None,
        }
    }
}

/// Parameter sets and NALU length prefix size from the AVC sequence
/// header.
#[derive(Debug, Clone)]
struct AvcConfig {
    sps: Bytes,
    pps: Bytes,
    length_size: usize,
}

/// Parse an AVCDecoderConfigurationRecord (ISO 14496-15), keeping
/// the first SPS and PPS.
fn parse_avc_decoder_configuration_record(data: &[u8]) -> Result<AvcConfig> {
    let malformed = || Error::Ingest("truncated AVC configuration record".into());
    if data.len() < 7 {
        return Err(malformed());
    }
    if data[0] != 1 {
        return Err(Error::Ingest(format!(
            "unsupported AVC configuration version {}",
            data[0]
        )));
    }
    let length_size = (data[4] & 0x03) as usize + 1;
    if length_size == 3 {
        return Err(Error::Ingest("invalid NALU length size 3".into()));
    }

    let mut offset = 5;
    let num_sps = data.get(offset).ok_or_else(malformed)? & 0x1f;
    offset += 1;
    let mut sps_list = Vec::new();
    for _ in 0..num_sps {
        let len = read_u16(data, offset).ok_or_else(malformed)? as usize;
        offset += 2;
        if offset + len > data.len() {
            return Err(malformed());
        }
        sps_list.push(Bytes::copy_from_slice(&data[offset..offset + len]));
        offset += len;
    }

    let num_pps = *data.get(offset).ok_or_else(malformed)?;
    offset += 1;
    let mut pps_list = Vec::new();
    for _ in 0..num_pps {
        let len = read_u16(data, offset).ok_or_else(malformed)? as usize;
        offset += 2;
        if offset + len > data.len() {
            return Err(malformed());
        }
        pps_list.push(Bytes::copy_from_slice(&data[offset..offset + len]));
        offset += len;
    }

    match (sps_list.into_iter().next(), pps_list.into_iter().next()) {
        (Some(sps), Some(pps)) if !sps.is_empty() && !pps.is_empty() => Ok(AvcConfig {
            sps,
            pps,
            length_size,
        }),
        _ => Err(Error::Ingest("configuration record without SPS/PPS".into())),
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *data.get(offset)?,
        *data.get(offset + 1)?,
    ]))
}

/// Convert AVCC length-prefixed NALUs to an Annex-B byte stream.
fn avcc_to_annex_b(data: &[u8], length_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut offset = 0;
    while offset + length_size <= data.len() {
        let mut len = 0usize;
        for &byte in &data[offset..offset + length_size] {
            len = (len << 8) | byte as usize;
        }
        offset += length_size;
        if offset + len > data.len() {
            return Err(Error::Ingest("NALU length overruns access unit".into()));
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[offset..offset + len]);
        offset += len;
    }
    if offset != data.len() {
        return Err(Error::Ingest("trailing bytes after last NALU".into()));
    }
    Ok(out)
}

/// Pieces of an `rtmp://host[:port]/app[/...]/stream_key` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RtmpUrl {
    host: String,
    port: u16,
    app: String,
    stream_key: String,
}

impl RtmpUrl {
    fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("rtmp://")
            .ok_or_else(|| Error::Ingest(format!("not an rtmp url: {}", url)))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::Ingest(format!("missing path in rtmp url: {}", url)))?;

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::Ingest(format!("bad port in rtmp url: {}", url)))?,
            ),
            None => (authority, 1935),
        };
        if host.is_empty() {
            return Err(Error::Ingest(format!("missing host in rtmp url: {}", url)));
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return Err(Error::Ingest(format!(
                "rtmp url needs app and stream key: {}",
                url
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            app: segments[..segments.len() - 1].join("/"),
            stream_key: segments[segments.len() - 1].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;

    #[test]
    fn test_rtmp_url_parse() {
        let url = RtmpUrl::parse("rtmp://media.example.com/live/abc123").unwrap();
        assert_eq!(
            url,
            RtmpUrl {
                host: "media.example.com".into(),
                port: 1935,
                app: "live".into(),
                stream_key: "abc123".into(),
            }
        );

        let url = RtmpUrl::parse("rtmp://10.0.0.1:19350/app/sub/key").unwrap();
        assert_eq!(url.port, 19350);
        assert_eq!(url.app, "app/sub");
        assert_eq!(url.stream_key, "key");

        assert!(RtmpUrl::parse("http://example.com/live/x").is_err());
        assert!(RtmpUrl::parse("rtmp://example.com/onlyapp").is_err());
    }

    #[test]
    fn test_avcc_to_annex_b() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[0x65, 1, 2]);
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0x41, 9]);

        let annex_b = avcc_to_annex_b(&data, 4).unwrap();
        assert_eq!(
            annex_b,
            vec![0, 0, 0, 1, 0x65, 1, 2, 0, 0, 0, 1, 0x41, 9]
        );

        // a length running past the buffer is rejected
        let mut bad = Vec::new();
        bad.extend_from_slice(&100u32.to_be_bytes());
        bad.push(0x65);
        assert!(avcc_to_annex_b(&bad, 4).is_err());
    }

    #[test]
    fn test_parse_avc_configuration_record() {
        let sps = [0x67, 0x64, 0x00, 0x1f, 0xac];
        let pps = [0x68, 0xeb, 0xec];
        let mut record = vec![1, 0x64, 0x00, 0x1f, 0xff, 0xe1];
        record.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        record.extend_from_slice(&sps);
        record.push(1);
        record.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        record.extend_from_slice(&pps);

        let config = parse_avc_decoder_configuration_record(&record).unwrap();
        assert_eq!(&config.sps[..], &sps);
        assert_eq!(&config.pps[..], &pps);
        assert_eq!(config.length_size, 4);

        assert!(parse_avc_decoder_configuration_record(&record[..4]).is_err());
        let mut wrong_version = record.clone();
        wrong_version[0] = 2;
        assert!(parse_avc_decoder_configuration_record(&wrong_version).is_err());
    }

    struct Recorder {
        live: Mutex<Vec<Arc<MediaPacket>>>,
        cached: Mutex<Vec<Arc<MediaPacket>>>,
        ended: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                live: Mutex::new(Vec::new()),
                cached: Mutex::new(Vec::new()),
                ended: AtomicBool::new(false),
            })
        }
    }

    impl MediaObserver for Recorder {
        fn on_media_packet(&self, packet: Arc<MediaPacket>) {
            self.live.lock().unwrap().push(packet);
        }
        fn on_cached_packets(&self, packets: Vec<Arc<MediaPacket>>) {
            self.cached.lock().unwrap().extend(packets);
        }
        fn on_source_end(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    fn bare_source(enable_gop_cache: bool) -> MediaSource {
        MediaSource {
            url: "rtmp://localhost/live/test".into(),
            target: RtmpUrl::parse("rtmp://localhost/live/test").unwrap(),
            shared: Mutex::new(Shared {
                observers: Vec::new(),
                gop_cache: enable_gop_cache.then(GopCache::new),
            }),
            closed: AtomicBool::new(false),
            connection: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    #[test]
    fn test_fan_out_and_gop_prepend() {
        let source = bare_source(true);

        let early = Recorder::new();
        source.register_observer(1, early.clone());

        let keyframe = Arc::new(MediaPacket::video(Bytes::new(), 0, true, Vec::new()));
        let delta = Arc::new(MediaPacket::video(Bytes::new(), 33, false, Vec::new()));
        source.deliver(keyframe);
        source.deliver(delta);

        assert_eq!(early.live.lock().unwrap().len(), 2);
        assert!(early.cached.lock().unwrap().is_empty());

        // a late joiner gets the cached GOP before any live packet
        let late = Recorder::new();
        source.register_observer(2, late.clone());
        let cached = late.cached.lock().unwrap();
        assert_eq!(cached.len(), 2);
        assert!(cached[0].keyframe);
        drop(cached);

        source.deregister_observer(1);
        source.deliver(Arc::new(MediaPacket::audio(Bytes::new(), 40)));
        assert_eq!(early.live.lock().unwrap().len(), 2);
        assert_eq!(late.live.lock().unwrap().len(), 1);
        assert_eq!(late.live.lock().unwrap()[0].kind, MediaKind::Audio);

        source.notify_source_end();
        assert!(late.ended.load(Ordering::SeqCst));
    }
}
