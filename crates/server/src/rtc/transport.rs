//! Per-subscriber WebRTC transport
//!
//! One transport owns one UDP socket bound in the configured port
//! range and a single task (the transport loop) that runs everything
//! for the session: the inbound packet demultiplexer, the DTLS
//! driver events, media packetization and SRTP protection, and the
//! 200 ms Sender Report timer. No state leaves the loop, so none of
//! it is locked.
//!
//! Inbound datagrams classify by first byte: 0..=3 is STUN, 20..=63
//! is DTLS, 128..=191 is RTP or RTCP (split by payload type). RTP is
//! unexpected on a sendonly session and dropped; unclassified bytes
//! are discarded.
//!
//! Lifecycle: the socket is bound and DTLS prepared at start, ICE
//! completion triggers the DTLS handshake, key extraction installs
//! the SRTP pair and marks the connection established, and from then
//! on media flows. Any UDP, DTLS or ICE failure, or the end of the
//! upstream source, is terminal: the loop posts itself to the
//! manager for removal and releases its resources. The transport
//! never reconnects; the client re-signals.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtcast_ice_lite::{is_stun, IceLiteAgent};
use rtcast_rtp_core::{is_rtcp, MediaKind as RtpMediaKind, RtpParams};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use webrtc_dtls::crypto::Certificate;

use super::dtls::{DtlsContext, DtlsEvent, DtlsTransport, RemoteFingerprint};
use super::media_stream::{MediaStream, MediaStreamOutput};
use super::sdp::{self, AnswerParams};
use super::srtp::SrtpPair;
use super::transport_manager::ManagerCommand;
use super::{AUDIO_SSRC, VIDEO_RTX_SSRC, VIDEO_SSRC};
use crate::error::Error;
use crate::media::{MediaObserver, MediaPacket};
use crate::Result;

/// Receive buffer for one inbound datagram
const RECV_BUFFER_SIZE: usize = 5000;

/// Depth of the ingest-to-loop media queue; filling it blocks the
/// ingest thread until the connection is established (the one-shot
/// gate)
const MEDIA_QUEUE_DEPTH: usize = 64;

/// Sender Report cadence
const RTCP_INTERVAL: Duration = Duration::from_millis(200);

/// Payload type announced when the offer has no Opus mapping
const DEFAULT_OPUS_PAYLOAD_TYPE: u8 = 111;

/// Payload type announced when the offer has no RTX mapping
const DEFAULT_RTX_PAYLOAD_TYPE: u8 = 107;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Network knobs shared by every transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ip: IpAddr,
    pub announced_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

enum TransportEvent {
    /// GOP-cache backlog handed over at registration
    Bootstrap(Vec<Arc<MediaPacket>>),

    /// One live packet from the source
    Media(Arc<MediaPacket>),

    /// Upstream ended
    SourceEnd,
}

/// Handle to one subscriber session.
pub struct WebrtcTransport {
    id: u64,
    stream_id: String,
    answer: String,
    media_tx: mpsc::Sender<TransportEvent>,
    shutdown: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebrtcTransport {
    /// Parse the offer, bind a socket, build the answer and spawn
    /// the transport loop.
    pub async fn start(
        stream_id: String,
        offer_sdp: &str,
        dtls_context: &DtlsContext,
        config: &TransportConfig,
        manager_tx: mpsc::Sender<ManagerCommand>,
    ) -> Result<Arc<Self>> {
        let offer = sdp::parse_offer(offer_sdp)?;
        let socket = bind_in_range(config.ip, config.min_port, config.max_port).await?;
        let port = socket.local_addr()?.port();

        let agent = IceLiteAgent::new(&offer.ice_ufrag);
        let opus_payload_type = offer.opus_payload_type.unwrap_or(DEFAULT_OPUS_PAYLOAD_TYPE);
        let rtx_payload_type = offer.h264_rtx_payload_type;
        let answer = sdp::create_answer(&AnswerParams {
            ice_ufrag: agent.local_ufrag(),
            ice_pwd: agent.local_password(),
            fingerprint: dtls_context.fingerprint(),
            announced_ip: &config.announced_ip,
            port,
            h264_payload_type: offer.h264_payload_type,
            h264_rtx_payload_type: rtx_payload_type.unwrap_or(DEFAULT_RTX_PAYLOAD_TYPE),
            opus_payload_type,
        });

        let mut media = MediaStream::new();
        media.add_rtp_stream(RtpParams {
            kind: RtpMediaKind::Video,
            ssrc: VIDEO_SSRC,
            clock_rate: 90_000,
            payload_type: offer.h264_payload_type,
            rtx_ssrc: VIDEO_RTX_SSRC,
            rtx_payload_type: rtx_payload_type.unwrap_or_default(),
            rtx_enabled: rtx_payload_type.is_some(),
            nack_enabled: true,
            twcc_enabled: false,
        });
        media.add_rtp_stream(RtpParams {
            kind: RtpMediaKind::Audio,
            ssrc: AUDIO_SSRC,
            clock_rate: 48_000,
            payload_type: opus_payload_type,
            nack_enabled: true,
            ..Default::default()
        });

        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE_DEPTH);
        let shutdown = Arc::new(Notify::new());
        info!(id, %stream_id, port, "transport created");

        let state = TransportState {
            id,
            socket,
            agent,
            media,
            certificate: dtls_context.certificate(),
            remote_fingerprint: RemoteFingerprint {
                algorithm: offer.fingerprint_algorithm.clone(),
                value: offer.fingerprint_value.clone(),
            },
            remote_setup: offer.remote_setup.clone(),
            dtls: None,
            srtp: None,
            dtls_ready: false,
            established: false,
            epoch: Instant::now(),
        };
        let worker = tokio::spawn(run_transport(state, media_rx, shutdown.clone(), manager_tx));

        Ok(Arc::new(Self {
            id,
            stream_id,
            answer,
            media_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The SDP answer for this session.
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// The media-source observer feeding this transport.
    pub fn observer(&self) -> Arc<dyn MediaObserver> {
        Arc::new(TransportSink {
            media_tx: self.media_tx.clone(),
        })
    }

    /// Stop the transport loop and wait for it to release its
    /// resources.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

/// Cross-thread handoff from the ingest thread into the transport
/// loop.
///
/// The bounded queue is the one-shot gate: the loop only drains it
/// once the connection is established, so early frames fill the
/// queue and then block the producer until keys are ready. Dropping
/// the receiver on shutdown releases any blocked sender.
struct TransportSink {
    media_tx: mpsc::Sender<TransportEvent>,
}

impl MediaObserver for TransportSink {
    fn on_media_packet(&self, packet: Arc<MediaPacket>) {
        let _ = self.media_tx.blocking_send(TransportEvent::Media(packet));
    }

    fn on_cached_packets(&self, packets: Vec<Arc<MediaPacket>>) {
        // called once at registration on the signaling task, before
        // anything else is queued
        let _ = self.media_tx.try_send(TransportEvent::Bootstrap(packets));
    }

    fn on_source_end(&self) {
        let _ = self.media_tx.blocking_send(TransportEvent::SourceEnd);
    }
}

/// Everything owned by the transport loop.
struct TransportState {
    id: u64,
    socket: UdpSocket,
    agent: IceLiteAgent,
    media: MediaStream,
    certificate: Certificate,
    remote_fingerprint: RemoteFingerprint,
    remote_setup: String,
    dtls: Option<DtlsTransport>,
    srtp: Option<SrtpPair>,
    dtls_ready: bool,
    established: bool,
    epoch: Instant,
}

async fn run_transport(
    mut state: TransportState,
    mut media_rx: mpsc::Receiver<TransportEvent>,
    shutdown: Arc<Notify>,
    manager_tx: mpsc::Sender<ManagerCommand>,
) {
    let id = state.id;
    let (dtls_event_tx, mut dtls_event_rx) = mpsc::channel::<DtlsEvent>(64);
    let mut recv_buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut rtcp_timer = tokio::time::interval(RTCP_INTERVAL);
    rtcp_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stopped_externally = false;

    let reason = loop {
        tokio::select! {
            received = state.socket.recv_from(&mut recv_buf) => {
                match received {
                    Ok((len, from)) => {
                        if let Err(e) = state.handle_datagram(&recv_buf[..len], from, &dtls_event_tx).await {
                            break format!("socket send failed: {}", e);
                        }
                    }
                    Err(e) => break format!("udp receive failed: {}", e),
                }
            }
            Some(event) = dtls_event_rx.recv() => {
                match event {
                    DtlsEvent::Transmit(record) => {
                        if let Err(e) = state.send_to_selected(&record).await {
                            break format!("dtls transmit failed: {}", e);
                        }
                    }
                    DtlsEvent::Setup(keys) => {
                        match SrtpPair::new(&keys) {
                            Ok(pair) => {
                                state.srtp = Some(pair);
                                state.established = true;
                                info!(id, "connection established");
                            }
                            Err(e) => break format!("srtp init failed: {}", e),
                        }
                    }
                    DtlsEvent::Failed(e) => break format!("dtls failed: {}", e),
                }
            }
            event = media_rx.recv(), if state.established => {
                match event {
                    Some(TransportEvent::Bootstrap(packets)) => {
                        debug!(id, count = packets.len(), "replaying cached gop");
                        if let Err(e) = state.handle_media_batch(&packets).await {
                            break format!("media send failed: {}", e);
                        }
                    }
                    Some(TransportEvent::Media(packet)) => {
                        if let Err(e) = state.handle_media(&packet).await {
                            break format!("media send failed: {}", e);
                        }
                    }
                    Some(TransportEvent::SourceEnd) | None => break "media source ended".to_string(),
                }
            }
            _ = rtcp_timer.tick(), if state.established => {
                if let Err(e) = state.send_rtcp_reports().await {
                    break format!("rtcp send failed: {}", e);
                }
            }
            _ = shutdown.notified() => {
                stopped_externally = true;
                break "stopped".to_string();
            }
        }
    };

    if stopped_externally {
        debug!(id, "transport loop stopped");
    } else {
        info!(id, "transport shutting down: {}", reason);
        let _ = manager_tx.send(ManagerCommand::Remove(id)).await;
    }
    if let Some(dtls) = &state.dtls {
        dtls.stop();
    }
    // dropping the receiver releases an ingest thread blocked on the
    // gate
    media_rx.close();
}

impl TransportState {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Route one inbound datagram by first-byte classification.
    ///
    /// Returns `Err` only for socket failures; malformed input is
    /// logged and dropped.
    async fn handle_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        dtls_event_tx: &mpsc::Sender<DtlsEvent>,
    ) -> Result<()> {
        if is_stun(data) {
            match self.agent.process_message(data, from) {
                Ok(event) => {
                    self.socket.send_to(&event.response, from).await?;
                    if event.connection_completed {
                        self.start_dtls(dtls_event_tx)?;
                    }
                }
                Err(e) => warn!(id = self.id, "dropping invalid stun: {}", e),
            }
        } else if super::dtls::is_dtls(data) {
            if self.dtls_ready {
                if let Some(dtls) = &self.dtls {
                    dtls.process_from_peer(data).await;
                }
            } else {
                warn!(id = self.id, "dtls datagram before ice completed");
            }
        } else if is_rtcp(data) {
            let clear = match self.srtp.as_mut() {
                None => return Ok(()),
                Some(srtp) => match srtp.unprotect_rtcp(data) {
                    Ok(clear) => clear,
                    Err(e) => {
                        warn!(id = self.id, "failed to unprotect rtcp: {}", e);
                        return Ok(());
                    }
                },
            };
            let now = self.now_millis();
            let Some(srtp) = self.srtp.as_mut() else {
                return Ok(());
            };
            let mut sink = ProtectSink {
                srtp,
                pending: Vec::new(),
            };
            self.media.handle_rtcp(&clear, now, &mut sink);
            let pending = sink.pending;
            self.flush(pending).await?;
        } else if !data.is_empty() && (128..=191).contains(&data[0]) {
            // inbound RTP on a sendonly session; drop silently
        } else {
            trace!(id = self.id, len = data.len(), "unclassified datagram dropped");
        }
        Ok(())
    }

    /// ICE finished: kick off the DTLS handshake.
    fn start_dtls(&mut self, dtls_event_tx: &mpsc::Sender<DtlsEvent>) -> Result<()> {
        if self.dtls_ready {
            return Ok(());
        }
        let Some(remote) = self.agent.selected_endpoint() else {
            return Ok(());
        };
        let local = self.socket.local_addr()?;
        // the answer says active, so unless the peer grabbed the
        // active role itself this side initiates
        let is_client = !self.remote_setup.eq_ignore_ascii_case("active");
        info!(id = self.id, %remote, "ice completed, starting dtls");

        self.dtls = Some(DtlsTransport::start(
            self.certificate.clone(),
            self.remote_fingerprint.clone(),
            is_client,
            local,
            remote,
            dtls_event_tx.clone(),
        ));
        self.dtls_ready = true;
        Ok(())
    }

    async fn handle_media(&mut self, packet: &MediaPacket) -> Result<()> {
        let now = self.now_millis();
        let Some(srtp) = self.srtp.as_mut() else {
            return Ok(());
        };
        let mut sink = ProtectSink {
            srtp,
            pending: Vec::new(),
        };
        if let Err(e) = self.media.handle_media_packet(packet, now, &mut sink) {
            warn!(id = self.id, "dropping unpacketizable frame: {}", e);
        }
        let pending = sink.pending;
        self.flush(pending).await
    }

    async fn handle_media_batch(&mut self, packets: &[Arc<MediaPacket>]) -> Result<()> {
        for packet in packets {
            self.handle_media(packet).await?;
        }
        Ok(())
    }

    async fn send_rtcp_reports(&mut self) -> Result<()> {
        let now = self.now_millis();
        let Some(srtp) = self.srtp.as_mut() else {
            return Ok(());
        };
        let mut sink = ProtectSink {
            srtp,
            pending: Vec::new(),
        };
        self.media.send_rtcp_reports(now, &mut sink);
        let pending = sink.pending;
        self.flush(pending).await
    }

    async fn send_to_selected(&mut self, data: &[u8]) -> Result<()> {
        let Some(endpoint) = self.agent.selected_endpoint() else {
            return Ok(());
        };
        self.socket.send_to(data, endpoint).await?;
        Ok(())
    }

    async fn flush(&mut self, pending: Vec<Bytes>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let Some(endpoint) = self.agent.selected_endpoint() else {
            return Ok(());
        };
        for datagram in pending {
            self.socket.send_to(&datagram, endpoint).await?;
        }
        Ok(())
    }
}

/// Protects generated packets in place and queues the ciphertext for
/// the loop to write out.
///
/// Protection failures are per-packet: logged, dropped, never fatal.
struct ProtectSink<'a> {
    srtp: &'a mut SrtpPair,
    pending: Vec<Bytes>,
}

impl MediaStreamOutput for ProtectSink<'_> {
    fn send_rtp(&mut self, data: &[u8]) {
        match self.srtp.protect_rtp(data) {
            Ok(protected) => self.pending.push(protected),
            Err(e) => warn!("dropping rtp packet: {}", e),
        }
    }

    fn send_rtcp(&mut self, data: &[u8]) {
        match self.srtp.protect_rtcp(data) {
            Ok(protected) => self.pending.push(protected),
            Err(e) => warn!("dropping rtcp packet: {}", e),
        }
    }
}

/// Bind a UDP socket to the first free port in `[min_port, max_port]`.
async fn bind_in_range(ip: IpAddr, min_port: u16, max_port: u16) -> Result<UdpSocket> {
    for port in min_port..=max_port {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => return Ok(socket),
            Err(e) => trace!(port, "bind failed: {}", e),
        }
    }
    Err(Error::NoAvailablePort {
        min: min_port,
        max: max_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_scans_port_range() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = bind_in_range(ip, 42100, 42102).await.unwrap();
        assert_eq!(first.local_addr().unwrap().port(), 42100);

        // the occupied port is skipped
        let second = bind_in_range(ip, 42100, 42102).await.unwrap();
        assert_eq!(second.local_addr().unwrap().port(), 42101);

        let third = bind_in_range(ip, 42100, 42102).await.unwrap();
        let fourth = bind_in_range(ip, 42100, 42102).await;
        assert_eq!(third.local_addr().unwrap().port(), 42102);
        assert!(matches!(
            fourth,
            Err(Error::NoAvailablePort { min: 42100, max: 42102 })
        ));
    }
}
