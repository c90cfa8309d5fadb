//! DTLS handshake driver
//!
//! Wraps the `webrtc-dtls` stack behind the transport's packet
//! demultiplexer: inbound DTLS datagrams are fed in through
//! [`DtlsTransport::process_from_peer`], outbound records surface as
//! [`DtlsEvent::Transmit`] for the transport loop to write to its
//! socket. When the handshake finishes, the remote certificate is
//! checked against the fingerprint from the SDP offer and the SRTP
//! keying material ("EXTRACTOR-dtls_srtp", 60 bytes) is split into
//! the local and remote master key + salt.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error};
use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_dtls::crypto::Certificate;
use webrtc_dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use webrtc_srtp::protection_profile::ProtectionProfile;
use webrtc_util::{Conn, KeyingMaterialExporter};

use crate::error::Error;
use crate::Result;

/// Keying material layout per RFC 5764: two 16-byte write keys, then
/// two 14-byte write salts.
const SRTP_MASTER_KEY_LEN: usize = 16;
const SRTP_MASTER_SALT_LEN: usize = 14;
const EXPORTER_LABEL: &str = "EXTRACTOR-dtls_srtp";

/// Classify a datagram as DTLS by its first byte (record content
/// types live in 20..=63).
pub fn is_dtls(data: &[u8]) -> bool {
    data.len() >= 13 && (20..=63).contains(&data[0])
}

/// Colon-separated uppercase hex, the SDP fingerprint form.
pub fn format_fingerprint(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Process-wide DTLS certificate and its SHA-256 fingerprint.
pub struct DtlsContext {
    certificate: Certificate,
    fingerprint: String,
}

impl DtlsContext {
    /// Generate the self-signed certificate used by every session.
    pub fn new() -> Result<Self> {
        let certificate = Certificate::generate_self_signed(vec!["rtcast".to_owned()])
            .map_err(|e| Error::Dtls(format!("certificate generation: {}", e)))?;
        let der = certificate
            .certificate
            .first()
            .ok_or_else(|| Error::Dtls("generated certificate is empty".into()))?;
        let fingerprint = format_fingerprint(&Sha256::digest(der.as_ref()));
        Ok(Self {
            certificate,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint for the SDP answer.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certificate(&self) -> Certificate {
        self.certificate.clone()
    }
}

/// Remote certificate fingerprint negotiated in SDP.
#[derive(Debug, Clone)]
pub struct RemoteFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// SRTP master keys extracted from a finished handshake.
#[derive(Clone)]
pub struct DtlsKeys {
    pub profile: ProtectionProfile,
    pub local_key: Vec<u8>,
    pub local_salt: Vec<u8>,
    pub remote_key: Vec<u8>,
    pub remote_salt: Vec<u8>,
}

/// Events surfaced to the transport loop.
pub enum DtlsEvent {
    /// Outbound record to write to the selected remote endpoint
    Transmit(Vec<u8>),

    /// Handshake complete, fingerprint verified, keys extracted
    Setup(DtlsKeys),

    /// Handshake or verification failed; fatal for the session
    Failed(String),
}

/// Handle to one session's DTLS driver task.
pub struct DtlsTransport {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
}

impl DtlsTransport {
    /// Spawn the handshake task.
    ///
    /// `is_client` is true when the peer offered "actpass" or
    /// "passive"; the answer always says active, so this server
    /// normally initiates.
    pub fn start(
        certificate: Certificate,
        remote_fingerprint: RemoteFingerprint,
        is_client: bool,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        event_tx: mpsc::Sender<DtlsEvent>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let shutdown = Arc::new(Notify::new());

        let conn = Arc::new(EndpointConn {
            inbound: Mutex::new(inbound_rx),
            event_tx: event_tx.clone(),
            local_addr,
            remote_addr,
        });
        let config = Config {
            certificates: vec![certificate],
            insecure_skip_verify: true,
            extended_master_secret: ExtendedMasterSecretType::Require,
            srtp_protection_profiles: vec![SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80],
            ..Default::default()
        };

        tokio::spawn(run_handshake(
            conn,
            config,
            is_client,
            remote_fingerprint,
            event_tx,
            shutdown.clone(),
        ));

        Self {
            inbound_tx,
            shutdown,
        }
    }

    /// Feed one inbound DTLS datagram to the handshake.
    pub async fn process_from_peer(&self, datagram: &[u8]) {
        let _ = self.inbound_tx.send(datagram.to_vec()).await;
    }

    /// Tear the session down.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

async fn run_handshake(
    conn: Arc<EndpointConn>,
    config: Config,
    is_client: bool,
    remote_fingerprint: RemoteFingerprint,
    event_tx: mpsc::Sender<DtlsEvent>,
    shutdown: Arc<Notify>,
) {
    let dtls = match DTLSConn::new(conn, config, is_client, None).await {
        Ok(dtls) => dtls,
        Err(e) => {
            error!("DTLS handshake failed: {}", e);
            let _ = event_tx.send(DtlsEvent::Failed(e.to_string())).await;
            return;
        }
    };

    match extract_keys(&dtls, is_client, &remote_fingerprint).await {
        Ok(keys) => {
            debug!("DTLS ready");
            let _ = event_tx.send(DtlsEvent::Setup(keys)).await;
            // hold the session open until the transport stops, then
            // send close_notify
            shutdown.notified().await;
            let _ = dtls.close().await;
        }
        Err(e) => {
            error!("DTLS setup failed: {}", e);
            let _ = event_tx.send(DtlsEvent::Failed(e.to_string())).await;
        }
    }
}

async fn extract_keys(
    dtls: &DTLSConn,
    is_client: bool,
    remote_fingerprint: &RemoteFingerprint,
) -> Result<DtlsKeys> {
    let state = dtls.connection_state().await;

    // certificate verification happens against the SDP fingerprint,
    // not a CA chain
    if !remote_fingerprint.algorithm.eq_ignore_ascii_case("sha-256") {
        return Err(Error::Dtls(format!(
            "unsupported fingerprint algorithm {}",
            remote_fingerprint.algorithm
        )));
    }
    let peer_cert = state
        .peer_certificates
        .first()
        .ok_or_else(|| Error::Dtls("peer sent no certificate".into()))?;
    let peer_fingerprint = format_fingerprint(&Sha256::digest(peer_cert));
    if !peer_fingerprint.eq_ignore_ascii_case(&remote_fingerprint.value) {
        return Err(Error::Dtls("peer certificate fingerprint mismatch".into()));
    }

    let profile = match dtls.selected_srtpprotection_profile() {
        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => ProtectionProfile::Aes128CmHmacSha1_80,
        other => {
            return Err(Error::Dtls(format!(
                "unsupported SRTP profile {:?}",
                other
            )))
        }
    };

    let material = state
        .export_keying_material(
            EXPORTER_LABEL,
            &[],
            2 * (SRTP_MASTER_KEY_LEN + SRTP_MASTER_SALT_LEN),
        )
        .await
        .map_err(|e| Error::Dtls(format!("keying material export: {}", e)))?;

    let (client_key, rest) = material.split_at(SRTP_MASTER_KEY_LEN);
    let (server_key, rest) = rest.split_at(SRTP_MASTER_KEY_LEN);
    let (client_salt, server_salt) = rest.split_at(SRTP_MASTER_SALT_LEN);

    // the client half keys our outbound direction when we initiated
    let (local_key, local_salt, remote_key, remote_salt) = if is_client {
        (client_key, client_salt, server_key, server_salt)
    } else {
        (server_key, server_salt, client_key, client_salt)
    };

    Ok(DtlsKeys {
        profile,
        local_key: local_key.to_vec(),
        local_salt: local_salt.to_vec(),
        remote_key: remote_key.to_vec(),
        remote_salt: remote_salt.to_vec(),
    })
}

/// In-memory datagram endpoint handed to the DTLS stack.
///
/// Receives what the demultiplexer classified as DTLS; sends by
/// surfacing records to the transport loop, which owns the socket.
struct EndpointConn {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    event_tx: mpsc::Sender<DtlsEvent>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

#[async_trait]
impl Conn for EndpointConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let datagram = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| webrtc_util::Error::Other("dtls endpoint closed".to_owned()))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let len = self.recv(buf).await?;
        Ok((len, self.remote_addr))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        self.event_tx
            .send(DtlsEvent::Transmit(buf.to_vec()))
            .await
            .map_err(|_| webrtc_util::Error::Other("transport loop gone".to_owned()))?;
        Ok(buf.len())
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_dtls_first_byte_range() {
        let mut datagram = [0u8; 13];
        for first in [20u8, 22, 63] {
            datagram[0] = first;
            assert!(is_dtls(&datagram), "byte {} should classify", first);
        }
        for first in [0u8, 19, 64, 128] {
            datagram[0] = first;
            assert!(!is_dtls(&datagram), "byte {} should not classify", first);
        }
        // too short for a DTLS record header
        assert!(!is_dtls(&[22u8; 12]));
    }

    #[test]
    fn test_format_fingerprint() {
        assert_eq!(format_fingerprint(&[0xab, 0x00, 0x1f]), "AB:00:1F");
    }

    #[test]
    fn test_context_fingerprint_shape() {
        let context = DtlsContext::new().unwrap();
        // 32 bytes of SHA-256 as colon-separated hex pairs
        assert_eq!(context.fingerprint().len(), 32 * 3 - 1);
        assert!(context
            .fingerprint()
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':'));
    }
}
