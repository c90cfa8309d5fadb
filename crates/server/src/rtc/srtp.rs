//! SRTP session pair
//!
//! One context per direction: outbound RTP/RTCP are protected with
//! the local master key, inbound RTCP is unprotected with the remote
//! one. Inbound RTP never arrives on a sendonly session, so there is
//! deliberately no `unprotect_rtp`.

use bytes::Bytes;
use webrtc_srtp::context::Context;

use super::dtls::DtlsKeys;
use crate::error::Error;
use crate::Result;

pub struct SrtpPair {
    protect: Context,
    unprotect: Context,
}

impl SrtpPair {
    /// Build both directions from freshly extracted DTLS keys.
    pub fn new(keys: &DtlsKeys) -> Result<Self> {
        let protect = Context::new(&keys.local_key, &keys.local_salt, keys.profile, None, None)
            .map_err(|e| Error::Srtp(format!("protect context: {}", e)))?;
        let unprotect = Context::new(&keys.remote_key, &keys.remote_salt, keys.profile, None, None)
            .map_err(|e| Error::Srtp(format!("unprotect context: {}", e)))?;
        Ok(Self { protect, unprotect })
    }

    /// Protect an outbound RTP packet.
    pub fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.protect
            .encrypt_rtp(packet)
            .map_err(|e| Error::Srtp(format!("protect rtp: {}", e)))
    }

    /// Protect an outbound RTCP packet.
    pub fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.protect
            .encrypt_rtcp(packet)
            .map_err(|e| Error::Srtp(format!("protect rtcp: {}", e)))
    }

    /// Unprotect an inbound RTCP packet.
    pub fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.unprotect
            .decrypt_rtcp(packet)
            .map_err(|e| Error::Srtp(format!("unprotect rtcp: {}", e)))
    }
}
