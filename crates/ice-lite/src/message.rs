//! STUN binding message codec (RFC 5389, short-term credentials)
//!
//! Only the binding request/response pair used by ICE connectivity
//! checks is implemented. Validation is bit-exact: USERNAME must pair
//! the local and remote ufrags, MESSAGE-INTEGRITY is HMAC-SHA1 keyed
//! with the local password over the message prefix (with the length
//! field patched to exclude a trailing FINGERPRINT), and FINGERPRINT
//! is CRC32 of everything before it XORed with 0x5354554E.

use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use crate::error::Error;
use crate::util::{fingerprint, hmac_sha1, pad_size, SHA1_DIGEST_LEN};
use crate::Result;

pub const STUN_MAGIC_COOKIE: u32 = 0x2112_a442;
pub const STUN_HEADER_SIZE: usize = 20;

const TRANSACTION_ID_LEN: usize = 12;
const ATTR_HEADER_SIZE: usize = 4;
const LENGTH_OFFSET: usize = 2;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

/// STUN attribute types this agent understands
pub mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802a;
}

/// Classify a datagram as STUN: full header present, leading byte in
/// the request/indication range, magic cookie in place.
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] < 3
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == STUN_MAGIC_COOKIE
}

/// A STUN binding exchange bound to one session's credentials.
///
/// `parse` validates an inbound binding request against the
/// credentials; `create_response` then builds the success response
/// echoing the request's transaction id.
pub struct StunMessage<'a> {
    local_ufrag: &'a str,
    local_password: &'a str,
    remote_ufrag: &'a str,
    transaction_id: [u8; TRANSACTION_ID_LEN],
    use_candidate: bool,
}

impl<'a> StunMessage<'a> {
    pub fn new(local_ufrag: &'a str, local_password: &'a str, remote_ufrag: &'a str) -> Self {
        Self {
            local_ufrag,
            local_password,
            remote_ufrag,
            transaction_id: [0; TRANSACTION_ID_LEN],
            use_candidate: false,
        }
    }

    /// Whether the validated request carried USE-CANDIDATE.
    pub fn has_use_candidate(&self) -> bool {
        self.use_candidate
    }

    /// Validate a binding request.
    ///
    /// Walks every attribute; integrity and fingerprint checks run
    /// against the raw bytes exactly as specified, so any altered
    /// prefix byte fails verification.
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        if !is_stun(data) {
            return Err(Error::NotBindingRequest("failed STUN classifier".into()));
        }
        let msg_type = u16::from_be_bytes([data[0], data[1]]);
        if msg_type != BINDING_REQUEST {
            return Err(Error::NotBindingRequest(format!(
                "message type {:#06x}",
                msg_type
            )));
        }
        self.transaction_id
            .copy_from_slice(&data[8..STUN_HEADER_SIZE]);

        let mut offset = STUN_HEADER_SIZE;
        let mut integrity_offset: Option<usize> = None;
        let mut has_fingerprint = false;

        while offset + ATTR_HEADER_SIZE <= data.len() {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let value_offset = offset + ATTR_HEADER_SIZE;
            if value_offset + attr_len > data.len() {
                return Err(Error::Truncated {
                    required: value_offset + attr_len,
                    available: data.len(),
                });
            }
            let value = &data[value_offset..value_offset + attr_len];

            match attr_type {
                attr::USERNAME => {
                    if !(value.starts_with(self.local_ufrag.as_bytes())
                        && value.ends_with(self.remote_ufrag.as_bytes()))
                    {
                        return Err(Error::UsernameMismatch);
                    }
                }
                attr::MESSAGE_INTEGRITY => {
                    integrity_offset = Some(offset);
                }
                attr::FINGERPRINT => {
                    if attr_len != 4 {
                        return Err(Error::Truncated {
                            required: 4,
                            available: attr_len,
                        });
                    }
                    let announced = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    if announced != fingerprint(&data[..offset]) {
                        return Err(Error::FingerprintMismatch);
                    }
                    has_fingerprint = true;
                }
                attr::USE_CANDIDATE => {
                    self.use_candidate = true;
                }
                attr::ICE_CONTROLLED => {
                    // an ice-lite agent is always the controlled side
                    return Err(Error::RoleConflict);
                }
                attr::ICE_CONTROLLING | attr::MAPPED_ADDRESS => {}
                _ => {}
            }

            offset = value_offset + attr_len + pad_size(attr_len);
        }

        if let Some(mi_offset) = integrity_offset {
            let digest_offset = mi_offset + ATTR_HEADER_SIZE;
            if digest_offset + SHA1_DIGEST_LEN > data.len() {
                return Err(Error::Truncated {
                    required: digest_offset + SHA1_DIGEST_LEN,
                    available: data.len(),
                });
            }

            // HMAC covers the message up to the integrity attribute;
            // the length field must be rewritten to exclude a
            // trailing FINGERPRINT before hashing
            let computed = if has_fingerprint {
                let patched_len =
                    (data.len() - STUN_HEADER_SIZE - ATTR_HEADER_SIZE - 4) as u16;
                hmac_sha1(
                    self.local_password.as_bytes(),
                    &[
                        &data[..LENGTH_OFFSET],
                        &patched_len.to_be_bytes(),
                        &data[4..mi_offset],
                    ],
                )
            } else {
                hmac_sha1(self.local_password.as_bytes(), &[&data[..mi_offset]])
            };

            if computed != data[digest_offset..digest_offset + SHA1_DIGEST_LEN] {
                return Err(Error::IntegrityMismatch);
            }
        }

        Ok(())
    }

    /// Build the binding success response: 20-byte header,
    /// XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY, FINGERPRINT.
    ///
    /// The length field is patched twice during serialization: once
    /// so the HMAC covers the integrity-terminated prefix, then to
    /// the final total before the fingerprint is computed.
    pub fn create_response(&self, mapped: &SocketAddr) -> Result<BytesMut> {
        let SocketAddr::V4(mapped) = mapped else {
            return Err(Error::UnsupportedAddressFamily);
        };

        const XOR_ADDR_LEN: usize = 12;
        const INTEGRITY_LEN: usize = ATTR_HEADER_SIZE + SHA1_DIGEST_LEN;
        const FINGERPRINT_LEN: usize = 8;
        const TOTAL: usize = STUN_HEADER_SIZE + XOR_ADDR_LEN + INTEGRITY_LEN + FINGERPRINT_LEN;

        let mut buf = BytesMut::with_capacity(TOTAL);
        buf.put_u16(BINDING_RESPONSE);
        buf.put_u16((TOTAL - STUN_HEADER_SIZE) as u16);
        buf.put_u32(STUN_MAGIC_COOKIE);
        buf.put_slice(&self.transaction_id);

        buf.put_u16(attr::XOR_MAPPED_ADDRESS);
        buf.put_u16(8);
        buf.put_u8(0);
        buf.put_u8(0x01); // IPv4 family
        buf.put_u16(mapped.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16);
        buf.put_u32(u32::from(*mapped.ip()) ^ STUN_MAGIC_COOKIE);

        // length as if the message ended at MESSAGE-INTEGRITY
        let integrity_len = (XOR_ADDR_LEN + INTEGRITY_LEN) as u16;
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&integrity_len.to_be_bytes());
        let digest = hmac_sha1(self.local_password.as_bytes(), &[&buf[..]]);

        buf.put_u16(attr::MESSAGE_INTEGRITY);
        buf.put_u16(SHA1_DIGEST_LEN as u16);
        buf.put_slice(&digest);

        let final_len = (XOR_ADDR_LEN + INTEGRITY_LEN + FINGERPRINT_LEN) as u16;
        buf[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&final_len.to_be_bytes());
        let crc = fingerprint(&buf);

        buf.put_u16(attr::FINGERPRINT);
        buf.put_u16(4);
        buf.put_u32(crc);

        Ok(buf)
    }
}
