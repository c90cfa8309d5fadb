//! STUN integrity helpers

use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// XOR constant applied to the CRC32 in the FINGERPRINT attribute
/// (RFC 5389 Section 15.5)
pub const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Length of an HMAC-SHA1 digest
pub const SHA1_DIGEST_LEN: usize = 20;

/// Compute padding to the next 32-bit boundary.
pub fn pad_size(size: usize) -> usize {
    match size % 4 {
        0 => 0,
        rem => 4 - rem,
    }
}

/// HMAC-SHA1 over a sequence of message parts.
///
/// Parts let callers splice in a patched length field without
/// copying the message.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; SHA1_DIGEST_LEN] {
    // a SHA1 HMAC accepts any key length
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// STUN FINGERPRINT value: CRC32 of the message so far, XORed with
/// the fixed constant.
pub fn fingerprint(bytes: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(bytes) ^ FINGERPRINT_XOR
}
