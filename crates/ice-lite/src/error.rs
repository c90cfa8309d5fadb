use thiserror::Error;

/// Result type alias for STUN/ICE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while validating STUN messages or running the
/// ICE-lite agent. Any of these makes the caller drop the datagram.
#[derive(Error, Debug)]
pub enum Error {
    /// Message ended before the structure being read
    #[error("truncated STUN message: required {required}, available {available}")]
    Truncated { required: usize, available: usize },

    /// Not a STUN binding request at all
    #[error("not a STUN binding request: {0}")]
    NotBindingRequest(String),

    /// USERNAME did not carry our ufrag pair
    #[error("USERNAME does not match local/remote ufrag")]
    UsernameMismatch,

    /// MESSAGE-INTEGRITY did not verify against the local password
    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityMismatch,

    /// FINGERPRINT did not match the message bytes
    #[error("FINGERPRINT verification failed")]
    FingerprintMismatch,

    /// Peer claimed the controlled role, which ice-lite always holds
    #[error("peer sent ICE-CONTROLLED but this agent is always controlled")]
    RoleConflict,

    /// Only IPv4 endpoints are supported
    #[error("unsupported address family")]
    UnsupportedAddressFamily,
}
