//! # ICE-lite library for the rtcast project
//!
//! `rtcast-ice-lite` implements the passive half of ICE that a
//! media server answering browsers needs: parse and validate STUN
//! binding requests bit-exact per RFC 5389 short-term credentials,
//! answer them with XOR-MAPPED-ADDRESS + MESSAGE-INTEGRITY +
//! FINGERPRINT, and track which remote endpoint the session should
//! send media to. The agent never initiates connectivity checks.

pub mod agent;
pub mod error;
pub mod message;
pub mod util;

pub use agent::{IceEvent, IceLiteAgent};
pub use error::{Error, Result};
pub use message::{is_stun, StunMessage};
