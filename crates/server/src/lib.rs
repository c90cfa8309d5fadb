//! # rtcast server library
//!
//! A one-way WebRTC media server: it pulls a live H.264/AAC feed
//! from an upstream RTMP publisher, transcodes the audio to Opus,
//! and republishes the stream over WebRTC to any number of
//! subscribers. Subscribers negotiate over a small HTTP signaling
//! surface and then receive media on a single DTLS-SRTP protected
//! UDP flow.
//!
//! Module map:
//!
//! - [`config`]: TOML server configuration
//! - [`media`]: ingest side — media packets, RTMP source, AAC→Opus
//!   transcoding, GOP cache, source registry
//! - [`rtc`]: delivery side — SDP, DTLS driver, SRTP pair, media
//!   stream, per-subscriber transport, transport registry
//! - [`signaling`]: HTTP REST surface

pub mod config;
pub mod error;
pub mod media;
pub mod rtc;
pub mod signaling;

pub use config::ServerConfig;
pub use error::{Error, Result};
