//! ICE-lite agent
//!
//! The passive side of ICE: local credentials are generated up
//! front and advertised in the SDP answer, every valid binding
//! request is answered from the bound socket, and the newest
//! validated remote endpoint becomes the send target. The agent
//! never retries and never probes on its own.

use std::net::SocketAddr;

use bytes::BytesMut;
use rand::Rng;
use tracing::debug;

use crate::message::StunMessage;
use crate::Result;

const UFRAG_LEN: usize = 8;
const PASSWORD_LEN: usize = 24;
const CREDENTIAL_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CREDENTIAL_CHARSET[rng.gen_range(0..CREDENTIAL_CHARSET.len())] as char)
        .collect()
}

/// Result of a successfully processed binding request.
#[derive(Debug)]
pub struct IceEvent {
    /// Serialized binding response to send back to the requester
    pub response: BytesMut,

    /// Set on the first successful exchange only
    pub connection_completed: bool,
}

/// Per-session ICE-lite state.
pub struct IceLiteAgent {
    local_ufrag: String,
    local_password: String,
    remote_ufrag: String,
    selected_endpoint: Option<SocketAddr>,
    completed: bool,
}

impl IceLiteAgent {
    /// Create an agent for one session, generating local credentials.
    ///
    /// `remote_ufrag` comes from the subscriber's SDP offer.
    pub fn new(remote_ufrag: &str) -> Self {
        Self {
            local_ufrag: random_string(UFRAG_LEN),
            local_password: random_string(PASSWORD_LEN),
            remote_ufrag: remote_ufrag.to_owned(),
            selected_endpoint: None,
            completed: false,
        }
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    pub fn local_password(&self) -> &str {
        &self.local_password
    }

    /// The endpoint media and feedback flow to, once known.
    pub fn selected_endpoint(&self) -> Option<SocketAddr> {
        self.selected_endpoint
    }

    /// Validate a binding request from `from` and produce the
    /// response.
    ///
    /// A valid request (re)selects `from` as the remote endpoint;
    /// the first one completes the connection. Invalid requests
    /// surface as errors and the caller drops the datagram.
    pub fn process_message(&mut self, data: &[u8], from: SocketAddr) -> Result<IceEvent> {
        let mut message =
            StunMessage::new(&self.local_ufrag, &self.local_password, &self.remote_ufrag);
        message.parse(data)?;

        if self.selected_endpoint != Some(from) {
            debug!(%from, use_candidate = message.has_use_candidate(), "selecting remote endpoint");
            self.selected_endpoint = Some(from);
        }

        let response = message.create_response(&from)?;
        let connection_completed = !self.completed;
        self.completed = true;
        Ok(IceEvent {
            response,
            connection_completed,
        })
    }
}
