//! Minimal SDP handling
//!
//! Only the handful of attributes this sendonly server cares about
//! are parsed out of the subscriber's offer; the answer is written
//! directly since its shape is fixed: ice-lite, setup:active, two
//! sendonly m-lines bundled as "0 1", H.264 with RTX then Opus.

use std::fmt::Write;

use tracing::debug;

use super::{AUDIO_SSRC, VIDEO_RTX_SSRC, VIDEO_SSRC};
use crate::error::Error;
use crate::Result;

/// Fields extracted from a subscriber's SDP offer.
#[derive(Debug, Clone, Default)]
pub struct SdpOffer {
    /// The peer's setup role (normally "actpass")
    pub remote_setup: String,

    /// The peer's ICE ufrag
    pub ice_ufrag: String,

    /// The peer's ICE password
    pub ice_pwd: String,

    /// Fingerprint hash algorithm, e.g. "sha-256"
    pub fingerprint_algorithm: String,

    /// Fingerprint value, colon-separated hex
    pub fingerprint_value: String,

    /// Payload type the peer mapped to H264
    pub h264_payload_type: u8,

    /// Payload type of the RTX stream associated with the H264 one
    pub h264_rtx_payload_type: Option<u8>,

    /// Payload type the peer mapped to opus
    pub opus_payload_type: Option<u8>,
}

/// Parse the attributes the server needs out of an offer.
///
/// A missing setup, ICE credential, fingerprint or H.264 mapping is
/// an error: the session cannot be established without them.
pub fn parse_offer(sdp: &str) -> Result<SdpOffer> {
    let mut offer = SdpOffer::default();
    let mut in_video = false;
    let mut in_audio = false;
    let mut h264_payload_types: Vec<u8> = Vec::new();
    // (rtx payload type, apt value) pairs seen in fmtp lines
    let mut apt_mappings: Vec<(u8, u8)> = Vec::new();

    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(media) = line.strip_prefix("m=") {
            in_video = media.starts_with("video");
            in_audio = media.starts_with("audio");
            continue;
        }
        let Some(attribute) = line.strip_prefix("a=") else {
            continue;
        };

        if let Some(value) = attribute.strip_prefix("setup:") {
            if offer.remote_setup.is_empty() {
                offer.remote_setup = value.to_string();
            }
        } else if let Some(value) = attribute.strip_prefix("ice-ufrag:") {
            if offer.ice_ufrag.is_empty() {
                offer.ice_ufrag = value.to_string();
            }
        } else if let Some(value) = attribute.strip_prefix("ice-pwd:") {
            if offer.ice_pwd.is_empty() {
                offer.ice_pwd = value.to_string();
            }
        } else if let Some(value) = attribute.strip_prefix("fingerprint:") {
            if offer.fingerprint_value.is_empty() {
                let (algorithm, hash) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::Sdp("malformed fingerprint".into()))?;
                offer.fingerprint_algorithm = algorithm.to_string();
                offer.fingerprint_value = hash.to_string();
            }
        } else if let Some(value) = attribute.strip_prefix("rtpmap:") {
            let (pt, codec) = value
                .split_once(' ')
                .ok_or_else(|| Error::Sdp("malformed rtpmap".into()))?;
            let pt: u8 = pt
                .parse()
                .map_err(|_| Error::Sdp(format!("bad payload type {}", pt)))?;
            let codec_name = codec.split('/').next().unwrap_or_default();
            if in_video && codec_name.eq_ignore_ascii_case("H264") {
                h264_payload_types.push(pt);
            } else if in_audio && codec_name.eq_ignore_ascii_case("opus") {
                offer.opus_payload_type.get_or_insert(pt);
            }
        } else if let Some(value) = attribute.strip_prefix("fmtp:") {
            if !in_video {
                continue;
            }
            let Some((pt, config)) = value.split_once(' ') else {
                continue;
            };
            let Ok(pt) = pt.parse::<u8>() else {
                continue;
            };
            for param in config.split(';') {
                if let Some(apt) = param.trim().strip_prefix("apt=") {
                    if let Ok(apt) = apt.parse::<u8>() {
                        apt_mappings.push((pt, apt));
                    }
                }
            }
        }
    }

    if offer.remote_setup.is_empty() {
        return Err(Error::Sdp("offer has no setup attribute".into()));
    }
    if offer.ice_ufrag.is_empty() || offer.ice_pwd.is_empty() {
        return Err(Error::Sdp("offer has no ice-ufrag/ice-pwd".into()));
    }
    if offer.fingerprint_value.is_empty() {
        return Err(Error::Sdp("offer has no fingerprint".into()));
    }
    let h264 = *h264_payload_types
        .first()
        .ok_or_else(|| Error::Sdp("offer has no H264 mapping".into()))?;
    offer.h264_payload_type = h264;
    offer.h264_rtx_payload_type = apt_mappings
        .iter()
        .find(|(_, apt)| *apt == h264)
        .map(|(pt, _)| *pt);

    debug!(
        h264 = offer.h264_payload_type,
        rtx = ?offer.h264_rtx_payload_type,
        opus = ?offer.opus_payload_type,
        "parsed offer"
    );
    Ok(offer)
}

/// Everything the answer depends on.
pub struct AnswerParams<'a> {
    pub ice_ufrag: &'a str,
    pub ice_pwd: &'a str,
    pub fingerprint: &'a str,
    pub announced_ip: &'a str,
    pub port: u16,
    pub h264_payload_type: u8,
    pub h264_rtx_payload_type: u8,
    pub opus_payload_type: u8,
}

/// Write the sendonly answer.
pub fn create_answer(params: &AnswerParams<'_>) -> String {
    let mut sdp = String::with_capacity(2048);
    let candidate = format!(
        "a=candidate:4 1 udp 2130706431 {} {} typ host",
        params.announced_ip, params.port
    );

    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 1495799811084970 1495799811084970 IN IP4 0.0.0.0");
    let _ = writeln!(sdp, "s=-");
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "a=group:BUNDLE 0 1");
    let _ = writeln!(sdp, "a=msid-semantic: WMS rtcast");
    let _ = writeln!(sdp, "a=ice-lite");

    // video first: H.264 plus its retransmission stream
    let _ = writeln!(
        sdp,
        "m=video 9 UDP/TLS/RTP/SAVPF {} {}",
        params.h264_payload_type, params.h264_rtx_payload_type
    );
    let _ = writeln!(sdp, "c=IN IP4 0.0.0.0");
    let _ = writeln!(sdp, "a=rtcp-mux");
    let _ = writeln!(sdp, "a=ice-ufrag:{}", params.ice_ufrag);
    let _ = writeln!(sdp, "a=ice-pwd:{}", params.ice_pwd);
    let _ = writeln!(sdp, "a=fingerprint:sha-256 {}", params.fingerprint);
    let _ = writeln!(sdp, "a=setup:active");
    let _ = writeln!(sdp, "a=mid:0");
    let _ = writeln!(sdp, "a=sendonly");
    let _ = writeln!(sdp, "a=msid:rtcast video0");
    let _ = writeln!(sdp, "a=rtpmap:{} H264/90000", params.h264_payload_type);
    let _ = writeln!(sdp, "a=rtcp-fb:{} nack", params.h264_payload_type);
    let _ = writeln!(sdp, "a=rtpmap:{} rtx/90000", params.h264_rtx_payload_type);
    let _ = writeln!(
        sdp,
        "a=fmtp:{} apt={}",
        params.h264_rtx_payload_type, params.h264_payload_type
    );
    let _ = writeln!(sdp, "a=ssrc-group:FID {} {}", VIDEO_SSRC, VIDEO_RTX_SSRC);
    let _ = writeln!(sdp, "a=ssrc:{} cname:rtcast", VIDEO_SSRC);
    let _ = writeln!(sdp, "a=ssrc:{} msid:rtcast video0", VIDEO_SSRC);
    let _ = writeln!(sdp, "a=ssrc:{} cname:rtcast", VIDEO_RTX_SSRC);
    let _ = writeln!(sdp, "a=ssrc:{} msid:rtcast video0", VIDEO_RTX_SSRC);
    let _ = writeln!(sdp, "{}", candidate);

    // audio second: Opus, stereo at 48 kHz
    let _ = writeln!(
        sdp,
        "m=audio 9 UDP/TLS/RTP/SAVPF {}",
        params.opus_payload_type
    );
    let _ = writeln!(sdp, "c=IN IP4 0.0.0.0");
    let _ = writeln!(sdp, "a=rtcp-mux");
    let _ = writeln!(sdp, "a=ice-ufrag:{}", params.ice_ufrag);
    let _ = writeln!(sdp, "a=ice-pwd:{}", params.ice_pwd);
    let _ = writeln!(sdp, "a=fingerprint:sha-256 {}", params.fingerprint);
    let _ = writeln!(sdp, "a=setup:active");
    let _ = writeln!(sdp, "a=mid:1");
    let _ = writeln!(sdp, "a=sendonly");
    let _ = writeln!(sdp, "a=msid:rtcast audio0");
    let _ = writeln!(sdp, "a=rtpmap:{} opus/48000/2", params.opus_payload_type);
    let _ = writeln!(
        sdp,
        "a=fmtp:{} minptime=20;useinbandfec=1",
        params.opus_payload_type
    );
    let _ = writeln!(sdp, "a=ssrc:{} cname:rtcast", AUDIO_SSRC);
    let _ = writeln!(sdp, "a=ssrc:{} msid:rtcast audio0", AUDIO_SSRC);
    let _ = writeln!(sdp, "{}", candidate);

    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 125 107\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:EsAw\r\n\
a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
a=fingerprint:sha-256 D2:FA:0E:C3:22:59:5E:14:95:69:92:3D:13:B4:84:24:2C:C2:A2:C0:3E:FD:34:8E:5E:EA:6F:AF:52:CE:E6:0F\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:125 H264/90000\r\n\
a=fmtp:125 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtpmap:107 rtx/90000\r\n\
a=fmtp:107 apt=125\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:EsAw\r\n\
a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
a=fingerprint:sha-256 D2:FA:0E:C3:22:59:5E:14:95:69:92:3D:13:B4:84:24:2C:C2:A2:C0:3E:FD:34:8E:5E:EA:6F:AF:52:CE:E6:0F\r\n\
a=setup:actpass\r\n\
a=mid:1\r\n\
a=recvonly\r\n\
a=rtpmap:111 opus/48000/2\r\n";

    #[test]
    fn test_parse_browser_offer() {
        let offer = parse_offer(OFFER).unwrap();
        assert_eq!(offer.remote_setup, "actpass");
        assert_eq!(offer.ice_ufrag, "EsAw");
        assert_eq!(offer.ice_pwd, "P2uYro0UCOQ4zxjKXaWCBui1");
        assert_eq!(offer.fingerprint_algorithm, "sha-256");
        assert!(offer.fingerprint_value.starts_with("D2:FA:0E"));
        assert_eq!(offer.h264_payload_type, 125);
        // the rtx stream is matched to H264 through apt, not VP8's
        assert_eq!(offer.h264_rtx_payload_type, Some(107));
        assert_eq!(offer.opus_payload_type, Some(111));
    }

    #[test]
    fn test_offer_without_h264_rejected() {
        let sdp = OFFER.replace("H264/90000", "AV1/90000");
        assert!(parse_offer(&sdp).is_err());
    }

    #[test]
    fn test_offer_without_fingerprint_rejected() {
        let sdp = OFFER.replace("a=fingerprint", "a=x-fingerprint");
        assert!(parse_offer(&sdp).is_err());
    }

    #[test]
    fn test_answer_shape() {
        let params = AnswerParams {
            ice_ufrag: "frag",
            ice_pwd: "password",
            fingerprint: "AA:BB",
            announced_ip: "203.0.113.9",
            port: 41000,
            h264_payload_type: 125,
            h264_rtx_payload_type: 107,
            opus_payload_type: 111,
        };
        let answer = create_answer(&params);

        assert!(answer.contains("a=ice-lite\n"));
        assert!(answer.contains("a=group:BUNDLE 0 1\n"));
        assert!(answer.contains("m=video 9 UDP/TLS/RTP/SAVPF 125 107\n"));
        assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111\n"));
        // video comes before audio
        assert!(answer.find("m=video").unwrap() < answer.find("m=audio").unwrap());
        assert_eq!(answer.matches("a=setup:active\n").count(), 2);
        assert_eq!(answer.matches("a=sendonly\n").count(), 2);
        assert_eq!(
            answer
                .matches("a=candidate:4 1 udp 2130706431 203.0.113.9 41000 typ host\n")
                .count(),
            2
        );
        assert!(answer.contains("a=rtcp-fb:125 nack\n"));
        assert!(answer.contains("a=fmtp:107 apt=125\n"));
        assert!(answer.contains("a=ssrc-group:FID 12345678 9527\n"));
        assert!(answer.contains("a=ssrc:87654321 cname:rtcast\n"));
        assert!(answer.contains("a=rtpmap:111 opus/48000/2\n"));
        assert!(answer.contains("a=fmtp:111 minptime=20;useinbandfec=1\n"));
    }
}
