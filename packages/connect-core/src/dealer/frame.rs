//! Dealer wire frame parsing and encoding.
//!
//! Parsing is tolerant by design: a malformed
//! or truncated frame is logged and discarded, never allowed to poison the
//! read loop. Unknown `type` values are silently discarded. This module
//! does no network I/O; [`super::connection::Dealer`] owns the socket.

use std::collections::HashMap;

use base64::Engine;
use serde::Deserialize;
use std::io::Read;

/// A parsed inbound dealer frame.
#[derive(Debug, Clone)]
pub enum DealerFrame {
    Ping,
    Pong,
    Message(MessageFrame),
    Request(RequestFrame),
}

/// A `message` frame: headers plus one or more (here: exactly one, per the
/// protocol) base64-decoded, optionally gunzipped payload.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub uri: String,
    pub headers: HashMap<String, String>,
    pub payloads: Vec<Vec<u8>>,
}

impl MessageFrame {
    /// Convenience accessor for the single-payload case the protocol uses.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payloads.first().map(Vec::as_slice)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A `request` frame: a command the dealer expects a reply for.
///
/// `key` is nominally `<message_id>/<sender_device_id>` but the parser
/// tolerates an opaque key: in that case
/// `message_id` is `0` and `sender_device_id` is empty, and the original
/// `key` string is preserved verbatim for the reply.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub key: String,
    pub message_ident: String,
    pub message_id: u64,
    pub sender_device_id: String,
    pub payload: serde_json::Value,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    uri: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    payloads: Vec<String>,
    key: Option<String>,
    message_ident: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Parses one JSON text frame into a [`DealerFrame`].
///
/// Returns `None` (logged at warn level) on malformed JSON, an unknown
/// `type`, or a `message`/`request` frame missing required fields. Never
/// panics on attacker-controlled input.
pub fn parse_frame(text: &str) -> Option<DealerFrame> {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("dealer: failed to parse frame as JSON: {e}");
            log::trace!("dealer: raw frame was: {text}");
            return None;
        }
    };

    match raw.frame_type.as_deref() {
        Some("ping") => Some(DealerFrame::Ping),
        Some("pong") => Some(DealerFrame::Pong),
        Some("message") => parse_message(raw),
        Some("request") => Some(parse_request(raw)),
        Some(other) => {
            log::debug!("dealer: discarding frame of unknown type {other:?}");
            None
        }
        None => {
            log::warn!("dealer: frame missing a \"type\" field");
            None
        }
    }
}

fn parse_message(raw: RawFrame) -> Option<DealerFrame> {
    let uri = raw.uri.or_else(|| {
        log::warn!("dealer: message frame missing \"uri\"");
        None
    })?;

    let gzipped = raw
        .headers
        .get("Transfer-Encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let mut payloads = Vec::with_capacity(raw.payloads.len());
    for encoded in &raw.payloads {
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            log::warn!("dealer: message payload is not valid base64, discarding frame");
            return None;
        };
        let bytes = if gzipped {
            match gunzip(&decoded) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("dealer: failed to gunzip message payload: {e}");
                    return None;
                }
            }
        } else {
            decoded
        };
        payloads.push(bytes);
    }

    Some(DealerFrame::Message(MessageFrame {
        uri,
        headers: raw.headers,
        payloads,
    }))
}

fn parse_request(raw: RawFrame) -> DealerFrame {
    let key = raw.key.unwrap_or_default();
    let (message_id, sender_device_id) = split_key(&key);
    DealerFrame::Request(RequestFrame {
        key,
        message_ident: raw.message_ident.unwrap_or_default(),
        message_id,
        sender_device_id,
        payload: raw.payload,
    })
}

/// Splits a request key of the form `<message_id>/<sender_device_id>`.
/// An opaque key (no `/`, or a non-numeric prefix) yields `(0, "")`
/// without rejecting the frame — the dealer must tolerate this.
fn split_key(key: &str) -> (u64, String) {
    match key.split_once('/') {
        Some((id, sender)) => match id.parse::<u64>() {
            Ok(id) => (id, sender.to_string()),
            Err(_) => (0, String::new()),
        },
        None => (0, String::new()),
    }
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Pre-encoded `pong` literal, reused on every heartbeat reply instead of
/// re-serializing it each time.
pub const PONG_FRAME: &str = r#"{"type":"pong"}"#;

/// Encodes a reply frame for a given request `key` and outcome.
pub fn encode_reply(key: &str, success: bool) -> String {
    serde_json::json!({
        "type": "reply",
        "key": key,
        "payload": { "success": success },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ping_and_pong() {
        assert!(matches!(parse_frame(r#"{"type":"ping"}"#), Some(DealerFrame::Ping)));
        assert!(matches!(parse_frame(r#"{"type":"pong"}"#), Some(DealerFrame::Pong)));
    }

    #[test]
    fn message_with_absent_fields_does_not_panic() {
        let frame = parse_frame(r#"{"type":"message","uri":"hm://x"}"#).unwrap();
        match frame {
            DealerFrame::Message(m) => {
                assert_eq!(m.uri, "hm://x");
                assert!(m.payloads.is_empty());
            }
            _ => panic!("expected message frame"),
        }
    }

    #[test]
    fn message_with_empty_payloads_array_decodes_to_empty() {
        let frame = parse_frame(r#"{"type":"message","uri":"hm://x","payloads":[]}"#).unwrap();
        match frame {
            DealerFrame::Message(m) => assert!(m.payloads.is_empty()),
            _ => panic!("expected message frame"),
        }
    }

    #[test]
    fn request_with_structured_key_splits_message_id_and_sender() {
        let frame = parse_frame(r#"{"type":"request","key":"7/abc","message_ident":"hm://x","payload":{}}"#).unwrap();
        match frame {
            DealerFrame::Request(r) => {
                assert_eq!(r.message_id, 7);
                assert_eq!(r.sender_device_id, "abc");
            }
            _ => panic!("expected request frame"),
        }
    }

    #[test]
    fn request_with_opaque_key_tolerates_it() {
        let frame = parse_frame(r#"{"type":"request","key":"abc","message_ident":"hm://x","payload":{}}"#).unwrap();
        match frame {
            DealerFrame::Request(r) => {
                assert_eq!(r.message_id, 0);
                assert_eq!(r.sender_device_id, "");
                assert_eq!(r.key, "abc");
            }
            _ => panic!("expected request frame"),
        }
    }

    #[test]
    fn malformed_json_is_discarded_not_panicking() {
        assert!(parse_frame("not json").is_none());
        assert!(parse_frame(r#"{"type": "#).is_none());
    }

    #[test]
    fn unknown_type_is_discarded() {
        assert!(parse_frame(r#"{"type":"unknown_future_frame"}"#).is_none());
    }

    #[test]
    fn large_frame_parses_correctly() {
        let big_uri = "hm://".to_string() + &"x".repeat(2 * 1024 * 1024);
        let json = serde_json::json!({"type":"message","uri":big_uri,"payloads":[]}).to_string();
        assert!(json.len() > 1024 * 1024);
        let frame = parse_frame(&json).unwrap();
        match frame {
            DealerFrame::Message(m) => assert_eq!(m.uri.len(), big_uri.len()),
            _ => panic!("expected message frame"),
        }
    }

    #[test]
    fn reply_encodes_expected_shape() {
        let encoded = encode_reply("7/abc", true);
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "reply");
        assert_eq!(value["key"], "7/abc");
        assert_eq!(value["payload"]["success"], true);
    }
}
