use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connectivity candidate as it travels in the `ice` object of a
/// `candidate` message. Field names are the browser's `RTCIceCandidateInit`.
///
/// `sdpMLineIndex` is held as `u16`, the engine's type: a negative or
/// out-of-range index fails to decode and the message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

/// Messages a peer may send over the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { ice: IceCandidate },
    Close,
    Bye,
    Register,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Offer { .. } => "offer",
            InboundMessage::Answer { .. } => "answer",
            InboundMessage::Candidate { .. } => "candidate",
            InboundMessage::Close => "close",
            InboundMessage::Bye => "bye",
            InboundMessage::Register => "register",
        }
    }
}

/// Messages the session sends back to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Answer {
        sdp: String,
    },
    Candidate {
        ice: IceCandidate,
    },
    Accept {
        #[serde(rename = "isExistUser")]
        is_exist_user: bool,
    },
    Ping,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Answer { .. } => "answer",
            OutboundMessage::Candidate { .. } => "candidate",
            OutboundMessage::Accept { .. } => "accept",
            OutboundMessage::Ping => "ping",
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Why an inbound frame was dropped without any reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Not JSON at all.
    Unparsable,
    /// No `type`, or `type` is not a string.
    MissingType,
    UnknownType,
    /// A required field is absent or has the wrong shape.
    InvalidField(&'static str),
    /// `answer` or `candidate` with no live peer connection.
    NoPeerConnection,
    /// `offer` while a peer connection is already live.
    PeerConnectionExists,
}

impl Discard {
    pub fn label(&self) -> &'static str {
        match self {
            Discard::Unparsable => "unparsable",
            Discard::MissingType => "missing_type",
            Discard::UnknownType => "unknown_type",
            Discard::InvalidField(_) => "invalid_field",
            Discard::NoPeerConnection => "no_peer_connection",
            Discard::PeerConnectionExists => "peer_connection_exists",
        }
    }
}

/// Decode one text frame.
///
/// Anything that is not a well-formed message of a known type yields a
/// [`Discard`]; callers drop the frame without replying.
pub fn parse(text: &str) -> Result<InboundMessage, Discard> {
    let value: Value = serde_json::from_str(text).map_err(|_| Discard::Unparsable)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Discard::MissingType)?;

    match kind {
        "offer" => Ok(InboundMessage::Offer {
            sdp: field(&value, "sdp")?,
        }),
        "answer" => Ok(InboundMessage::Answer {
            sdp: field(&value, "sdp")?,
        }),
        "candidate" => Ok(InboundMessage::Candidate {
            ice: field(&value, "ice")?,
        }),
        "close" => Ok(InboundMessage::Close),
        "bye" => Ok(InboundMessage::Bye),
        "register" => Ok(InboundMessage::Register),
        _ => Err(Discard::UnknownType),
    }
}

fn field<T: DeserializeOwned>(value: &Value, name: &'static str) -> Result<T, Discard> {
    let raw = value.get(name).ok_or(Discard::InvalidField(name))?;
    T::deserialize(raw).map_err(|_| Discard::InvalidField(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn parses_offer_and_answer() {
        assert_eq!(
            parse(r#"{"type":"offer","sdp":"v=0"}"#),
            Ok(InboundMessage::Offer { sdp: "v=0".into() })
        );
        assert_eq!(
            parse(r#"{"type":"answer","sdp":"v=0","extra":1}"#),
            Ok(InboundMessage::Answer { sdp: "v=0".into() })
        );
    }

    #[test_timeout::timeout]
    fn parses_candidate() {
        let text = json!({
            "type": "candidate",
            "ice": {
                "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                "sdpMLineIndex": 1,
                "sdpMid": "audio"
            }
        })
        .to_string();
        assert_eq!(
            parse(&text),
            Ok(InboundMessage::Candidate {
                ice: IceCandidate {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                    sdp_mline_index: 1,
                    sdp_mid: "audio".into(),
                }
            })
        );
    }

    #[test_timeout::timeout]
    fn bare_types_need_no_payload() {
        assert_eq!(parse(r#"{"type":"close"}"#), Ok(InboundMessage::Close));
        assert_eq!(parse(r#"{"type":"bye"}"#), Ok(InboundMessage::Bye));
        assert_eq!(parse(r#"{"type":"register"}"#), Ok(InboundMessage::Register));
    }

    #[test_timeout::timeout]
    fn rejects_non_json_and_missing_type() {
        assert_eq!(parse("not json"), Err(Discard::Unparsable));
        assert_eq!(parse(""), Err(Discard::Unparsable));
        assert_eq!(parse(r#"{"sdp":"v=0"}"#), Err(Discard::MissingType));
        assert_eq!(parse(r#"{"type":7}"#), Err(Discard::MissingType));
        assert_eq!(parse(r#"["offer"]"#), Err(Discard::MissingType));
        assert_eq!(parse("null"), Err(Discard::MissingType));
    }

    #[test_timeout::timeout]
    fn unknown_types_are_discarded() {
        assert_eq!(parse(r#"{"type":"ping"}"#), Err(Discard::UnknownType));
        assert_eq!(parse(r#"{"type":"OFFER","sdp":""}"#), Err(Discard::UnknownType));
    }

    #[test_timeout::timeout]
    fn mistyped_fields_are_discarded() {
        assert_eq!(
            parse(r#"{"type":"offer","sdp":42}"#),
            Err(Discard::InvalidField("sdp"))
        );
        assert_eq!(
            parse(r#"{"type":"answer"}"#),
            Err(Discard::InvalidField("sdp"))
        );
        for ice in [
            json!(null),
            json!({"candidate": "c", "sdpMLineIndex": "0", "sdpMid": "0"}),
            json!({"candidate": "c", "sdpMLineIndex": -1, "sdpMid": "0"}),
            json!({"candidate": "c", "sdpMLineIndex": 0.5, "sdpMid": "0"}),
            json!({"candidate": "c", "sdpMLineIndex": 0, "sdpMid": null}),
            json!({"sdpMLineIndex": 0, "sdpMid": "0"}),
        ] {
            let text = json!({"type": "candidate", "ice": ice}).to_string();
            assert_eq!(parse(&text), Err(Discard::InvalidField("ice")), "{text}");
        }
    }

    #[test_timeout::timeout]
    fn media_line_index_must_fit_u16() {
        let candidate = |index: Value| {
            json!({
                "type": "candidate",
                "ice": {"candidate": "c", "sdpMLineIndex": index, "sdpMid": "0"}
            })
            .to_string()
        };
        assert!(parse(&candidate(json!(65535))).is_ok());
        assert_eq!(
            parse(&candidate(json!(65536))),
            Err(Discard::InvalidField("ice"))
        );
        assert_eq!(
            parse(&candidate(json!(-1))),
            Err(Discard::InvalidField("ice"))
        );
    }

    #[test_timeout::timeout]
    fn outbound_wire_shapes() {
        let accept = OutboundMessage::Accept { is_exist_user: true };
        assert_eq!(
            serde_json::to_value(&accept).unwrap(),
            json!({"type": "accept", "isExistUser": true})
        );
        assert_eq!(
            OutboundMessage::Ping.to_text().unwrap(),
            r#"{"type":"ping"}"#
        );
        let candidate = OutboundMessage::Candidate {
            ice: IceCandidate {
                candidate: "candidate:abc".into(),
                sdp_mline_index: 0,
                sdp_mid: "0".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            json!({
                "type": "candidate",
                "ice": {"candidate": "candidate:abc", "sdpMLineIndex": 0, "sdpMid": "0"}
            })
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::Answer { sdp: "v=0".into() }).unwrap(),
            json!({"type": "answer", "sdp": "v=0"})
        );
    }
}
