use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "10";
pub const API_ENCODING: &str = "json";

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Close codes the server uses when it drops the session. Codes only ever sent
// by clients (encoding errors and the like) are not included.
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const CLOSE_INVALID_SEQUENCE: u16 = 4007;
pub const CLOSE_RATE_LIMITED: u16 = 4008;
pub const CLOSE_TIMED_OUT: u16 = 4009;

pub const EVENT_READY: &str = "READY";

/// The wire envelope, the sole unit of exchange on the socket in both
/// directions. `s` and `t` are only present on dispatch frames; `d` encodes
/// as `null` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: Option<Value>) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// Sent by the server as the first frame of every connection. Not a dispatch
/// event, it rides opcode 10 with no event name.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

#[derive(Debug, Serialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: ConnectionProperties,
    pub intents: u64,
}

#[derive(Debug, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: i64,
}

/// Dispatched by the server once a fresh identify succeeds. The engine
/// consumes the session id and resume url so later attempts can resume.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub resume_gateway_url: String,
}

/// What the next connect attempt should do after the socket closed with the
/// given close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// The session is still good server-side, resume it.
    Resume,
    /// Session continuity cannot be trusted, identify from scratch.
    Fresh,
    /// Reconnecting cannot succeed, surface the close to the caller.
    Fatal,
}

/// Classifies a close code into the reconnect policy for the next attempt. A
/// RECONNECT opcode or a parsed INVALID_SESSION payload overrides this with
/// its own explicit signal; unrecognized codes fall back to a fresh identify.
pub fn classify_close(code: u16) -> ClosePolicy {
    match code {
        CLOSE_UNKNOWN_ERROR | CLOSE_RATE_LIMITED | CLOSE_TIMED_OUT => ClosePolicy::Resume,
        CLOSE_AUTHENTICATION_FAILED => ClosePolicy::Fatal,
        _ => ClosePolicy::Fresh,
    }
}

/// Appends the version and encoding query parameters to a bare websocket URL
/// handed out by the backend.
pub fn with_protocol_params(url: &str) -> String {
    format!("{url}/?v={API_VERSION}&encoding={API_ENCODING}")
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        classify_close, ClosePolicy, ConnectionProperties, GatewayPayload, HelloPayload,
        IdentifyPayload, CLOSE_AUTHENTICATION_FAILED, CLOSE_INVALID_SEQUENCE,
        CLOSE_NOT_AUTHENTICATED, CLOSE_RATE_LIMITED, CLOSE_TIMED_OUT, CLOSE_UNKNOWN_ERROR,
        OP_DISPATCH, OP_HEARTBEAT,
    };

    #[test]
    fn dispatch_frames_round_trip_sequence_and_event_name() {
        let raw = r#"{"op":0,"d":{"content":"hi"},"s":42,"t":"MESSAGE_CREATE"}"#;
        let payload: GatewayPayload = serde_json::from_str(raw).expect("parse");
        assert_eq!(payload.op, OP_DISPATCH);
        assert_eq!(payload.s, Some(42));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
        assert_eq!(
            payload.d.as_ref().and_then(|d| d.get("content")).cloned(),
            Some(json!("hi"))
        );
    }

    #[test]
    fn non_dispatch_frames_omit_sequence_and_event_name() {
        let heartbeat = GatewayPayload::new(OP_HEARTBEAT, Some(json!(7)));
        let encoded = serde_json::to_value(&heartbeat).expect("encode");
        assert_eq!(encoded, json!({"op": 1, "d": 7}));

        let bare = GatewayPayload::new(OP_HEARTBEAT, None);
        let encoded = serde_json::to_value(&bare).expect("encode");
        assert_eq!(encoded, json!({"op": 1, "d": Value::Null}));
    }

    #[test]
    fn hello_and_identify_payload_shapes() {
        let hello: HelloPayload =
            serde_json::from_str(r#"{"heartbeat_interval":41250}"#).expect("parse");
        assert_eq!(hello.heartbeat_interval, 41_250);

        let identify = IdentifyPayload {
            token: "abc".to_owned(),
            properties: ConnectionProperties {
                os: "linux".to_owned(),
                browser: "bot".to_owned(),
                device: "bot".to_owned(),
            },
            intents: 513,
        };
        let encoded = serde_json::to_value(&identify).expect("encode");
        assert_eq!(encoded.pointer("/properties/browser"), Some(&json!("bot")));
        assert_eq!(encoded.get("intents"), Some(&json!(513)));
    }

    #[test]
    fn close_codes_classify_into_reconnect_policy() {
        assert_eq!(classify_close(CLOSE_UNKNOWN_ERROR), ClosePolicy::Resume);
        assert_eq!(classify_close(CLOSE_RATE_LIMITED), ClosePolicy::Resume);
        assert_eq!(classify_close(CLOSE_TIMED_OUT), ClosePolicy::Resume);
        assert_eq!(classify_close(CLOSE_NOT_AUTHENTICATED), ClosePolicy::Fresh);
        assert_eq!(classify_close(CLOSE_INVALID_SEQUENCE), ClosePolicy::Fresh);
        assert_eq!(
            classify_close(CLOSE_AUTHENTICATION_FAILED),
            ClosePolicy::Fatal
        );
        // Anything unrecognized starts a new session rather than trusting the
        // old one.
        assert_eq!(classify_close(1000), ClosePolicy::Fresh);
        assert_eq!(classify_close(4013), ClosePolicy::Fresh);
    }

    #[test]
    fn protocol_params_are_appended_to_bare_urls() {
        assert_eq!(
            super::with_protocol_params("wss://gw.example"),
            "wss://gw.example/?v=10&encoding=json"
        );
    }
}
