use serde::{Deserialize, Serialize};

/// Signaling messages exchanged with a browser client over the WebSocket.
///
/// The wire format is a JSON object tagged by `type`. Browsers are not
/// consistent about candidate field spelling, so the camelCase variants are
/// accepted as aliases on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// WebRTC SDP offer from the client
    Offer { sdp: String },
    /// WebRTC SDP answer from the server
    Answer { sdp: String },
    /// Trickle ICE candidate (candidate = None signals end-of-candidates)
    IceCandidate {
        #[serde(default)]
        candidate: Option<String>,
        #[serde(default, alias = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            default,
            alias = "sdpMLineIndex",
            skip_serializing_if = "Option::is_none"
        )]
        sdp_m_line_index: Option<u16>,
    },
    /// Client session termination signal
    Bye,
    /// Heartbeat ping from the client
    Ping,
    /// Heartbeat pong response from the server
    Pong,
}
