//! JSON wire format for signaling messages
//!
//! Each message is one JSON object tagged by `type`:
//!
//! ```text
//! {"type":"find_partner"}
//! {"type":"partner_found","roomId":"r1","role":"initiator"}
//! {"type":"offer","roomId":"r1","sdp":"v=0..."}
//! {"type":"answer","roomId":"r1","sdp":"v=0..."}
//! {"type":"ice_candidate","roomId":"r1","candidate":{"candidate":"candidate:1 ...","sdpMid":"0","sdpMLineIndex":0}}
//! {"type":"hangup","roomId":"r1"}
//! ```
//!
//! Transport connect/disconnect notices never cross the wire.

use crate::error::{CallError, CallResult};
use crate::signaling::SignalingMessage;

/// Encode a message for the signaling channel
pub fn encode(message: &SignalingMessage) -> CallResult<String> {
    if message.is_local_only() {
        return Err(CallError::invalid_state(format!(
            "{} is a local transport notice and cannot be sent",
            message.kind()
        )));
    }
    Ok(serde_json::to_string(message)?)
}

/// Decode a message received from the signaling channel
pub fn decode(text: &str) -> CallResult<SignalingMessage> {
    Ok(serde_json::from_str(text)?)
}
