//! Call signaling: the four message shapes exchanged over the relay.
//!
//! The relay carries JSON text frames:
//! - `register`: bind an endpoint identity to the connection
//! - `call`: SDP offer from caller to callee
//! - `answer`: SDP answer from callee to caller
//! - `ice`: one network-path candidate (or end-of-candidates)
//!
//! Descriptions and candidates travel as nested JSON strings, in the same
//! shape a browser produces with `JSON.stringify(description)`. Decoding
//! validates the envelope here; a failure never reaches the state machine.

use peercall_common::{CallError, CallResult};
use serde::{Deserialize, Serialize};

use crate::engine::{IceCandidate, SdpType, SessionDescription};

/// Longest accepted endpoint identity.
pub const MAX_ID_BYTES: usize = 128;
/// Longest accepted encoded description.
pub const MAX_SDP_BYTES: usize = 32 * 1024;
/// Longest accepted encoded candidate.
pub const MAX_CANDIDATE_BYTES: usize = 4096;

/// Signaling messages exchanged between two endpoints through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Endpoint → Relay: bind `from` to this connection.
    Register { from: String },

    /// Caller → Callee: encoded offer description.
    Call { from: String, to: String, sdp: String },

    /// Callee → Caller: encoded answer description.
    Answer { from: String, to: String, sdp: String },

    /// Bidirectional: encoded candidate. Empty means end-of-candidates.
    Ice {
        from: String,
        to: String,
        #[serde(default)]
        candidate: String,
    },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Call { .. } => "call",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
        }
    }

    pub fn from(&self) -> &str {
        match self {
            Self::Register { from }
            | Self::Call { from, .. }
            | Self::Answer { from, .. }
            | Self::Ice { from, .. } => from,
        }
    }

    /// Addressee, absent for `register`.
    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Register { .. } => None,
            Self::Call { to, .. } | Self::Answer { to, .. } | Self::Ice { to, .. } => Some(to),
        }
    }

    fn validate(&self) -> CallResult<()> {
        validate_id("from", self.from())?;
        if let Some(to) = self.to() {
            validate_id("to", to)?;
        }
        match self {
            Self::Call { sdp, .. } | Self::Answer { sdp, .. } => {
                if sdp.trim().is_empty() {
                    return Err(CallError::malformed(format!("{} without sdp", self.kind())));
                }
                if sdp.len() > MAX_SDP_BYTES {
                    return Err(CallError::malformed(format!(
                        "sdp exceeds {MAX_SDP_BYTES} bytes"
                    )));
                }
            }
            Self::Ice { candidate, .. } if candidate.len() > MAX_CANDIDATE_BYTES => {
                return Err(CallError::malformed(format!(
                    "candidate exceeds {MAX_CANDIDATE_BYTES} bytes"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_id(field: &str, id: &str) -> CallResult<()> {
    if id.trim().is_empty() {
        return Err(CallError::malformed(format!("empty `{field}`")));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(CallError::malformed(format!(
            "`{field}` exceeds {MAX_ID_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Decode and validate one relay text frame.
pub fn decode(text: &str) -> CallResult<SignalMessage> {
    let msg: SignalMessage = serde_json::from_str(text)?;
    msg.validate()?;
    Ok(msg)
}

/// Encode a message into a relay text frame.
pub fn encode(msg: &SignalMessage) -> CallResult<String> {
    msg.validate()?;
    Ok(serde_json::to_string(msg)?)
}

/// Encode a description for the `sdp` field.
pub fn encode_description(desc: &SessionDescription) -> CallResult<String> {
    Ok(serde_json::to_string(desc)?)
}

/// Decode the `sdp` field, requiring the given description type.
pub fn decode_description(raw: &str, expected: SdpType) -> CallResult<SessionDescription> {
    let desc: SessionDescription = serde_json::from_str(raw)?;
    if desc.kind != expected {
        return Err(CallError::malformed(format!(
            "expected {expected} description, got {}",
            desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(CallError::malformed("description without sdp body"));
    }
    Ok(desc)
}

/// Encode a local candidate for the `candidate` field. `None` is end-of-candidates.
pub fn encode_candidate(candidate: Option<&IceCandidate>) -> CallResult<String> {
    match candidate {
        Some(c) => Ok(serde_json::to_string(c)?),
        None => Ok(String::new()),
    }
}

/// Decode the `candidate` field. `Ok(None)` is end-of-candidates.
pub fn decode_candidate(raw: &str) -> CallResult<Option<IceCandidate>> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "null" {
        return Ok(None);
    }
    let candidate: IceCandidate = serde_json::from_str(raw)?;
    if candidate.is_end_of_candidates() {
        return Ok(None);
    }
    Ok(Some(candidate))
}
