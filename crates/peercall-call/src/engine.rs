//! Transport engine contract, the capability object a negotiation session wraps.
//!
//! The engine does the real work (ICE, DTLS, SRTP, SDP); this crate only
//! drives it. Engine notifications are not callbacks: every engine pushes
//! [`EngineEvent`]s into one channel, tagged with the call attempt that owns
//! the engine, and the call controller consumes them from its dispatch loop.

use std::fmt;
use std::future::Future;

use peercall_common::CallResult;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

/// A session description as carried in the `sdp` field of call/answer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// One network-path candidate, in browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate bound to the first media section.
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// An empty candidate line is how browsers spell end-of-candidates.
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

/// What a media track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Outbound media attached to a session before offer/answer creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Inbound media announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Transport connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications pushed by a transport engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local candidate was discovered. `None` marks gathering complete.
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
    ConnectionStateChanged(ConnectionState),
    /// A data channel is open in both directions.
    ChannelOpen { label: String },
    /// Text received on an open data channel.
    ChannelMessage { label: String, text: String },
}

/// An engine event stamped with the call attempt whose engine produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEngineEvent {
    pub attempt: u64,
    pub event: EngineEvent,
}

/// Sending half handed to an engine when it is created.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    attempt: u64,
    tx: mpsc::UnboundedSender<TaggedEngineEvent>,
}

impl EngineEvents {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<TaggedEngineEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Push an event. Returns false once the controller has gone away.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(TaggedEngineEvent { attempt: self.attempt, event })
            .is_ok()
    }
}

/// Connection statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub connection_state: Option<ConnectionState>,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Negotiation primitives of a transport-engine connection.
///
/// One engine instance serves exactly one call attempt.
pub trait TransportEngine: Send + Sync + 'static {
    fn add_local_tracks(&mut self, tracks: &[LocalTrack])
    -> impl Future<Output = CallResult<()>> + Send;

    /// Declare a data channel. Must happen before the offer is created.
    fn open_channel(&mut self, label: &str) -> impl Future<Output = CallResult<()>> + Send;

    fn create_offer(&mut self) -> impl Future<Output = CallResult<SessionDescription>> + Send;

    fn create_answer(&mut self) -> impl Future<Output = CallResult<SessionDescription>> + Send;

    fn set_local_description(
        &mut self,
        desc: &SessionDescription,
    ) -> impl Future<Output = CallResult<()>> + Send;

    fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> impl Future<Output = CallResult<()>> + Send;

    /// `None` signals end-of-candidates.
    fn add_remote_candidate(
        &mut self,
        candidate: Option<&IceCandidate>,
    ) -> impl Future<Output = CallResult<()>> + Send;

    /// Send text on a data channel that has reported [`EngineEvent::ChannelOpen`].
    fn send_text(&mut self, label: &str, text: &str)
    -> impl Future<Output = CallResult<()>> + Send;

    fn stats(&mut self) -> impl Future<Output = CallResult<EngineStats>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Creates one engine per call attempt.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: TransportEngine;

    fn create(&self, events: EngineEvents)
    -> impl Future<Output = CallResult<Self::Engine>> + Send;
}
