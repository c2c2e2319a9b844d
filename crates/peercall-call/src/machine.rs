//! Call state machine, the single authority on what state the call is in.
//!
//! ```text
//!            place_call                 answer received
//!   Idle ───────────────▶ Outgoing ─────────────────────┐
//!    │                                                   ▼
//!    │ offer received          accept + media      Negotiating ──connected──▶ Active
//!    └──────────────▶ Incoming ──────────────────────────▲
//!
//!   any non-idle ──hangup / disconnect / relay lost──▶ Ended
//!   any non-idle ──engine error / failed / deadline──▶ Failed
//!   Ended, Failed ──next call──▶ (Idle) ──▶ ...
//! ```
//!
//! The machine owns the only call, its negotiation session and the early
//! candidate buffer. Everything that can change them arrives through one of
//! its methods, called serially from the controller's dispatch loop.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use peercall_common::config::CallConfig;
use peercall_common::{CallError, CallResult, PolicyViolation};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::candidate::CandidateBuffer;
use crate::engine::{
    ConnectionState, EngineEvent, EngineEvents, EngineFactory, EngineStats, LocalTrack,
    RemoteTrack, SdpType, SessionDescription, TaggedEngineEvent,
};
use crate::media::{MediaReady, MediaSource};
use crate::session::NegotiationSession;
use crate::signaling::{self, SignalMessage};

const OUTBOUND_CAPACITY: usize = 64;
const MEDIA_CAPACITY: usize = 8;
const EVENT_CAPACITY: usize = 64;

/// Data channel the caller opens alongside its media.
pub const GREETING_CHANNEL: &str = "test";

/// Lifecycle state of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Negotiating,
    Active,
    Ended,
    Failed,
}

impl CallState {
    /// Terminal states behave like Idle for the next call.
    pub fn is_idle_like(self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    StatusChanged {
        state: CallState,
        remote: Option<String>,
        reason: Option<String>,
    },
    RemoteTrack {
        remote: String,
        track: RemoteTrack,
    },
    ChannelMessage {
        remote: String,
        label: String,
        text: String,
    },
}

/// Channels the machine produces into; the controller consumes them.
pub struct MachineIo {
    /// Messages for the relay, already addressed.
    pub outbound: mpsc::Receiver<SignalMessage>,
    pub engine_events: mpsc::UnboundedReceiver<TaggedEngineEvent>,
    pub media: mpsc::Receiver<MediaReady>,
}

pub struct CallMachine<F: EngineFactory, M: MediaSource> {
    local_id: String,
    state: CallState,
    remote_id: Option<String>,
    /// Remote of the call that ended last, reported with the terminal state.
    last_remote: Option<String>,
    session: Option<NegotiationSession<F::Engine>>,
    /// Offer received while Incoming, applied on accept.
    pending_offer: Option<SessionDescription>,
    accepting: bool,
    buffer: CandidateBuffer,
    early_candidate_window: Duration,
    /// Incremented per call; tags media completions and engine events.
    attempt: u64,
    deadline: Option<Instant>,
    negotiation_timeout: Option<Duration>,
    started_at: Option<DateTime<Utc>>,
    factory: F,
    media: M,
    outbound: mpsc::Sender<SignalMessage>,
    engine_tx: mpsc::UnboundedSender<TaggedEngineEvent>,
    media_tx: mpsc::Sender<MediaReady>,
    events: broadcast::Sender<CallEvent>,
}

impl<F: EngineFactory, M: MediaSource> CallMachine<F, M> {
    pub fn new(
        local_id: impl Into<String>,
        config: &CallConfig,
        factory: F,
        media: M,
    ) -> CallResult<(Self, MachineIo)> {
        let local_id = local_id.into();
        if local_id.trim().is_empty() {
            return Err(CallError::invalid_state("local identity must not be empty"));
        }

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::channel(MEDIA_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let machine = Self {
            local_id,
            state: CallState::Idle,
            remote_id: None,
            last_remote: None,
            session: None,
            pending_offer: None,
            accepting: false,
            buffer: CandidateBuffer::new(config.candidate_buffer_capacity),
            early_candidate_window: config.early_candidate_window(),
            attempt: 0,
            deadline: None,
            negotiation_timeout: config.negotiation_timeout(),
            started_at: None,
            factory,
            media,
            outbound,
            engine_tx,
            media_tx,
            events,
        };
        let io = MachineIo {
            outbound: outbound_rx,
            engine_events: engine_rx,
            media: media_rx,
        };
        Ok((machine, io))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.buffer.len()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// When the current attempt fails if it has not become active.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<CallEvent> {
        self.events.clone()
    }

    /// Returns the broken state/session rule, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        match self.state {
            CallState::Idle | CallState::Ended | CallState::Failed => {
                if self.session.is_some() {
                    return Some("session outlived the call");
                }
                if self.remote_id.is_some() {
                    return Some("remote set without a call");
                }
            }
            CallState::Negotiating | CallState::Active => {
                if self.session.is_none() {
                    return Some("negotiating without a session");
                }
                if !self.buffer.is_empty() {
                    return Some("candidates left buffered after session start");
                }
            }
            CallState::Outgoing | CallState::Incoming => {
                if self.remote_id.is_none() {
                    return Some("call without a remote");
                }
            }
        }
        None
    }

    fn set_state(&mut self, state: CallState, reason: Option<String>) {
        let previous = self.state;
        self.state = state;
        debug_assert_eq!(self.invariant_violation(), None, "after {previous} -> {state}");

        let remote = self.remote_id.clone().or_else(|| self.last_remote.clone());
        tracing::info!(
            call = self.attempt,
            from = %previous,
            to = %state,
            remote = ?remote,
            reason = ?reason,
            "Call state changed"
        );
        let _ = self.events.send(CallEvent::StatusChanged { state, remote, reason });
    }

    fn begin_attempt(&mut self, remote: &str) {
        self.attempt += 1;
        self.remote_id = Some(remote.to_string());
        self.last_remote = None;
        self.pending_offer = None;
        self.accepting = false;
        self.started_at = Some(Utc::now());
        self.deadline = self.negotiation_timeout.map(|t| Instant::now() + t);
    }

    // === Upper-layer requests ===

    /// Start an outgoing call. Media is acquired before the session is created.
    pub fn place_call(&mut self, target: &str) -> CallResult<()> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CallError::Policy(PolicyViolation::EmptyTarget));
        }
        if target == self.local_id {
            tracing::warn!(local = %self.local_id, "Refusing to call self");
            return Err(CallError::Policy(PolicyViolation::SelfCall));
        }
        if !self.state.is_idle_like() {
            return Err(CallError::invalid_state(format!(
                "cannot place a call while {}",
                self.state
            )));
        }

        // Nothing can answer an offer we have not sent yet.
        self.buffer.clear();
        self.begin_attempt(target);
        self.set_state(CallState::Outgoing, None);
        self.request_media();
        Ok(())
    }

    /// Accept the ringing call. Negotiation continues once media is ready.
    pub fn accept_incoming(&mut self) -> CallResult<()> {
        if self.state != CallState::Incoming {
            return Err(CallError::invalid_state(format!(
                "no incoming call to accept (state {})",
                self.state
            )));
        }
        if self.accepting {
            return Err(CallError::invalid_state("incoming call already being accepted"));
        }
        self.accepting = true;
        tracing::info!(call = self.attempt, remote = ?self.remote_id, "Accepting incoming call");
        self.request_media();
        Ok(())
    }

    pub async fn hangup(&mut self) -> CallResult<()> {
        if self.state.is_idle_like() {
            return Err(CallError::invalid_state("no call in progress"));
        }
        self.terminate(CallState::Ended, "hangup").await;
        Ok(())
    }

    pub async fn stats(&mut self) -> CallResult<EngineStats> {
        match self.session.as_mut() {
            Some(session) => session.stats().await,
            None => Err(CallError::invalid_state("no negotiation session")),
        }
    }

    // === Media ===

    fn request_media(&self) {
        let media = self.media.clone();
        let tx = self.media_tx.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = media.acquire().await;
            let _ = tx.send(MediaReady { attempt, result }).await;
        });
    }

    /// Media acquisition finished. The call may have moved on in the meantime.
    pub async fn on_media_ready(&mut self, ready: MediaReady) {
        let waiting = match self.state {
            CallState::Outgoing => self.session.is_none(),
            CallState::Incoming => self.accepting,
            _ => false,
        };
        if ready.attempt != self.attempt || !waiting {
            tracing::debug!(
                call = ready.attempt,
                current = self.attempt,
                state = %self.state,
                "Discarding media for a call that moved on"
            );
            return;
        }

        let tracks = match ready.result {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!(call = self.attempt, error = %e, "Local media unavailable");
                self.abandon(e.to_string());
                return;
            }
        };

        let outcome = match self.state {
            CallState::Outgoing => self.start_offer(tracks).await,
            _ => self.start_answer(tracks).await,
        };
        if let Err(e) = outcome {
            let state = if e.aborts_call() {
                tracing::error!(call = self.attempt, error = %e, "Negotiation failed");
                CallState::Failed
            } else {
                tracing::warn!(call = self.attempt, error = %e, "Negotiation interrupted");
                CallState::Ended
            };
            self.terminate(state, e.to_string()).await;
        }
    }

    async fn open_session(&mut self, tracks: &[LocalTrack]) -> CallResult<&mut NegotiationSession<F::Engine>> {
        let remote = self
            .remote_id
            .clone()
            .ok_or_else(|| CallError::invalid_state("no remote to negotiate with"))?;
        let events = EngineEvents::new(self.attempt, self.engine_tx.clone());
        let engine = self.factory.create(events).await?;
        let session = self
            .session
            .insert(NegotiationSession::new(engine, self.attempt, remote));
        session.add_local_tracks(tracks).await?;
        Ok(session)
    }

    async fn start_offer(&mut self, tracks: Vec<LocalTrack>) -> CallResult<()> {
        let session = self.open_session(&tracks).await?;
        session.open_channel(GREETING_CHANNEL).await?;
        let offer = session.create_local_offer().await?;
        session.set_local_description(offer.clone()).await?;

        let to = session.remote_id().to_string();
        let sdp = signaling::encode_description(&offer)?;
        self.send(SignalMessage::Call { from: self.local_id.clone(), to: to.clone(), sdp })
            .await?;
        tracing::info!(call = self.attempt, remote = %to, "Offer sent");
        Ok(())
    }

    async fn start_answer(&mut self, tracks: Vec<LocalTrack>) -> CallResult<()> {
        let offer = self
            .pending_offer
            .take()
            .ok_or_else(|| CallError::invalid_state("incoming call has no offer"))?;
        let session = self.open_session(&tracks).await?;
        session.set_remote_description(offer).await?;
        let answer = session.create_local_answer().await?;
        session.set_local_description(answer.clone()).await?;

        let to = session.remote_id().to_string();
        let sdp = signaling::encode_description(&answer)?;
        self.send(SignalMessage::Answer { from: self.local_id.clone(), to: to.clone(), sdp })
            .await?;
        tracing::info!(call = self.attempt, remote = %to, "Answer sent");

        self.flush_buffered().await;
        self.set_state(CallState::Negotiating, None);
        Ok(())
    }

    /// Apply the candidates that arrived before the remote description.
    async fn flush_buffered(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let pending = self.buffer.drain_from(session.remote_id());
        if pending.is_empty() {
            return;
        }
        tracing::debug!(call = self.attempt, count = pending.len(), "Applying buffered candidates");
        for raw in pending {
            session.add_remote_candidate(&raw).await;
        }
    }

    /// Queue a message for the relay without holding the machine across the await.
    fn send(&self, msg: SignalMessage) -> impl Future<Output = CallResult<()>> + Send {
        let outbound = self.outbound.clone();
        async move {
            outbound
                .send(msg)
                .await
                .map_err(|_| CallError::relay("relay link closed"))
        }
    }

    // === Relay input ===

    /// Decode and dispatch one relay text frame. Malformed frames never transition.
    pub async fn handle_frame(&mut self, text: &str) -> CallResult<()> {
        let msg = match signaling::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed relay message");
                return Err(e);
            }
        };
        self.handle_message(msg).await
    }

    pub async fn handle_message(&mut self, msg: SignalMessage) -> CallResult<()> {
        match msg {
            SignalMessage::Register { from } => {
                tracing::debug!(from = %from, "Ignoring register message from relay");
                Ok(())
            }
            SignalMessage::Call { from, sdp, .. } => self.on_offer(from, &sdp),
            SignalMessage::Answer { from, sdp, .. } => self.on_answer(from, &sdp).await,
            SignalMessage::Ice { from, candidate, .. } => {
                self.on_candidate(from, candidate).await;
                Ok(())
            }
        }
    }

    fn on_offer(&mut self, from: String, sdp: &str) -> CallResult<()> {
        if from == self.local_id {
            return Err(CallError::Policy(PolicyViolation::SelfCall));
        }
        if !self.state.is_idle_like() {
            tracing::info!(
                call = self.attempt,
                state = %self.state,
                from = %from,
                "Busy, rejecting incoming call"
            );
            return Err(CallError::Policy(PolicyViolation::Busy { from }));
        }
        let offer = signaling::decode_description(sdp, SdpType::Offer).inspect_err(|e| {
            tracing::warn!(from = %from, error = %e, "Discarding call with malformed offer");
        })?;

        self.buffer.expire(self.early_candidate_window);
        self.begin_attempt(&from);
        self.pending_offer = Some(offer);
        self.set_state(CallState::Incoming, None);
        Ok(())
    }

    async fn on_answer(&mut self, from: String, sdp: &str) -> CallResult<()> {
        if self.state != CallState::Outgoing || self.remote_id.as_deref() != Some(from.as_str()) {
            tracing::debug!(state = %self.state, from = %from, "Ignoring unexpected answer");
            return Err(CallError::invalid_state(format!(
                "unexpected answer from {from} while {}",
                self.state
            )));
        }
        let answer = signaling::decode_description(sdp, SdpType::Answer).inspect_err(|e| {
            tracing::warn!(from = %from, error = %e, "Discarding malformed answer");
        })?;

        let applied = match self.session.as_mut() {
            Some(session) if session.local_description().is_some() => {
                session.set_remote_description(answer).await
            }
            _ => {
                return Err(CallError::invalid_state("answer arrived before our offer"));
            }
        };
        if let Err(e) = applied {
            tracing::error!(call = self.attempt, error = %e, "Remote answer rejected");
            self.terminate(CallState::Failed, e.to_string()).await;
            return Err(e);
        }

        tracing::info!(call = self.attempt, remote = %from, "Answer received");
        self.flush_buffered().await;
        self.set_state(CallState::Negotiating, None);
        Ok(())
    }

    async fn on_candidate(&mut self, from: String, raw: String) {
        if self.state.is_idle_like() {
            // Could be a leftover of the call that just ended or the first
            // candidate of the next one. Leftovers age out before they are drained.
            tracing::debug!(
                from = %from,
                previous = self.last_remote.as_deref() == Some(from.as_str()),
                "Buffering candidate ahead of its call"
            );
            self.buffer.append(from, raw);
            return;
        }
        if self.remote_id.as_deref() != Some(from.as_str()) {
            tracing::debug!(from = %from, remote = ?self.remote_id, "Dropping candidate from outside the call");
            return;
        }
        match self.session.as_mut() {
            Some(session) if session.has_remote_description() => {
                session.add_remote_candidate(&raw).await;
            }
            _ => {
                tracing::debug!(call = self.attempt, from = %from, "Buffering early candidate");
                self.buffer.append(from, raw);
            }
        }
    }

    /// The relay connection is gone; the call cannot continue signaling.
    pub async fn relay_closed(&mut self) {
        if !self.state.is_idle_like() {
            self.terminate(CallState::Ended, "relay disconnected").await;
        }
    }

    // === Engine input ===

    pub async fn handle_engine_event(&mut self, tagged: TaggedEngineEvent) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.attempt() == tagged.attempt);
        if !current {
            tracing::debug!(call = tagged.attempt, event = ?tagged.event, "Dropping event from stale engine");
            return;
        }

        match tagged.event {
            EngineEvent::LocalCandidate(Some(candidate)) => {
                let Some(to) = self.remote_id.clone() else {
                    return;
                };
                let outcome = match signaling::encode_candidate(Some(&candidate)) {
                    Ok(encoded) => {
                        self.send(SignalMessage::Ice {
                            from: self.local_id.clone(),
                            to,
                            candidate: encoded,
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => tracing::debug!(call = self.attempt, "Sent local candidate"),
                    Err(e) => tracing::warn!(call = self.attempt, error = %e, "Failed to send local candidate"),
                }
            }
            EngineEvent::LocalCandidate(None) => {
                tracing::debug!(call = self.attempt, "Local candidate gathering complete");
            }
            EngineEvent::RemoteTrack(track) => {
                let remote = self.remote_id.clone().unwrap_or_default();
                tracing::info!(call = self.attempt, kind = ?track.kind, id = %track.id, "Remote track received");
                let _ = self.events.send(CallEvent::RemoteTrack { remote, track });
            }
            EngineEvent::ConnectionStateChanged(state) => self.on_connection_state(state).await,
            EngineEvent::ChannelOpen { label } => self.on_channel_open(label).await,
            EngineEvent::ChannelMessage { label, text } => {
                let remote = self.remote_id.clone().unwrap_or_default();
                tracing::info!(call = self.attempt, label = %label, text = %text, "Data channel message");
                let _ = self.events.send(CallEvent::ChannelMessage { remote, label, text });
            }
        }
    }

    /// Each side greets once the channel opens; the caller speaks first.
    async fn on_channel_open(&mut self, label: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let greeting = if session.is_offerer() {
            format!("Hello from {}", self.local_id)
        } else {
            format!("Hello back from {}", self.local_id)
        };
        match session.send_text(&label, &greeting).await {
            Ok(()) => tracing::debug!(call = self.attempt, label = %label, "Greeting sent"),
            Err(e) => tracing::warn!(call = self.attempt, label = %label, error = %e, "Greeting not sent"),
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        tracing::debug!(call = self.attempt, connection = ?state, "Transport connection state");
        match state {
            ConnectionState::Connected => {
                if self.state == CallState::Negotiating {
                    self.deadline = None;
                    self.set_state(CallState::Active, None);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {
                self.terminate(CallState::Ended, "transport disconnected").await;
            }
            ConnectionState::Failed => {
                self.terminate(CallState::Failed, "transport failed").await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// The negotiation deadline fired.
    pub async fn on_deadline(&mut self) {
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        if !expired {
            return;
        }
        self.deadline = None;
        if !self.state.is_idle_like() && self.state != CallState::Active {
            tracing::warn!(call = self.attempt, state = %self.state, "Negotiation deadline passed");
            self.terminate(CallState::Failed, "negotiation timed out").await;
        }
    }

    // === Teardown ===

    async fn terminate(&mut self, state: CallState, reason: impl Into<String>) {
        if let Some(mut session) = self.session.take() {
            tracing::debug!(
                call = self.attempt,
                applied = session.applied_candidates(),
                rejected = session.rejected_candidates(),
                "Remote candidates for this call"
            );
            session.close().await;
        }
        self.buffer.clear();
        self.last_remote = self.remote_id.take();
        self.pending_offer = None;
        self.accepting = false;
        self.deadline = None;
        if let Some(started) = self.started_at.take() {
            let secs = (Utc::now() - started).num_seconds();
            tracing::info!(call = self.attempt, remote = ?self.last_remote, duration_secs = secs, "Call finished");
        }
        self.set_state(state, Some(reason.into()));
    }

    /// Give up before any session exists.
    fn abandon(&mut self, reason: String) {
        self.buffer.clear();
        self.last_remote = self.remote_id.take();
        self.pending_offer = None;
        self.accepting = false;
        self.deadline = None;
        self.started_at = None;
        self.set_state(CallState::Idle, Some(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaKind;
    use crate::testing::{
        answer_json, candidate_json, candidate_line, offer_json, EngineOp, ScriptedFactory,
        ScriptedMedia,
    };

    type Machine = CallMachine<ScriptedFactory, ScriptedMedia>;

    fn machine(local: &str) -> (Machine, MachineIo, ScriptedFactory) {
        machine_with(local, true)
    }

    fn machine_with(local: &str, media: bool) -> (Machine, MachineIo, ScriptedFactory) {
        let factory = ScriptedFactory::default();
        let (m, io) = CallMachine::new(
            local,
            &CallConfig::default(),
            factory.clone(),
            ScriptedMedia { available: media },
        )
        .unwrap();
        (m, io, factory)
    }

    fn assert_invariants(m: &Machine) {
        assert_eq!(m.invariant_violation(), None, "state {}", m.state());
    }

    async fn settle_media(m: &mut Machine, io: &mut MachineIo) {
        let ready = io.media.recv().await.unwrap();
        m.on_media_ready(ready).await;
        assert_invariants(m);
    }

    fn ice(from: &str, to: &str, tag: &str) -> SignalMessage {
        SignalMessage::Ice { from: from.into(), to: to.into(), candidate: candidate_json(tag) }
    }

    fn call(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Call { from: from.into(), to: to.into(), sdp: offer_json() }
    }

    fn answer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Answer { from: from.into(), to: to.into(), sdp: answer_json() }
    }

    /// alice calls bob and bob's answer has been applied.
    async fn negotiating_alice() -> (Machine, MachineIo, ScriptedFactory) {
        let (mut m, mut io, factory) = machine("alice");
        m.place_call("bob").unwrap();
        settle_media(&mut m, &mut io).await;
        let _offer = io.outbound.recv().await.unwrap();
        m.handle_message(answer("bob", "alice")).await.unwrap();
        assert_eq!(m.state(), CallState::Negotiating);
        (m, io, factory)
    }

    #[tokio::test]
    async fn outgoing_call_reaches_active() {
        let (mut m, mut io, factory) = machine("alice");
        let mut events = m.subscribe();

        m.place_call("bob").unwrap();
        assert_eq!(m.state(), CallState::Outgoing);
        assert!(!m.has_session());
        settle_media(&mut m, &mut io).await;
        assert!(m.has_session());

        let offer = io.outbound.recv().await.unwrap();
        let SignalMessage::Call { from, to, sdp } = offer else {
            panic!("expected call message, got {offer:?}");
        };
        assert_eq!((from.as_str(), to.as_str()), ("alice", "bob"));
        assert_eq!(
            signaling::decode_description(&sdp, SdpType::Offer).unwrap().sdp,
            "v=0 offer"
        );

        m.handle_message(answer("bob", "alice")).await.unwrap();
        assert_eq!(m.state(), CallState::Negotiating);
        assert_invariants(&m);

        factory.emit(m.attempt(), EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        let ev = io.engine_events.recv().await.unwrap();
        m.handle_engine_event(ev).await;
        assert_eq!(m.state(), CallState::Active);
        assert_eq!(m.deadline(), None);
        assert_invariants(&m);

        assert_eq!(
            factory.ops(),
            vec![
                EngineOp::Create(1),
                EngineOp::AddTracks(1),
                EngineOp::OpenChannel(GREETING_CHANNEL.into()),
                EngineOp::CreateOffer,
                EngineOp::SetLocal(SdpType::Offer),
                EngineOp::SetRemote(SdpType::Answer),
            ]
        );

        let states: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                CallEvent::StatusChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![CallState::Outgoing, CallState::Negotiating, CallState::Active]
        );
    }

    #[tokio::test]
    async fn self_call_is_rejected_without_session() {
        let (mut m, io, factory) = machine("alice");
        let err = m.place_call("alice").unwrap_err();
        assert_eq!(err.error_code(), "SELF_CALL");
        assert_eq!(m.state(), CallState::Idle);
        assert_eq!(factory.created(), 0);
        drop(io);

        let err = m.place_call("  ").unwrap_err();
        assert_eq!(err.error_code(), "EMPTY_TARGET");
    }

    #[tokio::test]
    async fn second_offer_while_busy_is_rejected() {
        let (mut m, _io, factory) = negotiating_alice().await;
        let err = m.handle_message(call("carol", "alice")).await.unwrap_err();
        assert_eq!(err.error_code(), "BUSY");
        assert_eq!(m.state(), CallState::Negotiating);
        assert_eq!(m.remote_id(), Some("bob"));
        assert_eq!(factory.created(), 1);
        assert_invariants(&m);
    }

    #[tokio::test]
    async fn early_candidate_is_applied_before_later_ones() {
        let (mut m, mut io, factory) = machine("bob");

        m.handle_message(ice("alice", "bob", "early")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 1);

        m.handle_message(call("alice", "bob")).await.unwrap();
        assert_eq!(m.state(), CallState::Incoming);
        assert!(!m.has_session());

        m.handle_message(ice("alice", "bob", "ringing")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 2);

        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;
        assert_eq!(m.state(), CallState::Negotiating);
        assert_eq!(m.buffered_candidates(), 0);

        let reply = io.outbound.recv().await.unwrap();
        assert!(matches!(reply, SignalMessage::Answer { ref to, .. } if to == "alice"));

        m.handle_message(ice("alice", "bob", "late")).await.unwrap();
        assert_eq!(
            factory.applied_candidates(),
            vec![candidate_line("early"), candidate_line("ringing"), candidate_line("late")]
        );
        assert_invariants(&m);
    }

    #[tokio::test]
    async fn candidates_wait_for_the_answer_on_the_calling_side() {
        let (mut m, mut io, factory) = machine("alice");
        m.place_call("bob").unwrap();
        settle_media(&mut m, &mut io).await;
        m.handle_message(ice("bob", "alice", "b1")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 1);
        assert!(factory.applied_candidates().is_empty());

        m.handle_message(answer("bob", "alice")).await.unwrap();
        assert_eq!(factory.applied_candidates(), vec![candidate_line("b1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_during_negotiation_drops_stray_candidates() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        m.hangup().await.unwrap();

        assert_eq!(m.state(), CallState::Ended);
        assert!(!m.has_session());
        assert_eq!(m.buffered_candidates(), 0);
        assert!(factory.ops().contains(&EngineOp::Close));
        assert_invariants(&m);

        m.handle_message(ice("bob", "alice", "stray")).await.unwrap();
        assert_eq!(m.state(), CallState::Ended);
        assert!(factory.applied_candidates().is_empty());

        // bob calls back much later; the leftover must not reach the new session.
        tokio::time::advance(Duration::from_secs(6)).await;
        m.handle_message(call("bob", "alice")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 0);
        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;
        assert_eq!(m.state(), CallState::Negotiating);
        assert!(factory.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn redial_from_previous_remote_keeps_its_early_candidates() {
        let (mut m, mut io, factory) = machine("alice");
        m.handle_message(call("bob", "alice")).await.unwrap();
        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;
        m.hangup().await.unwrap();

        m.handle_message(ice("bob", "alice", "newcall")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 1);
        m.handle_message(call("bob", "alice")).await.unwrap();
        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;

        assert_eq!(m.state(), CallState::Negotiating);
        assert_eq!(factory.applied_candidates(), vec![candidate_line("newcall")]);
        assert_invariants(&m);
    }

    #[tokio::test]
    async fn placing_a_call_discards_older_candidates() {
        let (mut m, mut io, factory) = machine("alice");
        m.handle_message(ice("bob", "alice", "old")).await.unwrap();
        m.place_call("bob").unwrap();
        assert_eq!(m.buffered_candidates(), 0);
        settle_media(&mut m, &mut io).await;
        m.handle_message(answer("bob", "alice")).await.unwrap();
        assert!(factory.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn hangup_while_media_pending_discards_completion() {
        let (mut m, mut io, factory) = machine("alice");
        m.place_call("bob").unwrap();
        m.hangup().await.unwrap();
        assert_eq!(m.state(), CallState::Ended);

        settle_media(&mut m, &mut io).await;
        assert_eq!(factory.created(), 0);
        assert_eq!(m.state(), CallState::Ended);
        assert!(io.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn media_failure_returns_to_idle() {
        let (mut m, mut io, factory) = machine_with("alice", false);
        m.place_call("bob").unwrap();
        settle_media(&mut m, &mut io).await;
        assert_eq!(m.state(), CallState::Idle);
        assert_eq!(factory.created(), 0);
        assert_eq!(m.remote_id(), None);
    }

    #[tokio::test]
    async fn media_failure_discards_buffered_candidates() {
        let (mut m, mut io, factory) = machine_with("alice", false);
        m.handle_message(call("bob", "alice")).await.unwrap();
        m.handle_message(ice("bob", "alice", "oldcall")).await.unwrap();
        assert_eq!(m.buffered_candidates(), 1);

        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;
        assert_eq!(m.state(), CallState::Idle);
        assert_eq!(m.buffered_candidates(), 0);
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn lost_relay_link_ends_rather_than_fails() {
        let (mut m, io, factory) = machine("alice");
        let MachineIo { outbound, mut media, .. } = io;
        drop(outbound);

        m.place_call("bob").unwrap();
        let ready = media.recv().await.unwrap();
        m.on_media_ready(ready).await;
        assert_eq!(m.state(), CallState::Ended);
        assert!(!m.has_session());
        assert!(factory.ops().contains(&EngineOp::Close));
    }

    #[tokio::test]
    async fn engine_failure_moves_to_failed() {
        let (mut m, mut io, factory) = machine("alice");
        factory.fail_offers();
        m.place_call("bob").unwrap();
        settle_media(&mut m, &mut io).await;
        assert_eq!(m.state(), CallState::Failed);
        assert!(!m.has_session());
        assert!(factory.ops().contains(&EngineOp::Close));

        m.place_call("bob").unwrap();
        assert_eq!(m.state(), CallState::Outgoing);
    }

    #[tokio::test]
    async fn malformed_frames_never_transition() {
        let (mut m, _io, _factory) = machine("bob");
        assert!(m.handle_frame("{").await.is_err());
        assert!(m.handle_frame(r#"{"type":"call","from":"alice"}"#).await.is_err());
        let bad_offer = serde_json::json!({
            "type": "call", "from": "alice", "to": "bob",
            "sdp": r#"{"type":"answer","sdp":"v=0"}"#,
        });
        assert!(m.handle_frame(&bad_offer.to_string()).await.is_err());
        assert_eq!(m.state(), CallState::Idle);
        assert_eq!(m.attempt(), 0);
    }

    #[tokio::test]
    async fn accept_without_incoming_call_is_invalid() {
        let (mut m, _io, _factory) = machine("bob");
        assert_eq!(m.accept_incoming().unwrap_err().error_code(), "INVALID_STATE");
        assert_eq!(m.hangup().await.unwrap_err().error_code(), "INVALID_STATE");
        assert_eq!(m.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn unexpected_answer_is_ignored() {
        let (mut m, _io, _factory) = machine("alice");
        let err = m.handle_message(answer("bob", "alice")).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
        assert_eq!(m.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn local_candidates_are_relayed_to_the_remote() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        let candidate = crate::engine::IceCandidate::new(candidate_line("local"));
        factory.emit(m.attempt(), EngineEvent::LocalCandidate(Some(candidate.clone())));
        let ev = io.engine_events.recv().await.unwrap();
        m.handle_engine_event(ev).await;

        let sent = io.outbound.recv().await.unwrap();
        let SignalMessage::Ice { from, to, candidate: raw } = sent else {
            panic!("expected ice, got {sent:?}");
        };
        assert_eq!((from.as_str(), to.as_str()), ("alice", "bob"));
        assert_eq!(signaling::decode_candidate(&raw).unwrap(), Some(candidate));
    }

    #[tokio::test]
    async fn stale_engine_events_are_ignored() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        let old = m.attempt();
        m.hangup().await.unwrap();
        factory.emit(old, EngineEvent::ConnectionStateChanged(ConnectionState::Connected));
        let ev = io.engine_events.recv().await.unwrap();
        m.handle_engine_event(ev).await;
        assert_eq!(m.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn remote_tracks_are_announced() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        let mut events = m.subscribe();
        let track = RemoteTrack { id: "1".into(), kind: MediaKind::Video };
        factory.emit(m.attempt(), EngineEvent::RemoteTrack(track.clone()));
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::RemoteTrack { remote: "bob".into(), track }
        );
    }

    #[tokio::test]
    async fn caller_greets_and_callee_answers_on_the_data_channel() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        let mut events = m.subscribe();
        factory.emit(m.attempt(), EngineEvent::ChannelOpen { label: GREETING_CHANNEL.into() });
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(factory.sent_texts(), vec!["Hello from alice".to_string()]);

        let reply = EngineEvent::ChannelMessage {
            label: GREETING_CHANNEL.into(),
            text: "Hello back from bob".into(),
        };
        factory.emit(m.attempt(), reply);
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::ChannelMessage {
                remote: "bob".into(),
                label: GREETING_CHANNEL.into(),
                text: "Hello back from bob".into(),
            }
        );

        let (mut m, mut io, factory) = machine("bob");
        m.handle_message(call("alice", "bob")).await.unwrap();
        m.accept_incoming().unwrap();
        settle_media(&mut m, &mut io).await;
        factory.emit(m.attempt(), EngineEvent::ChannelOpen { label: GREETING_CHANNEL.into() });
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(factory.sent_texts(), vec!["Hello back from bob".to_string()]);
        assert!(!factory.ops().iter().any(|op| matches!(op, EngineOp::OpenChannel(_))));
    }

    #[tokio::test]
    async fn transport_loss_ends_and_failure_fails() {
        let (mut m, mut io, factory) = negotiating_alice().await;
        factory.emit(m.attempt(), EngineEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(m.state(), CallState::Ended);

        let (mut m, mut io, factory) = negotiating_alice().await;
        factory.emit(m.attempt(), EngineEvent::ConnectionStateChanged(ConnectionState::Failed));
        m.handle_engine_event(io.engine_events.recv().await.unwrap()).await;
        assert_eq!(m.state(), CallState::Failed);
        assert_invariants(&m);
    }

    #[tokio::test]
    async fn relay_loss_ends_the_call() {
        let (mut m, _io, _factory) = negotiating_alice().await;
        m.relay_closed().await;
        assert_eq!(m.state(), CallState::Ended);
        assert_invariants(&m);
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_deadline_fails_the_call() {
        let (mut m, _io, _factory) = negotiating_alice().await;
        m.on_deadline().await;
        assert_eq!(m.state(), CallState::Negotiating);

        tokio::time::advance(Duration::from_secs(31)).await;
        m.on_deadline().await;
        assert_eq!(m.state(), CallState::Failed);
        assert!(!m.has_session());
    }

    #[tokio::test]
    async fn ended_call_can_be_followed_by_a_new_incoming_one() {
        let (mut m, _io, _factory) = negotiating_alice().await;
        m.hangup().await.unwrap();
        m.handle_message(call("carol", "alice")).await.unwrap();
        assert_eq!(m.state(), CallState::Incoming);
        assert_eq!(m.remote_id(), Some("carol"));
        assert_invariants(&m);
    }
}
