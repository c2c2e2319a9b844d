//! Negotiation session: one transport-engine connection for one call attempt.
//!
//! The session owns the engine and enforces the ordering rules the engine
//! itself only half-enforces: tracks before offer/answer, remote offer before
//! answer, remote description before candidates. It knows nothing about the
//! relay wire format.

use peercall_common::{CallError, CallResult};

use crate::engine::{
    EngineStats, IceCandidate, LocalTrack, SdpType, SessionDescription, TransportEngine,
};
use crate::signaling;

/// Negotiation state of a single call attempt.
pub struct NegotiationSession<E: TransportEngine> {
    engine: E,
    attempt: u64,
    remote_id: String,
    tracks: Vec<LocalTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: usize,
    rejected_candidates: usize,
    closed: bool,
}

impl<E: TransportEngine> NegotiationSession<E> {
    pub fn new(engine: E, attempt: u64, remote_id: impl Into<String>) -> Self {
        Self {
            engine,
            attempt,
            remote_id: remote_id.into(),
            tracks: Vec::new(),
            local: None,
            remote: None,
            applied_candidates: 0,
            rejected_candidates: 0,
            closed: false,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Whether remote candidates can be applied yet.
    pub fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local.as_ref()
    }

    /// Whether this side produced the offer.
    pub fn is_offerer(&self) -> bool {
        self.local.as_ref().is_some_and(|d| d.kind == SdpType::Offer)
    }

    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    pub fn rejected_candidates(&self) -> usize {
        self.rejected_candidates
    }

    fn ensure_open(&self) -> CallResult<()> {
        if self.closed {
            return Err(CallError::invalid_state("negotiation session is closed"));
        }
        Ok(())
    }

    /// Attach outbound media. Must happen before the description is generated.
    pub async fn add_local_tracks(&mut self, tracks: &[LocalTrack]) -> CallResult<()> {
        self.ensure_open()?;
        if self.local.is_some() {
            return Err(CallError::invalid_state(
                "tracks must be attached before the local description",
            ));
        }
        self.engine.add_local_tracks(tracks).await?;
        self.tracks.extend_from_slice(tracks);
        tracing::debug!(
            attempt = self.attempt,
            remote = %self.remote_id,
            tracks = tracks.len(),
            "Attached local tracks"
        );
        Ok(())
    }

    /// Declare a data channel to be carried by the offer.
    pub async fn open_channel(&mut self, label: &str) -> CallResult<()> {
        self.ensure_open()?;
        if self.local.is_some() {
            return Err(CallError::invalid_state(
                "channels must be declared before the local description",
            ));
        }
        self.engine.open_channel(label).await
    }

    pub async fn send_text(&mut self, label: &str, text: &str) -> CallResult<()> {
        self.ensure_open()?;
        self.engine.send_text(label, text).await
    }

    pub async fn create_local_offer(&mut self) -> CallResult<SessionDescription> {
        self.ensure_open()?;
        let offer = self.engine.create_offer().await?;
        if offer.kind != SdpType::Offer {
            return Err(CallError::engine("engine produced an answer when asked for an offer"));
        }
        Ok(offer)
    }

    /// Only valid once a remote offer has been applied.
    pub async fn create_local_answer(&mut self) -> CallResult<SessionDescription> {
        self.ensure_open()?;
        match self.remote.as_ref().map(|d| d.kind) {
            Some(SdpType::Offer) => {}
            Some(SdpType::Answer) => {
                return Err(CallError::invalid_state("remote description is an answer"));
            }
            None => {
                return Err(CallError::invalid_state("no remote offer applied"));
            }
        }
        let answer = self.engine.create_answer().await?;
        if answer.kind != SdpType::Answer {
            return Err(CallError::engine("engine produced an offer when asked for an answer"));
        }
        Ok(answer)
    }

    pub async fn set_local_description(&mut self, desc: SessionDescription) -> CallResult<()> {
        self.ensure_open()?;
        self.engine.set_local_description(&desc).await?;
        self.local = Some(desc);
        Ok(())
    }

    pub async fn set_remote_description(&mut self, desc: SessionDescription) -> CallResult<()> {
        self.ensure_open()?;
        if self.remote.is_some() {
            return Err(CallError::invalid_state("remote description already applied"));
        }
        self.engine.set_remote_description(&desc).await?;
        tracing::debug!(
            attempt = self.attempt,
            remote = %self.remote_id,
            kind = %desc.kind,
            "Applied remote description"
        );
        self.remote = Some(desc);
        Ok(())
    }

    /// Apply one encoded remote candidate.
    ///
    /// Candidate exchange is redundant, so a bad candidate is logged and
    /// skipped instead of failing the call.
    pub async fn add_remote_candidate(&mut self, raw: &str) {
        if self.closed {
            tracing::debug!(attempt = self.attempt, "Ignoring candidate for closed session");
            return;
        }
        let candidate = match signaling::decode_candidate(raw) {
            Ok(c) => c,
            Err(e) => {
                self.rejected_candidates += 1;
                tracing::warn!(
                    attempt = self.attempt,
                    remote = %self.remote_id,
                    error = %e,
                    "Discarding undecodable candidate"
                );
                return;
            }
        };
        self.apply_candidate(candidate.as_ref()).await;
    }

    async fn apply_candidate(&mut self, candidate: Option<&IceCandidate>) {
        match self.engine.add_remote_candidate(candidate).await {
            Ok(()) => {
                if candidate.is_some() {
                    self.applied_candidates += 1;
                    tracing::debug!(attempt = self.attempt, remote = %self.remote_id, "Applied remote candidate");
                } else {
                    tracing::debug!(attempt = self.attempt, remote = %self.remote_id, "Remote end-of-candidates");
                }
            }
            Err(e) => {
                self.rejected_candidates += 1;
                tracing::warn!(
                    attempt = self.attempt,
                    remote = %self.remote_id,
                    error = %e,
                    "Engine rejected remote candidate"
                );
            }
        }
    }

    pub async fn stats(&mut self) -> CallResult<EngineStats> {
        self.ensure_open()?;
        self.engine.stats().await
    }

    /// Release engine resources. Safe to call repeatedly and from any state.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.engine.close().await;
        tracing::debug!(attempt = self.attempt, remote = %self.remote_id, "Negotiation session closed");
    }
}
