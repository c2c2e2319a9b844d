//! str0m-backed transport engine.
//!
//! str0m is Sans-IO: it handles ICE, DTLS, SRTP and SDP but never touches a
//! socket. Each [`RtcEngine`] is therefore a handle to a driver task that owns
//! the `Rtc` instance and one UDP socket, and is driven by commands:
//!
//! ```text
//!   NegotiationSession ──RtcCommand──▶ driver task ──Transmit──▶ UdpSocket
//!                      ◀──oneshot────      │      ◀──Receive───
//!                                          └──EngineEvent──▶ controller
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use peercall_common::{CallError, CallResult};
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelData, ChannelId};
use str0m::media::{Direction, MediaKind as RtcMediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc, RtcError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{
    ConnectionState, EngineEvent, EngineEvents, EngineFactory, EngineStats, IceCandidate,
    LocalTrack, MediaKind, RemoteTrack, SdpType, SessionDescription, TransportEngine,
};

const COMMAND_CAPACITY: usize = 32;
/// MTU-sized receive buffer.
const RECV_BUFFER: usize = 2000;

/// Engine-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum RtcEngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] RtcError),

    #[error("SDP parse error: {0}")]
    Sdp(String),

    #[error("Candidate error: {0}")]
    Candidate(String),

    #[error("Negotiation order violated: {0}")]
    Order(String),

    #[error("Data channel error: {0}")]
    Channel(String),

    #[error("Engine task stopped")]
    Stopped,
}

impl From<RtcEngineError> for CallError {
    fn from(e: RtcEngineError) -> Self {
        CallError::engine(e)
    }
}

type Reply<T> = oneshot::Sender<Result<T, RtcEngineError>>;

enum RtcCommand {
    AddTracks { tracks: Vec<LocalTrack>, reply: Reply<()> },
    OpenChannel { label: String, reply: Reply<()> },
    SendText { label: String, text: String, reply: Reply<()> },
    CreateOffer { reply: Reply<String> },
    CreateAnswer { reply: Reply<String> },
    SetLocal { kind: SdpType, reply: Reply<()> },
    SetRemote { desc: SessionDescription, reply: Reply<()> },
    AddCandidate { line: Option<String>, reply: Reply<()> },
    Stats { reply: Reply<EngineStats> },
    Close,
}

/// Creates one str0m engine with its own UDP socket per call attempt.
#[derive(Debug, Clone)]
pub struct RtcEngineFactory {
    bind: SocketAddr,
}

impl RtcEngineFactory {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

impl EngineFactory for RtcEngineFactory {
    type Engine = RtcEngine;

    async fn create(&self, events: EngineEvents) -> CallResult<RtcEngine> {
        let socket = UdpSocket::bind(self.bind).await.map_err(RtcEngineError::from)?;
        let local_addr = socket.local_addr().map_err(RtcEngineError::from)?;
        tracing::debug!(call = events.attempt(), addr = %local_addr, "Bound UDP socket for call");

        let rtc = Rtc::builder().build(Instant::now());
        let mut driver = RtcDriver {
            rtc,
            socket,
            local_addr,
            events,
            tracks: Vec::new(),
            channel_labels: Vec::new(),
            channels: HashMap::new(),
            pending_offer: None,
            remote_offer: None,
            local_kind: None,
            stats: EngineStats::default(),
        };
        driver.announce_host_candidate()?;

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(driver.run(rx));
        Ok(RtcEngine { commands: tx })
    }
}

/// Handle to a running str0m driver task.
pub struct RtcEngine {
    commands: mpsc::Sender<RtcCommand>,
}

impl RtcEngine {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> RtcCommand) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| RtcEngineError::Stopped)?;
        let result = rx.await.map_err(|_| RtcEngineError::Stopped)?;
        Ok(result?)
    }
}

impl TransportEngine for RtcEngine {
    async fn add_local_tracks(&mut self, tracks: &[LocalTrack]) -> CallResult<()> {
        let tracks = tracks.to_vec();
        self.call(|reply| RtcCommand::AddTracks { tracks, reply }).await
    }

    async fn open_channel(&mut self, label: &str) -> CallResult<()> {
        let label = label.to_string();
        self.call(|reply| RtcCommand::OpenChannel { label, reply }).await
    }

    async fn create_offer(&mut self) -> CallResult<SessionDescription> {
        let sdp = self.call(|reply| RtcCommand::CreateOffer { reply }).await?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&mut self) -> CallResult<SessionDescription> {
        let sdp = self.call(|reply| RtcCommand::CreateAnswer { reply }).await?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&mut self, desc: &SessionDescription) -> CallResult<()> {
        let kind = desc.kind;
        self.call(|reply| RtcCommand::SetLocal { kind, reply }).await
    }

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> CallResult<()> {
        let desc = desc.clone();
        self.call(|reply| RtcCommand::SetRemote { desc, reply }).await
    }

    async fn add_remote_candidate(&mut self, candidate: Option<&IceCandidate>) -> CallResult<()> {
        let line = candidate.map(|c| c.candidate.clone());
        self.call(|reply| RtcCommand::AddCandidate { line, reply }).await
    }

    async fn send_text(&mut self, label: &str, text: &str) -> CallResult<()> {
        let label = label.to_string();
        let text = text.to_string();
        self.call(|reply| RtcCommand::SendText { label, text, reply }).await
    }

    async fn stats(&mut self) -> CallResult<EngineStats> {
        self.call(|reply| RtcCommand::Stats { reply }).await
    }

    async fn close(&mut self) {
        let _ = self.commands.send(RtcCommand::Close).await;
    }
}

/// Owns the `Rtc` and its socket for the lifetime of one call attempt.
struct RtcDriver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: EngineEvents,
    tracks: Vec<LocalTrack>,
    /// Channels to declare in our offer.
    channel_labels: Vec<String>,
    /// Open channels by id.
    channels: HashMap<ChannelId, String>,
    /// Our offer, waiting for the remote answer.
    pending_offer: Option<SdpPendingOffer>,
    /// Remote offer, consumed when the answer is created.
    remote_offer: Option<SdpOffer>,
    local_kind: Option<SdpType>,
    stats: EngineStats,
}

impl RtcDriver {
    /// The bound socket is the only local candidate; gathering ends right after it.
    fn announce_host_candidate(&mut self) -> Result<(), RtcEngineError> {
        if self.local_addr.ip().is_unspecified() {
            tracing::warn!(addr = %self.local_addr, "Unspecified bind address, no host candidate");
        } else {
            let candidate = Candidate::host(self.local_addr, Protocol::Udp)
                .map_err(|e| RtcEngineError::Candidate(e.to_string()))?;
            let line = candidate.to_sdp_string();
            self.rtc.add_local_candidate(candidate);
            self.stats.local_candidates += 1;
            let line = line.strip_prefix("a=").unwrap_or(&line).to_string();
            self.events.emit(EngineEvent::LocalCandidate(Some(IceCandidate::new(line))));
        }
        self.events.emit(EngineEvent::LocalCandidate(None));
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::Receiver<RtcCommand>) {
        let attempt = self.events.attempt();
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            // str0m must see the current time before every poll_output.
            if let Err(e) = self.tick() {
                tracing::warn!(call = attempt, error = %e, "WebRTC timeout handling failed");
                self.set_connection(ConnectionState::Failed);
                break;
            }
            let timeout = match self.poll().await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(call = attempt, error = %e, "WebRTC engine failed");
                    self.set_connection(ConnectionState::Failed);
                    break;
                }
            };
            if !self.rtc.is_alive() {
                self.set_connection(ConnectionState::Closed);
                break;
            }
            let wait = timeout.saturating_duration_since(Instant::now());

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(RtcCommand::Close) | None => break,
                    Some(cmd) => self.handle(cmd),
                },
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, source)) => self.receive(source, &buf[..len]),
                    Err(e) => tracing::debug!(call = attempt, error = %e, "UDP recv error"),
                },
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.rtc.disconnect();
        tracing::debug!(call = attempt, "WebRTC engine stopped");
    }

    fn tick(&mut self) -> Result<(), RtcEngineError> {
        self.rtc.handle_input(Input::Timeout(Instant::now()))?;
        Ok(())
    }

    /// Drain str0m output until it asks to be woken at a later instant.
    async fn poll(&mut self) -> Result<Instant, RtcEngineError> {
        loop {
            match self.rtc.poll_output()? {
                Output::Timeout(at) => return Ok(at),
                Output::Transmit(t) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += t.contents.len() as u64;
                    if let Err(e) = self.socket.send_to(&t.contents, t.destination).await {
                        tracing::debug!(to = %t.destination, error = %e, "UDP send error");
                    }
                }
                Output::Event(event) => self.on_rtc_event(event),
            }
        }
    }

    fn receive(&mut self, source: SocketAddr, data: &[u8]) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;
        let contents = match data.try_into() {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(from = %source, error = ?e, "Dropping unrecognized datagram");
                return;
            }
        };
        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        );
        if let Err(e) = self.rtc.handle_input(input) {
            tracing::debug!(from = %source, error = %e, "WebRTC input rejected");
        }
    }

    fn on_rtc_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => match state {
                IceConnectionState::Checking => self.set_connection(ConnectionState::Connecting),
                IceConnectionState::Disconnected => {
                    self.set_connection(ConnectionState::Disconnected)
                }
                _ => tracing::debug!(call = self.events.attempt(), ice = ?state, "ICE state"),
            },
            Event::Connected => self.set_connection(ConnectionState::Connected),
            Event::ChannelOpen(id, label) => {
                tracing::debug!(call = self.events.attempt(), label = %label, "Data channel open");
                self.channels.insert(id, label.clone());
                self.events.emit(EngineEvent::ChannelOpen { label });
            }
            Event::ChannelData(data) => self.on_channel_data(data),
            Event::ChannelClose(id) => {
                if let Some(label) = self.channels.remove(&id) {
                    tracing::debug!(call = self.events.attempt(), label = %label, "Data channel closed");
                }
            }
            Event::MediaAdded(added) => {
                let kind = match added.kind {
                    RtcMediaKind::Audio => MediaKind::Audio,
                    RtcMediaKind::Video => MediaKind::Video,
                };
                self.events.emit(EngineEvent::RemoteTrack(RemoteTrack {
                    id: added.mid.to_string(),
                    kind,
                }));
            }
            _ => {}
        }
    }

    fn on_channel_data(&mut self, data: ChannelData) {
        let Some(label) = self.channels.get(&data.id).cloned() else {
            tracing::debug!(call = self.events.attempt(), "Data on unknown channel");
            return;
        };
        if data.binary {
            tracing::debug!(label = %label, bytes = data.data.len(), "Ignoring binary channel data");
            return;
        }
        let text = String::from_utf8_lossy(&data.data).into_owned();
        self.events.emit(EngineEvent::ChannelMessage { label, text });
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.stats.connection_state == Some(state) {
            return;
        }
        self.stats.connection_state = Some(state);
        self.events.emit(EngineEvent::ConnectionStateChanged(state));
    }

    fn handle(&mut self, cmd: RtcCommand) {
        match cmd {
            RtcCommand::AddTracks { tracks, reply } => {
                self.tracks.extend(tracks);
                let _ = reply.send(Ok(()));
            }
            RtcCommand::OpenChannel { label, reply } => {
                if self.pending_offer.is_some() || self.local_kind.is_some() {
                    let _ = reply.send(Err(RtcEngineError::Order(
                        "channels must be declared before the offer".into(),
                    )));
                } else {
                    self.channel_labels.push(label);
                    let _ = reply.send(Ok(()));
                }
            }
            RtcCommand::SendText { label, text, reply } => {
                let _ = reply.send(self.send_text(&label, &text));
            }
            RtcCommand::CreateOffer { reply } => {
                let _ = reply.send(self.create_offer());
            }
            RtcCommand::CreateAnswer { reply } => {
                let _ = reply.send(self.create_answer());
            }
            RtcCommand::SetLocal { kind, reply } => {
                let _ = reply.send(self.set_local(kind));
            }
            RtcCommand::SetRemote { desc, reply } => {
                let _ = reply.send(self.set_remote(desc));
            }
            RtcCommand::AddCandidate { line, reply } => {
                let _ = reply.send(self.add_candidate(line));
            }
            RtcCommand::Stats { reply } => {
                let _ = reply.send(Ok(self.stats.clone()));
            }
            RtcCommand::Close => {}
        }
    }

    fn create_offer(&mut self) -> Result<String, RtcEngineError> {
        if self.tracks.is_empty() && self.channel_labels.is_empty() {
            return Err(RtcEngineError::Order("no local tracks to offer".into()));
        }
        let mut api = self.rtc.sdp_api();
        for label in &self.channel_labels {
            api.add_channel(label.clone());
        }
        for track in &self.tracks {
            let kind = match track.kind {
                MediaKind::Audio => RtcMediaKind::Audio,
                MediaKind::Video => RtcMediaKind::Video,
            };
            api.add_media(kind, Direction::SendRecv, None, None, None);
        }
        let (offer, pending) = api
            .apply()
            .ok_or_else(|| RtcEngineError::Order("nothing to offer".into()))?;
        self.pending_offer = Some(pending);
        Ok(offer.to_sdp_string())
    }

    fn create_answer(&mut self) -> Result<String, RtcEngineError> {
        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| RtcEngineError::Order("no remote offer".into()))?;
        let answer = self.rtc.sdp_api().accept_offer(offer)?;
        Ok(answer.to_sdp_string())
    }

    /// str0m applies its own descriptions as it creates them; this only checks pairing.
    fn set_local(&mut self, kind: SdpType) -> Result<(), RtcEngineError> {
        let produced = match kind {
            SdpType::Offer => self.pending_offer.is_some(),
            SdpType::Answer => self.remote_offer.is_none() && self.local_kind.is_none(),
        };
        if !produced {
            return Err(RtcEngineError::Order(format!("no local {kind} was created")));
        }
        self.local_kind = Some(kind);
        Ok(())
    }

    fn set_remote(&mut self, desc: SessionDescription) -> Result<(), RtcEngineError> {
        match desc.kind {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| RtcEngineError::Sdp(e.to_string()))?;
                self.remote_offer = Some(offer);
            }
            SdpType::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| RtcEngineError::Order("answer without a pending offer".into()))?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| RtcEngineError::Sdp(e.to_string()))?;
                self.rtc.sdp_api().accept_answer(pending, answer)?;
            }
        }
        Ok(())
    }

    fn send_text(&mut self, label: &str, text: &str) -> Result<(), RtcEngineError> {
        let id = self
            .channels
            .iter()
            .find_map(|(id, open)| (open == label).then_some(*id))
            .ok_or_else(|| RtcEngineError::Channel(format!("channel {label:?} is not open")))?;
        let mut channel = self
            .rtc
            .channel(id)
            .ok_or_else(|| RtcEngineError::Channel(format!("channel {label:?} went away")))?;
        if !channel.write(false, text.as_bytes())? {
            return Err(RtcEngineError::Channel(format!("channel {label:?} send buffer full")));
        }
        Ok(())
    }

    fn add_candidate(&mut self, line: Option<String>) -> Result<(), RtcEngineError> {
        let Some(line) = line else {
            tracing::debug!(call = self.events.attempt(), "Remote candidate gathering complete");
            return Ok(());
        };
        let candidate = Candidate::from_sdp_string(&line)
            .map_err(|e| RtcEngineError::Candidate(e.to_string()))?;
        self.rtc.add_remote_candidate(candidate);
        self.stats.remote_candidates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn engine(
        attempt: u64,
    ) -> (RtcEngine, mpsc::UnboundedReceiver<crate::engine::TaggedEngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = RtcEngineFactory::new(loopback())
            .create(EngineEvents::new(attempt, tx))
            .await
            .unwrap();
        (engine, rx)
    }

    fn audio() -> Vec<LocalTrack> {
        vec![LocalTrack { id: "audio0".into(), kind: MediaKind::Audio }]
    }

    #[tokio::test]
    async fn announces_host_candidate_then_completion() {
        let (mut engine, mut events) = engine(3).await;
        let first = events.recv().await.unwrap();
        assert_eq!(first.attempt, 3);
        let EngineEvent::LocalCandidate(Some(candidate)) = first.event else {
            panic!("expected a local candidate, got {first:?}");
        };
        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(events.recv().await.unwrap().event, EngineEvent::LocalCandidate(None));
        engine.close().await;
    }

    #[tokio::test]
    async fn offer_answer_between_two_engines() {
        let (mut caller, _caller_events) = engine(1).await;
        let (mut callee, _callee_events) = engine(2).await;

        caller.add_local_tracks(&audio()).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(&offer).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));

        callee.add_local_tracks(&audio()).await.unwrap();
        callee.set_remote_description(&offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        callee.set_local_description(&answer).await.unwrap();

        caller.set_remote_description(&answer).await.unwrap();
        assert!(caller.create_answer().await.is_err());

        // Both drivers must still be running after the DTLS setup the exchange triggers.
        assert!(caller.stats().await.is_ok());
        assert!(callee.stats().await.is_ok());

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn garbage_is_rejected_without_killing_the_engine() {
        let (mut engine, _events) = engine(1).await;
        let bad = SessionDescription::offer("not sdp");
        assert_eq!(
            engine.set_remote_description(&bad).await.unwrap_err().error_code(),
            "ENGINE_ERROR"
        );
        let bogus = IceCandidate::new("candidate:garbage");
        assert!(engine.add_remote_candidate(Some(&bogus)).await.is_err());
        assert!(engine.add_remote_candidate(None).await.is_ok());
        assert!(engine.stats().await.is_ok());
    }

    #[tokio::test]
    async fn driver_survives_idle_timeouts() {
        let (mut engine, _events) = engine(1).await;
        engine.add_local_tracks(&audio()).await.unwrap();
        let offer = engine.create_offer().await.unwrap();
        engine.set_local_description(&offer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(engine.stats().await.is_ok());
        engine.close().await;
    }

    #[tokio::test]
    async fn offered_channel_appears_in_the_offer() {
        let (mut caller, _caller_events) = engine(1).await;
        caller.open_channel("test").await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(&offer).await.unwrap();
        assert!(offer.sdp.contains("m=application"));
        assert!(caller.open_channel("late").await.is_err());

        let err = caller.send_text("test", "too early").await.unwrap_err();
        assert_eq!(err.error_code(), "ENGINE_ERROR");
        assert!(err.to_string().contains("not open"));
        caller.close().await;
    }

    #[tokio::test]
    async fn closed_engine_reports_stopped() {
        let (mut engine, _events) = engine(1).await;
        engine.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.stats().await.is_err());
    }
}
