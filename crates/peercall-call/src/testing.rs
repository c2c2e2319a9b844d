//! Scripted in-memory transport engine for tests.

use std::sync::{Arc, Mutex};

use peercall_common::{CallError, CallResult};

use crate::engine::{
    EngineEvent, EngineEvents, EngineFactory, EngineStats, IceCandidate, LocalTrack, SdpType,
    SessionDescription, TransportEngine,
};
use crate::media::MediaSource;
use crate::signaling;

/// Operations recorded by every engine a factory created, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Create(u64),
    AddTracks(usize),
    OpenChannel(String),
    SendText { label: String, text: String },
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(Option<String>),
    Stats,
    Close,
}

#[derive(Default)]
struct Script {
    ops: Vec<EngineOp>,
    fail_offer: bool,
    sinks: Vec<EngineEvents>,
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn ops(&self) -> Vec<EngineOp> {
        self.script.lock().unwrap().ops.clone()
    }

    pub fn created(&self) -> usize {
        self.script.lock().unwrap().sinks.len()
    }

    /// Make every subsequent `create_offer` fail.
    pub fn fail_offers(&self) {
        self.script.lock().unwrap().fail_offer = true;
    }

    /// Emit an event from the engine created for `attempt`.
    pub fn emit(&self, attempt: u64, event: EngineEvent) {
        let script = self.script.lock().unwrap();
        let sink = script
            .sinks
            .iter()
            .find(|s| s.attempt() == attempt)
            .expect("no engine for attempt");
        sink.emit(event);
    }

    /// Text sent on data channels, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::SendText { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Applied remote candidate lines, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::AddCandidate(Some(line)) => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    async fn create(&self, events: EngineEvents) -> CallResult<ScriptedEngine> {
        let mut script = self.script.lock().unwrap();
        script.ops.push(EngineOp::Create(events.attempt()));
        script.sinks.push(events);
        Ok(ScriptedEngine {
            script: self.script.clone(),
            remote_set: false,
        })
    }
}

pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    remote_set: bool,
}

impl ScriptedEngine {
    fn record(&self, op: EngineOp) {
        self.script.lock().unwrap().ops.push(op);
    }
}

impl TransportEngine for ScriptedEngine {
    async fn add_local_tracks(&mut self, tracks: &[LocalTrack]) -> CallResult<()> {
        self.record(EngineOp::AddTracks(tracks.len()));
        Ok(())
    }

    async fn open_channel(&mut self, label: &str) -> CallResult<()> {
        self.record(EngineOp::OpenChannel(label.to_string()));
        Ok(())
    }

    async fn create_offer(&mut self) -> CallResult<SessionDescription> {
        if self.script.lock().unwrap().fail_offer {
            return Err(CallError::engine("scripted offer failure"));
        }
        self.record(EngineOp::CreateOffer);
        Ok(SessionDescription::offer("v=0 offer"))
    }

    async fn create_answer(&mut self) -> CallResult<SessionDescription> {
        self.record(EngineOp::CreateAnswer);
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&mut self, desc: &SessionDescription) -> CallResult<()> {
        self.record(EngineOp::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: &SessionDescription) -> CallResult<()> {
        if !desc.sdp.starts_with("v=0") {
            return Err(CallError::engine("unparseable sdp"));
        }
        self.remote_set = true;
        self.record(EngineOp::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: Option<&IceCandidate>) -> CallResult<()> {
        if !self.remote_set {
            return Err(CallError::engine("remote description not set"));
        }
        if let Some(c) = candidate {
            if !c.candidate.starts_with("candidate:") {
                return Err(CallError::engine("unparseable candidate"));
            }
        }
        self.record(EngineOp::AddCandidate(candidate.map(|c| c.candidate.clone())));
        Ok(())
    }

    async fn send_text(&mut self, label: &str, text: &str) -> CallResult<()> {
        self.record(EngineOp::SendText { label: label.to_string(), text: text.to_string() });
        Ok(())
    }

    async fn stats(&mut self) -> CallResult<EngineStats> {
        self.record(EngineOp::Stats);
        Ok(EngineStats::default())
    }

    async fn close(&mut self) {
        self.record(EngineOp::Close);
    }
}

/// Media source that succeeds or fails on demand.
#[derive(Clone)]
pub struct ScriptedMedia {
    pub available: bool,
}

impl MediaSource for ScriptedMedia {
    async fn acquire(&self) -> CallResult<Vec<LocalTrack>> {
        if !self.available {
            return Err(CallError::media("camera busy"));
        }
        Ok(vec![LocalTrack {
            id: "mic".into(),
            kind: crate::engine::MediaKind::Audio,
        }])
    }
}

/// Encoded candidate whose line starts with `candidate:{tag}`.
pub fn candidate_json(tag: &str) -> String {
    let candidate = IceCandidate::new(format!(
        "candidate:{tag} 1 udp 2130706431 127.0.0.1 5000 typ host"
    ));
    signaling::encode_candidate(Some(&candidate)).unwrap()
}

/// Line of the candidate produced by [`candidate_json`].
pub fn candidate_line(tag: &str) -> String {
    format!("candidate:{tag} 1 udp 2130706431 127.0.0.1 5000 typ host")
}

/// Encoded offer description.
pub fn offer_json() -> String {
    signaling::encode_description(&SessionDescription::offer("v=0 remote offer")).unwrap()
}

/// Encoded answer description.
pub fn answer_json() -> String {
    signaling::encode_description(&SessionDescription::answer("v=0 remote answer")).unwrap()
}
