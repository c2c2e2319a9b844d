//! Call controller: runs a [`CallMachine`] on its own task.
//!
//! User commands, relay frames, engine events, media completions and the
//! negotiation deadline are all funneled into one `select!` loop, so the
//! machine sees them strictly one at a time. Callers talk to it through a
//! cloneable [`CallHandle`].

use peercall_common::{CallError, CallResult};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::engine::{EngineFactory, EngineStats, TaggedEngineEvent};
use crate::machine::{CallEvent, CallMachine, CallState};
use crate::media::{MediaReady, MediaSource};

const COMMAND_CAPACITY: usize = 32;

/// Requests from the presentation layer.
#[derive(Debug)]
pub enum CallCommand {
    PlaceCall {
        target: String,
        reply: oneshot::Sender<CallResult<()>>,
    },
    Accept {
        reply: oneshot::Sender<CallResult<()>>,
    },
    Hangup {
        reply: oneshot::Sender<CallResult<()>>,
    },
    Stats {
        reply: oneshot::Sender<CallResult<EngineStats>>,
    },
    State {
        reply: oneshot::Sender<CallResult<CallState>>,
    },
}

/// What the relay link delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayInput {
    Frame(String),
    Closed,
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub async fn place_call(&self, target: impl Into<String>) -> CallResult<()> {
        let target = target.into();
        self.request(|reply| CallCommand::PlaceCall { target, reply }).await
    }

    pub async fn accept_incoming(&self) -> CallResult<()> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    pub async fn hangup(&self) -> CallResult<()> {
        self.request(|reply| CallCommand::Hangup { reply }).await
    }

    pub async fn stats(&self) -> CallResult<EngineStats> {
        self.request(|reply| CallCommand::Stats { reply }).await
    }

    pub async fn state(&self) -> CallResult<CallState> {
        self.request(|reply| CallCommand::State { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<CallResult<T>>) -> CallCommand,
    ) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CallError::invalid_state("call controller stopped"))?;
        rx.await
            .map_err(|_| CallError::invalid_state("call controller stopped"))?
    }
}

/// Start the dispatch loop. It runs until every [`CallHandle`] is dropped.
pub fn spawn<F, M>(
    machine: CallMachine<F, M>,
    engine_events: mpsc::UnboundedReceiver<TaggedEngineEvent>,
    media: mpsc::Receiver<MediaReady>,
    relay: mpsc::Receiver<RelayInput>,
) -> (CallHandle, JoinHandle<()>)
where
    F: EngineFactory,
    M: MediaSource,
{
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
    let handle = CallHandle {
        commands: commands_tx,
        events: machine.event_sender(),
    };
    let task = tokio::spawn(run(machine, commands_rx, engine_events, media, relay));
    (handle, task)
}

async fn run<F, M>(
    mut machine: CallMachine<F, M>,
    mut commands: mpsc::Receiver<CallCommand>,
    mut engine_events: mpsc::UnboundedReceiver<TaggedEngineEvent>,
    mut media: mpsc::Receiver<MediaReady>,
    mut relay: mpsc::Receiver<RelayInput>,
) where
    F: EngineFactory,
    M: MediaSource,
{
    let mut relay_open = true;
    tracing::info!(local = %machine.local_id(), "Call controller started");

    loop {
        let deadline = machine.deadline();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => dispatch(&mut machine, cmd).await,
                None => break,
            },
            input = relay.recv(), if relay_open => match input {
                Some(RelayInput::Frame(text)) => {
                    if let Err(e) = machine.handle_frame(&text).await {
                        tracing::debug!(code = e.error_code(), error = %e, "Relay message not applied");
                    }
                }
                Some(RelayInput::Closed) | None => {
                    relay_open = false;
                    tracing::warn!("Relay connection lost");
                    machine.relay_closed().await;
                }
            },
            Some(event) = engine_events.recv() => machine.handle_engine_event(event).await,
            Some(ready) = media.recv() => machine.on_media_ready(ready).await,
            _ = wait_deadline(deadline) => machine.on_deadline().await,
        }
    }

    if !machine.state().is_idle_like() {
        let _ = machine.hangup().await;
    }
    tracing::info!(local = %machine.local_id(), "Call controller stopped");
}

async fn dispatch<F: EngineFactory, M: MediaSource>(
    machine: &mut CallMachine<F, M>,
    cmd: CallCommand,
) {
    match cmd {
        CallCommand::PlaceCall { target, reply } => {
            let _ = reply.send(machine.place_call(&target));
        }
        CallCommand::Accept { reply } => {
            let _ = reply.send(machine.accept_incoming());
        }
        CallCommand::Hangup { reply } => {
            let _ = reply.send(machine.hangup().await);
        }
        CallCommand::Stats { reply } => {
            let _ = reply.send(machine.stats().await);
        }
        CallCommand::State { reply } => {
            let _ = reply.send(Ok(machine.state()));
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
