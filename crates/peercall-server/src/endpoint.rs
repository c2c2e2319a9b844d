//! Headless call endpoint.
//!
//! Wires a str0m engine, declared media and the relay link into a call
//! controller, then reacts to call events: incoming calls are answered after
//! the configured delay, status changes are logged, Ctrl-C hangs up.

use std::net::SocketAddr;

use anyhow::Context;
use peercall_call::controller;
use peercall_call::relay;
use peercall_call::rtc::RtcEngineFactory;
use peercall_call::{CallEvent, CallHandle, CallMachine, CallState, DeclaredMedia};
use peercall_common::config::CallConfig;
use tokio::sync::broadcast;

pub struct Options {
    pub id: String,
    pub target: Option<String>,
    pub auto_accept: bool,
}

pub async fn run(config: &CallConfig, options: Options) -> anyhow::Result<()> {
    let bind: SocketAddr = config
        .rtc_bind
        .parse()
        .with_context(|| format!("invalid call.rtc_bind {:?}", config.rtc_bind))?;
    let factory = RtcEngineFactory::new(bind);
    let media = DeclaredMedia::new(config.audio, config.video);

    let (machine, io) = CallMachine::new(options.id.clone(), config, factory, media)?;
    let mut link = relay::connect(&config.relay_url, &options.id, io.outbound).await?;
    let inbound = link
        .take_inbound()
        .context("relay link has no inbound stream")?;
    let (handle, task) = controller::spawn(machine, io.engine_events, io.media, inbound);
    let mut events = handle.subscribe();

    if let Some(target) = &options.target {
        handle.place_call(target.as_str()).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, hanging up");
                if let Err(e) = handle.hangup().await {
                    tracing::debug!(error = %e, "Nothing to hang up");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if on_event(&handle, config, &options, event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Call events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(handle);
    let _ = task.await;
    link.shutdown();
    Ok(())
}

/// Returns true when the endpoint should exit.
fn on_event(handle: &CallHandle, config: &CallConfig, options: &Options, event: CallEvent) -> bool {
    match event {
        CallEvent::StatusChanged { state, remote, reason } => {
            let remote = remote.unwrap_or_default();
            match &reason {
                Some(reason) => tracing::info!(state = %state, remote = %remote, reason = %reason, "Call status"),
                None => tracing::info!(state = %state, remote = %remote, "Call status"),
            }
            match state {
                CallState::Incoming if options.auto_accept => {
                    schedule_accept(handle.clone(), config);
                    false
                }
                CallState::Incoming => {
                    tracing::info!(remote = %remote, "Incoming call not answered (auto-accept disabled)");
                    false
                }
                // A caller exits once its call is over; a callee keeps waiting.
                CallState::Ended | CallState::Failed | CallState::Idle => options.target.is_some(),
                _ => false,
            }
        }
        CallEvent::RemoteTrack { remote, track } => {
            tracing::info!(remote = %remote, kind = ?track.kind, id = %track.id, "Receiving remote media");
            false
        }
        CallEvent::ChannelMessage { remote, label, text } => {
            tracing::info!(remote = %remote, label = %label, "Message from peer: {text}");
            false
        }
    }
}

fn schedule_accept(handle: CallHandle, config: &CallConfig) {
    let delay = config.auto_accept_delay();
    tracing::info!(delay_ms = delay.as_millis() as u64, "Answering automatically");
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = handle.accept_incoming().await {
            tracing::warn!(code = e.error_code(), error = %e, "Auto-accept failed");
        }
    });
}
