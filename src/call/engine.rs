use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use super::machine::{CallStateMachine, Collaborators};
use super::{CallCommand, CallSnapshot, Reply};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{create_event_bus, EventReceiver};
use crate::state::CallHandle;

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Publish, then reply, so a caller that awaited the reply already sees the
/// resulting snapshot.
fn respond<T>(machine: &CallStateMachine, reply: Reply<T>, result: Result<T, CallError>) {
    machine.publish();
    let _ = reply.send(result);
}

/// Returns `false` when the engine should stop.
async fn dispatch(machine: &mut CallStateMachine, cmd: CallCommand) -> bool {
    match cmd {
        CallCommand::SetContact { contact, reply } => {
            machine.set_contact(contact);
            respond(machine, reply, Ok(()));
        }
        CallCommand::SelectDevices { audio, video, reply } => {
            let result = machine.select_devices(audio, video);
            respond(machine, reply, result);
        }
        CallCommand::Place { video, reply } => {
            let result = machine.place(video).await;
            respond(machine, reply, result);
        }
        CallCommand::Answer { reply } => {
            let result = machine.answer().await;
            respond(machine, reply, result);
        }
        CallCommand::Decline { reply } => {
            let result = machine.decline().await;
            respond(machine, reply, result);
        }
        CallCommand::HangUp { reply } => {
            let result = machine.hang_up().await;
            respond(machine, reply, result);
        }
        CallCommand::ToggleMute { reply } => {
            let result = machine.toggle_mute();
            respond(machine, reply, result);
        }
        CallCommand::StartScreenShare { reply } => {
            let result = machine.start_screen_share().await;
            respond(machine, reply, result);
        }
        CallCommand::StopScreenShare { reply } => {
            let result = machine.stop_screen_share().await;
            respond(machine, reply, result);
        }
        CallCommand::RefreshDevices { reply } => {
            let result = machine.refresh_devices().await;
            respond(machine, reply, result);
        }
        CallCommand::Shutdown => return false,
    }
    true
}

/// Run the call engine event loop.
/// Owns the state machine; user intents, relay snapshots, peer connection
/// callbacks and timers are all handled here, one at a time.
pub async fn run_call_engine(
    mut machine: CallStateMachine,
    mut cmd_rx: mpsc::Receiver<CallCommand>,
    mut event_rx: EventReceiver,
) {
    info!("Call engine started for {}", machine.self_id());
    if let Err(e) = machine.start().await {
        error!("Failed to watch for incoming calls: {}", e);
    }
    machine.publish();

    loop {
        let deadline = machine.next_deadline();
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    info!("All call handles dropped");
                    break;
                };
                if !dispatch(&mut machine, cmd).await {
                    break;
                }
            }
            Some(event) = event_rx.recv() => {
                machine.handle_event(event).await;
            }
            _ = sleep_until(deadline) => {
                machine.on_deadline().await;
            }
        }
        machine.publish();
    }

    let _ = machine.hang_up().await;
    machine.publish();
    info!("Call engine for {} stopped", machine.self_id());
}

/// Spawn an engine for `self_id` and return a handle to it.
pub fn spawn_call_engine(
    self_id: impl Into<String>,
    config: CallConfig,
    collaborators: Collaborators,
) -> (CallHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = create_event_bus();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
    let machine = CallStateMachine::new(self_id, config, collaborators, event_tx, snapshot_tx);
    let task = tokio::spawn(run_call_engine(machine, cmd_rx, event_rx));
    (CallHandle::new(cmd_tx, snapshot_rx), task)
}
