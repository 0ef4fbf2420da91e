pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod signaling;
pub mod state;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub use crate::call::{spawn_call_engine, CallCommand, CallSnapshot, CallStatus, Collaborators};
pub use crate::config::{CallConfig, IceServerConfig};
pub use crate::error::{CallError, MediaError, SignalingError};
pub use crate::state::CallHandle;

use crate::media::native::NativeMediaDevices;
use crate::media::peer::WebRtcConnector;
use crate::media::synthetic::SyntheticMediaDevices;
use crate::media::{DeviceInventory, MediaDevices};
use crate::signaling::MemoryChannel;

/// Install the fmt subscriber. `RUST_LOG` overrides the default `peercall=info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Resolve the data directory and load `config.json` from it.
pub fn load_config(data_dir: Option<&Path>) -> anyhow::Result<CallConfig> {
    let data_dir = config::data_dir(data_dir);
    info!("Data directory: {:?}", data_dir);
    let config = CallConfig::load(&data_dir)
        .with_context(|| format!("loading configuration from {}", data_dir.display()))?;
    Ok(config)
}

/// Enumerate host devices and print them grouped by kind.
pub async fn run_devices() -> anyhow::Result<()> {
    let mut inventory = DeviceInventory::new(Arc::new(NativeMediaDevices::new()));
    let snapshot = inventory.refresh().await.context("enumerating devices")?;
    for (title, devices) in [
        ("Audio inputs", &snapshot.audio_in),
        ("Audio outputs", &snapshot.audio_out),
        ("Video inputs", &snapshot.video_in),
    ] {
        println!("{}:", title);
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            println!("  [{}] {}", device.id, device.label);
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub video: bool,
    pub hold: Duration,
    pub share_screen: bool,
}

/// Print every status change a handle publishes, prefixed with `name`.
fn spawn_transition_printer(name: &'static str, handle: &CallHandle) -> JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        loop {
            let seen = {
                let snapshot = rx.borrow_and_update();
                (snapshot.status, snapshot.connected, snapshot.screen_sharing)
            };
            if last != Some(seen) {
                println!(
                    "{:>5}: {} (connected: {}, sharing: {})",
                    name, seen.0, seen.1, seen.2
                );
                last = Some(seen);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

async fn wait_status(handle: &CallHandle, status: CallStatus, within: Duration) -> anyhow::Result<CallSnapshot> {
    tokio::time::timeout(within, handle.wait_for(|s| s.status == status))
        .await
        .with_context(|| format!("timed out waiting for {}", status))?
        .map_err(Into::into)
}

/// Two engines on an in-memory relay with real peer connections and
/// synthetic media: place, answer, optionally share the screen, hang up.
pub async fn run_loopback(config: CallConfig, options: LoopbackOptions) -> anyhow::Result<()> {
    if options.share_screen && !options.video {
        bail!("--share-screen needs --video: an audio-only call has no video sender");
    }
    let relay = Arc::new(MemoryChannel::new());
    let connector = Arc::new(WebRtcConnector);
    let collaborators = |devices: Arc<dyn MediaDevices>| Collaborators {
        signaling: relay.clone(),
        connector: connector.clone(),
        devices,
    };
    let media = || {
        let devices = SyntheticMediaDevices::new();
        devices.set_silence_pump(true);
        Arc::new(devices) as Arc<dyn MediaDevices>
    };

    let (alice, alice_task) = spawn_call_engine("alice", config.clone(), collaborators(media()));
    let (bob, bob_task) = spawn_call_engine("bob", config.clone(), collaborators(media()));
    let printers = [
        spawn_transition_printer("alice", &alice),
        spawn_transition_printer("bob", &bob),
    ];
    let step = Duration::from_secs(10);

    alice.set_contact(Some("bob".into())).await?;
    let session = alice.place_call(options.video).await?;
    println!("session: {}", session);

    wait_status(&bob, CallStatus::Receiving, step).await?;
    bob.answer().await?;
    wait_status(&alice, CallStatus::InCall, step).await?;

    let connected = tokio::time::timeout(config.connect_timeout(), alice.wait_for(|s| s.connected)).await;
    if connected.is_err() {
        warn!("Media did not start flowing within {:?}", config.connect_timeout());
    }

    if options.share_screen {
        alice.start_screen_share().await?;
        tokio::time::sleep(options.hold / 2).await;
        alice.stop_screen_share().await?;
    }
    tokio::time::sleep(options.hold).await;

    alice.hang_up().await?;
    wait_status(&bob, CallStatus::Idle, step).await?;
    println!("relay after hang-up: {:?}", relay.get(&format!("{}/{}", config.sessions_root, session)));

    alice.shutdown().await;
    bob.shutdown().await;
    let _ = alice_task.await;
    let _ = bob_task.await;
    for printer in printers {
        printer.abort();
    }
    Ok(())
}
