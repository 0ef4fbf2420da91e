use std::path::PathBuf;

use clap::{Parser, Subcommand};
use peercall::LoopbackOptions;

#[derive(Parser)]
#[command(name = "peercall", about = "Peer-to-peer call negotiation engine")]
struct Cli {
    /// Custom data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List audio and video devices
    Devices,
    /// Call between two local engines over an in-memory relay
    Loopback {
        /// Place a video call
        #[arg(long)]
        video: bool,

        /// Seconds to stay in the call
        #[arg(long, default_value = "3")]
        hold_secs: u64,

        /// Swap the camera for a screen capture mid-call
        #[arg(long)]
        share_screen: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall::init_tracing();
    let cli = Cli::parse();
    let config = peercall::load_config(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Devices => peercall::run_devices().await,
        Command::Loopback {
            video,
            hold_secs,
            share_screen,
        } => {
            peercall::run_loopback(
                config,
                LoopbackOptions {
                    video,
                    hold: std::time::Duration::from_secs(hold_secs),
                    share_screen,
                },
            )
            .await
        }
    }
}
